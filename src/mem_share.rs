// Copyright 2026 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Guest memory sharing and MMIO guard hypercalls.

use log::debug;
use log::warn;
use smccc::kvm::KvmFunc;
use smccc::kvm::KVM_FUNC_HAS_RANGE;
use smccc::ret;
use smccc::SMCCC_RET_INVALID_PARAMETER;
use smccc::SMCCC_RET_SUCCESS;

use crate::hyp_req::HypRequest;
use crate::hyp_req::MemDest;
use crate::hypercall::HostExit;
use crate::hypercall::HvcCall;
use crate::hypercall::HvcOutcome;
use crate::hypervisor::Hypervisor;
use crate::mem::page_aligned;
use crate::mem::MemError;
use crate::mem::PAGE_SHIFT;
use crate::mem::PAGE_SIZE;
use crate::vcpu::CoreContext;
use crate::vcpu::LoadedVcpu;
use crate::Result;

fn invalid_parameter() -> HvcOutcome {
    HvcOutcome::ret(SMCCC_RET_INVALID_PARAMETER)
}

impl Hypervisor {
    /// Whether `nr_pages` pages from `ipa` fit below the stage-2 input range.
    fn guest_range_valid(&self, ipa: u64, nr_pages: u64) -> bool {
        let limit = self.config.ipa_limit();
        nr_pages
            .checked_mul(PAGE_SIZE)
            .and_then(|size| ipa.checked_add(size))
            .map_or(false, |end| ipa < limit && end <= limit)
    }

    /// Asks the host for enough pages to map one guest page, and replays the call afterwards.
    fn handle_empty_memcache(&self, loaded: &LoadedVcpu) -> Result<HvcOutcome> {
        loaded.vcpu.host().requests().push(HypRequest::Mem {
            dest: MemDest::VcpuMemcache,
            nr_pages: self.config.mmu_cache_min_pages(),
        })?;
        Ok(HvcOutcome::Host(HostExit::HypRequest))
    }

    pub(crate) fn meminfo(&self, call: &HvcCall) -> HvcOutcome {
        if call.arg1 != 0 || call.arg2 != 0 || call.arg3 != 0 {
            return invalid_parameter();
        }
        HvcOutcome::Guest([PAGE_SIZE, KVM_FUNC_HAS_RANGE, 0, 0])
    }

    pub(crate) fn mem_share(&self, loaded: &LoadedVcpu, call: &HvcCall) -> HvcOutcome {
        let ipa = call.arg1;
        // Legacy guests leave the page count as zero.
        let nr_pages = call.arg2.max(1);
        if call.arg3 != 0 || !page_aligned(ipa) || !self.guest_range_valid(ipa, nr_pages) {
            return invalid_parameter();
        }

        let vm = &loaded.vm;
        let res = {
            let mut mc = loaded.vcpu.memcache.lock();
            self.mem.guest_share_host(vm.vmid(), &mut mc, ipa, nr_pages)
        };
        match res {
            Ok(nr_shared) => {
                vm.host().add_shared_mem(nr_shared * PAGE_SIZE);
                HvcOutcome::Guest([ret(SMCCC_RET_SUCCESS), nr_shared, 0, 0])
            }
            Err(MemError::Fault) => {
                let map = HypRequest::Map {
                    guest_ipa: ipa,
                    size: nr_pages << PAGE_SHIFT,
                };
                {
                    // The map request and the memcache top-up go out together or not at all.
                    let mut requests = loaded.vcpu.host().requests();
                    if requests.free() < 2 || requests.push(map).is_err() {
                        return invalid_parameter();
                    }
                }
                // The host is about to run anyway, top up the memcache while at it.
                self.handle_empty_memcache(loaded)
                    .unwrap_or_else(|_| invalid_parameter())
            }
            Err(MemError::NoMemory) => self
                .handle_empty_memcache(loaded)
                .unwrap_or_else(|_| invalid_parameter()),
            Err(e) => {
                debug!("VM {}: share of {:#x} failed: {}", vm.handle(), ipa, e);
                invalid_parameter()
            }
        }
    }

    pub(crate) fn mem_unshare(&self, loaded: &LoadedVcpu, call: &HvcCall) -> HvcOutcome {
        let ipa = call.arg1;
        let nr_pages = call.arg2.max(1);
        if call.arg3 != 0 || !page_aligned(ipa) || !self.guest_range_valid(ipa, nr_pages) {
            return invalid_parameter();
        }

        let vm = &loaded.vm;
        match self.mem.guest_unshare_host(vm.vmid(), ipa, nr_pages) {
            Ok(nr_unshared) => {
                vm.host().sub_shared_mem(nr_unshared * PAGE_SIZE);
                HvcOutcome::Guest([ret(SMCCC_RET_SUCCESS), nr_unshared, 0, 0])
            }
            Err(e) => {
                debug!("VM {}: unshare of {:#x} failed: {}", vm.handle(), ipa, e);
                invalid_parameter()
            }
        }
    }

    pub(crate) fn mem_relinquish(&self, loaded: &LoadedVcpu, call: &HvcCall) -> HvcOutcome {
        let ipa = call.arg1;
        if call.arg2 != 0 || call.arg3 != 0 || !self.guest_range_valid(ipa, 1) {
            return invalid_parameter();
        }

        let res = {
            let mut mc = loaded.vcpu.memcache.lock();
            self.mem
                .guest_relinquish_to_host(loaded.vm.vmid(), &mut mc, ipa)
        };
        match res {
            // The host still has bookkeeping to do for the page.
            Ok(Some(_)) => HvcOutcome::Host(HostExit::Hypercall),
            // Nothing was mapped there.
            Ok(None) => HvcOutcome::Guest([0; 4]),
            Err(MemError::NoMemory) => self
                .handle_empty_memcache(loaded)
                .unwrap_or_else(|_| invalid_parameter()),
            Err(_) => invalid_parameter(),
        }
    }

    pub(crate) fn install_ioguard(
        &self,
        loaded: &LoadedVcpu,
        func: KvmFunc,
        call: &HvcCall,
    ) -> HvcOutcome {
        let ipa = call.arg1;
        let nr_pages = match func {
            // The legacy call takes a single page and x2/x3 may hold garbage.
            KvmFunc::MmioGuardMap => 1,
            _ if call.arg3 != 0 => return invalid_parameter(),
            _ => call.arg2,
        };

        let vm = &loaded.vm;
        let res = if !vm.mmio_guard_enabled() || !page_aligned(ipa) {
            Err(MemError::Permission)
        } else if !self.guest_range_valid(ipa, nr_pages) {
            Err(MemError::InvalidRange)
        } else {
            let mut mc = loaded.vcpu.memcache.lock();
            self.mem.install_ioguard(vm.vmid(), &mut mc, ipa, nr_pages)
        };

        match res {
            Ok(nr_guarded) => HvcOutcome::Guest([ret(SMCCC_RET_SUCCESS), nr_guarded, 0, 0]),
            Err(MemError::NoMemory) => self
                .handle_empty_memcache(loaded)
                .unwrap_or_else(|_| invalid_parameter()),
            Err(e) => {
                debug!("VM {}: ioguard at {:#x} refused: {}", vm.handle(), ipa, e);
                invalid_parameter()
            }
        }
    }

    /// MMIO guard annotations are never removed. The unmap calls only exist for older guests.
    pub(crate) fn remove_ioguard(
        &self,
        loaded: &LoadedVcpu,
        func: KvmFunc,
        call: &HvcCall,
    ) -> HvcOutcome {
        let nr_pages = match func {
            KvmFunc::MmioGuardUnmap => 1,
            _ if call.arg3 != 0 => {
                return HvcOutcome::Guest([ret(SMCCC_RET_INVALID_PARAMETER), call.arg2, 0, 0])
            }
            _ => call.arg2,
        };
        let x0 = if loaded.vm.mmio_guard_enabled() {
            SMCCC_RET_SUCCESS
        } else {
            SMCCC_RET_INVALID_PARAMETER
        };
        HvcOutcome::Guest([ret(x0), nr_pages, 0, 0])
    }

    /// Checks a guest data abort at `ipa` of `len` bytes against the VM's MMIO declarations.
    ///
    /// VMs that never enrolled in MMIO guard may access any address.
    pub fn check_mmio_access(&self, core: &CoreContext, ipa: u64, len: u64) -> Result<bool> {
        let loaded = core.loaded()?;
        let vm = &loaded.vm;
        if !vm.mmio_guard_enabled() {
            return Ok(true);
        }

        let last = ipa.saturating_add(len.max(1) - 1);
        let allowed = self.mem.is_ioguarded(vm.vmid(), ipa) && self.mem.is_ioguarded(vm.vmid(), last);
        if !allowed {
            warn!(
                "VM {}: MMIO access to undeclared {:#x}+{}",
                vm.handle(),
                ipa,
                len
            );
        }
        Ok(allowed)
    }
}

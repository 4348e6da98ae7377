// Copyright 2026 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! VM records and their two-phase lifecycle.

use std::mem::size_of;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::AtomicU32;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::AtomicU8;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::sync::MutexGuard;

use bitflags::bitflags;
use enumn::N;
use log::debug;
use log::error;
use log::warn;
use serde::Deserialize;
use serde::Serialize;
use sync::Mutex;

use crate::config::HypConfig;
use crate::hypervisor::Hypervisor;
use crate::mem::page_aligned;
use crate::mem::HostRegion;
use crate::mem::MemoryOwnership;
use crate::mem::PhysAddr;
use crate::mem::Vmid;
use crate::memcache::Memcache;
use crate::registry::VmHandle;
use crate::traps::CpuFeatures;
use crate::vcpu::VirtualCpu;
use crate::Error;
use crate::Result;

/// Marks a `last_ran` slot no vCPU has used yet.
const NO_VCPU: u32 = u32::MAX;

#[derive(Clone, Copy, Debug, PartialEq, Eq, N, Serialize, Deserialize)]
#[repr(u8)]
pub enum VmState {
    /// Registered and usable.
    Live = 0,
    /// Teardown started. No new references can be taken.
    Dying = 1,
    /// Removed from the table and freed.
    Gone = 2,
}

bitflags! {
    /// vCPU features requested by the host, numbered like the KVM_ARM_VCPU_* init features.
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
    pub struct VcpuFeatures: u32 {
        const POWER_OFF = 1 << 0;
        const EL1_32BIT = 1 << 1;
        const PSCI_0_2 = 1 << 2;
        const PMU_V3 = 1 << 3;
        const SVE = 1 << 4;
        const PTRAUTH_ADDRESS = 1 << 5;
        const PTRAUTH_GENERIC = 1 << 6;
    }
}

/// The host's descriptor of a VM, pinned for as long as the hypervisor tracks the VM.
#[derive(Debug)]
pub struct HostVm {
    /// Host memory backing this descriptor.
    pub region: HostRegion,
    pub nr_vcpus: usize,
    pub protected: bool,
    /// Guest address the pVM firmware is loaded at, if the VM boots through it.
    pub pvmfw_load_addr: Option<u64>,
    pub vcpu_features: VcpuFeatures,
    pub cpu_features: CpuFeatures,
    protected_shared_mem: AtomicU64,
    teardown_mc: Mutex<Memcache>,
}

impl HostVm {
    pub fn new(region: HostRegion, nr_vcpus: usize) -> Self {
        HostVm {
            region,
            nr_vcpus,
            protected: false,
            pvmfw_load_addr: None,
            vcpu_features: VcpuFeatures::PSCI_0_2,
            cpu_features: CpuFeatures::FP | CpuFeatures::ADVSIMD,
            protected_shared_mem: AtomicU64::new(0),
            teardown_mc: Mutex::new(Memcache::new()),
        }
    }

    /// Bytes of guest memory the guest currently shares with the host.
    pub fn protected_shared_mem(&self) -> u64 {
        self.protected_shared_mem.load(Ordering::Relaxed)
    }

    pub(crate) fn add_shared_mem(&self, bytes: u64) {
        self.protected_shared_mem.fetch_add(bytes, Ordering::Relaxed);
    }

    pub(crate) fn sub_shared_mem(&self, bytes: u64) {
        // The closure always returns Some.
        let _ = self
            .protected_shared_mem
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |v| {
                Some(v.saturating_sub(bytes))
            });
    }

    /// Pages handed back by the hypervisor during and after teardown, for the host to free.
    pub fn teardown_memcache(&self) -> MutexGuard<Memcache> {
        self.teardown_mc.lock()
    }
}

/// The hypervisor's record of one VM.
pub struct VirtualMachine {
    handle: VmHandle,
    vmid: Vmid,
    pub(crate) refcount: AtomicU32,
    state: AtomicU8,
    host: Arc<HostVm>,
    pgd: HostRegion,
    nr_vcpus: usize,
    protected: bool,
    vcpu_features: VcpuFeatures,
    cpu_features: CpuFeatures,
    mmio_guard: AtomicBool,
    pvmfw_load_addr: Option<u64>,
    pub(crate) vcpus: Mutex<Vec<Arc<VirtualCpu>>>,
    pub(crate) pvmfw_entry_vcpu: Mutex<Option<usize>>,
    last_ran: Box<[AtomicU32]>,
}

impl VirtualMachine {
    pub(crate) fn new(
        handle: VmHandle,
        vmid: Vmid,
        host: Arc<HostVm>,
        pgd: HostRegion,
        config: &HypConfig,
    ) -> Self {
        let protected = host.protected;
        let (vcpu_features, cpu_features) = mirror_features(&host, config);
        VirtualMachine {
            handle,
            vmid,
            refcount: AtomicU32::new(0),
            state: AtomicU8::new(VmState::Live as u8),
            nr_vcpus: host.nr_vcpus,
            protected,
            vcpu_features,
            cpu_features,
            mmio_guard: AtomicBool::new(false),
            pvmfw_load_addr: if protected {
                host.pvmfw_load_addr
            } else {
                None
            },
            vcpus: Mutex::new(Vec::with_capacity(host.nr_vcpus)),
            pvmfw_entry_vcpu: Mutex::new(None),
            last_ran: (0..config.nr_cpus).map(|_| AtomicU32::new(NO_VCPU)).collect(),
            host,
            pgd,
        }
    }

    pub fn handle(&self) -> VmHandle {
        self.handle
    }

    pub fn vmid(&self) -> Vmid {
        self.vmid
    }

    pub fn refcount(&self) -> u32 {
        self.refcount.load(Ordering::Acquire)
    }

    pub fn state(&self) -> VmState {
        match VmState::n(self.state.load(Ordering::Acquire)) {
            Some(state) => state,
            None => {
                error!("VM {} has a corrupt lifecycle state", self.handle);
                VmState::Gone
            }
        }
    }

    pub(crate) fn set_state(&self, state: VmState) {
        self.state.store(state as u8, Ordering::Release);
    }

    /// Whether teardown has started. A gone VM is also dying.
    pub fn is_dying(&self) -> bool {
        self.state() != VmState::Live
    }

    pub fn is_protected(&self) -> bool {
        self.protected
    }

    pub fn host(&self) -> &Arc<HostVm> {
        &self.host
    }

    /// Root of the VM's stage-2 page tables.
    pub fn pgd(&self) -> HostRegion {
        self.pgd
    }

    /// vCPU count declared by the host at creation.
    pub fn nr_vcpus(&self) -> usize {
        self.nr_vcpus
    }

    /// vCPUs attached so far.
    pub fn nr_attached(&self) -> usize {
        self.vcpus.lock().len()
    }

    pub fn vcpu(&self, idx: usize) -> Option<Arc<VirtualCpu>> {
        self.vcpus.lock().get(idx).cloned()
    }

    /// Features guests of this VM may see.
    pub fn vcpu_features(&self) -> VcpuFeatures {
        self.vcpu_features
    }

    pub fn cpu_features(&self) -> CpuFeatures {
        self.cpu_features
    }

    pub fn mmio_guard_enabled(&self) -> bool {
        self.mmio_guard.load(Ordering::Acquire)
    }

    pub(crate) fn enable_mmio_guard(&self) {
        self.mmio_guard.store(true, Ordering::Release);
    }

    pub fn pvmfw_load_addr(&self) -> Option<u64> {
        self.pvmfw_load_addr
    }

    pub fn has_pvmfw(&self) -> bool {
        self.pvmfw_load_addr.is_some()
    }

    /// Records `vcpu_id` as the last vCPU to run on `cpu`. Returns true if a different vCPU ran
    /// there before.
    pub(crate) fn swap_last_ran(&self, cpu: usize, vcpu_id: u32) -> bool {
        match self.last_ran.get(cpu) {
            Some(slot) => slot.swap(vcpu_id, Ordering::Relaxed) != vcpu_id,
            None => false,
        }
    }
}

/// Picks the vCPU and CPU features a VM's guests may see. Protected VMs only get PSCI plus the
/// configured allow-list.
fn mirror_features(host: &HostVm, config: &HypConfig) -> (VcpuFeatures, CpuFeatures) {
    if !host.protected {
        return (host.vcpu_features, host.cpu_features);
    }

    let mut allowed = VcpuFeatures::PSCI_0_2;
    let mut cpu_allowed = CpuFeatures::FP | CpuFeatures::ADVSIMD;
    if config.pvm_allow_pmu {
        allowed |= VcpuFeatures::PMU_V3;
        cpu_allowed |= CpuFeatures::PMUV3;
    }
    if config.pvm_allow_ptrauth {
        allowed |= VcpuFeatures::PTRAUTH_ADDRESS | VcpuFeatures::PTRAUTH_GENERIC;
    }
    if config.pvm_allow_sve {
        allowed |= VcpuFeatures::SVE;
        cpu_allowed |= CpuFeatures::SVE;
    }
    (
        host.vcpu_features & allowed,
        host.cpu_features & cpu_allowed,
    )
}

fn vm_record_size(nr_vcpus: usize) -> u64 {
    (size_of::<VirtualMachine>() + nr_vcpus * size_of::<Arc<VirtualCpu>>()) as u64
}

fn last_ran_size(nr_cpus: usize) -> u64 {
    (nr_cpus * size_of::<u32>()) as u64
}

/// Resources taken by `init_vm`, released in reverse order unless the VM is registered.
struct InitVmResources<'a> {
    mem: &'a dyn MemoryOwnership,
    host_region: HostRegion,
    accounted: Vec<u64>,
    pgd: Option<HostRegion>,
    committed: bool,
}

impl<'a> InitVmResources<'a> {
    fn pin(mem: &'a dyn MemoryOwnership, host_region: HostRegion) -> Result<Self> {
        mem.pin_shared(host_region).map_err(|e| {
            warn!("failed to pin host VM descriptor {}: {}", host_region, e);
            Error::Busy
        })?;
        Ok(InitVmResources {
            mem,
            host_region,
            accounted: Vec::new(),
            pgd: None,
            committed: false,
        })
    }

    fn alloc_account(&mut self, size: u64) -> Result<()> {
        self.mem.alloc_account(size)?;
        self.accounted.push(size);
        Ok(())
    }

    fn donate_pgd(&mut self, pgd: HostRegion) -> Result<()> {
        if !pgd.is_page_aligned() {
            return Err(Error::InvalidArgument);
        }
        self.mem.donate_to_hyp(pgd).map_err(|e| {
            warn!("failed to donate stage-2 root {}: {}", pgd, e);
            Error::InvalidArgument
        })?;
        self.pgd = Some(pgd);
        Ok(())
    }

    fn commit(mut self) {
        self.committed = true;
    }
}

impl Drop for InitVmResources<'_> {
    fn drop(&mut self) {
        if self.committed {
            return;
        }
        if let Some(pgd) = self.pgd.take() {
            self.mem.clear_hyp_memory(pgd);
            self.mem.donate_to_host(pgd);
        }
        for size in self.accounted.drain(..).rev() {
            self.mem.free_account(size);
        }
        self.mem.unpin_shared(self.host_region);
    }
}

impl Hypervisor {
    /// Creates the hypervisor's record of the VM described by `host` and registers it.
    ///
    /// `pgd_addr` is the host page-aligned region donated for the stage-2 root; its size follows
    /// from the configured IPA width. On failure, nothing taken from the host is kept.
    pub fn init_vm(&self, host: &Arc<HostVm>, pgd_addr: u64) -> Result<VmHandle> {
        let mut res = InitVmResources::pin(self.mem.as_ref(), host.region)?;

        let nr_vcpus = host.nr_vcpus;
        if nr_vcpus < 1 {
            return Err(Error::InvalidArgument);
        }

        res.alloc_account(vm_record_size(nr_vcpus))?;
        res.alloc_account(last_ran_size(self.config.nr_cpus))?;

        if !page_aligned(pgd_addr) {
            return Err(Error::InvalidArgument);
        }
        let pgd = HostRegion::new(pgd_addr, self.config.stage2_pgd_size());
        res.donate_pgd(pgd)?;

        let mut table = self.registry.write();
        let vm = table.register(|handle, vmid| {
            Arc::new(VirtualMachine::new(
                handle,
                vmid,
                host.clone(),
                pgd,
                &self.config,
            ))
        })?;

        if let Err(e) = self.mem.prepare_stage2(vm.vmid(), pgd, vm.is_protected()) {
            warn!("failed to prepare stage-2 for VM {}: {}", vm.handle(), e);
            table.remove(vm.handle());
            return Err(e.into());
        }
        drop(table);

        res.commit();
        debug!(
            "created {} VM {} (vmid {}, {} vCPUs)",
            if vm.is_protected() {
                "protected"
            } else {
                "non-protected"
            },
            vm.handle(),
            vm.vmid(),
            nr_vcpus
        );
        Ok(vm.handle())
    }

    /// First teardown phase: marks an unreferenced VM dying so no new reference can be taken.
    pub fn start_teardown_vm(&self, handle: VmHandle) -> Result<()> {
        let table = self.registry.write();
        let vm = table.lookup(handle).ok_or(Error::NotFound)?;
        if vm.refcount() > 0 {
            warn!("teardown of VM {} while it is referenced", handle);
            return Err(Error::Busy);
        }
        if vm.is_dying() {
            return Err(Error::InvalidArgument);
        }
        vm.set_state(VmState::Dying);
        debug!("VM {} is dying", handle);
        Ok(())
    }

    /// Second teardown phase: unregisters a dying VM and returns all of its memory to the host.
    pub fn finalize_teardown_vm(&self, handle: VmHandle) -> Result<()> {
        let vm = {
            let mut table = self.registry.write();
            let vm = table.lookup(handle).ok_or(Error::NotFound)?;
            if !vm.is_dying() {
                return Err(Error::Busy);
            }
            // The VMID may be handed to a new VM as soon as the slot is free.
            self.mem.flush_vmid(vm.vmid());
            let vm = table.remove(handle).ok_or(Error::Internal)?;
            vm.set_state(VmState::Gone);
            vm
        };

        // Unreachable from the table and unreferenced, so nothing else can touch it now.
        let host = vm.host().clone();
        let mut mc = host.teardown_memcache();
        self.mem.destroy_stage2(vm.vmid());
        self.mem.drain_pool(vm.vmid(), &mut mc);

        let vcpus = std::mem::take(&mut *vm.vcpus.lock());
        for vcpu in &vcpus {
            self.unpin_host_vcpu(vcpu);
        }
        for vcpu in &vcpus {
            self.teardown_vcpu(vcpu, &mut mc);
        }

        self.mem.free_account(last_ran_size(self.config.nr_cpus));
        self.mem.free_account(vm_record_size(vm.nr_vcpus()));
        self.mem.unpin_shared(host.region);
        debug!("VM {} torn down, {} pages returned", handle, mc.len());
        Ok(())
    }

    /// Returns one page of a dying VM to the host.
    pub fn reclaim_dying_guest_page(&self, handle: VmHandle, phys: PhysAddr, ipa: u64) -> Result<()> {
        let table = self.registry.read();
        let vm = table.lookup(handle).ok_or(Error::NotFound)?;
        if !vm.is_dying() {
            return Err(Error::InvalidArgument);
        }
        self.mem.reclaim_page(vm.vmid(), phys, ipa)?;
        self.mem
            .drain_pool(vm.vmid(), &mut vm.host().teardown_memcache());
        Ok(())
    }
}

// Copyright 2026 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Dispatch of HVC64 traps from guests.
//!
//! Calls are decoded into a family first. Protected guests get the full in-hypervisor surface and
//! anything unrecognized falls through to PSCI, which answers NOT_SUPPORTED for calls it does not
//! know. Non-protected guests only get the memory calls the host cannot answer for them.

use serde::Deserialize;
use serde::Serialize;
use smccc::kvm::KvmFunc;
use smccc::kvm::ARM_SMCCC_VENDOR_HYP_CALL_UID_FUNC_ID;
use smccc::kvm::ARM_SMCCC_VENDOR_HYP_KVM_FEATURES_FUNC_ID;
use smccc::kvm::ARM_SMCCC_VENDOR_HYP_UID_KVM;
use smccc::ret;
use smccc::trng::TrngFunc;
use smccc::FunctionId;
use smccc::ARM_SMCCC_VERSION_FUNC_ID;
use smccc::SMCCC_RET_NOT_SUPPORTED;
use smccc::SMCCC_RET_SUCCESS;
use smccc::SMCCC_VERSION_1_1;

use crate::hypervisor::Hypervisor;
use crate::vcpu::CoreContext;
use crate::vcpu::LoadedVcpu;
use crate::vcpu::VcpuContext;
use crate::Result;

/// Why control returns to the host instead of the guest.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum HostExit {
    /// The host must finish the hypercall. Its result is picked up on the next entry.
    Hypercall,
    /// The host must service the request ring, after which the guest retries the call.
    HypRequest,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HvcExit {
    /// The call was handled and x0..x3 hold its result.
    Guest,
    Host(HostExit),
}

/// A trapped hypercall: the function id from x0 and the arguments in x1..x3.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct HvcCall {
    pub fid: FunctionId,
    pub arg1: u64,
    pub arg2: u64,
    pub arg3: u64,
}

impl HvcCall {
    pub fn from_context(ctxt: &VcpuContext) -> Self {
        HvcCall {
            fid: FunctionId::from_reg(ctxt.regs[0]),
            arg1: ctxt.regs[1],
            arg2: ctxt.regs[2],
            arg3: ctxt.regs[3],
        }
    }

    /// The call as seen by a 32-bit caller, with the upper halves of the arguments ignored.
    pub fn narrowed(&self) -> Self {
        HvcCall {
            fid: self.fid,
            arg1: self.arg1 as u32 as u64,
            arg2: self.arg2 as u32 as u64,
            arg3: self.arg3 as u32 as u64,
        }
    }
}

/// What a handler decided to do with a call.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum HvcOutcome {
    /// Resume the guest with x0..x3 set to these values.
    Guest([u64; 4]),
    Host(HostExit),
}

impl HvcOutcome {
    /// Resumes the guest with `x0` and zeroes in x1..x3.
    pub fn ret(x0: i64) -> Self {
        HvcOutcome::Guest([ret(x0), 0, 0, 0])
    }
}

enum HvcFamily {
    SmcccVersion,
    VendorUid,
    KvmFeatures,
    Kvm(KvmFunc),
    Trng(TrngFunc),
    /// Everything else, PSCI calls included.
    Other,
}

fn decode(fid: FunctionId) -> HvcFamily {
    match fid.0 {
        ARM_SMCCC_VERSION_FUNC_ID => HvcFamily::SmcccVersion,
        ARM_SMCCC_VENDOR_HYP_CALL_UID_FUNC_ID => HvcFamily::VendorUid,
        ARM_SMCCC_VENDOR_HYP_KVM_FEATURES_FUNC_ID => HvcFamily::KvmFeatures,
        _ => {
            if let Some(func) = smccc::kvm::decode(fid) {
                HvcFamily::Kvm(func)
            } else if let Some(func) = smccc::trng::decode(fid) {
                HvcFamily::Trng(func)
            } else {
                HvcFamily::Other
            }
        }
    }
}

impl Hypervisor {
    /// Handles an HVC64 trap from the guest running on `core`.
    ///
    /// Returns `HvcExit::Guest` when the guest can be resumed with its result in x0..x3, or the
    /// reason the host must run first.
    pub fn handle_hvc64(&self, core: &CoreContext) -> Result<HvcExit> {
        let loaded = core.loaded()?;
        let call = HvcCall::from_context(&loaded.vcpu.context());

        let outcome = if loaded.vcpu.is_protected() {
            self.handle_pvm_hvc64(loaded, &call)
        } else {
            self.handle_vm_hvc64(loaded, &call)
        };

        let mut ctxt = loaded.vcpu.context();
        match outcome {
            HvcOutcome::Guest(regs) => {
                ctxt.regs[..4].copy_from_slice(&regs);
                Ok(HvcExit::Guest)
            }
            HvcOutcome::Host(exit) => {
                if exit == HostExit::HypRequest {
                    // Replay the HVC once the host has serviced the requests.
                    ctxt.pc = ctxt.pc.wrapping_sub(4);
                }
                ctxt.last_exit = Some(exit);
                Ok(HvcExit::Host(exit))
            }
        }
    }

    fn handle_pvm_hvc64(&self, loaded: &LoadedVcpu, call: &HvcCall) -> HvcOutcome {
        match decode(call.fid) {
            HvcFamily::SmcccVersion => HvcOutcome::Guest([SMCCC_VERSION_1_1, 0, 0, 0]),
            HvcFamily::VendorUid => HvcOutcome::Guest(ARM_SMCCC_VENDOR_HYP_UID_KVM),
            HvcFamily::KvmFeatures => {
                HvcOutcome::Guest([smccc::kvm::pvm_features_bitmap(), 0, 0, 0])
            }
            HvcFamily::Kvm(func) => match func {
                KvmFunc::MmioGuardEnroll => {
                    loaded.vm.enable_mmio_guard();
                    HvcOutcome::ret(SMCCC_RET_SUCCESS)
                }
                KvmFunc::MmioGuardMap | KvmFunc::MmioRguardMap => {
                    self.install_ioguard(loaded, func, call)
                }
                KvmFunc::MmioGuardUnmap | KvmFunc::MmioRguardUnmap => {
                    self.remove_ioguard(loaded, func, call)
                }
                KvmFunc::MmioGuardInfo | KvmFunc::HypMeminfo => self.meminfo(call),
                KvmFunc::MemShare => self.mem_share(loaded, call),
                KvmFunc::MemUnshare => self.mem_unshare(loaded, call),
                KvmFunc::MemRelinquish => self.mem_relinquish(loaded, call),
                KvmFunc::Features | KvmFunc::Ptp => self.handle_psci(loaded, call),
            },
            HvcFamily::Trng(func) => self
                .forward_trng(func, call)
                .unwrap_or_else(|| HvcOutcome::ret(SMCCC_RET_NOT_SUPPORTED)),
            HvcFamily::Other => self.handle_psci(loaded, call),
        }
    }

    fn handle_vm_hvc64(&self, loaded: &LoadedVcpu, call: &HvcCall) -> HvcOutcome {
        match decode(call.fid) {
            HvcFamily::Kvm(KvmFunc::HypMeminfo) => self.meminfo(call),
            HvcFamily::Kvm(KvmFunc::MemRelinquish) => self.mem_relinquish(loaded, call),
            _ => HvcOutcome::Host(HostExit::Hypercall),
        }
    }

    /// Writes the host's answer to a hypercall it finished for a protected guest into x0.
    pub(crate) fn complete_host_hypercall(&self, loaded: &LoadedVcpu) {
        let call = HvcCall::from_context(&loaded.vcpu.context());
        let x0 = match decode(call.fid) {
            HvcFamily::Kvm(KvmFunc::MemShare)
            | HvcFamily::Kvm(KvmFunc::MemUnshare)
            | HvcFamily::Kvm(KvmFunc::MemRelinquish) => ret(SMCCC_RET_SUCCESS),
            _ => self.complete_psci(loaded, &call),
        };
        loaded.vcpu.context().regs[0] = x0;
    }
}

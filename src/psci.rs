// Copyright 2026 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! PSCI power-state calls from protected guests.
//!
//! The hypervisor owns the power state of protected vCPUs but never schedules them: powering a
//! vCPU on or off updates the state here and then hands the call to the host, which runs or
//! deschedules the vCPU.

use std::sync::Arc;

use log::debug;
use log::error;
use smccc::psci::affinity_mask;
use smccc::psci::decode;
use smccc::psci::valid_affinity;
use smccc::psci::PsciFunction;
use smccc::psci::MPIDR_HWID_BITMASK;
use smccc::psci::PSCI_1_1;
use smccc::psci::PSCI_FEATURES_SUPPORTED;
use smccc::psci::PSCI_RET_ALREADY_ON;
use smccc::psci::PSCI_RET_INTERNAL_FAILURE;
use smccc::psci::PSCI_RET_INVALID_PARAMS;
use smccc::psci::PSCI_RET_NOT_SUPPORTED;
use smccc::psci::PSCI_RET_ON_PENDING;
use smccc::psci::PSCI_RET_SUCCESS;
use smccc::ret;

use crate::hypercall::HostExit;
use crate::hypercall::HvcCall;
use crate::hypercall::HvcOutcome;
use crate::hypervisor::Hypervisor;
use crate::vcpu::LoadedVcpu;
use crate::vcpu::PowerState;
use crate::vcpu::VirtualCpu;
use crate::vcpu::SCTLR_EE;
use crate::vm::VirtualMachine;

fn find_vcpu_by_mpidr(vcpus: &[Arc<VirtualCpu>], mpidr: u64) -> Option<&Arc<VirtualCpu>> {
    let mpidr = mpidr & MPIDR_HWID_BITMASK;
    vcpus.iter().find(|vcpu| vcpu.mpidr() == mpidr)
}

fn cpu_on(loaded: &LoadedVcpu, call: &HvcCall) -> HvcOutcome {
    let target_mpidr = call.arg1;
    if !valid_affinity(target_mpidr) {
        return HvcOutcome::ret(PSCI_RET_INVALID_PARAMS);
    }
    let be = loaded.vcpu.context().sctlr & SCTLR_EE != 0;

    let vcpus = loaded.vm.vcpus.lock();
    let target = match find_vcpu_by_mpidr(&vcpus, target_mpidr) {
        Some(target) => target,
        None => return HvcOutcome::ret(PSCI_RET_INVALID_PARAMS),
    };

    // Held across the transition so the target cannot reset before its request is in place.
    let mut reset = target.reset.lock();
    match target.transition_power_state(PowerState::Off, PowerState::OnPending) {
        Ok(()) => {}
        Err(Some(PowerState::OnPending)) => return HvcOutcome::ret(PSCI_RET_ON_PENDING),
        Err(Some(PowerState::On)) => return HvcOutcome::ret(PSCI_RET_ALREADY_ON),
        Err(state) => {
            error!(
                "VM {}: vCPU {} in unexpected power state {:?}",
                loaded.vm.handle(),
                target.idx(),
                state
            );
            return HvcOutcome::ret(PSCI_RET_INTERNAL_FAILURE);
        }
    }

    reset.pc = call.arg2;
    reset.r0 = call.arg3;
    reset.be = be;
    reset.reset = true;
    debug!(
        "VM {}: vCPU {} powering on vCPU {}",
        loaded.vm.handle(),
        loaded.vcpu.idx(),
        target.idx()
    );
    HvcOutcome::Host(HostExit::Hypercall)
}

fn affinity_info(vm: &VirtualMachine, call: &HvcCall) -> HvcOutcome {
    let target_affinity = call.arg1;
    if !valid_affinity(target_affinity) {
        return HvcOutcome::ret(PSCI_RET_INVALID_PARAMS);
    }
    let mask = affinity_mask(call.arg2);
    if mask == 0 {
        return HvcOutcome::ret(PSCI_RET_INVALID_PARAMS);
    }
    let target_affinity = target_affinity & mask;

    let vcpus = vm.vcpus.lock();
    let mut matching = vcpus
        .iter()
        .filter(|vcpu| vcpu.mpidr() & mask == target_affinity)
        .peekable();
    if matching.peek().is_none() {
        return HvcOutcome::ret(PSCI_RET_INVALID_PARAMS);
    }

    HvcOutcome::ret(aggregate_affinity(matching.map(|vcpu| vcpu.power_state())))
}

/// Folds the power states of the vCPUs matching an AFFINITY_INFO query into its answer.
fn aggregate_affinity(states: impl Iterator<Item = Option<PowerState>>) -> i64 {
    let mut state = PowerState::Off;
    for vcpu_state in states {
        match vcpu_state {
            Some(PowerState::On) => return PowerState::On as i64,
            Some(PowerState::OnPending) => state = PowerState::OnPending,
            Some(PowerState::Off) => {}
            None => {
                error!("vCPU with invalid power state matched AFFINITY_INFO");
                return PSCI_RET_INTERNAL_FAILURE;
            }
        }
    }
    state as i64
}

fn cpu_off(loaded: &LoadedVcpu) -> HvcOutcome {
    if loaded.vcpu.power_state() != Some(PowerState::On) {
        error!(
            "VM {}: vCPU {} powering off while not on",
            loaded.vm.handle(),
            loaded.vcpu.idx()
        );
    }
    loaded.vcpu.set_power_state(PowerState::Off);
    HvcOutcome::Host(HostExit::Hypercall)
}

fn features(call: &HvcCall) -> HvcOutcome {
    let feature = call.arg1 as u32;
    if PSCI_FEATURES_SUPPORTED.contains(&feature) {
        HvcOutcome::ret(PSCI_RET_SUCCESS)
    } else {
        HvcOutcome::ret(PSCI_RET_NOT_SUPPORTED)
    }
}

impl Hypervisor {
    /// Handles a PSCI call from a protected guest.
    pub(crate) fn handle_psci(&self, loaded: &LoadedVcpu, call: &HvcCall) -> HvcOutcome {
        let psci = match decode(call.fid) {
            Some(psci) => psci,
            None => return HvcOutcome::ret(PSCI_RET_NOT_SUPPORTED),
        };
        let call = if psci.narrow() {
            call.narrowed()
        } else {
            *call
        };

        match psci.function {
            PsciFunction::CpuOn => cpu_on(loaded, &call),
            PsciFunction::CpuOff => cpu_off(loaded),
            PsciFunction::AffinityInfo => affinity_info(&loaded.vm, &call),
            PsciFunction::Version => HvcOutcome::Guest([PSCI_1_1.to_u32() as u64, 0, 0, 0]),
            PsciFunction::Features => features(&call),
            PsciFunction::SystemReset
            | PsciFunction::CpuSuspend
            | PsciFunction::SystemOff
            | PsciFunction::SystemReset2 => HvcOutcome::Host(HostExit::Hypercall),
        }
    }

    /// Computes x0 for a protected guest whose PSCI call was finished by the host.
    ///
    /// A failed CPU_ON leaves the target pending forever unless it is turned back off here.
    pub(crate) fn complete_psci(&self, loaded: &LoadedVcpu, call: &HvcCall) -> u64 {
        let host_ret = loaded.vcpu.host().regs().regs[0];
        let psci = match decode(call.fid) {
            Some(psci) if psci.function == PsciFunction::CpuOn => psci,
            _ => return host_ret,
        };
        if host_ret == ret(PSCI_RET_SUCCESS) {
            return host_ret;
        }

        let call = if psci.narrow() {
            call.narrowed()
        } else {
            *call
        };
        let vcpus = loaded.vm.vcpus.lock();
        if let Some(target) = find_vcpu_by_mpidr(&vcpus, call.arg1) {
            // Only a pending target is reverted; it may have been powered on since.
            let _ = target.transition_power_state(PowerState::OnPending, PowerState::Off);
        }
        ret(PSCI_RET_INTERNAL_FAILURE)
    }
}

#[cfg(test)]
mod tests {
    use smccc::psci::PSCI_0_2_FN64_CPU_ON;
    use smccc::psci::PSCI_1_0_FN_PSCI_FEATURES;
    use smccc::FunctionId;
    use smccc::ARM_SMCCC_ARCH_FEATURES_FUNC_ID;
    use smccc::ARM_SMCCC_VERSION_FUNC_ID;

    use super::*;

    fn features_call(feature: u32) -> HvcCall {
        HvcCall {
            fid: FunctionId(PSCI_1_0_FN_PSCI_FEATURES),
            arg1: feature as u64,
            arg2: 0,
            arg3: 0,
        }
    }

    #[test]
    fn affinity_aggregation() {
        const ON: Option<PowerState> = Some(PowerState::On);
        const OFF: Option<PowerState> = Some(PowerState::Off);
        const PENDING: Option<PowerState> = Some(PowerState::OnPending);

        assert_eq!(
            aggregate_affinity([OFF, OFF].into_iter()),
            PowerState::Off as i64
        );
        assert_eq!(
            aggregate_affinity([OFF, PENDING].into_iter()),
            PowerState::OnPending as i64
        );
        assert_eq!(
            aggregate_affinity([PENDING, ON, None].into_iter()),
            PowerState::On as i64
        );
        assert_eq!(
            aggregate_affinity([PENDING, None, ON].into_iter()),
            PSCI_RET_INTERNAL_FAILURE
        );
    }

    #[test]
    fn features_allow_list() {
        assert_eq!(
            features(&features_call(PSCI_0_2_FN64_CPU_ON)),
            HvcOutcome::ret(PSCI_RET_SUCCESS)
        );
        assert_eq!(
            features(&features_call(ARM_SMCCC_VERSION_FUNC_ID)),
            HvcOutcome::ret(PSCI_RET_SUCCESS)
        );
        assert_eq!(
            features(&features_call(ARM_SMCCC_ARCH_FEATURES_FUNC_ID)),
            HvcOutcome::ret(PSCI_RET_NOT_SUPPORTED)
        );
    }
}

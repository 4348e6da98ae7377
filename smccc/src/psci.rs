// Copyright 2026 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Power State Coordination Interface (PSCI) function ids, return codes and affinity helpers.

use std::convert::TryFrom;

use serde::Deserialize;
use serde::Serialize;

use crate::call_val;
use crate::CallConv;
use crate::CallType;
use crate::Error;
use crate::FunctionId;
use crate::Owner;
use crate::Result;
use crate::ARM_SMCCC_VERSION_FUNC_ID;

/// Represents a version of Power State Coordination Interface (PSCI).
#[derive(Clone, Copy, Debug, Eq, Ord, PartialEq, PartialOrd, Serialize, Deserialize)]
pub struct PsciVersion {
    pub major: u16,
    pub minor: u16,
}

impl PsciVersion {
    pub fn new(major: u16, minor: u16) -> Result<Self> {
        if (major as i16) < 0 {
            Err(Error::InvalidPsciVersion { major, minor })
        } else {
            Ok(Self { major, minor })
        }
    }

    /// Encoding returned in x0 by `PSCI_VERSION`.
    pub fn to_u32(self) -> u32 {
        ((self.major as u32) << 16) | self.minor as u32
    }
}

impl TryFrom<u32> for PsciVersion {
    type Error = Error;

    fn try_from(item: u32) -> Result<Self> {
        Self::new((item >> 16) as u16, item as u16)
    }
}

pub const PSCI_0_2: PsciVersion = PsciVersion { major: 0, minor: 2 };
pub const PSCI_1_0: PsciVersion = PsciVersion { major: 1, minor: 0 };
pub const PSCI_1_1: PsciVersion = PsciVersion { major: 1, minor: 1 };

pub const PSCI_RET_SUCCESS: i64 = 0;
pub const PSCI_RET_NOT_SUPPORTED: i64 = -1;
pub const PSCI_RET_INVALID_PARAMS: i64 = -2;
pub const PSCI_RET_DENIED: i64 = -3;
pub const PSCI_RET_ALREADY_ON: i64 = -4;
pub const PSCI_RET_ON_PENDING: i64 = -5;
pub const PSCI_RET_INTERNAL_FAILURE: i64 = -6;

const fn psci_fn(conv: CallConv, func: u32) -> u32 {
    call_val(CallType::Fast, conv, Owner::Standard, func)
}

pub const PSCI_0_2_FN_PSCI_VERSION: u32 = psci_fn(CallConv::Smc32, 0);
pub const PSCI_0_2_FN_CPU_SUSPEND: u32 = psci_fn(CallConv::Smc32, 1);
pub const PSCI_0_2_FN64_CPU_SUSPEND: u32 = psci_fn(CallConv::Smc64, 1);
pub const PSCI_0_2_FN_CPU_OFF: u32 = psci_fn(CallConv::Smc32, 2);
pub const PSCI_0_2_FN_CPU_ON: u32 = psci_fn(CallConv::Smc32, 3);
pub const PSCI_0_2_FN64_CPU_ON: u32 = psci_fn(CallConv::Smc64, 3);
pub const PSCI_0_2_FN_AFFINITY_INFO: u32 = psci_fn(CallConv::Smc32, 4);
pub const PSCI_0_2_FN64_AFFINITY_INFO: u32 = psci_fn(CallConv::Smc64, 4);
pub const PSCI_0_2_FN_SYSTEM_OFF: u32 = psci_fn(CallConv::Smc32, 8);
pub const PSCI_0_2_FN_SYSTEM_RESET: u32 = psci_fn(CallConv::Smc32, 9);
pub const PSCI_1_0_FN_PSCI_FEATURES: u32 = psci_fn(CallConv::Smc32, 10);
pub const PSCI_1_1_FN_SYSTEM_RESET2: u32 = psci_fn(CallConv::Smc32, 18);
pub const PSCI_1_1_FN64_SYSTEM_RESET2: u32 = psci_fn(CallConv::Smc64, 18);

/// PSCI functions known to the hypervisor.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PsciFunction {
    AffinityInfo,
    CpuOff,
    CpuOn,
    CpuSuspend,
    Features,
    SystemOff,
    SystemReset,
    SystemReset2,
    Version,
}

/// A decoded PSCI call: which function, and whether the caller used the 32-bit convention.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PsciCall {
    pub function: PsciFunction,
    pub conv: CallConv,
}

impl PsciCall {
    /// True when the arguments must be truncated to 32 bits before use.
    pub fn narrow(&self) -> bool {
        self.conv == CallConv::Smc32
    }
}

const PSCI_CALLS: &[(u32, PsciFunction)] = &[
    (PSCI_0_2_FN_PSCI_VERSION, PsciFunction::Version),
    (PSCI_0_2_FN_CPU_SUSPEND, PsciFunction::CpuSuspend),
    (PSCI_0_2_FN64_CPU_SUSPEND, PsciFunction::CpuSuspend),
    (PSCI_0_2_FN_CPU_OFF, PsciFunction::CpuOff),
    (PSCI_0_2_FN_CPU_ON, PsciFunction::CpuOn),
    (PSCI_0_2_FN64_CPU_ON, PsciFunction::CpuOn),
    (PSCI_0_2_FN_AFFINITY_INFO, PsciFunction::AffinityInfo),
    (PSCI_0_2_FN64_AFFINITY_INFO, PsciFunction::AffinityInfo),
    (PSCI_0_2_FN_SYSTEM_OFF, PsciFunction::SystemOff),
    (PSCI_0_2_FN_SYSTEM_RESET, PsciFunction::SystemReset),
    (PSCI_1_0_FN_PSCI_FEATURES, PsciFunction::Features),
    (PSCI_1_1_FN_SYSTEM_RESET2, PsciFunction::SystemReset2),
    (PSCI_1_1_FN64_SYSTEM_RESET2, PsciFunction::SystemReset2),
];

/// Looks `id` up in the PSCI call table.
pub fn decode(id: FunctionId) -> Option<PsciCall> {
    PSCI_CALLS
        .iter()
        .find(|(fid, _)| *fid == id.0)
        .map(|&(_, function)| PsciCall {
            function,
            conv: if id.is_smc64() {
                CallConv::Smc64
            } else {
                CallConv::Smc32
            },
        })
}

/// Function ids for which `PSCI_FEATURES` reports support.
pub const PSCI_FEATURES_SUPPORTED: &[u32] = &[
    PSCI_0_2_FN_PSCI_VERSION,
    PSCI_0_2_FN_CPU_SUSPEND,
    PSCI_0_2_FN64_CPU_SUSPEND,
    PSCI_0_2_FN_CPU_OFF,
    PSCI_0_2_FN_CPU_ON,
    PSCI_0_2_FN64_CPU_ON,
    PSCI_0_2_FN_AFFINITY_INFO,
    PSCI_0_2_FN64_AFFINITY_INFO,
    PSCI_0_2_FN_SYSTEM_OFF,
    PSCI_0_2_FN_SYSTEM_RESET,
    PSCI_1_0_FN_PSCI_FEATURES,
    PSCI_1_1_FN_SYSTEM_RESET2,
    PSCI_1_1_FN64_SYSTEM_RESET2,
    ARM_SMCCC_VERSION_FUNC_ID,
];

/// Affinity state as reported by `AFFINITY_INFO`. Doubles as a vCPU power state.
#[derive(Clone, Copy, Debug, PartialEq, Eq, enumn::N, Serialize, Deserialize)]
#[repr(u8)]
pub enum AffinityState {
    On = 0,
    Off = 1,
    OnPending = 2,
}

/// The affinity fields of MPIDR_EL1 (Aff3, Aff2, Aff1, Aff0).
pub const MPIDR_HWID_BITMASK: u64 = 0xff_00ff_ffff;

const MPIDR_LEVEL_BITS: u32 = 8;

/// Returns the mask selecting affinity levels at and above `level`, or 0 for an invalid level.
pub fn affinity_mask(level: u64) -> u64 {
    if level > 3 {
        return 0;
    }
    MPIDR_HWID_BITMASK & !((1u64 << (level as u32 * MPIDR_LEVEL_BITS)) - 1)
}

/// An affinity value is valid when it only carries MPIDR affinity bits.
pub fn valid_affinity(affinity: u64) -> bool {
    affinity & !MPIDR_HWID_BITMASK == 0
}

/// Derives the MPIDR affinity of a vCPU from its id.
///
/// Sixteen vCPUs share an Aff1 cluster, matching the GICv3 redistributor's limit on targets per
/// cluster.
pub fn vcpu_id_to_mpidr(vcpu_id: u32) -> u64 {
    let id = vcpu_id as u64;
    let aff0 = id & 0xf;
    let aff1 = (id >> 4) & 0xff;
    let aff2 = (id >> 12) & 0xff;
    aff0 | (aff1 << MPIDR_LEVEL_BITS) | (aff2 << (2 * MPIDR_LEVEL_BITS))
}

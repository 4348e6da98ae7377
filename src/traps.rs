// Copyright 2026 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! EL2 trap configuration computed for each vCPU when it is attached.
//!
//! Every vCPU starts from the KVM guest defaults. Protected vCPUs additionally trap the ID and
//! implementation-defined registers, and every register class whose backing feature is not
//! exposed to the guest. Which feature gates which trap is data in the tables below.

use bitflags::bitflags;
use serde::Deserialize;
use serde::Serialize;

use crate::vm::VcpuFeatures;
use crate::Error;
use crate::Result;

bitflags! {
    /// HCR_EL2 bits managed by the hypervisor.
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
    pub struct Hcr: u64 {
        const VM = 1 << 0;
        const SWIO = 1 << 1;
        const PTW = 1 << 2;
        const FMO = 1 << 3;
        const IMO = 1 << 4;
        const AMO = 1 << 5;
        const FB = 1 << 9;
        const BSU_IS = 1 << 10;
        const TWI = 1 << 13;
        const TWE = 1 << 14;
        const TID1 = 1 << 16;
        const TID2 = 1 << 17;
        const TID3 = 1 << 18;
        const TSC = 1 << 19;
        const TIDCP = 1 << 20;
        const TACR = 1 << 21;
        const TSW = 1 << 22;
        const RW = 1 << 31;
        const E2H = 1 << 34;
        const TLOR = 1 << 35;
        const TERR = 1 << 36;
        const TEA = 1 << 37;
        const APK = 1 << 40;
        const API = 1 << 41;
        const FWB = 1 << 46;
        const FIEN = 1 << 47;
        const TID4 = 1 << 49;
        const AMVOFFEN = 1 << 51;
        const ATA = 1 << 56;
        const DCT = 1 << 57;
        const TID5 = 1 << 58;
    }
}

impl Hcr {
    /// Default configuration for every KVM guest.
    pub const GUEST_FLAGS: Hcr = Hcr::TSC
        .union(Hcr::TSW)
        .union(Hcr::TWE)
        .union(Hcr::TWI)
        .union(Hcr::VM)
        .union(Hcr::BSU_IS)
        .union(Hcr::FB)
        .union(Hcr::TACR)
        .union(Hcr::AMO)
        .union(Hcr::SWIO)
        .union(Hcr::TIDCP)
        .union(Hcr::RW)
        .union(Hcr::TLOR)
        .union(Hcr::FMO)
        .union(Hcr::IMO)
        .union(Hcr::PTW)
        .union(Hcr::TID3)
        .union(Hcr::TID1);
}

bitflags! {
    /// HCRX_EL2 bits managed by the hypervisor.
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
    pub struct Hcrx: u64 {
        const SMPME = 1 << 5;
        const MCE2 = 1 << 10;
        const MSCEN = 1 << 11;
        const TCR2EN = 1 << 14;
        const ENFPM = 1 << 41;
    }
}

bitflags! {
    /// MDCR_EL2 bits managed by the hypervisor.
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
    pub struct Mdcr: u64 {
        const HPMN = 0x1f;
        const TPMCR = 1 << 5;
        const TPM = 1 << 6;
        const HPME = 1 << 7;
        const TDA = 1 << 9;
        const TDOSA = 1 << 10;
        const TDRA = 1 << 11;
        const E2PB = 3 << 12;
        const TPMS = 1 << 14;
        const TTRF = 1 << 19;
        const E2TB = 3 << 24;
        const TDCC = 1 << 27;
        const MTPME = 1 << 28;
    }
}

bitflags! {
    /// System-wide CPU capabilities finalized at hypervisor boot.
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
    pub struct HostCaps: u32 {
        const HVHE = 1 << 0;
        const RAS_EXTN = 1 << 1;
        const STAGE2_FWB = 1 << 2;
        const EVT = 1 << 3;
        const MISMATCHED_CACHE_TYPE = 1 << 4;
        const HCX = 1 << 5;
    }
}

bitflags! {
    /// Architectural features a VM's ID registers advertise to the guest.
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
    pub struct CpuFeatures: u64 {
        const AARCH32_EL0 = 1 << 0;
        const AARCH32_EL1 = 1 << 1;
        const FP = 1 << 2;
        const ADVSIMD = 1 << 3;
        const SVE = 1 << 4;
        const SME = 1 << 5;
        const RAS = 1 << 6;
        const AMU = 1 << 7;
        const MTE = 1 << 8;
        const LOR = 1 << 9;
        const MOPS = 1 << 10;
        const TCR2 = 1 << 11;
        const FPMR = 1 << 12;
        const PMUV3 = 1 << 13;
        const DEBUG = 1 << 14;
        const DOUBLE_LOCK = 1 << 15;
        const SPE = 1 << 16;
        const TRACE_FILTER = 1 << 17;
        const TRACE_BUFFER = 1 << 18;
        const FGT = 1 << 19;
    }
}

/// Trap register values for one vCPU.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct TrapConfig {
    pub hcr: Hcr,
    pub hcrx: Hcrx,
    pub mdcr: Mdcr,
}

/// Bits to set and clear in a trap register when a guest feature is absent.
struct MissingFeature<T: 'static> {
    feature: CpuFeatures,
    set: T,
    clear: T,
}

const HCR_MISSING_FEATURE_TRAPS: &[MissingFeature<Hcr>] = &[
    MissingFeature {
        feature: CpuFeatures::RAS,
        set: Hcr::TERR.union(Hcr::TEA),
        clear: Hcr::FIEN,
    },
    MissingFeature {
        feature: CpuFeatures::AMU,
        set: Hcr::empty(),
        clear: Hcr::AMVOFFEN,
    },
    MissingFeature {
        feature: CpuFeatures::MTE,
        set: Hcr::TID5,
        clear: Hcr::DCT.union(Hcr::ATA),
    },
    MissingFeature {
        feature: CpuFeatures::LOR,
        set: Hcr::TLOR,
        clear: Hcr::empty(),
    },
];

const MDCR_MISSING_FEATURE_TRAPS: &[MissingFeature<Mdcr>] = &[
    MissingFeature {
        feature: CpuFeatures::PMUV3,
        set: Mdcr::TPM.union(Mdcr::TPMCR),
        clear: Mdcr::HPME.union(Mdcr::MTPME).union(Mdcr::HPMN),
    },
    MissingFeature {
        feature: CpuFeatures::DEBUG,
        set: Mdcr::TDRA.union(Mdcr::TDA),
        clear: Mdcr::empty(),
    },
    MissingFeature {
        feature: CpuFeatures::DOUBLE_LOCK,
        set: Mdcr::TDOSA,
        clear: Mdcr::empty(),
    },
    MissingFeature {
        feature: CpuFeatures::SPE,
        set: Mdcr::TPMS,
        clear: Mdcr::E2PB,
    },
    MissingFeature {
        feature: CpuFeatures::TRACE_FILTER,
        set: Mdcr::TTRF,
        clear: Mdcr::empty(),
    },
    MissingFeature {
        feature: CpuFeatures::TRACE_BUFFER,
        set: Mdcr::E2TB,
        clear: Mdcr::empty(),
    },
    // Debug Communications Channel registers.
    MissingFeature {
        feature: CpuFeatures::FGT,
        set: Mdcr::TDCC,
        clear: Mdcr::empty(),
    },
];

/// HCRX enables granted when the guest has the feature.
const HCRX_FEATURE_ENABLES: &[(CpuFeatures, Hcrx)] = &[
    (CpuFeatures::MOPS, Hcrx::MSCEN.union(Hcrx::MCE2)),
    (CpuFeatures::TCR2, Hcrx::TCR2EN),
    (CpuFeatures::FPMR, Hcrx::ENFPM),
];

fn apply_missing<T>(mut val: T, table: &[MissingFeature<T>], features: CpuFeatures) -> T
where
    T: bitflags::Flags + Copy,
{
    for trap in table {
        if !features.contains(trap.feature) {
            val.insert(trap.set);
            val.remove(trap.clear);
        }
    }
    val
}

fn reset_hcr(vcpu_features: VcpuFeatures, caps: HostCaps) -> Hcr {
    let mut hcr = Hcr::GUEST_FLAGS;

    if caps.contains(HostCaps::HVHE) {
        hcr |= Hcr::E2H;
    }
    if caps.contains(HostCaps::RAS_EXTN) {
        // Route synchronous external aborts to EL2 and trap error record accesses.
        hcr |= Hcr::TEA | Hcr::TERR;
    }
    if caps.contains(HostCaps::STAGE2_FWB) {
        hcr |= Hcr::FWB;
    }
    if caps.contains(HostCaps::EVT) && !caps.contains(HostCaps::MISMATCHED_CACHE_TYPE) {
        hcr |= Hcr::TID4;
    } else {
        hcr |= Hcr::TID2;
    }
    if vcpu_features.intersects(VcpuFeatures::PTRAUTH_ADDRESS | VcpuFeatures::PTRAUTH_GENERIC) {
        hcr |= Hcr::API | Hcr::APK;
    }
    hcr
}

/// Computes the initial trap configuration of a vCPU.
///
/// `host_hcrx` is the host's HCRX_EL2 for this vCPU and is only inherited by non-protected
/// vCPUs, whose features the host controls.
pub fn compute_traps(
    vcpu_features: VcpuFeatures,
    cpu_features: CpuFeatures,
    caps: HostCaps,
    host_hcrx: u64,
    protected: bool,
) -> TrapConfig {
    let mut traps = TrapConfig {
        hcr: reset_hcr(vcpu_features, caps),
        hcrx: Hcrx::empty(),
        mdcr: Mdcr::empty(),
    };

    if caps.contains(HostCaps::HCX) {
        // SMPME has no guest-observable effect and is not feature gated.
        traps.hcrx = Hcrx::SMPME;
        if !protected {
            traps.hcrx |= Hcrx::from_bits_retain(host_hcrx);
        }
    }

    if !protected {
        return traps;
    }

    // No AArch32. Always trap the ID and implementation-defined registers.
    traps.hcr |= Hcr::RW | Hcr::TACR | Hcr::TIDCP | Hcr::TID3 | Hcr::TID1;
    traps.hcr = apply_missing(traps.hcr, HCR_MISSING_FEATURE_TRAPS, cpu_features);

    if caps.contains(HostCaps::HCX) {
        for (feature, enable) in HCRX_FEATURE_ENABLES {
            if cpu_features.contains(*feature) {
                traps.hcrx |= *enable;
            }
        }
    }

    traps.mdcr = apply_missing(traps.mdcr, MDCR_MISSING_FEATURE_TRAPS, cpu_features);
    traps
}

/// Rejects feature sets a protected VM cannot be given.
pub fn check_protected_features(cpu_features: CpuFeatures) -> Result<()> {
    if cpu_features.intersects(CpuFeatures::AARCH32_EL0 | CpuFeatures::AARCH32_EL1) {
        return Err(Error::IncompatibleConfiguration);
    }
    // Guests assume FP and AdvSIMD.
    if !cpu_features.contains(CpuFeatures::FP | CpuFeatures::ADVSIMD) {
        return Err(Error::IncompatibleConfiguration);
    }
    if cpu_features.contains(CpuFeatures::SME) {
        return Err(Error::IncompatibleConfiguration);
    }
    Ok(())
}

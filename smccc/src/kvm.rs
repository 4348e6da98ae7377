// Copyright 2026 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! KVM vendor-specific hypervisor service calls.

use crate::call_val;
use crate::CallConv;
use crate::CallType;
use crate::FunctionId;
use crate::Owner;

/// `VENDOR_HYP_CALL_UID`.
pub const ARM_SMCCC_VENDOR_HYP_CALL_UID_FUNC_ID: u32 =
    call_val(CallType::Fast, CallConv::Smc32, Owner::VendorHyp, 0xff01);

/// UID words identifying KVM as the vendor hypervisor.
pub const ARM_SMCCC_VENDOR_HYP_UID_KVM: [u64; 4] =
    [0xb66f_b428, 0xe911_c52e, 0x564b_caa9, 0x743a_004d];

/// `VENDOR_HYP_KVM_FEATURES`: returns the bitmap of implemented KVM functions in x0.
pub const ARM_SMCCC_VENDOR_HYP_KVM_FEATURES_FUNC_ID: u32 =
    call_val(CallType::Fast, CallConv::Smc32, Owner::VendorHyp, 0);

/// Returned in x1 by `HYP_MEMINFO` when the share and guard calls accept page ranges.
pub const KVM_FUNC_HAS_RANGE: u64 = 1;

/// KVM vendor function numbers. Each is also its bit in the `KVM_FEATURES` bitmap.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, enumn::N)]
#[repr(u32)]
pub enum KvmFunc {
    Features = 0,
    Ptp = 1,
    HypMeminfo = 2,
    MemShare = 3,
    MemUnshare = 4,
    MmioGuardInfo = 5,
    MmioGuardEnroll = 6,
    MmioGuardMap = 7,
    MmioGuardUnmap = 8,
    MemRelinquish = 9,
    MmioRguardMap = 10,
    MmioRguardUnmap = 11,
}

impl KvmFunc {
    /// The 64-bit function id used by guests to issue this call.
    pub const fn func_id(self) -> u32 {
        call_val(CallType::Fast, CallConv::Smc64, Owner::VendorHyp, self as u32)
    }

    pub const fn feature_bit(self) -> u64 {
        1 << (self as u32)
    }
}

/// Vendor functions implemented by the protected-VM hypercall handler.
pub const PVM_IMPLEMENTED_FUNCS: &[KvmFunc] = &[
    KvmFunc::Features,
    KvmFunc::HypMeminfo,
    KvmFunc::MemShare,
    KvmFunc::MemUnshare,
    KvmFunc::MmioGuardInfo,
    KvmFunc::MmioGuardEnroll,
    KvmFunc::MmioGuardMap,
    KvmFunc::MmioGuardUnmap,
    KvmFunc::MmioRguardMap,
    KvmFunc::MmioRguardUnmap,
    KvmFunc::MemRelinquish,
];

/// Bitmap reported by `KVM_FEATURES` to protected guests.
pub fn pvm_features_bitmap() -> u64 {
    PVM_IMPLEMENTED_FUNCS
        .iter()
        .fold(0, |bits, func| bits | func.feature_bit())
}

/// Decodes a 64-bit KVM vendor call. `KVM_FEATURES` uses the 32-bit convention and is not
/// matched here.
pub fn decode(id: FunctionId) -> Option<KvmFunc> {
    if !id.is_fast() || !id.is_smc64() || id.owner() != Some(Owner::VendorHyp) {
        return None;
    }
    KvmFunc::n(id.number())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn function_ids() {
        assert_eq!(ARM_SMCCC_VENDOR_HYP_CALL_UID_FUNC_ID, 0x8600_ff01);
        assert_eq!(ARM_SMCCC_VENDOR_HYP_KVM_FEATURES_FUNC_ID, 0x8600_0000);
        assert_eq!(KvmFunc::MemShare.func_id(), 0xc600_0003);
        assert_eq!(KvmFunc::MmioRguardUnmap.func_id(), 0xc600_000b);
    }

    #[test]
    fn decode_vendor_calls() {
        assert_eq!(decode(FunctionId(0xc600_0009)), Some(KvmFunc::MemRelinquish));
        assert_eq!(decode(FunctionId(0xc600_0040)), None);
        assert_eq!(decode(FunctionId(0x8600_0003)), None);
        assert_eq!(decode(FunctionId(0xc400_0003)), None);
    }

    #[test]
    fn features_bitmap_skips_ptp() {
        let bits = pvm_features_bitmap();
        assert_eq!(bits & KvmFunc::Ptp.feature_bit(), 0);
        assert_eq!(bits, 0xffd);
    }
}

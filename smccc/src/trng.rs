// Copyright 2026 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Arm True Random Number Generator firmware interface.

use crate::call_val;
use crate::CallConv;
use crate::CallType;
use crate::FunctionId;
use crate::Owner;

pub const ARM_SMCCC_TRNG_VERSION: u32 =
    call_val(CallType::Fast, CallConv::Smc32, Owner::Standard, 0x50);
pub const ARM_SMCCC_TRNG_FEATURES: u32 =
    call_val(CallType::Fast, CallConv::Smc32, Owner::Standard, 0x51);
pub const ARM_SMCCC_TRNG_GET_UUID: u32 =
    call_val(CallType::Fast, CallConv::Smc32, Owner::Standard, 0x52);
pub const ARM_SMCCC_TRNG_RND32: u32 =
    call_val(CallType::Fast, CallConv::Smc32, Owner::Standard, 0x53);
pub const ARM_SMCCC_TRNG_RND64: u32 =
    call_val(CallType::Fast, CallConv::Smc64, Owner::Standard, 0x53);

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TrngFunc {
    Features,
    GetUuid,
    Rnd32,
    Rnd64,
    Version,
}

impl TrngFunc {
    /// Whether the call carries an argument in x1.
    pub fn takes_arg(self) -> bool {
        matches!(self, TrngFunc::Features | TrngFunc::Rnd32 | TrngFunc::Rnd64)
    }
}

const TRNG_CALLS: &[(u32, TrngFunc)] = &[
    (ARM_SMCCC_TRNG_VERSION, TrngFunc::Version),
    (ARM_SMCCC_TRNG_FEATURES, TrngFunc::Features),
    (ARM_SMCCC_TRNG_GET_UUID, TrngFunc::GetUuid),
    (ARM_SMCCC_TRNG_RND32, TrngFunc::Rnd32),
    (ARM_SMCCC_TRNG_RND64, TrngFunc::Rnd64),
];

pub fn decode(id: FunctionId) -> Option<TrngFunc> {
    TRNG_CALLS
        .iter()
        .find(|(fid, _)| *fid == id.0)
        .map(|&(_, func)| func)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn function_ids() {
        assert_eq!(ARM_SMCCC_TRNG_VERSION, 0x8400_0050);
        assert_eq!(ARM_SMCCC_TRNG_RND32, 0x8400_0053);
        assert_eq!(ARM_SMCCC_TRNG_RND64, 0xc400_0053);
    }

    #[test]
    fn decode_trng() {
        assert_eq!(decode(FunctionId(0xc400_0053)), Some(TrngFunc::Rnd64));
        assert_eq!(decode(FunctionId(0x8400_0054)), None);
        assert!(!TrngFunc::GetUuid.takes_arg());
        assert!(TrngFunc::Features.takes_arg());
    }
}

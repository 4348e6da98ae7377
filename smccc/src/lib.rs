// Copyright 2026 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Arm SMC Calling Convention (SMCCC) definitions.
//!
//! Function identifiers, return codes and version words used by the guest hypercall handlers.
//! The numeric encodings are architecture-defined data; the handlers decode them through the
//! tables in this crate rather than matching on literals.

pub mod kvm;
pub mod psci;
pub mod trng;

use remain::sorted;
use serde::Deserialize;
use serde::Serialize;
use thiserror::Error;

#[sorted]
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    #[error("invalid PSCI version {major}.{minor}")]
    InvalidPsciVersion { major: u16, minor: u16 },
}

pub type Result<T> = std::result::Result<T, Error>;

/// SMCCC v1.1, returned by `SMCCC_VERSION`.
pub const SMCCC_VERSION_1_1: u64 = 0x1_0001;

pub const SMCCC_RET_SUCCESS: i64 = 0;
pub const SMCCC_RET_NOT_SUPPORTED: i64 = -1;
pub const SMCCC_RET_NOT_REQUIRED: i64 = -2;
pub const SMCCC_RET_INVALID_PARAMETER: i64 = -3;

/// `SMCCC_VERSION` function id.
pub const ARM_SMCCC_VERSION_FUNC_ID: u32 =
    call_val(CallType::Fast, CallConv::Smc32, Owner::Arch, 0);
/// `SMCCC_ARCH_FEATURES` function id.
pub const ARM_SMCCC_ARCH_FEATURES_FUNC_ID: u32 =
    call_val(CallType::Fast, CallConv::Smc32, Owner::Arch, 1);

const TYPE_SHIFT: u32 = 31;
const CONV_SHIFT: u32 = 30;
const OWNER_SHIFT: u32 = 24;
const OWNER_MASK: u32 = 0x3f;
const FUNC_MASK: u32 = 0xffff;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CallType {
    Yielding = 0,
    Fast = 1,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CallConv {
    Smc32 = 0,
    Smc64 = 1,
}

/// Owning entity of a function id.
#[derive(Clone, Copy, Debug, PartialEq, Eq, enumn::N, Serialize, Deserialize)]
#[repr(u32)]
pub enum Owner {
    Arch = 0,
    Cpu = 1,
    Sip = 2,
    Oem = 3,
    Standard = 4,
    StandardHyp = 5,
    VendorHyp = 6,
}

/// Builds a function id the same way `ARM_SMCCC_CALL_VAL` does.
pub const fn call_val(ty: CallType, conv: CallConv, owner: Owner, func: u32) -> u32 {
    ((ty as u32) << TYPE_SHIFT)
        | ((conv as u32) << CONV_SHIFT)
        | (((owner as u32) & OWNER_MASK) << OWNER_SHIFT)
        | (func & FUNC_MASK)
}

/// A decoded SMCCC function id as found in x0 on a hypercall trap.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct FunctionId(pub u32);

impl FunctionId {
    /// Truncates the x0 register value to a function id. The upper 32 bits are ignored.
    pub fn from_reg(x0: u64) -> Self {
        FunctionId(x0 as u32)
    }

    pub fn is_fast(self) -> bool {
        self.0 >> TYPE_SHIFT == CallType::Fast as u32
    }

    /// Returns true for calls using the SMC64/HVC64 convention.
    pub fn is_smc64(self) -> bool {
        (self.0 >> CONV_SHIFT) & 1 == CallConv::Smc64 as u32
    }

    pub fn owner(self) -> Option<Owner> {
        Owner::n((self.0 >> OWNER_SHIFT) & OWNER_MASK)
    }

    pub fn number(self) -> u32 {
        self.0 & FUNC_MASK
    }
}

impl From<u32> for FunctionId {
    fn from(id: u32) -> Self {
        FunctionId(id)
    }
}

/// Converts a signed SMCCC/PSCI return code to the register value handed back to the guest.
pub const fn ret(code: i64) -> u64 {
    code as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn version_function_id() {
        assert_eq!(ARM_SMCCC_VERSION_FUNC_ID, 0x8000_0000);
        assert_eq!(ARM_SMCCC_ARCH_FEATURES_FUNC_ID, 0x8000_0001);
    }

    #[test]
    fn decode_function_id() {
        let id = FunctionId(0xc600_0003);
        assert!(id.is_fast());
        assert!(id.is_smc64());
        assert_eq!(id.owner(), Some(Owner::VendorHyp));
        assert_eq!(id.number(), 3);

        let id = FunctionId::from_reg(0xffff_ffff_8400_0000);
        assert_eq!(id, FunctionId(0x8400_0000));
        assert!(!id.is_smc64());
        assert_eq!(id.owner(), Some(Owner::Standard));
    }

    #[test]
    fn negative_codes_sign_extend() {
        assert_eq!(ret(SMCCC_RET_NOT_SUPPORTED), u64::MAX);
        assert_eq!(ret(SMCCC_RET_INVALID_PARAMETER), u64::MAX - 2);
    }
}

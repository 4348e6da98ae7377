// Copyright 2026 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Forwarding of the Arm TRNG interface to the secure monitor.

use log::trace;
use smccc::trng::TrngFunc;
use zeroize::Zeroize;
use zeroize::Zeroizing;

use crate::hypercall::HvcCall;
use crate::hypercall::HvcOutcome;
use crate::hypervisor::Hypervisor;

/// Registers x0..x3 returned by an SMC.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Zeroize)]
pub struct SmcResult {
    pub a0: u64,
    pub a1: u64,
    pub a2: u64,
    pub a3: u64,
}

/// The firmware below the hypervisor.
pub trait SecureMonitor: Send + Sync {
    /// Issues a fast SMC with function id `fid` and `arg1` in x1.
    fn smc(&self, fid: u32, arg1: u64) -> SmcResult;
}

impl Hypervisor {
    /// Passes a TRNG call through to the secure monitor.
    ///
    /// Returns `None` when no monitor implements the interface.
    pub(crate) fn forward_trng(&self, func: TrngFunc, call: &HvcCall) -> Option<HvcOutcome> {
        if !self.config.trng_available {
            return None;
        }
        let monitor = self.monitor.as_ref()?;

        let arg1 = if func.takes_arg() { call.arg1 } else { 0 };
        let mut res = monitor.smc(call.fid.0, arg1);
        // Entropy must not linger in hypervisor memory beyond the guest's registers.
        let regs = Zeroizing::new([res.a0, res.a1, res.a2, res.a3]);
        res.zeroize();
        trace!("forwarded TRNG call {:?}", func);
        Some(HvcOutcome::Guest(*regs))
    }
}

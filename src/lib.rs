// Copyright 2026 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Protected-VM lifecycle manager and guest hypercall mediator.
//!
//! The host drives VM and vCPU lifecycles through [`Hypervisor`] using opaque [`VmHandle`]s.
//! Guest hypercalls trapped on a physical core are dispatched through
//! [`Hypervisor::handle_hvc64`], operating on the vCPU loaded in that core's [`CoreContext`].
//! Memory ownership transitions are delegated to a [`MemoryOwnership`] implementation.

pub mod config;
mod hyp_req;
mod hypercall;
mod hypervisor;
pub mod mem;
mod mem_share;
mod memcache;
mod psci;
mod pvmfw;
mod registry;
pub mod sim;
pub mod traps;
mod trng;
mod vcpu;
mod vm;

use remain::sorted;
use thiserror::Error;

pub use crate::config::HypConfig;
pub use crate::hyp_req::HypRequest;
pub use crate::hyp_req::HypRequestRing;
pub use crate::hyp_req::MemDest;
pub use crate::hypercall::HostExit;
pub use crate::hypercall::HvcExit;
pub use crate::hypervisor::Hypervisor;
pub use crate::mem::HostRegion;
pub use crate::mem::MemError;
pub use crate::mem::MemoryOwnership;
pub use crate::mem::PhysAddr;
pub use crate::mem::Vmid;
pub use crate::mem::PAGE_SIZE;
pub use crate::memcache::Memcache;
pub use crate::pvmfw::PvmFirmware;
pub use crate::registry::VmHandle;
pub use crate::registry::VmRef;
pub use crate::trng::SecureMonitor;
pub use crate::trng::SmcResult;
pub use crate::vcpu::CoreContext;
pub use crate::vcpu::HostRegs;
pub use crate::vcpu::HostSve;
pub use crate::vcpu::HostVcpu;
pub use crate::vcpu::MpState;
pub use crate::vcpu::PowerState;
pub use crate::vcpu::VcpuContext;
pub use crate::vcpu::VirtualCpu;
pub use crate::vm::HostVm;
pub use crate::vm::VcpuFeatures;
pub use crate::vm::VirtualMachine;
pub use crate::vm::VmState;

#[sorted]
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    #[error("object is in use")]
    Busy,
    #[error("guest configuration is incompatible with protection")]
    IncompatibleConfiguration,
    #[error("internal invariant violated")]
    Internal,
    #[error("invalid argument")]
    InvalidArgument,
    #[error("no such object")]
    NotFound,
    #[error("resources exhausted")]
    ResourceExhausted,
    #[error("VM table is not initialized")]
    Uninitialized,
}

impl Error {
    /// Negative errno value reported to the host for this error.
    pub fn errno(&self) -> i32 {
        let errno = match self {
            Error::Busy => libc::EBUSY,
            Error::IncompatibleConfiguration => libc::EINVAL,
            Error::Internal => libc::EFAULT,
            Error::InvalidArgument => libc::EINVAL,
            Error::NotFound => libc::ENOENT,
            Error::ResourceExhausted => libc::ENOMEM,
            Error::Uninitialized => libc::EINVAL,
        };
        -errno
    }
}

pub type Result<T> = std::result::Result<T, Error>;

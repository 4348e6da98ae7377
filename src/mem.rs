// Copyright 2026 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Memory ownership primitives consumed by the lifecycle managers and hypercall handlers.
//!
//! The page-table mutation behind every transition lives outside this crate. Implementations of
//! [`MemoryOwnership`] are expected to make each transition atomic with respect to concurrent
//! callers; [`crate::sim::SimMemory`] is an in-memory implementation.

use std::fmt;
use std::fmt::Display;

use remain::sorted;
use serde::Deserialize;
use serde::Serialize;
use static_assertions::const_assert_eq;

use crate::memcache::Memcache;
use crate::Error;

pub const PAGE_SHIFT: u64 = 12;
pub const PAGE_SIZE: u64 = 1 << PAGE_SHIFT;

// Stage-2 geometry and the guest ABI assume 4KiB granules.
const_assert_eq!(PAGE_SIZE, 4096);

pub fn page_aligned(addr: u64) -> bool {
    addr & (PAGE_SIZE - 1) == 0
}

/// Rounds `size` up to a whole number of pages.
pub fn page_align_up(size: u64) -> Option<u64> {
    Some(size.checked_add(PAGE_SIZE - 1)? & !(PAGE_SIZE - 1))
}

/// Virtual machine identifier tagging a guest's stage-2 TLB entries. VMID 0 belongs to the host.
pub type Vmid = u32;

/// Physical address.
#[derive(
    Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct PhysAddr(pub u64);

impl PhysAddr {
    pub fn checked_add(self, other: u64) -> Option<PhysAddr> {
        self.0.checked_add(other).map(PhysAddr)
    }
}

impl Display for PhysAddr {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

/// A range of host memory shared with or donated to the hypervisor.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct HostRegion {
    pub start: u64,
    pub size: u64,
}

impl HostRegion {
    pub fn new(start: u64, size: u64) -> Self {
        HostRegion { start, size }
    }

    /// A region spanning `nr_pages` pages from `start`.
    pub fn pages(start: u64, nr_pages: u64) -> Self {
        HostRegion {
            start,
            size: nr_pages << PAGE_SHIFT,
        }
    }

    /// Last byte of the region, or `None` if the region is empty or wraps.
    pub fn last(&self) -> Option<u64> {
        self.size.checked_sub(1).and_then(|s| self.start.checked_add(s))
    }

    pub fn is_page_aligned(&self) -> bool {
        page_aligned(self.start) && page_aligned(self.size)
    }

    /// Page-granular start addresses of every page the region touches.
    pub fn page_iter(&self) -> impl Iterator<Item = u64> {
        let first = self.start & !(PAGE_SIZE - 1);
        let end = self
            .last()
            .and_then(|l| (l & !(PAGE_SIZE - 1)).checked_add(PAGE_SIZE))
            .unwrap_or(first);
        (first..end).step_by(PAGE_SIZE as usize)
    }
}

impl Display for HostRegion {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{:#x}+{:#x}", self.start, self.size)
    }
}

/// Failure of a memory ownership transition.
#[sorted]
#[derive(thiserror::Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemError {
    #[error("memory is in use")]
    Busy,
    #[error("address is not mapped")]
    Fault,
    #[error("invalid address range")]
    InvalidRange,
    #[error("hypervisor memory cache is empty")]
    NoMemory,
    #[error("ownership state does not permit the transition")]
    Permission,
}

pub type MemResult<T> = std::result::Result<T, MemError>;

impl From<MemError> for Error {
    fn from(e: MemError) -> Self {
        match e {
            MemError::Busy => Error::Busy,
            MemError::Fault | MemError::InvalidRange | MemError::Permission => {
                Error::InvalidArgument
            }
            MemError::NoMemory => Error::ResourceExhausted,
        }
    }
}

/// Donate, pin, share and reclaim primitives implemented by the stage-2 page-table layer.
pub trait MemoryOwnership: Send + Sync {
    /// Pins host memory shared with the hypervisor so the host cannot free or move it.
    fn pin_shared(&self, region: HostRegion) -> MemResult<()>;

    /// Drops one pin taken by `pin_shared`.
    fn unpin_shared(&self, region: HostRegion);

    /// Transfers ownership of host pages to the hypervisor, unmapping them from the host.
    fn donate_to_hyp(&self, region: HostRegion) -> MemResult<()>;

    /// Returns hypervisor-owned pages to the host without clearing them.
    fn donate_to_host(&self, region: HostRegion);

    /// Accounts `size` bytes of hypervisor heap against the host's donations.
    fn alloc_account(&self, size: u64) -> MemResult<()>;

    fn free_account(&self, size: u64);

    /// Zeroes hypervisor memory about to leave the hypervisor.
    fn clear_hyp_memory(&self, region: HostRegion);

    /// Installs a guest stage-2 rooted in the donated `pgd`.
    fn prepare_stage2(&self, vmid: Vmid, pgd: HostRegion, protected: bool) -> MemResult<()>;

    /// Destroys the guest stage-2, moving its table pages into the VM's pool.
    fn destroy_stage2(&self, vmid: Vmid);

    /// Moves every page in the VM's pool into `mc`.
    fn drain_pool(&self, vmid: Vmid, mc: &mut Memcache);

    /// Invalidates every TLB entry tagged with `vmid` on all cores.
    fn flush_vmid(&self, vmid: Vmid);

    /// Invalidates the local TLB and I-cache context of `vmid` on `cpu`.
    fn flush_cpu_context(&self, vmid: Vmid, cpu: usize);

    /// Shares up to `nr_pages` guest pages starting at `ipa` with the host. Returns the number of
    /// pages shared. `MemError::Fault` means the first page is not mapped yet and
    /// `MemError::NoMemory` means `mc` could not cover a table allocation.
    fn guest_share_host(
        &self,
        vmid: Vmid,
        mc: &mut Memcache,
        ipa: u64,
        nr_pages: u64,
    ) -> MemResult<u64>;

    /// Revokes host access to up to `nr_pages` shared guest pages. Returns the number unshared.
    fn guest_unshare_host(&self, vmid: Vmid, ipa: u64, nr_pages: u64) -> MemResult<u64>;

    /// Returns the guest page mapped at `ipa` to the host. `Ok(None)` when nothing was mapped.
    fn guest_relinquish_to_host(
        &self,
        vmid: Vmid,
        mc: &mut Memcache,
        ipa: u64,
    ) -> MemResult<Option<PhysAddr>>;

    /// Annotates up to `nr_pages` unmapped guest pages from `ipa` as MMIO. Returns the number of
    /// pages annotated; an error means no page was.
    fn install_ioguard(
        &self,
        vmid: Vmid,
        mc: &mut Memcache,
        ipa: u64,
        nr_pages: u64,
    ) -> MemResult<u64>;

    /// Whether the page containing `ipa` carries an MMIO annotation.
    fn is_ioguarded(&self, vmid: Vmid, ipa: u64) -> bool;

    /// Returns one page of a dying guest to the host, poisoning it if the guest owned it.
    fn reclaim_page(&self, vmid: Vmid, phys: PhysAddr, ipa: u64) -> MemResult<()>;

    fn poison_page(&self, phys: PhysAddr);

    /// Copies one page of hypervisor memory at `src` into the guest page at `dst`.
    fn copy_page(&self, dst: PhysAddr, src: PhysAddr) -> MemResult<()>;
}

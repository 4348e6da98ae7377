// Copyright 2026 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! An in-memory [`MemoryOwnership`] implementation.
//!
//! `SimMemory` tracks page ownership in tables instead of page tables, which is enough to run
//! the lifecycle and hypercall paths end to end on a host machine. Guest stage-2 mappings are
//! installed directly by the embedder with [`SimMemory::map_guest_page`] and
//! [`SimMemory::map_guest_block`], standing in for the host's guest fault handling.

use std::collections::BTreeMap;
use std::collections::BTreeSet;
use std::collections::HashMap;
use std::collections::HashSet;
use std::sync::MutexGuard;

use log::trace;
use sync::Mutex;

use crate::mem::page_aligned;
use crate::mem::HostRegion;
use crate::mem::MemError;
use crate::mem::MemResult;
use crate::mem::MemoryOwnership;
use crate::mem::PhysAddr;
use crate::mem::Vmid;
use crate::mem::PAGE_SIZE;
use crate::memcache::Memcache;

/// Guest address range covered by one last-level table.
const TABLE_SPAN_SHIFT: u64 = 21;

/// Ownership of a page mapped into a guest.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum GuestPageState {
    /// Exclusively the guest's.
    Owned,
    /// Owned by the guest and shared with the host.
    Shared,
}

#[derive(Clone, Copy, Debug)]
struct GuestPage {
    phys: PhysAddr,
    state: GuestPageState,
    /// First IPA of the block mapping the page belongs to, if it is not mapped at page
    /// granularity.
    block: Option<u64>,
}

struct GuestStage2 {
    pgd: HostRegion,
    destroyed: bool,
    pages: BTreeMap<u64, GuestPage>,
    ioguard: BTreeSet<u64>,
    /// Table spans that have a last-level table.
    tables: BTreeSet<u64>,
    /// Pages taken from vCPU memcaches for tables.
    table_pages: Vec<PhysAddr>,
}

impl GuestStage2 {
    fn new(pgd: HostRegion) -> Self {
        GuestStage2 {
            pgd,
            destroyed: false,
            pages: BTreeMap::new(),
            ioguard: BTreeSet::new(),
            tables: BTreeSet::new(),
            table_pages: Vec::new(),
        }
    }

    /// Makes sure `ipa` can be mapped at page granularity, taking a table page from `mc` when
    /// a block has to be split or a span has no table yet.
    fn ensure_table(&mut self, mc: &mut Memcache, ipa: u64) -> MemResult<()> {
        let block = self.pages.get(&ipa).and_then(|p| p.block);
        let span = ipa >> TABLE_SPAN_SHIFT;
        if block.is_none() && self.tables.contains(&span) {
            return Ok(());
        }
        let (phys, _) = mc.pop().ok_or(MemError::NoMemory)?;
        self.table_pages.push(phys);
        self.tables.insert(span);
        if let Some(start) = block {
            for page in self.pages.values_mut() {
                if page.block == Some(start) {
                    page.block = None;
                }
            }
        }
        Ok(())
    }
}

/// IPA of page `idx` of a range starting at `base`, if it is addressable.
fn nth_page(base: u64, idx: u64) -> Option<u64> {
    idx.checked_mul(PAGE_SIZE)
        .and_then(|offset| base.checked_add(offset))
}

#[derive(Default)]
struct SimState {
    pins: HashMap<u64, u32>,
    hyp_pages: HashSet<u64>,
    hyp_budget: Option<u64>,
    accounted: u64,
    guests: HashMap<Vmid, GuestStage2>,
    pools: HashMap<Vmid, Vec<PhysAddr>>,
    vmid_flushes: HashMap<Vmid, u32>,
    cpu_flushes: HashMap<(Vmid, usize), u32>,
    contents: HashMap<u64, u64>,
    poisoned: u64,
    cleared: u64,
    fail_next_stage2: bool,
}

impl SimState {
    fn guest(&mut self, vmid: Vmid) -> MemResult<&mut GuestStage2> {
        match self.guests.get_mut(&vmid) {
            Some(guest) if !guest.destroyed => Ok(guest),
            _ => Err(MemError::InvalidRange),
        }
    }

    fn poison(&mut self, phys: PhysAddr) {
        self.contents.remove(&phys.0);
        self.poisoned += 1;
    }
}

/// Page ownership bookkeeping for running the hypervisor without hardware.
#[derive(Default)]
pub struct SimMemory {
    state: Mutex<SimState>,
}

impl SimMemory {
    pub fn new() -> Self {
        SimMemory::default()
    }

    /// Limits the hypervisor heap available to `alloc_account` to `bytes`.
    pub fn with_hyp_budget(self, bytes: u64) -> Self {
        self.state.lock().hyp_budget = Some(bytes);
        self
    }

    fn state(&self) -> MutexGuard<SimState> {
        self.state.lock()
    }

    /// Makes the next `prepare_stage2` fail with `NoMemory`.
    pub fn fail_next_stage2(&self) {
        self.state().fail_next_stage2 = true;
    }

    /// Maps one page of host memory into a guest at `ipa`, owned by the guest.
    pub fn map_guest_page(&self, vmid: Vmid, ipa: u64, phys: PhysAddr) -> MemResult<()> {
        self.map_guest_block(vmid, ipa, phys, 1)
    }

    /// Maps `nr_pages` contiguous pages into a guest. More than one page is mapped as a block,
    /// which must be split before any of its pages changes state.
    pub fn map_guest_block(
        &self,
        vmid: Vmid,
        ipa: u64,
        phys: PhysAddr,
        nr_pages: u64,
    ) -> MemResult<()> {
        if !page_aligned(ipa) || !page_aligned(phys.0) || nr_pages == 0 {
            return Err(MemError::InvalidRange);
        }
        let mut state = self.state();
        let guest = state.guest(vmid)?;
        let ipas: Vec<u64> = (0..nr_pages).map(|i| ipa + i * PAGE_SIZE).collect();
        if ipas
            .iter()
            .any(|ipa| guest.pages.contains_key(ipa) || guest.ioguard.contains(ipa))
        {
            return Err(MemError::Busy);
        }
        let block = if nr_pages > 1 { Some(ipa) } else { None };
        for (i, ipa) in ipas.into_iter().enumerate() {
            guest.pages.insert(
                ipa,
                GuestPage {
                    phys: PhysAddr(phys.0 + i as u64 * PAGE_SIZE),
                    state: GuestPageState::Owned,
                    block,
                },
            );
        }
        Ok(())
    }

    pub fn guest_page_state(&self, vmid: Vmid, ipa: u64) -> Option<GuestPageState> {
        let state = self.state();
        state.guests.get(&vmid)?.pages.get(&ipa).map(|p| p.state)
    }

    /// Whether the guest still has a stage-2 installed.
    pub fn has_stage2(&self, vmid: Vmid) -> bool {
        self.state()
            .guests
            .get(&vmid)
            .map_or(false, |guest| !guest.destroyed)
    }

    /// Pins currently held on the page containing `addr`.
    pub fn pin_count(&self, addr: u64) -> u32 {
        let page = addr & !(PAGE_SIZE - 1);
        self.state().pins.get(&page).copied().unwrap_or(0)
    }

    pub fn is_hyp_owned(&self, phys: PhysAddr) -> bool {
        self.state().hyp_pages.contains(&phys.0)
    }

    /// Bytes of hypervisor heap currently accounted.
    pub fn accounted(&self) -> u64 {
        self.state().accounted
    }

    pub fn vmid_flushes(&self, vmid: Vmid) -> u32 {
        self.state().vmid_flushes.get(&vmid).copied().unwrap_or(0)
    }

    pub fn cpu_flushes(&self, vmid: Vmid, cpu: usize) -> u32 {
        self.state()
            .cpu_flushes
            .get(&(vmid, cpu))
            .copied()
            .unwrap_or(0)
    }

    pub fn poisoned_pages(&self) -> u64 {
        self.state().poisoned
    }

    pub fn cleared_pages(&self) -> u64 {
        self.state().cleared
    }

    /// Pages waiting in a VM's pool.
    pub fn pool_len(&self, vmid: Vmid) -> usize {
        self.state().pools.get(&vmid).map_or(0, Vec::len)
    }

    /// Fills the page at `phys` with a marker value.
    pub fn write_page(&self, phys: PhysAddr, value: u64) {
        self.state().contents.insert(phys.0, value);
    }

    /// The marker value of the page at `phys`. Zero for untouched and poisoned pages.
    pub fn read_page(&self, phys: PhysAddr) -> u64 {
        self.state().contents.get(&phys.0).copied().unwrap_or(0)
    }
}

impl MemoryOwnership for SimMemory {
    fn pin_shared(&self, region: HostRegion) -> MemResult<()> {
        region.last().ok_or(MemError::InvalidRange)?;
        let mut state = self.state();
        let pages: Vec<u64> = region.page_iter().collect();
        if pages.iter().any(|p| state.hyp_pages.contains(p)) {
            return Err(MemError::Permission);
        }
        for page in pages {
            *state.pins.entry(page).or_default() += 1;
        }
        Ok(())
    }

    fn unpin_shared(&self, region: HostRegion) {
        let mut state = self.state();
        for page in region.page_iter() {
            if let Some(count) = state.pins.get_mut(&page) {
                *count -= 1;
                if *count == 0 {
                    state.pins.remove(&page);
                }
            }
        }
    }

    fn donate_to_hyp(&self, region: HostRegion) -> MemResult<()> {
        if !region.is_page_aligned() || region.last().is_none() {
            return Err(MemError::InvalidRange);
        }
        let mut state = self.state();
        let pages: Vec<u64> = region.page_iter().collect();
        if pages
            .iter()
            .any(|p| state.hyp_pages.contains(p) || state.pins.contains_key(p))
        {
            return Err(MemError::Permission);
        }
        state.hyp_pages.extend(pages);
        Ok(())
    }

    fn donate_to_host(&self, region: HostRegion) {
        let mut state = self.state();
        for page in region.page_iter() {
            state.hyp_pages.remove(&page);
        }
    }

    fn alloc_account(&self, size: u64) -> MemResult<()> {
        let mut state = self.state();
        let accounted = state
            .accounted
            .checked_add(size)
            .ok_or(MemError::NoMemory)?;
        if state.hyp_budget.map_or(false, |budget| accounted > budget) {
            return Err(MemError::NoMemory);
        }
        state.accounted = accounted;
        Ok(())
    }

    fn free_account(&self, size: u64) {
        let mut state = self.state();
        state.accounted = state.accounted.saturating_sub(size);
    }

    fn clear_hyp_memory(&self, region: HostRegion) {
        let mut state = self.state();
        for page in region.page_iter() {
            state.contents.remove(&page);
            state.cleared += 1;
        }
    }

    fn prepare_stage2(&self, vmid: Vmid, pgd: HostRegion, _protected: bool) -> MemResult<()> {
        let mut state = self.state();
        if std::mem::take(&mut state.fail_next_stage2) {
            return Err(MemError::NoMemory);
        }
        if pgd.page_iter().any(|p| !state.hyp_pages.contains(&p)) {
            return Err(MemError::Permission);
        }
        if state.guests.get(&vmid).map_or(false, |g| !g.destroyed) {
            return Err(MemError::Busy);
        }
        state.guests.insert(vmid, GuestStage2::new(pgd));
        Ok(())
    }

    fn destroy_stage2(&self, vmid: Vmid) {
        let mut state = self.state();
        let (pgd, tables) = match state.guests.get_mut(&vmid) {
            Some(guest) if !guest.destroyed => {
                guest.destroyed = true;
                guest.tables.clear();
                (guest.pgd, std::mem::take(&mut guest.table_pages))
            }
            _ => return,
        };
        let pool = state.pools.entry(vmid).or_default();
        pool.extend(pgd.page_iter().map(PhysAddr));
        pool.extend(tables);
    }

    fn drain_pool(&self, vmid: Vmid, mc: &mut Memcache) {
        let mut state = self.state();
        let pages = state.pools.remove(&vmid).unwrap_or_default();
        for phys in pages {
            state.hyp_pages.remove(&phys.0);
            mc.push(phys, 0);
        }
        // Forget the guest once nothing of it is left.
        if state
            .guests
            .get(&vmid)
            .map_or(false, |g| g.destroyed && g.pages.is_empty())
        {
            state.guests.remove(&vmid);
        }
    }

    fn flush_vmid(&self, vmid: Vmid) {
        *self.state().vmid_flushes.entry(vmid).or_default() += 1;
    }

    fn flush_cpu_context(&self, vmid: Vmid, cpu: usize) {
        *self.state().cpu_flushes.entry((vmid, cpu)).or_default() += 1;
    }

    fn guest_share_host(
        &self,
        vmid: Vmid,
        mc: &mut Memcache,
        ipa: u64,
        nr_pages: u64,
    ) -> MemResult<u64> {
        let mut state = self.state();
        let guest = state.guest(vmid)?;
        let mut shared = 0;
        while shared < nr_pages {
            let ipa = match nth_page(ipa, shared) {
                Some(ipa) => ipa,
                None if shared == 0 => return Err(MemError::InvalidRange),
                None => break,
            };
            let page = match guest.pages.get(&ipa) {
                Some(page) => *page,
                None if shared == 0 => return Err(MemError::Fault),
                None => break,
            };
            if page.state != GuestPageState::Owned {
                if shared == 0 {
                    return Err(MemError::Permission);
                }
                break;
            }
            if page.block.is_some() {
                if let Err(e) = guest.ensure_table(mc, ipa) {
                    if shared == 0 {
                        return Err(e);
                    }
                    break;
                }
            }
            if let Some(page) = guest.pages.get_mut(&ipa) {
                page.state = GuestPageState::Shared;
            }
            shared += 1;
        }
        trace!("vmid {}: shared {} pages at {:#x}", vmid, shared, ipa);
        Ok(shared)
    }

    fn guest_unshare_host(&self, vmid: Vmid, ipa: u64, nr_pages: u64) -> MemResult<u64> {
        let mut state = self.state();
        let guest = state.guest(vmid)?;
        let mut unshared = 0;
        while unshared < nr_pages {
            let ipa = match nth_page(ipa, unshared) {
                Some(ipa) => ipa,
                None if unshared == 0 => return Err(MemError::InvalidRange),
                None => break,
            };
            match guest.pages.get_mut(&ipa) {
                Some(page) if page.state == GuestPageState::Shared => {
                    page.state = GuestPageState::Owned;
                    unshared += 1;
                }
                Some(_) if unshared == 0 => return Err(MemError::Permission),
                None if unshared == 0 => return Err(MemError::Fault),
                _ => break,
            }
        }
        Ok(unshared)
    }

    fn guest_relinquish_to_host(
        &self,
        vmid: Vmid,
        mc: &mut Memcache,
        ipa: u64,
    ) -> MemResult<Option<PhysAddr>> {
        if !page_aligned(ipa) {
            return Err(MemError::InvalidRange);
        }
        let mut state = self.state();
        let guest = state.guest(vmid)?;
        let page = match guest.pages.get(&ipa) {
            Some(page) => *page,
            None => return Ok(None),
        };
        if page.state != GuestPageState::Owned {
            return Err(MemError::Permission);
        }
        if page.block.is_some() {
            guest.ensure_table(mc, ipa)?;
        }
        guest.pages.remove(&ipa);
        state.poison(page.phys);
        Ok(Some(page.phys))
    }

    fn install_ioguard(
        &self,
        vmid: Vmid,
        mc: &mut Memcache,
        ipa: u64,
        nr_pages: u64,
    ) -> MemResult<u64> {
        let mut state = self.state();
        let guest = state.guest(vmid)?;
        let mut guarded = 0;
        while guarded < nr_pages {
            let ipa = match nth_page(ipa, guarded) {
                Some(ipa) => ipa,
                None if guarded == 0 => return Err(MemError::InvalidRange),
                None => break,
            };
            if guest.pages.contains_key(&ipa) {
                if guarded == 0 {
                    return Err(MemError::Permission);
                }
                break;
            }
            if let Err(e) = guest.ensure_table(mc, ipa) {
                if guarded == 0 {
                    return Err(e);
                }
                break;
            }
            guest.ioguard.insert(ipa);
            guarded += 1;
        }
        Ok(guarded)
    }

    fn is_ioguarded(&self, vmid: Vmid, ipa: u64) -> bool {
        let page = ipa & !(PAGE_SIZE - 1);
        self.state()
            .guests
            .get(&vmid)
            .map_or(false, |guest| guest.ioguard.contains(&page))
    }

    fn reclaim_page(&self, vmid: Vmid, phys: PhysAddr, ipa: u64) -> MemResult<()> {
        let mut state = self.state();
        let guest = state.guests.get_mut(&vmid).ok_or(MemError::InvalidRange)?;
        let page = match guest.pages.get(&ipa) {
            Some(page) if page.phys == phys => *page,
            Some(_) => return Err(MemError::InvalidRange),
            None => return Err(MemError::Fault),
        };
        guest.pages.remove(&ipa);
        if page.state == GuestPageState::Owned {
            state.poison(phys);
        }
        Ok(())
    }

    fn poison_page(&self, phys: PhysAddr) {
        self.state().poison(phys);
    }

    fn copy_page(&self, dst: PhysAddr, src: PhysAddr) -> MemResult<()> {
        if !page_aligned(dst.0) || !page_aligned(src.0) {
            return Err(MemError::InvalidRange);
        }
        let mut state = self.state();
        match state.contents.get(&src.0).copied() {
            Some(value) => state.contents.insert(dst.0, value),
            None => state.contents.remove(&dst.0),
        };
        Ok(())
    }
}

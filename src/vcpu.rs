// Copyright 2026 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! vCPU records, per-core loading and the vCPU half of the lifecycle.

use std::mem::size_of;
use std::sync::atomic::AtomicU8;
use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::sync::MutexGuard;

use log::debug;
use log::error;
use log::warn;
use serde::Deserialize;
use serde::Serialize;
use smccc::psci::vcpu_id_to_mpidr;
use sync::Mutex;
use zeroize::Zeroize;

use crate::hyp_req::HypRequestRing;
use crate::hypercall::HostExit;
use crate::hypervisor::Hypervisor;
use crate::mem::HostRegion;
use crate::mem::MemoryOwnership;
use crate::memcache::Memcache;
use crate::registry::VmHandle;
use crate::registry::VmRef;
use crate::traps::check_protected_features;
use crate::traps::compute_traps;
use crate::traps::Hcr;
use crate::traps::TrapConfig;
use crate::vm::VcpuFeatures;
use crate::vm::VirtualMachine;
use crate::Error;
use crate::Result;

pub use smccc::psci::AffinityState as PowerState;

/// `loaded_on` value of a vCPU no core has loaded.
const NO_CORE: usize = usize::MAX;

/// EL1h with D, A, I and F masked.
const PSTATE_RESET: u64 = 0x3c5;

/// SCTLR_EL1 RES1 bits with the MMU and caches off.
const SCTLR_RESET: u64 = 0x00c5_0078;
pub(crate) const SCTLR_EE: u64 = 1 << 25;
const SCTLR_E0E: u64 = 1 << 24;

/// MPIDR_EL1 bit 31 is RES1.
const MPIDR_RES1: u64 = 1 << 31;

/// Registers the host passes to the pVM firmware entry point: x0 through x14.
const PVMFW_BOOT_ARGS: usize = 15;
const PVMFW_BOOT_PROTOCOL_VERSION: u64 = 0;

/// Bytes of SVE state per 128-bit vector granule: 32 Z registers, 16 P registers and FFR.
const SVE_BYTES_PER_VQ: u64 = 32 * 16 + 17 * 2;
const SVE_VQ_BYTES: u32 = 16;

fn sve_state_size(max_vl: u32) -> u64 {
    (max_vl / SVE_VQ_BYTES) as u64 * SVE_BYTES_PER_VQ
}

fn vcpu_record_size() -> u64 {
    size_of::<VirtualCpu>() as u64
}

/// Host-side run state of a vCPU.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum MpState {
    Runnable,
    Stopped,
    Halted,
    Suspended,
}

/// The host's view of a vCPU's general-purpose registers.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct HostRegs {
    pub regs: [u64; 31],
    pub pc: u64,
}

/// SVE configuration requested by the host for a vCPU.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostSve {
    /// Vector length in bytes.
    pub max_vl: u32,
    /// Host buffer for the register state. Required for non-protected vCPUs.
    pub state: Option<HostRegion>,
}

/// The host's descriptor of one vCPU.
#[derive(Debug)]
pub struct HostVcpu {
    pub region: HostRegion,
    /// Buffer holding the request ring shared with the host.
    pub req_region: HostRegion,
    pub vcpu_id: u32,
    pub vcpu_idx: usize,
    pub mp_state: MpState,
    /// The host's HCRX_EL2 value for this vCPU.
    pub hcrx: u64,
    pub sve: HostSve,
    regs: Mutex<HostRegs>,
    memcache: Mutex<Memcache>,
    requests: Mutex<HypRequestRing>,
}

impl HostVcpu {
    pub fn new(region: HostRegion, req_region: HostRegion, vcpu_id: u32, vcpu_idx: usize) -> Self {
        HostVcpu {
            region,
            req_region,
            vcpu_id,
            vcpu_idx,
            mp_state: MpState::Runnable,
            hcrx: 0,
            sve: HostSve::default(),
            regs: Mutex::new(HostRegs::default()),
            memcache: Mutex::new(Memcache::new()),
            requests: Mutex::new(HypRequestRing::new(0)),
        }
    }

    pub fn regs(&self) -> MutexGuard<HostRegs> {
        self.regs.lock()
    }

    /// Pages the host offers for the vCPU's stage-2 allocations.
    pub fn memcache(&self) -> MutexGuard<Memcache> {
        self.memcache.lock()
    }

    /// Requests the hypervisor left for the host on the last exit.
    pub fn requests(&self) -> MutexGuard<HypRequestRing> {
        self.requests.lock()
    }
}

/// Guest register state owned by the hypervisor.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct VcpuContext {
    pub regs: [u64; 31],
    pub pc: u64,
    pub pstate: u64,
    pub sctlr: u64,
    pub mpidr: u64,
    pub traps: TrapConfig,
    /// Why the vCPU last returned to the host instead of the guest.
    pub last_exit: Option<HostExit>,
}

/// A power-on request waiting for the target vCPU's self-reset.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub(crate) struct ResetState {
    pub pc: u64,
    pub r0: u64,
    pub be: bool,
    pub reset: bool,
}

enum SveStorage {
    /// Donated to the hypervisor, hidden from the host.
    Hyp(Mutex<Vec<u8>>),
    /// The host's buffer, pinned.
    Host(HostRegion),
}

struct SveState {
    max_vl: u32,
    size: u64,
    storage: SveStorage,
}

/// The hypervisor's record of one vCPU.
pub struct VirtualCpu {
    vm_handle: VmHandle,
    idx: usize,
    vcpu_id: u32,
    mpidr: u64,
    protected: bool,
    features: VcpuFeatures,
    host: Arc<HostVcpu>,
    power_state: AtomicU8,
    loaded_on: AtomicUsize,
    pub(crate) reset: Mutex<ResetState>,
    ctxt: Mutex<VcpuContext>,
    pub(crate) memcache: Mutex<Memcache>,
    sve: Option<SveState>,
}

impl VirtualCpu {
    pub fn vm_handle(&self) -> VmHandle {
        self.vm_handle
    }

    pub fn idx(&self) -> usize {
        self.idx
    }

    pub fn vcpu_id(&self) -> u32 {
        self.vcpu_id
    }

    /// MPIDR affinity fields identifying this vCPU to PSCI.
    pub fn mpidr(&self) -> u64 {
        self.mpidr
    }

    pub fn is_protected(&self) -> bool {
        self.protected
    }

    pub fn features(&self) -> VcpuFeatures {
        self.features
    }

    pub fn host(&self) -> &Arc<HostVcpu> {
        &self.host
    }

    /// Current PSCI power state, or `None` if the stored value is not one.
    pub fn power_state(&self) -> Option<PowerState> {
        PowerState::n(self.power_state.load(Ordering::Acquire))
    }

    pub(crate) fn set_power_state(&self, state: PowerState) {
        self.power_state.store(state as u8, Ordering::Release);
    }

    /// Atomically moves the power state from `current` to `new`. On failure returns the state
    /// observed instead, or `None` if it was not a valid state.
    pub(crate) fn transition_power_state(
        &self,
        current: PowerState,
        new: PowerState,
    ) -> std::result::Result<(), Option<PowerState>> {
        self.power_state
            .compare_exchange(current as u8, new as u8, Ordering::AcqRel, Ordering::Acquire)
            .map(|_| ())
            .map_err(PowerState::n)
    }

    /// The core this vCPU is loaded on, if any.
    pub fn loaded_on(&self) -> Option<usize> {
        match self.loaded_on.load(Ordering::Acquire) {
            NO_CORE => None,
            cpu => Some(cpu),
        }
    }

    pub fn context(&self) -> MutexGuard<VcpuContext> {
        self.ctxt.lock()
    }

    /// Pages currently held for the vCPU's stage-2 allocations.
    pub fn memcache_len(&self) -> usize {
        self.memcache.lock().len()
    }

    pub fn sve_max_vl(&self) -> Option<u32> {
        self.sve.as_ref().map(|sve| sve.max_vl)
    }

    /// Whether the hypervisor-held SVE state is all zeroes. `None` without such state.
    pub fn sve_state_cleared(&self) -> Option<bool> {
        match &self.sve.as_ref()?.storage {
            SveStorage::Hyp(state) => Some(state.lock().iter().all(|b| *b == 0)),
            SveStorage::Host(_) => None,
        }
    }
}

/// A vCPU claimed by a core. Dropping it releases the claim and then the VM reference.
pub(crate) struct LoadedVcpu {
    pub vcpu: Arc<VirtualCpu>,
    pub vm: VmRef,
}

impl Drop for LoadedVcpu {
    fn drop(&mut self) {
        self.vcpu.loaded_on.store(NO_CORE, Ordering::Release);
    }
}

/// Per physical core state passed to every trap entry point.
pub struct CoreContext {
    cpu: usize,
    loaded: Option<LoadedVcpu>,
}

impl CoreContext {
    pub fn new(cpu: usize) -> Self {
        CoreContext { cpu, loaded: None }
    }

    pub fn cpu(&self) -> usize {
        self.cpu
    }

    pub fn loaded_vcpu(&self) -> Option<&Arc<VirtualCpu>> {
        self.loaded.as_ref().map(|l| &l.vcpu)
    }

    pub fn loaded_vm(&self) -> Option<&Arc<VirtualMachine>> {
        self.loaded.as_ref().map(|l| l.vm.vm())
    }

    pub(crate) fn loaded(&self) -> Result<&LoadedVcpu> {
        self.loaded.as_ref().ok_or(Error::NotFound)
    }
}

/// Pins taken for a vCPU during attach, dropped again unless the attach completes.
struct VcpuPins<'a> {
    mem: &'a dyn MemoryOwnership,
    regions: Vec<HostRegion>,
    accounted: Vec<u64>,
    committed: bool,
}

impl<'a> VcpuPins<'a> {
    fn new(mem: &'a dyn MemoryOwnership) -> Self {
        VcpuPins {
            mem,
            regions: Vec::new(),
            accounted: Vec::new(),
            committed: false,
        }
    }

    fn pin(&mut self, region: HostRegion) -> Result<()> {
        self.mem.pin_shared(region).map_err(|e| {
            warn!("failed to pin host vCPU memory {}: {}", region, e);
            Error::Busy
        })?;
        self.regions.push(region);
        Ok(())
    }

    fn alloc_account(&mut self, size: u64) -> Result<()> {
        self.mem.alloc_account(size)?;
        self.accounted.push(size);
        Ok(())
    }

    fn commit(mut self) {
        self.committed = true;
    }
}

impl Drop for VcpuPins<'_> {
    fn drop(&mut self) {
        if self.committed {
            return;
        }
        for size in self.accounted.drain(..).rev() {
            self.mem.free_account(size);
        }
        for region in self.regions.drain(..).rev() {
            self.mem.unpin_shared(region);
        }
    }
}

impl Hypervisor {
    /// Attaches the vCPU described by `host` to a VM as vCPU `idx`.
    ///
    /// vCPUs are attached in order: `idx` must be the next free slot.
    pub fn init_vcpu(&self, handle: VmHandle, host: &Arc<HostVcpu>, idx: usize) -> Result<()> {
        let table = self.registry.read();
        let vm = table.lookup(handle).ok_or(Error::NotFound)?;
        if vm.is_dying() {
            return Err(Error::Busy);
        }

        let mut vcpus = vm.vcpus.lock();
        if idx != vcpus.len() || idx >= vm.nr_vcpus() {
            warn!(
                "VM {}: cannot attach vCPU {} ({} of {} attached)",
                handle,
                idx,
                vcpus.len(),
                vm.nr_vcpus()
            );
            return Err(Error::InvalidArgument);
        }

        let mut pins = VcpuPins::new(self.mem.as_ref());
        pins.pin(host.region)?;
        pins.pin(host.req_region)?;

        if host.vcpu_idx != idx {
            return Err(Error::InvalidArgument);
        }
        if !matches!(host.mp_state, MpState::Runnable | MpState::Stopped) {
            return Err(Error::InvalidArgument);
        }

        *host.requests() = HypRequestRing::new(self.config.hyp_req_capacity);

        let protected = vm.is_protected();
        if protected {
            check_protected_features(vm.host().cpu_features)?;
        }
        let traps = compute_traps(
            vm.vcpu_features(),
            vm.cpu_features(),
            self.config.host_caps,
            host.hcrx,
            protected,
        );

        let sve = self.init_sve(vm, host, &mut pins)?;

        let mut reset = ResetState::default();
        let power_state = if !protected {
            // The host manages the power state of its own vCPUs.
            PowerState::On
        } else if host.mp_state == MpState::Stopped {
            PowerState::Off
        } else if vm.has_pvmfw() {
            let mut entry = vm.pvmfw_entry_vcpu.lock();
            if entry.is_some() {
                return Err(Error::InvalidArgument);
            }
            *entry = Some(idx);
            reset.reset = true;
            PowerState::OnPending
        } else {
            let regs = host.regs();
            reset.pc = regs.pc;
            reset.r0 = regs.regs[0];
            reset.reset = true;
            PowerState::OnPending
        };

        if let Err(e) = pins.alloc_account(vcpu_record_size()) {
            if power_state == PowerState::OnPending && vm.has_pvmfw() {
                vm.pvmfw_entry_vcpu.lock().take();
            }
            return Err(e);
        }

        let vcpu_id = host.vcpu_id;
        let vcpu = Arc::new(VirtualCpu {
            vm_handle: handle,
            idx,
            vcpu_id,
            mpidr: vcpu_id_to_mpidr(vcpu_id),
            protected,
            features: vm.vcpu_features(),
            host: host.clone(),
            power_state: AtomicU8::new(power_state as u8),
            loaded_on: AtomicUsize::new(NO_CORE),
            reset: Mutex::new(reset),
            ctxt: Mutex::new(VcpuContext {
                traps,
                ..Default::default()
            }),
            memcache: Mutex::new(Memcache::new()),
            sve,
        });
        vcpus.push(vcpu);
        pins.commit();

        debug!(
            "VM {}: attached vCPU {} (id {}, {:?})",
            handle, idx, vcpu_id, power_state
        );
        Ok(())
    }

    fn init_sve(
        &self,
        vm: &VirtualMachine,
        host: &HostVcpu,
        pins: &mut VcpuPins,
    ) -> Result<Option<SveState>> {
        if !vm.vcpu_features().contains(VcpuFeatures::SVE) {
            return Ok(None);
        }

        let max_vl = host.sve.max_vl.min(self.config.host_sve_max_vl);
        let size = sve_state_size(max_vl);
        if host.sve.state.is_none() && !vm.is_protected() {
            return Err(Error::InvalidArgument);
        }
        if size == 0 || max_vl > self.config.sve_max_vl {
            return Err(Error::InvalidArgument);
        }

        let storage = match host.sve.state {
            Some(buf) if !vm.is_protected() => {
                let region = HostRegion::new(buf.start, size);
                pins.pin(region)?;
                SveStorage::Host(region)
            }
            _ => {
                pins.alloc_account(size)?;
                SveStorage::Hyp(Mutex::new(vec![0; size as usize]))
            }
        };
        Ok(Some(SveState {
            max_vl,
            size,
            storage,
        }))
    }

    /// Claims vCPU `idx` of a VM for `core`.
    ///
    /// `host_hcr` carries the host's WFI/WFE trapping choice for protected vCPUs.
    pub fn load_vcpu(
        &self,
        core: &mut CoreContext,
        handle: VmHandle,
        idx: usize,
        host_hcr: u64,
    ) -> Result<()> {
        if core.loaded.is_some() {
            return Err(Error::Busy);
        }
        if core.cpu >= self.config.nr_cpus {
            return Err(Error::InvalidArgument);
        }

        let (vcpu, vm) = {
            let table = self.registry.read();
            let vm = table.lookup(handle).ok_or(Error::NotFound)?;
            if vm.is_dying() {
                return Err(Error::NotFound);
            }
            let vcpu = vm.vcpu(idx).ok_or(Error::NotFound)?;
            vcpu.loaded_on
                .compare_exchange(NO_CORE, core.cpu, Ordering::Acquire, Ordering::Relaxed)
                .map_err(|_| Error::Busy)?;
            // Only take the reference once the claim is ours.
            (vcpu, VmRef::acquire(vm))
        };

        if vm.swap_last_ran(core.cpu, vcpu.vcpu_id) {
            self.mem.flush_cpu_context(vm.vmid(), core.cpu);
        }

        if vcpu.protected {
            let wfx = Hcr::TWE | Hcr::TWI;
            let mut ctxt = vcpu.context();
            ctxt.traps.hcr.remove(wfx | Hcr::API | Hcr::APK);
            ctxt.traps.hcr |= Hcr::from_bits_truncate(host_hcr) & wfx;
        }

        core.loaded = Some(LoadedVcpu { vcpu, vm });
        Ok(())
    }

    /// Releases the vCPU loaded on `core`.
    pub fn put_vcpu(&self, core: &mut CoreContext) -> Result<()> {
        let loaded = core.loaded.take().ok_or(Error::NotFound)?;
        drop(loaded);
        Ok(())
    }

    /// Brings the loaded vCPU up to date before it enters the guest.
    ///
    /// Completes a pending power-on, hands the host's answer to the last deferred hypercall back
    /// to a protected guest, and refills the vCPU memcache after a host request exit.
    pub fn prepare_run(&self, core: &CoreContext) -> Result<()> {
        let loaded = core.loaded()?;
        if loaded.vcpu.power_state() == Some(PowerState::OnPending) {
            self.reset_loaded_vcpu(loaded)?;
        }

        let last_exit = loaded.vcpu.context().last_exit.take();
        match last_exit {
            Some(HostExit::HypRequest) => {
                loaded.vcpu.host.requests().reset();
                if let Err(e) = self.refill_memcache(&loaded.vcpu) {
                    warn!("vCPU {}: memcache refill failed: {}", loaded.vcpu.idx, e);
                }
            }
            Some(HostExit::Hypercall) if loaded.vcpu.protected => {
                self.complete_host_hypercall(loaded);
            }
            _ => {}
        }
        Ok(())
    }

    /// Moves every page the host offered into the vCPU memcache, donating each on the way.
    fn refill_memcache(&self, vcpu: &VirtualCpu) -> Result<()> {
        let mut host_mc = vcpu.host.memcache();
        let mut mc = vcpu.memcache.lock();
        while let Some((phys, order)) = host_mc.pop() {
            let region = HostRegion::pages(phys.0, 1 << order);
            if let Err(e) = self.mem.donate_to_hyp(region) {
                host_mc.push(phys, order);
                return Err(e.into());
            }
            mc.push(phys, order);
        }
        Ok(())
    }

    /// Performs the self-reset of the vCPU loaded on `core`, completing a power-on.
    pub fn reset_vcpu(&self, core: &CoreContext) -> Result<()> {
        self.reset_loaded_vcpu(core.loaded()?)
    }

    fn reset_loaded_vcpu(&self, loaded: &LoadedVcpu) -> Result<()> {
        let vcpu = &loaded.vcpu;
        let vm = &loaded.vm;
        let mut reset = vcpu.reset.lock();
        if !reset.reset || vcpu.power_state() != Some(PowerState::OnPending) {
            error!(
                "VM {}: reset of vCPU {} without a pending power-on",
                vm.handle(),
                vcpu.idx
            );
            return Err(Error::Internal);
        }

        let mut ctxt = vcpu.context();
        ctxt.regs = [0; 31];
        ctxt.pc = 0;
        ctxt.pstate = PSTATE_RESET;
        ctxt.mpidr = MPIDR_RES1 | vcpu.mpidr;
        ctxt.sctlr = SCTLR_RESET;
        if reset.be {
            ctxt.sctlr |= SCTLR_EE | SCTLR_E0E;
        }
        ctxt.pc = reset.pc;
        ctxt.regs[0] = reset.r0;

        {
            let mut entry = vm.pvmfw_entry_vcpu.lock();
            if *entry == Some(vcpu.idx) {
                if let Some(load_addr) = vm.pvmfw_load_addr() {
                    let host_regs = vcpu.host.regs();
                    ctxt.regs[..PVMFW_BOOT_ARGS]
                        .copy_from_slice(&host_regs.regs[..PVMFW_BOOT_ARGS]);
                    ctxt.regs[PVMFW_BOOT_ARGS] = PVMFW_BOOT_PROTOCOL_VERSION;
                    ctxt.pc = load_addr;
                }
                *entry = None;
                vm.enable_mmio_guard();
                debug!("VM {}: vCPU {} enters pVM firmware", vm.handle(), vcpu.idx);
            }
        }

        if let Some(SveState {
            storage: SveStorage::Hyp(state),
            ..
        }) = &vcpu.sve
        {
            state.lock().as_mut_slice().zeroize();
        }

        reset.reset = false;
        ctxt.last_exit = None;
        vcpu.set_power_state(PowerState::On);
        Ok(())
    }

    /// Unpins the host memory a vCPU kept pinned.
    pub(crate) fn unpin_host_vcpu(&self, vcpu: &VirtualCpu) {
        self.mem.unpin_shared(vcpu.host.region);
        self.mem.unpin_shared(vcpu.host.req_region);
        if let Some(SveState {
            storage: SveStorage::Host(region),
            ..
        }) = &vcpu.sve
        {
            self.mem.unpin_shared(*region);
        }
    }

    /// Returns a vCPU's memcache pages through `mc` and frees the vCPU's hypervisor memory.
    pub(crate) fn teardown_vcpu(&self, vcpu: &VirtualCpu, mc: &mut Memcache) {
        for (phys, order) in vcpu.memcache.lock().drain() {
            if order != 0 {
                warn!("vCPU {} memcache holds an order {} page", vcpu.idx, order);
            }
            mc.push(phys, order);
            self.mem.donate_to_host(HostRegion::pages(phys.0, 1 << order));
        }
        if let Some(SveState {
            storage: SveStorage::Hyp(_),
            size,
            ..
        }) = &vcpu.sve
        {
            self.mem.free_account(*size);
        }
        self.mem.free_account(vcpu_record_size());
    }
}

// Copyright 2026 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Fixtures shared by the integration tests: a hypervisor over `SimMemory` and a bump allocator
//! standing in for host memory.

#![allow(dead_code)]

use std::sync::Arc;

use pkvm::sim::SimMemory;
use pkvm::CoreContext;
use pkvm::HostRegion;
use pkvm::HostVcpu;
use pkvm::HostVm;
use pkvm::HvcExit;
use pkvm::HypConfig;
use pkvm::Hypervisor;
use pkvm::VmHandle;
use pkvm::Vmid;
use pkvm::PAGE_SIZE;

/// Program counter guests are assumed to trap from.
pub const GUEST_PC: u64 = 0x8000_1000;

pub struct TestHyp {
    pub hyp: Hypervisor,
    pub sim: Arc<SimMemory>,
    next_host_page: u64,
}

pub fn setup(cfg: HypConfig) -> TestHyp {
    setup_with(cfg, SimMemory::new())
}

pub fn setup_with(cfg: HypConfig, sim: SimMemory) -> TestHyp {
    let _ = env_logger::builder().is_test(true).try_init();
    let sim = Arc::new(sim);
    let hyp = Hypervisor::new(cfg, sim.clone()).unwrap();
    hyp.init_vm_table().unwrap();
    TestHyp {
        hyp,
        sim,
        next_host_page: 0x1_0000_0000,
    }
}

impl TestHyp {
    /// Hands out fresh, page-aligned host memory.
    pub fn host_pages(&mut self, nr_pages: u64) -> HostRegion {
        let region = HostRegion::pages(self.next_host_page, nr_pages);
        self.next_host_page += nr_pages * PAGE_SIZE;
        region
    }

    pub fn host_vm(&mut self, nr_vcpus: usize, protected: bool) -> HostVm {
        let mut host = HostVm::new(self.host_pages(1), nr_vcpus);
        host.protected = protected;
        host
    }

    /// Region donated for a stage-2 root.
    pub fn pgd(&mut self) -> HostRegion {
        let size = self.hyp.config().stage2_pgd_size();
        self.host_pages(size / PAGE_SIZE)
    }

    pub fn create_vm(&mut self, host: HostVm) -> (Arc<HostVm>, VmHandle) {
        let host = Arc::new(host);
        let pgd = self.pgd();
        let handle = self.hyp.init_vm(&host, pgd.start).unwrap();
        (host, handle)
    }

    pub fn host_vcpu(&mut self, idx: usize) -> HostVcpu {
        HostVcpu::new(self.host_pages(1), self.host_pages(1), idx as u32, idx)
    }

    pub fn attach(&mut self, handle: VmHandle, host: HostVcpu) -> pkvm::Result<Arc<HostVcpu>> {
        let idx = host.vcpu_idx;
        let host = Arc::new(host);
        self.hyp.init_vcpu(handle, &host, idx)?;
        Ok(host)
    }

    /// Creates a VM and attaches `nr_vcpus` runnable vCPUs to it.
    pub fn vm_with_vcpus(
        &mut self,
        nr_vcpus: usize,
        protected: bool,
    ) -> (Arc<HostVm>, VmHandle, Vec<Arc<HostVcpu>>) {
        let host = self.host_vm(nr_vcpus, protected);
        let (host, handle) = self.create_vm(host);
        let vcpus = (0..nr_vcpus)
            .map(|idx| {
                let vcpu = self.host_vcpu(idx);
                self.attach(handle, vcpu).unwrap()
            })
            .collect();
        (host, handle, vcpus)
    }

    pub fn vmid(&self, handle: VmHandle) -> Vmid {
        self.hyp.get_vm(handle).unwrap().vmid()
    }

    /// Loads a vCPU on `cpu` and prepares it for guest entry.
    pub fn run(&self, cpu: usize, handle: VmHandle, idx: usize) -> CoreContext {
        let mut core = CoreContext::new(cpu);
        self.hyp.load_vcpu(&mut core, handle, idx, 0).unwrap();
        self.hyp.prepare_run(&core).unwrap();
        core
    }
}

/// Issues an HVC from the guest loaded on `core` and returns the exit and x0..x3.
pub fn hvc(hyp: &Hypervisor, core: &CoreContext, fid: u32, args: [u64; 3]) -> (HvcExit, [u64; 4]) {
    let vcpu = core.loaded_vcpu().unwrap();
    {
        let mut ctxt = vcpu.context();
        ctxt.regs[0] = fid as u64;
        ctxt.regs[1..4].copy_from_slice(&args);
        ctxt.pc = GUEST_PC;
    }
    let exit = hyp.handle_hvc64(core).unwrap();
    let ctxt = vcpu.context();
    (exit, [ctxt.regs[0], ctxt.regs[1], ctxt.regs[2], ctxt.regs[3]])
}

/// Two's complement register value of a negative SMCCC or PSCI status.
pub fn status(code: i64) -> u64 {
    code as u64
}

// Copyright 2026 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! VM and vCPU lifecycle scenarios driven through the public API.

mod common;

use std::sync::Arc;
use std::sync::Barrier;
use std::thread;

use pkvm::sim::SimMemory;
use pkvm::traps::CpuFeatures;
use pkvm::traps::Hcr;
use pkvm::traps::Mdcr;
use pkvm::CoreContext;
use pkvm::Error;
use pkvm::HostRegion;
use pkvm::HostSve;
use pkvm::HypConfig;
use pkvm::Hypervisor;
use pkvm::MpState;
use pkvm::PhysAddr;
use pkvm::PowerState;
use pkvm::PvmFirmware;
use pkvm::VcpuFeatures;
use pkvm::VmHandle;
use pkvm::VmState;
use pkvm::PAGE_SIZE;

use crate::common::setup;
use crate::common::setup_with;

const PVMFW_LOAD_ADDR: u64 = 0x7fe0_0000;

#[test]
fn rejects_invalid_config() {
    let cfg = HypConfig {
        handle_offset: 0,
        ..Default::default()
    };
    assert!(Hypervisor::new(cfg, Arc::new(SimMemory::new())).is_err());
}

#[test]
fn vm_table_must_be_initialized() {
    let sim = Arc::new(SimMemory::new());
    let hyp = Hypervisor::new(HypConfig::default(), sim.clone()).unwrap();
    let host = Arc::new(pkvm::HostVm::new(HostRegion::pages(0x1000_0000, 1), 1));

    assert_eq!(hyp.init_vm(&host, 0x2000_0000), Err(Error::Uninitialized));
    assert_eq!(sim.pin_count(host.region.start), 0);
    assert!(!sim.is_hyp_owned(PhysAddr(0x2000_0000)));
    assert_eq!(sim.accounted(), 0);

    hyp.init_vm_table().unwrap();
    assert_eq!(hyp.init_vm_table(), Err(Error::Busy));
    hyp.init_vm(&host, 0x2000_0000).unwrap();
}

#[test]
fn init_vm_rejects_bad_input() {
    let mut t = setup(HypConfig::default());

    let host = Arc::new(t.host_vm(0, true));
    let pgd = t.pgd();
    assert_eq!(t.hyp.init_vm(&host, pgd.start), Err(Error::InvalidArgument));
    assert_eq!(t.sim.pin_count(host.region.start), 0);

    let host = Arc::new(t.host_vm(1, true));
    assert_eq!(
        t.hyp.init_vm(&host, pgd.start + 0x800),
        Err(Error::InvalidArgument)
    );
    assert_eq!(t.sim.pin_count(host.region.start), 0);
    assert_eq!(t.sim.accounted(), 0);

    // The host cannot hand over memory it has pinned for the hypervisor.
    assert_eq!(
        t.hyp.init_vm(&host, host.region.start),
        Err(Error::InvalidArgument)
    );
    assert_eq!(t.hyp.nr_vms(), 0);
}

#[test]
fn init_vm_unwinds_on_exhaustion() {
    let cfg = HypConfig {
        max_vms: 1,
        ..Default::default()
    };
    let mut t = setup(cfg);
    let first = t.host_vm(1, false);
    let (_, handle) = t.create_vm(first);
    assert_eq!(handle, VmHandle(0x1000));

    let host = Arc::new(t.host_vm(1, false));
    let pgd = t.pgd();
    let cleared = t.sim.cleared_pages();
    assert_eq!(
        t.hyp.init_vm(&host, pgd.start),
        Err(Error::ResourceExhausted)
    );
    assert!(!t.sim.is_hyp_owned(PhysAddr(pgd.start)));
    assert_eq!(t.sim.cleared_pages(), cleared + pgd.size / PAGE_SIZE);
    assert_eq!(t.sim.pin_count(host.region.start), 0);
    assert_eq!(t.hyp.nr_vms(), 1);
}

#[test]
fn init_vm_unwinds_on_stage2_failure() {
    let mut t = setup(HypConfig::default());
    let host = Arc::new(t.host_vm(1, true));
    let pgd = t.pgd();
    t.sim.fail_next_stage2();
    assert_eq!(
        t.hyp.init_vm(&host, pgd.start),
        Err(Error::ResourceExhausted)
    );
    assert_eq!(t.hyp.nr_vms(), 0);
    assert!(t.hyp.get_vm(VmHandle(0x1000)).is_none());
    assert!(!t.sim.is_hyp_owned(PhysAddr(pgd.start)));
    assert_eq!(t.sim.accounted(), 0);

    // The slot is usable again.
    assert_eq!(t.hyp.init_vm(&host, pgd.start), Ok(VmHandle(0x1000)));
}

#[test]
fn init_vm_unwinds_on_hyp_heap_exhaustion() {
    let mut t = setup_with(HypConfig::default(), SimMemory::new().with_hyp_budget(0));
    let host = Arc::new(t.host_vm(1, true));
    let pgd = t.pgd();
    assert_eq!(
        t.hyp.init_vm(&host, pgd.start),
        Err(Error::ResourceExhausted)
    );
    assert_eq!(t.sim.pin_count(host.region.start), 0);
    assert!(!t.sim.is_hyp_owned(PhysAddr(pgd.start)));
}

#[test]
fn handles_and_vmids() {
    let mut t = setup(HypConfig::default());
    let a = t.host_vm(1, false);
    let (_, a) = t.create_vm(a);
    let b = t.host_vm(1, true);
    let (_, b) = t.create_vm(b);
    assert_eq!(a, VmHandle(0x1000));
    assert_eq!(b, VmHandle(0x1001));
    assert_eq!(t.vmid(a), 1);
    assert_eq!(t.vmid(b), 2);

    t.hyp.start_teardown_vm(a).unwrap();
    t.hyp.finalize_teardown_vm(a).unwrap();
    assert!(t.hyp.get_vm(a).is_none());
    assert!(t.hyp.get_vm(VmHandle(0)).is_none());
    assert!(t.hyp.get_vm(VmHandle(u32::MAX)).is_none());

    // A free slot is reused once the old VM is gone.
    let c = t.host_vm(1, false);
    let (_, c) = t.create_vm(c);
    assert_eq!(c, a);
}

#[test]
fn vcpus_attach_in_order() {
    let mut t = setup(HypConfig::default());
    let host = t.host_vm(1, true);
    let (_, one) = t.create_vm(host);

    let vcpu = t.host_vcpu(0);
    t.attach(one, vcpu).unwrap();
    let vcpu = t.host_vcpu(0);
    let region = vcpu.region;
    assert_eq!(t.attach(one, vcpu).err(), Some(Error::InvalidArgument));
    assert_eq!(t.sim.pin_count(region.start), 0);

    let host = t.host_vm(3, true);
    let (_, three) = t.create_vm(host);
    let vcpu = t.host_vcpu(2);
    assert_eq!(t.attach(three, vcpu).err(), Some(Error::InvalidArgument));
    for idx in 0..3 {
        let vcpu = t.host_vcpu(idx);
        t.attach(three, vcpu).unwrap();
    }
    let vcpu = t.host_vcpu(3);
    assert_eq!(t.attach(three, vcpu).err(), Some(Error::InvalidArgument));

    let vm = t.hyp.get_vm(three).unwrap();
    assert_eq!(vm.nr_attached(), vm.nr_vcpus());
    for idx in 0..3 {
        assert_eq!(vm.vcpu(idx).unwrap().idx(), idx);
    }

    let vcpu = t.host_vcpu(0);
    assert_eq!(
        t.attach(VmHandle(0x2000), vcpu).err(),
        Some(Error::NotFound)
    );
}

#[test]
fn init_vcpu_validates_host_descriptor() {
    let mut t = setup(HypConfig::default());
    let host = t.host_vm(2, true);
    let (_, handle) = t.create_vm(host);

    let mut vcpu = t.host_vcpu(0);
    vcpu.mp_state = MpState::Halted;
    let region = vcpu.region;
    assert_eq!(t.attach(handle, vcpu).err(), Some(Error::InvalidArgument));
    assert_eq!(t.sim.pin_count(region.start), 0);

    // Declared index disagrees with the slot being attached.
    let vcpu = Arc::new(t.host_vcpu(1));
    assert_eq!(t.hyp.init_vcpu(handle, &vcpu, 0), Err(Error::InvalidArgument));
    assert_eq!(t.sim.pin_count(vcpu.req_region.start), 0);

    t.hyp.start_teardown_vm(handle).unwrap();
    let vcpu = t.host_vcpu(0);
    assert_eq!(t.attach(handle, vcpu).err(), Some(Error::Busy));
}

#[test]
fn protected_features_are_checked() {
    let mut t = setup(HypConfig::default());
    let mut host = t.host_vm(1, true);
    host.cpu_features = CpuFeatures::FP | CpuFeatures::ADVSIMD | CpuFeatures::AARCH32_EL0;
    let (_, handle) = t.create_vm(host);
    let vcpu = t.host_vcpu(0);
    let region = vcpu.region;
    assert_eq!(
        t.attach(handle, vcpu).err(),
        Some(Error::IncompatibleConfiguration)
    );
    assert_eq!(t.sim.pin_count(region.start), 0);

    // The host decides what its own VMs may run.
    let mut host = t.host_vm(1, false);
    host.cpu_features = CpuFeatures::AARCH32_EL0;
    let (_, handle) = t.create_vm(host);
    let vcpu = t.host_vcpu(0);
    t.attach(handle, vcpu).unwrap();
}

#[test]
fn protected_cpu_features_ignore_host_requests() {
    let mut t = setup(HypConfig::default());
    let mut host = t.host_vm(1, true);
    host.cpu_features |= CpuFeatures::SPE | CpuFeatures::MTE | CpuFeatures::AMU;
    let (_, handle) = t.create_vm(host);
    let vcpu = t.host_vcpu(0);
    t.attach(handle, vcpu).unwrap();

    let vm = t.hyp.get_vm(handle).unwrap();
    assert!(!vm
        .cpu_features()
        .intersects(CpuFeatures::SPE | CpuFeatures::MTE | CpuFeatures::AMU));
    let traps = vm.vcpu(0).unwrap().context().traps;
    assert!(traps.mdcr.contains(Mdcr::TPMS));

    // Non-protected VMs keep whatever the host asked for.
    let mut host = t.host_vm(1, false);
    host.cpu_features |= CpuFeatures::SPE;
    let (_, handle) = t.create_vm(host);
    let vm = t.hyp.get_vm(handle).unwrap();
    assert!(vm.cpu_features().contains(CpuFeatures::SPE));
}

#[test]
fn initial_power_states() {
    let mut t = setup(HypConfig::default());
    let host = t.host_vm(2, true);
    let (_, pvm) = t.create_vm(host);
    let vcpu = t.host_vcpu(0);
    t.attach(pvm, vcpu).unwrap();
    let mut vcpu = t.host_vcpu(1);
    vcpu.mp_state = MpState::Stopped;
    t.attach(pvm, vcpu).unwrap();

    let vm = t.hyp.get_vm(pvm).unwrap();
    assert_eq!(vm.vcpu(0).unwrap().power_state(), Some(PowerState::OnPending));
    assert_eq!(vm.vcpu(1).unwrap().power_state(), Some(PowerState::Off));

    let (_, npvm, _) = t.vm_with_vcpus(1, false);
    let vm = t.hyp.get_vm(npvm).unwrap();
    assert_eq!(vm.vcpu(0).unwrap().power_state(), Some(PowerState::On));
}

#[test]
fn protected_vcpu_boots_from_host_registers() {
    let mut t = setup(HypConfig::default());
    let host = t.host_vm(1, true);
    let (_, handle) = t.create_vm(host);
    let vcpu = t.host_vcpu(0);
    {
        let mut regs = vcpu.regs();
        regs.pc = 0x8008_0000;
        regs.regs[0] = 0x4000_0000;
        regs.regs[1] = 0xdead;
    }
    t.attach(handle, vcpu).unwrap();

    let core = t.run(0, handle, 0);
    let vcpu = core.loaded_vcpu().unwrap().clone();
    assert_eq!(vcpu.power_state(), Some(PowerState::On));
    {
        let ctxt = vcpu.context();
        assert_eq!(ctxt.pc, 0x8008_0000);
        assert_eq!(ctxt.regs[0], 0x4000_0000);
        assert_eq!(ctxt.regs[1], 0);
        assert_eq!(ctxt.pstate, 0x3c5);
        assert_eq!(ctxt.mpidr, 1 << 31);
    }

    // The reset request was consumed.
    vcpu.context().pc = 0x1234;
    assert_eq!(t.hyp.reset_vcpu(&core), Err(Error::Internal));
    assert_eq!(vcpu.context().pc, 0x1234);
    assert_eq!(vcpu.power_state(), Some(PowerState::On));
}

#[test]
fn firmware_entry_vcpu() {
    let mut t = setup(HypConfig::default());
    let mut host = t.host_vm(3, true);
    host.pvmfw_load_addr = Some(PVMFW_LOAD_ADDR);
    let (_, handle) = t.create_vm(host);

    let vcpu = t.host_vcpu(0);
    {
        let mut regs = vcpu.regs();
        for (i, reg) in regs.regs.iter_mut().enumerate() {
            *reg = i as u64 + 100;
        }
    }
    t.attach(handle, vcpu).unwrap();
    // Only one vCPU enters the firmware.
    let vcpu = t.host_vcpu(1);
    assert_eq!(t.attach(handle, vcpu).err(), Some(Error::InvalidArgument));
    let mut vcpu = t.host_vcpu(1);
    vcpu.mp_state = MpState::Stopped;
    t.attach(handle, vcpu).unwrap();

    assert!(!t.hyp.get_vm(handle).unwrap().mmio_guard_enabled());
    let core = t.run(0, handle, 0);
    let vcpu = core.loaded_vcpu().unwrap();
    {
        let ctxt = vcpu.context();
        assert_eq!(ctxt.pc, PVMFW_LOAD_ADDR);
        for i in 0..15 {
            assert_eq!(ctxt.regs[i], i as u64 + 100);
        }
        assert_eq!(ctxt.regs[15], 0);
        assert_eq!(ctxt.regs[16], 0);
    }
    assert!(core.loaded_vm().unwrap().mmio_guard_enabled());
}

#[test]
fn firmware_pages() {
    let fw = PvmFirmware::new(PhysAddr(0x9000_0000), 3 * PAGE_SIZE);
    let sim = SimMemory::new();
    sim.write_page(PhysAddr(0x9000_1000), 0xf1);
    sim.write_page(PhysAddr(0x9000_2000), 0xf2);
    let mut t = setup_with(HypConfig::default(), sim);
    t.hyp = Hypervisor::new(HypConfig::default(), t.sim.clone())
        .unwrap()
        .with_pvmfw(fw);
    t.hyp.init_vm_table().unwrap();

    let mut host = t.host_vm(1, true);
    host.pvmfw_load_addr = Some(PVMFW_LOAD_ADDR);
    let (_, handle) = t.create_vm(host);

    t.hyp
        .load_pvmfw_pages(handle, PVMFW_LOAD_ADDR + PAGE_SIZE, PhysAddr(0x5000_0000), PAGE_SIZE)
        .unwrap();
    assert_eq!(t.sim.read_page(PhysAddr(0x5000_0000)), 0xf1);

    // Clamped to the end of the image.
    t.hyp
        .load_pvmfw_pages(
            handle,
            PVMFW_LOAD_ADDR + 2 * PAGE_SIZE,
            PhysAddr(0x5000_1000),
            16 * PAGE_SIZE,
        )
        .unwrap();
    assert_eq!(t.sim.read_page(PhysAddr(0x5000_1000)), 0xf2);
    assert_eq!(t.sim.read_page(PhysAddr(0x5000_2000)), 0);

    for ipa in [PVMFW_LOAD_ADDR - PAGE_SIZE, PVMFW_LOAD_ADDR + 3 * PAGE_SIZE] {
        assert_eq!(
            t.hyp
                .load_pvmfw_pages(handle, ipa, PhysAddr(0x5000_0000), PAGE_SIZE),
            Err(Error::InvalidArgument)
        );
    }
    assert_eq!(
        t.hyp
            .load_pvmfw_pages(handle, PVMFW_LOAD_ADDR + 0x800, PhysAddr(0x5000_0000), PAGE_SIZE),
        Err(Error::InvalidArgument)
    );

    t.hyp.poison_pvmfw_pages();
    assert_eq!(t.sim.poisoned_pages(), 3);
    assert_eq!(t.sim.read_page(PhysAddr(0x9000_1000)), 0);
}

#[test]
fn sve_state() {
    let mut t = setup(HypConfig::default());
    let mut host = t.host_vm(1, true);
    host.vcpu_features |= VcpuFeatures::SVE;
    host.cpu_features |= CpuFeatures::SVE;
    let (_, pvm) = t.create_vm(host);
    let before = t.sim.accounted();
    let mut vcpu = t.host_vcpu(0);
    vcpu.sve = HostSve {
        max_vl: 64,
        state: None,
    };
    t.attach(pvm, vcpu).unwrap();
    let vm = t.hyp.get_vm(pvm).unwrap();
    let vcpu = vm.vcpu(0).unwrap();
    assert_eq!(vcpu.sve_max_vl(), Some(64));
    assert_eq!(vcpu.sve_state_cleared(), Some(true));
    // Four vector granules of register state live in hypervisor memory.
    assert!(t.sim.accounted() - before > 4 * 546);
    drop(vm);

    let mut host = t.host_vm(1, false);
    host.vcpu_features |= VcpuFeatures::SVE;
    let (_, npvm) = t.create_vm(host);
    let mut vcpu = t.host_vcpu(0);
    vcpu.sve.max_vl = 32;
    assert_eq!(t.attach(npvm, vcpu).err(), Some(Error::InvalidArgument));
    let buf = t.host_pages(1);
    let mut vcpu = t.host_vcpu(0);
    vcpu.sve = HostSve {
        max_vl: 32,
        state: Some(buf),
    };
    t.attach(npvm, vcpu).unwrap();
    assert_eq!(t.sim.pin_count(buf.start), 1);
    assert_eq!(
        t.hyp.get_vm(npvm).unwrap().vcpu(0).unwrap().sve_state_cleared(),
        None
    );

    t.hyp.start_teardown_vm(npvm).unwrap();
    t.hyp.finalize_teardown_vm(npvm).unwrap();
    assert_eq!(t.sim.pin_count(buf.start), 0);
}

#[test]
fn sve_vector_length_is_capped() {
    let cfg = HypConfig {
        sve_max_vl: 64,
        host_sve_max_vl: 128,
        ..Default::default()
    };
    let mut t = setup(cfg);
    let mut host = t.host_vm(1, true);
    host.vcpu_features |= VcpuFeatures::SVE;
    host.cpu_features |= CpuFeatures::SVE;
    let (_, handle) = t.create_vm(host);
    let mut vcpu = t.host_vcpu(0);
    vcpu.sve.max_vl = 256;
    assert_eq!(t.attach(handle, vcpu).err(), Some(Error::InvalidArgument));
    let mut vcpu = t.host_vcpu(0);
    vcpu.sve.max_vl = 48;
    t.attach(handle, vcpu).unwrap();
}

#[test]
fn teardown_waits_for_references() {
    let mut t = setup(HypConfig::default());
    let (_, handle, _) = t.vm_with_vcpus(1, true);

    assert_eq!(t.hyp.finalize_teardown_vm(handle), Err(Error::Busy));

    let mut core = t.run(0, handle, 0);
    assert_eq!(t.hyp.get_vm(handle).unwrap().refcount(), 2);
    assert_eq!(t.hyp.start_teardown_vm(handle), Err(Error::Busy));
    assert_eq!(t.hyp.finalize_teardown_vm(handle), Err(Error::Busy));

    t.hyp.put_vcpu(&mut core).unwrap();
    assert_eq!(t.hyp.put_vcpu(&mut core), Err(Error::NotFound));
    t.hyp.start_teardown_vm(handle).unwrap();
    assert_eq!(t.hyp.start_teardown_vm(handle), Err(Error::InvalidArgument));

    // Dying VMs cannot be loaded or referenced.
    assert_eq!(
        t.hyp.load_vcpu(&mut core, handle, 0, 0),
        Err(Error::NotFound)
    );
    assert!(t.hyp.get_vm(handle).is_none());

    t.hyp.finalize_teardown_vm(handle).unwrap();
    assert_eq!(t.hyp.finalize_teardown_vm(handle), Err(Error::NotFound));
    assert_eq!(t.hyp.start_teardown_vm(handle), Err(Error::NotFound));
}

#[test]
fn teardown_returns_memory() {
    let mut t = setup(HypConfig::default());
    let mut host = t.host_vm(2, true);
    host.vcpu_features |= VcpuFeatures::SVE;
    host.cpu_features |= CpuFeatures::SVE;
    let (host, handle) = t.create_vm(host);
    let mut vcpus = Vec::new();
    for idx in 0..2 {
        let mut vcpu = t.host_vcpu(idx);
        vcpu.sve.max_vl = 16;
        vcpus.push(t.attach(handle, vcpu).unwrap());
    }
    let vmid = t.vmid(handle);
    let vm = t.hyp.get_vm(handle).unwrap().vm().clone();
    assert_eq!(vm.refcount(), 0);
    assert!(t.sim.accounted() > 0);
    assert_eq!(t.sim.pin_count(host.region.start), 1);

    t.hyp.start_teardown_vm(handle).unwrap();
    assert_eq!(vm.state(), VmState::Dying);
    t.hyp.finalize_teardown_vm(handle).unwrap();
    assert_eq!(vm.state(), VmState::Gone);
    assert_eq!(vm.nr_attached(), 0);

    assert_eq!(t.hyp.nr_vms(), 0);
    assert_eq!(t.sim.accounted(), 0);
    assert_eq!(t.sim.pin_count(host.region.start), 0);
    for vcpu in &vcpus {
        assert_eq!(t.sim.pin_count(vcpu.region.start), 0);
        assert_eq!(t.sim.pin_count(vcpu.req_region.start), 0);
    }
    assert_eq!(t.sim.vmid_flushes(vmid), 1);
    assert!(!t.sim.has_stage2(vmid));

    // The stage-2 root comes back through the teardown memcache.
    let mc = host.teardown_memcache();
    let pgd_pages = t.hyp.config().stage2_pgd_size() / PAGE_SIZE;
    assert_eq!(mc.len() as u64, pgd_pages);
    for (phys, order) in mc.iter() {
        assert_eq!(*order, 0);
        assert!(!t.sim.is_hyp_owned(*phys));
    }
}

#[test]
fn dying_guest_pages_are_reclaimed() {
    let mut t = setup(HypConfig::default());
    let (_, handle, _) = t.vm_with_vcpus(1, true);
    let vmid = t.vmid(handle);
    let ipa = 0x4000_0000;
    let page = PhysAddr(0x3_0000_0000);
    t.sim.map_guest_page(vmid, ipa, page).unwrap();
    t.sim.write_page(page, 0x5ec7e7);

    assert_eq!(
        t.hyp.reclaim_dying_guest_page(handle, page, ipa),
        Err(Error::InvalidArgument)
    );
    t.hyp.start_teardown_vm(handle).unwrap();
    assert_eq!(
        t.hyp.reclaim_dying_guest_page(handle, page, ipa + PAGE_SIZE),
        Err(Error::InvalidArgument)
    );
    t.hyp.reclaim_dying_guest_page(handle, page, ipa).unwrap();
    assert_eq!(t.sim.read_page(page), 0);
    assert_eq!(t.sim.poisoned_pages(), 1);
    assert_eq!(
        t.hyp
            .reclaim_dying_guest_page(VmHandle(0x1fff), page, ipa),
        Err(Error::NotFound)
    );
    t.hyp.finalize_teardown_vm(handle).unwrap();
}

#[test]
fn load_errors() {
    let mut t = setup(HypConfig::default());
    let (_, handle, _) = t.vm_with_vcpus(2, false);
    let nr_cpus = t.hyp.config().nr_cpus;

    let mut core = CoreContext::new(nr_cpus);
    assert_eq!(
        t.hyp.load_vcpu(&mut core, handle, 0, 0),
        Err(Error::InvalidArgument)
    );

    let mut core = CoreContext::new(0);
    assert_eq!(
        t.hyp.load_vcpu(&mut core, handle, 2, 0),
        Err(Error::NotFound)
    );
    assert_eq!(
        t.hyp.load_vcpu(&mut core, VmHandle(0x1fff), 0, 0),
        Err(Error::NotFound)
    );
    assert_eq!(t.hyp.prepare_run(&core), Err(Error::NotFound));

    t.hyp.load_vcpu(&mut core, handle, 0, 0).unwrap();
    assert_eq!(
        t.hyp.load_vcpu(&mut core, handle, 1, 0),
        Err(Error::Busy)
    );
    let mut other = CoreContext::new(1);
    assert_eq!(
        t.hyp.load_vcpu(&mut other, handle, 0, 0),
        Err(Error::Busy)
    );
    t.hyp.load_vcpu(&mut other, handle, 1, 0).unwrap();

    let vcpu = core.loaded_vcpu().unwrap().clone();
    assert_eq!(vcpu.loaded_on(), Some(0));
    t.hyp.put_vcpu(&mut core).unwrap();
    assert_eq!(vcpu.loaded_on(), None);
    assert!(core.loaded_vcpu().is_none());
}

#[test]
fn concurrent_loads_are_exclusive() {
    let mut t = setup(HypConfig::default());
    let (_, handle, _) = t.vm_with_vcpus(1, true);
    let hyp = &t.hyp;
    let nr_cpus = hyp.config().nr_cpus;
    let barrier = Barrier::new(nr_cpus);

    let results: Vec<pkvm::Result<()>> = thread::scope(|s| {
        let threads: Vec<_> = (0..nr_cpus)
            .map(|cpu| {
                let barrier = &barrier;
                s.spawn(move || {
                    let mut core = CoreContext::new(cpu);
                    barrier.wait();
                    let res = hyp.load_vcpu(&mut core, handle, 0, 0);
                    // Keep every claim alive until all cores have tried.
                    barrier.wait();
                    res
                })
            })
            .collect();
        threads.into_iter().map(|h| h.join().unwrap()).collect()
    });

    assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 1);
    assert!(results
        .iter()
        .all(|r| matches!(r, Ok(()) | Err(Error::Busy))));
    // Every core has dropped its context.
    let vm = hyp.get_vm(handle).unwrap();
    assert_eq!(vm.refcount(), 1);
    assert_eq!(vm.vcpu(0).unwrap().loaded_on(), None);
}

#[test]
fn switching_vcpus_flushes_core_context() {
    let mut t = setup(HypConfig::default());
    let (_, handle, _) = t.vm_with_vcpus(2, false);
    let vmid = t.vmid(handle);
    let mut core = CoreContext::new(3);

    t.hyp.load_vcpu(&mut core, handle, 0, 0).unwrap();
    t.hyp.put_vcpu(&mut core).unwrap();
    assert_eq!(t.sim.cpu_flushes(vmid, 3), 1);
    t.hyp.load_vcpu(&mut core, handle, 0, 0).unwrap();
    t.hyp.put_vcpu(&mut core).unwrap();
    assert_eq!(t.sim.cpu_flushes(vmid, 3), 1);
    t.hyp.load_vcpu(&mut core, handle, 1, 0).unwrap();
    t.hyp.put_vcpu(&mut core).unwrap();
    assert_eq!(t.sim.cpu_flushes(vmid, 3), 2);
}

#[test]
fn protected_load_takes_host_wfx_traps() {
    let mut t = setup(HypConfig::default());
    let (_, handle, _) = t.vm_with_vcpus(1, true);
    let mut core = CoreContext::new(0);
    t.hyp
        .load_vcpu(&mut core, handle, 0, Hcr::TWI.bits())
        .unwrap();
    let traps = core.loaded_vcpu().unwrap().context().traps;
    assert!(traps.hcr.contains(Hcr::TWI | Hcr::RW | Hcr::TID3));
    assert!(!traps.hcr.contains(Hcr::TWE));
    assert!(!traps.hcr.intersects(Hcr::API | Hcr::APK));
}

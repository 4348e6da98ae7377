// Copyright 2026 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use std::sync::Arc;

use anyhow::Context;
use log::info;

use crate::config::HypConfig;
use crate::mem::MemoryOwnership;
use crate::pvmfw::PvmFirmware;
use crate::registry::VmHandle;
use crate::registry::VmRef;
use crate::registry::VmRegistry;
use crate::trng::SecureMonitor;
use crate::Result;

/// Entry point for every host request and guest trap.
///
/// Owns the VM table and the collaborators that perform memory ownership transitions and secure
/// monitor calls. All methods take `&self` and may be called from any number of cores at once.
pub struct Hypervisor {
    pub(crate) config: HypConfig,
    pub(crate) mem: Arc<dyn MemoryOwnership>,
    pub(crate) registry: VmRegistry,
    pub(crate) monitor: Option<Arc<dyn SecureMonitor>>,
    pub(crate) pvmfw: Option<PvmFirmware>,
}

impl Hypervisor {
    pub fn new(config: HypConfig, mem: Arc<dyn MemoryOwnership>) -> anyhow::Result<Self> {
        config.validate().context("invalid hypervisor configuration")?;
        let registry = VmRegistry::new(config.max_vms, config.handle_offset);
        Ok(Hypervisor {
            config,
            mem,
            registry,
            monitor: None,
            pvmfw: None,
        })
    }

    /// Routes TRNG calls to `monitor`.
    pub fn with_secure_monitor(mut self, monitor: Arc<dyn SecureMonitor>) -> Self {
        self.monitor = Some(monitor);
        self
    }

    pub fn with_pvmfw(mut self, pvmfw: PvmFirmware) -> Self {
        self.pvmfw = Some(pvmfw);
        self
    }

    /// Allocates the VM table. Must be called exactly once before any VM is created.
    pub fn init_vm_table(&self) -> Result<()> {
        self.registry.init()?;
        info!(
            "VM table ready: {} slots from handle {:#x}",
            self.config.max_vms, self.config.handle_offset
        );
        Ok(())
    }

    pub fn config(&self) -> &HypConfig {
        &self.config
    }

    /// Takes a counted reference to a live VM. Teardown of the VM fails while it is held.
    pub fn get_vm(&self, handle: VmHandle) -> Option<VmRef> {
        self.registry.get(handle)
    }

    /// Number of VMs in the table, dying ones included.
    pub fn nr_vms(&self) -> usize {
        self.registry.read().len()
    }
}

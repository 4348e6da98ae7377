// Copyright 2026 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! The protected VM firmware image held by the hypervisor.

use log::debug;
use log::warn;
use serde::Deserialize;
use serde::Serialize;

use crate::hypervisor::Hypervisor;
use crate::mem::page_aligned;
use crate::mem::PhysAddr;
use crate::mem::PAGE_SHIFT;
use crate::mem::PAGE_SIZE;
use crate::registry::VmHandle;
use crate::Error;
use crate::Result;

/// Location of the firmware image in hypervisor memory.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PvmFirmware {
    pub base: PhysAddr,
    pub size: u64,
}

impl PvmFirmware {
    pub fn new(base: PhysAddr, size: u64) -> Self {
        PvmFirmware { base, size }
    }

    fn nr_pages(&self) -> u64 {
        self.size >> PAGE_SHIFT
    }
}

impl Hypervisor {
    /// Copies the firmware pages backing guest address `ipa` into the guest page at `phys`.
    ///
    /// At most `size` bytes are copied, clamped to the end of the image.
    pub fn load_pvmfw_pages(
        &self,
        handle: VmHandle,
        ipa: u64,
        phys: PhysAddr,
        size: u64,
    ) -> Result<()> {
        let fw = self.pvmfw.as_ref().ok_or(Error::NotFound)?;
        let vm = self.registry.get(handle).ok_or(Error::NotFound)?;
        let load_addr = vm.pvmfw_load_addr().ok_or(Error::InvalidArgument)?;

        let offset = match ipa.checked_sub(load_addr) {
            Some(offset) if offset < fw.size => offset,
            _ => return Err(Error::InvalidArgument),
        };
        let size = size.min(fw.size - offset);
        let src = fw.base.checked_add(offset).ok_or(Error::InvalidArgument)?;
        if !page_aligned(size) || !page_aligned(src.0) {
            return Err(Error::InvalidArgument);
        }

        for page in 0..size >> PAGE_SHIFT {
            let delta = page << PAGE_SHIFT;
            let dst = phys.checked_add(delta).ok_or(Error::InvalidArgument)?;
            let src = src.checked_add(delta).ok_or(Error::InvalidArgument)?;
            self.mem.copy_page(dst, src).map_err(|e| {
                warn!("VM {}: pVM firmware copy to {} failed: {}", handle, dst, e);
                Error::from(e)
            })?;
        }
        debug!(
            "VM {}: loaded {:#x} bytes of pVM firmware at {:#x}",
            handle, size, ipa
        );
        Ok(())
    }

    /// Scrubs the firmware image so it cannot be loaded again.
    pub fn poison_pvmfw_pages(&self) {
        let fw = match &self.pvmfw {
            Some(fw) => fw,
            None => return,
        };
        let mut addr = fw.base;
        for _ in 0..fw.nr_pages() {
            self.mem.poison_page(addr);
            addr = PhysAddr(addr.0.wrapping_add(PAGE_SIZE));
        }
    }
}

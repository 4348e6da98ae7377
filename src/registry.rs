// Copyright 2026 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! The VM table mapping host-visible handles to VM records.

use std::fmt;
use std::fmt::Display;
use std::ops::Deref;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::sync::RwLockReadGuard;
use std::sync::RwLockWriteGuard;

use log::warn;
use serde::Deserialize;
use serde::Serialize;
use sync::RwLock;

use crate::mem::Vmid;
use crate::vm::VirtualMachine;
use crate::Error;
use crate::Result;

/// Opaque VM identifier handed to the host: a table slot index plus a non-zero offset.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct VmHandle(pub u32);

impl Display for VmHandle {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

/// Fixed-capacity table of registered VMs.
///
/// The slots are allocated once by [`VmRegistry::init`]; until then every insertion fails with
/// `Error::Uninitialized`.
pub struct VmTable {
    slots: Option<Box<[Option<Arc<VirtualMachine>>]>>,
    capacity: usize,
    handle_offset: u32,
}

impl VmTable {
    fn slot_index(&self, handle: VmHandle) -> Option<usize> {
        let idx = handle.0.checked_sub(self.handle_offset)? as usize;
        if idx < self.capacity {
            Some(idx)
        } else {
            None
        }
    }

    /// Inserts the VM returned by `build` into the first free slot.
    ///
    /// `build` receives the handle and VMID derived from the slot. VMID 0 is the host's, so
    /// guests are numbered from 1.
    pub fn register<F>(&mut self, build: F) -> Result<Arc<VirtualMachine>>
    where
        F: FnOnce(VmHandle, Vmid) -> Arc<VirtualMachine>,
    {
        let slots = self.slots.as_mut().ok_or(Error::Uninitialized)?;
        let idx = slots
            .iter()
            .position(Option::is_none)
            .ok_or(Error::ResourceExhausted)?;
        let handle = VmHandle(self.handle_offset + idx as u32);
        let vm = build(handle, idx as Vmid + 1);
        slots[idx] = Some(vm.clone());
        Ok(vm)
    }

    pub fn lookup(&self, handle: VmHandle) -> Option<&Arc<VirtualMachine>> {
        let idx = self.slot_index(handle)?;
        self.slots.as_ref()?[idx].as_ref()
    }

    pub fn remove(&mut self, handle: VmHandle) -> Option<Arc<VirtualMachine>> {
        let idx = self.slot_index(handle)?;
        self.slots.as_mut()?[idx].take()
    }

    /// Number of registered VMs.
    pub fn len(&self) -> usize {
        self.slots
            .as_ref()
            .map_or(0, |slots| slots.iter().filter(|s| s.is_some()).count())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// The VM table behind its reader/writer lock.
///
/// Insertion, removal and teardown state changes take the writer side. Hypercall and vCPU load
/// paths only take the reader side, for as long as it takes to find a VM and pin it with a
/// [`VmRef`].
pub struct VmRegistry {
    table: RwLock<VmTable>,
}

impl VmRegistry {
    pub fn new(capacity: usize, handle_offset: u32) -> Self {
        VmRegistry {
            table: RwLock::new(VmTable {
                slots: None,
                capacity,
                handle_offset,
            }),
        }
    }

    /// Allocates the table. May only be done once.
    pub fn init(&self) -> Result<()> {
        let mut table = self.table.write();
        if table.slots.is_some() {
            warn!("VM table initialized twice");
            return Err(Error::Busy);
        }
        table.slots = Some(vec![None; table.capacity].into_boxed_slice());
        Ok(())
    }

    pub fn read(&self) -> RwLockReadGuard<VmTable> {
        self.table.read()
    }

    pub fn write(&self) -> RwLockWriteGuard<VmTable> {
        self.table.write()
    }

    /// Takes a reference to a live VM, blocking its teardown until the reference is dropped.
    pub fn get(&self, handle: VmHandle) -> Option<VmRef> {
        let table = self.read();
        let vm = table.lookup(handle)?;
        if vm.is_dying() {
            return None;
        }
        Some(VmRef::acquire(vm))
    }
}

/// A counted reference to a VM.
///
/// Creating one increments the VM's reference count and dropping it decrements the count. A VM
/// with a non-zero count cannot start tearing down.
pub struct VmRef {
    vm: Arc<VirtualMachine>,
}

impl VmRef {
    /// Must be called with the registry lock held so the increment cannot race a teardown.
    pub(crate) fn acquire(vm: &Arc<VirtualMachine>) -> VmRef {
        vm.refcount.fetch_add(1, Ordering::Acquire);
        VmRef { vm: vm.clone() }
    }

    pub fn vm(&self) -> &Arc<VirtualMachine> {
        &self.vm
    }
}

impl Deref for VmRef {
    type Target = VirtualMachine;

    fn deref(&self) -> &VirtualMachine {
        &self.vm
    }
}

impl Drop for VmRef {
    fn drop(&mut self) {
        self.vm.refcount.fetch_sub(1, Ordering::Release);
    }
}

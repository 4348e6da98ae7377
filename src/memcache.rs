// Copyright 2026 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use crate::mem::PhysAddr;

/// A stack of pages exchanged between host and hypervisor, each tagged with its allocation order.
///
/// The host fills one per vCPU for stage-2 table allocations and receives pages back through a
/// per-VM teardown memcache, freeing them with its own allocator.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Memcache {
    pages: Vec<(PhysAddr, u32)>,
}

impl Memcache {
    pub fn new() -> Self {
        Memcache::default()
    }

    pub fn push(&mut self, phys: PhysAddr, order: u32) {
        self.pages.push((phys, order));
    }

    pub fn pop(&mut self) -> Option<(PhysAddr, u32)> {
        self.pages.pop()
    }

    pub fn len(&self) -> usize {
        self.pages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pages.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &(PhysAddr, u32)> {
        self.pages.iter()
    }

    /// Pops every page, most recently pushed first.
    pub fn drain(&mut self) -> impl Iterator<Item = (PhysAddr, u32)> + '_ {
        self.pages.drain(..).rev()
    }
}

impl FromIterator<PhysAddr> for Memcache {
    fn from_iter<I: IntoIterator<Item = PhysAddr>>(iter: I) -> Self {
        Memcache {
            pages: iter.into_iter().map(|p| (p, 0)).collect(),
        }
    }
}

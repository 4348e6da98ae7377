// Copyright 2026 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Requests the hypervisor leaves for the host when a guest hypercall needs host help.
//!
//! The ring lives in a buffer shared with the host. Its last slot is always reserved for the
//! terminating marker the host scans for, so a ring of `capacity` slots holds `capacity - 1`
//! requests.

use serde::Deserialize;
use serde::Serialize;

use crate::Error;
use crate::Result;

/// Where the host should put the pages of a `Mem` request.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum MemDest {
    VcpuMemcache,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum HypRequest {
    /// The host must provide `nr_pages` pages before the guest is resumed.
    Mem { dest: MemDest, nr_pages: u64 },
    /// The host must fault in `size` bytes of guest memory at `guest_ipa`.
    Map { guest_ipa: u64, size: u64 },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HypRequestRing {
    requests: Vec<HypRequest>,
    capacity: usize,
}

impl HypRequestRing {
    pub fn new(capacity: usize) -> Self {
        HypRequestRing {
            requests: Vec::with_capacity(capacity.saturating_sub(1)),
            capacity,
        }
    }

    /// Number of requests the ring can hold alongside its terminator.
    pub fn usable(&self) -> usize {
        self.capacity.saturating_sub(1)
    }

    /// Appends a request, failing with `ResourceExhausted` when no slot is left for it and the
    /// terminator.
    pub fn push(&mut self, req: HypRequest) -> Result<()> {
        if self.requests.len() >= self.usable() {
            return Err(Error::ResourceExhausted);
        }
        self.requests.push(req);
        Ok(())
    }

    /// Empties the ring, leaving only the terminator.
    pub fn reset(&mut self) {
        self.requests.clear();
    }

    /// Number of requests that can still be pushed.
    pub fn free(&self) -> usize {
        self.usable().saturating_sub(self.requests.len())
    }

    pub fn len(&self) -> usize {
        self.requests.len()
    }

    pub fn is_empty(&self) -> bool {
        self.requests.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &HypRequest> {
        self.requests.iter()
    }

    /// Takes every pending request in issue order.
    pub fn drain(&mut self) -> impl Iterator<Item = HypRequest> + '_ {
        self.requests.drain(..)
    }
}

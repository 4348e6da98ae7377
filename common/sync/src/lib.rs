// Copyright 2026 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Lock types whose methods panic rather than returning error in case of poison.
//!
//! The Mutex/RwLock types in this crate wrap the standard library versions and mirror the same
//! methods, except that they panic where the standard library would return an Error.
//!
//! - The hypervisor core is built with panic=abort, so poisoning never occurs. A panic while a
//!   lock is held takes down the whole hypervisor, which is the only safe outcome once shared VM
//!   state may be half-updated.
//!
//! - Callers therefore never have to consider the possibility of poison, and `.lock().unwrap()`
//!   does not need to appear next to error paths that must be handled properly.
//!
//! These types should be used anywhere in the workspace that would otherwise use the
//! corresponding types in std::sync.

mod mutex;
mod rwlock;

pub use crate::mutex::Mutex;
pub use crate::mutex::WouldBlock;
pub use crate::rwlock::RwLock;

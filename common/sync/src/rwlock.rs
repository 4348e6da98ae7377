// Copyright 2026 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use std::fmt;
use std::fmt::Debug;
use std::sync::RwLock as StdRwLock;
use std::sync::RwLockReadGuard;
use std::sync::RwLockWriteGuard;

/// A reader-writer lock.
///
/// Any number of readers may hold the lock at once, a writer excludes everyone else.
#[derive(Default)]
pub struct RwLock<T: ?Sized> {
    std: StdRwLock<T>,
}

impl<T> RwLock<T> {
    /// Creates a new instance of an `RwLock<T>` which is unlocked.
    pub const fn new(value: T) -> RwLock<T> {
        RwLock {
            std: StdRwLock::new(value),
        }
    }

    /// Consumes this lock, returning the underlying data.
    pub fn into_inner(self) -> T {
        match self.std.into_inner() {
            Ok(value) => value,
            Err(_) => panic!("rwlock is poisoned"),
        }
    }
}

impl<T: ?Sized> RwLock<T> {
    /// Locks this rwlock with shared read access, blocking the current thread until it can be
    /// acquired.
    pub fn read(&self) -> RwLockReadGuard<T> {
        match self.std.read() {
            Ok(guard) => guard,
            Err(_) => panic!("rwlock is poisoned"),
        }
    }

    /// Locks this rwlock with exclusive write access, blocking the current thread until it can be
    /// acquired.
    pub fn write(&self) -> RwLockWriteGuard<T> {
        match self.std.write() {
            Ok(guard) => guard,
            Err(_) => panic!("rwlock is poisoned"),
        }
    }

    /// Returns a mutable reference to the underlying data.
    pub fn get_mut(&mut self) -> &mut T {
        match self.std.get_mut() {
            Ok(value) => value,
            Err(_) => panic!("rwlock is poisoned"),
        }
    }
}

impl<T: ?Sized + Debug> Debug for RwLock<T> {
    fn fmt(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
        Debug::fmt(&self.std, formatter)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn readers_share() {
        let lock = RwLock::new(5);
        let r1 = lock.read();
        let r2 = lock.read();
        assert_eq!(*r1 + *r2, 10);
    }

    #[test]
    fn writer_updates() {
        let lock = RwLock::new(Vec::new());
        lock.write().push(1);
        lock.write().push(2);
        assert_eq!(*lock.read(), vec![1, 2]);
        assert_eq!(lock.into_inner(), vec![1, 2]);
    }
}

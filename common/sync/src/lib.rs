// Copyright 2018 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Sync primitive types whose methods panic rather than returning error in case of poison.
//!
//! The Mutex type in this crate wraps the standard library version and mirrors the same methods,
//! except that it panics where the standard library would return an Error. Region state is only
//! ever touched under these locks, and a panic while one is held takes down the whole VMM, so
//! callers never have to consider poison.

mod mutex;

pub use crate::mutex::Mutex;
pub use crate::mutex::WouldBlock;

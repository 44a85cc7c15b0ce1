// Copyright 2022 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! In-memory devicetree used to describe host platform resources.
//!
//! Properties are stored as raw big-endian byte strings, exactly as firmware hands them over, and
//! decoded on lookup through [`FromFdtPropval`].

mod fdt;
mod propval;

pub use fdt::Error;
pub use fdt::Fdt;
pub use fdt::FdtNode;
pub use fdt::Result;
pub use propval::FromFdtPropval;
pub use propval::ToFdtPropval;

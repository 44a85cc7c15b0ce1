// Copyright 2019 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! VFIO PCI passthrough of NVLink2 GPU memory and NPU shootdown registers on POWER9 hosts.
//!
//! [`pci::enable_nvlink2_quirks`] is the entry point: it inspects a device being enabled for
//! VFIO and registers the device-specific regions it needs in a [`vfio::VfioPciRegions`]
//! table, which then serves region info, read, write, mmap and release for them.

pub mod mm;
pub mod nvlink2;
pub mod pci;
pub mod vfio;

#[cfg(test)]
mod testing;

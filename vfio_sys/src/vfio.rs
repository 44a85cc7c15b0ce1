// Copyright 2019 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use zerocopy::FromBytes;
use zerocopy::Immutable;
use zerocopy::IntoBytes;
use zerocopy::KnownLayout;

pub const PCI_VENDOR_ID_IBM: u32 = 0x1014;
pub const PCI_VENDOR_ID_NVIDIA: u32 = 0x10de;

pub const VFIO_REGION_INFO_FLAG_READ: u32 = 1;
pub const VFIO_REGION_INFO_FLAG_WRITE: u32 = 2;
pub const VFIO_REGION_INFO_FLAG_MMAP: u32 = 4;
pub const VFIO_REGION_INFO_FLAG_CAPS: u32 = 8;

pub const VFIO_REGION_INFO_CAP_TYPE: u16 = 2;
pub const VFIO_REGION_INFO_CAP_NVLINK2_SSATGT: u16 = 4;

pub const VFIO_REGION_TYPE_PCI_VENDOR_TYPE: u32 = 1 << 31;

/// NVIDIA GPU NVLink2 RAM
pub const VFIO_REGION_SUBTYPE_NVIDIA_NVLINK2_RAM: u32 = 1;
/// IBM NPU NVLink2 ATSD
pub const VFIO_REGION_SUBTYPE_IBM_NVLINK2_ATSD: u32 = 1;

pub const VFIO_PCI_NUM_REGIONS: u32 = 9;

/// Region offsets handed to userspace carry the region index in the bits above this shift.
pub const VFIO_PCI_OFFSET_SHIFT: u32 = 40;
pub const VFIO_PCI_OFFSET_MASK: u64 = (1u64 << VFIO_PCI_OFFSET_SHIFT) - 1;

pub const VFIO_GROUP_NOTIFY_SET_KVM: u64 = 1;

#[repr(C)]
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq, FromBytes, Immutable, IntoBytes, KnownLayout)]
pub struct vfio_info_cap_header {
    pub id: u16,
    pub version: u16,
    pub next: u32,
}

#[repr(C)]
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq, FromBytes, Immutable, IntoBytes, KnownLayout)]
pub struct vfio_region_info_cap_type {
    pub header: vfio_info_cap_header,
    pub type_: u32,
    pub subtype: u32,
}

#[repr(C)]
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq, FromBytes, Immutable, IntoBytes, KnownLayout)]
pub struct vfio_region_info_cap_nvlink2_ssatgt {
    pub header: vfio_info_cap_header,
    pub tgt: u64,
}

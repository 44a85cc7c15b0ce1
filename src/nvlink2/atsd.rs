// Copyright 2019 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! NPU address translation shootdown (ATSD) register region.

use log::debug;
use vfio_sys::vfio_info_cap_header;
use vfio_sys::vfio_region_info_cap_nvlink2_ssatgt;
use vfio_sys::PCI_VENDOR_ID_IBM;
use vfio_sys::VFIO_REGION_INFO_CAP_NVLINK2_SSATGT;
use vfio_sys::VFIO_REGION_INFO_FLAG_READ;
use vfio_sys::VFIO_REGION_SUBTYPE_IBM_NVLINK2_ATSD;
use vfio_sys::VFIO_REGION_TYPE_PCI_VENDOR_TYPE;

use super::platform;
use super::Error;
use super::HostPlatform;
use super::ReleaseOutcome;
use super::Result;
use crate::mm::CachePolicy;
use crate::mm::VmArea;
use crate::mm::PAGE_SHIFT;
use crate::mm::PAGE_SIZE;
use crate::pci::PciAddress;
use crate::vfio::RegionBacking;
use crate::vfio::RegionRegistrar;
use crate::vfio::VfioInfoCapChain;

// POWER9 NPUs have one ATSD register page per link, but only the first is ever described.
const ATSD_LINK_INDEX: u32 = 0;

pub struct AtsdRegion {
    mmio_atsd: u64,
    gpu_tgt: u64,
}

impl AtsdRegion {
    pub fn new(mmio_atsd: u64, gpu_tgt: u64) -> Self {
        AtsdRegion { mmio_atsd, gpu_tgt }
    }

    pub fn mmio_atsd(&self) -> u64 {
        self.mmio_atsd
    }

    pub fn gpu_tgt(&self) -> u64 {
        self.gpu_tgt
    }

    /// Maps the register page, uncached, over the whole of `vma`, which must be one page long.
    pub fn mmap(&self, vma: &mut VmArea) -> Result<()> {
        if vma.len() != PAGE_SIZE {
            return Err(Error::MapWrongSize(vma.len()));
        }
        vma.set_pfnmap(CachePolicy::Uncached, None);
        vma.remap_pfn_range(vma.start(), self.mmio_atsd >> PAGE_SHIFT, PAGE_SIZE)
            .map_err(Error::RemapAtsd)?;
        debug!(
            "NVLink2 ATSD mmap: useraddr={:#x} hpa={:#x}",
            vma.start(),
            self.mmio_atsd
        );
        Ok(())
    }

    pub fn add_capability(&self, caps: &mut VfioInfoCapChain) -> Result<()> {
        caps.add(&vfio_region_info_cap_nvlink2_ssatgt {
            header: vfio_info_cap_header {
                id: VFIO_REGION_INFO_CAP_NVLINK2_SSATGT,
                version: 1,
                next: 0,
            },
            tgt: self.gpu_tgt,
        })
    }

    pub fn release(&self) -> ReleaseOutcome {
        ReleaseOutcome::default()
    }
}

/// Registers the ATSD page of NPU function `npu`.
pub fn init(
    npu: PciAddress,
    platform: &HostPlatform,
    regions: &mut dyn RegionRegistrar,
) -> Result<u32> {
    let mmio_atsd = platform::atsd_window(platform, npu, ATSD_LINK_INDEX)?;
    let gpu_tgt = platform::device_target_address(platform, npu)?;
    debug!("{}: ATSD {:#x} tgt {:#x}", npu, mmio_atsd, gpu_tgt);

    regions.register_dev_region(
        VFIO_REGION_TYPE_PCI_VENDOR_TYPE | PCI_VENDOR_ID_IBM,
        VFIO_REGION_SUBTYPE_IBM_NVLINK2_ATSD,
        PAGE_SIZE,
        VFIO_REGION_INFO_FLAG_READ,
        RegionBacking::Atsd(AtsdRegion::new(mmio_atsd, gpu_tgt)),
    )
}

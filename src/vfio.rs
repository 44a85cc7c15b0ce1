// Copyright 2019 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! VFIO PCI device-specific regions.
//!
//! Regions registered here follow the fixed PCI regions (BARs, ROM, config space, VGA) and are
//! addressed through the device file at `index << VFIO_PCI_OFFSET_SHIFT`.

use std::io::Read;
use std::io::Write;
use std::mem::offset_of;

use log::info;
use vfio_sys::*;
use zerocopy::FromBytes;
use zerocopy::Immutable;
use zerocopy::IntoBytes;

use crate::mm::VmArea;
use crate::mm::PAGE_SHIFT;
use crate::nvlink2::atsd::AtsdRegion;
use crate::nvlink2::gpu_ram::GpuRamRegion;
use crate::nvlink2::Error;
use crate::nvlink2::ReleaseOutcome;
use crate::nvlink2::Result;

const CAP_ALIGN: usize = 8;

/// Capability chain attached to a region's info.
///
/// Every record starts with a `vfio_info_cap_header` whose `next` field holds the chain offset
/// of the following record, or 0 for the last one.
#[derive(Debug, Default)]
pub struct VfioInfoCapChain {
    buf: Vec<u8>,
    last: Option<usize>,
}

impl VfioInfoCapChain {
    pub fn new() -> Self {
        VfioInfoCapChain::default()
    }

    /// Appends `cap`, a structure whose first field is a `vfio_info_cap_header`.
    pub fn add<T: IntoBytes + Immutable>(&mut self, cap: &T) -> Result<()> {
        let bytes = cap.as_bytes();
        let header_len = std::mem::size_of::<vfio_info_cap_header>();
        if bytes.len() < header_len {
            return Err(Error::UnsupportedOperation("capability without header"));
        }
        let offset = self.buf.len().next_multiple_of(CAP_ALIGN);
        self.buf
            .try_reserve(offset + bytes.len() - self.buf.len())
            .map_err(|_| Error::OutOfMemory)?;
        self.buf.resize(offset, 0);
        self.buf.extend_from_slice(bytes);

        let next_field = offset_of!(vfio_info_cap_header, next);
        // The new record terminates the chain.
        self.buf[offset + next_field..offset + header_len].fill(0);
        if let Some(prev) = self.last {
            self.buf[prev + next_field..prev + header_len]
                .copy_from_slice(&(offset as u32).to_ne_bytes());
        }
        self.last = Some(offset);
        Ok(())
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.buf
    }

    /// Walks the chain and returns the record carrying capability `id`.
    pub fn find(&self, id: u16) -> Option<&[u8]> {
        let mut offset = 0usize;
        loop {
            let record = self.buf.get(offset..)?;
            let (header, _) = vfio_info_cap_header::read_from_prefix(record).ok()?;
            if header.id == id {
                return Some(record);
            }
            if header.next == 0 {
                return None;
            }
            offset = header.next as usize;
        }
    }
}

/// Strongly typed backing state of a device-specific region.
pub enum RegionBacking {
    GpuRam(GpuRamRegion),
    Atsd(AtsdRegion),
}

impl RegionBacking {
    fn read(&self, offset: u64, count: usize, dst: &mut dyn Write) -> Result<usize> {
        match self {
            RegionBacking::GpuRam(r) => r.read(offset, count, dst),
            RegionBacking::Atsd(_) => Err(Error::UnsupportedOperation("read")),
        }
    }

    fn write(&self, offset: u64, count: usize, src: &mut dyn Read) -> Result<usize> {
        match self {
            RegionBacking::GpuRam(r) => r.write(offset, count, src),
            RegionBacking::Atsd(_) => Err(Error::UnsupportedOperation("write")),
        }
    }

    fn mmap(&self, vma: &mut VmArea) -> Result<()> {
        match self {
            RegionBacking::GpuRam(r) => r.mmap(vma),
            RegionBacking::Atsd(r) => r.mmap(vma),
        }
    }

    fn add_capability(&self, caps: &mut VfioInfoCapChain) -> Result<()> {
        match self {
            RegionBacking::GpuRam(_) => Ok(()),
            RegionBacking::Atsd(r) => r.add_capability(caps),
        }
    }

    fn release(&self) -> ReleaseOutcome {
        match self {
            RegionBacking::GpuRam(r) => r.release(),
            RegionBacking::Atsd(r) => r.release(),
        }
    }
}

/// A device-specific region registered with a VFIO PCI device.
pub struct VfioDevRegion {
    type_: u32,
    subtype: u32,
    size: u64,
    flags: u32,
    backing: RegionBacking,
}

impl VfioDevRegion {
    pub fn type_(&self) -> u32 {
        self.type_
    }

    pub fn subtype(&self) -> u32 {
        self.subtype
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn backing(&self) -> &RegionBacking {
        &self.backing
    }
}

/// Region information as reported by `VFIO_DEVICE_GET_REGION_INFO`.
#[derive(Debug)]
pub struct VfioRegionInfo {
    pub index: u32,
    pub flags: u32,
    pub size: u64,
    pub offset: u64,
    pub caps: VfioInfoCapChain,
}

/// Sink for regions created by device quirks while a VFIO PCI device is enabled.
pub trait RegionRegistrar {
    /// Registers a region and returns its VFIO region index.
    fn register_dev_region(
        &mut self,
        type_: u32,
        subtype: u32,
        size: u64,
        flags: u32,
        backing: RegionBacking,
    ) -> Result<u32>;
}

/// Device-specific regions of one VFIO PCI device.
#[derive(Default)]
pub struct VfioPciRegions {
    regions: Vec<VfioDevRegion>,
}

impl VfioPciRegions {
    pub fn new() -> Self {
        VfioPciRegions::default()
    }

    pub fn len(&self) -> usize {
        self.regions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.regions.is_empty()
    }

    /// Device file offset at which region `index` starts.
    pub fn region_offset(index: u32) -> u64 {
        u64::from(index) << VFIO_PCI_OFFSET_SHIFT
    }

    fn offset_to_index(pos: u64) -> u32 {
        (pos >> VFIO_PCI_OFFSET_SHIFT) as u32
    }

    pub fn region(&self, index: u32) -> Result<&VfioDevRegion> {
        index
            .checked_sub(VFIO_PCI_NUM_REGIONS)
            .and_then(|i| self.regions.get(i as usize))
            .ok_or(Error::InvalidRegionIndex(index))
    }

    /// Reads up to `count` bytes at device file offset `pos` into `dst`.
    pub fn read(&self, pos: u64, count: usize, dst: &mut dyn Write) -> Result<usize> {
        let region = self.region(Self::offset_to_index(pos))?;
        region.backing.read(pos & VFIO_PCI_OFFSET_MASK, count, dst)
    }

    /// Writes up to `count` bytes from `src` at device file offset `pos`.
    pub fn write(&self, pos: u64, count: usize, src: &mut dyn Read) -> Result<usize> {
        let region = self.region(Self::offset_to_index(pos))?;
        region.backing.write(pos & VFIO_PCI_OFFSET_MASK, count, src)
    }

    /// Maps the region selected by the mmap offset of `vma`.
    pub fn mmap(&self, vma: &mut VmArea) -> Result<()> {
        let index = Self::offset_to_index(vma.pgoff() << PAGE_SHIFT);
        self.region(index)?.backing.mmap(vma)
    }

    pub fn region_info(&self, index: u32) -> Result<VfioRegionInfo> {
        let region = self.region(index)?;
        let mut caps = VfioInfoCapChain::new();
        caps.add(&vfio_region_info_cap_type {
            header: vfio_info_cap_header {
                id: VFIO_REGION_INFO_CAP_TYPE,
                version: 1,
                next: 0,
            },
            type_: region.type_,
            subtype: region.subtype,
        })?;
        region.backing.add_capability(&mut caps)?;

        // Both region kinds can be mapped, and every region carries at least its type capability.
        Ok(VfioRegionInfo {
            index,
            flags: region.flags | VFIO_REGION_INFO_FLAG_MMAP | VFIO_REGION_INFO_FLAG_CAPS,
            size: region.size,
            offset: Self::region_offset(index),
            caps,
        })
    }

    /// Releases every region, in registration order. Dropping the table does the same.
    pub fn release(&mut self) -> ReleaseOutcome {
        let mut outcome = ReleaseOutcome::default();
        for region in self.regions.drain(..) {
            outcome.merge(region.backing.release());
        }
        outcome
    }
}

impl Drop for VfioPciRegions {
    fn drop(&mut self) {
        // Warnings were already logged; there is no one left to report them to.
        let _ = self.release();
    }
}

impl RegionRegistrar for VfioPciRegions {
    fn register_dev_region(
        &mut self,
        type_: u32,
        subtype: u32,
        size: u64,
        flags: u32,
        backing: RegionBacking,
    ) -> Result<u32> {
        self.regions.try_reserve(1).map_err(|_| Error::OutOfMemory)?;
        let index = VFIO_PCI_NUM_REGIONS + self.regions.len() as u32;
        self.regions.push(VfioDevRegion {
            type_,
            subtype,
            size,
            flags,
            backing,
        });
        info!(
            "vfio: registered region {} type {:#x}/{} size {:#x}",
            index, type_, subtype, size
        );
        Ok(index)
    }
}

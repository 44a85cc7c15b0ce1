// Copyright 2019 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Coherent GPU RAM region.
//!
//! The V100's RAM is visible to the POWER9 CPU as ordinary cacheable memory behind NVLink. The
//! region is mapped into the VMM once, lazily one page per fault, and the whole window is
//! registered with the host translation table on that first mmap so the guest can DMA to it.

use std::collections::btree_map::Entry;
use std::collections::BTreeMap;
use std::io::Read;
use std::io::Write;
use std::sync::Arc;

use log::debug;
use sync::Mutex;
use vfio_sys::PCI_VENDOR_ID_NVIDIA;
use vfio_sys::VFIO_PCI_OFFSET_SHIFT;
use vfio_sys::VFIO_REGION_INFO_FLAG_READ;
use vfio_sys::VFIO_REGION_SUBTYPE_NVIDIA_NVLINK2_RAM;
use vfio_sys::VFIO_REGION_TYPE_PCI_VENDOR_TYPE;

use super::notifier::GroupNotifier;
use super::notifier::OwnershipNotifier;
use super::notifier::Subscription;
use super::platform;
use super::Error;
use super::HostPlatform;
use super::Nvlink2Device;
use super::ReleaseOutcome;
use super::Result;
use crate::mm::AddressSpace;
use crate::mm::CachePolicy;
use crate::mm::FaultHandler;
use crate::mm::FaultResult;
use crate::mm::TranslationHandle;
use crate::mm::TranslationTable;
use crate::mm::VmArea;
use crate::mm::PAGE_SHIFT;
use crate::mm::PAGE_SIZE;
use crate::pci::PciAddress;
use crate::vfio::RegionBacking;
use crate::vfio::RegionRegistrar;

// Page offset bits of an mmap offset that lie below the VFIO region index.
const PGOFF_MASK: u64 = (1 << (VFIO_PCI_OFFSET_SHIFT - PAGE_SHIFT)) - 1;

static ZERO_PAGE: [u8; PAGE_SIZE as usize] = [0; PAGE_SIZE as usize];

/// Byte store behind the region's read/write interface, allocated a page at a time on first
/// write so that a multi-gigabyte window costs nothing until touched.
#[derive(Default)]
struct StagingBuffer {
    pages: BTreeMap<u64, Box<[u8]>>,
}

impl StagingBuffer {
    fn page(&self, index: u64) -> &[u8] {
        self.pages.get(&index).map_or(&ZERO_PAGE[..], |p| &p[..])
    }

    fn page_mut(&mut self, index: u64) -> Result<&mut [u8]> {
        match self.pages.entry(index) {
            Entry::Occupied(e) => Ok(&mut e.into_mut()[..]),
            Entry::Vacant(e) => {
                let mut page = Vec::new();
                page.try_reserve_exact(PAGE_SIZE as usize)
                    .map_err(|_| Error::OutOfMemory)?;
                page.resize(PAGE_SIZE as usize, 0);
                Ok(&mut e.insert(page.into_boxed_slice())[..])
            }
        }
    }
}

/// Splits `[offset, offset + count)` at page boundaries into `(page, start, len)` chunks.
fn page_chunks(offset: u64, count: usize) -> impl Iterator<Item = (u64, usize, usize)> {
    let end = offset + count as u64;
    let mut pos = offset;
    std::iter::from_fn(move || {
        if pos >= end {
            return None;
        }
        let start = (pos % PAGE_SIZE) as usize;
        let len = std::cmp::min(PAGE_SIZE - start as u64, end - pos) as usize;
        let chunk = (pos >> PAGE_SHIFT, start, len);
        pos += len as u64;
        Some(chunk)
    })
}

struct GpuRamMapping {
    useraddr: u64,
    // Keeps the address space alive for as long as `handle` refers to it.
    owner: Arc<AddressSpace>,
    handle: TranslationHandle,
}

/// Installs GPU RAM page frames into the mapping on fault.
struct GpuRamFaultHandler {
    gpu_hpa: u64,
    size: u64,
}

impl FaultHandler for GpuRamFaultHandler {
    fn fault(&self, vma: &VmArea, addr: u64) -> FaultResult {
        let vmf_off = (addr - vma.start()) >> PAGE_SHIFT;
        let page = (vma.pgoff() & PGOFF_MASK) + vmf_off;
        if page >= self.size >> PAGE_SHIFT {
            debug!("NVLink2: fault at {:#x} beyond GPU RAM", addr);
            return FaultResult::SigSegv;
        }
        let pfn = (self.gpu_hpa >> PAGE_SHIFT) + page;
        let ret = vma.insert_pfn(addr & !(PAGE_SIZE - 1), pfn);
        debug!(
            "NVLink2: vmf={:#x} hpa={:#x} ret={:?}",
            addr,
            pfn << PAGE_SHIFT,
            ret
        );
        match ret {
            Ok(()) => FaultResult::NoPage,
            Err(_) => FaultResult::SigSegv,
        }
    }
}

/// GPU RAM exposed as a VFIO region.
pub struct GpuRamRegion {
    gpu_hpa: u64,
    size: u64,
    device: Arc<Nvlink2Device>,
    translation: Arc<dyn TranslationTable>,
    fault_handler: Arc<GpuRamFaultHandler>,
    mapping: Mutex<Option<GpuRamMapping>>,
    staging: Mutex<StagingBuffer>,
    subscription: Mutex<Option<Subscription>>,
}

impl GpuRamRegion {
    pub fn new(
        gpu_hpa: u64,
        size: u64,
        device: Arc<Nvlink2Device>,
        translation: Arc<dyn TranslationTable>,
    ) -> Self {
        GpuRamRegion {
            gpu_hpa,
            size,
            device,
            translation,
            fault_handler: Arc::new(GpuRamFaultHandler { gpu_hpa, size }),
            mapping: Mutex::new(None),
            staging: Mutex::new(StagingBuffer::default()),
            subscription: Mutex::new(None),
        }
    }

    pub fn gpu_hpa(&self) -> u64 {
        self.gpu_hpa
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn device(&self) -> &Arc<Nvlink2Device> {
        &self.device
    }

    /// Userspace address of the mapping, once one exists.
    pub fn useraddr(&self) -> Option<u64> {
        self.mapping.lock().as_ref().map(|m| m.useraddr)
    }

    fn clamp(&self, offset: u64, count: usize) -> Result<usize> {
        if offset >= self.size {
            return Err(Error::OffsetOutOfRange {
                offset,
                size: self.size,
            });
        }
        Ok(std::cmp::min(count as u64, self.size - offset) as usize)
    }

    /// Copies up to `count` bytes at `offset` to `dst`. Returns the number of bytes copied.
    pub fn read(&self, offset: u64, count: usize, dst: &mut dyn Write) -> Result<usize> {
        let count = self.clamp(offset, count)?;
        let staging = self.staging.lock();
        for (page, start, len) in page_chunks(offset, count) {
            dst.write_all(&staging.page(page)[start..start + len])
                .map_err(Error::GuestCopy)?;
        }
        Ok(count)
    }

    /// Copies up to `count` bytes from `src` to `offset`. Returns the number of bytes copied.
    pub fn write(&self, offset: u64, count: usize, src: &mut dyn Read) -> Result<usize> {
        let count = self.clamp(offset, count)?;
        let mut staging = self.staging.lock();
        for (page, start, len) in page_chunks(offset, count) {
            src.read_exact(&mut staging.page_mut(page)?[start..start + len])
                .map_err(Error::GuestCopy)?;
        }
        Ok(count)
    }

    /// Sets up the one and only mapping of the region.
    ///
    /// The mapping is populated on demand by faults. The full window is registered with the
    /// translation table on behalf of the mapping's address space before this returns.
    pub fn mmap(&self, vma: &mut VmArea) -> Result<()> {
        let mut mapping = self.mapping.lock();
        if let Some(m) = mapping.as_ref() {
            return Err(Error::AlreadyMapped(m.useraddr));
        }
        let len = vma.len();
        if len > self.size {
            return Err(Error::MapTooLarge {
                len,
                size: self.size,
            });
        }

        let owner = vma.owner().clone();
        let ret = self.translation.register_device_range(
            &owner,
            vma.start(),
            len >> PAGE_SHIFT,
            self.gpu_hpa,
        );
        debug!(
            "NVLink2 mmap: useraddr={:#x} hpa={:#x} size={:#x} ok={}",
            vma.start(),
            self.gpu_hpa,
            len,
            ret.is_ok()
        );
        let handle = ret.map_err(Error::TranslationRegister)?;

        vma.set_pfnmap(CachePolicy::Cached, Some(self.fault_handler.clone()));
        *mapping = Some(GpuRamMapping {
            useraddr: vma.start(),
            owner,
            handle,
        });
        Ok(())
    }

    fn set_subscription(&self, subscription: Subscription) {
        *self.subscription.lock() = Some(subscription);
    }

    /// Tears the region down. Never fails; problems are logged and reported in the outcome.
    pub fn release(&self) -> ReleaseOutcome {
        let mut outcome = ReleaseOutcome::default();

        // No ownership change can reach the device once the subscription is gone.
        drop(self.subscription.lock().take());

        // If there were any mappings at all...
        if let Some(m) = self.mapping.lock().take() {
            if let Err(e) = self.translation.unregister_range(&m.owner, m.handle) {
                outcome.warn(Error::TranslationUnregister(e));
            }
        }

        if let Err(e) = self.device.set_guest(None) {
            outcome.warn(e);
        }
        outcome
    }
}

/// Discovers the GPU RAM window of `gpu` and registers it as a VFIO region.
///
/// Link ownership changes on `notifier` are tracked for as long as the region exists.
pub fn init(
    gpu: PciAddress,
    platform: &HostPlatform,
    notifier: &GroupNotifier,
    regions: &mut dyn RegionRegistrar,
) -> Result<u32> {
    let npu = platform
        .topology
        .npu_device(gpu, 0)
        .ok_or(Error::NoCompanionNpu(gpu))?;
    let (gpu_hpa, size) = platform::gpu_memory_window(platform, npu)?;
    debug!("{}: GPU RAM {:#x}..{:#x}", gpu, gpu_hpa, gpu_hpa + size - 1);

    let device = Arc::new(Nvlink2Device::new(gpu, npu, platform.routing.clone()));
    let region = GpuRamRegion::new(gpu_hpa, size, device.clone(), platform.translation.clone());
    region.set_subscription(OwnershipNotifier::new(device).subscribe(notifier)?);

    // On failure the region is dropped together with its subscription.
    regions.register_dev_region(
        VFIO_REGION_TYPE_PCI_VENDOR_TYPE | PCI_VENDOR_ID_NVIDIA,
        VFIO_REGION_SUBTYPE_NVIDIA_NVLINK2_RAM,
        size,
        VFIO_REGION_INFO_FLAG_READ,
        RegionBacking::GpuRam(region),
    )
}

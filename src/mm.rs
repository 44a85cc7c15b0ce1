// Copyright 2019 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Host memory-management hooks used by regions that map host physical pages into a guest.
//!
//! The types here stand in for the host kernel's view of a userspace mapping: an owning address
//! space that can be pinned by reference, a virtual memory area (`VmArea`) backed by raw page
//! frames, the page table that receives those frames, and the translation table that records
//! device memory for guest DMA.

use std::fmt;
use std::sync::Arc;

pub const PAGE_SHIFT: u32 = 12;
pub const PAGE_SIZE: u64 = 1 << PAGE_SHIFT;

/// Address space of the process that backs a guest mapping.
///
/// Every `Arc<AddressSpace>` held by a region is a reference that keeps the address space from
/// being torn down underneath an outstanding translation-table registration.
#[derive(Debug, PartialEq, Eq)]
pub struct AddressSpace {
    pid: u32,
}

impl AddressSpace {
    pub fn new(pid: u32) -> Arc<Self> {
        Arc::new(AddressSpace { pid })
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }
}

/// Caching attribute applied to page frames installed in a mapping.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum CachePolicy {
    Cached,
    Uncached,
}

/// Outcome of servicing a page fault in a `VmArea`.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum FaultResult {
    /// A page table entry was installed; the access can be retried.
    NoPage,
    /// The access cannot be satisfied and is delivered to the guest as an access violation.
    SigSegv,
}

/// Page table of the address space that owns a `VmArea`.
pub trait PageTable: Send + Sync {
    /// Installs page frame `pfn` at virtual address `addr`.
    fn insert_pfn(&self, addr: u64, pfn: u64, cache: CachePolicy) -> anyhow::Result<()>;

    /// Installs `len / PAGE_SIZE` consecutive page frames starting at `pfn`.
    fn remap_pfn_range(
        &self,
        addr: u64,
        pfn: u64,
        len: u64,
        cache: CachePolicy,
    ) -> anyhow::Result<()> {
        for page in 0..len >> PAGE_SHIFT {
            self.insert_pfn(addr + (page << PAGE_SHIFT), pfn + page, cache)?;
        }
        Ok(())
    }
}

/// Services faults on a `VmArea` that is populated on demand.
pub trait FaultHandler: Send + Sync {
    fn fault(&self, vma: &VmArea, addr: u64) -> FaultResult;
}

/// A virtual memory area `[start, end)` created by a mmap of a VFIO device file.
///
/// `pgoff` is the mmap offset in pages; for VFIO it carries the region index in its upper bits.
pub struct VmArea {
    start: u64,
    end: u64,
    pgoff: u64,
    owner: Arc<AddressSpace>,
    page_table: Arc<dyn PageTable>,
    pfnmap: bool,
    cache: CachePolicy,
    fault_handler: Option<Arc<dyn FaultHandler>>,
}

impl VmArea {
    pub fn new(
        start: u64,
        end: u64,
        pgoff: u64,
        owner: Arc<AddressSpace>,
        page_table: Arc<dyn PageTable>,
    ) -> Self {
        VmArea {
            start,
            end,
            pgoff,
            owner,
            page_table,
            pfnmap: false,
            cache: CachePolicy::Cached,
            fault_handler: None,
        }
    }

    pub fn start(&self) -> u64 {
        self.start
    }

    pub fn end(&self) -> u64 {
        self.end
    }

    pub fn len(&self) -> u64 {
        self.end.saturating_sub(self.start)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn pgoff(&self) -> u64 {
        self.pgoff
    }

    pub fn owner(&self) -> &Arc<AddressSpace> {
        &self.owner
    }

    pub fn cache(&self) -> CachePolicy {
        self.cache
    }

    /// Returns true once the area has been turned into a raw page frame mapping.
    pub fn is_pfnmap(&self) -> bool {
        self.pfnmap
    }

    /// Marks the area as a raw page frame mapping with the given caching attribute.
    ///
    /// With a `handler` the area is populated lazily, one page per fault. Without one the
    /// caller is expected to install every page up front.
    pub fn set_pfnmap(&mut self, cache: CachePolicy, handler: Option<Arc<dyn FaultHandler>>) {
        self.pfnmap = true;
        self.cache = cache;
        self.fault_handler = handler;
    }

    pub fn insert_pfn(&self, addr: u64, pfn: u64) -> anyhow::Result<()> {
        self.page_table.insert_pfn(addr, pfn, self.cache)
    }

    pub fn remap_pfn_range(&self, addr: u64, pfn: u64, len: u64) -> anyhow::Result<()> {
        self.page_table.remap_pfn_range(addr, pfn, len, self.cache)
    }

    /// Services an access to `addr` that found no page table entry.
    pub fn handle_fault(&self, addr: u64) -> FaultResult {
        if addr < self.start || addr >= self.end {
            return FaultResult::SigSegv;
        }
        match &self.fault_handler {
            Some(handler) => handler.fault(self, addr),
            None => FaultResult::SigSegv,
        }
    }
}

impl fmt::Debug for VmArea {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("VmArea")
            .field("start", &format_args!("{:#x}", self.start))
            .field("end", &format_args!("{:#x}", self.end))
            .field("pgoff", &format_args!("{:#x}", self.pgoff))
            .field("owner", &self.owner.pid)
            .field("pfnmap", &self.pfnmap)
            .field("cache", &self.cache)
            .finish()
    }
}

/// Handle returned by a translation-table registration, used to undo it.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TranslationHandle(pub u64);

/// Host address-translation (IOMMU) table tracking guest-visible memory per owning address space.
pub trait TranslationTable: Send + Sync {
    /// Registers `page_count` pages of device memory at host physical address `hpa`, mapped by
    /// `owner` at userspace address `ua`. May block while the range is pinned.
    fn register_device_range(
        &self,
        owner: &Arc<AddressSpace>,
        ua: u64,
        page_count: u64,
        hpa: u64,
    ) -> anyhow::Result<TranslationHandle>;

    /// Drops a registration made by `register_device_range`.
    fn unregister_range(
        &self,
        owner: &Arc<AddressSpace>,
        handle: TranslationHandle,
    ) -> anyhow::Result<()>;
}

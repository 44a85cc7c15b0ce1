// Copyright 2019 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! In-process stand-ins for the host services the regions talk to.

use std::collections::BTreeMap;
use std::collections::BTreeSet;
use std::collections::HashMap;
use std::sync::Arc;

use anyhow::anyhow;
use anyhow::bail;
use cros_fdt::Fdt;
use cros_fdt::FdtNode;
use sync::Mutex;

use crate::mm::AddressSpace;
use crate::mm::CachePolicy;
use crate::mm::PageTable;
use crate::mm::TranslationHandle;
use crate::mm::TranslationTable;
use crate::nvlink2::platform::PciTopology;
use crate::nvlink2::AccessMode;
use crate::nvlink2::HostPlatform;
use crate::nvlink2::NpuRouting;
use crate::nvlink2::PartitionId;
use crate::pci::PciAddress;

pub const GPU: PciAddress = PciAddress::new(4, 0, 0);
pub const NPU: PciAddress = PciAddress::new(7, 0, 0);

pub const GPU_RAM_BASE: u64 = 0x0000_2000_0000_0000;
pub const GPU_RAM_SIZE: u64 = 0x8_0000_0000;
pub const MMIO_ATSD: u64 = 0x0006_030c_0300_0000;
pub const NPU_TGT_ADDR: u64 = 0x0000_0400_0000_0000;

const MEMORY_PHANDLE: u32 = 0x1f4;
const MEMORY_PATH: &str = "/memory@200000000000";
const PHB_PATH: &str = "/pciex@6030300000000";
const NPU_PATH: &str = "/pciex@6030300000000/link@0";
const GPU_PATH: &str = "/pciex@600c3c0000000/pci@0/gpu@0";

/// Page table that records every installed page frame.
#[derive(Default)]
pub struct RecordingPageTable {
    entries: Mutex<BTreeMap<u64, (u64, CachePolicy)>>,
    fail: Mutex<BTreeSet<u64>>,
}

impl RecordingPageTable {
    /// Installed `(addr, pfn, cache)` entries, ordered by address.
    pub fn entries(&self) -> Vec<(u64, u64, CachePolicy)> {
        self.entries
            .lock()
            .iter()
            .map(|(addr, (pfn, cache))| (*addr, *pfn, *cache))
            .collect()
    }

    /// Makes installation at `addr` fail.
    pub fn fail_at(&self, addr: u64) {
        self.fail.lock().insert(addr);
    }
}

impl PageTable for RecordingPageTable {
    fn insert_pfn(&self, addr: u64, pfn: u64, cache: CachePolicy) -> anyhow::Result<()> {
        if self.fail.lock().contains(&addr) {
            bail!("no page table entry for {:#x}", addr);
        }
        self.entries.lock().insert(addr, (pfn, cache));
        Ok(())
    }
}

#[derive(Default)]
struct TranslationState {
    next_handle: u64,
    // handle -> (pid, ua, page_count, hpa)
    ranges: BTreeMap<u64, (u32, u64, u64, u64)>,
    fail_register: bool,
    fail_unregister: bool,
    unregister_calls: usize,
}

/// Translation table that tracks live registrations.
#[derive(Default)]
pub struct RecordingTranslationTable {
    state: Mutex<TranslationState>,
}

impl RecordingTranslationTable {
    /// Live `(pid, ua, page_count, hpa)` registrations.
    pub fn registrations(&self) -> Vec<(u32, u64, u64, u64)> {
        self.state.lock().ranges.values().copied().collect()
    }

    pub fn unregister_calls(&self) -> usize {
        self.state.lock().unregister_calls
    }

    pub fn set_fail_register(&self, fail: bool) {
        self.state.lock().fail_register = fail;
    }

    pub fn set_fail_unregister(&self, fail: bool) {
        self.state.lock().fail_unregister = fail;
    }
}

impl TranslationTable for RecordingTranslationTable {
    fn register_device_range(
        &self,
        owner: &Arc<AddressSpace>,
        ua: u64,
        page_count: u64,
        hpa: u64,
    ) -> anyhow::Result<TranslationHandle> {
        let mut state = self.state.lock();
        if state.fail_register {
            bail!("mm_iommu_newdev failed");
        }
        let handle = state.next_handle;
        state.next_handle += 1;
        state
            .ranges
            .insert(handle, (owner.pid(), ua, page_count, hpa));
        Ok(TranslationHandle(handle))
    }

    fn unregister_range(
        &self,
        owner: &Arc<AddressSpace>,
        handle: TranslationHandle,
    ) -> anyhow::Result<()> {
        let mut state = self.state.lock();
        state.unregister_calls += 1;
        if state.fail_unregister {
            bail!("mm_iommu_put failed");
        }
        match state.ranges.get(&handle.0) {
            Some((pid, ..)) if *pid == owner.pid() => {
                state.ranges.remove(&handle.0);
                Ok(())
            }
            _ => Err(anyhow!("unknown registration {:?}", handle)),
        }
    }
}

#[derive(Default)]
struct RoutingState {
    links: HashMap<PciAddress, (PciAddress, PartitionId, AccessMode)>,
    fail: bool,
    calls: usize,
}

/// NPU routing firmware that remembers the last programmed state of each link.
#[derive(Default)]
pub struct RecordingRouting {
    state: Mutex<RoutingState>,
}

impl RecordingRouting {
    pub fn state(&self, gpu: PciAddress) -> Option<(PciAddress, PartitionId, AccessMode)> {
        self.state.lock().links.get(&gpu).copied()
    }

    pub fn seed(&self, gpu: PciAddress, npu: PciAddress, lpid: PartitionId, mode: AccessMode) {
        self.state.lock().links.insert(gpu, (npu, lpid, mode));
    }

    pub fn set_fail(&self, fail: bool) {
        self.state.lock().fail = fail;
    }

    pub fn calls(&self) -> usize {
        self.state.lock().calls
    }
}

impl NpuRouting for RecordingRouting {
    fn map_lpar_dev(
        &self,
        npu: PciAddress,
        gpu: PciAddress,
        lpid: PartitionId,
        mode: AccessMode,
    ) -> anyhow::Result<()> {
        let mut state = self.state.lock();
        state.calls += 1;
        if state.fail {
            bail!("OPAL_HARDWARE");
        }
        state.links.insert(gpu, (npu, lpid, mode));
        Ok(())
    }
}

/// Fixed PCI topology with one GPU linked to one NPU function.
pub struct StaticTopology {
    links: Mutex<HashMap<PciAddress, PciAddress>>,
    nodes: HashMap<PciAddress, &'static str>,
    host_bridges: HashMap<PciAddress, &'static str>,
}

impl StaticTopology {
    fn new() -> Self {
        StaticTopology {
            links: Mutex::new(HashMap::from([(GPU, NPU)])),
            nodes: HashMap::from([(GPU, GPU_PATH), (NPU, NPU_PATH)]),
            host_bridges: HashMap::from([(NPU, PHB_PATH)]),
        }
    }

    /// Removes the NVLink between `gpu` and its NPU.
    pub fn unlink(&self, gpu: PciAddress) {
        self.links.lock().remove(&gpu);
    }
}

impl PciTopology for StaticTopology {
    fn npu_device(&self, gpu: PciAddress, index: u32) -> Option<PciAddress> {
        if index != 0 {
            return None;
        }
        self.links.lock().get(&gpu).copied()
    }

    fn device_node_path(&self, dev: PciAddress) -> Option<String> {
        self.nodes.get(&dev).map(|p| p.to_string())
    }

    fn host_bridge_node_path(&self, dev: PciAddress) -> Option<String> {
        self.host_bridges.get(&dev).map(|p| p.to_string())
    }
}

/// A POWER9 host with one NVLink-attached GPU, described the way skiboot lays out the
/// devicetree.
pub struct TestPlatform {
    pub fdt: Fdt,
    pub topology: Arc<StaticTopology>,
    pub routing: Arc<RecordingRouting>,
    pub translation: Arc<RecordingTranslationTable>,
}

impl TestPlatform {
    pub fn new() -> Self {
        let mut fdt = Fdt::new();

        let mem = fdt.node_mut(MEMORY_PATH).unwrap();
        mem.set_prop("device_type", "memory").unwrap();
        mem.set_prop("reg", [GPU_RAM_BASE, GPU_RAM_SIZE].as_slice())
            .unwrap();
        mem.set_prop("phandle", MEMORY_PHANDLE).unwrap();

        fdt.node_mut(PHB_PATH)
            .unwrap()
            .set_prop("ibm,mmio-atsd", [MMIO_ATSD, MMIO_ATSD + 0x20].as_slice())
            .unwrap();

        let npu = fdt.node_mut(NPU_PATH).unwrap();
        npu.set_prop("memory-region", MEMORY_PHANDLE).unwrap();
        npu.set_prop("ibm,device-tgt-addr", NPU_TGT_ADDR).unwrap();

        fdt.node_mut(GPU_PATH)
            .unwrap()
            .set_prop("compatible", "pciex10de,1db1")
            .unwrap();

        TestPlatform {
            fdt,
            topology: Arc::new(StaticTopology::new()),
            routing: Arc::new(RecordingRouting::default()),
            translation: Arc::new(RecordingTranslationTable::default()),
        }
    }

    /// Snapshot of the host as seen by the regions.
    pub fn platform(&self) -> HostPlatform {
        HostPlatform {
            fdt: Arc::new(self.fdt.clone()),
            topology: self.topology.clone(),
            routing: self.routing.clone(),
            translation: self.translation.clone(),
        }
    }

    pub fn npu_node_mut(&mut self) -> &mut FdtNode {
        self.fdt.node_mut(NPU_PATH).unwrap()
    }

    pub fn memory_node_mut(&mut self) -> &mut FdtNode {
        self.fdt.node_mut(MEMORY_PATH).unwrap()
    }

    pub fn phb_node_mut(&mut self) -> &mut FdtNode {
        self.fdt.node_mut(PHB_PATH).unwrap()
    }
}

// Copyright 2019 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Host PCI topology and devicetree lookups for NVLink2 resources.

use cros_fdt::FdtNode;
use log::warn;

use super::Error;
use super::HostPlatform;
use super::Result;
use crate::mm::PAGE_SIZE;
use crate::pci::PciAddress;

/// Host PCI topology: which NPU functions a GPU is linked to and where devices live in the
/// devicetree.
pub trait PciTopology: Send + Sync {
    /// Returns the NPU function attached to `gpu` through NVLink number `index`.
    fn npu_device(&self, gpu: PciAddress, index: u32) -> Option<PciAddress>;

    /// Absolute devicetree path of the node describing `dev`.
    fn device_node_path(&self, dev: PciAddress) -> Option<String>;

    /// Absolute devicetree path of the host bridge (PHB) `dev` sits behind.
    fn host_bridge_node_path(&self, dev: PciAddress) -> Option<String>;
}

const MEMORY_REGION_PROP: &str = "memory-region";
const REG_PROP: &str = "reg";
const MMIO_ATSD_PROP: &str = "ibm,mmio-atsd";
const DEVICE_TGT_ADDR_PROP: &str = "ibm,device-tgt-addr";

fn device_node(platform: &HostPlatform, dev: PciAddress) -> Option<(String, &FdtNode)> {
    let path = platform.topology.device_node_path(dev)?;
    let node = platform.fdt.get_node(&path)?;
    Some((path, node))
}

/// Finds the GPU RAM window `(base, size)` described by the memory node that `npu`'s
/// `memory-region` property points at. `reg` must hold exactly one 64-bit address and one
/// 64-bit size, describing a page aligned window that does not wrap the address space.
pub(crate) fn gpu_memory_window(platform: &HostPlatform, npu: PciAddress) -> Result<(u64, u64)> {
    let (path, npu_node) = device_node(platform, npu).ok_or(Error::DeviceNodeNotFound(npu))?;
    let phandle = npu_node
        .get_prop::<Vec<u32>>(MEMORY_REGION_PROP)
        .and_then(|cells| cells.first().copied())
        .ok_or(Error::MemoryRegionPhandle(path))?;
    let mem_node = platform
        .fdt
        .node_by_phandle(phandle)
        .ok_or(Error::MemoryNodeNotFound(phandle))?;
    let (base, size) = match mem_node.get_prop::<Vec<u64>>(REG_PROP).as_deref() {
        Some(&[_, 0]) => return Err(Error::ZeroSizedWindow(mem_node.name().to_owned())),
        Some(&[base, size]) if base.checked_add(size).is_some() => (base, size),
        _ => return Err(Error::MemoryReg(mem_node.name().to_owned())),
    };
    if base % PAGE_SIZE != 0 || size % PAGE_SIZE != 0 {
        return Err(Error::UnalignedWindow { base, size });
    }
    Ok((base, size))
}

/// Looks up the ATSD register page for NVLink `index` in the `ibm,mmio-atsd` list of the PHB
/// that `npu` belongs to.
pub(crate) fn atsd_window(platform: &HostPlatform, npu: PciAddress, index: u32) -> Result<u64> {
    let mmio_atsd = platform
        .topology
        .host_bridge_node_path(npu)
        .and_then(|path| platform.fdt.get_node(&path))
        .and_then(|phb| phb.get_prop_u64_index(MMIO_ATSD_PROP, index as usize));
    mmio_atsd.ok_or_else(|| {
        warn!("{}: no ATSD found", npu);
        Error::AtsdNotFound(index)
    })
}

/// Reads the GPU target address the NPU uses for link translations of `npu`.
pub(crate) fn device_target_address(platform: &HostPlatform, npu: PciAddress) -> Result<u64> {
    device_node(platform, npu)
        .and_then(|(_, node)| node.get_prop::<u64>(DEVICE_TGT_ADDR_PROP))
        .ok_or_else(|| {
            warn!("{}: no {} found", npu, DEVICE_TGT_ADDR_PROP);
            Error::TargetAddressNotFound(npu)
        })
}

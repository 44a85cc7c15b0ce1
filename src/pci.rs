// Copyright 2019 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use std::fmt;
use std::fmt::Display;

use log::debug;
use vfio_sys::PCI_VENDOR_ID_IBM;
use vfio_sys::PCI_VENDOR_ID_NVIDIA;

use crate::nvlink2::atsd;
use crate::nvlink2::gpu_ram;
use crate::nvlink2::notifier::GroupNotifier;
use crate::nvlink2::Error;
use crate::nvlink2::HostPlatform;
use crate::nvlink2::Nvlink2Config;
use crate::nvlink2::Result;
use crate::vfio::RegionRegistrar;

/// IBM POWER9 NPU (NVLink2 processing unit) function.
pub const PCI_DEVICE_ID_IBM_NPU2: u16 = 0x04ea;

/// PCI Device Address, AKA Bus:Device.Function
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PciAddress {
    pub bus: u8,
    pub dev: u8,  /* u5 */
    pub func: u8, /* u3 */
}

impl Display for PciAddress {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{:04x}:{:02x}.{:0x}", self.bus, self.dev, self.func)
    }
}

impl PciAddress {
    const DEVICE_MASK: u8 = 0x1f;
    const FUNCTION_MASK: u8 = 0x07;

    pub const fn new(bus: u8, dev: u8, func: u8) -> Self {
        PciAddress {
            bus,
            dev: dev & Self::DEVICE_MASK,
            func: func & Self::FUNCTION_MASK,
        }
    }

    /// Parses `[domain:]bus:device.function`, as found in sysfs device names.
    pub fn from_string(address: &str) -> Option<Self> {
        let (rest, func) = address.rsplit_once('.')?;
        let mut fields = rest.rsplit(':');
        let dev = u8::from_str_radix(fields.next()?, 16).ok()?;
        let bus = u8::from_str_radix(fields.next()?, 16).ok()?;
        if let Some(domain) = fields.next() {
            u16::from_str_radix(domain, 16).ok()?;
        }
        if fields.next().is_some() {
            return None;
        }
        let func = u8::from_str_radix(func, 16).ok()?;
        if dev > Self::DEVICE_MASK || func > Self::FUNCTION_MASK {
            return None;
        }
        Some(PciAddress { bus, dev, func })
    }
}

/// Identity of a VFIO PCI device as read from its config space.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct PciDeviceInfo {
    pub address: PciAddress,
    pub vendor_id: u16,
    pub device_id: u16,
}

impl PciDeviceInfo {
    fn is_vendor(&self, vendor: u32) -> bool {
        u32::from(self.vendor_id) == vendor
    }
}

/// Sets up the NVLink2 regions a device needs while it is being enabled.
///
/// Returns the VFIO index of the region that was registered, or `None` when the device needs
/// none. A GPU without an NVLink companion is not an error.
pub fn enable_nvlink2_quirks(
    dev: &PciDeviceInfo,
    platform: &HostPlatform,
    notifier: &GroupNotifier,
    regions: &mut dyn RegionRegistrar,
    config: &Nvlink2Config,
) -> Result<Option<u32>> {
    if dev.is_vendor(PCI_VENDOR_ID_NVIDIA) && config.gpu_ram {
        return match gpu_ram::init(dev.address, platform, notifier, regions) {
            Ok(index) => Ok(Some(index)),
            Err(Error::NoCompanionNpu(gpu)) => {
                debug!("{}: not NVLink attached", gpu);
                Ok(None)
            }
            Err(e) => Err(e),
        };
    }
    if dev.is_vendor(PCI_VENDOR_ID_IBM) && dev.device_id == PCI_DEVICE_ID_IBM_NPU2 && config.atsd
    {
        return atsd::init(dev.address, platform, regions).map(Some);
    }
    Ok(None)
}

// Copyright 2019 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! NVLink2 passthrough for NVIDIA V100 GPUs attached to IBM POWER9 NPUs.
//!
//! Two kinds of host resources are exposed as VFIO device-specific regions:
//!
//! - the GPU's on-board RAM, which the CPU reaches coherently over NVLink and which is mapped
//!   into the guest on demand (see [`gpu_ram`]);
//! - the NPU's address translation shootdown (ATSD) register page (see [`atsd`]).
//!
//! NVLink traffic is routed by the NPU to a single logical partition. Whenever the VFIO group
//! is attached to or detached from a guest, [`notifier::OwnershipNotifier`] reprograms that
//! routing through [`NpuRouting`].

pub mod atsd;
pub mod gpu_ram;
pub mod notifier;
pub mod platform;

use std::fmt;
use std::io;
use std::sync::Arc;

use cros_fdt::Fdt;
use log::warn;
use remain::sorted;
use serde::Deserialize;
use serde::Serialize;
use sync::Mutex;
use thiserror::Error;

use crate::mm::TranslationTable;
use crate::pci::PciAddress;
use platform::PciTopology;

#[sorted]
#[derive(Error, Debug)]
pub enum Error {
    #[error("region is already mapped at {0:#x}")]
    AlreadyMapped(u64),
    #[error("no ATSD register window at NVLink index {0}")]
    AtsdNotFound(u32),
    #[error("no devicetree node for {0}")]
    DeviceNodeNotFound(PciAddress),
    #[error("failed to copy region data: {0}")]
    GuestCopy(io::Error),
    #[error("invalid region index {0}")]
    InvalidRegionIndex(u32),
    #[error("mmap of {len:#x} bytes exceeds region size {size:#x}")]
    MapTooLarge { len: u64, size: u64 },
    #[error("ATSD mmap must cover exactly one page, got {0:#x} bytes")]
    MapWrongSize(u64),
    #[error("GPU memory node with phandle {0:#x} not found")]
    MemoryNodeNotFound(u32),
    #[error("missing or malformed reg property on {0}")]
    MemoryReg(String),
    #[error("missing or malformed memory-region property on {0}")]
    MemoryRegionPhandle(String),
    #[error("no NVLink companion NPU for {0}")]
    NoCompanionNpu(PciAddress),
    #[error("offset {offset:#x} is outside region of size {size:#x}")]
    OffsetOutOfRange { offset: u64, size: u64 },
    #[error("out of memory")]
    OutOfMemory,
    #[error("failed to map ATSD page: {0:#}")]
    RemapAtsd(anyhow::Error),
    #[error("failed to reprogram NPU routing for {gpu}: {source:#}")]
    Routing { gpu: PciAddress, source: anyhow::Error },
    #[error("no ibm,device-tgt-addr for {0}")]
    TargetAddressNotFound(PciAddress),
    #[error("translation table rejected GPU memory: {0:#}")]
    TranslationRegister(anyhow::Error),
    #[error("failed to unregister GPU memory from the translation table: {0:#}")]
    TranslationUnregister(anyhow::Error),
    #[error("GPU memory window {base:#x}+{size:#x} is not page aligned")]
    UnalignedWindow { base: u64, size: u64 },
    #[error("unsupported group notifier events {0:#x}")]
    UnsupportedEvents(u64),
    #[error("region does not support {0}")]
    UnsupportedOperation(&'static str),
    #[error("GPU memory node {0} describes an empty window")]
    ZeroSizedWindow(String),
}

pub type Result<T> = std::result::Result<T, Error>;

/// Broad classification of an [`Error`], as seen by whoever dispatched the failing call.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ErrorKind {
    NotFound,
    InvalidArgument,
    AlreadyInUse,
    OutOfMemory,
    HardwareReject,
    IoFault,
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        use Error::*;
        match self {
            AlreadyMapped(_) => ErrorKind::AlreadyInUse,
            AtsdNotFound(_) | TargetAddressNotFound(_) => ErrorKind::NotFound,
            DeviceNodeNotFound(_)
            | InvalidRegionIndex(_)
            | MapTooLarge { .. }
            | MapWrongSize(_)
            | MemoryNodeNotFound(_)
            | MemoryRegionPhandle(_)
            | MemoryReg(_)
            | NoCompanionNpu(_)
            | OffsetOutOfRange { .. }
            | UnalignedWindow { .. }
            | UnsupportedEvents(_)
            | UnsupportedOperation(_)
            | ZeroSizedWindow(_) => ErrorKind::InvalidArgument,
            GuestCopy(_) => ErrorKind::IoFault,
            OutOfMemory => ErrorKind::OutOfMemory,
            RemapAtsd(_) | Routing { .. } | TranslationRegister(_) | TranslationUnregister(_) => {
                ErrorKind::HardwareReject
            }
        }
    }

    /// The errno a VFIO ioctl or file operation reports for this error.
    pub fn errno(&self) -> i32 {
        match self.kind() {
            ErrorKind::NotFound => libc::ENODEV,
            ErrorKind::InvalidArgument => libc::EINVAL,
            ErrorKind::AlreadyInUse => libc::EPERM,
            ErrorKind::OutOfMemory => libc::ENOMEM,
            ErrorKind::HardwareReject => libc::EIO,
            ErrorKind::IoFault => libc::EFAULT,
        }
    }
}

/// Result of a best-effort teardown.
///
/// Release never fails: anything that goes wrong is logged and recorded here so callers can
/// inspect it, but the resource is considered gone either way.
#[must_use]
#[derive(Debug, Default)]
pub struct ReleaseOutcome {
    warnings: Vec<Error>,
}

impl ReleaseOutcome {
    pub(crate) fn warn(&mut self, e: Error) {
        warn!("NVLink2 release: {}", e);
        self.warnings.push(e);
    }

    pub(crate) fn merge(&mut self, other: ReleaseOutcome) {
        self.warnings.extend(other.warnings);
    }

    pub fn warnings(&self) -> &[Error] {
        &self.warnings
    }

    pub fn is_clean(&self) -> bool {
        self.warnings.is_empty()
    }
}

/// Logical partition id of a guest. Partition 0 is the host.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PartitionId(pub u32);

impl PartitionId {
    pub const HOST: PartitionId = PartitionId(0);
}

impl fmt::Display for PartitionId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "lpid {}", self.0)
    }
}

/// Privilege mode the NPU applies to translated link traffic. The concrete MSR bits are owned
/// by the firmware interface.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum AccessMode {
    /// Host owns the link with full hypervisor privilege.
    HostExclusive,
    /// A guest partition owns the link; hypervisor privilege is withheld.
    Guest,
}

/// Firmware call that programs NPU link routing (OPAL `npu_map_lpar` on PowerNV).
pub trait NpuRouting: Send + Sync {
    /// Routes translations for `gpu`, which is linked through `npu`, to partition `lpid`.
    /// May block on firmware.
    fn map_lpar_dev(
        &self,
        npu: PciAddress,
        gpu: PciAddress,
        lpid: PartitionId,
        mode: AccessMode,
    ) -> anyhow::Result<()>;
}

/// Host services the NVLink2 regions depend on.
#[derive(Clone)]
pub struct HostPlatform {
    /// Host devicetree describing NPUs, PHBs and GPU memory.
    pub fdt: Arc<Fdt>,
    pub topology: Arc<dyn PciTopology>,
    pub routing: Arc<dyn NpuRouting>,
    pub translation: Arc<dyn TranslationTable>,
}

/// Device state shared by the GPU RAM region and its ownership notifier.
///
/// `guest` is the partition the NPU currently routes this GPU's link traffic to. It only
/// changes together with a successful routing reprogram, under its lock, so transitions are
/// serialized.
pub struct Nvlink2Device {
    gpu: PciAddress,
    npu: PciAddress,
    routing: Arc<dyn NpuRouting>,
    guest: Mutex<Option<PartitionId>>,
}

impl Nvlink2Device {
    pub fn new(gpu: PciAddress, npu: PciAddress, routing: Arc<dyn NpuRouting>) -> Self {
        Nvlink2Device {
            gpu,
            npu,
            routing,
            guest: Mutex::new(None),
        }
    }

    pub fn gpu(&self) -> PciAddress {
        self.gpu
    }

    pub fn npu(&self) -> PciAddress {
        self.npu
    }

    pub fn guest(&self) -> Option<PartitionId> {
        *self.guest.lock()
    }

    /// Routes link traffic to `guest`, or back to the host when `None`.
    pub fn set_guest(&self, guest: Option<PartitionId>) -> Result<()> {
        let mut current = self.guest.lock();
        let (lpid, mode) = match guest {
            Some(lpid) => (lpid, AccessMode::Guest),
            None => (PartitionId::HOST, AccessMode::HostExclusive),
        };
        self.routing
            .map_lpar_dev(self.npu, self.gpu, lpid, mode)
            .map_err(|source| Error::Routing {
                gpu: self.gpu,
                source,
            })?;
        *current = guest;
        Ok(())
    }
}

/// Which NVLink2 regions to expose.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
#[serde(deny_unknown_fields, rename_all = "kebab-case", default)]
pub struct Nvlink2Config {
    /// Expose the coherent GPU RAM region on NVIDIA GPUs.
    pub gpu_ram: bool,
    /// Expose the ATSD register region on IBM NPU functions.
    pub atsd: bool,
}

impl Default for Nvlink2Config {
    fn default() -> Self {
        Nvlink2Config {
            gpu_ram: true,
            atsd: true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::RecordingRouting;

    fn device(routing: &Arc<RecordingRouting>) -> Nvlink2Device {
        Nvlink2Device::new(
            PciAddress::new(4, 0, 0),
            PciAddress::new(7, 0, 0),
            routing.clone(),
        )
    }

    #[test]
    fn set_guest_routes() {
        let routing = Arc::new(RecordingRouting::default());
        let dev = device(&routing);
        assert_eq!(dev.guest(), None);

        dev.set_guest(Some(PartitionId(3))).unwrap();
        assert_eq!(dev.guest(), Some(PartitionId(3)));
        assert_eq!(
            routing.state(dev.gpu()),
            Some((dev.npu(), PartitionId(3), AccessMode::Guest))
        );

        dev.set_guest(None).unwrap();
        assert_eq!(dev.guest(), None);
        assert_eq!(
            routing.state(dev.gpu()),
            Some((dev.npu(), PartitionId::HOST, AccessMode::HostExclusive))
        );
    }

    #[test]
    fn rejected_routing_keeps_guest() {
        let routing = Arc::new(RecordingRouting::default());
        let dev = device(&routing);
        dev.set_guest(Some(PartitionId(1))).unwrap();
        routing.set_fail(true);
        let err = dev.set_guest(Some(PartitionId(2))).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::HardwareReject);
        assert_eq!(err.errno(), libc::EIO);
        assert_eq!(dev.guest(), Some(PartitionId(1)));
    }

    #[test]
    fn errno_mapping() {
        assert_eq!(Error::AlreadyMapped(0).errno(), libc::EPERM);
        assert_eq!(Error::AtsdNotFound(0).errno(), libc::ENODEV);
        assert_eq!(
            Error::OffsetOutOfRange { offset: 1, size: 1 }.errno(),
            libc::EINVAL
        );
        assert_eq!(Error::OutOfMemory.errno(), libc::ENOMEM);
        assert_eq!(
            Error::GuestCopy(io::Error::from(io::ErrorKind::UnexpectedEof)).errno(),
            libc::EFAULT
        );
    }

    #[test]
    fn release_outcome() {
        let mut outcome = ReleaseOutcome::default();
        assert!(outcome.is_clean());
        let mut other = ReleaseOutcome::default();
        other.warn(Error::OutOfMemory);
        outcome.merge(other);
        assert!(!outcome.is_clean());
        assert_eq!(outcome.warnings().len(), 1);
    }

    #[test]
    fn config_defaults() {
        let cfg: Nvlink2Config = serde_json::from_str("{}").unwrap();
        assert_eq!(cfg, Nvlink2Config::default());
        assert!(cfg.gpu_ram && cfg.atsd);

        let cfg: Nvlink2Config = serde_json::from_str(r#"{"atsd": false}"#).unwrap();
        assert!(cfg.gpu_ram);
        assert!(!cfg.atsd);

        serde_json::from_str::<Nvlink2Config>(r#"{"gpu-ram": true, "bogus": 1}"#)
            .expect_err("unknown fields are rejected");
    }
}

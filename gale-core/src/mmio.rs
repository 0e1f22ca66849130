//! MMIO dispatch plane: device trait and the physical-address routing table.

use crate::AddressRange;
use rangemap::RangeInclusiveMap;
use std::fmt::Debug;
use std::sync::Arc;
use thiserror::Error;

/// Direction of a device access.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum Access {
    Read,
    Write,
}

/// A memory-mapped device.
///
/// A device is handed the offset of the access relative to its region base
/// and a buffer of the access size: on [`Access::Read`] it fills the buffer
/// with little-endian data, on [`Access::Write`] it consumes it. Returning
/// `false` asks the caller to raise a load/store access fault at the
/// faulting address.
///
/// Devices are shared between hart threads and may block (e.g. on host I/O);
/// any internal state must be behind its own synchronization.
pub trait MmioDevice: Debug + Send + Sync {
    fn access(&self, offset: u32, buf: &mut [u8], access: Access) -> bool;
}

/// Routing table from guest physical address ranges to devices.
///
/// Regions never overlap; registration order is preserved and defines the
/// iteration order of [`MmioMap::regions`]. At most [`MmioMap::MAX_REGIONS`]
/// regions can be registered.
#[derive(Debug, Default)]
pub struct MmioMap {
    /// Physical range → index into `regions`.
    ranges: RangeInclusiveMap<u32, usize>,
    regions: Vec<Option<MmioRegion>>,
}

/// A single registered region: its physical range plus the device serving it.
#[derive(Debug, Clone)]
pub struct MmioRegion {
    range: AddressRange,
    device: Arc<dyn MmioDevice>,
}

impl MmioRegion {
    pub fn range(&self) -> AddressRange {
        self.range
    }

    pub fn device(&self) -> &Arc<dyn MmioDevice> {
        &self.device
    }
}

impl MmioMap {
    /// Upper bound on the number of registered regions.
    pub const MAX_REGIONS: usize = 256;

    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `device` for the half-open physical range `[base, end)`.
    pub fn attach(
        &mut self,
        base: u32,
        end: u32,
        device: Arc<dyn MmioDevice>,
    ) -> Result<(), MmioMapError> {
        let range =
            AddressRange::from_base_end(base, end).map_err(|_| MmioMapError::EmptyRegion)?;
        if self.ranges.overlaps(&range.into()) {
            return Err(MmioMapError::OverlappingRegions);
        }
        if self.regions.iter().flatten().count() >= Self::MAX_REGIONS {
            return Err(MmioMapError::TooManyRegions);
        }
        let index = self.regions.len();
        self.regions.push(Some(MmioRegion { range, device }));
        self.ranges.insert(range.into(), index);
        Ok(())
    }

    /// Removes the region whose base address is `base`, returning its device.
    pub fn detach(&mut self, base: u32) -> Option<Arc<dyn MmioDevice>> {
        let &index = self.ranges.get(&base)?;
        let region = self.regions[index].take()?;
        if region.range.start() != base {
            // `base` points into the middle of a region; put it back.
            self.regions[index] = Some(region);
            return None;
        }
        self.ranges.remove(region.range.into());
        Some(region.device)
    }

    /// All registered regions, in registration order.
    pub fn regions(&self) -> impl Iterator<Item = &MmioRegion> {
        self.regions.iter().flatten()
    }

    /// Routes the access at physical `address` of size `buf.len()` to the
    /// region containing it.
    ///
    /// The whole access must fall inside a single region, and the device must
    /// accept it; any failure is reported so the caller can raise an access
    /// fault.
    pub fn access(
        &self,
        address: u32,
        buf: &mut [u8],
        access: Access,
    ) -> Result<(), MmioAccessError> {
        let &index = self
            .ranges
            .get(&address)
            .ok_or(MmioAccessError::Unmapped)?;
        let region = self.regions[index]
            .as_ref()
            .expect("range table points at detached region");
        let last = address
            .checked_add(buf.len().saturating_sub(1) as u32)
            .ok_or(MmioAccessError::ExceedsRegion)?;
        if !region.range.contains(last) {
            return Err(MmioAccessError::ExceedsRegion);
        }
        let offset = address - region.range.start();
        match region.device.access(offset, buf, access) {
            true => Ok(()),
            false => Err(MmioAccessError::Refused),
        }
    }
}

#[derive(Error, Debug, Clone, Eq, PartialEq)]
pub enum MmioMapError {
    #[error("region overlaps with a previously registered region")]
    OverlappingRegions,
    #[error("region is empty")]
    EmptyRegion,
    #[error("too many regions registered")]
    TooManyRegions,
}

#[derive(Error, Debug, Clone, Eq, PartialEq)]
pub enum MmioAccessError {
    /// The address falls within no registered region.
    #[error("address maps to no device")]
    Unmapped,
    /// The access crosses a region boundary.
    #[error("access exceeds region boundary")]
    ExceedsRegion,
    /// The device refused the access.
    #[error("device refused access")]
    Refused,
}

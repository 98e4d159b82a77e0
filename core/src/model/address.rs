/// Mesh address classification
///
/// Every element of a provisioned node owns one 15-bit unicast address. The rest
/// of the 16-bit space is split into virtual (label UUID hashes), group, and the
/// fixed group addresses defined by the mesh profile.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Unassigned address (never valid on the air)
pub const UNASSIGNED_ADDRESS: u16 = 0x0000;

/// Highest unicast address
pub const MAX_UNICAST_ADDRESS: u16 = 0x7FFF;

/// First virtual address
pub const MIN_VIRTUAL_ADDRESS: u16 = 0x8000;

/// Last virtual address
pub const MAX_VIRTUAL_ADDRESS: u16 = 0xBFFF;

/// First group address
pub const MIN_GROUP_ADDRESS: u16 = 0xC000;

/// Last dynamically assignable group address
pub const MAX_GROUP_ADDRESS: u16 = 0xFEFF;

/// First fixed group address (all-proxies)
pub const MIN_FIXED_GROUP_ADDRESS: u16 = 0xFFFC;

/// Errors for address parsing and validation
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AddressError {
    #[error("Invalid hex address: {0}")]
    InvalidHex(String),
    #[error("Address 0x{0:04X} is not a valid unicast address")]
    NotUnicast(u16),
    #[error("Address 0x{0:04X} cannot be used in a proxy filter")]
    NotFilterable(u16),
    #[error("Unicast range of {0} elements does not fit in the address space")]
    RangeOverflow(u8),
}

/// Address class
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AddressKind {
    Unassigned,
    Unicast,
    Virtual,
    Group,
    /// 0xFF00..=0xFFFB, reserved for future use
    Reserved,
    FixedGroup,
}

/// A 16-bit mesh address
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct MeshAddress(pub u16);

impl MeshAddress {
    pub fn new(value: u16) -> Self {
        Self(value)
    }

    pub fn value(&self) -> u16 {
        self.0
    }

    /// Parse a hex string such as `"0x0003"`, `"C001"` or `"c001"`
    pub fn parse_hex(input: &str) -> Result<Self, AddressError> {
        let trimmed = input.trim();
        let digits = trimmed
            .strip_prefix("0x")
            .or_else(|| trimmed.strip_prefix("0X"))
            .unwrap_or(trimmed);

        if digits.is_empty() || digits.len() > 4 {
            return Err(AddressError::InvalidHex(input.to_string()));
        }

        u16::from_str_radix(digits, 16)
            .map(Self)
            .map_err(|_| AddressError::InvalidHex(input.to_string()))
    }

    pub fn kind(&self) -> AddressKind {
        match self.0 {
            UNASSIGNED_ADDRESS => AddressKind::Unassigned,
            0x0001..=MAX_UNICAST_ADDRESS => AddressKind::Unicast,
            MIN_VIRTUAL_ADDRESS..=MAX_VIRTUAL_ADDRESS => AddressKind::Virtual,
            MIN_GROUP_ADDRESS..=MAX_GROUP_ADDRESS => AddressKind::Group,
            0xFF00..=0xFFFB => AddressKind::Reserved,
            _ => AddressKind::FixedGroup,
        }
    }

    pub fn is_unicast(&self) -> bool {
        self.kind() == AddressKind::Unicast
    }

    /// Whether this address may be installed in a proxy filter list
    pub fn is_filterable(&self) -> bool {
        matches!(
            self.kind(),
            AddressKind::Unicast | AddressKind::Virtual | AddressKind::Group | AddressKind::FixedGroup
        )
    }

    pub fn ensure_unicast(self) -> Result<Self, AddressError> {
        if self.is_unicast() {
            Ok(self)
        } else {
            Err(AddressError::NotUnicast(self.0))
        }
    }

    pub fn ensure_filterable(self) -> Result<Self, AddressError> {
        if self.is_filterable() {
            Ok(self)
        } else {
            Err(AddressError::NotFilterable(self.0))
        }
    }
}

impl fmt::Display for MeshAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{}", hex::encode_upper(self.0.to_be_bytes()))
    }
}

impl From<u16> for MeshAddress {
    fn from(value: u16) -> Self {
        Self(value)
    }
}

/// Contiguous unicast range owned by one node: one address per element
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct UnicastRange {
    pub low: MeshAddress,
    pub high: MeshAddress,
}

impl UnicastRange {
    /// Create the range starting at `primary` covering `element_count` elements
    pub fn for_elements(primary: MeshAddress, element_count: u8) -> Result<Self, AddressError> {
        let primary = primary.ensure_unicast()?;
        if element_count == 0 {
            return Err(AddressError::RangeOverflow(element_count));
        }
        let high = primary.0 as u32 + element_count as u32 - 1;
        if high > MAX_UNICAST_ADDRESS as u32 {
            return Err(AddressError::RangeOverflow(element_count));
        }
        Ok(Self {
            low: primary,
            high: MeshAddress(high as u16),
        })
    }

    pub fn primary(&self) -> MeshAddress {
        self.low
    }

    pub fn len(&self) -> usize {
        (self.high.0 - self.low.0) as usize + 1
    }

    pub fn is_empty(&self) -> bool {
        false
    }

    pub fn contains(&self, address: MeshAddress) -> bool {
        address >= self.low && address <= self.high
    }

    pub fn overlaps(&self, other: &UnicastRange) -> bool {
        self.low <= other.high && other.low <= self.high
    }
}

impl fmt::Display for UnicastRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}..={}", self.low, self.high)
    }
}

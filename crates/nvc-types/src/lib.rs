#![forbid(unsafe_code)]

use serde::{Deserialize, Serialize};

/// Unit of transfer to and from the backing store, in bytes.
pub const PAGE_SIZE: usize = 256;

/// Bits to shift a byte address to obtain its page number.
pub const PAGE_SHIFT: u32 = 8;

/// The chip family multiplexes four device-select addresses in the high
/// address bits. Each select spans 64 KiB.
pub const NUM_CHIP_SELECTS: u32 = 4;

/// Bytes addressable behind a single chip select.
pub const BYTES_PER_SELECT: u32 = 64 * 1024;

/// Total addressable pages across all chip selects.
pub const TOTAL_PAGES: u32 = (NUM_CHIP_SELECTS * BYTES_PER_SELECT) / PAGE_SIZE as u32;

/// Total addressable bytes across all chip selects.
pub const TOTAL_BYTES: u32 = NUM_CHIP_SELECTS * BYTES_PER_SELECT;

/// Base bus address of the storage chip family; the low two bits carry the
/// chip select derived from address bits 17:16.
pub const CHIP_SELECT_BASE: u8 = 0x50;

/// Backing-store page number (byte address >> [`PAGE_SHIFT`]).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct PageId(pub u32);

impl PageId {
    /// Page containing the given byte address.
    #[must_use]
    pub fn containing(address: ByteAddress) -> Self {
        Self(address.0 >> PAGE_SHIFT)
    }

    /// Byte address of the first byte of this page.
    #[must_use]
    pub fn first_byte(self) -> ByteAddress {
        ByteAddress(self.0 << PAGE_SHIFT)
    }

    /// Device-select address for the bus transaction reaching this page.
    #[must_use]
    pub fn chip_select(self) -> u8 {
        CHIP_SELECT_BASE | ((self.first_byte().0 >> 16) & 0x03) as u8
    }
}

/// Byte address within the backing store's flat address space.
///
/// Unit-carrying wrapper to keep byte addresses and page numbers apart.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ByteAddress(pub u32);

impl ByteAddress {
    pub const ZERO: Self = Self(0);

    /// Add a byte count, returning `None` on overflow.
    #[must_use]
    pub fn checked_add(self, bytes: u32) -> Option<Self> {
        self.0.checked_add(bytes).map(Self)
    }

    /// Offset of this address within its page.
    #[must_use]
    pub fn page_offset(self) -> usize {
        (self.0 & (PAGE_SIZE as u32 - 1)) as usize
    }

    /// True if the address falls inside the chip family's address space.
    #[must_use]
    pub fn in_range(self) -> bool {
        self.0 < TOTAL_BYTES
    }
}

impl From<u32> for ByteAddress {
    fn from(raw: u32) -> Self {
        Self(raw)
    }
}

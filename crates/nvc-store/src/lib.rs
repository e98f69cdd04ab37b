#![forbid(unsafe_code)]
//! Backing store adapter for the page-organized settings EEPROM.
//!
//! Provides the [`SerialBus`] trait (the raw transaction layer), the
//! [`PageStore`] trait (whole-page read/write the cache consumes), and
//! [`EepromStore`], which frames page transfers for the chip family:
//! a 2-byte big-endian page offset header (low byte always 0, pages are
//! 256 bytes) followed by the page data, with the device-select address
//! derived from the high bits of the byte address.
//!
//! No cache logic lives here.

use nvc_error::{NvcError, Result};
use nvc_types::{PAGE_SIZE, PageId, TOTAL_PAGES};
use std::time::Duration;
use tracing::{info, trace};

/// Fill value an erased cell reads back as; the chip has no erase primitive,
/// so erasing means writing this to every byte.
pub const ERASE_FILL: u8 = 0xFF;

/// External failure-detection timer that must be fed during long
/// blocking operations to prevent a system reset.
pub trait Watchdog: Send + Sync {
    fn feed(&self);
}

/// Watchdog for hosts without one.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopWatchdog;

impl Watchdog for NoopWatchdog {
    fn feed(&self) {}
}

/// Raw serial bus transactions addressed by device-select.
pub trait SerialBus: Send + Sync {
    /// Transmit `bytes` to `device` as a single transaction, ending with a
    /// stop condition.
    fn write(&self, device: u8, bytes: &[u8]) -> Result<()>;

    /// Transmit `header` to `device`, then bulk-read `buf.len()` bytes
    /// without an intervening stop condition.
    fn write_then_read(&self, device: u8, header: &[u8], buf: &mut [u8]) -> Result<()>;
}

/// Whole-page I/O interface the cache depends on.
pub trait PageStore: Send + Sync {
    /// Read one page into `buf`.
    fn read_page(&self, page: PageId, buf: &mut [u8; PAGE_SIZE]) -> Result<()>;

    /// Write one page from `data`.
    fn write_page(&self, page: PageId, data: &[u8; PAGE_SIZE]) -> Result<()>;

    /// Total addressable pages.
    fn page_count(&self) -> u32;
}

/// Tuning for [`EepromStore`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EepromStoreConfig {
    /// Re-read each written page and compare. The chip acknowledges writes
    /// unconditionally, so this is the only end-to-end failure detection.
    pub verify_writes: bool,
    /// Minimum delay between page writes during a chip erase, sized to the
    /// chip's worst-case page write latency.
    pub erase_settle: Duration,
}

impl Default for EepromStoreConfig {
    fn default() -> Self {
        Self {
            verify_writes: true,
            erase_settle: Duration::from_millis(11),
        }
    }
}

/// Page store over a [`SerialBus`], framing transfers for the EEPROM family.
#[derive(Debug)]
pub struct EepromStore<B: SerialBus> {
    bus: B,
    config: EepromStoreConfig,
}

impl<B: SerialBus> EepromStore<B> {
    pub fn new(bus: B) -> Self {
        Self::with_config(bus, EepromStoreConfig::default())
    }

    pub fn with_config(bus: B, config: EepromStoreConfig) -> Self {
        Self { bus, config }
    }

    #[must_use]
    pub fn bus(&self) -> &B {
        &self.bus
    }

    fn check_range(page: PageId) -> Result<()> {
        if page.0 >= TOTAL_PAGES {
            return Err(NvcError::AddressRange {
                address: page.0.checked_shl(nvc_types::PAGE_SHIFT).unwrap_or(u32::MAX),
            });
        }
        Ok(())
    }

    /// 2-byte page offset header. Pages are 256 bytes, so the low byte of a
    /// page-aligned offset is always 0.
    fn page_header(page: PageId) -> [u8; 2] {
        [((page.first_byte().0 >> 8) & 0xFF) as u8, 0]
    }

    fn write_page_raw(&self, page: PageId, data: &[u8; PAGE_SIZE]) -> Result<()> {
        let header = Self::page_header(page);
        let mut frame = Vec::with_capacity(2 + PAGE_SIZE);
        frame.extend_from_slice(&header);
        frame.extend_from_slice(data);
        self.bus.write(page.chip_select(), &frame)
    }

    /// Write [`ERASE_FILL`] to every page of the addressable space.
    ///
    /// There is no hardware erase primitive. This blocks for the whole chip
    /// family (`page_count × erase_settle`) and feeds the watchdog between
    /// pages. Everything stored is lost.
    pub fn erase_chip(&self, watchdog: &dyn Watchdog) -> Result<()> {
        info!(pages = TOTAL_PAGES, "erasing entire backing store");
        let fill = [ERASE_FILL; PAGE_SIZE];
        for page in 0..TOTAL_PAGES {
            self.write_page_raw(PageId(page), &fill)?;
            std::thread::sleep(self.config.erase_settle);
            watchdog.feed();
        }
        info!("backing store erase complete");
        Ok(())
    }
}

impl<B: SerialBus> PageStore for EepromStore<B> {
    fn read_page(&self, page: PageId, buf: &mut [u8; PAGE_SIZE]) -> Result<()> {
        Self::check_range(page)?;
        trace!(page = page.0, "read page");
        let header = Self::page_header(page);
        self.bus.write_then_read(page.chip_select(), &header, buf)
    }

    fn write_page(&self, page: PageId, data: &[u8; PAGE_SIZE]) -> Result<()> {
        Self::check_range(page)?;
        trace!(page = page.0, "write page");
        self.write_page_raw(page, data)?;

        if self.config.verify_writes {
            let mut readback = [0_u8; PAGE_SIZE];
            let header = Self::page_header(page);
            self.bus
                .write_then_read(page.chip_select(), &header, &mut readback)?;
            if readback != *data {
                return Err(NvcError::WriteVerify { page: page.0 });
            }
        }
        Ok(())
    }

    fn page_count(&self) -> u32 {
        TOTAL_PAGES
    }
}

#![forbid(unsafe_code)]
//! NvCache public API facade.
//!
//! Re-exports the cache, scheduler, backing-store adapter and shared types
//! through one stable interface. Typical wiring:
//!
//! ```
//! use std::sync::Arc;
//! use std::time::Duration;
//! use nvc::{
//!     CacheConfig, CacheStore, DispatchMode, EepromStore, SerialBus,
//!     TICK_INTERVAL, TickScheduler, TimerDriver,
//! };
//!
//! # struct LoopbackBus;
//! # impl SerialBus for LoopbackBus {
//! #     fn write(&self, _device: u8, _bytes: &[u8]) -> nvc::Result<()> { Ok(()) }
//! #     fn write_then_read(&self, _device: u8, _header: &[u8], buf: &mut [u8]) -> nvc::Result<()> {
//! #         buf.fill(0);
//! #         Ok(())
//! #     }
//! # }
//! # struct IdleTimer;
//! # impl TimerDriver for IdleTimer {
//! #     fn start(&self, _channel: usize, _interval: Duration) -> nvc::Result<()> { Ok(()) }
//! #     fn max_interval(&self, _channel: usize) -> Duration { Duration::from_secs(60) }
//! # }
//! let cache = Arc::new(CacheStore::new(
//!     EepromStore::new(LoopbackBus),
//!     CacheConfig::default(),
//! ));
//! let scheduler = TickScheduler::new(IdleTimer, DispatchMode::Queued);
//! scheduler.attach(cache.clone(), TICK_INTERVAL)?;
//! // interrupt glue calls scheduler.on_timer_fire(n); the main loop calls
//! // scheduler.process() to run deferred cache maintenance.
//! # Ok::<(), nvc::NvcError>(())
//! ```

pub use nvc_cache::{CacheConfig, CacheMetrics, CacheStore, TICK_INTERVAL};
pub use nvc_error::{NvcError, Result};
pub use nvc_store::{
    EepromStore, EepromStoreConfig, ERASE_FILL, NoopWatchdog, PageStore, SerialBus, Watchdog,
};
pub use nvc_tick::{
    DispatchMode, MAX_CHANNELS, MAX_OBSERVERS_PER_CHANNEL, TICK_QUEUE_CAPACITY, TickObserver,
    TickScheduler, TimerDriver,
};
pub use nvc_types::{
    ByteAddress, CHIP_SELECT_BASE, PAGE_SHIFT, PAGE_SIZE, PageId, TOTAL_BYTES, TOTAL_PAGES,
};

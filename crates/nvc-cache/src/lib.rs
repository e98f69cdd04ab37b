#![forbid(unsafe_code)]
//! Fully-associative page cache between application code and the settings
//! EEPROM.
//!
//! Absorbs repeated small reads and writes into few whole-page bus
//! transactions. A fixed array of page slots is searched linearly by page id;
//! eviction prefers the oldest clean slot, and dirty slots are never
//! discarded without a write-back. The cache has no notion of time of its
//! own: a [`TickScheduler`](nvc_tick::TickScheduler) delivers periodic ticks
//! that age all slots and flush at most one fully-aged dirty page per tick,
//! bounding the bus latency any single tick can introduce.
//!
//! All state sits behind one mutex, so reads, writes and tick handling may
//! arrive from any execution context. Storage-mutating tick handlers should
//! still be dispatched through the scheduler's queued mode to keep bus
//! transactions out of interrupt context.

use nvc_error::{NvcError, Result};
use nvc_store::{NoopWatchdog, PageStore, Watchdog};
use nvc_tick::TickObserver;
use nvc_types::{ByteAddress, PAGE_SIZE, PageId};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, trace, warn};

/// Interval the cache expects to be ticked at.
pub const TICK_INTERVAL: Duration = Duration::from_millis(40);

/// Construction-time tuning for [`CacheStore`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheConfig {
    /// Number of page slots.
    pub num_pages: usize,
    /// Age at which a dirty page becomes eligible for the per-tick flush.
    /// Ages saturate here.
    pub max_age: u8,
    /// Minimum delay between page writes in [`CacheStore::flush_all`],
    /// sized to the chip's worst-case page write latency.
    pub settle: Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            num_pages: 16,
            max_age: 20,
            settle: Duration::from_millis(10),
        }
    }
}

/// One cache slot: an in-memory mirror of a backing-store page.
///
/// A slot with `page == None` is unused and is never dirty, with age 0.
struct PageSlot {
    page: Option<PageId>,
    data: [u8; PAGE_SIZE],
    dirty: bool,
    age: u8,
}

impl PageSlot {
    fn unused() -> Self {
        Self {
            page: None,
            data: [0_u8; PAGE_SIZE],
            dirty: false,
            age: 0,
        }
    }

    fn reset_unused(&mut self) {
        self.page = None;
        self.dirty = false;
        self.age = 0;
    }
}

/// Point-in-time cache counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheMetrics {
    pub capacity: usize,
    pub resident: usize,
    pub dirty: usize,
    pub hits: u64,
    pub misses: u64,
    pub flushes: u64,
}

struct CacheState {
    slots: Vec<PageSlot>,
    hits: u64,
    misses: u64,
    flushes: u64,
}

/// Fixed-capacity page cache over a [`PageStore`].
///
/// Slot contents are private: all access goes through the byte-level read
/// and write operations or the page-level flush/invalidate operations.
pub struct CacheStore<S: PageStore> {
    store: S,
    config: CacheConfig,
    watchdog: Arc<dyn Watchdog>,
    state: Mutex<CacheState>,
}

impl<S: PageStore> CacheStore<S> {
    pub fn new(store: S, config: CacheConfig) -> Self {
        Self::with_watchdog(store, config, Arc::new(NoopWatchdog))
    }

    pub fn with_watchdog(store: S, config: CacheConfig, watchdog: Arc<dyn Watchdog>) -> Self {
        Self {
            store,
            config,
            watchdog,
            state: Mutex::new(CacheState {
                slots: (0..config.num_pages).map(|_| PageSlot::unused()).collect(),
                hits: 0,
                misses: 0,
                flushes: 0,
            }),
        }
    }

    #[must_use]
    pub fn store(&self) -> &S {
        &self.store
    }

    #[must_use]
    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    // ── slot machinery ─────────────────────────────────────────────────────

    fn slot_of(state: &CacheState, page: PageId) -> Option<usize> {
        state.slots.iter().position(|slot| slot.page == Some(page))
    }

    /// Oldest clean resident slot, ties broken toward the later-scanned slot.
    fn oldest_clean(state: &CacheState) -> Option<usize> {
        let mut best: Option<(usize, u8)> = None;
        for (index, slot) in state.slots.iter().enumerate() {
            if slot.page.is_none() || slot.dirty {
                continue;
            }
            if best.is_none_or(|(_, age)| slot.age >= age) {
                best = Some((index, slot.age));
            }
        }
        best.map(|(index, _)| index)
    }

    /// Write slot `index` back to the store if dirty; clears dirty, resets age.
    fn flush_slot(&self, state: &mut CacheState, index: usize) -> Result<()> {
        if !state.slots[index].dirty {
            return Ok(());
        }
        let Some(page) = state.slots[index].page else {
            return Ok(());
        };
        self.store.write_page(page, &state.slots[index].data)?;
        let slot = &mut state.slots[index];
        slot.dirty = false;
        slot.age = 0;
        state.flushes += 1;
        debug!(page = page.0, slot = index, "flushed dirty page");
        Ok(())
    }

    /// Flush the first dirty slot in index order. No age priority; this
    /// path exists to make progress, not to amortize writes.
    fn flush_first_dirty(&self, state: &mut CacheState) -> Result<bool> {
        for index in 0..state.slots.len() {
            if state.slots[index].dirty {
                self.flush_slot(state, index)?;
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// Claim a slot for a new page: an unused slot if any, else the oldest
    /// clean slot, else force one flush and retry. Dirty data is never
    /// discarded.
    fn acquire_slot(&self, state: &mut CacheState) -> Result<usize> {
        if let Some(index) = state.slots.iter().position(|slot| slot.page.is_none()) {
            state.slots[index].reset_unused();
            return Ok(index);
        }

        if let Some(index) = Self::oldest_clean(state) {
            self.evict(state, index);
            return Ok(index);
        }

        // Every slot dirty: one forced flush, then one retry. A failed
        // write-back leaves the slot dirty and surfaces as exhaustion.
        if let Err(error) = self.flush_first_dirty(state) {
            warn!(%error, "forced flush failed during slot acquisition");
            return Err(NvcError::SlotsExhausted);
        }
        match Self::oldest_clean(state) {
            Some(index) => {
                self.evict(state, index);
                Ok(index)
            }
            None => Err(NvcError::SlotsExhausted),
        }
    }

    fn evict(&self, state: &mut CacheState, index: usize) {
        if let Some(page) = state.slots[index].page {
            debug!(page = page.0, slot = index, "evicting clean page");
        }
        state.slots[index].reset_unused();
    }

    /// Pull `page` into a freshly acquired slot.
    fn pull(&self, state: &mut CacheState, page: PageId) -> Result<usize> {
        let index = self.acquire_slot(state)?;
        trace!(page = page.0, slot = index, "pulling page");
        self.store.read_page(page, &mut state.slots[index].data)?;
        let slot = &mut state.slots[index];
        slot.page = Some(page);
        slot.dirty = false;
        slot.age = 0;
        state.misses += 1;
        Ok(index)
    }

    fn resolve(&self, state: &mut CacheState, page: PageId) -> Result<usize> {
        if let Some(index) = Self::slot_of(state, page) {
            state.hits += 1;
            return Ok(index);
        }
        self.pull(state, page)
    }

    // ── byte-level read/write ──────────────────────────────────────────────

    /// Read `out.len()` bytes starting at `address`.
    ///
    /// On failure the operation stops at the first byte whose page could not
    /// be cached; bytes already read remain in `out` (partial result, no
    /// rollback).
    pub fn read(&self, address: ByteAddress, out: &mut [u8]) -> Result<()> {
        let mut state = self.state.lock();
        for (offset, byte) in out.iter_mut().enumerate() {
            let addr = address
                .checked_add(offset as u32)
                .ok_or(NvcError::AddressRange { address: address.0 })?;
            let index = self.resolve(&mut state, PageId::containing(addr))?;
            *byte = state.slots[index].data[addr.page_offset()];
            if !state.slots[index].dirty {
                state.slots[index].age = 0;
            }
        }
        Ok(())
    }

    /// Write `data` starting at `address`, into cache memory only; the
    /// touched pages are marked dirty and flushed later by ticks.
    ///
    /// Not atomic across the requested length: on failure, bytes before the
    /// failure point are already applied and stay applied. Callers needing
    /// all-or-nothing semantics use [`CacheStore::write_atomic`].
    pub fn write(&self, address: ByteAddress, data: &[u8]) -> Result<()> {
        let mut state = self.state.lock();
        for (offset, byte) in data.iter().enumerate() {
            let addr = address
                .checked_add(offset as u32)
                .ok_or(NvcError::AddressRange { address: address.0 })?;
            let page = PageId::containing(addr);
            let index = self.resolve(&mut state, page)?;
            let slot = &mut state.slots[index];
            slot.data[addr.page_offset()] = *byte;
            slot.dirty = true;
            slot.page = Some(page);
        }
        Ok(())
    }

    /// Strict variant of [`CacheStore::write`]: every page of the span is
    /// faulted in first, and no byte is applied unless the whole span is
    /// resident at once. May still pull pages in (and evict clean ones) on
    /// the failure path, but never applies a partial write.
    pub fn write_atomic(&self, address: ByteAddress, data: &[u8]) -> Result<()> {
        if data.is_empty() {
            return Ok(());
        }
        let mut state = self.state.lock();
        let last = address
            .checked_add(data.len() as u32 - 1)
            .ok_or(NvcError::AddressRange { address: address.0 })?;
        let first_page = PageId::containing(address);
        let last_page = PageId::containing(last);
        let needed = (last_page.0 - first_page.0 + 1) as usize;
        if needed > self.config.num_pages {
            return Err(NvcError::AtomicSpan {
                needed,
                capacity: self.config.num_pages,
            });
        }

        for n in first_page.0..=last_page.0 {
            self.resolve(&mut state, PageId(n))?;
        }
        // Faulting a later page can evict an earlier one when every other
        // slot is dirty; the span must be simultaneously resident.
        let mut span = Vec::with_capacity(needed);
        for n in first_page.0..=last_page.0 {
            match Self::slot_of(&state, PageId(n)) {
                Some(index) => span.push(index),
                None => {
                    return Err(NvcError::AtomicSpan {
                        needed,
                        capacity: self.config.num_pages,
                    });
                }
            }
        }

        for (offset, byte) in data.iter().enumerate() {
            let addr = ByteAddress(address.0 + offset as u32);
            let index = span[(PageId::containing(addr).0 - first_page.0) as usize];
            let slot = &mut state.slots[index];
            slot.data[addr.page_offset()] = *byte;
            slot.dirty = true;
        }
        Ok(())
    }

    // ── typed accessors ────────────────────────────────────────────────────
    //
    // Multi-byte values are stored little-endian; only byte addressing is
    // assumed, no alignment.

    pub fn read_u8(&self, address: ByteAddress) -> Result<u8> {
        let mut raw = [0_u8; 1];
        self.read(address, &mut raw)?;
        Ok(raw[0])
    }

    pub fn read_u16(&self, address: ByteAddress) -> Result<u16> {
        let mut raw = [0_u8; 2];
        self.read(address, &mut raw)?;
        Ok(u16::from_le_bytes(raw))
    }

    pub fn read_u32(&self, address: ByteAddress) -> Result<u32> {
        let mut raw = [0_u8; 4];
        self.read(address, &mut raw)?;
        Ok(u32::from_le_bytes(raw))
    }

    pub fn read_f32(&self, address: ByteAddress) -> Result<f32> {
        let mut raw = [0_u8; 4];
        self.read(address, &mut raw)?;
        Ok(f32::from_le_bytes(raw))
    }

    pub fn write_u8(&self, address: ByteAddress, value: u8) -> Result<()> {
        self.write(address, &[value])
    }

    pub fn write_u16(&self, address: ByteAddress, value: u16) -> Result<()> {
        self.write(address, &value.to_le_bytes())
    }

    pub fn write_u32(&self, address: ByteAddress, value: u32) -> Result<()> {
        self.write(address, &value.to_le_bytes())
    }

    pub fn write_f32(&self, address: ByteAddress, value: f32) -> Result<()> {
        self.write(address, &value.to_le_bytes())
    }

    // ── flush / invalidate / age ───────────────────────────────────────────

    /// Flush the slot holding `page`, if resident and dirty.
    pub fn flush_page(&self, page: PageId) -> Result<()> {
        let mut state = self.state.lock();
        if let Some(index) = Self::slot_of(&state, page) {
            self.flush_slot(&mut state, index)?;
        }
        Ok(())
    }

    /// Flush the page containing `address`, if resident and dirty.
    pub fn flush_address(&self, address: ByteAddress) -> Result<()> {
        self.flush_page(PageId::containing(address))
    }

    /// Flush the first dirty slot in index order. Returns whether a page
    /// was written.
    pub fn flush_single_page(&self) -> Result<bool> {
        let mut state = self.state.lock();
        self.flush_first_dirty(&mut state)
    }

    /// Synchronously flush every dirty slot, pacing page writes by the
    /// configured settle delay and feeding the watchdog after each page.
    ///
    /// Blocks for up to `num_pages × settle`. Only call this where that is
    /// acceptable, e.g. at shutdown.
    pub fn flush_all(&self) -> Result<()> {
        let mut state = self.state.lock();
        let dirty = state.slots.iter().filter(|slot| slot.dirty).count();
        info!(dirty, "flushing all dirty pages");
        for index in 0..state.slots.len() {
            if state.slots[index].dirty {
                self.flush_slot(&mut state, index)?;
                std::thread::sleep(self.config.settle);
                self.watchdog.feed();
            }
        }
        Ok(())
    }

    fn invalidate_slot(&self, state: &mut CacheState, index: usize) -> Result<()> {
        self.flush_slot(state, index)?;
        state.slots[index].reset_unused();
        Ok(())
    }

    /// Flush `page` if dirty, then mark its slot unused so the next access
    /// re-reads the backing store.
    pub fn invalidate_page(&self, page: PageId) -> Result<()> {
        let mut state = self.state.lock();
        if let Some(index) = Self::slot_of(&state, page) {
            self.invalidate_slot(&mut state, index)?;
        }
        Ok(())
    }

    /// Invalidate the page containing `address`.
    pub fn invalidate_address(&self, address: ByteAddress) -> Result<()> {
        self.invalidate_page(PageId::containing(address))
    }

    /// Invalidate every slot, feeding the watchdog between slots. Use when
    /// coherency must be reset, e.g. after an external rewrite of the
    /// backing store.
    pub fn invalidate_all(&self) -> Result<()> {
        let mut state = self.state.lock();
        info!("invalidating all cached pages");
        for index in 0..state.slots.len() {
            self.invalidate_slot(&mut state, index)?;
            self.watchdog.feed();
        }
        Ok(())
    }

    /// Age the slot holding `page` to the maximum, scheduling it for flush
    /// at the very next tick. No-op if the page is not resident.
    pub fn age_fully_page(&self, page: PageId) {
        let mut state = self.state.lock();
        if let Some(index) = Self::slot_of(&state, page) {
            state.slots[index].age = self.config.max_age;
        }
    }

    /// Age the page containing `address` to the maximum.
    pub fn age_fully_address(&self, address: ByteAddress) {
        self.age_fully_page(PageId::containing(address));
    }

    /// Reserved for asynchronous write status; no write path is currently
    /// asynchronous.
    #[must_use]
    pub fn is_writing(&self) -> bool {
        false
    }

    // ── observability ──────────────────────────────────────────────────────

    #[must_use]
    pub fn dirty_count(&self) -> usize {
        self.state.lock().slots.iter().filter(|slot| slot.dirty).count()
    }

    /// Resident page ids in slot order.
    #[must_use]
    pub fn resident_pages(&self) -> Vec<PageId> {
        self.state
            .lock()
            .slots
            .iter()
            .filter_map(|slot| slot.page)
            .collect()
    }

    #[must_use]
    pub fn metrics(&self) -> CacheMetrics {
        let state = self.state.lock();
        CacheMetrics {
            capacity: state.slots.len(),
            resident: state.slots.iter().filter(|slot| slot.page.is_some()).count(),
            dirty: state.slots.iter().filter(|slot| slot.dirty).count(),
            hits: state.hits,
            misses: state.misses,
            flushes: state.flushes,
        }
    }

    fn age_all(state: &mut CacheState, max_age: u8) {
        for slot in &mut state.slots {
            if slot.page.is_some() && slot.age < max_age {
                slot.age += 1;
            }
        }
    }
}

impl<S: PageStore> TickObserver for CacheStore<S> {
    /// Age every resident slot, then flush at most one dirty fully-aged
    /// slot. Aging happens strictly before the flush choice, and one flush
    /// per tick bounds the bus latency a tick can introduce.
    fn handle_tick(&self) {
        let mut state = self.state.lock();
        Self::age_all(&mut state, self.config.max_age);

        let eligible = (0..state.slots.len())
            .find(|&index| state.slots[index].dirty && state.slots[index].age == self.config.max_age);
        if let Some(index) = eligible
            && let Err(error) = self.flush_slot(&mut state, index)
        {
            // Slot stays dirty and fully aged; retried on the next tick.
            warn!(%error, slot = index, "tick flush failed");
        }
    }
}

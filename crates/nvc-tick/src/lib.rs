#![forbid(unsafe_code)]
//! Periodic tick scheduling over a small set of hardware timer channels.
//!
//! Observers register with a desired interval; observers sharing an interval
//! are grouped onto one channel, up to a fixed capacity per channel. The
//! hardware fire path either dispatches observers directly or, in queued
//! mode, pushes them into a bounded ring drained by [`TickScheduler::process`]
//! outside interrupt context. Queued mode is the right choice whenever an
//! observer's tick handler can block on the storage bus.
//!
//! Registration failures are returned, never silently dropped, and a queue
//! overflow is counted and reported.

use nvc_error::{NvcError, Result};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Hardware timers held back for ticking; the platform has more, but the
/// rest stay free for other peripherals.
pub const MAX_CHANNELS: usize = 9;

/// Observers sharing one channel (and therefore one interval).
pub const MAX_OBSERVERS_PER_CHANNEL: usize = 8;

/// Deferred dispatch ring capacity.
pub const TICK_QUEUE_CAPACITY: usize = 32;

/// A periodic consumer of scheduler ticks.
pub trait TickObserver: Send + Sync {
    fn handle_tick(&self);
}

/// Hardware periodic-timer capability.
///
/// The scheduler starts a timer per allocated channel; the driver (or the
/// interrupt glue built on it) calls back into
/// [`TickScheduler::on_timer_fire`] with the channel index on every period.
pub trait TimerDriver: Send + Sync {
    /// Start channel `channel` firing every `interval`.
    fn start(&self, channel: usize, interval: Duration) -> Result<()>;

    /// Longest interval the underlying hardware timer can achieve on
    /// `channel`.
    fn max_interval(&self, channel: usize) -> Duration;
}

/// How timer fires reach observers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchMode {
    /// Invoke `handle_tick` from the fire path. Unsuitable for observers
    /// whose handlers can perform bus transactions.
    Direct,
    /// Enqueue observer references on fire; [`TickScheduler::process`]
    /// invokes the handlers later, outside interrupt context.
    Queued,
}

struct Channel {
    interval: Duration,
    observers: Vec<Arc<dyn TickObserver>>,
}

struct SchedulerState {
    channels: Vec<Option<Channel>>,
    queue: VecDeque<Arc<dyn TickObserver>>,
    dropped_ticks: u64,
}

/// Multiplexes registered observers onto bounded hardware timer channels.
pub struct TickScheduler<T: TimerDriver> {
    driver: T,
    mode: DispatchMode,
    state: Mutex<SchedulerState>,
}

impl<T: TimerDriver> TickScheduler<T> {
    pub fn new(driver: T, mode: DispatchMode) -> Self {
        Self {
            driver,
            mode,
            state: Mutex::new(SchedulerState {
                channels: (0..MAX_CHANNELS).map(|_| None).collect(),
                queue: VecDeque::with_capacity(TICK_QUEUE_CAPACITY),
                dropped_ticks: 0,
            }),
        }
    }

    #[must_use]
    pub fn mode(&self) -> DispatchMode {
        self.mode
    }

    #[must_use]
    pub fn driver(&self) -> &T {
        &self.driver
    }

    /// Register `observer` for a tick every `interval`.
    ///
    /// Joins a channel already running at that interval if one has a free
    /// observer slot; otherwise allocates a fresh channel and starts its
    /// hardware timer. Exhaustion of either resource is an error.
    pub fn attach(&self, observer: Arc<dyn TickObserver>, interval: Duration) -> Result<()> {
        let mut state = self.state.lock();

        for (index, channel) in state.channels.iter_mut().enumerate() {
            if let Some(channel) = channel
                && channel.interval == interval
                && channel.observers.len() < MAX_OBSERVERS_PER_CHANNEL
            {
                channel.observers.push(observer);
                debug!(channel = index, "observer joined existing channel");
                return Ok(());
            }
        }

        let Some(index) = state.channels.iter().position(Option::is_none) else {
            let interval_exists = state
                .channels
                .iter()
                .flatten()
                .any(|channel| channel.interval == interval);
            return Err(if interval_exists {
                NvcError::NoObserverSlot
            } else {
                NvcError::NoTimerChannel
            });
        };

        let max = self.driver.max_interval(index);
        if interval > max {
            return Err(NvcError::IntervalTooLong {
                requested_us: interval.as_micros(),
                max_us: max.as_micros(),
            });
        }

        self.driver.start(index, interval)?;
        debug!(channel = index, interval_us = interval.as_micros() as u64, "timer channel started");
        state.channels[index] = Some(Channel {
            interval,
            observers: vec![observer],
        });
        Ok(())
    }

    /// Remove `observer` from whichever channel holds it.
    ///
    /// The channel slot becomes reusable when its last observer leaves; the
    /// hardware timer is not stopped and keeps firing into an empty slot.
    /// Pending queued ticks for the observer are discarded.
    pub fn detach(&self, observer: &Arc<dyn TickObserver>) -> Result<()> {
        let mut state = self.state.lock();

        let mut found = None;
        for (index, slot) in state.channels.iter_mut().enumerate() {
            if let Some(channel) = slot {
                if let Some(pos) = channel
                    .observers
                    .iter()
                    .position(|held| Arc::ptr_eq(held, observer))
                {
                    channel.observers.remove(pos);
                    if channel.observers.is_empty() {
                        *slot = None;
                    }
                    found = Some(index);
                    break;
                }
            }
        }

        let Some(index) = found else {
            return Err(NvcError::ObserverNotFound);
        };
        state.queue.retain(|queued| !Arc::ptr_eq(queued, observer));
        debug!(channel = index, "observer detached");
        Ok(())
    }

    /// Entry point for the hardware timer interrupt of `channel`.
    ///
    /// Direct mode invokes every observer of the channel here. Queued mode
    /// only enqueues references; a full ring drops the tick, counts it, and
    /// reports [`NvcError::TickQueueFull`].
    pub fn on_timer_fire(&self, channel: usize) -> Result<()> {
        let mut state = self.state.lock();
        let Some(observers) = state
            .channels
            .get(channel)
            .and_then(|slot| slot.as_ref())
            .map(|held| held.observers.clone())
        else {
            return Ok(());
        };

        match self.mode {
            DispatchMode::Queued => {
                let mut dropped = false;
                for observer in observers {
                    if state.queue.len() >= TICK_QUEUE_CAPACITY {
                        state.dropped_ticks += 1;
                        dropped = true;
                    } else {
                        state.queue.push_back(observer);
                    }
                }
                if dropped {
                    warn!(channel, "deferred tick queue full, tick dropped");
                    return Err(NvcError::TickQueueFull);
                }
                Ok(())
            }
            DispatchMode::Direct => {
                drop(state);
                for observer in observers {
                    observer.handle_tick();
                }
                Ok(())
            }
        }
    }

    /// Drain the deferred queue, invoking each queued handler outside the
    /// fire path. Returns the number of handlers invoked.
    ///
    /// Only entries present when the call starts are drained, so a timer
    /// firing mid-drain cannot keep this loop alive forever.
    pub fn process(&self) -> usize {
        let mut budget = self.state.lock().queue.len();
        let mut dispatched = 0;
        while budget > 0 {
            let Some(observer) = self.state.lock().queue.pop_front() else {
                break;
            };
            observer.handle_tick();
            dispatched += 1;
            budget -= 1;
        }
        dispatched
    }

    /// Ticks dropped on the floor by a full deferred queue since startup.
    #[must_use]
    pub fn dropped_ticks(&self) -> u64 {
        self.state.lock().dropped_ticks
    }

    /// Entries currently waiting in the deferred queue.
    #[must_use]
    pub fn queued_len(&self) -> usize {
        self.state.lock().queue.len()
    }
}

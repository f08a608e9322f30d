//! CPU-time watchdog.
//!
//! The node marks itself busy whenever it enters script code. A monitor on
//! another thread calls [`WatchdogHandle::check`]; once a single entry runs
//! past its limit the handle trips, and the instruction hook installed in
//! the Lua state raises `FatalWatchdog` at the next check point.

use crate::bridge::raise;
use lantern_runtime::SandboxError;
use mlua::{HookTriggers, Lua, VmState};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Instructions between two looks at the trip flag.
pub const CHECK_INTERVAL: u32 = 1000;

#[derive(Debug)]
struct WatchdogState {
    // Entry the trip applies to; zero when nothing is tripped.
    tripped: AtomicU64,
    // Sequence number of the current or most recent entry.
    entry: AtomicU64,
    // Milliseconds since `epoch` plus one; zero while idle.
    busy_since: AtomicU64,
    limit_ms: AtomicU64,
    epoch: Instant,
}

/// Thread-safe handle shared between a node and its monitor.
///
/// A trip belongs to the script entry that was running when it happened.
/// A trip that lands after its entry returned, or while the node is idle,
/// never reaches later entries.
#[derive(Debug, Clone)]
pub struct WatchdogHandle {
    state: Arc<WatchdogState>,
}

impl Default for WatchdogHandle {
    fn default() -> Self {
        Self::new()
    }
}

impl WatchdogHandle {
    pub fn new() -> Self {
        Self {
            state: Arc::new(WatchdogState {
                tripped: AtomicU64::new(0),
                entry: AtomicU64::new(0),
                busy_since: AtomicU64::new(0),
                limit_ms: AtomicU64::new(0),
                epoch: Instant::now(),
            }),
        }
    }

    /// Deliver the fatal signal to the current entry.
    pub fn trip(&self) {
        self.trip_entry(self.state.entry.load(Ordering::SeqCst));
    }

    fn trip_entry(&self, entry: u64) {
        self.state.tripped.store(entry, Ordering::SeqCst);
    }

    /// Whether the current entry has been tripped.
    pub fn is_tripped(&self) -> bool {
        let tripped = self.state.tripped.load(Ordering::SeqCst);
        tripped != 0 && tripped == self.state.entry.load(Ordering::SeqCst)
    }

    pub(crate) fn reset(&self) {
        self.state.tripped.store(0, Ordering::SeqCst);
    }

    /// How long the current script entry has been running.
    pub fn busy_for(&self) -> Option<Duration> {
        match self.state.busy_since.load(Ordering::SeqCst) {
            0 => None,
            since => {
                let now = self.state.epoch.elapsed().as_millis() as u64;
                Some(Duration::from_millis(now.saturating_sub(since - 1)))
            }
        }
    }

    /// Limit of the current entry. Zero disables the monitor.
    pub fn limit(&self) -> Duration {
        Duration::from_millis(self.state.limit_ms.load(Ordering::SeqCst))
    }

    /// Trip if the current entry exceeded its limit. Returns whether it
    /// tripped.
    pub fn check(&self) -> bool {
        // Read the entry first: if it ends while we measure, the trip is
        // recorded against it and ignored by the next one.
        let entry = self.state.entry.load(Ordering::SeqCst);
        let limit = self.limit();
        if entry == 0 || limit.is_zero() {
            return false;
        }
        match self.busy_for() {
            Some(elapsed) if elapsed > limit => {
                self.trip_entry(entry);
                self.is_tripped()
            }
            _ => false,
        }
    }

    /// Mark the start of a script entry.
    pub(crate) fn enter(&self, limit: Duration) -> BusyGuard<'_> {
        let now = self.state.epoch.elapsed().as_millis() as u64;
        self.state
            .limit_ms
            .store(limit.as_millis() as u64, Ordering::SeqCst);
        self.state.busy_since.store(now + 1, Ordering::SeqCst);
        self.state.tripped.store(0, Ordering::SeqCst);
        self.state.entry.fetch_add(1, Ordering::SeqCst);
        BusyGuard { handle: self }
    }
}

/// Clears the busy mark when dropped.
pub(crate) struct BusyGuard<'a> {
    handle: &'a WatchdogHandle,
}

impl Drop for BusyGuard<'_> {
    fn drop(&mut self) {
        self.handle.state.busy_since.store(0, Ordering::SeqCst);
    }
}

/// Install the instruction hook that turns a trip into a script error.
pub(crate) fn install(lua: &Lua, handle: WatchdogHandle) {
    lua.set_hook(
        HookTriggers::new().every_nth_instruction(CHECK_INTERVAL),
        move |_, _| {
            if handle.is_tripped() {
                return Err(raise(SandboxError::FatalWatchdog));
            }
            Ok(VmState::Continue)
        },
    );
}

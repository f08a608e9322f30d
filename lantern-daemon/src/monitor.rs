//! Watchdog monitor thread.
//!
//! The node runs on the daemon's main thread, so a runaway script blocks
//! the event loop. The monitor lives on its own OS thread and trips the
//! node's [`WatchdogHandle`] once a single script entry runs too long.

use lantern_node::WatchdogHandle;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, warn};

/// Running monitor; stopped on [`WatchdogMonitor::stop`] or drop.
pub struct WatchdogMonitor {
    stop: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

impl WatchdogMonitor {
    pub fn spawn(handle: WatchdogHandle, interval: Duration) -> std::io::Result<Self> {
        let stop = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&stop);

        let thread = thread::Builder::new()
            .name("lantern-watchdog".to_string())
            .spawn(move || {
                debug!(interval_ms = interval.as_millis() as u64, "Watchdog monitor started");
                while !flag.load(Ordering::SeqCst) {
                    thread::sleep(interval);
                    if !handle.is_tripped() && handle.check() {
                        warn!(
                            limit_ms = handle.limit().as_millis() as u64,
                            "Script exceeded its CPU limit, aborting"
                        );
                    }
                }
                debug!("Watchdog monitor stopped");
            })?;

        Ok(Self {
            stop,
            thread: Some(thread),
        })
    }

    pub fn stop(&mut self) {
        self.stop.store(true, Ordering::SeqCst);
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                warn!("Watchdog monitor panicked");
            }
        }
    }
}

impl Drop for WatchdogMonitor {
    fn drop(&mut self) {
        self.stop();
    }
}

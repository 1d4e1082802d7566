// Liveness watchdog
//
// Fed only by control ticks that got their commands out. If feeding stops
// the process is reset from outside the control task: by the kernel's
// hardware watchdog driver, or by a supervisor thread that exits the
// process for the service manager to restart.

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::thread;
use std::time::{Duration, Instant};
use tracing::{error, info, warn};

pub trait Watchdog {
    fn feed(&mut self);
}

/// Linux watchdog device (/dev/watchdog). The timeout is the driver's,
/// set through its module parameters.
pub struct DeviceWatchdog {
    file: File,
}

impl DeviceWatchdog {
    pub fn open(path: &Path) -> std::io::Result<Self> {
        let file = OpenOptions::new().write(true).open(path)?;
        info!("Hardware watchdog armed on {}", path.display());
        Ok(Self { file })
    }
}

impl Watchdog for DeviceWatchdog {
    fn feed(&mut self) {
        if let Err(e) = self.file.write_all(b"\0").and_then(|_| self.file.flush()) {
            warn!("Watchdog feed failed: {}", e);
        }
    }
}

/// Independent thread that terminates the process when not fed in time
pub struct ThreadWatchdog {
    start: Instant,
    last_feed_ms: Arc<AtomicU64>,
}

impl ThreadWatchdog {
    pub fn spawn(timeout: Duration) -> std::io::Result<Self> {
        let start = Instant::now();
        let last_feed_ms = Arc::new(AtomicU64::new(0));
        let seen = Arc::clone(&last_feed_ms);
        let timeout_ms = timeout.as_millis() as u64;

        thread::Builder::new()
            .name("watchdog".into())
            .spawn(move || {
                loop {
                    thread::sleep(Duration::from_millis((timeout_ms / 10).max(1)));
                    let now = start.elapsed().as_millis() as u64;
                    let age = now.saturating_sub(seen.load(Ordering::Relaxed));
                    if age > timeout_ms {
                        error!("Watchdog expired ({} ms without a control tick), exiting", age);
                        std::process::exit(70);
                    }
                }
            })?;

        info!("Software watchdog armed, {} ms timeout", timeout_ms);
        Ok(Self {
            start,
            last_feed_ms,
        })
    }
}

impl Watchdog for ThreadWatchdog {
    fn feed(&mut self) {
        let now = self.start.elapsed().as_millis() as u64;
        self.last_feed_ms.store(now, Ordering::Relaxed);
    }
}

/// For tests and bench runs
#[derive(Debug, Default)]
pub struct NullWatchdog {
    pub feeds: u64,
}

impl Watchdog for NullWatchdog {
    fn feed(&mut self) {
        self.feeds += 1;
    }
}

impl<W: Watchdog + ?Sized> Watchdog for Box<W> {
    fn feed(&mut self) {
        (**self).feed()
    }
}

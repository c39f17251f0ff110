//! Hardware watchdog keep-alive
//!
//! Erasing or programming a large flash can take minutes, so the engine pets
//! the watchdog before each phase.

use log::{debug, info, warn};
use std::fs::OpenOptions;
use std::os::unix::io::AsRawFd;
use std::path::PathBuf;
use std::thread;
use std::time::Duration;

// WDIOC_KEEPALIVE = _IOR('W', 5, int)
nix::ioctl_read!(wdioc_keepalive, b'W', 5, libc::c_int);
// WDIOC_SETTIMEOUT = _IOWR('W', 6, int)
nix::ioctl_readwrite!(wdioc_settimeout, b'W', 6, libc::c_int);

/// Number of keep-alive attempts before giving up
pub const PET_ATTEMPTS: usize = 10;

/// Something that keeps the system from being reset mid-flash
pub trait Watchdog {
    /// Best effort; never fails the caller
    fn pet(&self);
}

/// No watchdog, e.g. for tests
#[derive(Debug, Default, Clone, Copy)]
pub struct NoWatchdog;

impl Watchdog for NoWatchdog {
    fn pet(&self) {}
}

/// Linux `/dev/watchdog`
#[derive(Debug, Clone)]
pub struct DevWatchdog {
    path: PathBuf,
    timeout_secs: u32,
}

impl DevWatchdog {
    pub fn new(path: impl Into<PathBuf>, timeout_secs: u32) -> Self {
        Self {
            path: path.into(),
            timeout_secs,
        }
    }

    /// Extend the timeout and send one keep-alive
    ///
    /// The previous timeout is not restored: the system reboots after an
    /// update anyway. Fails while another process (healthd) holds the
    /// device open.
    fn try_pet(&self) -> bool {
        let file = match OpenOptions::new().read(true).write(true).open(&self.path) {
            Ok(file) => file,
            Err(e) => {
                debug!("Cannot open {}: {}", self.path.display(), e);
                return false;
            }
        };
        let fd = file.as_raw_fd();

        // The kernel may lower the timeout to what the hardware supports
        let mut timeout = self.timeout_secs as libc::c_int;
        // SAFETY: valid descriptor and a valid, writable c_int
        let set = unsafe { wdioc_settimeout(fd, &mut timeout) };
        if let Err(e) = set {
            warn!("ioctl WDIOC_SETTIMEOUT failed: {}", e);
        }

        let mut unused: libc::c_int = 0;
        // SAFETY: valid descriptor; the argument is ignored by the kernel
        let keepalive = unsafe { wdioc_keepalive(fd, &mut unused) };
        if let Err(e) = keepalive {
            warn!("ioctl WDIOC_KEEPALIVE failed: {}", e);
        }

        set.is_ok() && keepalive.is_ok()
    }
}

impl Watchdog for DevWatchdog {
    fn pet(&self) {
        for _ in 0..PET_ATTEMPTS {
            if self.try_pet() {
                info!("Watchdog petted");
                return;
            }
            // Lets the daemon holding the watchdog get some CPU time
            thread::sleep(Duration::from_millis(1));
        }
        info!("Watchdog not petted; yielded CPU instead");
    }
}

//! Resource usage probes for the current process.
//!
//! Three measurements are exposed, each returning `None` when the platform cannot provide it:
//!
//! - resident set size, in bytes
//! - cumulative user CPU time
//! - number of open sockets
//!
//! ## Linux
//!
//! Resident set size comes from `/proc/self/smaps_rollup` (Linux 4.14+), falling back to `/proc/self/statm`. Open
//! sockets are counted by resolving the links in `/proc/self/fd`.
//!
//! ## Other Unix platforms
//!
//! Only CPU time is available, through `getrusage(2)`.

use std::time::Duration;

#[cfg(target_os = "linux")]
mod linux;

/// Probes resource usage of the running process.
#[derive(Debug, Default)]
pub struct Querier {
    #[cfg(target_os = "linux")]
    inner: linux::Querier,
}

impl Querier {
    /// Returns the resident set size of this process, in bytes.
    pub fn resident_set_size(&mut self) -> Option<u64> {
        #[cfg(target_os = "linux")]
        {
            self.inner.resident_set_size()
        }

        #[cfg(not(target_os = "linux"))]
        {
            None
        }
    }

    /// Returns the number of sockets currently held open by this process.
    pub fn open_sockets(&mut self) -> Option<u64> {
        #[cfg(target_os = "linux")]
        {
            self.inner.open_sockets()
        }

        #[cfg(not(target_os = "linux"))]
        {
            None
        }
    }

    /// Returns the total time this process has spent executing in user mode.
    pub fn user_cpu_time(&self) -> Option<Duration> {
        user_cpu_time()
    }
}

#[cfg(unix)]
fn user_cpu_time() -> Option<Duration> {
    let mut usage = std::mem::MaybeUninit::<libc::rusage>::uninit();

    // SAFETY: `getrusage` fully initializes the struct when it returns 0.
    let usage = unsafe {
        if libc::getrusage(libc::RUSAGE_SELF, usage.as_mut_ptr()) != 0 {
            return None;
        }
        usage.assume_init()
    };

    let secs = u64::try_from(usage.ru_utime.tv_sec).ok()?;
    let micros = u32::try_from(usage.ru_utime.tv_usec).ok()?;
    Some(Duration::from_secs(secs) + Duration::from_micros(u64::from(micros)))
}

#[cfg(not(unix))]
fn user_cpu_time() -> Option<Duration> {
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[cfg(unix)]
    #[test]
    fn cpu_time_is_monotonic() {
        let querier = Querier::default();
        let before = querier.user_cpu_time().unwrap();

        // Burn a little CPU so the counter has a chance to move.
        let mut acc = 0u64;
        for i in 0..5_000_000u64 {
            acc = acc.wrapping_mul(31).wrapping_add(i);
        }
        std::hint::black_box(acc);

        let after = querier.user_cpu_time().unwrap();
        assert!(after >= before);
    }
}

//! System clock synchronisation from the broadcast Time and Date Table.
//!
//! A correction is only made when two consecutive TDTs agree on the
//! difference to the local clock. Large differences are corrected with a
//! hard set, moderate ones with a rate-limited slew.

use std::io;
use std::sync::Arc;

use log::{error, info, trace};
use parking_lot::Mutex;

/// Differences up to this many seconds are left alone.
pub const MAX_TIME_DIFF: i64 = 1;
/// Differences above this many seconds are set, not slewed.
pub const MAX_ADJ_DIFF: i64 = 10;
/// Minimum seconds between two slews.
pub const ADJ_DELTA: i64 = 300;

/// Access to the host clock.
pub trait SystemClock: Send + Sync {
    /// Current UTC time in UNIX seconds.
    fn now(&self) -> i64;
    /// Set the clock.
    fn set_time(&self, utc: i64) -> io::Result<()>;
    /// Slew the clock by `delta` seconds.
    fn adjust_time(&self, delta: i64) -> io::Result<()>;
}

/// The real system clock.
#[derive(Debug, Default, Clone, Copy)]
pub struct OsClock;

impl SystemClock for OsClock {
    fn now(&self) -> i64 {
        chrono::Utc::now().timestamp()
    }

    #[cfg(unix)]
    fn set_time(&self, utc: i64) -> io::Result<()> {
        use nix::sys::time::TimeSpec;
        use nix::time::{clock_settime, ClockId};

        clock_settime(ClockId::CLOCK_REALTIME, TimeSpec::new(utc as libc::time_t, 0)).map_err(io::Error::from)
    }

    #[cfg(not(unix))]
    fn set_time(&self, _utc: i64) -> io::Result<()> {
        Err(io::Error::new(io::ErrorKind::Unsupported, "setting the clock is not supported"))
    }

    #[cfg(unix)]
    fn adjust_time(&self, delta: i64) -> io::Result<()> {
        let delta = libc::timeval {
            tv_sec: delta as libc::time_t,
            tv_usec: 0,
        };
        // SAFETY: `delta` outlives the call and a null old delta is allowed.
        let rc = unsafe { libc::adjtime(&delta, std::ptr::null_mut()) };
        if rc == 0 {
            Ok(())
        } else {
            Err(io::Error::last_os_error())
        }
    }

    #[cfg(not(unix))]
    fn adjust_time(&self, _delta: i64) -> io::Result<()> {
        Err(io::Error::new(io::ErrorKind::Unsupported, "adjusting the clock is not supported"))
    }
}

/// Observations carried between two TDTs.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ClockSyncState {
    /// Local time of the last slew.
    pub last_adjust: i64,
    /// Broadcast time of the last TDT that differed from the local clock.
    pub last_broadcast_time: i64,
    /// Difference observed with that TDT.
    pub last_diff: i64,
}

/// Result of one TDT.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClockAction {
    /// Within tolerance.
    InSync,
    /// Waiting for a second TDT to confirm the difference.
    Unconfirmed,
    /// The clock was set.
    Set { from: i64, to: i64 },
    /// A slew was started.
    Adjusted { diff: i64 },
    /// A slew is due but the last one was too recent.
    Deferred,
    /// The clock call failed.
    Failed,
}

/// Debounced clock correction.
pub struct ClockSync {
    clock: Arc<dyn SystemClock>,
    state: Mutex<ClockSyncState>,
}

impl ClockSync {
    pub fn new(clock: Arc<dyn SystemClock>) -> Self {
        Self {
            clock,
            state: Mutex::new(ClockSyncState::default()),
        }
    }

    pub fn state(&self) -> ClockSyncState {
        *self.state.lock()
    }

    /// Compare a broadcast UTC time with the local clock and correct it.
    pub fn process(&self, broadcast: i64) -> ClockAction {
        let local = self.clock.now();
        let diff = broadcast - local;
        if diff.abs() <= MAX_TIME_DIFF {
            return ClockAction::InSync;
        }

        let mut state = self.state.lock();
        let confirmed = state.last_broadcast_time != broadcast && state.last_diff == diff;
        let action = if !confirmed {
            trace!("[TDT] Clock differs by {}s, waiting for confirmation", diff);
            ClockAction::Unconfirmed
        } else if diff.abs() > MAX_ADJ_DIFF {
            match self.clock.set_time(broadcast) {
                Ok(()) => {
                    info!(
                        "[TDT] System time changed from {} ({}) to {} ({})",
                        format_time(local),
                        local,
                        format_time(broadcast),
                        broadcast
                    );
                    ClockAction::Set { from: local, to: broadcast }
                }
                Err(e) => {
                    error!("[TDT] Failed to set system time: {}", e);
                    ClockAction::Failed
                }
            }
        } else if self.clock.now() - state.last_adjust > ADJ_DELTA {
            state.last_adjust = self.clock.now();
            match self.clock.adjust_time(diff) {
                Ok(()) => {
                    info!(
                        "[TDT] System time adjustment initiated from {} ({}) to {} ({})",
                        format_time(local),
                        local,
                        format_time(broadcast),
                        broadcast
                    );
                    ClockAction::Adjusted { diff }
                }
                Err(e) => {
                    error!("[TDT] Failed to adjust system time: {}", e);
                    ClockAction::Failed
                }
            }
        } else {
            ClockAction::Deferred
        };

        state.last_broadcast_time = broadcast;
        state.last_diff = diff;
        action
    }
}

fn format_time(t: i64) -> String {
    chrono::DateTime::from_timestamp(t, 0)
        .map(|t| t.with_timezone(&chrono::Local).format("%Y-%m-%d %H:%M:%S").to_string())
        .unwrap_or_else(|| t.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicI64, Ordering};

    #[derive(Default)]
    struct FakeClock {
        now: AtomicI64,
        calls: Mutex<Vec<String>>,
        fail: bool,
    }

    impl FakeClock {
        fn at(now: i64) -> Arc<Self> {
            Arc::new(Self {
                now: AtomicI64::new(now),
                ..Default::default()
            })
        }
    }

    impl SystemClock for FakeClock {
        fn now(&self) -> i64 {
            self.now.load(Ordering::SeqCst)
        }

        fn set_time(&self, utc: i64) -> io::Result<()> {
            self.calls.lock().push(format!("set {}", utc));
            if self.fail {
                return Err(io::Error::from(io::ErrorKind::PermissionDenied));
            }
            self.now.store(utc, Ordering::SeqCst);
            Ok(())
        }

        fn adjust_time(&self, delta: i64) -> io::Result<()> {
            self.calls.lock().push(format!("adjust {}", delta));
            Ok(())
        }
    }

    const T: i64 = 1_700_000_000;

    #[test]
    fn test_small_difference_ignored() {
        let clock = FakeClock::at(T);
        let sync = ClockSync::new(clock.clone());
        assert_eq!(sync.process(T + 1), ClockAction::InSync);
        assert_eq!(sync.process(T - 1), ClockAction::InSync);
        assert_eq!(sync.state(), ClockSyncState::default());
    }

    #[test]
    fn test_large_difference_needs_two_agreeing_reads() {
        let clock = FakeClock::at(T);
        let sync = ClockSync::new(clock.clone());

        assert_eq!(sync.process(T + 60), ClockAction::Unconfirmed);
        // Same broadcast time again does not confirm
        assert_eq!(sync.process(T + 60), ClockAction::Unconfirmed);

        clock.now.store(T + 1, Ordering::SeqCst);
        assert_eq!(sync.process(T + 61), ClockAction::Set { from: T + 1, to: T + 61 });
        assert_eq!(clock.calls.lock().as_slice(), ["set 1700000061"]);
    }

    #[test]
    fn test_moderate_difference_is_slewed_and_rate_limited() {
        let clock = FakeClock::at(T);
        let sync = ClockSync::new(clock.clone());

        assert_eq!(sync.process(T + 5), ClockAction::Unconfirmed);
        clock.now.store(T + 1, Ordering::SeqCst);
        assert_eq!(sync.process(T + 6), ClockAction::Adjusted { diff: 5 });
        assert_eq!(sync.state().last_adjust, T + 1);

        clock.now.store(T + 2, Ordering::SeqCst);
        assert_eq!(sync.process(T + 7), ClockAction::Deferred);

        clock.now.store(T + 400, Ordering::SeqCst);
        assert_eq!(sync.process(T + 405), ClockAction::Adjusted { diff: 5 });
        assert_eq!(clock.calls.lock().len(), 2);
    }

    #[test]
    fn test_failure_keeps_state() {
        let clock = Arc::new(FakeClock {
            now: AtomicI64::new(T),
            fail: true,
            ..Default::default()
        });
        let sync = ClockSync::new(clock.clone());
        sync.process(T + 100);
        clock.now.store(T + 1, Ordering::SeqCst);
        assert_eq!(sync.process(T + 101), ClockAction::Failed);
        let state = sync.state();
        assert_eq!(state.last_broadcast_time, T + 101);
        assert_eq!(state.last_diff, 100);
    }
}

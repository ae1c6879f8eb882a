// Copyright 2019 TiKV Project Authors. Licensed under Apache-2.0.

use std::ptr::null_mut;
use std::time::Duration;

use nix::errno::Errno;

use crate::Result;

/// Process-wide `ITIMER_PROF` interval timer. Expirations are delivered as
/// `SIGPROF` to whichever thread is consuming CPU.
pub struct Timer {
    interval: Duration,
}

impl Timer {
    /// Arms the timer with `interval` between expirations.
    pub fn arm(interval: Duration) -> Result<Timer> {
        let it_interval = libc::timeval {
            tv_sec: interval.as_secs() as libc::time_t,
            tv_usec: interval.subsec_micros() as libc::suseconds_t,
        };
        Self::set(it_interval)?;

        Ok(Timer { interval })
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    fn set(it_interval: libc::timeval) -> Result<()> {
        let it_value = it_interval;
        let ret = unsafe {
            libc::setitimer(
                libc::ITIMER_PROF,
                &libc::itimerval {
                    it_interval,
                    it_value,
                },
                null_mut(),
            )
        };
        Errno::result(ret)?;

        Ok(())
    }
}

impl Drop for Timer {
    fn drop(&mut self) {
        let it_interval = libc::timeval {
            tv_sec: 0,
            tv_usec: 0,
        };
        if let Err(err) = Self::set(it_interval) {
            log::error!("failed to disarm profiling timer: {}", err);
        }
    }
}

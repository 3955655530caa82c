//! Time spent blocked in synchronization calls, per call kind.
//!
//! Compiled to no-ops unless the `timed` feature is on.

use std::io;

#[cfg_attr(not(feature = "timed"), allow(unused_imports))]
use crate::utils::Timer;

#[cfg(feature = "timed")]
use strum::EnumCount;

#[cfg(feature = "timed")]
const TIMER_COUNT: usize = TimeItem::COUNT;

#[derive(strum::EnumCount, strum::EnumIter, Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum TimeItem {
    WaitLockGranted = 0,
    WaitFlush,
    WaitFlushLocal,
    WaitUnlock,
    WaitUnlockAll,
    WaitCompletions,
    WaitWinFree,
}

#[cfg(not(feature = "timed"))]
mod timing_impl {
    use super::*;

    pub fn begin_time_op(_: TimeItem) {}
    pub fn end_time_op(_: TimeItem) {}
    pub fn commit() {}
    pub fn report(_: &mut dyn io::Write) -> io::Result<()> {
        Ok(())
    }
}

#[cfg(feature = "timed")]
mod timing_impl {
    use super::*;
    use std::cell::{Cell, RefCell};
    use std::sync::{Mutex, PoisonError};

    use lazy_static::lazy_static;
    use quanta::Instant;
    use strum::IntoEnumIterator;

    lazy_static! {
        static ref RESULTS: [Mutex<Timer>; TIMER_COUNT] =
            std::array::from_fn(|_| Mutex::new(Timer::new()));
    }

    thread_local! {
        static TIMERS: RefCell<[Timer; TIMER_COUNT]> =
            RefCell::new(std::array::from_fn(|_| Timer::new()));
        static STARTED: [Cell<Option<Instant>>; TIMER_COUNT] =
            std::array::from_fn(|_| Cell::new(None));
    }

    pub fn begin_time_op(ty: TimeItem) {
        STARTED.with(|s| s[ty as usize].set(Some(Instant::now())));
    }

    pub fn end_time_op(ty: TimeItem) {
        if let Some(start) = STARTED.with(|s| s[ty as usize].take()) {
            TIMERS.with(|t| t.borrow_mut()[ty as usize].push(start.elapsed()));
        }
    }

    /// Move this thread's samples into the process-wide results.
    pub fn commit() {
        TIMERS.with(|t| {
            let mut mine = t.borrow_mut();
            for (shared, local) in RESULTS.iter().zip(mine.iter_mut()) {
                shared
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .merge_mut(local);
            }
        });
    }

    pub fn report(w: &mut dyn io::Write) -> io::Result<()> {
        for ty in TimeItem::iter() {
            let stats = RESULTS[ty as usize]
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .report();
            if stats.total == 0 {
                continue;
            }
            writeln!(w, "Timer {} {:?}: {} samples", ty as u8, ty, stats.total)?;
            writeln!(w, "  Average: {:?}", stats.avg)?;
            writeln!(w, "  50th percentile: {:?}", stats.cdf[50])?;
            writeln!(w, "  90th percentile: {:?}", stats.cdf[90])?;
            writeln!(w, "  99th percentile: {:?}", stats.cdf[99])?;
        }
        Ok(())
    }
}

pub use timing_impl::*;

/// Time the enclosed blocking call under `item`.
pub(crate) fn timed<R>(item: TimeItem, f: impl FnOnce() -> R) -> R {
    begin_time_op(item);
    let r = f();
    end_time_op(item);
    r
}

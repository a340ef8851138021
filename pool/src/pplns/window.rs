/// Payout window clock
///
/// Shares are stamped with the open window id under a shared read guard.
/// A block-found share takes the write guard, emits its events and advances
/// the id before any other share can be stamped. With a FIFO publisher this
/// means every share event reaches the ledger before the block-found event
/// of its window, or after it with the next window's id.

use parking_lot::RwLock;

#[derive(Debug)]
pub struct WindowClock {
    current: RwLock<u64>,
}

impl WindowClock {
    pub fn new(start: u64) -> Self {
        Self {
            current: RwLock::new(start),
        }
    }

    pub fn current(&self) -> u64 {
        *self.current.read()
    }

    /// Run `f` with the open window id; concurrent with other stamps
    pub fn stamp<R>(&self, f: impl FnOnce(u64) -> R) -> R {
        let guard = self.current.read();
        f(*guard)
    }

    /// Run `f` with the closing window id, then open the next one.
    /// No stamp can interleave.
    pub fn rotate<R>(&self, f: impl FnOnce(u64) -> R) -> R {
        let mut guard = self.current.write();
        let out = f(*guard);
        *guard += 1;
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_rotate_advances_after_closure() {
        let clock = WindowClock::new(5);
        assert_eq!(clock.stamp(|w| w), 5);
        assert_eq!(clock.rotate(|w| w), 5);
        assert_eq!(clock.current(), 6);
    }

    #[test]
    fn test_stamps_never_straddle_rotation() {
        let clock = Arc::new(WindowClock::new(0));
        let log = Arc::new(parking_lot::Mutex::new(Vec::new()));

        let stampers: Vec<_> = (0..4)
            .map(|_| {
                let clock = clock.clone();
                let log = log.clone();
                std::thread::spawn(move || {
                    for _ in 0..500 {
                        clock.stamp(|w| log.lock().push(("share", w)));
                    }
                })
            })
            .collect();
        for _ in 0..20 {
            clock.rotate(|w| log.lock().push(("block", w)));
        }
        for s in stampers {
            s.join().unwrap();
        }

        // After the block event of window w, no share of window <= w appears
        let mut closed: Option<u64> = None;
        for (kind, w) in log.lock().iter() {
            match *kind {
                "block" => closed = Some(*w),
                _ => assert!(closed.map_or(true, |c| *w > c)),
            }
        }
    }
}

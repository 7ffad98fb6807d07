//! The per-Worker admission semaphore (§3 invariant 3, §9). Modeled as a
//! bounded token channel rather than a blocking semaphore primitive,
//! because the supervisor needs a non-blocking `try_acquire` while the
//! release happens from the transcode stage thread, and a channel gives
//! us exactly that cross-thread handoff for free.

use crossbeam::channel::{bounded, Receiver, Sender};

/// Bounds in-flight work (past intake, not yet past transcode) for one
/// Worker to `capacity` permits.
#[derive(Clone)]
pub struct Admission {
    tx: Sender<()>,
    rx: Receiver<()>,
}

impl Admission {
    pub fn new(capacity: usize) -> Self {
        let (tx, rx) = bounded(capacity);
        for _ in 0..capacity {
            tx.send(()).expect("capacity permits fit in their own channel");
        }
        Admission { tx, rx }
    }

    /// Non-blocking acquire used by the Worker supervisor's intake loop.
    pub fn try_acquire(&self) -> bool {
        self.rx.try_recv().is_ok()
    }

    /// Releases one permit. Called from the transcode stage, a different
    /// thread than whichever acquired it; that's the point.
    pub fn release(&self) {
        let _ = self.tx.try_send(());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn never_exceeds_capacity() {
        let admission = Admission::new(2);
        assert!(admission.try_acquire());
        assert!(admission.try_acquire());
        assert!(!admission.try_acquire());
    }

    #[test]
    fn release_makes_a_permit_available_again() {
        let admission = Admission::new(2);
        admission.try_acquire();
        admission.try_acquire();
        admission.release();
        assert!(admission.try_acquire());
        assert!(!admission.try_acquire());
    }

    #[test]
    fn release_from_another_thread_is_observed_here() {
        let admission = Admission::new(2);
        admission.try_acquire();
        admission.try_acquire();
        let other = admission.clone();
        std::thread::spawn(move || other.release()).join().unwrap();
        assert!(admission.try_acquire());
    }

    #[test]
    fn extra_release_is_not_observable_beyond_capacity() {
        let admission = Admission::new(2);
        admission.release();
        admission.release();
        admission.release();
        assert!(admission.try_acquire());
        assert!(admission.try_acquire());
        assert!(!admission.try_acquire());
    }
}

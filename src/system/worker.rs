//! Background worker stage control protocol.
//!
//! Every background stage (mapping, loop closing, an optional viewer) exposes
//! the same five cooperative operations. The orchestrator only ever requests
//! and polls - it never forces termination - so a stage that is mid
//! critical-section finishes its current unit of work before honoring a
//! pending request.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

/// Cooperative pause/terminate interface of a background stage.
pub trait WorkerStage: Send + Sync {
    /// Ask the stage to pause at the next opportunity.
    fn request_stop(&self);

    /// True once the stage has honored a pause request and parked.
    fn is_stopped(&self) -> bool;

    /// Resume a paused stage.
    fn release(&self);

    /// Ask the stage to terminate at the next opportunity.
    fn request_finish(&self);

    /// True once the stage loop has exited.
    fn is_finished(&self) -> bool;
}

/// A stage that may run a whole-map optimization in the background.
///
/// Shutdown must not complete while such an optimization is in flight.
pub trait LoopStage: WorkerStage {
    fn is_global_optimization_running(&self) -> bool;
}

/// How long a parked stage sleeps between wake-up checks.
const PARK_INTERVAL: Duration = Duration::from_millis(3);

/// Shared flag block realizing the [`WorkerStage`] protocol.
///
/// The orchestrator holds one end (the trait methods), the stage loop the
/// other ([`StageControl::finish_requested`], [`StageControl::honor_stop`],
/// [`StageControl::set_finished`]).
#[derive(Default)]
pub struct StageControl {
    stop_requested: AtomicBool,
    stopped: AtomicBool,
    finish_requested: AtomicBool,
    finished: AtomicBool,
}

impl StageControl {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stage-side: whether termination has been requested.
    pub fn finish_requested(&self) -> bool {
        self.finish_requested.load(Ordering::SeqCst)
    }

    /// Stage-side: park while a pause request is pending.
    ///
    /// Publishes `stopped` for the duration of the park. Returns immediately
    /// when no pause is pending; a finish request always breaks the park.
    pub fn honor_stop(&self) {
        if !self.stop_requested.load(Ordering::SeqCst) {
            return;
        }
        self.stopped.store(true, Ordering::SeqCst);
        while self.stop_requested.load(Ordering::SeqCst)
            && !self.finish_requested.load(Ordering::SeqCst)
        {
            std::thread::sleep(PARK_INTERVAL);
        }
        self.stopped.store(false, Ordering::SeqCst);
    }

    /// Stage-side: mark the loop as exited.
    pub fn set_finished(&self) {
        self.stopped.store(true, Ordering::SeqCst);
        self.finished.store(true, Ordering::SeqCst);
    }
}

impl WorkerStage for StageControl {
    fn request_stop(&self) {
        self.stop_requested.store(true, Ordering::SeqCst);
    }

    fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    fn release(&self) {
        self.stop_requested.store(false, Ordering::SeqCst);
        self.stopped.store(false, Ordering::SeqCst);
    }

    fn request_finish(&self) {
        self.finish_requested.store(true, Ordering::SeqCst);
    }

    fn is_finished(&self) -> bool {
        self.finished.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Instant;

    /// Spin a minimal stage loop that counts work units.
    fn spawn_stage(control: Arc<StageControl>) -> std::thread::JoinHandle<usize> {
        std::thread::spawn(move || {
            let mut units = 0;
            loop {
                if control.finish_requested() {
                    break;
                }
                control.honor_stop();
                if control.finish_requested() {
                    break;
                }
                units += 1;
                std::thread::sleep(Duration::from_millis(1));
            }
            control.set_finished();
            units
        })
    }

    fn wait_until(deadline_ms: u64, cond: impl Fn() -> bool) -> bool {
        let start = Instant::now();
        while start.elapsed() < Duration::from_millis(deadline_ms) {
            if cond() {
                return true;
            }
            std::thread::sleep(Duration::from_millis(1));
        }
        cond()
    }

    #[test]
    fn test_stop_release_finish_cycle() {
        let control = Arc::new(StageControl::new());
        let handle = spawn_stage(control.clone());

        control.request_stop();
        assert!(wait_until(1000, || control.is_stopped()));

        control.release();
        assert!(wait_until(1000, || !control.is_stopped()));

        control.request_finish();
        assert!(wait_until(1000, || control.is_finished()));
        let units = handle.join().unwrap();
        assert!(units > 0);
    }

    #[test]
    fn test_finish_breaks_park() {
        let control = Arc::new(StageControl::new());
        let handle = spawn_stage(control.clone());

        control.request_stop();
        assert!(wait_until(1000, || control.is_stopped()));

        // Finish while parked: the stage must exit without a release.
        control.request_finish();
        assert!(wait_until(1000, || control.is_finished()));
        handle.join().unwrap();
    }

    #[test]
    fn test_not_stopped_without_request() {
        let control = StageControl::new();
        assert!(!control.is_stopped());
        assert!(!control.is_finished());
    }
}

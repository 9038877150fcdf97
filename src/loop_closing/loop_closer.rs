//! LoopCloser - background loop-closing stage.
//!
//! Receives keyframes from local mapping and queries the place-recognition
//! index for revisit candidates. Geometric verification and the loop
//! correction itself are delegated to external components; what lives here
//! is the stage loop, the candidate query, and the global-optimization
//! in-flight flag that gates system shutdown.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crossbeam_channel::{Receiver, RecvTimeoutError};
use tracing::{debug, info};

use crate::map::{bow_from_descriptors, KeyframeId};
use crate::system::{LoopStage, SharedState, StageControl, WorkerStage};

/// Timeout for receiving keyframes; bounds the latency of stop/finish checks.
const RECV_TIMEOUT: Duration = Duration::from_millis(100);

/// Control block of the loop-closing stage: the common stage protocol plus
/// the global-optimization in-flight flag.
#[derive(Default)]
pub struct LoopControl {
    stage: StageControl,
    global_optimization_running: AtomicBool,
}

impl LoopControl {
    pub fn new() -> Self {
        Self::default()
    }

    /// Mark a whole-map optimization as started/finished. While the flag is
    /// up, `SlamSystem::shutdown` keeps waiting.
    pub fn set_global_optimization_running(&self, running: bool) {
        self.global_optimization_running
            .store(running, Ordering::SeqCst);
    }

    pub(crate) fn stage(&self) -> &StageControl {
        &self.stage
    }
}

impl WorkerStage for LoopControl {
    fn request_stop(&self) {
        self.stage.request_stop();
    }

    fn is_stopped(&self) -> bool {
        self.stage.is_stopped()
    }

    fn release(&self) {
        self.stage.release();
    }

    fn request_finish(&self) {
        self.stage.request_finish();
    }

    fn is_finished(&self) -> bool {
        self.stage.is_finished()
    }
}

impl LoopStage for LoopControl {
    fn is_global_optimization_running(&self) -> bool {
        self.global_optimization_running.load(Ordering::SeqCst)
    }
}

/// Configuration for candidate detection.
#[derive(Debug, Clone)]
pub struct LoopCloserConfig {
    /// Minimum similarity score for a candidate to be reported.
    pub min_score: f64,

    /// Maximum candidates retrieved per keyframe.
    pub max_candidates: usize,
}

impl Default for LoopCloserConfig {
    fn default() -> Self {
        Self {
            min_score: 0.05,
            max_candidates: 3,
        }
    }
}

/// Counters reported when the stage exits.
#[derive(Debug, Default, Clone)]
pub struct LoopCloserStats {
    pub keyframes_processed: usize,
    pub candidates_detected: usize,
}

/// Background loop-closing stage.
pub struct LoopCloser {
    shared: Arc<SharedState>,
    control: Arc<LoopControl>,
    config: LoopCloserConfig,
    stats: LoopCloserStats,
}

impl LoopCloser {
    pub fn new(
        shared: Arc<SharedState>,
        control: Arc<LoopControl>,
        config: LoopCloserConfig,
    ) -> Self {
        Self {
            shared,
            control,
            config,
            stats: LoopCloserStats::default(),
        }
    }

    /// Main stage loop: runs until finish is requested or the channel closes.
    pub fn run(&mut self, kf_receiver: Receiver<KeyframeId>) {
        info!("loop closing thread started");

        loop {
            if self.control.stage().finish_requested() {
                break;
            }
            self.control.stage().honor_stop();
            if self.control.stage().finish_requested() {
                break;
            }

            match kf_receiver.recv_timeout(RECV_TIMEOUT) {
                Ok(kf_id) => self.process_keyframe(kf_id),
                Err(RecvTimeoutError::Timeout) => continue,
                Err(RecvTimeoutError::Disconnected) => break,
            }
        }

        self.control.stage().set_finished();
        info!(
            processed = self.stats.keyframes_processed,
            candidates = self.stats.candidates_detected,
            "loop closing thread exiting"
        );
    }

    /// Query the index for revisit candidates for one keyframe.
    fn process_keyframe(&mut self, kf_id: KeyframeId) {
        self.stats.keyframes_processed += 1;

        // A whole-map optimization owns the map; detection waits it out.
        if self.control.is_global_optimization_running() {
            return;
        }

        let (query, connected) = {
            let map = self.shared.map.read();
            let Some(kf) = map.keyframe(kf_id).filter(|kf| !kf.is_bad) else {
                return;
            };
            (
                bow_from_descriptors(&kf.descriptors),
                kf.covisibility_weights().keys().copied().collect::<Vec<_>>(),
            )
        };

        let candidates = self.shared.keyframe_db.read().detect_candidates(
            &query,
            Some(kf_id),
            self.config.max_candidates,
        );

        // Directly covisible keyframes are trivially similar; only distant
        // revisits count as loop candidates.
        let candidates: Vec<_> = candidates
            .into_iter()
            .filter(|c| c.score >= self.config.min_score && !connected.contains(&c.keyframe_id))
            .collect();

        if candidates.is_empty() {
            return;
        }
        self.stats.candidates_detected += candidates.len();
        for c in &candidates {
            debug!(current = %kf_id, candidate = %c.keyframe_id, score = c.score,
                   "loop candidate detected");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crossbeam_channel::bounded;

    #[test]
    fn test_global_optimization_flag() {
        let control = LoopControl::new();
        assert!(!control.is_global_optimization_running());
        control.set_global_optimization_running(true);
        assert!(control.is_global_optimization_running());
        control.set_global_optimization_running(false);
        assert!(!control.is_global_optimization_running());
    }

    #[test]
    fn test_stage_runs_and_finishes() {
        let shared = SharedState::new();
        let control = Arc::new(LoopControl::new());
        let (tx, rx) = bounded(8);

        let mut closer = LoopCloser::new(shared, control.clone(), LoopCloserConfig::default());
        let handle = std::thread::spawn(move || closer.run(rx));

        // Unknown keyframe ids are skipped without effect.
        tx.send(KeyframeId::new(42)).unwrap();

        control.request_finish();
        handle.join().unwrap();
        assert!(control.is_finished());
    }
}

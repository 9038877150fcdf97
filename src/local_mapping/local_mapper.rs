//! LocalMapper - background mapping stage.
//!
//! Consumes new-keyframe ids from tracking and folds each keyframe into the
//! map's derived structures: covisibility edges, spanning-tree repair, and
//! the place-recognition index. Geometric refinement (triangulation, local
//! bundle adjustment) is delegated to external components.
//!
//! The loop honors the cooperative stop/finish protocol between work units:
//! a pause request parks the thread with `stopped` published, and the
//! orchestrator's frame path relies on that flag before freezing the map.

use std::sync::Arc;
use std::time::Duration;

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};
use tracing::{debug, info};

use crate::map::{bow_from_descriptors, KeyframeId};
use crate::system::{SharedState, StageControl};

/// Flow control threshold: above this queue depth, signal tracking to stop
/// creating keyframes.
const MAX_QUEUE_SIZE: usize = 3;

/// Timeout for receiving keyframes; bounds the latency of stop/finish checks.
const RECV_TIMEOUT: Duration = Duration::from_millis(100);

/// Background mapping stage.
pub struct LocalMapper {
    shared: Arc<SharedState>,
    control: Arc<StageControl>,

    /// Forwarding channel to the loop-closing stage.
    lc_sender: Option<Sender<KeyframeId>>,
}

impl LocalMapper {
    pub fn new(
        shared: Arc<SharedState>,
        control: Arc<StageControl>,
        lc_sender: Option<Sender<KeyframeId>>,
    ) -> Self {
        Self {
            shared,
            control,
            lc_sender,
        }
    }

    /// Main stage loop: runs until finish is requested or the channel closes.
    pub fn run(&mut self, kf_receiver: Receiver<KeyframeId>) {
        info!("local mapping thread started");

        loop {
            if self.control.finish_requested() {
                break;
            }

            // Park here while the orchestrator holds the stage stopped.
            self.control.honor_stop();
            if self.control.finish_requested() {
                break;
            }

            self.shared
                .set_keyframe_creation_paused(kf_receiver.len() > MAX_QUEUE_SIZE);

            match kf_receiver.recv_timeout(RECV_TIMEOUT) {
                Ok(kf_id) => self.process_keyframe(kf_id),
                Err(RecvTimeoutError::Timeout) => continue,
                Err(RecvTimeoutError::Disconnected) => break,
            }
        }

        self.shared.set_keyframe_creation_paused(false);
        self.control.set_finished();
        info!("local mapping thread exiting");
    }

    /// Fold one keyframe into the map's derived structures.
    fn process_keyframe(&mut self, kf_id: KeyframeId) {
        {
            let mut map = self.shared.map.write();
            map.update_connections(kf_id);
        }

        let bow = {
            let map = self.shared.map.read();
            map.keyframe(kf_id)
                .filter(|kf| !kf.is_bad)
                .map(|kf| bow_from_descriptors(&kf.descriptors))
        };
        if let Some(bow) = bow {
            self.shared.keyframe_db.write().add(kf_id, bow);
        }

        if let Some(sender) = &self.lc_sender {
            let _ = sender.try_send(kf_id);
        }
        debug!(%kf_id, "keyframe processed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crossbeam_channel::bounded;
    use crate::features::{DenseMatrix, KeyPoint, MatDepth};
    use crate::geometry::SE3;
    use crate::system::WorkerStage;

    #[test]
    fn test_processes_keyframes_and_finishes() {
        let shared = SharedState::new();
        let kf_id = {
            let mut map = shared.map.write();
            map.create_keyframe(
                0.0,
                SE3::identity(),
                vec![KeyPoint::default(); 2],
                DenseMatrix::zeros(2, 32, MatDepth::U8),
            )
        };

        let control = Arc::new(StageControl::new());
        let (tx, rx) = bounded(8);
        let (lc_tx, lc_rx) = bounded(8);

        let mut mapper = LocalMapper::new(shared.clone(), control.clone(), Some(lc_tx));
        let handle = std::thread::spawn(move || mapper.run(rx));

        tx.send(kf_id).unwrap();
        // The keyframe must land in the index and be forwarded.
        let forwarded = lc_rx.recv_timeout(Duration::from_secs(2)).unwrap();
        assert_eq!(forwarded, kf_id);
        assert_eq!(shared.keyframe_db.read().len(), 1);

        control.request_finish();
        handle.join().unwrap();
        assert!(control.is_finished());
    }

    #[test]
    fn test_stop_parks_the_stage() {
        let shared = SharedState::new();
        let control = Arc::new(StageControl::new());
        let (_tx, rx) = bounded::<KeyframeId>(8);

        let mut mapper = LocalMapper::new(shared, control.clone(), None);
        let handle = std::thread::spawn(move || mapper.run(rx));

        control.request_stop();
        let deadline = std::time::Instant::now() + Duration::from_secs(2);
        while !control.is_stopped() && std::time::Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(1));
        }
        assert!(control.is_stopped());

        control.release();
        control.request_finish();
        handle.join().unwrap();
    }
}

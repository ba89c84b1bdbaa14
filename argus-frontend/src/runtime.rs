//! Concurrent runtime around the per-frame pipeline.
//!
//! Three input queues feed a single worker thread that owns the tracker
//! state: frames (bounded, blocking producers), IMU samples (bounded,
//! passed through to the estimator untouched) and scene-depth estimates
//! (unbounded; only the latest value matters). A `None` frame is the only
//! termination signal; the worker forwards it downstream and exits, and is
//! joined when the runtime is dropped.

use std::sync::Arc;
use std::thread::{self, JoinHandle};

use crossbeam_channel::{bounded, unbounded, Receiver, Sender};
use tracing::debug;

use argus_core::camera::CameraCalib;
use argus_core::config::{ConfigError, FlowConfig};
use argus_core::scalar::FlowScalar;

use crate::flow::PatchFlow;
use crate::pattern::Pattern;
use crate::types::{FrameInput, FrameResult, ImuSample};

/// Capacity of the frame input queue.
const FRAME_QUEUE_CAPACITY: usize = 10;
/// Capacity of the IMU pass-through queue.
const IMU_QUEUE_CAPACITY: usize = 300;

/// Handle to the tracker worker thread and its queues.
///
/// Pushing anything after [`FlowRuntime::push_null_frame`] is a protocol
/// violation; such sends are silently ignored once the worker has exited.
pub struct FlowRuntime<S: FlowScalar, const N: usize> {
    frame_tx: Sender<Option<Arc<FrameInput>>>,
    depth_tx: Sender<f64>,
    imu_tx: Sender<Option<ImuSample>>,
    imu_rx: Receiver<Option<ImuSample>>,
    output_rx: Receiver<Option<Arc<FrameResult<S>>>>,
    worker: Option<JoinHandle<()>>,
}

impl<S: FlowScalar, const N: usize> FlowRuntime<S, N> {
    /// Validate the configuration, spawn the worker and hand back the
    /// queue endpoints.
    pub fn spawn(
        config: FlowConfig,
        calib: CameraCalib<S>,
        pattern: Pattern<S, N>,
    ) -> Result<Self, ConfigError> {
        let flow = PatchFlow::new(config, calib, pattern)?;

        let (frame_tx, frame_rx) = bounded(FRAME_QUEUE_CAPACITY);
        let (depth_tx, depth_rx) = unbounded();
        let (imu_tx, imu_rx) = bounded(IMU_QUEUE_CAPACITY);
        let (output_tx, output_rx) = unbounded();

        let worker = thread::spawn(move || worker_loop(flow, frame_rx, depth_rx, output_tx));

        Ok(Self {
            frame_tx,
            depth_tx,
            imu_tx,
            imu_rx,
            output_rx,
            worker: Some(worker),
        })
    }

    /// Enqueue a frame; blocks while the frame queue is full.
    pub fn push_frame(&self, input: FrameInput) {
        let _ = self.frame_tx.send(Some(Arc::new(input)));
    }

    /// Signal end-of-stream. The worker forwards one `None` downstream and
    /// exits.
    pub fn push_null_frame(&self) {
        let _ = self.frame_tx.send(None);
    }

    /// Forward an inertial sample to the estimator; blocks while the IMU
    /// queue is full.
    pub fn push_imu_sample(&self, sample: ImuSample) {
        let _ = self.imu_tx.send(Some(sample));
    }

    /// Update the scene-depth prior used for cross-camera matching guesses.
    pub fn push_depth(&self, depth: f64) {
        let _ = self.depth_tx.send(depth);
    }

    /// Receiver of published results; yields `None` exactly once after
    /// end-of-stream.
    pub fn output(&self) -> Receiver<Option<Arc<FrameResult<S>>>> {
        self.output_rx.clone()
    }

    /// Receiver of the IMU pass-through, consumed by the estimator.
    pub fn imu_output(&self) -> Receiver<Option<ImuSample>> {
        self.imu_rx.clone()
    }
}

impl<S: FlowScalar, const N: usize> Drop for FlowRuntime<S, N> {
    fn drop(&mut self) {
        // Idempotent: if a null frame was already pushed the worker is gone
        // and this send lands on a disconnected channel.
        let _ = self.frame_tx.send(None);
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}

fn worker_loop<S: FlowScalar, const N: usize>(
    mut flow: PatchFlow<S, N>,
    frame_rx: Receiver<Option<Arc<FrameInput>>>,
    depth_rx: Receiver<f64>,
    output_tx: Sender<Option<Arc<FrameResult<S>>>>,
) {
    loop {
        // Keep only the most recent depth estimate.
        while let Ok(depth) = depth_rx.try_recv() {
            flow.set_depth_guess(depth);
        }

        match frame_rx.recv() {
            Ok(Some(input)) => {
                if input.images.iter().any(Option::is_none) {
                    debug!(t_ns = input.t_ns, "dropping frame with missing image");
                    continue;
                }
                if let Some(result) = flow.process_frame(&input) {
                    let _ = output_tx.send(Some(result));
                }
            }
            Ok(None) => {
                debug!("end of stream");
                let _ = output_tx.send(None);
                break;
            }
            // All producers vanished without a sentinel; nothing left to do.
            Err(_) => break,
        }
    }
}

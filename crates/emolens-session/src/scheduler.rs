//! Periodic live captures while the camera streams.

use crate::camera::{CameraSessionManager, CameraState};
use crate::pipeline::{CaptureSource, CapturePipeline};
use emolens_core::{SessionStateStore, Trigger};
use parking_lot::Mutex;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::watch;
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::{Instant, MissedTickBehavior};

#[derive(Error, Debug, PartialEq, Eq)]
pub enum SchedulerError {
    #[error("real-time detection needs a streaming camera")]
    CameraNotStreaming,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SchedulerState {
    Off,
    On,
}

type TaskSlot = Arc<Mutex<Option<JoinHandle<()>>>>;

pub struct RealTimeScheduler {
    pipeline: CapturePipeline,
    camera: CameraSessionManager,
    store: SessionStateStore,
    period: Duration,
    task: TaskSlot,
    ticks: Arc<AtomicU64>,
}

impl RealTimeScheduler {
    /// Build a scheduler that is cancelled whenever `camera` is stopped.
    pub fn new(
        pipeline: CapturePipeline,
        camera: CameraSessionManager,
        store: SessionStateStore,
        period: Duration,
    ) -> Self {
        let task: TaskSlot = Arc::new(Mutex::new(None));
        {
            let task = Arc::clone(&task);
            let store = store.clone();
            camera.on_stop(move || cancel(&task, &store));
        }

        Self {
            pipeline,
            camera,
            store,
            period,
            task,
            ticks: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Start capturing every period, the first capture one period from now.
    /// Enabling while already on changes nothing.
    pub fn enable(&self) -> Result<(), SchedulerError> {
        let mut task = self.task.lock();
        if task.as_ref().is_some_and(|t| !t.is_finished()) {
            return Ok(());
        }
        if !self.camera.is_streaming() {
            return Err(SchedulerError::CameraNotStreaming);
        }

        self.store.set_camera_mode(true);
        *task = Some(tokio::spawn(run_ticks(
            self.pipeline.clone(),
            self.camera.subscribe(),
            self.store.clone(),
            self.period,
            Arc::clone(&self.ticks),
        )));
        tracing::info!(period_ms = self.period.as_millis() as u64, "real-time detection enabled");
        Ok(())
    }

    /// Cancel the timer and every capture it started. Idempotent.
    pub fn disable(&self) {
        cancel(&self.task, &self.store);
    }

    pub fn state(&self) -> SchedulerState {
        match self.task.lock().as_ref() {
            Some(task) if !task.is_finished() => SchedulerState::On,
            _ => SchedulerState::Off,
        }
    }

    /// Ticks fired since the scheduler was built, across every enable.
    pub fn ticks(&self) -> u64 {
        self.ticks.load(Ordering::Relaxed)
    }
}

impl Drop for RealTimeScheduler {
    fn drop(&mut self) {
        if let Some(task) = self.task.lock().take() {
            task.abort();
        }
    }
}

fn cancel(task: &Mutex<Option<JoinHandle<()>>>, store: &SessionStateStore) {
    if let Some(task) = task.lock().take() {
        task.abort();
        tracing::info!("real-time detection disabled");
    }
    store.set_camera_mode(false);
}

/// Tick loop. Ticks are not gated on the previous capture; overlapping
/// captures are ordered by the store's fence. Ends on its own if the
/// camera stops streaming.
async fn run_ticks(
    pipeline: CapturePipeline,
    mut camera: watch::Receiver<CameraState>,
    store: SessionStateStore,
    period: Duration,
    ticks: Arc<AtomicU64>,
) {
    let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut captures = JoinSet::new();

    loop {
        if *camera.borrow_and_update() != CameraState::Streaming {
            break;
        }
        tokio::select! {
            _ = ticker.tick() => {
                let tick = ticks.fetch_add(1, Ordering::Relaxed) + 1;
                tracing::debug!(tick, in_flight = captures.len(), "real-time tick");
                let pipeline = pipeline.clone();
                captures.spawn(async move {
                    pipeline
                        .capture_and_classify(CaptureSource::LiveFrame, Trigger::Scheduled)
                        .await
                });
            }
            changed = camera.changed() => {
                if changed.is_err() {
                    break;
                }
            }
            Some(_) = captures.join_next(), if !captures.is_empty() => {}
        }
    }

    captures.abort_all();
    store.set_camera_mode(false);
    tracing::info!("real-time detection stopped: camera is no longer streaming");
}

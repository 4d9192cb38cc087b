//! Camera session manager. Sole owner of the capture device.
//!
//! The device lives on a dedicated OS thread and is only reachable through
//! request messages, so no other component can hold or leak a handle.
//! The thread releases the device on `Stop` and when every handle to it
//! has been dropped.

use emolens_hw::{CameraError, CaptureConstraints, DeviceInfo, DeviceProvider, Frame, VideoDevice};
use parking_lot::Mutex;
use serde::Serialize;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot, watch};

#[derive(Error, Debug)]
pub enum CameraSessionError {
    #[error("camera error: {0}")]
    Device(#[from] CameraError),
    #[error("camera is not streaming")]
    NotStreaming,
    #[error("camera thread exited")]
    ChannelClosed,
    #[error("failed to spawn camera thread: {0}")]
    Spawn(#[source] std::io::Error),
}

/// Lifecycle of the camera session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CameraState {
    Idle,
    Requesting,
    Streaming,
    /// The last start failed; nothing is held.
    Error,
    Stopped,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StartOutcome {
    Started(DeviceInfo),
    /// Already streaming; the existing handle was kept.
    AlreadyStreaming(DeviceInfo),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopOutcome {
    Released,
    AlreadyStopped,
}

enum CameraRequest {
    Start {
        reply: oneshot::Sender<Result<StartOutcome, CameraError>>,
    },
    Stop {
        reply: Option<oneshot::Sender<StopOutcome>>,
    },
    Capture {
        reply: oneshot::Sender<Result<Frame, CameraSessionError>>,
    },
}

type StopHook = Box<dyn Fn() + Send + Sync>;

/// Clone-safe handle to the camera thread.
#[derive(Clone)]
pub struct CameraSessionManager {
    tx: mpsc::UnboundedSender<CameraRequest>,
    state: watch::Receiver<CameraState>,
    stop_hooks: Arc<Mutex<Vec<StopHook>>>,
}

impl CameraSessionManager {
    /// Spawn the camera thread. No device is opened until [`start`](Self::start).
    pub fn spawn(
        provider: Box<dyn DeviceProvider>,
        constraints: CaptureConstraints,
    ) -> Result<Self, CameraSessionError> {
        let (tx, mut rx) = mpsc::unbounded_channel::<CameraRequest>();
        let (state_tx, state) = watch::channel(CameraState::Idle);

        std::thread::Builder::new()
            .name("emolens-camera".into())
            .spawn(move || {
                tracing::debug!("camera thread started");
                let mut device: Option<Box<dyn VideoDevice>> = None;
                while let Some(req) = rx.blocking_recv() {
                    match req {
                        CameraRequest::Start { reply } => {
                            let result = acquire(&*provider, &constraints, &mut device, &state_tx);
                            let _ = reply.send(result);
                        }
                        CameraRequest::Stop { reply } => {
                            let outcome = release(&mut device, &state_tx);
                            if let Some(reply) = reply {
                                let _ = reply.send(outcome);
                            }
                        }
                        CameraRequest::Capture { reply } => {
                            let result = match device.as_mut() {
                                Some(dev) => dev.capture_frame().map_err(CameraSessionError::from),
                                None => Err(CameraSessionError::NotStreaming),
                            };
                            let _ = reply.send(result);
                        }
                    }
                }
                release(&mut device, &state_tx);
                tracing::debug!("camera thread exiting");
            })
            .map_err(CameraSessionError::Spawn)?;

        Ok(Self {
            tx,
            state,
            stop_hooks: Arc::new(Mutex::new(Vec::new())),
        })
    }

    /// Acquire the device. A no-op while already streaming.
    pub async fn start(&self) -> Result<StartOutcome, CameraSessionError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(CameraRequest::Start { reply: reply_tx })
            .map_err(|_| CameraSessionError::ChannelClosed)?;
        Ok(reply_rx.await.map_err(|_| CameraSessionError::ChannelClosed)??)
    }

    /// Run `hook` at the start of every stop, before the device is released.
    pub(crate) fn on_stop(&self, hook: impl Fn() + Send + Sync + 'static) {
        self.stop_hooks.lock().push(Box::new(hook));
    }

    fn run_stop_hooks(&self) {
        for hook in self.stop_hooks.lock().iter() {
            hook();
        }
    }

    /// Cancel everything registered with [`on_stop`](Self::on_stop), then
    /// release the device and wait until it is closed. Idempotent.
    pub async fn stop(&self) -> Result<StopOutcome, CameraSessionError> {
        self.run_stop_hooks();
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(CameraRequest::Stop {
                reply: Some(reply_tx),
            })
            .map_err(|_| CameraSessionError::ChannelClosed)?;
        reply_rx.await.map_err(|_| CameraSessionError::ChannelClosed)
    }

    /// Queue a release without waiting, for use from synchronous teardown.
    pub fn request_stop(&self) {
        self.run_stop_hooks();
        let _ = self.tx.send(CameraRequest::Stop { reply: None });
    }

    /// Grab the current frame from the open device.
    pub async fn capture_frame(&self) -> Result<Frame, CameraSessionError> {
        if !self.is_streaming() {
            return Err(CameraSessionError::NotStreaming);
        }
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(CameraRequest::Capture { reply: reply_tx })
            .map_err(|_| CameraSessionError::ChannelClosed)?;
        reply_rx.await.map_err(|_| CameraSessionError::ChannelClosed)?
    }

    pub fn state(&self) -> CameraState {
        *self.state.borrow()
    }

    pub fn is_streaming(&self) -> bool {
        self.state() == CameraState::Streaming
    }

    /// Receiver notified on every camera state change.
    pub fn subscribe(&self) -> watch::Receiver<CameraState> {
        self.state.clone()
    }
}

fn acquire(
    provider: &dyn DeviceProvider,
    constraints: &CaptureConstraints,
    device: &mut Option<Box<dyn VideoDevice>>,
    state: &watch::Sender<CameraState>,
) -> Result<StartOutcome, CameraError> {
    if let Some(dev) = device.as_ref() {
        tracing::debug!(device = %dev.info().path, "camera already streaming");
        return Ok(StartOutcome::AlreadyStreaming(dev.info().clone()));
    }

    state.send_replace(CameraState::Requesting);
    match provider.open(constraints) {
        Ok(dev) => {
            let info = dev.info().clone();
            tracing::info!(
                device = %info.path,
                name = %info.name,
                width = info.width,
                height = info.height,
                "camera acquired"
            );
            *device = Some(dev);
            state.send_replace(CameraState::Streaming);
            Ok(StartOutcome::Started(info))
        }
        Err(e) => {
            tracing::warn!(error = %e, "camera access failed");
            state.send_replace(CameraState::Error);
            Err(e)
        }
    }
}

fn release(device: &mut Option<Box<dyn VideoDevice>>, state: &watch::Sender<CameraState>) -> StopOutcome {
    match device.take() {
        Some(dev) => {
            let path = dev.info().path.clone();
            drop(dev);
            tracing::info!(device = %path, "camera released");
            state.send_replace(CameraState::Stopped);
            StopOutcome::Released
        }
        None => {
            state.send_if_modified(|s| {
                let from_error = *s == CameraState::Error;
                if from_error {
                    *s = CameraState::Stopped;
                }
                from_error
            });
            StopOutcome::AlreadyStopped
        }
    }
}

//! The session coordinator: one event loop owning the model, capture, and
//! connection managers plus the per-tick inference scheduler that ties them
//! together.
//!
//! Concurrency model: the loop is the single writer of all session state.
//! Model loads, camera opens, and estimate calls run on the blocking pool
//! and come back as tagged events; every continuation re-checks its tag
//! (generation / attempt / connection id) against current state before
//! touching anything. Teardown cancels the loop's token, which revokes the
//! next tick before it can fire against released resources.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{broadcast, mpsc, watch};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::capture::{
    CameraBackend, CameraDevice, CameraStream, CaptureLifecycleManager, CaptureStatus,
};
use crate::config::{EstimationConfig, ModelConfig};
use crate::connection::{ConnectionManager, ConnectionStatus, SocketEvent};
use crate::engine::{ModelLoader, PoseModel};
use crate::model::{ModelLifecycleManager, ModelStatus};
use crate::pose::{ImageSize, Pose, PoseFrame};

/// User-issued operations.
#[derive(Debug)]
pub enum SessionCommand {
    LoadModel(ModelConfig),
    SetEstimation(EstimationConfig),
    SetActive(bool),
    SetCapture {
        enabled: bool,
        device_id: Option<String>,
    },
    EnumerateDevices,
    Connect { host: String, port: u16 },
    Disconnect,
}

/// Completions of blocking work, tagged with the identity they were issued
/// under.
enum SessionEvent {
    ModelLoadFinished {
        generation: u64,
        result: anyhow::Result<Box<dyn PoseModel>>,
    },
    EstimateFinished {
        generation: u64,
        model: Box<dyn PoseModel>,
        result: anyhow::Result<Vec<Pose>>,
        image: ImageSize,
    },
    CaptureFinished {
        attempt: u64,
        result: anyhow::Result<CameraStream>,
    },
    DevicesEnumerated {
        result: anyhow::Result<Vec<CameraDevice>>,
    },
}

/// Published state snapshot: one indicator per lifecycle, no handles.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionStatus {
    pub model: ModelStatus,
    pub generation: u64,
    pub capture: CaptureStatus,
    pub devices: Vec<CameraDevice>,
    pub device_id: Option<String>,
    pub connection: ConnectionStatus,
    pub active: bool,
    pub last_error: Option<String>,
}

struct Session {
    model: ModelLifecycleManager,
    capture: CaptureLifecycleManager,
    connection: ConnectionManager,
    backend: Arc<dyn CameraBackend>,
    estimation: EstimationConfig,
    active: bool,
    inflight: bool,
    last_error: Option<String>,
    tick: Duration,
    events_tx: mpsc::UnboundedSender<SessionEvent>,
    publish: broadcast::Sender<PoseFrame>,
    status_tx: watch::Sender<SessionStatus>,
    cancel: CancellationToken,
}

/// Control surface for a running session.
pub struct SessionHandle {
    commands: mpsc::UnboundedSender<SessionCommand>,
    publish: broadcast::Sender<PoseFrame>,
    status: watch::Receiver<SessionStatus>,
    cancel: CancellationToken,
    task: tokio::task::JoinHandle<()>,
}

impl SessionHandle {
    pub fn command(&self, command: SessionCommand) {
        let _ = self.commands.send(command);
    }

    pub fn load_model(&self, config: ModelConfig) {
        self.command(SessionCommand::LoadModel(config));
    }

    pub fn set_estimation(&self, config: EstimationConfig) {
        self.command(SessionCommand::SetEstimation(config));
    }

    pub fn set_active(&self, active: bool) {
        self.command(SessionCommand::SetActive(active));
    }

    pub fn set_capture(&self, enabled: bool, device_id: Option<String>) {
        self.command(SessionCommand::SetCapture { enabled, device_id });
    }

    pub fn enumerate_devices(&self) {
        self.command(SessionCommand::EnumerateDevices);
    }

    pub fn connect(&self, host: &str, port: u16) {
        self.command(SessionCommand::Connect {
            host: host.to_string(),
            port,
        });
    }

    pub fn disconnect(&self) {
        self.command(SessionCommand::Disconnect);
    }

    /// Subscribe to published pose frames (both locally estimated and
    /// received from the relay).
    pub fn subscribe(&self) -> broadcast::Receiver<PoseFrame> {
        self.publish.subscribe()
    }

    pub fn status(&self) -> SessionStatus {
        self.status.borrow().clone()
    }

    pub fn watch_status(&self) -> watch::Receiver<SessionStatus> {
        self.status.clone()
    }

    /// Tear the session down: revokes the next scheduler tick, disposes the
    /// model, stops capture, and closes the connection.
    pub async fn shutdown(self) {
        self.cancel.cancel();
        let _ = self.task.await;
    }
}

/// Start a session loop ticking at `tick` (display-refresh cadence).
pub fn spawn(
    loader: Arc<dyn ModelLoader>,
    backend: Arc<dyn CameraBackend>,
    estimation: EstimationConfig,
    capture_size: (u32, u32),
    tick: Duration,
) -> SessionHandle {
    let (commands_tx, commands_rx) = mpsc::unbounded_channel();
    let (events_tx, events_rx) = mpsc::unbounded_channel();
    let (socket_tx, socket_rx) = mpsc::unbounded_channel();
    let (publish, _) = broadcast::channel(256);
    let cancel = CancellationToken::new();

    let session = Session {
        model: ModelLifecycleManager::new(loader),
        capture: CaptureLifecycleManager::new(capture_size.0, capture_size.1),
        connection: ConnectionManager::new(socket_tx),
        backend,
        estimation,
        active: false,
        inflight: false,
        last_error: None,
        tick,
        events_tx,
        publish: publish.clone(),
        status_tx: watch::channel(SessionStatus {
            model: ModelStatus::Idle,
            generation: 0,
            capture: CaptureStatus::Off,
            devices: Vec::new(),
            device_id: None,
            connection: ConnectionStatus::Closed,
            active: false,
            last_error: None,
        })
        .0,
        cancel: cancel.clone(),
    };
    let status = session.status_tx.subscribe();
    let task = tokio::spawn(session.run(commands_rx, events_rx, socket_rx));

    SessionHandle {
        commands: commands_tx,
        publish,
        status,
        cancel,
        task,
    }
}

impl Session {
    async fn run(
        mut self,
        mut commands: mpsc::UnboundedReceiver<SessionCommand>,
        mut events: mpsc::UnboundedReceiver<SessionEvent>,
        mut socket_events: mpsc::UnboundedReceiver<SocketEvent>,
    ) {
        let cancel = self.cancel.clone();
        let mut ticker = tokio::time::interval(self.tick);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => self.on_tick(),
                Some(command) = commands.recv() => self.on_command(command),
                Some(event) = events.recv() => self.on_event(event),
                Some(event) = socket_events.recv() => {
                    if let Some(frame) = self.connection.handle_event(event) {
                        let _ = self.publish.send(frame);
                    }
                }
            }
            self.publish_status();
        }

        // teardown: the ticker is gone; reclaim any estimate that already
        // completed, then release the owned resources
        while let Ok(event) = events.try_recv() {
            if let SessionEvent::EstimateFinished {
                generation, model, ..
            } = event
            {
                self.model.check_in(model, generation);
            }
        }
        self.model.dispose();
        self.capture.disable();
        self.connection.disconnect();
        self.publish_status();
    }

    /// One scheduler tick. Runs whether or not estimation is currently
    /// possible, so toggling `active` (or a model/capture becoming ready)
    /// takes effect on the very next tick without restarting anything.
    fn on_tick(&mut self) {
        if !self.active || self.inflight {
            return;
        }
        if self.capture.status() != CaptureStatus::Capturing {
            return;
        }
        let Some(frame) = self.capture.frame() else {
            return;
        };
        let Some((mut model, generation)) = self.model.check_out() else {
            return;
        };

        let image = ImageSize {
            width: frame.width,
            height: frame.height,
        };
        let config = self.estimation;
        let events = self.events_tx.clone();
        self.inflight = true;
        tokio::task::spawn_blocking(move || {
            let result = model.estimate(&frame, &config);
            let _ = events.send(SessionEvent::EstimateFinished {
                generation,
                model,
                result,
                image,
            });
        });
    }

    fn on_command(&mut self, command: SessionCommand) {
        match command {
            SessionCommand::LoadModel(config) => {
                let (generation, loader, config) = self.model.begin_load(config);
                let events = self.events_tx.clone();
                tokio::task::spawn_blocking(move || {
                    let result = loader.load(&config);
                    let _ = events.send(SessionEvent::ModelLoadFinished { generation, result });
                });
            }
            SessionCommand::SetEstimation(config) => {
                // applies from the next tick; never mid-call
                self.estimation = config;
            }
            SessionCommand::SetActive(active) => self.active = active,
            SessionCommand::SetCapture {
                enabled: true,
                device_id,
            } => {
                if let Some((attempt, request)) = self.capture.begin_enable(device_id) {
                    let backend = Arc::clone(&self.backend);
                    let events = self.events_tx.clone();
                    tokio::task::spawn_blocking(move || {
                        let result = backend.open(&request);
                        let _ = events.send(SessionEvent::CaptureFinished { attempt, result });
                    });
                }
            }
            SessionCommand::SetCapture { enabled: false, .. } => self.capture.disable(),
            SessionCommand::EnumerateDevices => {
                let backend = Arc::clone(&self.backend);
                let events = self.events_tx.clone();
                tokio::task::spawn_blocking(move || {
                    let result = backend.enumerate();
                    let _ = events.send(SessionEvent::DevicesEnumerated { result });
                });
            }
            SessionCommand::Connect { host, port } => self.connection.connect(&host, port),
            SessionCommand::Disconnect => self.connection.disconnect(),
        }
    }

    fn on_event(&mut self, event: SessionEvent) {
        match event {
            SessionEvent::ModelLoadFinished { generation, result } => {
                if let Err(e) = &result {
                    self.last_error = Some(format!("model load failed: {e:#}"));
                }
                self.model.finish_load(generation, result);
            }
            SessionEvent::EstimateFinished {
                generation,
                model,
                result,
                image,
            } => {
                self.inflight = false;
                if !self.model.check_in(model, generation) {
                    log::debug!("discarding estimate from superseded generation {generation}");
                    return;
                }
                match result {
                    Ok(poses) => {
                        let frame = PoseFrame::new(poses, image);
                        let _ = self.publish.send(frame.clone());
                        self.connection.send(&frame);
                    }
                    Err(e) => log::warn!("estimation failed: {e:#}"),
                }
            }
            SessionEvent::CaptureFinished { attempt, result } => {
                if let Err(e) = self.capture.finish_enable(attempt, result) {
                    self.last_error = Some(e);
                }
            }
            SessionEvent::DevicesEnumerated { result } => match result {
                Ok(devices) => self.capture.apply_devices(devices),
                Err(e) => self.last_error = Some(format!("device enumeration failed: {e:#}")),
            },
        }
    }

    fn publish_status(&mut self) {
        let status = SessionStatus {
            model: self.model.status(),
            generation: self.model.generation(),
            capture: self.capture.status(),
            devices: self.capture.devices().to_vec(),
            device_id: self.capture.device_id().map(String::from),
            connection: self.connection.status(),
            active: self.active,
            last_error: self.last_error.clone(),
        };
        self.status_tx.send_if_modified(|current| {
            if *current != status {
                *current = status;
                true
            } else {
                false
            }
        });
    }
}

//! Camera capture: device enumeration, a latest-frame grabber thread, and
//! the capture lifecycle state machine. The OpenCV-backed implementation
//! lives behind the `desktop` feature; the manager itself is backend
//! agnostic.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use anyhow::Result;

use crate::pose::ImageSize;

/// One RGB24 frame snapshot, row-major.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VideoFrame {
    pub rgb: Vec<u8>,
    pub width: u32,
    pub height: u32,
}

/// A camera known to the backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CameraDevice {
    pub id: String,
    pub label: String,
    pub kind: String,
}

impl CameraDevice {
    pub fn video_input(id: impl Into<String>, label: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            label: label.into(),
            kind: "videoinput".to_string(),
        }
    }
}

/// Parameters for opening a device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CameraRequest {
    pub device_id: Option<String>,
    pub width: u32,
    pub height: u32,
}

/// Producer side of a live stream: the grabber thread stores frames here.
#[derive(Clone)]
pub struct FrameCell {
    latest: Arc<Mutex<Option<VideoFrame>>>,
    frame_id: Arc<AtomicU64>,
    running: Arc<AtomicBool>,
}

impl FrameCell {
    pub fn store(&self, frame: VideoFrame) {
        *self.latest.lock().unwrap() = Some(frame);
        self.frame_id.fetch_add(1, Ordering::Release);
    }

    /// False once the consuming stream has been stopped.
    pub fn is_live(&self) -> bool {
        self.running.load(Ordering::Relaxed)
    }
}

/// Consumer side of a live stream. The latest frame is kept and returned
/// repeatedly until the producer stores a newer one.
pub struct CameraStream {
    latest: Arc<Mutex<Option<VideoFrame>>>,
    frame_id: Arc<AtomicU64>,
    running: Arc<AtomicBool>,
    width: u32,
    height: u32,
}

impl CameraStream {
    /// Create a stream plus its producer handle.
    pub fn channel(width: u32, height: u32) -> (CameraStream, FrameCell) {
        let latest = Arc::new(Mutex::new(None));
        let frame_id = Arc::new(AtomicU64::new(0));
        let running = Arc::new(AtomicBool::new(true));
        let cell = FrameCell {
            latest: Arc::clone(&latest),
            frame_id: Arc::clone(&frame_id),
            running: Arc::clone(&running),
        };
        let stream = CameraStream {
            latest,
            frame_id,
            running,
            width,
            height,
        };
        (stream, cell)
    }

    pub fn resolution(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    /// Increments whenever a new frame arrives.
    pub fn frame_id(&self) -> u64 {
        self.frame_id.load(Ordering::Acquire)
    }

    /// Latest frame, or None before the first one arrives.
    pub fn latest(&self) -> Option<VideoFrame> {
        self.latest.lock().unwrap().clone()
    }

    /// Stop the producer. The grabber thread observes the flag and exits,
    /// releasing the device.
    pub fn stop(&self) {
        self.running.store(false, Ordering::Relaxed);
    }
}

impl Drop for CameraStream {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Device access, as the OS exposes it: enumerate descriptors, open a live
/// stream. Both calls may block and run on the blocking pool.
pub trait CameraBackend: Send + Sync {
    fn enumerate(&self) -> Result<Vec<CameraDevice>>;
    fn open(&self, request: &CameraRequest) -> Result<CameraStream>;
}

// ---------------------------------------------------------------------------
// Capture lifecycle
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CaptureStatus {
    Off,
    Starting,
    Capturing,
    Error,
}

/// Owns the live stream and the enable/disable state machine. Asynchronous
/// opens are issued by the session loop; each is tagged with an attempt
/// counter so a completion that arrives after a disable (or a newer enable)
/// is recognized as stale and its stream is released on the spot.
pub struct CaptureLifecycleManager {
    status: CaptureStatus,
    device_id: Option<String>,
    devices: Vec<CameraDevice>,
    stream: Option<CameraStream>,
    attempt: u64,
    width: u32,
    height: u32,
}

impl CaptureLifecycleManager {
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            status: CaptureStatus::Off,
            device_id: None,
            devices: Vec::new(),
            stream: None,
            attempt: 0,
            width,
            height,
        }
    }

    pub fn status(&self) -> CaptureStatus {
        self.status
    }

    pub fn device_id(&self) -> Option<&str> {
        self.device_id.as_deref()
    }

    pub fn devices(&self) -> &[CameraDevice] {
        &self.devices
    }

    /// Latest frame from the live stream, if capturing.
    pub fn frame(&self) -> Option<VideoFrame> {
        self.stream.as_ref().and_then(|s| s.latest())
    }

    /// Intrinsic resolution of the live stream.
    pub fn resolution(&self) -> Option<ImageSize> {
        self.stream.as_ref().map(|s| {
            let (width, height) = s.resolution();
            ImageSize { width, height }
        })
    }

    /// Begin enabling capture. Returns the tagged open request the caller
    /// should run against the backend, or None when already capturing (a
    /// no-op: no duplicate acquisition, the live stream is untouched).
    pub fn begin_enable(&mut self, device_id: Option<String>) -> Option<(u64, CameraRequest)> {
        if self.status == CaptureStatus::Capturing {
            return None;
        }
        if let Some(id) = device_id {
            self.device_id = Some(id);
        } else if self.device_id.is_none() {
            self.device_id = self.devices.first().map(|d| d.id.clone());
        }
        self.attempt += 1;
        self.status = CaptureStatus::Starting;
        Some((
            self.attempt,
            CameraRequest {
                device_id: self.device_id.clone(),
                width: self.width,
                height: self.height,
            },
        ))
    }

    /// Apply an open completion. A stale completion (superseded attempt or
    /// capture disabled meanwhile) releases the stream immediately. An
    /// error surfaces to the caller; the state lands in `Error` and stays
    /// there until the user retries.
    pub fn finish_enable(
        &mut self,
        attempt: u64,
        result: Result<CameraStream>,
    ) -> Result<(), String> {
        if attempt != self.attempt || self.status != CaptureStatus::Starting {
            if let Ok(stream) = result {
                stream.stop();
            }
            return Ok(());
        }
        match result {
            Ok(stream) => {
                self.stream = Some(stream);
                self.status = CaptureStatus::Capturing;
                Ok(())
            }
            Err(e) => {
                self.status = CaptureStatus::Error;
                Err(format!("camera unavailable: {e:#}"))
            }
        }
    }

    /// Disable capture: stop the stream (releasing the device) before the
    /// state returns to Off. Also invalidates any open still in flight.
    pub fn disable(&mut self) {
        self.attempt += 1;
        if let Some(stream) = self.stream.take() {
            stream.stop();
        }
        self.status = CaptureStatus::Off;
    }

    /// Apply an enumeration result. Idempotent; the first non-empty result
    /// seeds the default device selection.
    pub fn apply_devices(&mut self, devices: Vec<CameraDevice>) {
        if self.device_id.is_none() {
            if let Some(first) = devices.first() {
                self.device_id = Some(first.id.clone());
            }
        }
        self.devices = devices;
    }
}

// ---------------------------------------------------------------------------
// OpenCV backend
// ---------------------------------------------------------------------------

#[cfg(feature = "desktop")]
pub use backend::OpenCvBackend;

#[cfg(feature = "desktop")]
mod backend {
    use std::thread;
    use std::time::{Duration, Instant};

    use anyhow::{bail, Context, Result};
    use opencv::core::Mat;
    use opencv::prelude::*;
    use opencv::videoio::{self, VideoCapture, VideoCaptureAPIs};
    use opencv::imgproc;

    use super::{CameraBackend, CameraDevice, CameraRequest, CameraStream, VideoFrame};

    /// Highest device index probed during enumeration.
    const MAX_PROBE_INDEX: i32 = 8;

    pub struct OpenCvBackend;

    impl OpenCvBackend {
        fn open_device(index: i32, width: u32, height: u32) -> Result<(VideoCapture, u32, u32)> {
            let mut cap = VideoCapture::new(index, VideoCaptureAPIs::CAP_ANY as i32)
                .with_context(|| format!("failed to open camera {index}"))?;
            if !cap.is_opened()? {
                bail!("camera {index} is not available");
            }
            cap.set(videoio::CAP_PROP_FRAME_WIDTH, width as f64)?;
            cap.set(videoio::CAP_PROP_FRAME_HEIGHT, height as f64)?;
            cap.set(videoio::CAP_PROP_BUFFERSIZE, 1.0)?;

            let actual_width = cap.get(videoio::CAP_PROP_FRAME_WIDTH)? as u32;
            let actual_height = cap.get(videoio::CAP_PROP_FRAME_HEIGHT)? as u32;
            Ok((cap, actual_width, actual_height))
        }
    }

    /// BGR (or BGRA) Mat to a tightly packed RGB24 snapshot.
    fn mat_to_frame(mat: &Mat) -> Result<VideoFrame> {
        let mut rgb = Mat::default();
        let code = if mat.channels() == 4 {
            imgproc::COLOR_BGRA2RGB
        } else {
            imgproc::COLOR_BGR2RGB
        };
        imgproc::cvt_color_def(mat, &mut rgb, code)?;

        let rows = rgb.rows() as usize;
        let cols = rgb.cols() as usize;
        let step = rgb.mat_step().get(0);
        let data = rgb.data_bytes()?;

        let mut out = Vec::with_capacity(rows * cols * 3);
        for y in 0..rows {
            out.extend_from_slice(&data[y * step..y * step + cols * 3]);
        }
        Ok(VideoFrame {
            rgb: out,
            width: cols as u32,
            height: rows as u32,
        })
    }

    impl CameraBackend for OpenCvBackend {
        fn enumerate(&self) -> Result<Vec<CameraDevice>> {
            let mut devices = Vec::new();
            for index in 0..MAX_PROBE_INDEX {
                let cap = match VideoCapture::new(index, VideoCaptureAPIs::CAP_ANY as i32) {
                    Ok(c) => c,
                    Err(_) => break,
                };
                if !cap.is_opened().unwrap_or(false) {
                    break;
                }
                devices.push(CameraDevice::video_input(
                    index.to_string(),
                    format!("Camera {index}"),
                ));
            }
            Ok(devices)
        }

        fn open(&self, request: &CameraRequest) -> Result<CameraStream> {
            let index: i32 = match &request.device_id {
                Some(id) => id
                    .parse()
                    .with_context(|| format!("bad camera device id {id:?}"))?,
                None => 0,
            };
            let (mut cap, width, height) = OpenCvBackend::open_device(index, request.width, request.height)?;
            let (stream, cell) = CameraStream::channel(width, height);

            thread::spawn(move || {
                let target_interval = Duration::from_millis(33); // ~30fps
                while cell.is_live() {
                    let start = Instant::now();
                    let mut frame = Mat::default();
                    match cap.read(&mut frame) {
                        Ok(true) if !frame.empty() => match mat_to_frame(&frame) {
                            Ok(f) => cell.store(f),
                            Err(e) => log::warn!("[cam{index}] convert error: {e}"),
                        },
                        Ok(_) => thread::sleep(Duration::from_millis(5)),
                        Err(e) => {
                            log::warn!("[cam{index}] read error: {e}");
                            thread::sleep(Duration::from_millis(100));
                        }
                    }
                    let elapsed = start.elapsed();
                    if elapsed < target_interval {
                        thread::sleep(target_interval - elapsed);
                    }
                }
                // dropping the VideoCapture releases the device
            });

            Ok(stream)
        }
    }
}

//! Interactive pose broadcast client: captures the local camera, runs pose
//! estimation every display tick, and exchanges pose frames with other
//! peers through a relay server. Driven by single-letter console commands.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tokio::sync::mpsc;

use posecast::capture::OpenCvBackend;
use posecast::config::{ClientConfig, EstimationConfig, ModelConfig, ModelVariant};
use posecast::engine::OnnxLoader;
use posecast::session::{self, SessionHandle};

const CONFIG_PATH: &str = "posecast.toml";

fn print_help() {
    println!("commands:");
    println!("  c [id]  - toggle camera capture (optionally selecting a device)");
    println!("  e       - toggle pose estimation");
    println!("  n       - connect to the relay");
    println!("  d       - disconnect from the relay");
    println!("  v       - list camera devices");
    println!("  a       - switch architecture (reloads the model)");
    println!("  s       - cycle output stride");
    println!("  m       - cycle multiplier (reloads the model)");
    println!("  i       - show status");
    println!("  q       - quit");
}

fn print_status(handle: &SessionHandle, estimation: &EstimationConfig) {
    let status = handle.status();
    println!("model:      {:?} (generation {})", status.model, status.generation);
    println!("variant:    {}", estimation.variant);
    println!("capture:    {:?} (device {:?})", status.capture, status.device_id);
    println!("connection: {:?}", status.connection);
    println!("estimating: {}", status.active);
    if let Some(error) = &status.last_error {
        println!("last error: {error}");
    }
}

struct Client {
    handle: SessionHandle,
    estimation: EstimationConfig,
    models_dir: String,
    host: String,
    port: u16,
}

impl Client {
    fn model_config(&self) -> ModelConfig {
        ModelConfig {
            variant: self.estimation.variant,
            models_dir: self.models_dir.clone().into(),
        }
    }

    /// Apply a new variant: estimation params always update on the next
    /// tick; a reload is only issued when the weights actually change.
    fn apply_variant(&mut self, variant: ModelVariant) {
        let reload = !self.estimation.variant.same_weights(&variant);
        self.estimation.variant = variant;
        self.handle.set_estimation(self.estimation);
        if reload {
            self.handle.load_model(self.model_config());
            println!("reloading model: {}", self.estimation.variant);
        } else {
            println!("variant now: {}", self.estimation.variant);
        }
    }

    /// Returns false when the client should exit.
    fn handle_line(&mut self, line: &str) -> bool {
        let parts: Vec<&str> = line.trim().split_whitespace().collect();
        let Some(&command) = parts.first() else {
            return true;
        };
        match command {
            "c" => {
                use posecast::capture::CaptureStatus;
                let status = self.handle.status();
                let device_id = parts.get(1).map(|s| s.to_string());
                let capturing = matches!(
                    status.capture,
                    CaptureStatus::Capturing | CaptureStatus::Starting
                );
                if capturing && device_id.is_some() {
                    // enabling while capturing is a no-op, so a device
                    // switch is an explicit disable + enable
                    self.handle.set_capture(false, None);
                    self.handle.set_capture(true, device_id);
                    println!("capture restarted on new device");
                } else if capturing {
                    self.handle.set_capture(false, None);
                    println!("capture disabled");
                } else {
                    self.handle.set_capture(true, device_id);
                    println!("capture enabled");
                }
            }
            "e" => {
                let active = !self.handle.status().active;
                self.handle.set_active(active);
                println!("estimation {}", if active { "on" } else { "off" });
            }
            "n" => {
                println!("connecting to {}:{}", self.host, self.port);
                self.handle.connect(&self.host, self.port);
            }
            "d" => {
                self.handle.disconnect();
                println!("disconnected");
            }
            "v" => {
                self.handle.enumerate_devices();
                // enumeration is asynchronous; show what we have already
                let status = self.handle.status();
                if status.devices.is_empty() {
                    println!("no devices known yet, enumerating...");
                }
                for device in &status.devices {
                    println!("  [{}] {} ({})", device.id, device.label, device.kind);
                }
            }
            "a" => {
                let next = match self.estimation.variant.architecture() {
                    "MobileNetV1" => self.estimation.variant.with_architecture("ResNet50"),
                    _ => self.estimation.variant.with_architecture("MobileNetV1"),
                };
                self.apply_variant(next);
            }
            "s" => {
                let variant = self.estimation.variant;
                let next = match (variant.architecture(), variant.output_stride().value()) {
                    ("MobileNetV1", 8) => 16,
                    ("MobileNetV1", _) => 8,
                    ("ResNet50", 16) => 32,
                    _ => 16,
                };
                self.apply_variant(variant.with_output_stride(next));
            }
            "m" => {
                let next = match self.estimation.variant.multiplier().value() {
                    v if v < 0.6 => 0.75,
                    v if v < 0.9 => 1.0,
                    _ => 0.5,
                };
                self.apply_variant(self.estimation.variant.with_multiplier(next));
            }
            "i" => print_status(&self.handle, &self.estimation),
            "q" => {
                println!("shutting down");
                return false;
            }
            other => {
                println!("unknown command: {other}");
                print_help();
            }
        }
        true
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::init();
    println!("posecast client ({})", env!("GIT_VERSION"));

    let config = ClientConfig::load_or_default(CONFIG_PATH);
    let estimation = config.estimation_config();
    let tick = Duration::from_secs_f64(1.0 / config.tick_hz.max(1) as f64);

    let handle = session::spawn(
        Arc::new(OnnxLoader),
        Arc::new(OpenCvBackend),
        estimation,
        (config.capture_width, config.capture_height),
        tick,
    );

    // seed the device list and load the configured model up front
    handle.enumerate_devices();
    handle.load_model(config.model_config());
    if let Some(device_id) = &config.device_id {
        handle.set_capture(true, Some(device_id.clone()));
    }

    let mut client = Client {
        handle,
        estimation,
        models_dir: config.models_dir.clone(),
        host: config.host.clone(),
        port: config.port,
    };

    print_help();

    // console input thread
    let (line_tx, mut line_rx) = mpsc::unbounded_channel::<String>();
    std::thread::spawn(move || {
        let stdin = std::io::stdin();
        let mut line = String::new();
        loop {
            line.clear();
            match stdin.read_line(&mut line) {
                Ok(0) | Err(_) => break,
                Ok(_) => {
                    if line_tx.send(line.clone()).is_err() {
                        break;
                    }
                }
            }
        }
    });

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                println!("interrupted");
                break;
            }
            line = line_rx.recv() => match line {
                Some(line) => {
                    if !client.handle_line(&line) {
                        break;
                    }
                }
                None => break,
            },
        }
    }

    client.handle.shutdown().await;
    Ok(())
}

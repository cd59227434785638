//! Replays a recorded sequence of per-device frames through the risk
//! pipeline and prints the fused risk code for each frame.

use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use anyhow::{Context, Result};
use clap::Parser;
use helmet_risk_common::{BoundingBox, ClassId, DeviceId};
use helmet_risk_orchestrator::{
    DecodedFrame, DetectionBatch, DetectorAdapter, DetectorFailure, FrameEnvelope, PipelineConfig, PipelineRegistry,
    RawDetection, RiskNotifier,
};
use image::RgbImage;
use serde::Deserialize;
use tracing::info;

#[derive(Parser)]
#[command(name = "risk-core", version, about = "Construction-site helmet risk pipeline replay")]
struct Args {
    /// Path to a JSON scenario file.
    scenario: PathBuf,

    /// Path to a JSON `PipelineConfig` override. Defaults are used if omitted.
    #[arg(long)]
    config: Option<PathBuf>,
}

#[derive(Debug, Deserialize)]
struct ScenarioFile {
    device_id: String,
    frames: Vec<ScenarioFrame>,
}

#[derive(Debug, Deserialize)]
struct ScenarioFrame {
    #[serde(default)]
    capture_interval_ms: u32,
    #[serde(default = "default_dim")]
    width: u32,
    #[serde(default = "default_dim")]
    height: u32,
    #[serde(default)]
    detections: Vec<ScenarioDetection>,
}

fn default_dim() -> u32 {
    640
}

#[derive(Debug, Deserialize)]
struct ScenarioDetection {
    class_id: u32,
    bbox: [f32; 4],
    score: f32,
}

/// Replays detections recorded in the scenario file in order, one batch per
/// `detect` call; the pipeline itself supplies the frame cadence.
struct ReplayDetector {
    queue: Mutex<VecDeque<DetectionBatch>>,
}

impl DetectorAdapter for ReplayDetector {
    fn detect(&self, _frame: &DecodedFrame) -> Result<DetectionBatch, DetectorFailure> {
        Ok(self.queue.lock().unwrap().pop_front().unwrap_or_default())
    }
}

struct StdoutNotifier;

impl RiskNotifier for StdoutNotifier {
    fn notify(&self, device: &DeviceId, risk_code: u8, _event_blob_key: Option<String>) {
        println!("{device} risk_code={risk_code}");
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt().with_env_filter("info").init();

    let args = Args::parse();
    let scenario_text = std::fs::read_to_string(&args.scenario)
        .with_context(|| format!("reading scenario file {}", args.scenario.display()))?;
    let scenario: ScenarioFile = serde_json::from_str(&scenario_text).context("parsing scenario JSON")?;

    let config = match &args.config {
        Some(path) => {
            let text = std::fs::read_to_string(path)
                .with_context(|| format!("reading config file {}", path.display()))?;
            serde_json::from_str(&text).context("parsing config JSON")?
        }
        None => PipelineConfig::default(),
    };

    let device_id = DeviceId(scenario.device_id.clone());
    let mut queue = VecDeque::new();
    for frame in &scenario.frames {
        let detections = frame
            .detections
            .iter()
            .map(|d| RawDetection {
                bbox: BoundingBox::new(d.bbox[0], d.bbox[1], d.bbox[2], d.bbox[3]),
                score: d.score,
                class_id: ClassId(d.class_id),
                mask: None,
            })
            .collect();
        queue.push_back(DetectionBatch { detections });
    }
    let detector: Arc<dyn DetectorAdapter> = Arc::new(ReplayDetector { queue: Mutex::new(queue) });
    let notifier = StdoutNotifier;

    let mut registry = PipelineRegistry::new(config);
    info!(device_id = %scenario.device_id, frame_count = scenario.frames.len(), "starting replay");

    for frame in scenario.frames {
        let envelope = FrameEnvelope { capture_interval_ms: frame.capture_interval_ms, jpeg_bytes: Vec::new() };
        let decoded = DecodedFrame::new(RgbImage::new(frame.width, frame.height));
        registry.submit_frame(device_id.clone(), envelope, decoded);
        registry.drain_device(&device_id, detector.clone(), &notifier).await;
    }

    Ok(())
}

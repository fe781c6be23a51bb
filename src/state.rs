use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::metrics::TestMetrics;

/// Pipeline stages reported by the analysis backend, in execution order
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum StageId {
    /// Locating a suitable instructional video
    VideoSearch,

    /// Downloading the selected video
    VideoDownload,

    /// Extracting candidate frames from the video
    FrameExtraction,

    /// Cropping frames down to UI screenshots
    UiScreens,

    /// Vision-model pass that turns screenshots into guide steps
    ResultProcessing,
}

impl StageId {
    /// All stages in pipeline order
    pub const ALL: [StageId; 5] = [
        StageId::VideoSearch,
        StageId::VideoDownload,
        StageId::FrameExtraction,
        StageId::UiScreens,
        StageId::ResultProcessing,
    ];

    /// Identifier used on the wire by the progress stream
    pub fn wire_id(&self) -> &'static str {
        match self {
            StageId::VideoSearch => "video-search",
            StageId::VideoDownload => "video-download",
            StageId::FrameExtraction => "frame-extraction",
            StageId::UiScreens => "ui-screens",
            StageId::ResultProcessing => "osatlas-processing",
        }
    }

    /// Human-readable stage name
    pub fn display_name(&self) -> &'static str {
        match self {
            StageId::VideoSearch => "Searching for Video",
            StageId::VideoDownload => "Downloading Video",
            StageId::FrameExtraction => "Extracting Frames",
            StageId::UiScreens => "Extracting UI Screens",
            StageId::ResultProcessing => "Analyzing UI Steps",
        }
    }

    /// Progress percentage assigned when this stage completes
    pub fn checkpoint(&self) -> u8 {
        match self {
            StageId::VideoSearch => 10,
            StageId::VideoDownload => 20,
            StageId::FrameExtraction => 35,
            StageId::UiScreens => 50,
            StageId::ResultProcessing => 90,
        }
    }

    /// Resolve a wire identifier to a stage
    pub fn from_wire_id(id: &str) -> Option<StageId> {
        StageId::ALL.iter().copied().find(|s| s.wire_id() == id)
    }
}

/// Status of a single pipeline stage within a run
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum StageStatus {
    Pending,
    Active,
    Completed,
    Error,
}

impl StageStatus {
    /// Completed and Error are final for the remainder of the run
    pub fn is_terminal(&self) -> bool {
        matches!(self, StageStatus::Completed | StageStatus::Error)
    }
}

/// One named phase of the processing pipeline as shown to the user
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineStage {
    /// Stage identifier
    pub id: StageId,

    /// Display name
    pub name: String,

    /// Current status
    pub status: StageStatus,

    /// Latest backend-supplied message for this stage
    pub message: Option<String>,
}

impl PipelineStage {
    fn pending(id: StageId) -> Self {
        Self {
            id,
            name: id.display_name().to_string(),
            status: StageStatus::Pending,
            message: None,
        }
    }
}

/// Stage-level update decoded from a progress event
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StageUpdate {
    pub stage: StageId,
    pub status: StageStatus,
    pub message: Option<String>,
}

/// Screen region a guide step points at
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct BoundingBox {
    pub x: f64,
    pub y: f64,
    pub width: f64,
    pub height: f64,
}

/// User-assigned quality label for a guide step
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum StepQuality {
    Good,
    Bad,
    Repeated,
    NotRelevant,
}

/// User verdict on a step's bounding box
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum BboxVerification {
    Correct,
    Incorrect,
    NotNeeded,
    Missing,
}

/// One step of the produced guide
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepResult {
    /// Step index, unique within a run, starting at 1
    pub step: u32,

    /// Action description, may embed coordinate annotations
    pub action: String,

    /// Model rationale for the action
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thought: Option<String>,

    /// Relative path to the step screenshot on the image host
    pub image: String,

    /// Region of interest inside the screenshot
    #[serde(
        rename = "boundingBox",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub bounding_box: Option<BoundingBox>,

    /// User-assigned step quality label
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub step_quality: Option<StepQuality>,

    /// User-assigned bounding-box verdict
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bbox_verification: Option<BboxVerification>,
}

/// Per-stage wall-clock duration reported in the terminal payload
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TimingEntry {
    pub duration: f64,
}

/// Terminal success payload delivered by the stream or the fallback request
#[derive(Debug, Clone, Default, Deserialize)]
pub struct CompletePayload {
    #[serde(default)]
    pub results: Vec<StepResult>,

    #[serde(default)]
    pub timing: Option<std::collections::HashMap<String, TimingEntry>>,

    #[serde(default)]
    pub video_id: Option<String>,

    /// Upstream convention: a 200 body may still carry an error message
    #[serde(default)]
    pub error: Option<String>,
}

/// Lifecycle of a single query run
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum RunPhase {
    Idle,
    Processing,
    Succeeded,
    Failed,
}

/// Aggregate state for one query execution
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunState {
    /// Query text for the current or last run
    pub query: String,

    /// Current lifecycle phase
    pub phase: RunPhase,

    /// Pipeline stages in execution order
    pub stages: Vec<PipelineStage>,

    /// Scalar progress in [0, 100]
    pub progress: u8,

    /// Guide steps, in step order
    pub results: Vec<StepResult>,

    /// Failure reason, if the run failed
    pub error: Option<String>,

    /// Backend identifier of the analyzed video
    pub video_id: Option<String>,

    /// Per-stage timing reported by the backend
    pub timing: Option<std::collections::HashMap<String, TimingEntry>>,

    /// Verification tally, recomputed in full on every verification edit
    pub test_metrics: Option<TestMetrics>,
}

impl Default for RunState {
    fn default() -> Self {
        Self {
            query: String::new(),
            phase: RunPhase::Idle,
            stages: StageId::ALL.iter().map(|&id| PipelineStage::pending(id)).collect(),
            progress: 0,
            results: Vec::new(),
            error: None,
            video_id: None,
            timing: None,
            test_metrics: None,
        }
    }
}

impl RunState {
    /// True while a run is in flight
    pub fn is_processing(&self) -> bool {
        self.phase == RunPhase::Processing
    }

    /// Begin a new run, resetting all per-run state
    pub fn start_run(&mut self, query: &str) {
        info!("🚀 Starting analysis run for query: {}", query);
        self.query = query.to_string();
        self.phase = RunPhase::Processing;
        self.stages = StageId::ALL.iter().map(|&id| PipelineStage::pending(id)).collect();
        self.progress = 0;
        self.results.clear();
        self.error = None;
        self.video_id = None;
        self.timing = None;
        self.test_metrics = None;
    }

    /// Apply a stage-level progress event. Only valid while processing.
    pub fn apply_stage_update(&mut self, update: StageUpdate) {
        if !self.is_processing() {
            debug!("Ignoring stage update outside of a run: {:?}", update);
            return;
        }

        let derived = derive_progress(&update);

        if let Some(stage) = self.stages.iter_mut().find(|s| s.id == update.stage) {
            // Completed/Error stages stay put for the rest of the run
            if stage.status.is_terminal() && stage.status != update.status {
                debug!(
                    "Stage {} already {:?}, ignoring transition to {:?}",
                    update.stage.wire_id(),
                    stage.status,
                    update.status
                );
            } else {
                stage.status = update.status;
                if update.message.is_some() {
                    stage.message = update.message.clone();
                }
                match update.status {
                    StageStatus::Active => info!("⏳ {}", stage.name),
                    StageStatus::Completed => info!("✅ {}", stage.name),
                    _ => {}
                }
            }
        } else {
            warn!("Progress event for unknown stage: {:?}", update.stage);
        }

        // Progress never moves backwards within a run
        if let Some(pct) = derived {
            if pct > self.progress {
                self.progress = pct;
                debug!("📈 Progress: {}%", self.progress);
            }
        }
    }

    /// Terminal success. The first terminal transition wins; later ones are no-ops.
    pub fn complete(&mut self, payload: CompletePayload) {
        if !self.is_processing() {
            debug!("Ignoring duplicate terminal success");
            return;
        }

        self.phase = RunPhase::Succeeded;
        self.progress = 100;
        for stage in &mut self.stages {
            stage.status = StageStatus::Completed;
        }
        self.results = payload.results;
        self.results.sort_by_key(|r| r.step);
        self.video_id = payload.video_id;
        self.timing = payload.timing;
        self.error = None;

        info!("🎉 Analysis completed with {} steps", self.results.len());
    }

    /// Terminal failure. The first terminal transition wins; later ones are no-ops.
    ///
    /// Progress resets to 0; stage statuses stay as last observed.
    pub fn fail(&mut self, reason: &str) {
        if !self.is_processing() {
            debug!("Ignoring duplicate terminal failure: {}", reason);
            return;
        }

        self.phase = RunPhase::Failed;
        self.error = Some(reason.to_string());
        self.progress = 0;

        warn!("❌ Analysis failed: {}", reason);
    }

    /// Return to idle with pristine per-run state
    pub fn reset(&mut self) {
        *self = RunState::default();
        debug!("🔄 Run state reset");
    }

    /// Assign a quality label to a step
    pub fn set_step_quality(&mut self, step: u32, quality: StepQuality) -> bool {
        match self.results.iter_mut().find(|r| r.step == step) {
            Some(result) => {
                result.step_quality = Some(quality);
                true
            }
            None => false,
        }
    }

    /// Assign a bounding-box verdict to a step and recompute the tally
    pub fn set_bbox_verification(&mut self, step: u32, verification: BboxVerification) -> bool {
        let found = match self.results.iter_mut().find(|r| r.step == step) {
            Some(result) => {
                result.bbox_verification = Some(verification);
                true
            }
            None => false,
        };

        if found {
            self.test_metrics = Some(TestMetrics::from_results(&self.results));
        }
        found
    }
}

/// Map a stage update to a progress percentage.
///
/// A stage update lands on the stage's checkpoint. An active final stage
/// with a "frame K/N" indicator in its message interpolates between the 50%
/// and 90% checkpoints so a long vision-model pass moves smoothly instead of
/// jumping.
fn derive_progress(update: &StageUpdate) -> Option<u8> {
    match update.status {
        StageStatus::Completed => Some(update.stage.checkpoint()),
        StageStatus::Active => {
            if update.stage == StageId::ResultProcessing {
                if let Some(message) = &update.message {
                    if let Some(pct) = interpolate_frame_progress(message) {
                        return Some(pct);
                    }
                }
                // No frame indicator yet, hold at the previous checkpoint
                return Some(StageId::UiScreens.checkpoint());
            }
            Some(update.stage.checkpoint())
        }
        _ => None,
    }
}

/// Parse a "Processing frame K/N" indicator into an interpolated percentage
fn interpolate_frame_progress(message: &str) -> Option<u8> {
    if let Ok(re) = Regex::new(r"frame (\d+)\s*/\s*(\d+)") {
        if let Some(captures) = re.captures(message) {
            let current: f64 = captures.get(1)?.as_str().parse().ok()?;
            let total: f64 = captures.get(2)?.as_str().parse().ok()?;
            if total > 0.0 {
                let floor = StageId::UiScreens.checkpoint() as f64;
                let span = StageId::ResultProcessing.checkpoint() as f64 - floor;
                let pct = floor + (current / total).min(1.0) * span;
                return Some(pct.round() as u8);
            }
        }
    }
    None
}

/// Video Guide Client - Rust Implementation
///
/// Client library for the video guide analysis service: streams pipeline
/// progress for a natural-language query, falls back to a blocking request
/// when the stream stalls, and manages the resulting step-by-step guide
/// with user verification and accuracy metrics.

pub mod api;
pub mod config;
pub mod metrics;
pub mod orchestrator;
pub mod state;
pub mod stream;

// Re-export main types for easy access
pub use crate::api::ApiClient;
pub use crate::config::{Config, ConfigBuilder};
pub use crate::metrics::{AccuracyReport, TestMetrics};
pub use crate::orchestrator::QueryOrchestrator;
pub use crate::state::{
    BboxVerification, CompletePayload, PipelineStage, RunPhase, RunState, StageId, StageStatus,
    StageUpdate, StepQuality, StepResult,
};
pub use crate::stream::{ProgressStream, StreamEvent, StreamHandle, TransportSignal};

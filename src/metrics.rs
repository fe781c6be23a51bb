use serde::{Deserialize, Serialize};

use crate::state::{BboxVerification, RunState, StepQuality, StepResult};

/// Tally over the bounding-box verdicts of a result list.
///
/// Always derived in full from the current results, never updated
/// incrementally.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct TestMetrics {
    pub correct: usize,
    pub incorrect: usize,
    pub not_needed: usize,
    pub missing: usize,

    /// Number of steps in the run, verified or not
    pub total: usize,

    /// correct / verified * 100, 0 when nothing is verified yet
    pub accuracy: f64,
}

impl TestMetrics {
    /// Recompute the tally from scratch over a result list
    pub fn from_results(results: &[StepResult]) -> Self {
        let mut metrics = TestMetrics {
            total: results.len(),
            ..Default::default()
        };

        for result in results {
            match result.bbox_verification {
                Some(BboxVerification::Correct) => metrics.correct += 1,
                Some(BboxVerification::Incorrect) => metrics.incorrect += 1,
                Some(BboxVerification::NotNeeded) => metrics.not_needed += 1,
                Some(BboxVerification::Missing) => metrics.missing += 1,
                None => {}
            }
        }

        // Only "correct" counts as success; the rest all reduce accuracy
        let verified =
            metrics.correct + metrics.incorrect + metrics.not_needed + metrics.missing;
        if verified > 0 {
            metrics.accuracy = metrics.correct as f64 / verified as f64 * 100.0;
        }

        metrics
    }
}

/// Export body for the accuracy-metrics endpoint
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccuracyReport {
    pub video_id: String,
    pub query: String,
    pub correct: usize,
    pub incorrect: usize,
    pub not_needed: usize,
    pub missing: usize,
    pub total: usize,
    pub accuracy: f64,
    pub step_qualities: Vec<StepQualityEntry>,
    pub bbox_verifications: Vec<BboxVerificationEntry>,
}

/// Per-step quality label as exported
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepQualityEntry {
    pub step: u32,
    pub quality: Option<StepQuality>,
}

/// Per-step bounding-box verdict as exported
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BboxVerificationEntry {
    pub step: u32,
    pub verification: Option<BboxVerification>,
}

impl AccuracyReport {
    /// Build the export body from the current run state
    pub fn from_run(state: &RunState) -> Self {
        let metrics = TestMetrics::from_results(&state.results);

        Self {
            video_id: state.video_id.clone().unwrap_or_default(),
            query: state.query.clone(),
            correct: metrics.correct,
            incorrect: metrics.incorrect,
            not_needed: metrics.not_needed,
            missing: metrics.missing,
            total: metrics.total,
            accuracy: metrics.accuracy,
            step_qualities: state
                .results
                .iter()
                .map(|r| StepQualityEntry {
                    step: r.step,
                    quality: r.step_quality,
                })
                .collect(),
            bbox_verifications: state
                .results
                .iter()
                .map(|r| BboxVerificationEntry {
                    step: r.step,
                    verification: r.bbox_verification,
                })
                .collect(),
        }
    }
}

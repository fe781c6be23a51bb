//! One-run-at-a-time coordination between the progress transport, the
//! fallback request path, and the process state machine.

use anyhow::{anyhow, Result};
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};
use tokio::time::{sleep, Duration};
use tracing::{debug, info, warn};

use crate::api::ApiClient;
use crate::config::Config;
use crate::metrics::AccuracyReport;
use crate::state::{BboxVerification, RunState, StepQuality, StepResult};
use crate::stream::{ProgressStream, StreamHandle, TransportSignal};

/// Drives a single query run end to end.
///
/// Owns the one [`RunState`] instance; presentation code reads snapshots and
/// triggers the named operations, never mutating state directly.
pub struct QueryOrchestrator {
    config: Config,
    api: ApiClient,
    stream: ProgressStream,
    state: Arc<RwLock<RunState>>,
    active: Mutex<Option<StreamHandle>>,
}

impl QueryOrchestrator {
    pub fn new(config: Config) -> Self {
        Self {
            api: ApiClient::new(&config),
            stream: ProgressStream::new(&config),
            state: Arc::new(RwLock::new(RunState::default())),
            active: Mutex::new(None),
            config,
        }
    }

    /// Read-only snapshot of the current run state
    pub async fn snapshot(&self) -> RunState {
        self.state.read().await.clone()
    }

    /// Resolve a step's image path against the configured image host
    pub fn image_url(&self, image_path: &str) -> String {
        self.api.image_url(image_path)
    }

    /// Submit a query and drive it to a terminal state.
    ///
    /// Rejects immediately if a run is already in flight. Otherwise the
    /// progress stream feeds the state machine until the first terminal
    /// signal; if none arrives before the fallback deadline, the stream is
    /// torn down and the blocking endpoint is queried exactly once.
    pub async fn submit(&self, query: &str) -> Result<Vec<StepResult>> {
        {
            let mut state = self.state.write().await;
            if state.is_processing() {
                return Err(anyhow!("A run is already in progress"));
            }
            state.start_run(query);
        }

        let (handle, mut rx) = self.stream.subscribe(query);
        {
            let mut active = self.active.lock().await;
            if let Some(previous) = active.replace(handle) {
                previous.stop();
            }
        }

        let deadline = sleep(Duration::from_secs(self.config.stream.fallback_deadline_secs));
        tokio::pin!(deadline);
        let mut stream_done = false;

        let outcome = loop {
            tokio::select! {
                signal = rx.recv(), if !stream_done => match signal {
                    Some(TransportSignal::Stage(update)) => {
                        self.state.write().await.apply_stage_update(update);
                    }
                    Some(TransportSignal::Success(payload)) => {
                        let mut state = self.state.write().await;
                        state.complete(payload);
                        break Ok(state.results.clone());
                    }
                    Some(TransportSignal::Failure(reason)) => {
                        self.state.write().await.fail(&reason);
                        break Err(anyhow!(reason));
                    }
                    None => {
                        // Stream ended without a terminal signal. If the
                        // run was cancelled, give up; otherwise wait for
                        // the deadline to trigger the fallback request.
                        if !self.state.read().await.is_processing() {
                            break Err(anyhow!("Run cancelled"));
                        }
                        debug!("Progress stream ended without a terminal event");
                        stream_done = true;
                    }
                },
                _ = &mut deadline => {
                    warn!("⏰ Stream deadline elapsed, falling back to blocking request");
                    if let Some(handle) = self.active.lock().await.take() {
                        handle.stop();
                    }

                    match self.api.process_query(query).await {
                        Ok(payload) => {
                            let mut state = self.state.write().await;
                            state.complete(payload);
                            break Ok(state.results.clone());
                        }
                        Err(e) => {
                            let reason = e.to_string();
                            self.state.write().await.fail(&reason);
                            break Err(e);
                        }
                    }
                }
            }
        };

        if let Some(handle) = self.active.lock().await.take() {
            handle.stop();
        }

        outcome
    }

    /// Discard the current run and return to idle.
    ///
    /// Tears down any in-flight transport before state is touched; two
    /// transports never run against the same state.
    pub async fn reset(&self) {
        if let Some(handle) = self.active.lock().await.take() {
            handle.stop();
        }
        self.state.write().await.reset();
        info!("🔄 Analysis state reset");
    }

    /// Assign a quality label to a guide step
    pub async fn verify_step_quality(&self, step: u32, quality: StepQuality) -> Result<()> {
        let mut state = self.state.write().await;
        if state.set_step_quality(step, quality) {
            Ok(())
        } else {
            Err(anyhow!("No step {} in the current results", step))
        }
    }

    /// Record a bounding-box verdict for a guide step
    pub async fn verify_bbox(&self, step: u32, verification: BboxVerification) -> Result<()> {
        let mut state = self.state.write().await;
        if state.set_bbox_verification(step, verification) {
            Ok(())
        } else {
            Err(anyhow!("No step {} in the current results", step))
        }
    }

    /// Export the current verification tally to the service
    pub async fn save_metrics(&self) -> Result<()> {
        let report = {
            let state = self.state.read().await;
            if state.results.is_empty() {
                return Err(anyhow!("No results to report metrics for"));
            }
            AccuracyReport::from_run(&state)
        };

        self.api.save_accuracy_metrics(&report).await
    }
}

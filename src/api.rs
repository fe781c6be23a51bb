use anyhow::{anyhow, Result};
use tokio::time::Duration;
use tracing::{debug, info};

use crate::config::Config;
use crate::metrics::AccuracyReport;
use crate::state::CompletePayload;

/// Request/response client for the analysis service.
///
/// The streaming path lives in [`crate::stream`]; this client covers the
/// one-shot endpoints: the blocking fallback query and the accuracy-metrics
/// export.
pub struct ApiClient {
    config: Config,
    client: reqwest::Client,
}

impl ApiClient {
    pub fn new(config: &Config) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.api.request_timeout_secs))
            .connect_timeout(Duration::from_secs(config.api.connect_timeout_secs))
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());

        Self {
            config: config.clone(),
            client,
        }
    }

    fn endpoint(&self, path: &str) -> String {
        format!(
            "{}/{}",
            self.config.api.base_url.trim_end_matches('/'),
            path.trim_start_matches('/')
        )
    }

    /// Submit a query over the blocking endpoint.
    ///
    /// This is the degraded path used when the progress stream does not
    /// terminate in time; it returns the same terminal payload the stream
    /// would have delivered. The endpoint takes form data and reports
    /// failures as a 200 body carrying an `error` field.
    pub async fn process_query(&self, query: &str) -> Result<CompletePayload> {
        info!("🌐 Submitting blocking query: {}", query);

        let response = self
            .client
            .post(self.endpoint("process-query"))
            .form(&[("query", query)])
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            let error_text = response.text().await.unwrap_or_default();
            return Err(anyhow!("Query request failed ({}): {}", status, error_text));
        }

        let payload: CompletePayload = response.json().await?;
        if let Some(error) = payload.error {
            return Err(anyhow!("{}", error));
        }

        info!("✅ Blocking query returned {} steps", payload.results.len());
        Ok(payload)
    }

    /// Export a verification tally to the service
    pub async fn save_accuracy_metrics(&self, report: &AccuracyReport) -> Result<()> {
        debug!(
            "📊 Saving accuracy metrics for video {} ({} steps)",
            report.video_id, report.total
        );

        let response = self
            .client
            .post(self.endpoint("save-accuracy-metrics"))
            .json(report)
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            let error_text = response.text().await.unwrap_or_default();
            return Err(anyhow!(
                "Saving metrics failed ({}): {}",
                status,
                error_text
            ));
        }

        info!("💾 Accuracy metrics saved");
        Ok(())
    }

    /// Resolve a step's relative image path against the image host.
    ///
    /// Image loading itself is a presentation concern; a missing image is
    /// shown as a placeholder and never fails a run.
    pub fn image_url(&self, image_path: &str) -> String {
        let host = self
            .config
            .api
            .image_host
            .as_deref()
            .unwrap_or(&self.config.api.base_url);
        format!(
            "{}/{}",
            host.trim_end_matches('/'),
            image_path.trim_start_matches('/')
        )
    }
}

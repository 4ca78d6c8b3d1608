//! REST review client for alert acknowledgments.
//!
//! The presenter acknowledges operator decisions through this seam:
//! confirm → resolve, mark-false → false-positive, plus free-form notes.
//! It is a trait so tests (and embedders) can substitute a recording fake.

use async_trait::async_trait;
use serde_json::json;
use std::time::Duration;

/// Errors from review acknowledgment calls.
#[derive(Debug, thiserror::Error)]
pub enum ReviewError {
    #[error("review request failed: {0}")]
    Http(#[from] reqwest::Error),
}

/// Upstream acknowledgment calls for alert triage decisions.
#[async_trait]
pub trait AlertReviewApi: Send + Sync {
    /// Confirm the alert as a real threat.
    async fn resolve(&self, alert_id: &str, notes: Option<&str>) -> Result<(), ReviewError>;

    /// Classify the alert as a false alarm.
    async fn mark_false_positive(
        &self,
        alert_id: &str,
        notes: Option<&str>,
    ) -> Result<(), ReviewError>;

    /// Attach a reviewer note, leaving the alert under review.
    async fn add_note(&self, alert_id: &str, note: &str) -> Result<(), ReviewError>;
}

/// HTTP implementation against the backend's alert review endpoints.
pub struct HttpReviewClient {
    base_url: String,
    http: reqwest::Client,
}

impl HttpReviewClient {
    /// `base_url` is the API root, e.g. `http://host:8000/api/v1`.
    pub fn new(base_url: impl Into<String>) -> Self {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .unwrap_or_default();
        Self {
            base_url: base_url.into(),
            http,
        }
    }

    fn alert_url(&self, alert_id: &str, suffix: &str) -> String {
        format!(
            "{}/alerts/{}/{}",
            self.base_url.trim_end_matches('/'),
            alert_id,
            suffix
        )
    }
}

#[async_trait]
impl AlertReviewApi for HttpReviewClient {
    async fn resolve(&self, alert_id: &str, notes: Option<&str>) -> Result<(), ReviewError> {
        self.http
            .patch(self.alert_url(alert_id, "resolve"))
            .json(&json!({ "notes": notes }))
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }

    async fn mark_false_positive(
        &self,
        alert_id: &str,
        notes: Option<&str>,
    ) -> Result<(), ReviewError> {
        self.http
            .patch(self.alert_url(alert_id, "false-positive"))
            .json(&json!({ "notes": notes }))
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }

    async fn add_note(&self, alert_id: &str, note: &str) -> Result<(), ReviewError> {
        self.http
            .put(self.alert_url(alert_id, "review"))
            .json(&json!({ "status": "under_review", "notes": note }))
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }
}

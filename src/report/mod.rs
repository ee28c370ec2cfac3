//! Match result reporting: structured log line plus an optional webhook POST

use reqwest::Client;
use tracing::info;

use crate::ws::protocol::MatchResult;

/// Publishes the final result of the match
#[derive(Clone)]
pub struct ResultReporter {
    client: Client,
    webhook_url: Option<String>,
}

impl ResultReporter {
    pub fn new(webhook_url: Option<String>) -> Self {
        Self {
            client: Client::new(),
            webhook_url,
        }
    }

    /// Log the result and deliver it to the webhook, if one is configured
    pub async fn report(&self, result: &MatchResult) -> Result<(), ReportError> {
        let payload = serde_json::to_string(result).map_err(ReportError::Serialize)?;
        info!(
            match_id = %result.match_id,
            winner = ?result.winner_id,
            reason = ?result.reason,
            rounds = result.rounds_played,
            result = %payload,
            "Match result"
        );

        let Some(url) = &self.webhook_url else {
            return Ok(());
        };

        let response = self
            .client
            .post(url)
            .header("Content-Type", "application/json")
            .body(payload)
            .send()
            .await
            .map_err(ReportError::Request)?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(ReportError::Api {
                status: status.as_u16(),
                body,
            });
        }

        info!(match_id = %result.match_id, url = %url, "Match result delivered");
        Ok(())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ReportError {
    #[error("Failed to serialize result: {0}")]
    Serialize(serde_json::Error),

    #[error("Webhook request failed: {0}")]
    Request(reqwest::Error),

    #[error("Webhook returned {status}: {body}")]
    Api { status: u16, body: String },
}

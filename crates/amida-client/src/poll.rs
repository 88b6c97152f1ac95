use anyhow::{Context, Result};
use std::time::Duration;
use tracing::debug;

use amida_core::SessionState;

use crate::view::ClientView;

/// Degraded-mode reconciliation for when the push channel is unavailable:
/// periodically fetch the hub's HTTP snapshot and diff it into the same
/// mirror the push path maintains. A policy choice behind the agent's view,
/// not a separate code path.
pub struct StatePoller {
    client: reqwest::Client,
    state_url: String,
    interval: Duration,
}

impl StatePoller {
    pub fn new(base_url: &str, interval: Duration) -> Self {
        Self {
            client: reqwest::Client::new(),
            state_url: format!("{}/state", base_url.trim_end_matches('/')),
            interval,
        }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// One polling round. Returns whether the mirror changed.
    pub async fn poll_once(&self, view: &mut ClientView) -> Result<bool> {
        let snapshot: SessionState = self
            .client
            .get(&self.state_url)
            .send()
            .await
            .context("state poll request failed")?
            .error_for_status()
            .context("state poll returned an error status")?
            .json()
            .await
            .context("state poll returned malformed JSON")?;

        let (rungs, phase) = snapshot.into_parts();
        let changed = view.replace(rungs, phase);
        if changed {
            debug!("poll picked up remote changes");
        }
        Ok(changed)
    }
}

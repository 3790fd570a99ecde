use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;
use tracing::{info, warn};

use crate::action::{config_str, Action, ActionContext, ActionError};

const DEFAULT_MESSAGE: &str = "Rule triggered: {{ rule_name }}";
const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Posts the rendered message to a Slack incoming webhook.
pub struct SlackAction {
    http: reqwest::Client,
}

impl Default for SlackAction {
    fn default() -> Self {
        Self::new()
    }
}

impl SlackAction {
    pub fn new() -> Self {
        Self {
            http: reqwest::Client::new(),
        }
    }
}

#[async_trait]
impl Action for SlackAction {
    fn type_name(&self) -> &str {
        "slack"
    }

    async fn execute(
        &self,
        config: &serde_json::Value,
        ctx: &ActionContext,
    ) -> Result<(), ActionError> {
        let webhook_url = config_str(config, "webhook_url")
            .ok_or_else(|| ActionError::Config("slack action requires webhook_url".into()))?;
        let message = ctx.render(config_str(config, "message").unwrap_or(DEFAULT_MESSAGE));

        let resp = self
            .http
            .post(webhook_url)
            .timeout(REQUEST_TIMEOUT)
            .json(&json!({ "text": message }))
            .send()
            .await?;

        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            warn!(status = %status, body = %body, rule = %ctx.rule_name, "Slack webhook returned non-success");
            return Err(ActionError::Transport(format!(
                "Slack webhook returned {status}"
            )));
        }

        info!(rule = %ctx.rule_name, "Slack notification sent");
        Ok(())
    }
}

use async_trait::async_trait;
use tracing::{debug, error, info, warn};

use crate::action::{config_str, Action, ActionContext, ActionError};

const DEFAULT_MESSAGE: &str = "Rule triggered: {{ rule_name }} for {{ event_type }}";

/// Writes the rendered message to the application log. Handy for trying out rules.
pub struct LogAction;

#[async_trait]
impl Action for LogAction {
    fn type_name(&self) -> &str {
        "log"
    }

    async fn execute(
        &self,
        config: &serde_json::Value,
        ctx: &ActionContext,
    ) -> Result<(), ActionError> {
        let message = ctx.render(config_str(config, "message").unwrap_or(DEFAULT_MESSAGE));
        let level = config_str(config, "level").unwrap_or("info").to_ascii_lowercase();

        match level.as_str() {
            "debug" => debug!(rule = %ctx.rule_name, event_id = %ctx.event_id, "{message}"),
            "info" => info!(rule = %ctx.rule_name, event_id = %ctx.event_id, "{message}"),
            "warn" | "warning" => warn!(rule = %ctx.rule_name, event_id = %ctx.event_id, "{message}"),
            "error" => error!(rule = %ctx.rule_name, event_id = %ctx.event_id, "{message}"),
            other => {
                return Err(ActionError::Config(format!("unknown log level: {other}")));
            }
        }
        Ok(())
    }
}

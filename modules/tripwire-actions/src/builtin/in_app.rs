use async_trait::async_trait;
use chrono::Utc;
use serde_json::json;
use tracing::info;
use uuid::Uuid;

use tripwire_common::Notification;

use crate::action::{config_str, Action, ActionContext, ActionError};

const DEFAULT_TITLE: &str = "Notification: {{ rule_name }}";
const DEFAULT_MESSAGE: &str = "Event triggered: {{ event_type }}";

/// Records an unread notification for the event's tenant.
pub struct InAppAction;

#[async_trait]
impl Action for InAppAction {
    fn type_name(&self) -> &str {
        "in_app"
    }

    async fn execute(
        &self,
        config: &serde_json::Value,
        ctx: &ActionContext,
    ) -> Result<(), ActionError> {
        let tenant_id = ctx.tenant_id.ok_or_else(|| {
            ActionError::Config(format!(
                "in_app action for rule '{}' needs a tenant",
                ctx.rule_name
            ))
        })?;

        let notification = Notification {
            id: Uuid::new_v4(),
            tenant_id,
            rule_id: Some(ctx.rule_id),
            rule_name: ctx.rule_name.clone(),
            event_id: Some(ctx.event_id),
            title: ctx.render(config_str(config, "title").unwrap_or(DEFAULT_TITLE)),
            message: ctx.render(config_str(config, "message").unwrap_or(DEFAULT_MESSAGE)),
            status: "unread".to_string(),
            data: json!({ "event_data": ctx.event_data }),
            created_at: Utc::now(),
        };

        ctx.session.insert_notification(&notification).await?;
        info!(rule = %ctx.rule_name, notification_id = %notification.id, "In-app notification created");
        Ok(())
    }
}

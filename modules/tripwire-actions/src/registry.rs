use std::collections::HashMap;
use std::sync::Arc;

use tracing::info;

use crate::action::{Action, ActionError};
use crate::builtin::{InAppAction, LogAction, SlackAction};

/// Maps `action_config.type` to an `Action`. Built once at startup, then
/// shared read-only behind an `Arc`.
#[derive(Default)]
pub struct ActionRegistry {
    actions: HashMap<String, Arc<dyn Action>>,
}

impl ActionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the built-in `log`, `slack` and `in_app` actions.
    pub fn with_builtin() -> Result<Self, ActionError> {
        Self::from_actions([
            Arc::new(LogAction) as Arc<dyn Action>,
            Arc::new(SlackAction::new()),
            Arc::new(InAppAction),
        ])
    }

    /// Build a registry from `actions`. Two actions sharing a type name is an error.
    pub fn from_actions(
        actions: impl IntoIterator<Item = Arc<dyn Action>>,
    ) -> Result<Self, ActionError> {
        let mut registry = Self::new();
        for action in actions {
            registry.register_arc(action)?;
        }
        Ok(registry)
    }

    pub fn register<A: Action + 'static>(&mut self, action: A) -> Result<(), ActionError> {
        self.register_arc(Arc::new(action))
    }

    pub fn register_arc(&mut self, action: Arc<dyn Action>) -> Result<(), ActionError> {
        let name = action.type_name().to_string();
        if self.actions.contains_key(&name) {
            return Err(ActionError::AlreadyRegistered(name));
        }
        info!(action_type = %name, "Registered action handler");
        self.actions.insert(name, action);
        Ok(())
    }

    pub fn get(&self, type_name: &str) -> Result<Arc<dyn Action>, ActionError> {
        self.actions
            .get(type_name)
            .cloned()
            .ok_or_else(|| ActionError::NotFound(type_name.to_string()))
    }

    /// Registered type names, sorted.
    pub fn types(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.actions.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builtin_actions_are_registered() {
        let registry = ActionRegistry::with_builtin().unwrap();
        assert_eq!(registry.types(), vec!["in_app", "log", "slack"]);
        assert_eq!(registry.get("slack").unwrap().type_name(), "slack");
    }

    #[test]
    fn duplicate_registration_is_rejected() {
        let mut registry = ActionRegistry::with_builtin().unwrap();
        let err = registry.register(LogAction).unwrap_err();
        assert!(matches!(err, ActionError::AlreadyRegistered(name) if name == "log"));
    }

    #[test]
    fn clashing_action_list_fails_to_build() {
        let result = ActionRegistry::from_actions([
            Arc::new(LogAction) as Arc<dyn Action>,
            Arc::new(InAppAction),
            Arc::new(LogAction),
        ]);
        assert!(matches!(result, Err(ActionError::AlreadyRegistered(name)) if name == "log"));
    }

    #[test]
    fn unknown_type_is_not_found() {
        let registry = ActionRegistry::new();
        assert!(matches!(
            registry.get("email"),
            Err(ActionError::NotFound(name)) if name == "email"
        ));
    }
}

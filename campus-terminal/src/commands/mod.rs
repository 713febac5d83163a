//! Command registry
//!
//! Maps every [`CommandName`] to an async handler. The registry is checked at
//! startup so that a recognised command can never go unanswered, and names
//! outside the protocol get an explicit error.

pub mod handlers;

use crate::error::CommandError;
use crate::transport::CommandHandler;
use anyhow::Result;
use async_trait::async_trait;
use campus_protocol::CommandName;
use futures::future::BoxFuture;
use parking_lot::Mutex;
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use tracing::{debug, warn};

pub type Params = Map<String, Value>;

type Handler<C> = Arc<dyn Fn(C, Params) -> BoxFuture<'static, Result<Value>> + Send + Sync>;

pub struct CommandRegistry<C> {
    context: C,
    handlers: HashMap<CommandName, Handler<C>>,
    in_flight: Arc<Mutex<HashMap<CommandName, usize>>>,
}

impl<C: Clone + Send + Sync + 'static> CommandRegistry<C> {
    pub fn new(context: C) -> Self {
        Self {
            context,
            handlers: HashMap::new(),
            in_flight: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn register<F, Fut>(&mut self, name: CommandName, handler: F)
    where
        F: Fn(C, Params) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value>> + Send + 'static,
    {
        self.handlers
            .insert(name, Arc::new(move |ctx, params| Box::pin(handler(ctx, params))));
    }

    /// Every protocol command must have a handler
    pub fn validate(&self) -> Result<(), CommandError> {
        match CommandName::ALL.iter().find(|name| !self.handlers.contains_key(name)) {
            Some(missing) => Err(CommandError::MissingHandler(missing.as_str())),
            None => Ok(()),
        }
    }

    pub async fn execute(&self, command: &str, params: Params) -> Result<Value, CommandError> {
        let name: CommandName = command
            .parse()
            .map_err(|_| CommandError::Unknown(command.to_string()))?;
        let handler = self
            .handlers
            .get(&name)
            .cloned()
            .ok_or(CommandError::MissingHandler(name.as_str()))?;

        let _in_flight = InFlight::enter(&self.in_flight, name);
        handler(self.context.clone(), params)
            .await
            .map_err(|e| CommandError::Failed(format!("{e:#}")))
    }
}

#[async_trait]
impl<C: Clone + Send + Sync + 'static> CommandHandler for CommandRegistry<C> {
    async fn handle(&self, command: &str, params: Params, request_id: Option<String>) -> Result<Value, CommandError> {
        debug!(command, request_id = request_id.as_deref().unwrap_or("-"), "Executing command");
        let result = self.execute(command, params).await;
        if let Err(e) = &result {
            warn!(command, error = %e, "Command failed");
        }
        result
    }
}

/// Tracks commands in progress; a second command with the same name while the
/// first is still running cannot be told apart by name alone.
struct InFlight {
    table: Arc<Mutex<HashMap<CommandName, usize>>>,
    name: CommandName,
}

impl InFlight {
    fn enter(table: &Arc<Mutex<HashMap<CommandName, usize>>>, name: CommandName) -> Self {
        let mut running = table.lock();
        let count = running.entry(name).or_insert(0);
        if *count > 0 {
            warn!(command = name.as_str(), in_flight = *count, "Same command already in flight");
        }
        *count += 1;
        Self {
            table: Arc::clone(table),
            name,
        }
    }
}

impl Drop for InFlight {
    fn drop(&mut self) {
        let mut running = self.table.lock();
        if let Some(count) = running.get_mut(&self.name) {
            *count = count.saturating_sub(1);
            if *count == 0 {
                running.remove(&self.name);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::time::Duration;

    fn full_registry() -> CommandRegistry<u32> {
        let mut registry = CommandRegistry::new(7u32);
        for name in CommandName::ALL {
            registry.register(name, move |ctx, _params| async move { Ok(json!({ "name": name.as_str(), "ctx": ctx })) });
        }
        registry
    }

    #[test]
    fn test_validation_reports_missing_handler() {
        let mut registry = CommandRegistry::new(());
        registry.register(CommandName::Start, |_, _| async { Ok(Value::Null) });
        assert!(matches!(registry.validate(), Err(CommandError::MissingHandler("stop"))));
        assert!(full_registry().validate().is_ok());
    }

    #[tokio::test]
    async fn test_dispatch_alias_and_unknown() {
        let registry = full_registry();
        let result = registry.execute("change_config", Params::new()).await.unwrap();
        assert_eq!(result, json!({ "name": "update_config", "ctx": 7 }));

        let err = registry.handle("launch_rocket", Params::new(), None).await.unwrap_err();
        assert!(matches!(err, CommandError::Unknown(name) if name == "launch_rocket"));
    }

    #[tokio::test]
    async fn test_handler_errors_are_reported() {
        let mut registry = CommandRegistry::new(());
        registry.register(CommandName::SetInterval, |_, _| async { Err(anyhow::anyhow!("interval must be positive")) });
        let err = registry.execute("set_interval", Params::new()).await.unwrap_err();
        assert_eq!(err.to_string(), "interval must be positive");
    }

    #[tokio::test]
    async fn test_same_name_commands_may_overlap() {
        let mut registry = CommandRegistry::new(());
        registry.register(CommandName::GetLogs, |_, _| async {
            tokio::time::sleep(Duration::from_millis(50)).await;
            Ok(Value::Null)
        });
        let registry = Arc::new(registry);
        let (a, b) = tokio::join!(
            registry.execute("get_logs", Params::new()),
            registry.execute("get_logs", Params::new())
        );
        assert!(a.is_ok() && b.is_ok());
        assert!(registry.in_flight.lock().is_empty());
    }
}

//! Command handler registry.
//!
//! A readers–writer map from command type to handler.  Registration happens
//! at startup and is rare; lookups are the dispatch hot path and share the
//! read lock.

use crate::error::DispatchError;
use crate::handler::CommandHandler;
use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};
use tun_protocol::CommandType;

#[derive(Default)]
pub struct CommandRegistry {
    handlers: RwLock<HashMap<CommandType, Arc<dyn CommandHandler>>>,
}

impl CommandRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a handler under its declared command type.
    ///
    /// Tag 0 is reserved and rejected; a second registration for the same
    /// type fails without disturbing the first.
    pub fn register(&self, handler: Arc<dyn CommandHandler>) -> Result<(), DispatchError> {
        let command_type = handler.command_type();
        if command_type == CommandType::Unknown {
            return Err(DispatchError::InvalidCommandType);
        }
        let mut handlers = self
            .handlers
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        if handlers.contains_key(&command_type) {
            return Err(DispatchError::DuplicateHandler(command_type));
        }
        handlers.insert(command_type, handler);
        Ok(())
    }

    /// Removes the handler for `command_type`.  Missing keys report
    /// `HandlerNotRegistered` and leave the registry untouched.
    pub fn unregister(&self, command_type: CommandType) -> Result<(), DispatchError> {
        let mut handlers = self
            .handlers
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        match handlers.remove(&command_type) {
            Some(_) => Ok(()),
            None => Err(DispatchError::HandlerNotRegistered(command_type)),
        }
    }

    pub fn get(&self, command_type: CommandType) -> Option<Arc<dyn CommandHandler>> {
        self.handlers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&command_type)
            .cloned()
    }

    pub fn list(&self) -> Vec<Arc<dyn CommandHandler>> {
        self.handlers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect()
    }

    pub fn count(&self) -> usize {
        self.handlers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::CommandContext;
    use crate::handler::CommandDirection;
    use async_trait::async_trait;
    use tun_protocol::CommandResponse;

    struct NoopHandler {
        command_type: CommandType,
    }

    #[async_trait]
    impl CommandHandler for NoopHandler {
        fn command_type(&self) -> CommandType {
            self.command_type
        }
        fn direction(&self) -> CommandDirection {
            CommandDirection::Duplex
        }
        fn name(&self) -> &str {
            "noop"
        }
        async fn handle(
            &self,
            _ctx: &mut CommandContext,
        ) -> Result<CommandResponse, DispatchError> {
            Ok(CommandResponse::ok(None))
        }
    }

    fn noop(command_type: CommandType) -> Arc<dyn CommandHandler> {
        Arc::new(NoopHandler { command_type })
    }

    #[test]
    fn register_then_get_returns_the_same_handler() {
        let registry = CommandRegistry::new();
        let handler = noop(CommandType::Connect);
        registry.register(Arc::clone(&handler)).unwrap();

        let found = registry.get(CommandType::Connect).unwrap();
        assert!(Arc::ptr_eq(&handler, &found));
        assert_eq!(registry.count(), 1);
    }

    #[test]
    fn duplicate_registration_is_rejected() {
        let registry = CommandRegistry::new();
        registry.register(noop(CommandType::Connect)).unwrap();
        assert!(matches!(
            registry.register(noop(CommandType::Connect)),
            Err(DispatchError::DuplicateHandler(CommandType::Connect))
        ));
        assert_eq!(registry.count(), 1);
    }

    #[test]
    fn reserved_tag_zero_cannot_register() {
        let registry = CommandRegistry::new();
        assert!(matches!(
            registry.register(noop(CommandType::Unknown)),
            Err(DispatchError::InvalidCommandType)
        ));
        assert_eq!(registry.count(), 0);
    }

    #[test]
    fn unregister_then_get_reports_absence() {
        let registry = CommandRegistry::new();
        registry.register(noop(CommandType::Connect)).unwrap();
        registry.unregister(CommandType::Connect).unwrap();
        assert!(registry.get(CommandType::Connect).is_none());
    }

    #[test]
    fn unregister_missing_key_has_no_side_effects() {
        let registry = CommandRegistry::new();
        registry.register(noop(CommandType::Connect)).unwrap();

        assert!(matches!(
            registry.unregister(CommandType::DnsResolve),
            Err(DispatchError::HandlerNotRegistered(CommandType::DnsResolve))
        ));
        assert_eq!(registry.count(), 1);
        assert!(registry.get(CommandType::Connect).is_some());
    }

    #[test]
    fn list_returns_every_registered_handler() {
        let registry = CommandRegistry::new();
        registry.register(noop(CommandType::Connect)).unwrap();
        registry.register(noop(CommandType::DnsResolve)).unwrap();
        assert_eq!(registry.list().len(), 2);
    }
}

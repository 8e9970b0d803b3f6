// src/runtime/registry.rs
//! Handler factories by type

use crate::runtime::handler::HandlerFactory;
use crate::runtime::types::HandlerType;
use crate::utils::errors::{EngineError, Result};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::debug;

#[derive(Default, Clone)]
pub struct HandlerRegistry {
    factories: BTreeMap<HandlerType, Arc<dyn HandlerFactory>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the factory for `handler_type`, replacing any previous one
    pub fn register(
        &mut self,
        handler_type: HandlerType,
        factory: impl HandlerFactory + 'static,
    ) -> &mut Self {
        debug!("Registering handler factory for {}", handler_type);
        self.factories.insert(handler_type, Arc::new(factory));
        self
    }

    pub fn factory_for(&self, handler_type: HandlerType) -> Result<Arc<dyn HandlerFactory>> {
        self.factories
            .get(&handler_type)
            .cloned()
            .ok_or(EngineError::UnknownHandler(handler_type))
    }

    pub fn is_registered(&self, handler_type: HandlerType) -> bool {
        self.factories.contains_key(&handler_type)
    }

    pub fn registered_types(&self) -> Vec<HandlerType> {
        self.factories.keys().copied().collect()
    }
}

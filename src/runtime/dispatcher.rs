// src/runtime/dispatcher.rs
//! Entry point for callers: route a query to a pooled handler instance
//!
//! Failing to obtain an instance (no factory, invalid config, creation
//! failure) is returned as an error. Once an instance exists, every
//! execution failure is reported inside the [`ExecutionResult`].

use crate::runtime::agent_pool::AgentPool;
use crate::runtime::agent_runtime::AgentRuntime;
use crate::runtime::registry::HandlerRegistry;
use crate::runtime::types::{ExecutionContext, ExecutionResult, HandlerConfig};
use crate::utils::errors::Result;
use futures::stream::BoxStream;
use std::sync::Arc;
use tracing::{debug, instrument};

pub struct Dispatcher {
    registry: Arc<HandlerRegistry>,
    pool: Arc<AgentPool>,
}

impl Dispatcher {
    pub fn new(registry: Arc<HandlerRegistry>, pool: Arc<AgentPool>) -> Self {
        Self { registry, pool }
    }

    pub fn pool(&self) -> &Arc<AgentPool> {
        &self.pool
    }

    pub fn registry(&self) -> &Arc<HandlerRegistry> {
        &self.registry
    }

    async fn acquire(&self, config: HandlerConfig) -> Result<Arc<AgentRuntime>> {
        let factory = self.registry.factory_for(config.handler_type)?;
        let instance = self.pool.get_or_create(config, factory.as_ref()).await?;
        debug!("Dispatching to instance {}", instance.instance_id());
        Ok(instance)
    }

    /// Execute `ctx` on the pooled instance for `config`
    #[instrument(skip_all, fields(handler = %config.handler_type, model = %config.model_id))]
    pub async fn dispatch(
        &self,
        config: HandlerConfig,
        ctx: ExecutionContext,
    ) -> Result<ExecutionResult> {
        let instance = self.acquire(config).await?;
        Ok(instance.execute(ctx).await)
    }

    /// Stream the answer to `ctx` from the pooled instance for `config`
    #[instrument(skip_all, fields(handler = %config.handler_type, model = %config.model_id))]
    pub async fn dispatch_streaming(
        &self,
        config: HandlerConfig,
        ctx: ExecutionContext,
    ) -> Result<BoxStream<'static, String>> {
        let instance = self.acquire(config).await?;
        Ok(instance.execute_streaming(ctx))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::agent_pool::AgentPoolConfig;
    use crate::runtime::test_support::{
        mock_factory, test_config, test_context, Behavior, Counters,
    };
    use crate::runtime::types::{ErrorCode, HandlerType};
    use crate::utils::errors::EngineError;
    use futures::StreamExt;

    fn dispatcher(behavior: Behavior, counters: &Counters) -> Dispatcher {
        let mut registry = HandlerRegistry::new();
        registry.register(HandlerType::Completion, mock_factory(behavior, counters.clone()));
        Dispatcher::new(
            Arc::new(registry),
            Arc::new(AgentPool::new(AgentPoolConfig::default())),
        )
    }

    #[tokio::test]
    async fn test_dispatch_reuses_instances() {
        let counters = Counters::default();
        let dispatcher = dispatcher(Behavior::Respond("answer".into()), &counters);

        for _ in 0..3 {
            let result = dispatcher
                .dispatch(test_config(HandlerType::Completion, "m1"), test_context("q"))
                .await
                .unwrap();
            assert!(result.success);
            assert_eq!(result.content, "answer");
        }

        assert_eq!(counters.created(), 1);
        assert_eq!(counters.calls(), 3);
    }

    #[tokio::test]
    async fn test_execution_failure_is_data() {
        let counters = Counters::default();
        let dispatcher = dispatcher(Behavior::Fail("backend down".into()), &counters);

        let result = dispatcher
            .dispatch(test_config(HandlerType::Completion, "m1"), test_context("q"))
            .await
            .unwrap();

        assert!(!result.success);
        assert_eq!(result.error_code(), Some(ErrorCode::ExecutionError));
    }

    #[tokio::test]
    async fn test_unregistered_type_is_error() {
        let counters = Counters::default();
        let dispatcher = dispatcher(Behavior::Respond("x".into()), &counters);

        let result = dispatcher
            .dispatch(test_config(HandlerType::WebSearch, "m1"), test_context("q"))
            .await;

        match result {
            Err(e) => {
                assert!(matches!(e, EngineError::UnknownHandler(HandlerType::WebSearch)));
                assert_eq!(e.code(), ErrorCode::CreationError);
            }
            Ok(_) => panic!("expected an error"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_dispatch_streaming() {
        let counters = Counters::default();
        let dispatcher = dispatcher(Behavior::Respond("streamed".into()), &counters);

        let chunks: Vec<String> = dispatcher
            .dispatch_streaming(test_config(HandlerType::Completion, "m1"), test_context("q"))
            .await
            .unwrap()
            .collect()
            .await;

        assert_eq!(chunks.concat(), "streamed");
    }
}

//! Pipeline collaborators
//!
//! Hooks through which a participant hands assigned resources to the local
//! replication pipeline, and through which it gives resources back.

use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::Arc;

use crate::coordinator::registry::{Resource, ResourceRegistry};
use crate::error::Result;

/// Consumes the resources of one input plugin
#[async_trait]
pub trait ResourceConsumer: Send + Sync {
    /// Replace the consumer's working set with `resources`
    async fn feed_resources(&self, resources: Vec<Resource>) -> Result<()>;
}

/// Optional capability: the consumer can be paused around a feed
#[async_trait]
pub trait Pausable: Send + Sync {
    async fn pause(&self) -> Result<()>;
    async fn resume(&self) -> Result<()>;
}

/// Gives resources back to the leader
#[async_trait]
pub trait Renouncer: Send + Sync {
    async fn renounce_resources(&self, resources: &[Resource]) -> Result<()>;
}

/// A registered consumer with its optional pause capability
#[derive(Clone)]
pub struct ConsumerHandle {
    pub consumer: Arc<dyn ResourceConsumer>,
    pub pausable: Option<Arc<dyn Pausable>>,
}

/// Consumers keyed by input plugin name
#[derive(Clone, Default)]
pub struct ConsumerRegistry {
    consumers: BTreeMap<String, ConsumerHandle>,
}

impl ConsumerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a consumer without pause support
    pub fn register(&mut self, input_plugin: impl Into<String>, consumer: Arc<dyn ResourceConsumer>) {
        self.consumers.insert(
            input_plugin.into(),
            ConsumerHandle {
                consumer,
                pausable: None,
            },
        );
    }

    /// Register a consumer that is paused while its working set changes
    pub fn register_pausable<C>(&mut self, input_plugin: impl Into<String>, consumer: Arc<C>)
    where
        C: ResourceConsumer + Pausable + 'static,
    {
        self.consumers.insert(
            input_plugin.into(),
            ConsumerHandle {
                consumer: consumer.clone(),
                pausable: Some(consumer),
            },
        );
    }

    pub fn get(&self, input_plugin: &str) -> Option<&ConsumerHandle> {
        self.consumers.get(input_plugin)
    }

    pub fn contains(&self, input_plugin: &str) -> bool {
        self.consumers.contains_key(input_plugin)
    }

    /// `(input plugin, handle)` pairs in name order
    pub fn iter(&self) -> impl Iterator<Item = (&String, &ConsumerHandle)> {
        self.consumers.iter()
    }

    pub fn is_empty(&self) -> bool {
        self.consumers.is_empty()
    }
}

/// [`Renouncer`] that writes renunciations to the resource registry on behalf
/// of one participant
pub struct RegistryRenouncer {
    registry: Arc<ResourceRegistry>,
    endpoint: String,
}

impl RegistryRenouncer {
    pub fn new(registry: Arc<ResourceRegistry>, endpoint: impl Into<String>) -> Self {
        Self {
            registry,
            endpoint: endpoint.into(),
        }
    }
}

#[async_trait]
impl Renouncer for RegistryRenouncer {
    async fn renounce_resources(&self, resources: &[Resource]) -> Result<()> {
        self.registry
            .renounce_resources(&self.endpoint, resources)
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    #[derive(Default)]
    struct Sink {
        fed: Mutex<Vec<Vec<Resource>>>,
        paused: Mutex<u32>,
    }

    #[async_trait]
    impl ResourceConsumer for Sink {
        async fn feed_resources(&self, resources: Vec<Resource>) -> Result<()> {
            self.fed.lock().push(resources);
            Ok(())
        }
    }

    #[async_trait]
    impl Pausable for Sink {
        async fn pause(&self) -> Result<()> {
            *self.paused.lock() += 1;
            Ok(())
        }

        async fn resume(&self) -> Result<()> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_capability_is_fixed_at_registration() {
        let sink = Arc::new(Sink::default());
        let mut consumers = ConsumerRegistry::new();
        consumers.register("plain", sink.clone());
        consumers.register_pausable("pausable", sink.clone());

        assert!(consumers.get("plain").unwrap().pausable.is_none());
        let handle = consumers.get("pausable").unwrap();
        handle.pausable.as_ref().unwrap().pause().await.unwrap();
        handle.consumer.feed_resources(vec![]).await.unwrap();

        assert_eq!(*sink.paused.lock(), 1);
        assert_eq!(sink.fed.lock().len(), 1);
        assert!(!consumers.contains("pg"));
    }
}

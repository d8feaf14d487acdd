//! Composition root wiring the four cores together (spec.md §1, §9).
//!
//! Grounded on the teacher's `di::Container` composition pattern: one
//! struct owns every long-lived core plus the shared [`EventBus`], builds
//! them in dependency order, and exposes a single `shutdown()` that drains
//! every core's background tasks.

use std::sync::Arc;

use crate::broker::Broker;
use crate::events::EventBus;
use crate::keyring::{KeyRing, KeyRingConfig};
use crate::mesh::{Invoker, MeshController};
use crate::registry::{Registry, RegistryConfig};
use crate::streaming::StreamingEngine;

/// Construction options for [`ServiceFabric`].
#[derive(Default)]
pub struct ServiceFabricConfig {
    pub registry: RegistryConfig,
    /// When set, the broker seals payloads for queues configured with
    /// `encryption = true` (spec.md §4.3.4).
    pub keyring: Option<KeyRingConfig>,
}

/// Owns every subsystem core and the event bus they publish to.
///
/// `mesh` is `None` until an [`Invoker`] is supplied, since the mesh
/// control plane has no transport of its own (spec.md §1: transport is a
/// host concern).
pub struct ServiceFabric {
    pub bus: Arc<EventBus>,
    pub registry: Arc<Registry>,
    pub mesh: Option<MeshController>,
    pub broker: Arc<Broker>,
    pub streaming: Arc<StreamingEngine>,
    pub keyring: Option<Arc<KeyRing>>,
}

impl ServiceFabric {
    /// Build every core without a mesh transport. Call
    /// [`ServiceFabric::with_invoker`] afterward to add mesh dispatch.
    pub fn new(config: ServiceFabricConfig) -> Self {
        let bus = Arc::new(EventBus::new());
        let registry = Registry::new(config.registry, bus.clone());
        let keyring = config.keyring.map(|kr| Arc::new(KeyRing::new(kr)));
        let broker = Broker::new(bus.clone(), keyring.clone());
        let streaming = StreamingEngine::new(bus.clone());

        Self {
            bus,
            registry,
            mesh: None,
            broker,
            streaming,
            keyring,
        }
    }

    /// Attach a mesh control plane using `invoker` as the transport.
    pub fn with_invoker(mut self, invoker: Arc<dyn Invoker>) -> Self {
        self.mesh = Some(MeshController::new(self.registry.clone(), self.bus.clone(), invoker));
        self
    }

    /// Drain every core's background tasks. Idempotent per-core but not
    /// safe to call concurrently with itself.
    pub async fn shutdown(&self) {
        self.registry.shutdown().await;
        self.broker.shutdown().await;
        self.streaming.shutdown().await;
        if let Some(keyring) = &self.keyring {
            keyring.shutdown();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mesh::{CallRequest, CallResponse};
    use crate::registry::ServiceInstance;
    use crate::error::FabricResult;

    struct Noop;

    #[async_trait::async_trait]
    impl Invoker for Noop {
        async fn invoke(&self, _instance: &ServiceInstance, _request: &CallRequest) -> FabricResult<CallResponse> {
            Ok(CallResponse {
                status: 200,
                headers: Default::default(),
                body: Vec::new(),
            })
        }
    }

    #[tokio::test]
    async fn fabric_builds_every_core_and_shuts_down_cleanly() {
        let fabric = ServiceFabric::new(ServiceFabricConfig::default()).with_invoker(Arc::new(Noop));
        assert!(fabric.mesh.is_some());
        fabric.broker.create_queue("orders", crate::broker::QueueConfig::new(crate::broker::QueueKind::Fifo));
        fabric.streaming.create_stream("orders-events", crate::streaming::StreamConfig::default());
        fabric.shutdown().await;
    }

    #[tokio::test]
    async fn keyring_is_wired_through_to_broker_when_configured() {
        let fabric = ServiceFabric::new(ServiceFabricConfig {
            keyring: Some(KeyRingConfig::default()),
            ..Default::default()
        });
        assert!(fabric.keyring.is_some());

        let mut queue_config = crate::broker::QueueConfig::new(crate::broker::QueueKind::Fifo);
        queue_config.encryption = true;
        fabric.broker.create_queue("secure", queue_config);

        let id = fabric
            .broker
            .publish("secure", crate::broker::PublishRequest {
                topic: "secure".into(),
                payload: b"classified".to_vec(),
                ..Default::default()
            })
            .unwrap();
        assert!(!id.is_empty());
        fabric.shutdown().await;
    }
}

//! Shared handles passed to every coordinator component

use crate::adapter::AdapterRegistry;
use crate::config::Settings;
use crate::graph::GraphService;
use crate::store::Store;
use crate::transport::{QueueOptions, Transport, TransportResult};
use std::sync::Arc;

/// Connections to the store, graph and transport, built once at startup.
#[derive(Clone)]
pub struct CoordinatorContext {
    pub settings: Arc<Settings>,
    pub store: Arc<dyn Store>,
    pub graph: Arc<dyn GraphService>,
    pub transport: Arc<dyn Transport>,
    pub registry: AdapterRegistry,
}

impl CoordinatorContext {
    pub fn new<S>(
        settings: Settings,
        store: Arc<S>,
        graph: Arc<dyn GraphService>,
        transport: Arc<dyn Transport>,
    ) -> Self
    where
        S: Store + 'static,
    {
        let registry = AdapterRegistry::new(store.clone());
        Self {
            settings: Arc::new(settings),
            store,
            graph,
            transport,
            registry,
        }
    }

    /// Declare the command and engine queues. Neither is dead-lettered.
    pub async fn declare_queues(&self) -> TransportResult<()> {
        self.transport
            .declare(&self.settings.command_queue, QueueOptions::durable())
            .await?;
        self.transport
            .declare(&self.settings.engine_queue, QueueOptions::durable())
            .await
    }
}

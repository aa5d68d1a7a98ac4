//! Backend clients and their per-endpoint lifecycle
//!
//! A [`ClientFactory`] builds at most one client per endpoint id and pairs it
//! with a typed [`Cache`]. Construction is serialized per key; lookups of an
//! already-built client never take a lock.

mod http;

pub use http::{FetchOutcome, HttpClient};

use crate::cache::Cache;
use crate::connector::{Connector, ConnectorRegistry};
use crate::error::{BootstrapError, ClientError};
use crate::models::Cacheable;
use crate::observability::EtlMetrics;
use async_trait::async_trait;
use dashmap::DashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tracing::info;

/// Contract every backend client satisfies
#[async_trait]
pub trait BackendClient: Cacheable + Send + Sync {
    /// Verify credentials against the backend
    async fn authenticate(&self) -> Result<(), ClientError>;
}

/// Builds a client from its connector
pub type ClientConstructor<C> = Arc<dyn Fn(&Connector) -> anyhow::Result<C> + Send + Sync>;

/// A constructed client and the cache scoped to its data type
pub struct ClientAndCache<C, T> {
    pub client: Arc<C>,
    pub cache: Cache<T>,
}

/// Lazily constructs and memoizes one client per endpoint id
pub struct ClientFactory<C, T> {
    registry: Arc<ConnectorRegistry>,
    constructor: ClientConstructor<C>,
    clients: DashMap<String, Arc<ClientAndCache<C, T>>>,
    locks: DashMap<String, Arc<Mutex<()>>>,
    constructions: AtomicUsize,
}

impl<C, T> ClientFactory<C, T>
where
    C: Send + Sync,
    T: Cacheable,
{
    pub fn new(registry: Arc<ConnectorRegistry>, constructor: ClientConstructor<C>) -> Self {
        Self {
            registry,
            constructor,
            clients: DashMap::new(),
            locks: DashMap::new(),
            constructions: AtomicUsize::new(0),
        }
    }

    /// Return the client for `endpoint_id`, building it on first use
    pub fn get_client(&self, endpoint_id: &str) -> Result<Arc<ClientAndCache<C, T>>, BootstrapError> {
        if let Some(existing) = self.clients.get(endpoint_id) {
            return Ok(Arc::clone(existing.value()));
        }

        let lock = self
            .locks
            .entry(endpoint_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        let _guard = lock.lock().unwrap_or_else(|e| e.into_inner());

        // Another caller may have finished construction while we waited
        if let Some(existing) = self.clients.get(endpoint_id) {
            return Ok(Arc::clone(existing.value()));
        }

        let connector = self
            .registry
            .find_connector(endpoint_id)
            .ok_or_else(|| BootstrapError::UnknownEndpoint(endpoint_id.to_string()))?;

        let client = (self.constructor)(connector).map_err(|e| BootstrapError::ClientConstruction {
            endpoint: endpoint_id.to_string(),
            reason: format!("{e:#}"),
        })?;
        self.constructions.fetch_add(1, Ordering::SeqCst);
        EtlMetrics::new().inc_clients_constructed();

        let pair = Arc::new(ClientAndCache {
            client: Arc::new(client),
            cache: Cache::new(),
        });
        self.clients.insert(endpoint_id.to_string(), Arc::clone(&pair));
        info!(endpoint = %endpoint_id, "Constructed backend client");

        Ok(pair)
    }

    /// Number of clients constructed so far
    pub fn constructed(&self) -> usize {
        self.constructions.load(Ordering::SeqCst)
    }

    pub fn registry(&self) -> &ConnectorRegistry {
        &self.registry
    }
}

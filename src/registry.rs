//! Backend registry
//!
//! Resolves which policy backend and helper transport are in use. The
//! backend is shared by the whole process; transports belong to an
//! execution context so that independent workers never share a connection
//! table unless they ask for the same context.

use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::{Arc, OnceLock};

use crate::backend::{FakeBackend, PolicyBackend, StaticBackend};
use crate::broker::Broker;
use crate::config::BrokerConfig;
use crate::transport::{FakeHelperTransport, HelperTransport, SocketHelperTransport};

/// Builds a backend from configuration, `None` if it cannot be used here
pub type BackendFactory = fn(&BrokerConfig) -> Option<Arc<dyn PolicyBackend>>;

pub type TransportFactory =
    fn(&BrokerConfig, Arc<dyn PolicyBackend>) -> Option<Arc<dyn HelperTransport>>;

/// Context used by [`BackendRegistry::broker`]
pub const DEFAULT_CONTEXT: &str = "main";

static GLOBAL: OnceLock<BackendRegistry> = OnceLock::new();

pub struct BackendRegistry {
    config: BrokerConfig,
    backend_factories: RwLock<Vec<(String, BackendFactory)>>,
    transport_factories: RwLock<Vec<(String, TransportFactory)>>,
    backend: OnceLock<Arc<dyn PolicyBackend>>,
    transports: RwLock<HashMap<String, Arc<dyn HelperTransport>>>,
}

impl BackendRegistry {
    pub fn new(config: BrokerConfig) -> Self {
        let registry = Self {
            config,
            backend_factories: RwLock::new(Vec::new()),
            transport_factories: RwLock::new(Vec::new()),
            backend: OnceLock::new(),
            transports: RwLock::new(HashMap::new()),
        };
        registry.register_backend_factory("static", static_backend);
        registry.register_transport_factory("socket", socket_transport);
        registry
    }

    /// The process-wide registry, configured from the environment
    pub fn global() -> &'static BackendRegistry {
        GLOBAL.get_or_init(|| {
            let config = BrokerConfig::from_env().unwrap_or_else(|e| {
                tracing::warn!("Ignoring invalid broker configuration: {}", e);
                BrokerConfig::default()
            });
            Self::new(config)
        })
    }

    pub fn config(&self) -> &BrokerConfig {
        &self.config
    }

    /// Only effective before the backend is first used
    pub fn register_backend_factory(&self, name: impl Into<String>, factory: BackendFactory) {
        self.backend_factories.write().push((name.into(), factory));
    }

    pub fn register_transport_factory(&self, name: impl Into<String>, factory: TransportFactory) {
        self.transport_factories.write().push((name.into(), factory));
    }

    pub fn policy_backend(&self) -> Arc<dyn PolicyBackend> {
        self.backend.get_or_init(|| self.load_backend()).clone()
    }

    pub fn helper_transport(&self) -> Arc<dyn HelperTransport> {
        self.helper_transport_for(DEFAULT_CONTEXT)
    }

    pub fn helper_transport_for(&self, context: &str) -> Arc<dyn HelperTransport> {
        if let Some(transport) = self.transports.read().get(context) {
            return transport.clone();
        }
        let backend = self.policy_backend();
        self.transports
            .write()
            .entry(context.to_string())
            .or_insert_with(|| self.load_transport(backend))
            .clone()
    }

    /// Replace the transport of one context, leaving the others alone
    pub fn set_transport_for(&self, context: &str, transport: Arc<dyn HelperTransport>) {
        self.transports
            .write()
            .insert(context.to_string(), transport);
    }

    pub fn broker(&self) -> Broker {
        self.broker_for(DEFAULT_CONTEXT)
    }

    pub fn broker_for(&self, context: &str) -> Broker {
        Broker::new(self.policy_backend(), self.helper_transport_for(context))
    }

    fn load_backend(&self) -> Arc<dyn PolicyBackend> {
        let factories = self.backend_factories.read();
        for name in &self.config.backend_search_path {
            let Some((_, factory)) = factories.iter().find(|(n, _)| n == name) else {
                tracing::debug!("No policy backend named {}", name);
                continue;
            };
            if let Some(backend) = factory(&self.config) {
                tracing::info!("Using policy backend {}", backend.name());
                return backend;
            }
            tracing::debug!("Policy backend {} is not usable", name);
        }

        tracing::warn!(
            "No policy backend could be loaded (searched {:?}). Using the fake backend: \
             every authorization will be denied.",
            self.config.backend_search_path
        );
        Arc::new(FakeBackend::new())
    }

    fn load_transport(&self, backend: Arc<dyn PolicyBackend>) -> Arc<dyn HelperTransport> {
        let factories = self.transport_factories.read();
        for name in &self.config.transport_search_path {
            let Some((_, factory)) = factories.iter().find(|(n, _)| n == name) else {
                tracing::debug!("No helper transport named {}", name);
                continue;
            };
            if let Some(transport) = factory(&self.config, backend.clone()) {
                tracing::debug!("Using helper transport {}", name);
                return transport;
            }
        }

        tracing::warn!(
            "No helper transport could be loaded (searched {:?}). Using the fake transport: \
             no helper will ever be reached.",
            self.config.transport_search_path
        );
        Arc::new(FakeHelperTransport::new())
    }
}

fn static_backend(config: &BrokerConfig) -> Option<Arc<dyn PolicyBackend>> {
    let policy = config.static_policy.as_deref()?;
    match StaticBackend::from_policy(policy) {
        Ok(backend) => Some(Arc::new(backend)),
        Err(e) => {
            tracing::warn!("Static policy rejected: {}", e);
            None
        }
    }
}

fn socket_transport(
    config: &BrokerConfig,
    backend: Arc<dyn PolicyBackend>,
) -> Option<Arc<dyn HelperTransport>> {
    Some(Arc::new(SocketHelperTransport::new(config.clone(), backend)))
}

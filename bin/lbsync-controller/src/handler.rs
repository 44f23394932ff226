//! Service events applied to the projector and the reconcile pass
//!
//! Keeps the last seen snapshot of every Service so that modifications can
//! be projected as updates and relists can be diffed.

use lbsync_api::{Service, ServiceKey};
use lbsync_core::{EndpointSource, EndpointSync, Reconciler, ServiceProjector};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

pub struct ServiceHandler {
    projector: ServiceProjector,
    reconciler: Reconciler,
    source: Arc<dyn EndpointSource>,
    endpoint_sync: Arc<dyn EndpointSync>,
    services: HashMap<ServiceKey, Service>,
}

impl ServiceHandler {
    pub fn new(
        projector: ServiceProjector,
        reconciler: Reconciler,
        source: Arc<dyn EndpointSource>,
        endpoint_sync: Arc<dyn EndpointSync>,
    ) -> Self {
        Self {
            projector,
            reconciler,
            source,
            endpoint_sync,
            services: HashMap::new(),
        }
    }

    pub fn service_count(&self) -> usize {
        self.services.len()
    }

    /// Service added or modified
    pub async fn apply(&mut self, service: Service) {
        let key = service.key();
        let readiness = self.source.readiness(&key).await;
        let result = match self.services.get(&key) {
            Some(old) => self.projector.update(old, &service, readiness).await,
            None => self.projector.create(&service, readiness).await,
        };
        if let Err(e) = result {
            warn!("Failed to project service {}: {}", key, e);
        }
        self.services.insert(key, service);
    }

    pub async fn delete(&mut self, service: &Service) {
        let key = service.key();
        // the cached snapshot holds what was actually projected
        let known = self.services.remove(&key);
        if let Err(e) = self.projector.delete(known.as_ref().unwrap_or(service)).await {
            warn!("Failed to delete service {}: {}", key, e);
        }
    }

    /// Full list from a (re)started watch: reconcile, then project the diff
    pub async fn relist(&mut self, services: Vec<Service>) {
        info!("Service list received with {} services", services.len());
        match self.reconciler.sync_services(&services).await {
            Ok(report) => debug!(?report, "Initial sync finished"),
            Err(e) => warn!("Service sync finished with errors: {}", e),
        }

        let current: HashMap<ServiceKey, Service> =
            services.into_iter().map(|s| (s.key(), s)).collect();

        let gone: Vec<Service> = self
            .services
            .iter()
            .filter(|(key, _)| !current.contains_key(*key))
            .map(|(_, service)| service.clone())
            .collect();
        for service in &gone {
            if let Err(e) = self.projector.delete(service).await {
                warn!("Failed to delete vanished service {}: {}", service.key(), e);
            }
        }

        for (key, service) in &current {
            let readiness = self.source.readiness(key).await;
            let result = match self.services.get(key) {
                Some(old) => self.projector.update(old, service, readiness).await,
                None => self.projector.create(service, readiness).await,
            };
            if let Err(e) = result {
                warn!("Failed to project service {}: {}", key, e);
            }
        }

        self.services = current;
    }

    /// Endpoints of `key` changed; re-drive the endpoints path when they are ready
    pub async fn endpoints_changed(&self, key: &ServiceKey) {
        let Some(service) = self.services.get(key) else {
            return;
        };
        if !self.source.readiness(key).await.is_ready() {
            debug!("Endpoints of {} are not ready", key);
            return;
        }
        if let Err(e) = self.endpoint_sync.add_endpoints(service).await {
            warn!("Failed to write endpoints of {}: {}", key, e);
        }
    }

    /// Periodic reconcile over the cached Services
    pub async fn resync(&self) {
        let services: Vec<Service> = self.services.values().cloned().collect();
        if let Err(e) = self.reconciler.sync_services(&services).await {
            warn!("Periodic service sync finished with errors: {}", e);
        }
    }
}

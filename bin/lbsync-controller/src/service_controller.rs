//! Watch loop feeding Service and Endpoints events into the handler

use crate::handler::ServiceHandler;
use futures::StreamExt;
use k8s_openapi::api::core::v1::{Endpoints as KubeEndpoints, Service as KubeService};
use kube::{Api, Client};
use kube_runtime::watcher::{self, Event};
use kube_runtime::WatchStreamExt;
use lbsync_api::{Service, ServiceEndpoints, ServiceKey};
use lbsync_core::memory::MemoryEndpoints;
use std::collections::HashMap;
use std::pin::pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{interval_at, Instant, Interval, MissedTickBehavior};
use tracing::{debug, info, warn};

pub struct ServiceController {
    client: Client,
    handler: ServiceHandler,
    endpoints: MemoryEndpoints,
    resync_interval: Option<Duration>,
    synced: Arc<AtomicBool>,
}

/// Bookkeeping until both initial lists have arrived
#[derive(Default)]
struct SyncState {
    service_buffer: Vec<Service>,
    endpoints_buffer: Vec<ServiceEndpoints>,
    /// Service list waiting for the endpoints cache
    listed: Option<HashMap<ServiceKey, Service>>,
    endpoints_synced: bool,
    initial_done: bool,
}

impl ServiceController {
    pub fn new(
        client: Client,
        handler: ServiceHandler,
        endpoints: MemoryEndpoints,
        resync_interval: Option<Duration>,
        synced: Arc<AtomicBool>,
    ) -> Self {
        Self {
            client,
            handler,
            endpoints,
            resync_interval,
            synced,
        }
    }

    pub async fn run(mut self) -> anyhow::Result<()> {
        info!("Starting service controller");

        let services: Api<KubeService> = Api::all(self.client.clone());
        let endpoints: Api<KubeEndpoints> = Api::all(self.client.clone());

        let mut service_events =
            pin!(watcher::watcher(services, watcher::Config::default()).default_backoff());
        let mut endpoint_events =
            pin!(watcher::watcher(endpoints, watcher::Config::default()).default_backoff());

        let mut resync = self.resync_interval.map(|period| {
            let mut interval = interval_at(Instant::now() + period, period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            interval
        });

        let mut state = SyncState::default();

        loop {
            tokio::select! {
                event = service_events.next() => match event {
                    Some(Ok(event)) => self.on_service_event(&mut state, event).await,
                    Some(Err(e)) => warn!("Service watch error: {}", e),
                    None => anyhow::bail!("Service watch stream ended"),
                },
                event = endpoint_events.next() => match event {
                    Some(Ok(event)) => self.on_endpoints_event(&mut state, event).await,
                    Some(Err(e)) => warn!("Endpoints watch error: {}", e),
                    None => anyhow::bail!("Endpoints watch stream ended"),
                },
                _ = tick(&mut resync), if state.initial_done => {
                    debug!("Periodic resync of {} services", self.handler.service_count());
                    self.handler.resync().await;
                }
            }
        }
    }

    async fn on_service_event(&mut self, state: &mut SyncState, event: Event<KubeService>) {
        match event {
            Event::Init => state.service_buffer.clear(),
            Event::InitApply(obj) => state.service_buffer.push(Service::from(&obj)),
            Event::InitDone => {
                let services = std::mem::take(&mut state.service_buffer);
                if state.initial_done {
                    self.handler.relist(services).await;
                } else {
                    state.listed = Some(services.into_iter().map(|s| (s.key(), s)).collect());
                    self.try_initial_sync(state).await;
                }
            }
            Event::Apply(obj) => {
                let service = Service::from(&obj);
                match state.listed.as_mut() {
                    Some(listed) => {
                        listed.insert(service.key(), service);
                    }
                    None => self.handler.apply(service).await,
                }
            }
            Event::Delete(obj) => {
                let service = Service::from(&obj);
                match state.listed.as_mut() {
                    Some(listed) => {
                        listed.remove(&service.key());
                    }
                    None => self.handler.delete(&service).await,
                }
            }
        }
    }

    async fn on_endpoints_event(&mut self, state: &mut SyncState, event: Event<KubeEndpoints>) {
        match event {
            Event::Init => state.endpoints_buffer.clear(),
            Event::InitApply(obj) => state.endpoints_buffer.push(ServiceEndpoints::from(&obj)),
            Event::InitDone => {
                let all = std::mem::take(&mut state.endpoints_buffer);
                let changed = self.endpoints.replace_all(all).await;
                if state.endpoints_synced {
                    for key in &changed {
                        self.handler.endpoints_changed(key).await;
                    }
                } else {
                    state.endpoints_synced = true;
                    self.try_initial_sync(state).await;
                }
            }
            Event::Apply(obj) => {
                let endpoints = ServiceEndpoints::from(&obj);
                let key = endpoints.key();
                self.endpoints.set(endpoints).await;
                if state.endpoints_synced && state.initial_done {
                    self.handler.endpoints_changed(&key).await;
                }
            }
            Event::Delete(obj) => {
                let key = ServiceEndpoints::from(&obj).key();
                self.endpoints.remove(&key).await;
            }
        }
    }

    /// Run the first reconcile once Services are listed and endpoints are cached
    async fn try_initial_sync(&mut self, state: &mut SyncState) {
        if state.initial_done || !state.endpoints_synced {
            return;
        }
        let Some(listed) = state.listed.take() else {
            return;
        };

        self.handler.relist(listed.into_values().collect()).await;
        state.initial_done = true;
        self.synced.store(true, Ordering::Relaxed);
        info!("Initial sync complete");
    }
}

async fn tick(interval: &mut Option<Interval>) {
    match interval {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending().await,
    }
}

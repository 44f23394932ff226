//! Projection of Kubernetes Services onto load-balancer VIPs and reject rules
//!
//! This library provides:
//! - Deterministic VIP keys and reject-rule names
//! - The backend store and gateway set contracts the core drives
//! - The per-Service projector (create, update, delete)
//! - The full-cluster reconcile pass that deletes stale backend state

pub mod addressing;
pub mod endpoints;
pub mod error;
pub mod events;
pub mod memory;
pub mod metrics;
pub mod projector;
pub mod reconcile;
mod rules;
pub mod store;
pub mod validation;

pub use endpoints::{EndpointSource, EndpointSync, EndpointVipWriter, Readiness};
pub use error::{CoreError, Result};
pub use events::{EventRecorder, LogRecorder};
pub use metrics::SyncMetrics;
pub use projector::{ProjectorConfig, ServiceProjector};
pub use reconcile::{DesiredState, Reconciler, SyncReport};
pub use store::{
    BackendStore, GatewaySet, LbRole, LoadBalancerRef, RejectRuleQuery, RejectRuleRecord,
    RejectRuleSpec, VipMap,
};

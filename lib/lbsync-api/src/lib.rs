//! Service snapshot types consumed by the load-balancer sync layer
//!
//! This library defines the read-only views the sync core works from:
//! - Service: the fields of a Kubernetes Service that decide VIP and reject-rule placement
//! - ServiceEndpoints: the ready addresses and ports backing a Service
//! - Protocol: the transport protocols a load balancer can carry

pub mod endpoints;
pub mod protocol;
pub mod service;

pub use endpoints::{EndpointPort, EndpointSubset, ServiceEndpoints};
pub use protocol::{ParseProtocolError, Protocol};
pub use service::{Service, ServiceKey, ServicePort, ServiceType, IDLED_AT_ANNOTATION};

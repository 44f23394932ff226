use crate::{CoreError, Result};
use lbsync_api::Protocol;

/// Check that a (protocol, port) pair can be routed by a load balancer
pub fn validate_port(protocol: &str, port: i32) -> Result<Protocol> {
    let parsed = protocol.parse::<Protocol>().map_err(|e| CoreError::Validation {
        protocol: protocol.to_string(),
        port,
        reason: e.to_string(),
    })?;

    if !(1..=65535).contains(&port) {
        return Err(CoreError::Validation {
            protocol: protocol.to_string(),
            port,
            reason: "port out of range".to_string(),
        });
    }

    Ok(parsed)
}

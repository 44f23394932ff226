//! VIP keys and reject-rule names
//!
//! Both are derived deterministically so that a later pass can recompute the
//! name of anything an earlier pass wrote.

use crate::{CoreError, Result};
use tracing::debug;

/// Backend limit on rule name length
pub const MAX_RULE_NAME_LEN: usize = 63;

/// Format `address:port`, bracketing IPv6 addresses
pub fn vip_key(address: &str, port: i32) -> String {
    if address.contains(':') {
        format!("[{}]:{}", address, port)
    } else {
        format!("{}:{}", address, port)
    }
}

/// Split a VIP key back into address and port
pub fn split_vip_key(key: &str) -> Result<(&str, i32)> {
    let (host, port) = if let Some(rest) = key.strip_prefix('[') {
        let (host, tail) = rest
            .split_once(']')
            .ok_or_else(|| CoreError::InvalidVip(format!("{}: missing ']'", key)))?;
        let port = tail
            .strip_prefix(':')
            .ok_or_else(|| CoreError::InvalidVip(format!("{}: missing port", key)))?;
        (host, port)
    } else {
        let (host, port) = key
            .rsplit_once(':')
            .ok_or_else(|| CoreError::InvalidVip(format!("{}: missing port", key)))?;
        if host.contains(':') {
            return Err(CoreError::InvalidVip(format!(
                "{}: IPv6 address must be bracketed",
                key
            )));
        }
        (host, port)
    };

    let port = port
        .parse::<u16>()
        .map_err(|_| CoreError::InvalidVip(format!("{}: bad port {:?}", key, port)))?;
    Ok((host, i32::from(port)))
}

/// Deterministic reject-rule name for a VIP on a load balancer
///
/// Names longer than 63 characters keep the whole `address:port` suffix and
/// shorten the load-balancer id from the right.
pub fn rule_name(lb_id: &str, address: &str, port: i32) -> String {
    let name = format!("{}-{}:{}", lb_id, address, port);
    if name.len() <= MAX_RULE_NAME_LEN {
        return name;
    }

    // one byte each for '-' and ':'
    let suffix_len = address.len() + port.to_string().len() + 2;
    let mut keep = MAX_RULE_NAME_LEN.saturating_sub(suffix_len).min(lb_id.len());
    while !lb_id.is_char_boundary(keep) {
        keep -= 1;
    }

    let short = format!("{}-{}:{}", &lb_id[..keep], address, port);
    debug!("Limiting rule name from {} to {}", name, short);
    short
}

/// Rule name with every `:` escaped, for command interfaces that treat it specially
pub fn rule_name_for_command(lb_id: &str, address: &str, port: i32) -> String {
    escape_rule_name(&rule_name(lb_id, address, port))
}

pub fn escape_rule_name(name: &str) -> String {
    name.replace(':', "\\:")
}

/// Inverse of [`escape_rule_name`]
pub fn unescape_rule_name(name: &str) -> String {
    name.replace("\\:", ":")
}

/// Split a rule name into its load-balancer prefix and VIP suffix
///
/// The prefix may be a truncated load-balancer id. Addresses never contain
/// `-`, so the last `-` separates the two parts.
pub fn split_rule_name(name: &str) -> Option<(&str, &str, i32)> {
    let (prefix, vip) = name.rsplit_once('-')?;
    let (address, port) = vip.rsplit_once(':')?;
    let port = port.parse::<u16>().ok()?;
    if address.is_empty() {
        return None;
    }
    Some((prefix, address, i32::from(port)))
}

#[cfg(test)]
mod tests {
    use super::*;

    const LB_UUID: &str = "a08ea426-2288-11eb-a30b-a8a1590cda29";

    #[test]
    fn test_vip_key_ipv4() {
        assert_eq!(vip_key("10.0.0.5", 80), "10.0.0.5:80");
    }

    #[test]
    fn test_vip_key_ipv6_is_bracketed() {
        assert_eq!(vip_key("fd00::5", 443), "[fd00::5]:443");
    }

    #[test]
    fn test_vip_key_round_trip() {
        for (address, port) in [
            ("10.0.0.5", 80),
            ("172.30.0.10", 53),
            ("fd00::5", 443),
            ("2001:db8:85a3:0:0:8a2e:370:7334", 65535),
            ("::1", 1),
        ] {
            let key = vip_key(address, port);
            assert_eq!(split_vip_key(&key).unwrap(), (address, port), "{}", key);
        }
    }

    #[test]
    fn test_split_vip_key_rejects_malformed() {
        assert!(split_vip_key("10.0.0.5").is_err());
        assert!(split_vip_key("fd00::5:80").is_err());
        assert!(split_vip_key("[fd00::5]80").is_err());
        assert!(split_vip_key("10.0.0.5:http").is_err());
        assert!(split_vip_key("10.0.0.5:70000").is_err());
    }

    #[test]
    fn test_rule_name_short() {
        assert_eq!(rule_name("lb1", "10.0.0.5", 80), "lb1-10.0.0.5:80");
    }

    #[test]
    fn test_rule_name_truncates_lb_only() {
        let lb = "x".repeat(80);
        let name = rule_name(&lb, "10.0.0.5", 8080);
        assert_eq!(name.len(), MAX_RULE_NAME_LEN);
        assert!(name.ends_with("-10.0.0.5:8080"));
        assert!(name.starts_with(&"x".repeat(10)));
    }

    #[test]
    fn test_rule_name_bound_holds_for_long_ids() {
        let full_ipv6 = "2001:0db8:85a3:0000:0000:8a2e:0370:7334";
        for lb_len in [0, 1, 20, LB_UUID.len(), 63, 64, 200] {
            let lb = "l".repeat(lb_len);
            for (address, port) in [
                ("1.2.3.4", 1),
                ("255.255.255.255", 65535),
                (full_ipv6, 65535),
                ("fd00::1", 80),
            ] {
                let name = rule_name(&lb, address, port);
                assert!(
                    name.len() <= MAX_RULE_NAME_LEN,
                    "{} is {} chars",
                    name,
                    name.len()
                );
                assert!(name.ends_with(&format!("-{}:{}", address, port)));
            }
        }
    }

    #[test]
    fn test_rule_name_with_uuid_and_ipv6() {
        let full_ipv6 = "2001:0db8:85a3:0000:0000:8a2e:0370:7334";
        let name = rule_name(LB_UUID, full_ipv6, 65535);
        // 63 - (39 + 5 + 2) = 17 characters of the id survive
        assert_eq!(name, format!("{}-{}:65535", &LB_UUID[..17], full_ipv6));
    }

    #[test]
    fn test_command_name_unescapes_to_rule_name() {
        for (lb, address, port) in [
            (LB_UUID, "10.0.0.5", 80),
            (LB_UUID, "fd00::5", 443),
            ("lb", "2001:0db8:85a3:0000:0000:8a2e:0370:7334", 65535),
            ("", "", 0),
        ] {
            let escaped = rule_name_for_command(lb, address, port);
            assert!(!escaped.replace("\\:", "").contains(':'));
            assert_eq!(unescape_rule_name(&escaped), rule_name(lb, address, port));
        }
    }

    #[test]
    fn test_command_name_escapes_colons() {
        assert_eq!(
            rule_name_for_command("lb1", "172.30.0.10", 53),
            "lb1-172.30.0.10\\:53"
        );
    }

    #[test]
    fn test_split_rule_name() {
        assert_eq!(
            split_rule_name(&rule_name(LB_UUID, "fd00::5", 443)),
            Some((LB_UUID, "fd00::5", 443))
        );
        assert_eq!(
            split_rule_name("lb1-10.0.0.5:80"),
            Some(("lb1", "10.0.0.5", 80))
        );
        assert_eq!(split_rule_name("allow-all"), None);
        assert_eq!(split_rule_name("no-separator"), None);
    }
}

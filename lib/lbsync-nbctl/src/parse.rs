//! Decoding of northbound command output

use crate::error::{NbctlError, Result};
use lbsync_core::{RejectRuleRecord, VipMap};
use serde_json::Value;
use tracing::warn;

/// Parse a load balancer `vips` column, e.g. `{"10.0.0.5:80"="10.1.0.9:8080,10.1.0.10:8080"}`
///
/// An empty value is a VIP without targets. Empty output is an empty map.
pub fn parse_vips(raw: &str) -> Result<VipMap> {
    let body = raw.trim();
    if body.is_empty() {
        return Ok(VipMap::new());
    }
    let inner = body
        .strip_prefix('{')
        .and_then(|b| b.strip_suffix('}'))
        .ok_or_else(|| NbctlError::parse("vips", format!("not a map: {}", body)))?;

    let tokens = quoted_strings(inner)?;
    if tokens.len() % 2 != 0 {
        return Err(NbctlError::parse("vips", format!("dangling key in {}", body)));
    }

    let mut vips = VipMap::new();
    for pair in tokens.chunks(2) {
        vips.insert(pair[0].clone(), split_list(&pair[1]));
    }
    Ok(vips)
}

/// Render a target list the way the `vips` column stores it
pub fn format_targets(targets: &[String]) -> String {
    targets.join(",")
}

fn quoted_strings(s: &str) -> Result<Vec<String>> {
    let mut out = Vec::new();
    let mut chars = s.chars();
    while let Some(c) = chars.next() {
        match c {
            '"' => {
                let mut current = String::new();
                loop {
                    match chars.next() {
                        Some('\\') => match chars.next() {
                            Some(escaped) => current.push(escaped),
                            None => return Err(NbctlError::parse("vips", "trailing escape")),
                        },
                        Some('"') => break,
                        Some(other) => current.push(other),
                        None => return Err(NbctlError::parse("vips", "unterminated string")),
                    }
                }
                out.push(current);
            }
            '=' | ',' | ' ' => {}
            other => {
                return Err(NbctlError::parse(
                    "vips",
                    format!("unexpected character {:?}", other),
                ))
            }
        }
    }
    Ok(out)
}

/// Decode the JSON output of `--columns=name,_uuid --format=json find acl ...`
///
/// Each row is `[name, ["uuid", id]]`. Rows of any other shape are skipped;
/// only a document that fails to parse is an error.
pub fn parse_rule_listing(raw: &str) -> Result<Vec<RejectRuleRecord>> {
    let doc: Value = serde_json::from_str(raw)?;
    let rows = doc
        .get("data")
        .and_then(Value::as_array)
        .ok_or_else(|| NbctlError::parse("reject rule listing", "missing data array"))?;

    let mut rules = Vec::with_capacity(rows.len());
    for row in rows {
        match decode_rule_row(row) {
            Some(rule) => rules.push(rule),
            None => warn!("Skipping malformed reject rule row: {}", row),
        }
    }
    Ok(rules)
}

fn decode_rule_row(row: &Value) -> Option<RejectRuleRecord> {
    let [name, uuid] = row.as_array()?.as_slice() else {
        return None;
    };
    let [tag, id] = uuid.as_array()?.as_slice() else {
        return None;
    };
    if tag.as_str()? != "uuid" {
        return None;
    }
    Some(RejectRuleRecord {
        name: name.as_str()?.to_string(),
        id: id.as_str()?.to_string(),
    })
}

/// Non-empty lines of `--data=bare --no-heading` output
pub fn parse_lines(raw: &str) -> Vec<String> {
    raw.lines()
        .map(|line| unquote(line.trim()))
        .filter(|line| !line.is_empty())
        .map(str::to_string)
        .collect()
}

/// Comma-separated value of a string column, e.g. `"172.18.0.2,fd00::2"`
pub fn parse_address_list(raw: &str) -> Vec<String> {
    split_list(unquote(raw.trim()))
}

fn split_list(s: &str) -> Vec<String> {
    s.split(',')
        .map(str::trim)
        .filter(|item| !item.is_empty())
        .map(str::to_string)
        .collect()
}

fn unquote(s: &str) -> &str {
    s.strip_prefix('"')
        .and_then(|s| s.strip_suffix('"'))
        .unwrap_or(s)
}

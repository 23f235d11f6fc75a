//! Decoders for the bootstrap probes: cluster topology, the command table,
//! and the server version. Malformed entries are reported and skipped; a
//! topology refresh should survive one odd node record.

use crate::slots::{SlotRange, SLOT_COUNT};
use crate::StoreError;
use resp::{ProtocolError, Value};
use std::collections::HashMap;

/// Decode a `CLUSTER SLOTS` reply into slot ranges.
pub fn decode_slot_ranges(reply: &Value) -> Result<Vec<SlotRange>, StoreError> {
    let entries = reply.as_array()?;
    let mut ranges = Vec::with_capacity(entries.len());
    for (index, entry) in entries.iter().enumerate() {
        match decode_slot_range(entry) {
            Ok(range) => ranges.push(range),
            Err(err) => tracing::warn!(index, error = %err, "skipping malformed slot range"),
        }
    }
    Ok(ranges)
}

// Each entry is [start, end, primary-node, replica-node...]; a node is
// [host, port, ...] with an optional id we ignore.
fn decode_slot_range(entry: &Value) -> Result<SlotRange, ProtocolError> {
    let elements = entry.elements(3)?;
    let start = elements[0].as_integer()?;
    let end = elements[1].as_integer()?;
    if !(0..SLOT_COUNT as i64).contains(&start) || !(start..SLOT_COUNT as i64).contains(&end) {
        return Err(ProtocolError::BadLength("slot range", end));
    }

    let primary = decode_node(&elements[2])?;
    let mut replicas = Vec::new();
    for (index, node) in elements[3..].iter().enumerate() {
        match decode_node(node) {
            Ok(addr) => replicas.push(addr),
            Err(err) => {
                tracing::warn!(start, end, index, error = %err, "skipping malformed replica")
            }
        }
    }

    Ok(SlotRange {
        start: start as u16,
        end: end as u16,
        primary,
        replicas,
    })
}

fn decode_node(node: &Value) -> Result<String, ProtocolError> {
    let elements = node.elements(2)?;
    let host = elements[0].as_str()?;
    let port = elements[1].as_integer()?;
    Ok(format!("{}:{}", host, port))
}

/// Decode a `COMMAND` reply into a command-name to first-key-position table.
///
/// Each element carries (name, arity, flags, first key, last key, step); the
/// name and the first-key position are all that key extraction needs. Any
/// reply shape other than an array yields an empty table with a report,
/// never a failure.
pub fn decode_command_keys(reply: &Value) -> HashMap<String, usize> {
    let entries = match reply {
        Value::Array(entries) => entries,
        Value::Nil => return HashMap::new(),
        Value::Error(text) => {
            tracing::warn!(error = %text, "command key probe failed");
            return HashMap::new();
        }
        other => {
            tracing::error!(kind = other.kind(), "unexpected command probe reply");
            return HashMap::new();
        }
    };

    let mut keymap = HashMap::with_capacity(entries.len());
    for (index, entry) in entries.iter().enumerate() {
        match decode_command_key(entry) {
            Ok((name, position)) => {
                keymap.insert(name, position);
            }
            Err(err) => tracing::warn!(index, error = %err, "skipping command table entry"),
        }
    }
    keymap
}

fn decode_command_key(entry: &Value) -> Result<(String, usize), ProtocolError> {
    let elements = entry.elements(6)?;
    let name = elements[0].as_str()?.to_owned();
    let position = elements[3].as_integer()?;
    if position < 0 {
        return Err(ProtocolError::BadLength("key position", position));
    }
    Ok((name, position as usize))
}

/// Parse the major version out of an `INFO SERVER` reply.
///
/// Protocol irregularities are reported and yield 0 ("unknown"): the caller
/// decides whether an unknown version is acceptable.
pub fn parse_server_version(reply: &Value) -> u32 {
    let info = match reply {
        Value::Error(text) => {
            tracing::warn!(error = %text, "server version probe failed");
            return 0;
        }
        other => match other.as_str() {
            Ok(text) => text,
            Err(err) => {
                tracing::error!(error = %err, "unexpected server version reply");
                return 0;
            }
        },
    };

    for line in info.lines() {
        if let Some(version) = line.strip_prefix("redis_version:") {
            match version.split('.').next().and_then(|major| major.parse().ok()) {
                Some(major) => return major,
                None => {
                    tracing::error!(line, "cannot parse server version");
                    return 0;
                }
            }
        }
    }
    tracing::error!("no version line in server info reply");
    0
}

#[cfg(test)]
mod test {
    use super::*;
    use bytes::Bytes;

    fn bulk(text: &str) -> Value {
        Value::Bulk(Bytes::copy_from_slice(text.as_bytes()))
    }

    fn node(host: &str, port: i64) -> Value {
        Value::Array(vec![bulk(host), Value::Integer(port)])
    }

    #[test]
    fn test_decode_slot_ranges() {
        let reply = Value::Array(vec![
            Value::Array(vec![
                Value::Integer(0),
                Value::Integer(8191),
                node("10.0.0.1", 6379),
                node("10.0.0.2", 6379),
            ]),
            Value::Array(vec![
                Value::Integer(8192),
                Value::Integer(16383),
                node("10.0.0.3", 6379),
            ]),
        ]);

        let ranges = decode_slot_ranges(&reply).unwrap();
        assert_eq!(ranges.len(), 2);
        assert_eq!(ranges[0].start, 0);
        assert_eq!(ranges[0].end, 8191);
        assert_eq!(ranges[0].primary, "10.0.0.1:6379");
        assert_eq!(ranges[0].replicas, vec!["10.0.0.2:6379".to_owned()]);
        assert_eq!(ranges[1].primary, "10.0.0.3:6379");
        assert!(ranges[1].replicas.is_empty());
    }

    #[test]
    fn test_malformed_range_is_skipped() {
        let reply = Value::Array(vec![
            // Slot numbers out of range.
            Value::Array(vec![
                Value::Integer(0),
                Value::Integer(99999),
                node("a", 1),
            ]),
            // Too few elements.
            Value::Array(vec![Value::Integer(0), Value::Integer(1)]),
            Value::Array(vec![Value::Integer(2), Value::Integer(3), node("b", 2)]),
        ]);

        let ranges = decode_slot_ranges(&reply).unwrap();
        assert_eq!(ranges.len(), 1);
        assert_eq!(ranges[0].primary, "b:2");
    }

    #[test]
    fn test_decode_command_keys() {
        let entry = |name: &str, position: i64| {
            Value::Array(vec![
                bulk(name),
                Value::Integer(-2),
                Value::Array(vec![]),
                Value::Integer(position),
                Value::Integer(1),
                Value::Integer(1),
            ])
        };
        let reply = Value::Array(vec![
            entry("get", 1),
            entry("mset", 1),
            // Malformed: negative key position.
            entry("bad", -1),
        ]);

        let keymap = decode_command_keys(&reply);
        assert_eq!(keymap.len(), 2);
        assert_eq!(keymap.get("get"), Some(&1));
        assert_eq!(keymap.get("bad"), None);

        assert!(decode_command_keys(&Value::Nil).is_empty());
        assert!(decode_command_keys(&Value::Error("ERR no".into())).is_empty());
    }

    #[test]
    fn test_parse_server_version() {
        let info = bulk("# Server\r\nredis_git_sha1:0\r\nredis_version:6.2.7\r\nos:Linux\r\n");
        assert_eq!(parse_server_version(&info), 6);

        assert_eq!(parse_server_version(&bulk("no version here")), 0);
        assert_eq!(parse_server_version(&bulk("redis_version:garbage")), 0);
        assert_eq!(parse_server_version(&Value::Error("ERR info".into())), 0);
        assert_eq!(parse_server_version(&Value::Integer(3)), 0);
    }
}

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use bevy::log::warn;
use crossbeam_channel::{Receiver, Sender, TrySendError};
use mlua::{Lua, MultiValue, Table, Value};
use serde::Serialize;

use crate::context::synced_iter::sorted_keys;

const OVERFLOW_LOG_INTERVAL_FRAMES: u64 = 60;

/// One `SendToUnsynced` call. Arguments are kept as JSON values: object keys are sorted, so the
/// same script arguments always encode to the same bytes on every peer.
#[derive(Serialize, Clone, Debug, PartialEq)]
pub struct BridgeMessage {
    pub frame: u64,
    pub payload: Vec<serde_json::Value>,
}

#[derive(Serialize, Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct BridgeStats {
    pub sent: u64,
    pub dropped: u64,
    pub delivered: u64,
    pub pending: usize,
}

#[derive(Default)]
struct BridgeCounters {
    sent: AtomicU64,
    dropped: AtomicU64,
    delivered: AtomicU64,
}

/// Builds the two ends of a handle's bridge. Only the deterministic context ever receives the
/// sending end.
pub fn bridge(capacity: usize) -> (BridgeSender, BridgeReceiver) {
    let (tx, rx) = crossbeam_channel::bounded(capacity.max(1));
    let counters = Arc::new(BridgeCounters::default());
    (
        BridgeSender {
            tx,
            counters: counters.clone(),
            last_overflow_log_frame: None,
        },
        BridgeReceiver { rx, counters },
    )
}

pub struct BridgeSender {
    tx: Sender<BridgeMessage>,
    counters: Arc<BridgeCounters>,
    last_overflow_log_frame: Option<u64>,
}

impl BridgeSender {
    /// Never blocks. A full queue drops the message; retrying would reorder the stream.
    pub fn send(&mut self, message: BridgeMessage) {
        let frame = message.frame;
        match self.tx.try_send(message) {
            Ok(()) => {
                self.counters.sent.fetch_add(1, Ordering::Relaxed);
            }
            Err(TrySendError::Full(_)) => {
                let dropped = self.counters.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                let should_log = self
                    .last_overflow_log_frame
                    .map_or(true, |last| frame.saturating_sub(last) >= OVERFLOW_LOG_INTERVAL_FRAMES);
                if should_log {
                    self.last_overflow_log_frame = Some(frame);
                    warn!(
                        "[Lockstep bridge] Queue full at frame {frame}, dropping message (total dropped: {dropped})"
                    );
                }
            }
            Err(TrySendError::Disconnected(_)) => {
                self.counters.dropped.fetch_add(1, Ordering::Relaxed);
            }
        }
    }
}

pub struct BridgeReceiver {
    rx: Receiver<BridgeMessage>,
    counters: Arc<BridgeCounters>,
}

impl BridgeReceiver {
    /// Removes everything queued so far, oldest first.
    pub fn drain(&self) -> Vec<BridgeMessage> {
        let messages: Vec<BridgeMessage> = self.rx.try_iter().collect();
        self.counters
            .delivered
            .fetch_add(messages.len() as u64, Ordering::Relaxed);
        messages
    }

    /// Removes everything queued without a receiver to hand it to. Counted as dropped.
    pub fn discard(&self) -> usize {
        let discarded = self.rx.try_iter().count();
        self.counters
            .dropped
            .fetch_add(discarded as u64, Ordering::Relaxed);
        discarded
    }

    pub fn pending(&self) -> usize {
        self.rx.len()
    }

    pub fn stats(&self) -> BridgeStats {
        BridgeStats {
            sent: self.counters.sent.load(Ordering::Relaxed),
            dropped: self.counters.dropped.load(Ordering::Relaxed),
            delivered: self.counters.delivered.load(Ordering::Relaxed),
            pending: self.rx.len(),
        }
    }
}

const PAIRS_TAG: &str = "__pairs";
const MAX_PAYLOAD_DEPTH: usize = 64;

/// Converts `SendToUnsynced` arguments. Sequences become arrays and string-keyed tables become
/// objects. Any other table (sparse or mixed keys, or one using the tag key itself) becomes
/// `{"__pairs": [[key, value], ...]}` in the synced key order, which decodes back to the same
/// keys. Functions, userdata, threads, non-finite numbers and self-referencing tables are
/// rejected with a script error.
pub fn encode_payload(args: MultiValue) -> mlua::Result<Vec<serde_json::Value>> {
    args.into_iter().map(|value| encode_value(&value, 0)).collect()
}

fn encode_value(value: &Value, depth: usize) -> mlua::Result<serde_json::Value> {
    match value {
        Value::Nil => Ok(serde_json::Value::Null),
        Value::Boolean(b) => Ok(serde_json::Value::Bool(*b)),
        Value::Integer(i) => Ok(serde_json::Value::from(*i as i64)),
        Value::Number(n) => serde_json::Number::from_f64(*n)
            .map(serde_json::Value::Number)
            .ok_or_else(|| payload_error(format!("cannot send the number {n}"))),
        Value::String(s) => Ok(serde_json::Value::String(s.to_str()?.to_string())),
        Value::Table(table) => encode_table(table, depth + 1),
        other => Err(payload_error(format!(
            "cannot send a value of type '{}'",
            other.type_name()
        ))),
    }
}

fn encode_table(table: &Table, depth: usize) -> mlua::Result<serde_json::Value> {
    if depth > MAX_PAYLOAD_DEPTH {
        return Err(payload_error(
            "table nesting too deep (self-referencing table?)".to_string(),
        ));
    }
    let keys = sorted_keys(table)?;
    let is_sequence = keys
        .iter()
        .enumerate()
        .all(|(index, (_, key))| sequence_index(key) == Some(index as i64 + 1));
    if is_sequence {
        return keys
            .iter()
            .map(|(_, key)| encode_value(&table.raw_get::<Value>(key.clone())?, depth))
            .collect::<mlua::Result<Vec<_>>>()
            .map(serde_json::Value::Array);
    }
    let string_keyed = keys.iter().all(|(_, key)| {
        matches!(key, Value::String(s) if &*s.as_bytes() != PAIRS_TAG.as_bytes())
    });
    if string_keyed {
        let mut object = serde_json::Map::new();
        for (_, key) in &keys {
            let Value::String(name) = key else { continue };
            let value = encode_value(&table.raw_get::<Value>(key.clone())?, depth)?;
            object.insert(name.to_str()?.to_string(), value);
        }
        return Ok(serde_json::Value::Object(object));
    }
    let mut pairs = Vec::with_capacity(keys.len());
    for (_, key) in &keys {
        let value = encode_value(&table.raw_get::<Value>(key.clone())?, depth)?;
        pairs.push(serde_json::Value::Array(vec![encode_value(key, depth)?, value]));
    }
    let mut object = serde_json::Map::new();
    object.insert(PAIRS_TAG.to_string(), serde_json::Value::Array(pairs));
    Ok(serde_json::Value::Object(object))
}

fn sequence_index(key: &Value) -> Option<i64> {
    match key {
        Value::Integer(i) => Some(*i as i64),
        Value::Number(n) if n.fract() == 0.0 => Some(*n as i64),
        _ => None,
    }
}

fn payload_error(message: String) -> mlua::Error {
    mlua::Error::RuntimeError(format!("SendToUnsynced: {message}"))
}

/// Rebuilds the original arguments inside the receiving state. JSON null maps back to `nil`.
pub fn decode_payload(lua: &Lua, payload: &[serde_json::Value]) -> mlua::Result<MultiValue> {
    payload
        .iter()
        .map(|value| decode_value(lua, value))
        .collect::<mlua::Result<Vec<_>>>()
        .map(MultiValue::from_iter)
}

fn decode_value(lua: &Lua, value: &serde_json::Value) -> mlua::Result<Value> {
    Ok(match value {
        serde_json::Value::Null => Value::Nil,
        serde_json::Value::Bool(b) => Value::Boolean(*b),
        serde_json::Value::Number(n) => match n.as_i64() {
            Some(i) => Value::Integer(i as mlua::Integer),
            None => Value::Number(n.as_f64().unwrap_or_default()),
        },
        serde_json::Value::String(s) => Value::String(lua.create_string(s)?),
        serde_json::Value::Array(items) => {
            let table = lua.create_table_with_capacity(items.len(), 0)?;
            for (index, item) in items.iter().enumerate() {
                table.raw_set(index + 1, decode_value(lua, item)?)?;
            }
            Value::Table(table)
        }
        serde_json::Value::Object(object) => {
            let table = lua.create_table()?;
            match object.get(PAIRS_TAG) {
                Some(serde_json::Value::Array(pairs)) if object.len() == 1 => {
                    for pair in pairs {
                        if let serde_json::Value::Array(entry) = pair {
                            if let [key, value] = entry.as_slice() {
                                table.raw_set(decode_value(lua, key)?, decode_value(lua, value)?)?;
                            }
                        }
                    }
                }
                _ => {
                    for (key, value) in object {
                        table.raw_set(key.as_str(), decode_value(lua, value)?)?;
                    }
                }
            }
            Value::Table(table)
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn message(frame: u64, tag: &str) -> BridgeMessage {
        BridgeMessage {
            frame,
            payload: vec![json!(tag)],
        }
    }

    #[test]
    fn drain_returns_everything_in_send_order() {
        let (mut tx, rx) = bridge(16);
        for tag in ["a", "b", "c"] {
            tx.send(message(1, tag));
        }
        let drained = rx.drain();
        let tags: Vec<_> = drained.iter().map(|m| m.payload[0].clone()).collect();
        assert_eq!(tags, vec![json!("a"), json!("b"), json!("c")]);
        assert!(rx.drain().is_empty());
        assert_eq!(rx.stats().delivered, 3);
    }

    #[test]
    fn discarded_messages_count_as_dropped() {
        let (mut tx, rx) = bridge(8);
        tx.send(message(1, "a"));
        tx.send(message(1, "b"));
        assert_eq!(rx.discard(), 2);
        let stats = rx.stats();
        assert_eq!(stats.delivered, 0);
        assert_eq!(stats.dropped, 2);
        assert_eq!(stats.pending, 0);
    }

    #[test]
    fn full_queue_drops_without_blocking() {
        let (mut tx, rx) = bridge(2);
        for i in 0..5 {
            tx.send(message(i, "x"));
        }
        let stats = rx.stats();
        assert_eq!(stats.sent, 2);
        assert_eq!(stats.dropped, 3);
        assert_eq!(stats.pending, 2);
        let frames: Vec<u64> = rx.drain().iter().map(|m| m.frame).collect();
        assert_eq!(frames, vec![0, 1]);
    }

    #[test]
    fn payload_survives_the_trip_between_states() {
        let sender = Lua::new();
        let receiver = Lua::new();
        let args: MultiValue = sender
            .load(r#"return "score", 42, nil, { kills = 3, name = "red" }, { 1, 2, 3 }"#)
            .eval()
            .expect("eval args");
        let payload = encode_payload(args).expect("encode");
        assert_eq!(payload[0], json!("score"));
        assert_eq!(payload[2], serde_json::Value::Null);

        let rebuilt = decode_payload(&receiver, &payload).expect("decode");
        let check: mlua::Function = receiver
            .load(
                r#"return function(tag, value, missing, stats, list)
                    return tag == "score" and value == 42 and missing == nil
                        and stats.kills == 3 and stats.name == "red"
                        and #list == 3 and list[3] == 3
                end"#,
            )
            .eval()
            .expect("eval check");
        assert!(check.call::<bool>(rebuilt).expect("call check"));
    }

    #[test]
    fn functions_cannot_cross() {
        let lua = Lua::new();
        let args: MultiValue = lua.load("return function() end").eval().expect("eval");
        assert!(encode_payload(args).is_err());
    }

    #[test]
    fn table_keys_encode_in_sorted_order() {
        let lua = Lua::new();
        let args: MultiValue = lua
            .load(r#"local t = {} t.zeta = "z" t.alpha = "a" t.mid = "m" return t"#)
            .eval()
            .expect("eval");
        let payload = encode_payload(args).expect("encode");
        let encoded = serde_json::to_string(&payload).expect("to string");
        assert_eq!(encoded, r#"[{"alpha":"a","mid":"m","zeta":"z"}]"#);
    }

    #[test]
    fn unit_keyed_tables_keep_their_integer_keys() {
        let sender = Lua::new();
        let receiver = Lua::new();
        let args: MultiValue = sender
            .load(r#"return "hp", { [9] = 40, [5] = 100 }, { 10, 20, label = "mixed" }"#)
            .eval()
            .expect("eval args");
        let payload = encode_payload(args).expect("encode");
        assert_eq!(payload[1], json!({ "__pairs": [[5, 100], [9, 40]] }));

        let rebuilt = decode_payload(&receiver, &payload).expect("decode");
        let check: mlua::Function = receiver
            .load(
                r#"return function(tag, hp, mixed)
                    return tag == "hp" and hp[5] == 100 and hp[9] == 40 and hp["5"] == nil
                        and mixed[1] == 10 and mixed[2] == 20 and mixed.label == "mixed"
                end"#,
            )
            .eval()
            .expect("eval check");
        assert!(check.call::<bool>(rebuilt).expect("call check"));
    }

    #[test]
    fn self_referencing_tables_are_rejected() {
        let lua = Lua::new();
        let args: MultiValue = lua
            .load("local t = {} t.me = t return t")
            .eval()
            .expect("eval");
        assert!(encode_payload(args).is_err());
    }
}

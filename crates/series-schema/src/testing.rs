//! An in-memory store that interprets the command frames the loader
//! issues, with enough set/hash/stream semantics to assert on the results.
//! Test support only; it also records every command in arrival order so
//! causal-ordering properties can be checked directly.

use crate::keys;
use resp::{Frame, Value};
use seriesid::Id;
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::Mutex;
use store_client::{Store, StoreError};

#[derive(Default)]
struct MemoryState {
    log: Vec<Vec<Vec<u8>>>,
    sets: HashMap<String, BTreeSet<Vec<u8>>>,
    hashes: HashMap<String, BTreeMap<Vec<u8>, Vec<u8>>>,
    strings: HashMap<String, Vec<u8>>,
    streams: HashMap<String, Vec<(u64, u64, Vec<(Vec<u8>, Vec<u8>)>)>>,
    expires: HashMap<String, u64>,
    published: Vec<(String, String)>,
    fail_once: HashSet<String>,
}

/// The scripted store.
#[derive(Default)]
pub struct MemoryStore {
    state: Mutex<MemoryState>,
}

impl MemoryStore {
    pub fn new() -> MemoryStore {
        MemoryStore::default()
    }

    /// Make the next command named `command` fail with a transport error.
    pub fn fail_once(&self, command: &str) {
        self.state
            .lock()
            .unwrap()
            .fail_once
            .insert(command.to_uppercase());
    }

    /// Every command received, lossily decoded for assertions.
    pub fn commands(&self) -> Vec<Vec<String>> {
        self.state
            .lock()
            .unwrap()
            .log
            .iter()
            .map(|args| {
                args.iter()
                    .map(|arg| String::from_utf8_lossy(arg).into_owned())
                    .collect()
            })
            .collect()
    }

    /// How many received commands named `name` targeted `key`.
    pub fn count(&self, name: &str, key: &str) -> usize {
        self.state
            .lock()
            .unwrap()
            .log
            .iter()
            .filter(|args| {
                args.first().map(|arg| arg.as_slice()) == Some(name.as_bytes())
                    && args.get(1).map(|arg| arg.as_slice()) == Some(key.as_bytes())
            })
            .count()
    }

    pub fn sismember(&self, key: &str, member: impl AsRef<[u8]>) -> bool {
        self.state
            .lock()
            .unwrap()
            .sets
            .get(key)
            .map_or(false, |set| set.contains(member.as_ref()))
    }

    pub fn smembers(&self, key: &str) -> Vec<Vec<u8>> {
        self.state
            .lock()
            .unwrap()
            .sets
            .get(key)
            .map_or(Vec::new(), |set| set.iter().cloned().collect())
    }

    pub fn hget(&self, key: &str, field: impl AsRef<[u8]>) -> Option<Vec<u8>> {
        self.state
            .lock()
            .unwrap()
            .hashes
            .get(key)
            .and_then(|hash| hash.get(field.as_ref()).cloned())
    }

    pub fn hexists(&self, key: &str, field: impl AsRef<[u8]>) -> bool {
        self.hget(key, field).is_some()
    }

    pub fn get(&self, key: &str) -> Option<Vec<u8>> {
        self.state.lock().unwrap().strings.get(key).cloned()
    }

    pub fn xlen(&self, key: &str) -> usize {
        self.state
            .lock()
            .unwrap()
            .streams
            .get(key)
            .map_or(0, Vec::len)
    }

    /// Stream entries as (id, fields) pairs.
    pub fn stream_entries(&self, key: &str) -> Vec<(String, Vec<(Vec<u8>, Vec<u8>)>)> {
        self.state
            .lock()
            .unwrap()
            .streams
            .get(key)
            .map_or(Vec::new(), |entries| {
                entries
                    .iter()
                    .map(|(ms, seq, fields)| (format!("{}-{}", ms, seq), fields.clone()))
                    .collect()
            })
    }

    pub fn ttl(&self, key: &str) -> Option<u64> {
        self.state.lock().unwrap().expires.get(key).copied()
    }

    /// Announcements, as (channel, message) pairs.
    pub fn published(&self) -> Vec<(String, String)> {
        self.state.lock().unwrap().published.clone()
    }

    /// Convenience: the interned string for `id` in `pcp:map:<class>`.
    pub fn mapped(&self, class: &str, id: &Id) -> Option<String> {
        self.hget(&keys::map(class), id.as_bytes())
            .map(|text| String::from_utf8_lossy(&text).into_owned())
    }
}

#[async_trait::async_trait(?Send)]
impl Store for MemoryStore {
    async fn request(&self, _key: Option<&[u8]>, frame: Frame) -> Result<Value, StoreError> {
        let args = decode_args(frame.as_bytes())?;
        let mut state = self.state.lock().unwrap();
        state.log.push(args.clone());

        let name = String::from_utf8_lossy(&args[0]).to_uppercase();
        if state.fail_once.remove(&name) {
            return Err(StoreError::Transport(format!("injected {} failure", name)));
        }

        Ok(interpret(&mut state, &name, &args))
    }
}

fn decode_args(wire: &[u8]) -> Result<Vec<Vec<u8>>, StoreError> {
    let (value, _) = resp::read(wire)
        .map_err(StoreError::Protocol)?
        .ok_or(StoreError::Transport("truncated frame".to_owned()))?;
    let args: Vec<Vec<u8>> = value
        .as_array()
        .map_err(StoreError::Protocol)?
        .iter()
        .map(|arg| {
            arg.as_bulk()
                .map(|bytes| bytes.to_vec())
                .map_err(StoreError::Protocol)
        })
        .collect::<Result<_, _>>()?;
    if args.is_empty() {
        return Err(StoreError::Transport("empty command".to_owned()));
    }
    Ok(args)
}

fn interpret(state: &mut MemoryState, name: &str, args: &[Vec<u8>]) -> Value {
    let text = |index: usize| String::from_utf8_lossy(&args[index]).into_owned();

    match name {
        "SADD" | "GEOADD" => {
            // GEOADD stores members only; coordinates are not modeled.
            let key = text(1);
            let members = if name == "GEOADD" { &args[4..] } else { &args[2..] };
            let set = state.sets.entry(key).or_default();
            let mut added = 0;
            for member in members {
                if set.insert(member.clone()) {
                    added += 1;
                }
            }
            Value::Integer(added)
        }
        "HSET" | "HMSET" => {
            let key = text(1);
            let hash = state.hashes.entry(key).or_default();
            let mut created = 0;
            for pair in args[2..].chunks(2) {
                if pair.len() != 2 {
                    return Value::Error("ERR wrong number of arguments".to_owned());
                }
                if hash.insert(pair[0].clone(), pair[1].clone()).is_none() {
                    created += 1;
                }
            }
            if name == "HSET" {
                Value::Integer(created)
            } else {
                Value::Simple("OK".to_owned())
            }
        }
        "GET" => match state.strings.get(&text(1)) {
            Some(value) => Value::bulk(value.clone()),
            None => Value::Nil,
        },
        "SET" => {
            state.strings.insert(text(1), args[2].clone());
            Value::Simple("OK".to_owned())
        }
        "PUBLISH" => {
            state.published.push((text(1), text(2)));
            Value::Integer(0)
        }
        "XADD" => {
            // XADD key MAXLEN ~ <n> <id> <field> <value>...
            let key = text(1);
            let id = text(5);
            let (ms, seq) = match parse_stream_id(&id) {
                Some(id) => id,
                None => return Value::Error("ERR Invalid stream ID specified".to_owned()),
            };
            let entries = state.streams.entry(key).or_default();
            if let Some((last_ms, last_seq, _)) = entries.last() {
                if (ms, seq) <= (*last_ms, *last_seq) {
                    return Value::Error(
                        "ERR The ID specified in XADD is equal or smaller than \
                         the target stream top item"
                            .to_owned(),
                    );
                }
            }
            let fields = args[6..]
                .chunks(2)
                .filter(|pair| pair.len() == 2)
                .map(|pair| (pair[0].clone(), pair[1].clone()))
                .collect();
            entries.push((ms, seq, fields));
            Value::bulk(id.into_bytes())
        }
        "EXPIRE" => {
            let seconds = text(2).parse().unwrap_or(0);
            state.expires.insert(text(1), seconds);
            Value::Integer(1)
        }
        "SCRIPT" => Value::bulk(Id::of(&args[2]).hex().as_str().to_owned().into_bytes()),
        "INFO" => Value::bulk(&b"redis_version:6.2.7\r\n"[..]),
        "COMMAND" => Value::Array(Vec::new()),
        "CLUSTER" => Value::Error("ERR This instance has cluster support disabled".to_owned()),
        other => Value::Error(format!("ERR unknown command '{}'", other)),
    }
}

fn parse_stream_id(id: &str) -> Option<(u64, u64)> {
    let (ms, seq) = id.split_once('-')?;
    Some((ms.parse().ok()?, seq.parse().ok()?))
}

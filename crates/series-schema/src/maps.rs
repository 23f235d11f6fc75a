//! Per-process intern tables with a publish-once discipline against the
//! cluster-wide maps.
//!
//! Before any reference to a name is written, the name itself must be
//! mapped: hash to string in the store's `pcp:map:<class>` hash, announced
//! on `pcp:channel:<class>` exactly once cluster-wide when newly created.
//! The local table deduplicates concurrent callers: the insert happens
//! before the store round-trip, so only the first caller pays it.

use crate::keys;
use crate::load::LoadError;
use resp::{Frame, Value};
use seriesid::Id;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use store_client::Store;

/// One interned-string class: a local map shadowing `pcp:map:<class>`.
pub struct MapDict {
    class: String,
    entries: Mutex<HashMap<Id, String>>,
}

impl MapDict {
    pub fn new(class: impl Into<String>) -> MapDict {
        MapDict {
            class: class.into(),
            entries: Mutex::new(HashMap::new()),
        }
    }

    pub fn class(&self) -> &str {
        &self.class
    }

    pub fn lookup(&self, id: &Id) -> Option<String> {
        self.entries.lock().unwrap().get(id).cloned()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().unwrap().is_empty()
    }

    /// Drop every local entry, forcing re-publication on next use.
    pub fn flush(&self) {
        self.entries.lock().unwrap().clear();
    }

    /// Make sure `id -> text` is mapped, locally and in the store.
    ///
    /// The local insert happens first so concurrent callers deduplicate;
    /// the store write is issued at most once per process for a given
    /// identifier. A transport failure takes the local entry back out, so
    /// the record retry after reconnect re-publishes it.
    pub async fn ensure<S: Store + ?Sized>(
        &self,
        store: &S,
        id: Id,
        text: &str,
    ) -> Result<(), LoadError> {
        {
            let mut entries = self.entries.lock().unwrap();
            if entries.contains_key(&id) {
                return Ok(());
            }
            entries.insert(id, text.to_owned());
        }

        let key = keys::map(&self.class);
        let frame = Frame::new("HSET", 4)
            .arg(&key)
            .arg(id.as_bytes())
            .arg(text);
        let reply = match store.request(Some(key.as_bytes()), frame).await {
            Ok(reply) => reply,
            Err(err) => {
                self.entries.lock().unwrap().remove(&id);
                return Err(err.into());
            }
        };

        match reply {
            // Newly created in the store: announce it, once, cluster-wide.
            Value::Integer(1) => self.publish(store, &id, text).await,
            Value::Integer(_) => Ok(()),
            other => {
                tracing::warn!(
                    class = %self.class,
                    kind = other.kind(),
                    "unexpected string mapping reply",
                );
                Ok(())
            }
        }
    }

    // Announcement failures are reported but never fail the mapping: the
    // string is in the store by now and the identifier remains usable.
    async fn publish<S: Store + ?Sized>(
        &self,
        store: &S,
        id: &Id,
        text: &str,
    ) -> Result<(), LoadError> {
        let channel = keys::channel(&self.class);
        let message = format!("{}:{}", id.hex(), text);
        let frame = Frame::new("PUBLISH", 3).arg(&channel).arg(&message);
        match store.request(Some(channel.as_bytes()), frame).await {
            Ok(Value::Integer(_)) => {}
            Ok(other) => tracing::warn!(
                class = %self.class,
                kind = other.kind(),
                "unexpected mapping announcement reply",
            ),
            Err(err) => tracing::warn!(
                class = %self.class,
                error = %err,
                "mapping announcement failed",
            ),
        }
        Ok(())
    }
}

/// The process-wide intern tables, one per string class, passed explicitly
/// to every ingest entry point. Label values intern under a class derived
/// from the label name, created on demand.
pub struct Maps {
    pub metric_names: MapDict,
    pub instance_names: MapDict,
    pub label_names: MapDict,
    pub contexts: MapDict,
    label_values: Mutex<HashMap<Id, Arc<MapDict>>>,
}

impl Maps {
    pub fn new() -> Maps {
        Maps {
            metric_names: MapDict::new("metric.name"),
            instance_names: MapDict::new("inst.name"),
            label_names: MapDict::new("label.name"),
            contexts: MapDict::new("context.name"),
            label_values: Mutex::new(HashMap::new()),
        }
    }

    /// The value map for one label name.
    pub fn label_values(&self, name: &Id) -> Arc<MapDict> {
        self.label_values
            .lock()
            .unwrap()
            .entry(*name)
            .or_insert_with(|| Arc::new(MapDict::new(keys::label_value_class(&name.hex()))))
            .clone()
    }
}

impl Default for Maps {
    fn default() -> Maps {
        Maps::new()
    }
}

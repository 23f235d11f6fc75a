use crate::conn::Connection;
use crate::slots::{SlotMap, SlotRange};
use crate::{probe, Store, StoreError};
use resp::{Frame, Redirect, Value};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

/// How often the reconnect worker checks a disconnected client.
pub const RECONNECT_INTERVAL: Duration = Duration::from_secs(2);

/// Redirections followed per request before giving up on the topology.
const MAX_REDIRECTS: usize = 16;

/// Connection lifecycle, as observed by the reconnect worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    /// Initial bootstrap has not completed yet.
    Setup,
    /// Slot map populated; requests are being served.
    Ready,
    /// A transport failed; awaiting the reconnect sequence.
    Disconnected,
}

/// One logical connection over a set of cluster nodes.
///
/// Cheap to clone; all clones share the slot map, the per-node connections
/// and the lifecycle state. Internal locks are only ever held between
/// suspension points, never across an await.
#[derive(Clone)]
pub struct StoreClient {
    inner: Arc<Inner>,
}

struct Inner {
    /// Seed endpoints from configuration, used before the slot map exists.
    endpoints: Vec<String>,
    slots: Mutex<SlotMap>,
    conns: Mutex<HashMap<String, Connection>>,
    /// Command name to first-key argument position, from the command probe.
    keymap: Mutex<HashMap<String, usize>>,
    state: Mutex<State>,
}

impl StoreClient {
    pub fn new(endpoints: Vec<String>) -> StoreClient {
        StoreClient {
            inner: Arc::new(Inner {
                endpoints,
                slots: Mutex::new(SlotMap::new()),
                conns: Mutex::new(HashMap::new()),
                keymap: Mutex::new(HashMap::new()),
                state: Mutex::new(State::Setup),
            }),
        }
    }

    pub fn state(&self) -> State {
        *self.inner.state.lock().unwrap()
    }

    /// The primary currently mapped for `slot`, for diagnostics and tests.
    pub fn slot_owner(&self, slot: u16) -> Option<String> {
        self.inner
            .slots
            .lock()
            .unwrap()
            .lookup(slot)
            .map(|range| range.primary.clone())
    }

    /// Issue `frame`, routing by `key` and following redirections. The
    /// caller sees only the final reply; `MOVED` targets are folded into
    /// the slot map as they are learned.
    pub async fn request(&self, key: Option<&[u8]>, frame: Frame) -> Result<Value, StoreError> {
        let mut target = self.target_for(key)?;
        let mut asking = false;

        for _ in 0..MAX_REDIRECTS {
            let conn = match self.connection(&target).await {
                Ok(conn) => conn,
                Err(err) => {
                    self.note_failure(&target, &err);
                    return Err(err);
                }
            };

            if asking {
                // One-shot permission for the next command on this node.
                if let Err(err) = conn.request(Frame::new("ASKING", 1)).await {
                    self.note_failure(&target, &err);
                    return Err(err);
                }
            }

            let reply = match conn.request(frame.clone()).await {
                Ok(reply) => reply,
                Err(err) => {
                    self.note_failure(&target, &err);
                    return Err(err);
                }
            };

            match Redirect::parse(&reply) {
                Some(redirect) => {
                    tracing::debug!(
                        command = frame.name(),
                        from = %target,
                        to = %redirect.addr,
                        slot = redirect.slot,
                        ask = redirect.ask,
                        "following cluster redirection",
                    );
                    if !redirect.ask {
                        self.inner
                            .slots
                            .lock()
                            .unwrap()
                            .insert(SlotRange::single(redirect.slot, redirect.addr.clone()));
                    }
                    asking = redirect.ask;
                    target = redirect.addr;
                }
                None => return Ok(reply),
            }
        }

        Err(StoreError::RedirectLoop(MAX_REDIRECTS))
    }

    /// Rebuild the slot map from the cluster topology. A store without
    /// cluster support yields a single range over the sole endpoint.
    pub async fn refresh_slots(&self) -> Result<(), StoreError> {
        let reply = self
            .request(None, Frame::new("CLUSTER", 2).arg("SLOTS"))
            .await?;

        let ranges = if reply.is_nocluster() {
            let addr = self
                .inner
                .endpoints
                .first()
                .cloned()
                .ok_or(StoreError::NoNode)?;
            vec![SlotRange::full(addr)]
        } else {
            probe::decode_slot_ranges(&reply)?
        };

        let mut slots = self.inner.slots.lock().unwrap();
        slots.clear();
        for range in ranges {
            slots.insert(range);
        }
        drop(slots);

        *self.inner.state.lock().unwrap() = State::Ready;
        Ok(())
    }

    /// Probe the command table for first-key positions, used to extract
    /// routing keys from commands this process did not compose itself.
    pub async fn load_keymap(&self) -> Result<(), StoreError> {
        let reply = self.request(None, Frame::new("COMMAND", 1)).await?;
        let keymap = probe::decode_command_keys(&reply);
        tracing::debug!(commands = keymap.len(), "loaded command key positions");
        *self.inner.keymap.lock().unwrap() = keymap;
        Ok(())
    }

    pub fn first_key_position(&self, command: &str) -> Option<usize> {
        self.inner.keymap.lock().unwrap().get(command).copied()
    }

    /// Probe the server version. Irregular replies are reported and yield
    /// version 0: the probe is best-effort and never blocks startup on its
    /// own.
    pub async fn server_version(&self) -> Result<u32, StoreError> {
        let reply = self
            .request(None, Frame::new("INFO", 2).arg("SERVER"))
            .await?;
        Ok(probe::parse_server_version(&reply))
    }

    fn target_for(&self, key: Option<&[u8]>) -> Result<String, StoreError> {
        let slots = self.inner.slots.lock().unwrap();
        let mapped = match key {
            Some(key) => slots.primary_for_key(key),
            None => slots.any_primary(),
        };
        match mapped {
            Some(addr) => Ok(addr.to_owned()),
            None => self
                .inner
                .endpoints
                .first()
                .cloned()
                .ok_or(StoreError::NoNode),
        }
    }

    async fn connection(&self, addr: &str) -> Result<Connection, StoreError> {
        if let Some(conn) = self.inner.conns.lock().unwrap().get(addr) {
            return Ok(conn.clone());
        }

        let weak: Weak<Inner> = Arc::downgrade(&self.inner);
        let lost_addr = addr.to_owned();
        let conn = Connection::dial(addr.to_owned(), move || {
            if let Some(inner) = weak.upgrade() {
                inner.conns.lock().unwrap().remove(&lost_addr);
                *inner.state.lock().unwrap() = State::Disconnected;
            }
        })
        .await?;

        self.inner
            .conns
            .lock()
            .unwrap()
            .insert(addr.to_owned(), conn.clone());
        Ok(conn)
    }

    fn note_failure(&self, addr: &str, err: &StoreError) {
        if !err.is_transient() {
            return;
        }
        tracing::warn!(%addr, error = %err, "store node failed");
        self.inner.conns.lock().unwrap().remove(addr);
        *self.inner.state.lock().unwrap() = State::Disconnected;
    }
}

#[async_trait::async_trait(?Send)]
impl Store for StoreClient {
    async fn request(&self, key: Option<&[u8]>, frame: Frame) -> Result<Value, StoreError> {
        StoreClient::request(self, key, frame).await
    }
}

/// Drive reconnection: every `interval`, a client observed in the
/// [`State::Disconnected`] state has `restore` re-run (typically the
/// bootstrap sequence). Runs until the surrounding task is dropped.
pub async fn reconnect_worker<F, Fut, E>(client: StoreClient, interval: Duration, restore: F)
where
    F: Fn() -> Fut,
    Fut: std::future::Future<Output = Result<(), E>>,
    E: std::fmt::Display,
{
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        ticker.tick().await;
        if client.state() != State::Disconnected {
            continue;
        }
        tracing::info!("attempting to reconnect to the store");
        if let Err(err) = restore().await {
            tracing::warn!(error = %err, "store reconnect attempt failed");
        }
    }
}

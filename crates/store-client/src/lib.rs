//! Client for the clustered key/value store backing the series index.
//!
//! A [`StoreClient`] presents one logical connection over a set of cluster
//! nodes: it computes the target node from a command's routing key, follows
//! `MOVED`/`ASK` redirections transparently, and survives node churn by
//! failing in-flight requests with a transient error and letting a periodic
//! worker re-run the bootstrap sequence.

use resp::{Frame, Value};

mod client;
mod conn;
mod probe;
mod slots;

pub mod testing;

pub use client::{reconnect_worker, State, StoreClient, RECONNECT_INTERVAL};
pub use probe::{decode_command_keys, decode_slot_ranges, parse_server_version};
pub use slots::{crc16, key_slot, SlotMap, SlotRange, SLOT_COUNT};

/// Store request failures, classified for retry decisions.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// Connect, read or write failed. Transient: the request may be retried
    /// once the reconnect sequence has run.
    #[error("store transport: {0}")]
    Transport(String),
    /// The peer sent bytes that do not decode, or a reply of the wrong shape.
    #[error(transparent)]
    Protocol(#[from] resp::ProtocolError),
    /// The connection went away before a reply was delivered.
    #[error("not connected to the store")]
    Disconnected,
    /// No endpoint is configured that could serve the request.
    #[error("no store node serves the request")]
    NoNode,
    /// The cluster kept redirecting; the topology is likely inconsistent.
    #[error("redirect limit exceeded after {0} hops")]
    RedirectLoop(usize),
}

impl StoreError {
    /// True when the failure may clear once connectivity is restored.
    pub fn is_transient(&self) -> bool {
        matches!(self, StoreError::Transport(_) | StoreError::Disconnected)
    }
}

/// The request seam between the ingestion pipeline and the backing store.
///
/// `key` is the routing key whose slot selects the target node; keyless
/// commands pass `None` and are served by any primary. The frame is owned by
/// the request and dropped once the reply is delivered; redirections are
/// followed internally, so the caller observes only the final reply.
#[async_trait::async_trait(?Send)]
pub trait Store {
    async fn request(&self, key: Option<&[u8]>, frame: Frame) -> Result<Value, StoreError>;
}

#[async_trait::async_trait(?Send)]
impl<S: Store + ?Sized> Store for &S {
    async fn request(&self, key: Option<&[u8]>, frame: Frame) -> Result<Value, StoreError> {
        (**self).request(key, frame).await
    }
}

#[async_trait::async_trait(?Send)]
impl<S: Store + ?Sized> Store for std::sync::Arc<S> {
    async fn request(&self, key: Option<&[u8]>, frame: Frame) -> Result<Value, StoreError> {
        (**self).request(key, frame).await
    }
}

//! The backing store's wire protocol.
//!
//! Commands travel as pre-encoded [`Frame`]s which the dispatch layer never
//! re-parses; replies arrive as dynamically-typed [`Value`]s which every
//! decoder must check for variant and arity before touching fields.

mod frame;
mod value;

pub mod codec;

pub use frame::Frame;
pub use value::{read, Redirect, Value};

/// A malformed or unexpected wire exchange.
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("unknown reply type marker {0:#04x}")]
    BadMarker(u8),
    #[error("malformed {0} header")]
    BadHeader(&'static str),
    #[error("{0} length {1} out of range")]
    BadLength(&'static str, i64),
    #[error("expected {expected} reply, got {got}")]
    UnexpectedKind {
        expected: &'static str,
        got: &'static str,
    },
    #[error("expected at least {expected} elements, got {got}")]
    Arity { expected: usize, got: usize },
    #[error("invalid utf-8 in {0} reply")]
    Utf8(&'static str),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

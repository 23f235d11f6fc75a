//! The content-addressed series schema and its ingest loader.
//!
//! Archive records become store writes here: names are interned under
//! stable content identifiers ([`maps`]), compound operations are phased
//! through [`baton`] barriers, and [`load`] issues the schema writes
//! themselves under the key namespace of [`keys`]. [`bootstrap`] sequences
//! the startup probes before any of that is allowed to run.

pub mod baton;
pub mod bootstrap;
pub mod keys;
pub mod load;
pub mod maps;
pub mod model;

pub mod testing;

pub use baton::{Baton, PhaseChain};
pub use bootstrap::{
    bootstrap, BootstrapError, BootstrapFlags, BootstrapOutcome, Script, ScriptRegistry,
    MIN_SERVER_VERSION, SERIES_VERSION,
};
pub use load::{LoadError, LoadOptions, Loader};
pub use maps::{MapDict, Maps};

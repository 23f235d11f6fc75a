//! Archive discovery: watch a logging directory, tail the archives it
//! holds, and feed their records into the series loader.
//!
//! The on-disk binary format is read through the [`ArchiveDecoder`] seam;
//! decoded records flow to a [`DiscoverSink`], of which [`SeriesSink`] is
//! the store-backed implementation.

use std::path::PathBuf;

mod archive;
mod driver;
mod filter;
mod records;
mod sink;

pub use archive::{Archive, ArchiveState, IndomChain};
pub use driver::{Discovery, DiscoverOptions};
pub use filter::ExcludeFilter;
pub use records::{
    ArchiveDecoder, Batch, DecodeError, LabelTarget, MetaRecord, TextClass, TextTarget,
    ValueRecord,
};
pub use sink::{DiscoverSink, SeriesSink};

#[derive(Debug, thiserror::Error)]
pub enum DiscoverError {
    #[error("archive directory {dir}: {source}")]
    Directory {
        dir: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

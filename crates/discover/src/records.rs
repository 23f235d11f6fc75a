//! The records an archive yields, and the seam to the binary-format reader.

use series_schema::model::{Context, Desc, InDom, Label, Name, Pmid, SampleValue, Timestamp};
use std::io;
use std::path::Path;

/// What a metadata label record attaches to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LabelTarget {
    Context,
    Domain(u32),
    Cluster(Pmid),
    Item(Pmid),
    Indom(InDom),
    /// One instance within a domain; label records arrive per instance.
    Instance(InDom, i32),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TextClass {
    OneLine,
    Help,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TextTarget {
    Metric(Pmid),
    Indom(InDom),
}

/// One record from an archive's metadata file.
#[derive(Debug)]
pub enum MetaRecord {
    /// The archive's source: host and context labels.
    Source { context: Context },
    /// A metric descriptor, with every name the metric is known under.
    Desc { names: Vec<Name>, desc: Desc },
    /// One instance-domain snapshot: (internal number, external name).
    Indom {
        stamp: Timestamp,
        indom: InDom,
        instances: Vec<(i32, String)>,
    },
    /// A label set for some target.
    Labels {
        target: LabelTarget,
        labels: Vec<Label>,
    },
    /// Help text; consumed by external indexers, cached nowhere here.
    HelpText {
        target: TextTarget,
        class: TextClass,
        text: String,
    },
}

/// One record from an archive's log volume.
#[derive(Debug)]
pub enum ValueRecord {
    Sample {
        stamp: Timestamp,
        values: Vec<(Pmid, SampleValue)>,
    },
    /// A discontinuity sentinel, carrying no metric values.
    Mark { stamp: Timestamp },
}

/// A record that could not be decoded; it is reported and skipped while
/// the archive stays watched.
#[derive(Debug, thiserror::Error)]
#[error("{0}")]
pub struct DecodeError(pub String);

/// A run of decoded records, each paired with the offset just past it, so
/// the driver resumes exactly where a dispatched record ended.
pub struct Batch<T> {
    pub records: Vec<(Result<T, DecodeError>, u64)>,
}

impl<T> Batch<T> {
    pub fn empty() -> Batch<T> {
        Batch {
            records: Vec::new(),
        }
    }
}

/// The boundary to the on-disk archive reader. Implementations decode the
/// logger's binary format; only complete records may be returned, and a
/// partial tail is left for the next call.
pub trait ArchiveDecoder {
    /// Decode metadata records from `offset` onward.
    fn read_meta(&mut self, path: &Path, offset: u64) -> io::Result<Batch<MetaRecord>>;

    /// Decode log-volume records from `offset` onward in volume `volume`.
    fn read_volume(&mut self, path: &Path, volume: u32, offset: u64)
        -> io::Result<Batch<ValueRecord>>;
}

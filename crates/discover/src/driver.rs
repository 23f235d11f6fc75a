//! The directory driver: scan for archives, tail the ones found, dispatch
//! whatever decodes to the sink, and keep per-archive offsets so nothing is
//! replayed and nothing is lost.

use crate::archive::{base_of, Archive, ArchiveState};
use crate::filter::ExcludeFilter;
use crate::records::{ArchiveDecoder, Batch, LabelTarget, MetaRecord, ValueRecord};
use crate::sink::DiscoverSink;
use crate::DiscoverError;
use series_schema::load::LoadError;
use series_schema::model::{Label, Metric};
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::time::Duration;

pub struct DiscoverOptions {
    /// The logging directory, scanned recursively.
    pub dir: PathBuf,
    pub poll_interval: Duration,
    pub filter: ExcludeFilter,
}

impl DiscoverOptions {
    pub fn new(dir: impl Into<PathBuf>) -> DiscoverOptions {
        DiscoverOptions {
            dir: dir.into(),
            poll_interval: Duration::from_secs(1),
            filter: ExcludeFilter::new(),
        }
    }
}

/// The discovery driver. One instance owns the archive registry; records
/// flow out through the sink on the same task that polls.
pub struct Discovery<D, K> {
    options: DiscoverOptions,
    decoder: D,
    sink: K,
    archives: HashMap<PathBuf, Archive>,
    purged: u64,
}

impl<D: ArchiveDecoder, K: DiscoverSink> Discovery<D, K> {
    /// The directory must at least be readable up front; everything later
    /// is retried from the poll loop.
    pub fn new(options: DiscoverOptions, decoder: D, sink: K) -> Result<Self, DiscoverError> {
        if let Err(source) = std::fs::read_dir(&options.dir) {
            return Err(DiscoverError::Directory {
                dir: options.dir.clone(),
                source,
            });
        }
        Ok(Discovery {
            options,
            decoder,
            sink,
            archives: HashMap::new(),
            purged: 0,
        })
    }

    pub fn sink(&self) -> &K {
        &self.sink
    }

    pub fn archive(&self, base: &Path) -> Option<&Archive> {
        self.archives.get(base)
    }

    /// Archives currently watched.
    pub fn monitored(&self) -> usize {
        self.archives.len()
    }

    /// Archives dropped because their files went away.
    pub fn purged(&self) -> u64 {
        self.purged
    }

    /// Poll forever at the configured interval.
    pub async fn run(mut self) {
        loop {
            self.poll().await;
            tokio::time::sleep(self.options.poll_interval).await;
        }
    }

    /// One scan round: register new archives, purge vanished ones, pump
    /// the rest.
    pub async fn poll(&mut self) {
        let found = match scan(&self.options.dir) {
            Ok(found) => found,
            Err(err) => {
                tracing::warn!(dir = %self.options.dir.display(), error = %err, "scan failed");
                return;
            }
        };

        for base in &found {
            if !self.archives.contains_key(base) {
                tracing::info!(archive = %base.display(), "watching archive");
                self.archives.insert(base.clone(), Archive::new(base.clone()));
            }
        }

        let missing: Vec<PathBuf> = self
            .archives
            .keys()
            .filter(|base| !found.contains(*base))
            .cloned()
            .collect();
        for base in missing {
            if let Some(mut archive) = self.archives.remove(&base) {
                archive.state = ArchiveState::Purged;
                self.purged += 1;
                tracing::info!(archive = %base.display(), "archive purged");
                if let Some(context) = &archive.context {
                    if let Err(err) = self.sink.on_closed(context).await {
                        tracing::warn!(error = %err, "close notification failed");
                    }
                }
            }
        }

        let bases: Vec<PathBuf> = self.archives.keys().cloned().collect();
        for base in bases {
            if let Some(archive) = self.archives.get_mut(&base) {
                pump(&self.sink, &self.options.filter, &mut self.decoder, archive).await;
            }
        }
    }
}

fn scan(dir: &Path) -> std::io::Result<HashSet<PathBuf>> {
    let mut found = HashSet::new();
    let mut stack = vec![dir.to_path_buf()];
    // The top-level directory must scan; subdirectories are best-effort.
    let top = std::mem::replace(&mut stack, Vec::new());
    for dir in top {
        scan_one(&dir, &mut found, &mut stack)?;
    }
    while let Some(dir) = stack.pop() {
        if let Err(err) = scan_one(&dir, &mut found, &mut stack) {
            tracing::warn!(dir = %dir.display(), error = %err, "skipping unreadable directory");
        }
    }
    Ok(found)
}

fn scan_one(
    dir: &Path,
    found: &mut HashSet<PathBuf>,
    stack: &mut Vec<PathBuf>,
) -> std::io::Result<()> {
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        if entry.file_type()?.is_dir() {
            stack.push(path);
        } else if let Some(base) = base_of(&path) {
            found.insert(base);
        }
    }
    Ok(())
}

fn file_len(path: &Path) -> u64 {
    std::fs::metadata(path).map(|meta| meta.len()).unwrap_or(0)
}

// Tail one archive: new metadata first, then log volumes, rolling into the
// next volume when the current one is drained.
async fn pump<D: ArchiveDecoder, K: DiscoverSink>(
    sink: &K,
    filter: &ExcludeFilter,
    decoder: &mut D,
    archive: &mut Archive,
) {
    let meta_path = archive.meta_path();
    if file_len(&meta_path) > archive.meta_offset {
        let batch = match decoder.read_meta(&meta_path, archive.meta_offset) {
            Ok(batch) => batch,
            Err(err) => {
                tracing::warn!(path = %meta_path.display(), error = %err, "metadata read failed");
                return;
            }
        };
        if !dispatch_meta_batch(sink, filter, archive, batch).await {
            return;
        }
        activate(archive);
    }

    loop {
        let volume_path = archive.volume_path(archive.volume);
        let mut progressed = false;

        if file_len(&volume_path) > archive.volume_offset {
            let batch =
                match decoder.read_volume(&volume_path, archive.volume, archive.volume_offset) {
                    Ok(batch) => batch,
                    Err(err) => {
                        tracing::warn!(path = %volume_path.display(), error = %err, "volume read failed");
                        return;
                    }
                };
            let before = archive.volume_offset;
            if !dispatch_value_batch(sink, archive, batch).await {
                return;
            }
            progressed = archive.volume_offset > before;
            activate(archive);
        }

        // Roll into the next volume once this one is fully consumed.
        let next = archive.volume_path(archive.volume + 1);
        if next.exists() && file_len(&volume_path) <= archive.volume_offset {
            tracing::debug!(archive = %archive.base.display(), volume = archive.volume + 1, "volume change");
            archive.volume += 1;
            archive.volume_offset = 0;
            progressed = true;
        }

        if !progressed {
            return;
        }
    }
}

fn activate(archive: &mut Archive) {
    if archive.state == ArchiveState::New {
        tracing::debug!(archive = %archive.base.display(), "archive active");
        archive.state = ArchiveState::Active;
    }
}

// Returns false when pumping should stop so a transiently-failed record is
// retried at its unadvanced offset after the store reconnects.
async fn dispatch_meta_batch<K: DiscoverSink>(
    sink: &K,
    filter: &ExcludeFilter,
    archive: &mut Archive,
    batch: Batch<MetaRecord>,
) -> bool {
    for (record, end) in batch.records {
        match record {
            Err(err) => {
                tracing::error!(
                    archive = %archive.base.display(),
                    error = %err,
                    "skipping undecodable metadata record",
                );
                archive.meta_offset = end;
            }
            Ok(record) => match dispatch_meta(sink, filter, archive, record).await {
                Ok(()) => archive.meta_offset = end,
                Err(err) if err.is_transient() => {
                    tracing::warn!(
                        archive = %archive.base.display(),
                        error = %err,
                        "store unavailable, metadata record will be retried",
                    );
                    return false;
                }
                Err(err) => {
                    tracing::error!(
                        archive = %archive.base.display(),
                        error = %err,
                        "metadata record failed, skipping",
                    );
                    archive.meta_offset = end;
                }
            },
        }
    }
    true
}

async fn dispatch_meta<K: DiscoverSink>(
    sink: &K,
    filter: &ExcludeFilter,
    archive: &mut Archive,
    record: MetaRecord,
) -> Result<(), LoadError> {
    match record {
        MetaRecord::Source { context } => {
            sink.on_source(&context).await?;
            archive.context = Some(context);
            Ok(())
        }
        MetaRecord::Desc { names, desc } => {
            let context = match archive.context.as_ref() {
                Some(context) => context,
                None => {
                    tracing::warn!(archive = %archive.base.display(), "descriptor before source");
                    return Ok(());
                }
            };
            if names.is_empty() {
                tracing::warn!(pmid = %desc.pmid, "descriptor without names");
                return Ok(());
            }
            if filter.excludes_metric(names.iter().map(|name| name.text.as_str())) {
                tracing::debug!(metric = %names[0].text, "excluded metric");
                return Ok(());
            }
            if let Some(indom) = desc.indom {
                if filter.excludes_indom(indom) {
                    tracing::debug!(metric = %names[0].text, %indom, "excluded instance domain");
                    return Ok(());
                }
            }
            match archive.metrics.get(&desc.pmid) {
                // Descriptors are write-once: same again is fine, different
                // is an error and the record is dropped.
                Some(have) if have.desc == desc => return Ok(()),
                Some(_) => return Err(LoadError::DescConflict(names[0].text.clone())),
                None => {}
            }

            let mut metric = Metric::new(context, names, desc, Vec::new());
            sink.on_metric(context, &mut metric).await?;
            archive.metrics.insert(desc.pmid, metric);
            Ok(())
        }
        MetaRecord::Indom {
            stamp,
            indom,
            instances,
        } => {
            if filter.excludes_indom(indom) {
                return Ok(());
            }
            let context = match archive.context.as_ref() {
                Some(context) => context,
                None => {
                    tracing::warn!(archive = %archive.base.display(), "indom before source");
                    return Ok(());
                }
            };
            let chain = archive.indoms.entry(indom).or_default();
            let domain = chain.advance(context, stamp, instances);
            sink.on_indom(context, indom, domain).await
        }
        MetaRecord::Labels { target, labels } => {
            apply_labels(archive, target, labels);
            let context = match archive.context.as_ref() {
                Some(context) => context,
                None => return Ok(()),
            };
            sink.on_labels(context, target).await
        }
        MetaRecord::HelpText {
            target,
            class,
            text,
        } => {
            let context = match archive.context.as_ref() {
                Some(context) => context,
                None => return Ok(()),
            };
            sink.on_text(context, target, class, &text).await
        }
    }
}

// Attach a decoded label set to its target in the archive cache. Targets
// that have published already are marked uncached so the next record
// re-publishes them with their labels.
fn apply_labels(archive: &mut Archive, target: LabelTarget, labels: Vec<Label>) {
    let attach = |metric: &mut Metric, labels: &[Label]| {
        for label in labels {
            // First write of a label name wins.
            if !metric
                .labels
                .iter()
                .any(|have| have.name.text == label.name.text)
            {
                metric.labels.push(label.clone());
            }
        }
        metric.cached = false;
    };

    match target {
        LabelTarget::Context => {
            if let Some(context) = archive.context.as_mut() {
                context.labels.extend(labels);
            }
        }
        LabelTarget::Domain(domain) => {
            for metric in archive.metrics.values_mut() {
                if metric.desc.pmid.domain() == domain {
                    attach(metric, &labels);
                }
            }
        }
        LabelTarget::Cluster(pmid) => {
            for metric in archive.metrics.values_mut() {
                if metric.desc.pmid.domain() == pmid.domain()
                    && metric.desc.pmid.cluster() == pmid.cluster()
                {
                    attach(metric, &labels);
                }
            }
        }
        LabelTarget::Item(pmid) => {
            if let Some(metric) = archive.metrics.get_mut(&pmid) {
                attach(metric, &labels);
            }
        }
        LabelTarget::Indom(_) => {
            // Domain-level labels feed external indexers only.
        }
        LabelTarget::Instance(indom, inst) => {
            let instance = archive
                .indoms
                .get_mut(&indom)
                .and_then(|chain| chain.current_mut())
                .and_then(|domain| domain.instances.get_mut(&inst));
            if let Some(instance) = instance {
                for label in labels {
                    if !instance
                        .labels
                        .iter()
                        .any(|have| have.name.text == label.name.text)
                    {
                        instance.labels.push(label);
                    }
                }
                instance.cached = false;
            }
        }
    }
}

async fn dispatch_value_batch<K: DiscoverSink>(
    sink: &K,
    archive: &mut Archive,
    batch: Batch<ValueRecord>,
) -> bool {
    for (record, end) in batch.records {
        match record {
            Err(err) => {
                tracing::error!(
                    archive = %archive.base.display(),
                    error = %err,
                    "skipping undecodable value record",
                );
                archive.volume_offset = end;
            }
            Ok(record) => match dispatch_value(sink, archive, record).await {
                Ok(()) => archive.volume_offset = end,
                Err(err) if err.is_transient() => {
                    tracing::warn!(
                        archive = %archive.base.display(),
                        error = %err,
                        "store unavailable, value record will be retried",
                    );
                    return false;
                }
                Err(err) => {
                    tracing::error!(
                        archive = %archive.base.display(),
                        error = %err,
                        "value record failed, skipping",
                    );
                    archive.volume_offset = end;
                }
            },
        }
    }
    true
}

async fn dispatch_value<K: DiscoverSink>(
    sink: &K,
    archive: &mut Archive,
    record: ValueRecord,
) -> Result<(), LoadError> {
    match record {
        ValueRecord::Mark { stamp } => {
            let context = match archive.context.as_ref() {
                Some(context) => context,
                None => return Ok(()),
            };
            sink.on_mark(context, &stamp).await?;
            if archive.state != ArchiveState::Closed {
                tracing::debug!(archive = %archive.base.display(), "archive closed by its logger");
                archive.state = ArchiveState::Closed;
                sink.on_closed(context).await?;
            }
            Ok(())
        }
        ValueRecord::Sample { stamp, values } => {
            // A sample after a mark means the logger resumed.
            if archive.state == ArchiveState::Closed {
                archive.state = ArchiveState::Active;
            }
            for (pmid, value) in values {
                let Archive {
                    context,
                    metrics,
                    indoms,
                    ..
                } = &mut *archive;
                let context = match context.as_ref() {
                    Some(context) => context,
                    None => return Ok(()),
                };
                let metric = match metrics.get_mut(&pmid) {
                    Some(metric) => metric,
                    None => {
                        tracing::debug!(%pmid, "value for unknown or excluded metric");
                        continue;
                    }
                };
                let domain = metric
                    .desc
                    .indom
                    .and_then(|indom| indoms.get_mut(&indom))
                    .and_then(|chain| chain.current_mut());
                sink.on_values(context, metric, domain, &stamp, &value).await?;
            }
            Ok(())
        }
    }
}

//! Per-archive tracking: read offsets, the metric and instance-domain
//! caches, and the lifecycle state machine.

use series_schema::model::{Context, InDom, Instance, InstanceDomain, Metric, Name, Pmid, Timestamp};
use std::collections::HashMap;
use std::path::{Path, PathBuf};

/// Lifecycle of a watched archive.
///
/// `New` archives have been seen but not read; a successful pump makes them
/// `Active`. Archives whose files disappear are `Purged` and dropped; a
/// mark record parks an archive `Closed` until its files grow again.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArchiveState {
    New,
    Active,
    Purged,
    Closed,
}

/// The chronological chain of instance-domain versions, newest last.
///
/// A snapshot whose membership matches the current version is absorbed into
/// it (the list is append-only within a version); any change in membership
/// appends a new time-stamped version, carrying over the published state of
/// instances that survived.
#[derive(Debug, Default)]
pub struct IndomChain {
    versions: Vec<(Timestamp, InstanceDomain)>,
}

impl IndomChain {
    pub fn new() -> IndomChain {
        IndomChain::default()
    }

    pub fn versions(&self) -> usize {
        self.versions.len()
    }

    pub fn current(&self) -> Option<&InstanceDomain> {
        self.versions.last().map(|(_, domain)| domain)
    }

    pub fn current_mut(&mut self) -> Option<&mut InstanceDomain> {
        self.versions.last_mut().map(|(_, domain)| domain)
    }

    /// Fold one decoded snapshot into the chain.
    pub fn advance(
        &mut self,
        context: &Context,
        stamp: Timestamp,
        instances: Vec<(i32, String)>,
    ) -> &InstanceDomain {
        let unchanged = match self.versions.last() {
            Some((_, current)) => {
                instances.len() == current.instances.len()
                    && instances.iter().all(|(inst, name)| {
                        current
                            .instance(*inst)
                            .map_or(false, |have| have.name.text == *name)
                    })
            }
            None => false,
        };

        if !unchanged {
            let mut next = InstanceDomain::new();
            for (inst, name) in instances {
                let mut instance = Instance::new(context, inst, Name::new(name));
                // Instances surviving from the previous version keep their
                // published state and labels.
                if let Some(previous) = self
                    .versions
                    .last()
                    .and_then(|(_, domain)| domain.instance(inst))
                {
                    if previous.name.id == instance.name.id {
                        instance.cached = previous.cached;
                        instance.labels = previous.labels.clone();
                    }
                }
                next.insert(instance);
            }
            self.versions.push((stamp, next));
        }

        &self.versions.last().expect("at least one version").1
    }
}

/// One watched archive and everything remembered about it.
#[derive(Debug)]
pub struct Archive {
    pub base: PathBuf,
    pub state: ArchiveState,
    pub meta_offset: u64,
    pub volume: u32,
    pub volume_offset: u64,
    pub context: Option<Context>,
    pub metrics: HashMap<Pmid, Metric>,
    pub indoms: HashMap<InDom, IndomChain>,
}

impl Archive {
    pub fn new(base: PathBuf) -> Archive {
        Archive {
            base,
            state: ArchiveState::New,
            meta_offset: 0,
            volume: 0,
            volume_offset: 0,
            context: None,
            metrics: HashMap::new(),
            indoms: HashMap::new(),
        }
    }

    pub fn meta_path(&self) -> PathBuf {
        self.base.with_extension("meta")
    }

    pub fn volume_path(&self, volume: u32) -> PathBuf {
        self.base.with_extension(volume.to_string())
    }
}

/// `foo.meta` names the archive `foo`; anything else is not an archive.
pub(crate) fn base_of(path: &Path) -> Option<PathBuf> {
    if path.extension() == Some(std::ffi::OsStr::new("meta")) {
        Some(path.with_extension(""))
    } else {
        None
    }
}

//! Record exclusion, from the `[discover]` configuration section.

use series_schema::model::InDom;
use std::collections::HashSet;

/// Glob patterns over metric names and explicit instance-domain ids that
/// keep records out of the pipeline before dispatch.
#[derive(Debug, Default)]
pub struct ExcludeFilter {
    patterns: Vec<glob::Pattern>,
    indoms: HashSet<InDom>,
}

impl ExcludeFilter {
    pub fn new() -> ExcludeFilter {
        ExcludeFilter::default()
    }

    /// Parse the comma-separated option values. Unparseable entries are
    /// reported and dropped; filtering is best-effort configuration, not a
    /// reason to refuse startup.
    pub fn parse(metrics: Option<&str>, indoms: Option<&str>) -> ExcludeFilter {
        let mut filter = ExcludeFilter::new();

        for entry in metrics.unwrap_or("").split(',') {
            let entry = entry.trim();
            if entry.is_empty() {
                continue;
            }
            match glob::Pattern::new(entry) {
                Ok(pattern) => filter.patterns.push(pattern),
                Err(err) => {
                    tracing::warn!(pattern = entry, error = %err, "bad metric exclude pattern")
                }
            }
        }

        for entry in indoms.unwrap_or("").split(',') {
            let entry = entry.trim();
            if entry.is_empty() {
                continue;
            }
            match entry.parse::<InDom>() {
                Ok(indom) => {
                    filter.indoms.insert(indom);
                }
                Err(_) => tracing::warn!(indom = entry, "bad indom exclude entry"),
            }
        }

        filter
    }

    pub fn is_empty(&self) -> bool {
        self.patterns.is_empty() && self.indoms.is_empty()
    }

    /// True when any of the metric's names is excluded.
    pub fn excludes_metric<'n>(&self, mut names: impl Iterator<Item = &'n str>) -> bool {
        names.any(|name| self.patterns.iter().any(|pattern| pattern.matches(name)))
    }

    pub fn excludes_indom(&self, indom: InDom) -> bool {
        self.indoms.contains(&indom)
    }
}

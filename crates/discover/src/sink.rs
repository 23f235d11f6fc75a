//! Where decoded records go. The driver is format-shaped, the sink is
//! store-shaped; [`SeriesSink`] is the bridge onto the ingest loader.

use crate::records::{LabelTarget, TextClass, TextTarget};
use series_schema::load::{LoadError, Loader};
use series_schema::model::{Context, InDom, InstanceDomain, Metric, SampleValue, Timestamp};
use store_client::Store;

/// Callbacks the discovery driver dispatches records to. Implementations
/// may ignore whatever they do not consume; only the load-bearing paths
/// are required.
#[async_trait::async_trait(?Send)]
pub trait DiscoverSink {
    /// A new source was observed.
    async fn on_source(&self, context: &Context) -> Result<(), LoadError>;

    /// A descriptor record; the metric is fresh in the archive cache.
    async fn on_metric(&self, context: &Context, metric: &mut Metric) -> Result<(), LoadError>;

    /// An instance-domain snapshot was folded into the archive cache.
    async fn on_indom(
        &self,
        _context: &Context,
        _indom: InDom,
        _domain: &InstanceDomain,
    ) -> Result<(), LoadError> {
        Ok(())
    }

    /// A label record was attached to its target in the archive cache.
    async fn on_labels(&self, _context: &Context, _target: LabelTarget) -> Result<(), LoadError> {
        Ok(())
    }

    /// Help text, for external indexers.
    async fn on_text(
        &self,
        _context: &Context,
        _target: TextTarget,
        _class: TextClass,
        _text: &str,
    ) -> Result<(), LoadError> {
        Ok(())
    }

    /// A value sample for one metric.
    async fn on_values(
        &self,
        context: &Context,
        metric: &mut Metric,
        domain: Option<&mut InstanceDomain>,
        stamp: &Timestamp,
        value: &SampleValue,
    ) -> Result<(), LoadError>;

    /// A discontinuity sentinel.
    async fn on_mark(&self, context: &Context, stamp: &Timestamp) -> Result<(), LoadError>;

    /// The archive stopped: closed by its logger or no longer present.
    async fn on_closed(&self, _context: &Context) -> Result<(), LoadError> {
        Ok(())
    }
}

/// The store-backed sink: records become schema writes via the loader.
pub struct SeriesSink<S> {
    loader: Loader<S>,
}

impl<S: Store> SeriesSink<S> {
    pub fn new(loader: Loader<S>) -> SeriesSink<S> {
        SeriesSink { loader }
    }

    pub fn loader(&self) -> &Loader<S> {
        &self.loader
    }
}

#[async_trait::async_trait(?Send)]
impl<S: Store> DiscoverSink for SeriesSink<S> {
    async fn on_source(&self, context: &Context) -> Result<(), LoadError> {
        self.loader.load_source(context).await
    }

    async fn on_metric(&self, context: &Context, metric: &mut Metric) -> Result<(), LoadError> {
        self.loader.load_metric(context, metric, None, None).await
    }

    async fn on_values(
        &self,
        context: &Context,
        metric: &mut Metric,
        domain: Option<&mut InstanceDomain>,
        stamp: &Timestamp,
        value: &SampleValue,
    ) -> Result<(), LoadError> {
        self.loader
            .load_metric(context, metric, domain, Some((stamp, value)))
            .await
    }

    async fn on_mark(&self, context: &Context, stamp: &Timestamp) -> Result<(), LoadError> {
        self.loader.load_mark(context, stamp).await
    }
}

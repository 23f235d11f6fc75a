//! The ingest loader: archive records in, store writes out.
//!
//! Each record runs as a chain of barriered phases: every name it touches
//! is interned first, then the metadata that describes its series, and only
//! once all of those replies are in do the value streams get appended. A
//! sample can therefore never reference a series whose descriptor, source,
//! instances or labels are not yet visible.

use crate::baton::Baton;
use crate::keys;
use crate::maps::Maps;
use crate::model::{Context, InstanceDomain, Label, Metric, SampleValue, Timestamp};
use resp::{Frame, Value};
use seriesid::Id;
use std::sync::Arc;
use store_client::{Store, StoreError};

/// Ingest failures, classified for the discovery driver's retry decision.
#[derive(Debug, thiserror::Error)]
pub enum LoadError {
    #[error(transparent)]
    Store(#[from] StoreError),
    /// The store rejected a command outright.
    #[error("{command}: {message}")]
    Failed {
        command: &'static str,
        message: String,
    },
    /// A descriptor was re-published with different fields.
    #[error("conflicting descriptor for metric {0}")]
    DescConflict(String),
}

impl LoadError {
    /// True when the record should be retried after the store reconnects.
    pub fn is_transient(&self) -> bool {
        matches!(self, LoadError::Store(err) if err.is_transient())
    }
}

/// Stream bounds, from the `[pmseries]` configuration section.
#[derive(Debug, Clone, Copy)]
pub struct LoadOptions {
    /// `MAXLEN ~` bound per series stream.
    pub stream_maxlen: u32,
    /// Per-stream TTL bump, in seconds.
    pub stream_expire: u64,
}

impl Default for LoadOptions {
    fn default() -> LoadOptions {
        LoadOptions {
            stream_maxlen: 8640,
            stream_expire: 86400,
        }
    }
}

/// Translates archive records into store operations keyed by content
/// identifiers. Holds no per-archive state of its own: cached-flags live on
/// the metric and instance structures the discovery layer owns.
pub struct Loader<S> {
    store: S,
    maps: Arc<Maps>,
    options: LoadOptions,
}

impl<S: Store> Loader<S> {
    pub fn new(store: S, maps: Arc<Maps>, options: LoadOptions) -> Loader<S> {
        Loader {
            store,
            maps,
            options,
        }
    }

    pub fn maps(&self) -> &Arc<Maps> {
        &self.maps
    }

    /// Register a source: its names are interned and the source identity is
    /// linked from both its external name and its host.
    pub async fn load_source(&self, context: &Context) -> Result<(), LoadError> {
        {
            let mut baton: Baton<'_, LoadError> = Baton::new("source mapping");
            baton.spawn(
                self.maps
                    .contexts
                    .ensure(&self.store, context.name.id, &context.name.text),
            );
            baton.spawn(
                self.maps
                    .contexts
                    .ensure(&self.store, context.hostid, &context.host),
            );
            for label in &context.labels {
                self.spawn_label_mapping(&mut baton, label);
            }
            baton.quiesce().await?;
        }

        let source = context.source.as_bytes().to_vec();
        let mut baton: Baton<'_, LoadError> = Baton::new("source registration");
        baton.spawn(self.sadd(
            keys::source_context_name(&context.name.id.hex()),
            vec![source.clone()],
        ));
        baton.spawn(self.sadd(
            keys::source_context_name(&context.hostid.hex()),
            vec![source.clone()],
        ));
        baton.spawn(self.sadd(
            keys::context_name_source(&context.source.hex()),
            vec![
                context.name.id.as_bytes().to_vec(),
                context.hostid.as_bytes().to_vec(),
            ],
        ));
        if let Some((latitude, longitude)) = context.location {
            baton.spawn(self.geoadd(keys::SOURCE_LOCATION, longitude, latitude, source));
        }
        baton.quiesce().await
    }

    /// Load one metric record: metadata when it is not yet cached, values
    /// when a sample is present. Phases quiesce in order, so the stream
    /// append is issued strictly after every metadata reply has arrived.
    pub async fn load_metric(
        &self,
        context: &Context,
        metric: &mut Metric,
        mut domain: Option<&mut InstanceDomain>,
        sample: Option<(&Timestamp, &SampleValue)>,
    ) -> Result<(), LoadError> {
        let inst_values = match sample {
            Some((_, SampleValue::Instances(values))) => Some(values.as_slice()),
            _ => None,
        };

        // Interning: metric names, instance names, label names and values.
        {
            let domain_ref = domain.as_deref();
            let mut baton: Baton<'_, LoadError> = Baton::new("series mapping");
            if !metric.cached {
                for sn in &metric.names {
                    baton.spawn(self.maps.metric_names.ensure(
                        &self.store,
                        sn.name.id,
                        &sn.name.text,
                    ));
                }
                if inst_values.is_none() {
                    for label in &metric.labels {
                        self.spawn_label_mapping(&mut baton, label);
                    }
                }
            }
            if let (Some(domain_ref), Some(values)) = (domain_ref, inst_values) {
                for (inst, _) in values {
                    let instance = match domain_ref.instance(*inst) {
                        Some(instance) => instance,
                        None => {
                            tracing::debug!(inst, "value for an instance not in the domain");
                            continue;
                        }
                    };
                    baton.spawn(self.maps.instance_names.ensure(
                        &self.store,
                        instance.name.id,
                        &instance.name.text,
                    ));
                    if !instance.cached {
                        for label in &instance.labels {
                            self.spawn_label_mapping(&mut baton, label);
                        }
                    }
                }
            }
            baton.quiesce().await?;
        }

        // Metadata: descriptor, name and source links, instances, labels.
        let series_members: Vec<Vec<u8>> = metric
            .names
            .iter()
            .map(|sn| sn.series.as_bytes().to_vec())
            .collect();
        let mut published_instances: Vec<i32> = Vec::new();
        {
            let domain_ref = domain.as_deref();
            let mut baton: Baton<'_, LoadError> = Baton::new("series metadata");

            if !metric.cached {
                let indom = metric.desc.indom_str();
                let pmid = metric.desc.pmid.to_string();
                let units = metric.desc.units.to_string();

                for sn in &metric.names {
                    baton.spawn(self.sadd(
                        keys::series_metric_name(&sn.name.id.hex()),
                        vec![sn.series.as_bytes().to_vec()],
                    ));
                    baton.spawn(self.sadd(
                        keys::metric_name_series(&sn.series.hex()),
                        vec![sn.name.id.as_bytes().to_vec()],
                    ));
                    baton.spawn(self.hmset(
                        keys::desc_series(&sn.series.hex()),
                        vec![
                            (b"indom".to_vec(), indom.clone().into_bytes()),
                            (b"pmid".to_vec(), pmid.clone().into_bytes()),
                            (
                                b"semantics".to_vec(),
                                metric.desc.semantics.as_str().into(),
                            ),
                            (b"source".to_vec(), context.source.as_bytes().to_vec()),
                            (b"type".to_vec(), metric.desc.value_type.as_str().into()),
                            (b"units".to_vec(), units.clone().into_bytes()),
                        ],
                    ));
                }
                baton.spawn(self.sadd(
                    keys::series_context_name(&context.source.hex()),
                    series_members.clone(),
                ));

                if inst_values.is_none() {
                    for label in &metric.labels {
                        for sn in &metric.names {
                            self.spawn_label_writes(&mut baton, label, sn.series, &series_members);
                        }
                    }
                }
            }

            if let (Some(domain_ref), Some(values)) = (domain_ref, inst_values) {
                for (inst, _) in values {
                    let instance = match domain_ref.instance(*inst) {
                        Some(instance) => instance,
                        None => continue,
                    };
                    if instance.cached && metric.cached {
                        continue;
                    }
                    published_instances.push(*inst);

                    baton.spawn(self.sadd(
                        keys::series_inst_name(&instance.name.id.hex()),
                        series_members.clone(),
                    ));
                    for sn in &metric.names {
                        baton.spawn(self.sadd(
                            keys::instances_series(&sn.series.hex()),
                            vec![instance.series.as_bytes().to_vec()],
                        ));
                    }
                    baton.spawn(self.hmset(
                        keys::inst_series(&instance.series.hex()),
                        vec![
                            (b"inst".to_vec(), instance.inst.to_string().into_bytes()),
                            (b"name".to_vec(), instance.name.id.as_bytes().to_vec()),
                            (b"source".to_vec(), context.source.as_bytes().to_vec()),
                        ],
                    ));
                    for label in &instance.labels {
                        self.spawn_label_writes(&mut baton, label, instance.series, &series_members);
                    }
                }
            }
            baton.quiesce().await?;
        }
        metric.cached = true;
        if let Some(domain) = domain.as_deref_mut() {
            for inst in published_instances {
                if let Some(instance) = domain.instances.get_mut(&inst) {
                    instance.cached = true;
                }
            }
        }

        // Values: one stream append per series name, then the TTL bump.
        // Field values format through Atom::render: integers in full,
        // floats in exponent form, text and aggregates verbatim, events as
        // the not-yet-implemented code.
        if let Some((stamp, value)) = sample {
            let domain_ref = domain.as_deref();
            let fields: Vec<(Vec<u8>, String)> = match value {
                SampleValue::Error(code) => vec![(b"-1".to_vec(), code.to_string())],
                SampleValue::Scalar(atom) => vec![(Vec::new(), atom.render())],
                SampleValue::Instances(values) if values.is_empty() => {
                    vec![(b"0".to_vec(), "0".to_owned())]
                }
                SampleValue::Instances(values) => {
                    let mut fields = Vec::with_capacity(values.len());
                    for (inst, atom) in values {
                        let instance = match domain_ref.and_then(|domain| domain.instance(*inst)) {
                            Some(instance) => instance,
                            None => continue,
                        };
                        fields.push((instance.name.id.as_bytes().to_vec(), atom.render()));
                    }
                    fields
                }
            };

            let stamp = stamp.to_string();
            let mut baton: Baton<'_, LoadError> = Baton::new("series values");
            for sn in &metric.names {
                let key = keys::values_series(&sn.series.hex());
                baton.spawn(self.xadd(key.clone(), stamp.clone(), fields.clone()));
                baton.spawn(self.expire(key));
            }
            baton.quiesce().await?;
        }

        Ok(())
    }

    /// A mark record notes a discontinuity in the sample stream. It carries
    /// no metric values and nothing is persisted for it yet; acknowledging
    /// it lets the archive offset advance past the record.
    pub async fn load_mark(&self, context: &Context, stamp: &Timestamp) -> Result<(), LoadError> {
        tracing::debug!(source = %context.source, stamp = %stamp, "mark record");
        Ok(())
    }

    // Intern one label: its name, and its value under the per-name class.
    fn spawn_label_mapping<'a>(&'a self, baton: &mut Baton<'a, LoadError>, label: &'a Label) {
        baton.spawn(
            self.maps
                .label_names
                .ensure(&self.store, label.name.id, &label.name.text),
        );
        let values = self.maps.label_values(&label.name.id);
        let store = &self.store;
        let value_id = label.value_id;
        baton.spawn(async move { values.ensure(store, value_id, &label.value).await });
    }

    // The four writes that attach one label to one series-or-instance hash.
    fn spawn_label_writes<'a>(
        &'a self,
        baton: &mut Baton<'a, LoadError>,
        label: &'a Label,
        target: Id,
        series_members: &[Vec<u8>],
    ) {
        let target = target.hex();
        // Context labels describe the source, not the series: no flags.
        if !label.flags.context_only() {
            baton.spawn(self.hmset(
                keys::labelflags_series(&target),
                vec![(
                    label.name.id.as_bytes().to_vec(),
                    label.flags.bits().to_string().into_bytes(),
                )],
            ));
        }
        baton.spawn(self.hmset(
            keys::labelvalue_series(&target),
            vec![(
                label.name.id.as_bytes().to_vec(),
                label.value_id.as_bytes().to_vec(),
            )],
        ));
        baton.spawn(self.hmset(
            keys::map(&keys::label_value_class(&label.name.id.hex())),
            vec![(
                label.value_id.as_bytes().to_vec(),
                label.value.clone().into_bytes(),
            )],
        ));
        baton.spawn(self.sadd(
            keys::series_label_value(&label.name.id.hex(), &label.value_id.hex()),
            series_members.to_vec(),
        ));
    }

    async fn sadd(&self, key: String, members: Vec<Vec<u8>>) -> Result<(), LoadError> {
        let mut frame = Frame::new("SADD", 2 + members.len()).arg(&key);
        for member in &members {
            frame = frame.arg(member);
        }
        let reply = self.store.request(Some(key.as_bytes()), frame).await?;
        check_integer("SADD", &reply)?;
        Ok(())
    }

    async fn hmset(&self, key: String, pairs: Vec<(Vec<u8>, Vec<u8>)>) -> Result<(), LoadError> {
        let mut frame = Frame::new("HMSET", 2 + pairs.len() * 2).arg(&key);
        for (field, value) in &pairs {
            frame = frame.arg(field).arg(value);
        }
        let reply = self.store.request(Some(key.as_bytes()), frame).await?;
        check_status("HMSET", &reply)
    }

    async fn geoadd(
        &self,
        key: &'static str,
        longitude: f64,
        latitude: f64,
        member: Vec<u8>,
    ) -> Result<(), LoadError> {
        let frame = Frame::new("GEOADD", 5)
            .arg(key)
            .arg(format!("{:.8}", longitude))
            .arg(format!("{:.8}", latitude))
            .arg(&member);
        let reply = self.store.request(Some(key.as_bytes()), frame).await?;
        check_integer("GEOADD", &reply)?;
        Ok(())
    }

    async fn xadd(
        &self,
        key: String,
        stamp: String,
        fields: Vec<(Vec<u8>, String)>,
    ) -> Result<(), LoadError> {
        let maxlen = self.options.stream_maxlen.to_string();
        let mut frame = Frame::new("XADD", 6 + fields.len() * 2)
            .arg(&key)
            .arg("MAXLEN")
            .arg("~")
            .arg(&maxlen)
            .arg(&stamp);
        for (field, value) in &fields {
            frame = frame.arg(field).arg(value);
        }

        let reply = self.store.request(Some(key.as_bytes()), frame).await?;
        if reply.is_stream_dup() {
            // Same or older entry id: the sample is dropped, the load goes on.
            tracing::warn!(%key, %stamp, "duplicate or early stream insert");
            return Ok(());
        }
        match &reply {
            Value::Error(message) => Err(LoadError::Failed {
                command: "XADD",
                message: message.clone(),
            }),
            other => {
                let id = other.as_str().map_err(StoreError::Protocol)?;
                if id != stamp {
                    tracing::warn!(%key, %stamp, id, "stream insert id mismatch");
                }
                Ok(())
            }
        }
    }

    async fn expire(&self, key: String) -> Result<(), LoadError> {
        let expire = self.options.stream_expire.to_string();
        let frame = Frame::new("EXPIRE", 3).arg(&key).arg(&expire);
        let reply = self.store.request(Some(key.as_bytes()), frame).await?;
        check_integer("EXPIRE", &reply)?;
        Ok(())
    }
}

fn check_integer(command: &'static str, reply: &Value) -> Result<i64, LoadError> {
    if let Value::Error(message) = reply {
        return Err(LoadError::Failed {
            command,
            message: message.clone(),
        });
    }
    Ok(reply.as_integer().map_err(StoreError::Protocol)?)
}

fn check_status(command: &'static str, reply: &Value) -> Result<(), LoadError> {
    if let Value::Error(message) = reply {
        return Err(LoadError::Failed {
            command,
            message: message.clone(),
        });
    }
    if reply.is_ok_status() {
        return Ok(());
    }
    Err(LoadError::Store(StoreError::Protocol(
        resp::ProtocolError::UnexpectedKind {
            expected: "status",
            got: reply.kind(),
        },
    )))
}

//! End-to-end loader behavior against the scripted in-memory store, plus
//! one redirection scenario against real socket nodes.

use series_schema::model::{
    Atom, Context, Desc, InDom, Instance, InstanceDomain, Label, LabelFlags, Metric, Name, Pmid,
    SampleValue, Semantics, Timestamp, Units, ValueType, ERR_NYI,
};
use series_schema::testing::MemoryStore;
use series_schema::{keys, Baton, LoadOptions, Loader, MapDict, Maps};
use seriesid::Id;
use std::sync::Arc;

fn context() -> Context {
    Context::new("archive-a", "a", Vec::new())
}

fn loader(store: &MemoryStore) -> Loader<&MemoryStore> {
    Loader::new(store, Arc::new(Maps::new()), LoadOptions::default())
}

fn scalar_metric(context: &Context, name: &str) -> Metric {
    Metric::new(
        context,
        vec![Name::new(name)],
        Desc {
            pmid: Pmid::new(60, 2, 0),
            indom: None,
            semantics: Semantics::Instant,
            value_type: ValueType::F32,
            units: Units::none(),
        },
        Vec::new(),
    )
}

// Scenario: one singular metric sample lands as descriptor, name links and
// a one-entry value stream, with the stream id carrying the timestamp.
#[tokio::test]
async fn test_single_metric_no_instances() {
    let store = MemoryStore::new();
    let loader = loader(&store);
    let context = context();
    assert_eq!(context.source, Id::of("host=a"));

    let mut metric = scalar_metric(&context, "kernel.all.load");
    let name_id = Id::of("kernel.all.load");
    let series = Id::series(name_id, None, context.source);

    let stamp = Timestamp::from_timeval(1, 0);
    let sample = SampleValue::Scalar(Atom::F32(0.42));
    loader
        .load_metric(&context, &mut metric, None, Some((&stamp, &sample)))
        .await
        .expect("load");

    assert!(store.sismember(&keys::series_metric_name(&name_id.hex()), series));
    assert!(store.sismember(&keys::metric_name_series(&series.hex()), name_id));
    assert!(store.sismember(&keys::series_context_name(&context.source.hex()), series));

    let desc = keys::desc_series(&series.hex());
    assert_eq!(store.hget(&desc, b"indom"), Some(b"none".to_vec()));
    assert_eq!(store.hget(&desc, b"pmid"), Some(b"60.2.0".to_vec()));
    assert_eq!(store.hget(&desc, b"semantics"), Some(b"instant".to_vec()));
    assert_eq!(store.hget(&desc, b"type"), Some(b"float".to_vec()));
    assert_eq!(store.hget(&desc, b"units"), Some(b"none".to_vec()));
    assert_eq!(
        store.hget(&desc, b"source"),
        Some(context.source.as_bytes().to_vec())
    );

    let values = keys::values_series(&series.hex());
    assert_eq!(store.xlen(&values), 1);
    let entries = store.stream_entries(&values);
    assert!(entries[0].0.starts_with("1000-"));
    assert_eq!(entries[0].1, vec![(Vec::new(), b"4.2e-1".to_vec())]);
    assert_eq!(store.ttl(&values), Some(86400));

    assert_eq!(
        store.mapped("metric.name", &name_id).as_deref(),
        Some("kernel.all.load")
    );
    assert_eq!(
        store.published(),
        vec![(
            keys::channel("metric.name"),
            format!("{}:kernel.all.load", name_id.hex()),
        )]
    );
}

// The stream append is issued strictly after every metadata reply arrived.
#[tokio::test]
async fn test_values_follow_metadata() {
    let store = MemoryStore::new();
    let loader = loader(&store);
    let context = context();
    let mut metric = scalar_metric(&context, "kernel.all.load");

    let stamp = Timestamp::from_timeval(1, 0);
    let sample = SampleValue::Scalar(Atom::F32(0.42));
    loader
        .load_metric(&context, &mut metric, None, Some((&stamp, &sample)))
        .await
        .expect("load");

    let commands = store.commands();
    let first_xadd = commands
        .iter()
        .position(|args| args[0] == "XADD")
        .expect("an XADD was issued");
    for (index, args) in commands.iter().enumerate() {
        if matches!(args[0].as_str(), "SADD" | "HMSET" | "HSET") {
            assert!(
                index < first_xadd,
                "{} at {} after XADD at {}",
                args[0],
                index,
                first_xadd
            );
        }
    }
}

// Re-publishing a descriptor is a no-op: the metadata is cached after the
// first load, and an uncached re-issue leaves equal fields equal.
#[tokio::test]
async fn test_descriptor_write_once() {
    let store = MemoryStore::new();
    let loader = loader(&store);
    let context = context();
    let mut metric = scalar_metric(&context, "kernel.all.load");
    let series_hex = metric.primary().series.hex();
    let desc_key = keys::desc_series(&series_hex);

    let stamp = Timestamp::from_timeval(1, 0);
    let sample = SampleValue::Scalar(Atom::F32(0.42));
    loader
        .load_metric(&context, &mut metric, None, Some((&stamp, &sample)))
        .await
        .expect("first load");
    assert!(metric.cached);
    assert_eq!(store.count("HMSET", &desc_key), 1);
    let before = store.hget(&desc_key, b"pmid");

    // Cached: the second sample issues no further metadata.
    let stamp = Timestamp::from_timeval(2, 0);
    loader
        .load_metric(&context, &mut metric, None, Some((&stamp, &sample)))
        .await
        .expect("second load");
    assert_eq!(store.count("HMSET", &desc_key), 1);

    // A forced re-issue with identical fields changes nothing.
    metric.cached = false;
    let stamp = Timestamp::from_timeval(3, 0);
    loader
        .load_metric(&context, &mut metric, None, Some((&stamp, &sample)))
        .await
        .expect("third load");
    assert_eq!(store.count("HMSET", &desc_key), 2);
    assert_eq!(store.hget(&desc_key, b"pmid"), before);
    assert_eq!(store.xlen(&keys::values_series(&series_hex)), 3);
}

// Scenario: labels round-trip through the per-series hashes and the
// label-value index.
#[tokio::test]
async fn test_label_round_trip() {
    let store = MemoryStore::new();
    let loader = loader(&store);
    let context = context();

    let labels = vec![
        Label::string("env", "prod", LabelFlags::ITEM),
        Label::string("region", "eu", LabelFlags::ITEM),
    ];
    let env = Id::of("env");
    let prod = Id::of("\"prod\"");

    let mut metric = Metric::new(
        &context,
        vec![Name::new("kernel.all.load")],
        scalar_metric(&context, "kernel.all.load").desc,
        labels,
    );
    let series = metric.primary().series;

    loader
        .load_metric(&context, &mut metric, None, None)
        .await
        .expect("load");

    assert_eq!(
        store.hget(&keys::labelvalue_series(&series.hex()), env),
        Some(prod.as_bytes().to_vec())
    );
    assert_eq!(
        store.hget(&keys::labelflags_series(&series.hex()), env),
        Some(LabelFlags::ITEM.bits().to_string().into_bytes())
    );
    assert!(store.sismember(
        &keys::series_label_value(&env.hex(), &prod.hex()),
        series
    ));
    assert_eq!(
        store
            .hget(&keys::map(&keys::label_value_class(&env.hex())), prod)
            .as_deref(),
        Some(&b"\"prod\""[..])
    );
    // Both label names were interned and announced.
    assert_eq!(store.mapped("label.name", &env).as_deref(), Some("env"));
    assert_eq!(
        store.mapped("label.name", &Id::of("region")).as_deref(),
        Some("region")
    );
}

// Context-only labels never reach per-series flag storage.
#[tokio::test]
async fn test_context_label_flags_excluded() {
    let store = MemoryStore::new();
    let loader = loader(&store);
    let context = context();

    let mut metric = Metric::new(
        &context,
        vec![Name::new("kernel.all.load")],
        scalar_metric(&context, "kernel.all.load").desc,
        vec![Label::string("hostname", "a", LabelFlags::CONTEXT)],
    );
    let series = metric.primary().series;

    loader
        .load_metric(&context, &mut metric, None, None)
        .await
        .expect("load");

    let hostname = Id::of("hostname");
    assert!(!store.hexists(&keys::labelflags_series(&series.hex()), hostname));
    assert!(store.hexists(&keys::labelvalue_series(&series.hex()), hostname));
}

// Scenario: a duplicate sample warns, is dropped, and the load continues.
#[tokio::test]
async fn test_duplicate_stream_insert_is_dropped() {
    let store = MemoryStore::new();
    let loader = loader(&store);
    let context = context();
    let mut metric = scalar_metric(&context, "kernel.all.load");
    let values = keys::values_series(&metric.primary().series.hex());

    let stamp = Timestamp::from_timeval(1, 0);
    let sample = SampleValue::Scalar(Atom::F32(0.42));
    loader
        .load_metric(&context, &mut metric, None, Some((&stamp, &sample)))
        .await
        .expect("first load");
    assert_eq!(store.xlen(&values), 1);

    loader
        .load_metric(&context, &mut metric, None, Some((&stamp, &sample)))
        .await
        .expect("duplicate load succeeds");
    assert_eq!(store.count("XADD", &values), 2);
    assert_eq!(store.xlen(&values), 1);
}

// Instances: the per-instance hash and the linking sets appear, and the
// stream fields carry the instance name identifiers.
#[tokio::test]
async fn test_instance_publication() {
    let store = MemoryStore::new();
    let loader = loader(&store);
    let context = context();

    let indom = InDom::new(60, 1);
    let mut domain = InstanceDomain::new();
    domain.insert(Instance::new(&context, 0, Name::new("sda")));
    domain.insert(Instance::new(&context, 1, Name::new("sdb")));

    let mut metric = Metric::new(
        &context,
        vec![Name::new("disk.dev.read")],
        Desc {
            pmid: Pmid::new(60, 0, 4),
            indom: Some(indom),
            semantics: Semantics::Counter,
            value_type: ValueType::U64,
            units: Units::count(),
        },
        Vec::new(),
    );
    let series = metric.primary().series;

    let stamp = Timestamp::from_timeval(1, 0);
    let sample = SampleValue::Instances(vec![(0, Atom::U64(7)), (1, Atom::U64(9))]);
    loader
        .load_metric(
            &context,
            &mut metric,
            Some(&mut domain),
            Some((&stamp, &sample)),
        )
        .await
        .expect("load");

    let sda = domain.instance(0).unwrap();
    assert_eq!(sda.series, Id::series(Id::of("sda"), None, context.source));
    assert!(sda.cached);

    let inst_key = keys::inst_series(&sda.series.hex());
    assert!(store.hexists(&inst_key, b"name"));
    assert_eq!(store.hget(&inst_key, b"inst"), Some(b"0".to_vec()));
    assert_eq!(
        store.hget(&inst_key, b"name"),
        Some(Id::of("sda").as_bytes().to_vec())
    );
    assert!(store.sismember(&keys::series_inst_name(&Id::of("sda").hex()), series));
    assert!(store.sismember(&keys::instances_series(&series.hex()), sda.series));

    let entries = store.stream_entries(&keys::values_series(&series.hex()));
    assert_eq!(entries.len(), 1);
    assert_eq!(
        entries[0].1,
        vec![
            (Id::of("sda").as_bytes().to_vec(), b"7".to_vec()),
            (Id::of("sdb").as_bytes().to_vec(), b"9".to_vec()),
        ]
    );

    assert_eq!(store.mapped("inst.name", &Id::of("sda")).as_deref(), Some("sda"));
}

// Aggregate payloads stream verbatim; event values have no stream form
// and land as the not-yet-implemented error code.
#[tokio::test]
async fn test_aggregate_and_event_values() {
    let store = MemoryStore::new();
    let loader = loader(&store);
    let context = context();
    let stamp = Timestamp::from_timeval(1, 0);

    let mut aggregate = Metric::new(
        &context,
        vec![Name::new("mem.slabinfo.aggregate")],
        Desc {
            pmid: Pmid::new(60, 5, 1),
            indom: None,
            semantics: Semantics::Instant,
            value_type: ValueType::Aggregate,
            units: Units::none(),
        },
        Vec::new(),
    );
    let sample = SampleValue::Scalar(Atom::Aggregate("\x01\x02raw".into()));
    loader
        .load_metric(&context, &mut aggregate, None, Some((&stamp, &sample)))
        .await
        .expect("load aggregate");
    let entries = store.stream_entries(&keys::values_series(&aggregate.primary().series.hex()));
    assert_eq!(entries[0].1, vec![(Vec::new(), b"\x01\x02raw".to_vec())]);

    let mut event = Metric::new(
        &context,
        vec![Name::new("systemd.journal.records")],
        Desc {
            pmid: Pmid::new(60, 6, 1),
            indom: None,
            semantics: Semantics::Instant,
            value_type: ValueType::Event,
            units: Units::none(),
        },
        Vec::new(),
    );
    let sample = SampleValue::Scalar(Atom::Event);
    loader
        .load_metric(&context, &mut event, None, Some((&stamp, &sample)))
        .await
        .expect("load event");
    let entries = store.stream_entries(&keys::values_series(&event.primary().series.hex()));
    assert_eq!(
        entries[0].1,
        vec![(Vec::new(), ERR_NYI.to_string().into_bytes())]
    );
}

// An errored fetch streams the error code under the `-1` field.
#[tokio::test]
async fn test_error_sample() {
    let store = MemoryStore::new();
    let loader = loader(&store);
    let context = context();
    let mut metric = scalar_metric(&context, "kernel.all.load");

    let stamp = Timestamp::from_timeval(1, 0);
    let sample = SampleValue::Error(-12345);
    loader
        .load_metric(&context, &mut metric, None, Some((&stamp, &sample)))
        .await
        .expect("load");

    let entries = store.stream_entries(&keys::values_series(&metric.primary().series.hex()));
    assert_eq!(entries[0].1, vec![(b"-1".to_vec(), b"-12345".to_vec())]);
}

// The source registration writes both name links and the reverse mapping.
#[tokio::test]
async fn test_source_registration() {
    let store = MemoryStore::new();
    let loader = loader(&store);
    let mut context = context();
    context.location = Some((52.2, 21.0));

    loader.load_source(&context).await.expect("load source");

    assert!(store.sismember(
        &keys::source_context_name(&context.name.id.hex()),
        context.source
    ));
    assert!(store.sismember(
        &keys::source_context_name(&context.hostid.hex()),
        context.source
    ));
    assert!(store.sismember(
        &keys::context_name_source(&context.source.hex()),
        context.name.id
    ));
    assert!(store.sismember(keys::SOURCE_LOCATION, context.source));
    assert_eq!(
        store.mapped("context.name", &context.hostid).as_deref(),
        Some("a")
    );
}

// Intern idempotence: many callers, sequential or racing, one store write
// and one announcement.
#[tokio::test]
async fn test_intern_idempotence() {
    let store = MemoryStore::new();
    let map = MapDict::new("metric.name");
    let id = Id::of("kernel.all.load");
    let key = keys::map("metric.name");

    for _ in 0..3 {
        map.ensure(&store, id, "kernel.all.load")
            .await
            .expect("ensure");
    }

    let mut baton: Baton<'_, series_schema::LoadError> = Baton::new("racing");
    for _ in 0..4 {
        baton.spawn(map.ensure(&store, id, "kernel.all.load"));
    }
    baton.quiesce().await.expect("racing ensure");

    assert_eq!(store.count("HSET", &key), 1);
    assert_eq!(store.published().len(), 1);
    assert_eq!(map.lookup(&id).as_deref(), Some("kernel.all.load"));
}

// A transport failure takes the local entry back out so the retry after
// reconnect re-publishes the mapping.
#[tokio::test]
async fn test_intern_retry_after_transport_failure() {
    let store = MemoryStore::new();
    let map = MapDict::new("metric.name");
    let id = Id::of("disk.dev.read");

    store.fail_once("HSET");
    let err = map
        .ensure(&store, id, "disk.dev.read")
        .await
        .expect_err("injected failure");
    assert!(err.is_transient());
    assert_eq!(map.lookup(&id), None);

    map.ensure(&store, id, "disk.dev.read")
        .await
        .expect("retry");
    assert_eq!(store.count("HSET", &keys::map("metric.name")), 2);
    assert_eq!(store.published().len(), 1);
}

// A transient store failure surfaces out of the record load so the driver
// can retry it once reconnected; the barrier drains before reporting.
#[tokio::test]
async fn test_transient_failure_aborts_record() {
    let store = MemoryStore::new();
    let loader = loader(&store);
    let context = context();
    let mut metric = scalar_metric(&context, "kernel.all.load");

    store.fail_once("SADD");
    let stamp = Timestamp::from_timeval(1, 0);
    let sample = SampleValue::Scalar(Atom::F32(0.42));
    let err = loader
        .load_metric(&context, &mut metric, None, Some((&stamp, &sample)))
        .await
        .expect_err("injected failure");
    assert!(err.is_transient());
    // The metadata phase failed: no value was streamed.
    assert_eq!(
        store.xlen(&keys::values_series(&metric.primary().series.hex())),
        0
    );
    assert!(!metric.cached);
}

mod redirection {
    use super::*;
    use resp::Value;
    use store_client::testing::{MockNode, MockReply};
    use store_client::StoreClient;

    // Scenario: the intern write is answered with MOVED; the mapping ends
    // on the new node, announced exactly once, with the slot learned.
    #[tokio::test]
    async fn test_interning_follows_moved() {
        let target = MockNode::spawn(Arc::new(|args: &[String]| {
            let reply = match args[0].as_str() {
                "HSET" => Value::Integer(1),
                "PUBLISH" => Value::Integer(0),
                other => Value::Error(format!("ERR unexpected {}", other)),
            };
            MockReply::Reply(reply)
        }))
        .await;

        let target_addr = target.addr().to_owned();
        let moved = std::sync::atomic::AtomicBool::new(false);
        let origin = MockNode::spawn(Arc::new(move |args: &[String]| {
            let reply = match args[0].as_str() {
                "CLUSTER" => {
                    Value::Error("ERR This instance has cluster support disabled".into())
                }
                "HSET" if !moved.swap(true, std::sync::atomic::Ordering::SeqCst) => {
                    Value::Error(format!("MOVED 3456 {}", target_addr))
                }
                "HSET" => Value::Integer(1),
                "PUBLISH" => Value::Integer(0),
                other => Value::Error(format!("ERR unexpected {}", other)),
            };
            MockReply::Reply(reply)
        }))
        .await;

        let client = StoreClient::new(vec![origin.addr().to_owned()]);
        client.refresh_slots().await.expect("refresh slots");

        let map = MapDict::new("metric.name");
        let id = Id::of("kernel.all.load");
        map.ensure(&client, id, "kernel.all.load")
            .await
            .expect("ensure");

        assert_eq!(origin.count("HSET"), 1);
        assert_eq!(target.count("HSET"), 1);
        assert_eq!(
            origin.count("PUBLISH") + target.count("PUBLISH"),
            1,
            "announced exactly once"
        );
        assert_eq!(client.slot_owner(3456), Some(target.addr().to_owned()));
    }
}

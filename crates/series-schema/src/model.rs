//! The series data model: sources, metrics, instance domains, labels and
//! samples, each carrying the content identifiers under which it is indexed.

use seriesid::Id;

/// An interned UTF-8 name and its content identifier.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Name {
    pub text: String,
    pub id: Id,
}

impl Name {
    pub fn new(text: impl Into<String>) -> Name {
        let text = text.into();
        let id = Id::of(&text);
        Name { text, id }
    }
}

/// The source a record originated from: host plus archive identity.
#[derive(Debug, Clone)]
pub struct Context {
    /// External name of the source (archive path or host specification).
    pub name: Name,
    /// Identity of the source: the hash of its host/source label set.
    pub source: Id,
    /// Hash of the bare hostname, kept as a secondary lookup handle.
    pub hostid: Id,
    pub host: String,
    /// Optional (latitude, longitude) of the source.
    pub location: Option<(f64, f64)>,
    pub labels: Vec<Label>,
}

impl Context {
    pub fn new(name: impl Into<String>, host: impl Into<String>, labels: Vec<Label>) -> Context {
        let host = host.into();
        Context {
            name: Name::new(name),
            source: Context::identity(&host, &labels),
            hostid: Id::of(&host),
            host,
            location: None,
            labels,
        }
    }

    /// The source identity: one hash over the canonical `name=value` form
    /// of the host and its context labels, sorted by label name.
    pub fn identity(host: &str, labels: &[Label]) -> Id {
        let mut parts = Vec::with_capacity(1 + labels.len());
        parts.push(format!("host={}", host));
        let mut sorted: Vec<&Label> = labels.iter().collect();
        sorted.sort_by(|a, b| a.name.text.cmp(&b.name.text));
        for label in sorted {
            parts.push(format!("{}={}", label.name.text, label.value));
        }
        Id::of(parts.join(","))
    }
}

/// The performance metric identifier: domain, cluster and item bitfields
/// packed into 32 bits, carried opaquely in descriptors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Pmid(u32);

impl Pmid {
    pub fn new(domain: u32, cluster: u32, item: u32) -> Pmid {
        Pmid(((domain & 0x1ff) << 22) | ((cluster & 0xfff) << 10) | (item & 0x3ff))
    }

    pub fn from_raw(raw: u32) -> Pmid {
        Pmid(raw)
    }

    pub fn domain(&self) -> u32 {
        (self.0 >> 22) & 0x1ff
    }

    pub fn cluster(&self) -> u32 {
        (self.0 >> 10) & 0xfff
    }

    pub fn item(&self) -> u32 {
        self.0 & 0x3ff
    }
}

impl std::fmt::Display for Pmid {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}.{}", self.domain(), self.cluster(), self.item())
    }
}

/// `domain.cluster.item`, the inverse of the display form.
impl std::str::FromStr for Pmid {
    type Err = ParseIdError;

    fn from_str(text: &str) -> Result<Pmid, ParseIdError> {
        let mut parts = text.split('.');
        let mut next = || {
            parts
                .next()
                .and_then(|part| part.parse().ok())
                .ok_or(ParseIdError("metric identifier"))
        };
        let pmid = Pmid::new(next()?, next()?, next()?);
        match parts.next() {
            Some(_) => Err(ParseIdError("metric identifier")),
            None => Ok(pmid),
        }
    }
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
#[error("invalid {0}")]
pub struct ParseIdError(pub &'static str);

/// An instance domain identifier: domain and serial bitfields.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct InDom(u32);

impl InDom {
    pub fn new(domain: u32, serial: u32) -> InDom {
        InDom(((domain & 0x1ff) << 22) | (serial & 0x3fffff))
    }

    pub fn from_raw(raw: u32) -> InDom {
        InDom(raw)
    }

    pub fn domain(&self) -> u32 {
        (self.0 >> 22) & 0x1ff
    }

    pub fn serial(&self) -> u32 {
        self.0 & 0x3fffff
    }
}

impl std::fmt::Display for InDom {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}", self.domain(), self.serial())
    }
}

/// `domain.serial`, the inverse of the display form.
impl std::str::FromStr for InDom {
    type Err = ParseIdError;

    fn from_str(text: &str) -> Result<InDom, ParseIdError> {
        let (domain, serial) = text.split_once('.').ok_or(ParseIdError("instance domain"))?;
        match (domain.parse(), serial.parse()) {
            (Ok(domain), Ok(serial)) => Ok(InDom::new(domain, serial)),
            _ => Err(ParseIdError("instance domain")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Semantics {
    Counter,
    Instant,
    Discrete,
}

impl Semantics {
    pub fn as_str(&self) -> &'static str {
        match self {
            Semantics::Counter => "counter",
            Semantics::Instant => "instant",
            Semantics::Discrete => "discrete",
        }
    }
}

impl std::str::FromStr for Semantics {
    type Err = ParseIdError;

    fn from_str(text: &str) -> Result<Semantics, ParseIdError> {
        match text {
            "counter" => Ok(Semantics::Counter),
            "instant" => Ok(Semantics::Instant),
            "discrete" => Ok(Semantics::Discrete),
            _ => Err(ParseIdError("semantics")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueType {
    I32,
    U32,
    I64,
    U64,
    F32,
    F64,
    Text,
    Aggregate,
    Event,
}

impl ValueType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ValueType::I32 => "32",
            ValueType::U32 => "u32",
            ValueType::I64 => "64",
            ValueType::U64 => "u64",
            ValueType::F32 => "float",
            ValueType::F64 => "double",
            ValueType::Text => "string",
            ValueType::Aggregate => "aggregate",
            ValueType::Event => "event",
        }
    }
}

impl std::str::FromStr for ValueType {
    type Err = ParseIdError;

    fn from_str(text: &str) -> Result<ValueType, ParseIdError> {
        match text {
            "32" => Ok(ValueType::I32),
            "u32" => Ok(ValueType::U32),
            "64" => Ok(ValueType::I64),
            "u64" => Ok(ValueType::U64),
            "float" => Ok(ValueType::F32),
            "double" => Ok(ValueType::F64),
            "string" => Ok(ValueType::Text),
            "aggregate" => Ok(ValueType::Aggregate),
            "event" => Ok(ValueType::Event),
            _ => Err(ParseIdError("value type")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpaceScale {
    Byte,
    KByte,
    MByte,
    GByte,
    TByte,
}

impl SpaceScale {
    fn as_str(&self) -> &'static str {
        match self {
            SpaceScale::Byte => "byte",
            SpaceScale::KByte => "Kbyte",
            SpaceScale::MByte => "Mbyte",
            SpaceScale::GByte => "Gbyte",
            SpaceScale::TByte => "Tbyte",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeScale {
    NanoSec,
    MicroSec,
    MilliSec,
    Sec,
    Min,
    Hour,
}

impl TimeScale {
    fn as_str(&self) -> &'static str {
        match self {
            TimeScale::NanoSec => "nanosec",
            TimeScale::MicroSec => "microsec",
            TimeScale::MilliSec => "millisec",
            TimeScale::Sec => "sec",
            TimeScale::Min => "min",
            TimeScale::Hour => "hour",
        }
    }
}

/// Dimensions and scales of a metric's values. The canonical text form
/// joins the positive dimensions, then `/` and the negative ones; a
/// dimensionless metric reads `none`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Units {
    pub dim_space: i8,
    pub dim_time: i8,
    pub dim_count: i8,
    pub scale_space: SpaceScale,
    pub scale_time: TimeScale,
    /// Count scale, as a power of ten.
    pub scale_count: i8,
}

impl Units {
    pub fn none() -> Units {
        Units {
            dim_space: 0,
            dim_time: 0,
            dim_count: 0,
            scale_space: SpaceScale::Byte,
            scale_time: TimeScale::Sec,
            scale_count: 0,
        }
    }

    pub fn count() -> Units {
        Units {
            dim_count: 1,
            ..Units::none()
        }
    }

    pub fn bytes(scale: SpaceScale) -> Units {
        Units {
            dim_space: 1,
            scale_space: scale,
            ..Units::none()
        }
    }

    pub fn per_second(mut self) -> Units {
        self.dim_time -= 1;
        self
    }

    fn part(dim: i8, name: &str, out: &mut Vec<String>) {
        match dim.abs() {
            0 => {}
            1 => out.push(name.to_owned()),
            n => out.push(format!("{}^{}", name, n)),
        }
    }
}

impl Default for Units {
    fn default() -> Units {
        Units::none()
    }
}

impl std::fmt::Display for Units {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let count = if self.scale_count != 0 {
            format!("count x 10^{}", self.scale_count)
        } else {
            "count".to_owned()
        };

        let mut numerator = Vec::new();
        let mut denominator = Vec::new();
        for (dim, name) in [
            (self.dim_space, self.scale_space.as_str()),
            (self.dim_time, self.scale_time.as_str()),
            (self.dim_count, count.as_str()),
        ] {
            let side = if dim > 0 {
                &mut numerator
            } else {
                &mut denominator
            };
            Units::part(dim, name, side);
        }

        match (numerator.is_empty(), denominator.is_empty()) {
            (true, true) => f.write_str("none"),
            (false, true) => f.write_str(&numerator.join(" ")),
            (true, false) => write!(f, "/ {}", denominator.join(" ")),
            (false, false) => write!(f, "{} / {}", numerator.join(" "), denominator.join(" ")),
        }
    }
}

/// A metric descriptor. Immutable once published: re-publishing the same
/// descriptor is a no-op, a differing one is a conflict.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Desc {
    pub pmid: Pmid,
    pub indom: Option<InDom>,
    pub semantics: Semantics,
    pub value_type: ValueType,
    pub units: Units,
}

impl Desc {
    /// The descriptor's instance domain in text form, `none` when singular.
    pub fn indom_str(&self) -> String {
        match self.indom {
            Some(indom) => indom.to_string(),
            None => "none".to_owned(),
        }
    }
}

/// One name a metric is known under, with the series identity that name
/// takes on within a given source.
#[derive(Debug, Clone)]
pub struct SeriesName {
    pub name: Name,
    pub series: Id,
}

/// A metric as cached per archive. A metric may be known under several
/// names; each name yields its own series within the source.
#[derive(Debug, Clone)]
pub struct Metric {
    pub names: Vec<SeriesName>,
    pub desc: Desc,
    pub labels: Vec<Label>,
    /// Whether the metadata has been published to the store already.
    pub cached: bool,
}

impl Metric {
    pub fn new(context: &Context, names: Vec<Name>, desc: Desc, labels: Vec<Label>) -> Metric {
        let names = names
            .into_iter()
            .map(|name| SeriesName {
                series: Id::series(name.id, None, context.source),
                name,
            })
            .collect();
        Metric {
            names,
            desc,
            labels,
            cached: false,
        }
    }

    pub fn primary(&self) -> &SeriesName {
        &self.names[0]
    }
}

/// One instance within a domain. The internal integer is assigned by the
/// archive; the name identity is globally stable.
#[derive(Debug, Clone)]
pub struct Instance {
    pub inst: i32,
    pub name: Name,
    /// Identity of the instance within its source.
    pub series: Id,
    pub labels: Vec<Label>,
    pub cached: bool,
}

impl Instance {
    pub fn new(context: &Context, inst: i32, name: Name) -> Instance {
        Instance {
            inst,
            series: Id::series(name.id, None, context.source),
            name,
            labels: Vec::new(),
            cached: false,
        }
    }
}

/// One version of an instance domain: the ordered set of instances known
/// at a point in time. The list is append-only within a version; a changed
/// membership appends a new version to the archive's chain.
#[derive(Debug, Clone, Default)]
pub struct InstanceDomain {
    pub instances: std::collections::BTreeMap<i32, Instance>,
}

impl InstanceDomain {
    pub fn new() -> InstanceDomain {
        InstanceDomain::default()
    }

    pub fn instance(&self, inst: i32) -> Option<&Instance> {
        self.instances.get(&inst)
    }

    pub fn insert(&mut self, instance: Instance) {
        self.instances.insert(instance.inst, instance);
    }
}

/// Label classification bits. A label whose flags are exactly
/// [`LabelFlags::CONTEXT`] is never written into per-series flag storage.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LabelFlags(pub u32);

impl LabelFlags {
    pub const CONTEXT: LabelFlags = LabelFlags(1 << 0);
    pub const DOMAIN: LabelFlags = LabelFlags(1 << 1);
    pub const INDOM: LabelFlags = LabelFlags(1 << 2);
    pub const CLUSTER: LabelFlags = LabelFlags(1 << 3);
    pub const ITEM: LabelFlags = LabelFlags(1 << 4);
    pub const INSTANCES: LabelFlags = LabelFlags(1 << 5);
    pub const OPTIONAL: LabelFlags = LabelFlags(1 << 7);

    pub fn bits(&self) -> u32 {
        self.0
    }

    pub fn context_only(&self) -> bool {
        *self == LabelFlags::CONTEXT
    }
}

impl std::ops::BitOr for LabelFlags {
    type Output = LabelFlags;

    fn bitor(self, rhs: LabelFlags) -> LabelFlags {
        LabelFlags(self.0 | rhs.0)
    }
}

/// A single label: name and JSON-encoded value, both independently interned.
#[derive(Debug, Clone)]
pub struct Label {
    pub name: Name,
    /// The raw JSON text of the value, quotes and all.
    pub value: String,
    pub value_id: Id,
    pub flags: LabelFlags,
}

impl Label {
    pub fn new(name: impl Into<String>, value_json: impl Into<String>, flags: LabelFlags) -> Label {
        let value = value_json.into();
        let value_id = Id::of(&value);
        Label {
            name: Name::new(name),
            value,
            value_id,
            flags,
        }
    }

    /// A string-valued label; the value is JSON-encoded before interning.
    pub fn string(name: impl Into<String>, value: &str, flags: LabelFlags) -> Label {
        let json = serde_json::to_string(value).expect("strings always serialize");
        Label::new(name, json, flags)
    }
}

/// A stream entry identifier: milliseconds since the epoch plus a sequence
/// discriminator, rendered as `millis-seq`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct Timestamp {
    pub millis: u64,
    pub seq: u64,
}

impl Timestamp {
    pub fn new(millis: u64, seq: u64) -> Timestamp {
        Timestamp { millis, seq }
    }

    pub fn from_timeval(sec: u64, usec: u32) -> Timestamp {
        Timestamp {
            millis: sec * 1000 + (usec / 1000) as u64,
            seq: 0,
        }
    }
}

impl std::fmt::Display for Timestamp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}-{}", self.millis, self.seq)
    }
}

/// The "not yet implemented" error code, streamed in place of values the
/// pipeline cannot carry.
pub const ERR_NYI: i32 = -21344;

/// One typed value.
#[derive(Debug, Clone, PartialEq)]
pub enum Atom {
    I32(i32),
    U32(u32),
    I64(i64),
    U64(u64),
    F32(f32),
    F64(f64),
    Text(String),
    /// An opaque aggregate payload, carried verbatim.
    Aggregate(String),
    /// Event records have no value-stream representation.
    Event,
}

impl Atom {
    /// The text form written into value streams: integers in full,
    /// floating point in exponent notation, text and aggregates verbatim,
    /// events as the [`ERR_NYI`] code.
    pub fn render(&self) -> String {
        match self {
            Atom::I32(v) => v.to_string(),
            Atom::U32(v) => v.to_string(),
            Atom::I64(v) => v.to_string(),
            Atom::U64(v) => v.to_string(),
            Atom::F32(v) => format!("{:e}", v),
            Atom::F64(v) => format!("{:e}", v),
            Atom::Text(v) => v.clone(),
            Atom::Aggregate(v) => v.clone(),
            Atom::Event => ERR_NYI.to_string(),
        }
    }
}

/// The value portion of one sample record for one metric.
#[derive(Debug, Clone, PartialEq)]
pub enum SampleValue {
    /// The fetch failed; the error code is streamed in place of a value.
    Error(i32),
    /// A singular metric's value.
    Scalar(Atom),
    /// Per-instance values, by internal instance number.
    Instances(Vec<(i32, Atom)>),
}

//! The archive reader this daemon ships with: newline-delimited JSON
//! records, one object per line.
//!
//! The logger's native binary format is read through the same
//! [`ArchiveDecoder`] seam by the platform's own reader; this decoder
//! covers relay and replay tooling that emits the JSON form, and keeps the
//! whole pipeline operable end to end. Only complete lines are consumed; a
//! partial tail is left for the next pass.

use discover::{ArchiveDecoder, Batch, DecodeError, LabelTarget, MetaRecord, TextClass, TextTarget, ValueRecord};
use series_schema::model::{
    Atom, Context, Desc, Label, LabelFlags, Name, SampleValue, SpaceScale, TimeScale, Timestamp,
    Units,
};
use serde_json::Value;
use std::io::{Read, Seek, SeekFrom};
use std::path::Path;

#[derive(Debug, Default)]
pub struct JsonDecoder;

impl JsonDecoder {
    pub fn new() -> JsonDecoder {
        JsonDecoder
    }
}

impl ArchiveDecoder for JsonDecoder {
    fn read_meta(&mut self, path: &Path, offset: u64) -> std::io::Result<Batch<MetaRecord>> {
        let records = read_lines(path, offset)?
            .into_iter()
            .map(|(line, end)| (decode_meta(&line), end))
            .collect();
        Ok(Batch { records })
    }

    fn read_volume(
        &mut self,
        path: &Path,
        _volume: u32,
        offset: u64,
    ) -> std::io::Result<Batch<ValueRecord>> {
        let records = read_lines(path, offset)?
            .into_iter()
            .map(|(line, end)| (decode_value(&line), end))
            .collect();
        Ok(Batch { records })
    }
}

fn read_lines(path: &Path, offset: u64) -> std::io::Result<Vec<(String, u64)>> {
    let mut file = std::fs::File::open(path)?;
    file.seek(SeekFrom::Start(offset))?;
    let mut text = String::new();
    file.read_to_string(&mut text)?;

    let mut lines = Vec::new();
    let mut end = offset;
    for line in text.split_inclusive('\n') {
        if !line.ends_with('\n') {
            break;
        }
        end += line.len() as u64;
        let trimmed = line.trim();
        if !trimmed.is_empty() {
            lines.push((trimmed.to_owned(), end));
        }
    }
    Ok(lines)
}

fn parse(line: &str) -> Result<Value, DecodeError> {
    serde_json::from_str(line).map_err(|err| DecodeError(format!("not a JSON record: {}", err)))
}

fn field<'v>(object: &'v Value, name: &str) -> Result<&'v Value, DecodeError> {
    object
        .get(name)
        .ok_or_else(|| DecodeError(format!("record without '{}'", name)))
}

fn text_field(object: &Value, name: &str) -> Result<String, DecodeError> {
    field(object, name)?
        .as_str()
        .map(str::to_owned)
        .ok_or_else(|| DecodeError(format!("'{}' is not a string", name)))
}

fn parsed_field<T>(object: &Value, name: &str) -> Result<T, DecodeError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    text_field(object, name)?
        .parse()
        .map_err(|err| DecodeError(format!("bad '{}': {}", name, err)))
}

fn stamp_of(object: &Value) -> Result<Timestamp, DecodeError> {
    let sec = field(object, "sec")?
        .as_u64()
        .ok_or_else(|| DecodeError("'sec' is not an integer".to_owned()))?;
    let usec = object.get("usec").and_then(Value::as_u64).unwrap_or(0);
    Ok(Timestamp::from_timeval(sec, usec as u32))
}

fn labels_of(object: &Value) -> Result<Vec<Label>, DecodeError> {
    let entries = match object.get("labels") {
        Some(entries) => entries
            .as_array()
            .ok_or_else(|| DecodeError("'labels' is not an array".to_owned()))?,
        None => return Ok(Vec::new()),
    };

    let mut labels = Vec::with_capacity(entries.len());
    for entry in entries {
        let name = text_field(entry, "name")?;
        // The value is arbitrary JSON; its canonical serialization is the
        // interned text, quotes and all.
        let value = serde_json::to_string(field(entry, "value")?)
            .map_err(|err| DecodeError(format!("unserializable label value: {}", err)))?;
        let flags = entry.get("flags").and_then(Value::as_u64).unwrap_or(0);
        labels.push(Label::new(name, value, LabelFlags(flags as u32)));
    }
    Ok(labels)
}

fn units_of(object: &Value) -> Result<Units, DecodeError> {
    let units = match object.get("units") {
        Some(units) => units,
        None => return Ok(Units::none()),
    };
    let dim = |name: &str| units.get(name).and_then(Value::as_i64).unwrap_or(0) as i8;

    let scale_space = match units.get("scale_space").and_then(Value::as_str) {
        None | Some("byte") => SpaceScale::Byte,
        Some("Kbyte") => SpaceScale::KByte,
        Some("Mbyte") => SpaceScale::MByte,
        Some("Gbyte") => SpaceScale::GByte,
        Some("Tbyte") => SpaceScale::TByte,
        Some(other) => return Err(DecodeError(format!("bad space scale '{}'", other))),
    };
    let scale_time = match units.get("scale_time").and_then(Value::as_str) {
        None | Some("sec") => TimeScale::Sec,
        Some("nanosec") => TimeScale::NanoSec,
        Some("microsec") => TimeScale::MicroSec,
        Some("millisec") => TimeScale::MilliSec,
        Some("min") => TimeScale::Min,
        Some("hour") => TimeScale::Hour,
        Some(other) => return Err(DecodeError(format!("bad time scale '{}'", other))),
    };

    Ok(Units {
        dim_space: dim("dim_space"),
        dim_time: dim("dim_time"),
        dim_count: dim("dim_count"),
        scale_space,
        scale_time,
        scale_count: dim("scale_count"),
    })
}

fn atom_of(value: &Value) -> Result<Atom, DecodeError> {
    if let Some(number) = value.as_i64() {
        return Ok(Atom::I64(number));
    }
    if let Some(number) = value.as_f64() {
        return Ok(Atom::F64(number));
    }
    if let Some(text) = value.as_str() {
        return Ok(Atom::Text(text.to_owned()));
    }
    Err(DecodeError(format!("unrepresentable value: {}", value)))
}

fn decode_meta(line: &str) -> Result<MetaRecord, DecodeError> {
    let object = parse(line)?;
    match field(&object, "record")?.as_str() {
        Some("source") => {
            let host = text_field(&object, "host")?;
            let name = match object.get("name").and_then(Value::as_str) {
                Some(name) => name.to_owned(),
                None => host.clone(),
            };
            let mut context = Context::new(name, host, labels_of(&object)?);
            if let Some(location) = object.get("location").and_then(Value::as_array) {
                if let (Some(lat), Some(lon)) =
                    (location.first().and_then(Value::as_f64), location.get(1).and_then(Value::as_f64))
                {
                    context.location = Some((lat, lon));
                }
            }
            Ok(MetaRecord::Source { context })
        }
        Some("desc") => {
            let indom = match object.get("indom").and_then(Value::as_str) {
                Some(indom) => Some(
                    indom
                        .parse()
                        .map_err(|err| DecodeError(format!("bad 'indom': {}", err)))?,
                ),
                None => None,
            };
            let names = field(&object, "names")?
                .as_array()
                .ok_or_else(|| DecodeError("'names' is not an array".to_owned()))?
                .iter()
                .filter_map(Value::as_str)
                .map(Name::new)
                .collect();
            Ok(MetaRecord::Desc {
                names,
                desc: Desc {
                    pmid: parsed_field(&object, "pmid")?,
                    indom,
                    semantics: parsed_field(&object, "semantics")?,
                    value_type: parsed_field(&object, "type")?,
                    units: units_of(&object)?,
                },
            })
        }
        Some("indom") => {
            let mut instances = Vec::new();
            for entry in field(&object, "instances")?
                .as_array()
                .ok_or_else(|| DecodeError("'instances' is not an array".to_owned()))?
            {
                let inst = entry
                    .get(0)
                    .and_then(Value::as_i64)
                    .ok_or_else(|| DecodeError("instance without a number".to_owned()))?;
                let name = entry
                    .get(1)
                    .and_then(Value::as_str)
                    .ok_or_else(|| DecodeError("instance without a name".to_owned()))?;
                instances.push((inst as i32, name.to_owned()));
            }
            Ok(MetaRecord::Indom {
                stamp: stamp_of(&object)?,
                indom: parsed_field(&object, "indom")?,
                instances,
            })
        }
        Some("labels") => {
            let target = if object.get("context").is_some() {
                LabelTarget::Context
            } else if let Some(domain) = object.get("domain").and_then(Value::as_u64) {
                LabelTarget::Domain(domain as u32)
            } else if object.get("cluster").is_some() {
                LabelTarget::Cluster(parsed_field(&object, "cluster")?)
            } else if object.get("item").is_some() {
                LabelTarget::Item(parsed_field(&object, "item")?)
            } else if let Some(entry) = object.get("instance").and_then(Value::as_array) {
                let indom = entry
                    .first()
                    .and_then(Value::as_str)
                    .and_then(|text| text.parse().ok())
                    .ok_or_else(|| DecodeError("bad instance label target".to_owned()))?;
                let inst = entry
                    .get(1)
                    .and_then(Value::as_i64)
                    .ok_or_else(|| DecodeError("bad instance label target".to_owned()))?;
                LabelTarget::Instance(indom, inst as i32)
            } else if object.get("indom").is_some() {
                LabelTarget::Indom(parsed_field(&object, "indom")?)
            } else {
                return Err(DecodeError("label record without a target".to_owned()));
            };
            Ok(MetaRecord::Labels {
                target,
                labels: labels_of(&object)?,
            })
        }
        Some("text") => {
            let target = if object.get("metric").is_some() {
                TextTarget::Metric(parsed_field(&object, "metric")?)
            } else if object.get("indom").is_some() {
                TextTarget::Indom(parsed_field(&object, "indom")?)
            } else {
                return Err(DecodeError("text record without a target".to_owned()));
            };
            let class = match text_field(&object, "class")?.as_str() {
                "oneline" => TextClass::OneLine,
                "help" => TextClass::Help,
                other => return Err(DecodeError(format!("bad text class '{}'", other))),
            };
            Ok(MetaRecord::HelpText {
                target,
                class,
                text: text_field(&object, "text")?,
            })
        }
        Some(other) => Err(DecodeError(format!("unknown metadata record '{}'", other))),
        None => Err(DecodeError("record kind is not a string".to_owned())),
    }
}

fn decode_value(line: &str) -> Result<ValueRecord, DecodeError> {
    let object = parse(line)?;
    match field(&object, "record")?.as_str() {
        Some("mark") => Ok(ValueRecord::Mark {
            stamp: stamp_of(&object)?,
        }),
        Some("sample") => {
            let mut values = Vec::new();
            for entry in field(&object, "values")?
                .as_array()
                .ok_or_else(|| DecodeError("'values' is not an array".to_owned()))?
            {
                let pmid = parsed_field(entry, "pmid")?;
                let value = if let Some(code) = entry.get("error").and_then(Value::as_i64) {
                    SampleValue::Error(code as i32)
                } else if let Some(instances) = entry.get("instances").and_then(Value::as_array) {
                    let mut decoded = Vec::with_capacity(instances.len());
                    for pair in instances {
                        let inst = pair
                            .get(0)
                            .and_then(Value::as_i64)
                            .ok_or_else(|| DecodeError("instance without a number".to_owned()))?;
                        let atom = pair
                            .get(1)
                            .ok_or_else(|| DecodeError("instance without a value".to_owned()))?;
                        decoded.push((inst as i32, atom_of(atom)?));
                    }
                    SampleValue::Instances(decoded)
                } else {
                    SampleValue::Scalar(atom_of(field(entry, "value")?)?)
                };
                values.push((pmid, value));
            }
            Ok(ValueRecord::Sample {
                stamp: stamp_of(&object)?,
                values,
            })
        }
        Some(other) => Err(DecodeError(format!("unknown value record '{}'", other))),
        None => Err(DecodeError("record kind is not a string".to_owned())),
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use series_schema::model::{Pmid, Semantics, ValueType};
    use std::io::Write;

    fn decode_one_meta(line: &str) -> MetaRecord {
        decode_meta(line).expect("decodes")
    }

    #[test]
    fn test_source_record() {
        let record = decode_one_meta(
            r#"{"record":"source","host":"a","labels":[{"name":"env","value":"prod","flags":1}],"location":[52.2,21.0]}"#,
        );
        match record {
            MetaRecord::Source { context } => {
                assert_eq!(context.host, "a");
                assert_eq!(context.labels.len(), 1);
                assert_eq!(context.labels[0].value, "\"prod\"");
                assert_eq!(context.location, Some((52.2, 21.0)));
            }
            other => panic!("unexpected record {:?}", other),
        }
    }

    #[test]
    fn test_desc_record() {
        let record = decode_one_meta(
            r#"{"record":"desc","pmid":"60.0.4","indom":"60.1","semantics":"counter","type":"u64","names":["disk.dev.read"]}"#,
        );
        match record {
            MetaRecord::Desc { names, desc } => {
                assert_eq!(names.len(), 1);
                assert_eq!(names[0].text, "disk.dev.read");
                assert_eq!(desc.pmid, Pmid::new(60, 0, 4));
                assert_eq!(desc.semantics, Semantics::Counter);
                assert_eq!(desc.value_type, ValueType::U64);
                assert_eq!(desc.indom.map(|indom| indom.to_string()), Some("60.1".to_owned()));
                assert_eq!(desc.units.to_string(), "none");
            }
            other => panic!("unexpected record {:?}", other),
        }
    }

    #[test]
    fn test_units_object() {
        let record = decode_one_meta(
            r#"{"record":"desc","pmid":"60.0.4","semantics":"counter","type":"u64","names":["disk.dev.blkread"],"units":{"dim_space":1,"dim_time":-1,"scale_space":"Kbyte"}}"#,
        );
        match record {
            MetaRecord::Desc { desc, .. } => {
                assert_eq!(desc.units.to_string(), "Kbyte / sec");
            }
            other => panic!("unexpected record {:?}", other),
        }
    }

    #[test]
    fn test_sample_record() {
        let record = decode_value(
            r#"{"record":"sample","sec":1,"usec":500000,"values":[{"pmid":"60.2.0","value":0.42}]}"#,
        )
        .expect("decodes");
        match record {
            ValueRecord::Sample { stamp, values } => {
                assert_eq!(stamp.to_string(), "1500-0");
                assert_eq!(values.len(), 1);
                assert_eq!(values[0].1, SampleValue::Scalar(Atom::F64(0.42)));
            }
            other => panic!("unexpected record {:?}", other),
        }
    }

    #[test]
    fn test_mark_and_errors() {
        assert!(matches!(
            decode_value(r#"{"record":"mark","sec":5}"#).expect("decodes"),
            ValueRecord::Mark { .. }
        ));
        assert!(decode_meta("not json").is_err());
        assert!(decode_meta(r#"{"record":"nope"}"#).is_err());
        assert!(decode_value(r#"{"record":"sample","sec":1}"#).is_err());
    }

    #[test]
    fn test_partial_tail_left_for_next_pass() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("a.meta");
        let mut file = std::fs::File::create(&path).expect("create");
        file.write_all(b"{\"record\":\"source\",\"host\":\"a\"}\n{\"record\":\"de")
            .expect("write");

        let mut decoder = JsonDecoder::new();
        let batch = decoder.read_meta(&path, 0).expect("read");
        assert_eq!(batch.records.len(), 1);
        let (record, end) = &batch.records[0];
        assert!(record.is_ok());
        assert_eq!(*end, 31);

        // The tail completes; the next pass resumes at the recorded offset.
        file.write_all(b"sc\",\"pmid\":\"60.2.0\",\"semantics\":\"instant\",\"type\":\"float\",\"names\":[\"kernel.all.load\"]}\n")
            .expect("write");
        let batch = decoder.read_meta(&path, *end).expect("read");
        assert_eq!(batch.records.len(), 1);
        assert!(batch.records[0].0.is_ok());
    }
}

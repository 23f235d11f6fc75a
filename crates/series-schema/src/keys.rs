//! The store key and channel namespace.
//!
//! Key names are ASCII and embed identifiers in their 40-character hex
//! form; set members and hash fields carry the raw 20-byte identifiers.

use seriesid::Hex;

/// Schema version marker, checked and installed during bootstrap.
pub const SCHEMA_VERSION: &str = "pcp:version:schema";

/// Geo-indexed source locations.
pub const SOURCE_LOCATION: &str = "pcp:source:location";

/// The cluster-wide intern table for one string class.
pub fn map(class: &str) -> String {
    format!("pcp:map:{}", class)
}

/// The pub/sub channel announcing new mappings of one string class.
pub fn channel(class: &str) -> String {
    format!("pcp:channel:{}", class)
}

/// The per-label-name value class, itself a map/channel class name.
pub fn label_value_class(name: &Hex) -> String {
    format!("label.{}.value", name)
}

/// Metric name to the series carrying it.
pub fn series_metric_name(name: &Hex) -> String {
    format!("pcp:series:metric.name:{}", name)
}

/// Series back to the names it is known under.
pub fn metric_name_series(series: &Hex) -> String {
    format!("pcp:metric.name:series:{}", series)
}

/// The descriptor fields of a series.
pub fn desc_series(series: &Hex) -> String {
    format!("pcp:desc:series:{}", series)
}

/// Source identity to the series it produces.
pub fn series_context_name(source: &Hex) -> String {
    format!("pcp:series:context.name:{}", source)
}

/// Source name (or host) identity to the sources known under it.
pub fn source_context_name(name: &Hex) -> String {
    format!("pcp:source:context.name:{}", name)
}

/// Source name (or host) identity back to the source.
pub fn context_name_source(name: &Hex) -> String {
    format!("pcp:context.name:source:{}", name)
}

/// Instance name to the series reported against it.
pub fn series_inst_name(name: &Hex) -> String {
    format!("pcp:series:inst.name:{}", name)
}

/// Series to the instances it has reported.
pub fn instances_series(series: &Hex) -> String {
    format!("pcp:instances:series:{}", series)
}

/// The fields of one instance.
pub fn inst_series(instance: &Hex) -> String {
    format!("pcp:inst:series:{}", instance)
}

/// Label name to value identity, per series.
pub fn labelvalue_series(series: &Hex) -> String {
    format!("pcp:labelvalue:series:{}", series)
}

/// Label name to classification flags, per series.
pub fn labelflags_series(series: &Hex) -> String {
    format!("pcp:labelflags:series:{}", series)
}

/// The series labelled with one (name, value) pair.
pub fn series_label_value(name: &Hex, value: &Hex) -> String {
    format!("pcp:series:label.{}.value:{}", name, value)
}

/// The value stream of a series.
pub fn values_series(series: &Hex) -> String {
    format!("pcp:values:series:{}", series)
}

#[cfg(test)]
mod test {
    use super::*;
    use seriesid::Id;

    #[test]
    fn test_key_forms() {
        let id = Id::of("kernel.all.load");
        let hex = id.hex();
        let text = hex.as_str();

        assert_eq!(map("metric.name"), "pcp:map:metric.name");
        assert_eq!(channel("metric.name"), "pcp:channel:metric.name");
        assert_eq!(
            label_value_class(&hex),
            format!("label.{}.value", text)
        );
        assert_eq!(
            series_metric_name(&hex),
            format!("pcp:series:metric.name:{}", text)
        );
        assert_eq!(
            metric_name_series(&hex),
            format!("pcp:metric.name:series:{}", text)
        );
        assert_eq!(desc_series(&hex), format!("pcp:desc:series:{}", text));
        assert_eq!(
            series_label_value(&hex, &hex),
            format!("pcp:series:label.{0}.value:{0}", text)
        );
        assert_eq!(values_series(&hex), format!("pcp:values:series:{}", text));
    }
}

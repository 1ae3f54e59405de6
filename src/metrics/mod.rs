//! Metric samples and Prometheus text exposition
//! 指标样本与 Prometheus 文本格式导出
//!
//! Components describe their telemetry as plain [`MetricSample`] values;
//! [`encode`] turns a batch into exposition bytes. Families are written in
//! the order their names first appear, so encoding disjoint batches and
//! concatenating the bytes is the same as encoding the union.
//!
//! Info samples follow the Prometheus info-metric convention: the family is
//! named `<name>_info`, its value is always `1` and the info fields are
//! appended to the label set.

use prometheus::{Encoder, GaugeVec, Opts, Registry, TextEncoder};
use thiserror::Error;

/// Metric encoding error / 指标编码错误
#[derive(Error, Debug)]
pub enum EncodeError {
    #[error("metric `{name}` mixes label sets {expected:?} and {found:?}")]
    InconsistentLabels {
        name: String,
        expected: Vec<String>,
        found: Vec<String>,
    },

    #[error("prometheus error: {0}")]
    Prometheus(#[from] prometheus::Error),
}

/// Value carried by a sample / 样本携带的值
#[derive(Debug, Clone, PartialEq)]
pub enum SampleValue {
    Gauge(f64),
    Info(Vec<(String, String)>),
}

/// One labeled telemetry datum / 一个带标签的遥测数据
#[derive(Debug, Clone, PartialEq)]
pub struct MetricSample {
    pub name: String,
    pub help: String,
    pub labels: Vec<(String, String)>,
    pub value: SampleValue,
}

impl MetricSample {
    /// Exposed family name (info samples get the `_info` suffix)
    pub fn family_name(&self) -> String {
        match self.value {
            SampleValue::Gauge(_) => self.name.clone(),
            SampleValue::Info(_) => format!("{}_info", self.name),
        }
    }

    fn label_pairs(&self) -> Vec<(&str, &str)> {
        let mut pairs: Vec<(&str, &str)> = self
            .labels
            .iter()
            .map(|(k, v)| (k.as_str(), v.as_str()))
            .collect();
        if let SampleValue::Info(fields) = &self.value {
            pairs.extend(fields.iter().map(|(k, v)| (k.as_str(), v.as_str())));
        }
        pairs
    }

    fn numeric_value(&self) -> f64 {
        match self.value {
            SampleValue::Gauge(v) => v,
            SampleValue::Info(_) => 1.0,
        }
    }
}

/// Declared gauge family, analogous to a labeled Gauge
/// 声明的 gauge 指标族
#[derive(Debug, Clone)]
pub struct GaugeFamily {
    name: String,
    help: String,
    label_names: Vec<&'static str>,
}

impl GaugeFamily {
    pub fn new(name: impl Into<String>, help: impl Into<String>, label_names: &[&'static str]) -> Self {
        Self {
            name: name.into(),
            help: help.into(),
            label_names: label_names.to_vec(),
        }
    }

    /// Build a sample; `values` pair up with the declared label names.
    pub fn sample<V: ToString>(&self, values: &[V], value: f64) -> MetricSample {
        MetricSample {
            name: self.name.clone(),
            help: self.help.clone(),
            labels: zip_labels(&self.label_names, values),
            value: SampleValue::Gauge(value),
        }
    }
}

/// Declared info family / 声明的 info 指标族
#[derive(Debug, Clone)]
pub struct InfoFamily {
    name: String,
    help: String,
    label_names: Vec<&'static str>,
}

impl InfoFamily {
    pub fn new(name: impl Into<String>, help: impl Into<String>, label_names: &[&'static str]) -> Self {
        Self {
            name: name.into(),
            help: help.into(),
            label_names: label_names.to_vec(),
        }
    }

    pub fn sample<V: ToString>(&self, values: &[V], fields: &[(&str, String)]) -> MetricSample {
        MetricSample {
            name: self.name.clone(),
            help: self.help.clone(),
            labels: zip_labels(&self.label_names, values),
            value: SampleValue::Info(
                fields
                    .iter()
                    .map(|(k, v)| (k.to_string(), v.clone()))
                    .collect(),
            ),
        }
    }
}

fn zip_labels<V: ToString>(names: &[&'static str], values: &[V]) -> Vec<(String, String)> {
    names
        .iter()
        .zip(values.iter())
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}

/// Encode samples into Prometheus text format / 将样本编码为 Prometheus 文本格式
pub fn encode(samples: &[MetricSample]) -> Result<Vec<u8>, EncodeError> {
    let mut order: Vec<String> = Vec::new();
    for sample in samples {
        let family = sample.family_name();
        if !order.contains(&family) {
            order.push(family);
        }
    }

    let encoder = TextEncoder::new();
    let mut buffer = Vec::new();
    for family in &order {
        let members: Vec<&MetricSample> = samples
            .iter()
            .filter(|s| &s.family_name() == family)
            .collect();
        encode_family(&encoder, family, &members, &mut buffer)?;
    }
    Ok(buffer)
}

fn encode_family(
    encoder: &TextEncoder,
    family: &str,
    members: &[&MetricSample],
    buffer: &mut Vec<u8>,
) -> Result<(), EncodeError> {
    let Some(first) = members.first() else {
        return Ok(());
    };
    let expected: Vec<String> = first
        .label_pairs()
        .iter()
        .map(|(k, _)| k.to_string())
        .collect();
    let label_names: Vec<&str> = expected.iter().map(String::as_str).collect();

    let gauge = GaugeVec::new(Opts::new(family, first.help.as_str()), &label_names)?;
    // A fresh registry per family keeps output order under our control.
    let registry = Registry::new();
    registry.register(Box::new(gauge.clone()))?;

    for sample in members {
        let pairs = sample.label_pairs();
        let found: Vec<String> = pairs.iter().map(|(k, _)| k.to_string()).collect();
        if found != expected {
            return Err(EncodeError::InconsistentLabels {
                name: family.to_string(),
                expected,
                found,
            });
        }
        let values: Vec<&str> = pairs.iter().map(|(_, v)| *v).collect();
        gauge
            .get_metric_with_label_values(&values)?
            .set(sample.numeric_value());
    }

    encoder.encode(&registry.gather(), buffer)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn text(samples: &[MetricSample]) -> String {
        String::from_utf8(encode(samples).unwrap()).unwrap()
    }

    #[test]
    fn test_gauge_exposition() {
        let family = GaugeFamily::new("cpu_loadavg", "load average", &["m"]);
        let out = text(&[family.sample(&["1"], 0.5), family.sample(&["5"], 0.25)]);
        assert!(out.contains("# HELP cpu_loadavg load average"));
        assert!(out.contains("# TYPE cpu_loadavg gauge"));
        assert!(out.contains("cpu_loadavg{m=\"1\"} 0.5"));
        assert!(out.contains("cpu_loadavg{m=\"5\"} 0.25"));
    }

    #[test]
    fn test_info_suffix_and_fields() {
        let family = InfoFamily::new("in_which_cluster", "Indicates job in which cluster", &[]);
        let out = text(&[family.sample::<&str>(&[], &[("cluster", "powerall".to_string())])]);
        assert!(out.contains("# TYPE in_which_cluster_info gauge"));
        assert!(out.contains("in_which_cluster_info{cluster=\"powerall\"} 1"));
    }

    #[test]
    fn test_label_values_are_escaped() {
        let family = GaugeFamily::new("bmc_fan_read", "Fan read value in BMC", &["name"]);
        let out = text(&[family.sample(&["FAN \"A\"\\1"], 3000.0)]);
        assert!(out.contains(r#"name="FAN \"A\"\\1""#));
    }

    #[test]
    fn test_concatenation_matches_union() {
        let a = GaugeFamily::new("zeta_metric", "z", &["i"]).sample(&["0"], 1.0);
        let b = GaugeFamily::new("alpha_metric", "a", &["i"]).sample(&["0"], 2.0);
        let mut joined = encode(&[a.clone()]).unwrap();
        joined.extend(encode(&[b.clone()]).unwrap());
        assert_eq!(joined, encode(&[a, b]).unwrap());
    }

    #[test]
    fn test_encoding_is_deterministic() {
        let family = GaugeFamily::new("nvgpu_power", "power", &["index", "mode"]);
        let samples = vec![
            family.sample(&["0", "usage"], 120_000.0),
            family.sample(&["1", "usage"], 90_000.0),
        ];
        assert_eq!(encode(&samples).unwrap(), encode(&samples).unwrap());
    }

    #[test]
    fn test_inconsistent_labels_rejected() {
        let a = GaugeFamily::new("m", "h", &["a"]).sample(&["1"], 1.0);
        let b = GaugeFamily::new("m", "h", &["b"]).sample(&["1"], 1.0);
        assert!(matches!(
            encode(&[a, b]),
            Err(EncodeError::InconsistentLabels { .. })
        ));
    }

    #[test]
    fn test_empty_batch_encodes_nothing() {
        assert!(encode(&[]).unwrap().is_empty());
    }
}

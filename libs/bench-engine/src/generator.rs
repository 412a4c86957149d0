use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde_json::{Value, json};

use bench_api::{BenchError, Message, datetime_from_us, now_us, resolve_path};

use crate::config::PayloadSpec;

/// Поле correlation id в payload'е.
pub const ID_FIELD: &str = "bench_id";
/// Поле send timestamp (unix µs).
pub const SENT_FIELD: &str = "sent_us";

// ═══════════════════════════════════════════════════════════════
//  Generator
// ═══════════════════════════════════════════════════════════════

/// Генератор тестовых сообщений. Каждый publisher владеет своим.
pub struct Generator {
    rng: StdRng,
    correlate: bool,
}

impl Generator {
    pub fn new(correlate: bool) -> Self {
        Self { rng: StdRng::from_entropy(), correlate }
    }

    pub fn seeded(seed: u64, correlate: bool) -> Self {
        Self { rng: StdRng::seed_from_u64(seed), correlate }
    }

    /// Сгенерировать одно сообщение. С correlate: новый id и
    /// текущий timestamp внутри payload'а.
    pub fn generate(&mut self, spec: &PayloadSpec) -> Message {
        let stamp = self
            .correlate
            .then(|| (uuid::Uuid::new_v4().simple().to_string(), now_us()));

        let payload = match *spec {
            PayloadSpec::Fixed { bytes } => filler(stamp.as_ref(), bytes),
            PayloadSpec::Range { min, max } => {
                let (lo, hi) = (min.min(max), min.max(max));
                let size = self.rng.gen_range(lo..=hi);
                filler(stamp.as_ref(), size)
            }
            PayloadSpec::Telemetry { min_points, max_points } => {
                let (lo, hi) = (min_points.min(max_points), min_points.max(max_points));
                let points = self.rng.gen_range(lo..=hi);
                let data = self.telemetry(points);
                wrap(stamp.as_ref(), data).to_string().into_bytes()
            }
        };

        let (id, sent_us) = match stamp {
            Some((id, ts)) => (Some(id), Some(ts)),
            None => (None, None),
        };
        Message { id, sent_us, payload }
    }

    fn telemetry(&mut self, points: usize) -> Value {
        let time = datetime_from_us(now_us());
        let items = (0..points)
            .map(|i| {
                let com = self.rng.gen_range(1..=4);
                let unit = self.rng.gen_range(1..=99);
                let group = self.rng.gen_range(10..=50);
                let value = self.rng.gen_range(1000..=9999);
                json!({
                    "name": format!("RTU.COM{com}.T9-{unit:02}-{group}.AI{i:02}"),
                    "value": value.to_string(),
                    "time": time,
                })
            })
            .collect();
        Value::Array(items)
    }
}

fn wrap(stamp: Option<&(String, i64)>, data: Value) -> Value {
    match stamp {
        Some((id, ts)) => json!({ ID_FIELD: id, SENT_FIELD: ts, "data": data }),
        None => json!({ "data": data }),
    }
}

/// `{"data":"xxx"}` (с id/timestamp при correlate), дополненный до `size`.
/// Если конверт сам длиннее `size`, filler пустой.
fn filler(stamp: Option<&(String, i64)>, size: usize) -> Vec<u8> {
    let overhead = wrap(stamp, Value::String(String::new())).to_string().len();
    let fill = "x".repeat(size.saturating_sub(overhead));
    wrap(stamp, Value::String(fill)).to_string().into_bytes()
}

// ═══════════════════════════════════════════════════════════════
//  Stamp extraction
// ═══════════════════════════════════════════════════════════════

/// Correlation данные, найденные в полученном payload'е.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Stamp {
    pub id: String,
    pub sent_us: Option<i64>,
}

/// Найти correlation id в payload'е.
///
/// Forwarder может обернуть исходное сообщение в конверт: тогда id
/// лежит под `data`. Не-JSON → `ErrorKind::Format`; JSON без id → `Ok(None)`.
pub fn extract_stamp(payload: &[u8]) -> Result<Option<Stamp>, BenchError> {
    let value: Value = serde_json::from_slice(payload)?;
    for root in ["", "data"] {
        let node = if root.is_empty() { Some(&value) } else { resolve_path(&value, root) };
        let Some(node) = node else { continue };
        if let Some(id) = node.get(ID_FIELD).and_then(Value::as_str) {
            let sent_us = node.get(SENT_FIELD).and_then(Value::as_i64);
            return Ok(Some(Stamp { id: id.to_string(), sent_us }));
        }
    }
    Ok(None)
}

#[cfg(test)]
mod tests {
    use super::*;
    use bench_api::ErrorKind;
    use std::collections::HashSet;

    #[test]
    fn fixed_payload_has_exact_size() {
        let mut g = Generator::seeded(1, false);
        let msg = g.generate(&PayloadSpec::Fixed { bytes: 100 });
        assert_eq!(msg.len(), 100);
        assert!(msg.id.is_none());
        let v: Value = serde_json::from_slice(&msg.payload).unwrap();
        assert!(v["data"].as_str().unwrap().chars().all(|c| c == 'x'));
    }

    #[test]
    fn correlated_fixed_payload_keeps_size_and_stamp() {
        let mut g = Generator::seeded(1, true);
        let msg = g.generate(&PayloadSpec::Fixed { bytes: 256 });
        assert_eq!(msg.len(), 256);
        let stamp = extract_stamp(&msg.payload).unwrap().unwrap();
        assert_eq!(Some(stamp.id), msg.id);
        assert_eq!(stamp.sent_us, msg.sent_us);
    }

    #[test]
    fn tiny_size_never_truncates_envelope() {
        let mut g = Generator::seeded(1, true);
        let msg = g.generate(&PayloadSpec::Fixed { bytes: 1 });
        assert!(extract_stamp(&msg.payload).unwrap().is_some());
    }

    #[test]
    fn range_payload_within_bounds() {
        let mut g = Generator::seeded(7, false);
        for _ in 0..50 {
            let msg = g.generate(&PayloadSpec::Range { min: 64, max: 128 });
            assert!((64..=128).contains(&msg.len()), "len {}", msg.len());
        }
    }

    #[test]
    fn telemetry_point_count_and_shape() {
        let mut g = Generator::seeded(3, false);
        let msg = g.generate(&PayloadSpec::Telemetry { min_points: 10, max_points: 20 });
        let v: Value = serde_json::from_slice(&msg.payload).unwrap();
        let points = v["data"].as_array().unwrap();
        assert!((10..=20).contains(&points.len()));
        let first = &points[0];
        assert!(first["name"].as_str().unwrap().starts_with("RTU.COM"));
        assert!(first["name"].as_str().unwrap().ends_with(".AI00"));
        assert_eq!(first["value"].as_str().unwrap().len(), 4);
        assert_eq!(first["time"].as_str().unwrap().len(), 19);
    }

    #[test]
    fn ids_are_unique() {
        let mut g = Generator::seeded(9, true);
        let ids: HashSet<_> = (0..1000)
            .map(|_| g.generate(&PayloadSpec::Fixed { bytes: 80 }).id.unwrap())
            .collect();
        assert_eq!(ids.len(), 1000);
    }

    #[test]
    fn stamp_found_inside_forwarder_envelope() {
        let inner = r#"{"bench_id":"abc","sent_us":42,"data":"xx"}"#;
        let wrapped = format!(
            r#"{{"data":{inner},"operationType":"uploadRtd","projectID":"X2View","webtalkID":"dev"}}"#
        );
        let stamp = extract_stamp(wrapped.as_bytes()).unwrap().unwrap();
        assert_eq!(stamp, Stamp { id: "abc".into(), sent_us: Some(42) });
    }

    #[test]
    fn stamp_missing_or_malformed() {
        assert_eq!(extract_stamp(br#"{"data":"x"}"#).unwrap(), None);
        assert_eq!(extract_stamp(br#"[1,2,3]"#).unwrap(), None);
        let err = extract_stamp(b"not json").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Format);
    }
}

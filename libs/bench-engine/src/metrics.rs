use serde::{Deserialize, Serialize};

use bench_api::Usage;

use crate::config::{PayloadSpec, Scenario};
use crate::error::AbortReason;
use crate::ledger::LedgerSnapshot;
use crate::runner::RunPhase;
use crate::sampler::ResourceSample;

/// Минимум сэмплов для честного p95; меньше: подставляется max.
pub const P95_MIN_SAMPLES: usize = 20;
/// Минимум сэмплов для честного p99.
pub const P99_MIN_SAMPLES: usize = 100;

// ═══════════════════════════════════════════════════════════════
//  Basic rates
// ═══════════════════════════════════════════════════════════════

/// Сообщений в секунду. 0 при `elapsed_s <= 0`.
pub fn throughput(received: u64, elapsed_s: f64) -> f64 {
    if elapsed_s > 0.0 { received as f64 / elapsed_s } else { 0.0 }
}

/// Процент потерь. 0 при `sent == 0`; отрицательное значение
/// (получено больше, чем отправлено) не обрезается.
pub fn loss_rate(sent: u64, received: u64) -> f64 {
    if sent == 0 {
        return 0.0;
    }
    (sent as f64 - received as f64) * 100.0 / sent as f64
}

// ═══════════════════════════════════════════════════════════════
//  Latency
// ═══════════════════════════════════════════════════════════════

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Percentile {
    pub value_ms: f64,
    /// Сэмплов меньше, чем нужно для этого перцентиля; value = max.
    pub low_confidence: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LatencySummary {
    pub samples: usize,
    pub mean_ms: f64,
    pub min_ms: f64,
    pub max_ms: f64,
    pub p95: Percentile,
    pub p99: Percentile,
    /// Drain не завершился: часть сэмплов могла не успеть прийти.
    pub low_confidence: bool,
}

impl LatencySummary {
    /// None, если нет ни одного resolved сэмпла.
    pub fn from_samples(samples: &[f64], drained: bool) -> Option<Self> {
        if samples.is_empty() {
            return None;
        }
        let mut sorted = samples.to_vec();
        sorted.sort_by(f64::total_cmp);

        let n = sorted.len();
        let min_ms = sorted[0];
        let max_ms = sorted[n - 1];
        let mean_ms = sorted.iter().sum::<f64>() / n as f64;

        Some(Self {
            samples: n,
            mean_ms,
            min_ms,
            max_ms,
            p95: percentile(&sorted, 95.0, P95_MIN_SAMPLES),
            p99: percentile(&sorted, 99.0, P99_MIN_SAMPLES),
            low_confidence: !drained,
        })
    }
}

/// Nearest-rank перцентиль по отсортированным сэмплам.
fn percentile(sorted: &[f64], pct: f64, min_samples: usize) -> Percentile {
    let max = sorted[sorted.len() - 1];
    if sorted.len() < min_samples {
        return Percentile { value_ms: max, low_confidence: true };
    }
    let idx = ((pct / 100.0) * (sorted.len() - 1) as f64).round() as usize;
    Percentile { value_ms: sorted[idx.min(sorted.len() - 1)], low_confidence: false }
}

// ═══════════════════════════════════════════════════════════════
//  Resources
// ═══════════════════════════════════════════════════════════════

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceSummary {
    pub target: String,
    pub baseline: Option<Usage>,
    #[serde(rename = "final")]
    pub final_usage: Option<Usage>,
    pub max_cpu_percent: f64,
    pub avg_cpu_percent: f64,
    pub max_memory_percent: f64,
    pub avg_memory_percent: f64,
    /// Неудавшихся запросов к probe (записаны как нули).
    pub unavailable: usize,
    pub samples: Vec<ResourceSample>,
}

impl ResourceSummary {
    /// Max/avg считаются только по доступным сэмплам.
    pub fn new(
        target: String,
        baseline: Option<Usage>,
        final_usage: Option<Usage>,
        samples: Vec<ResourceSample>,
    ) -> Self {
        let ok: Vec<&ResourceSample> = samples.iter().filter(|s| s.available).collect();
        let (max_cpu, avg_cpu) = max_avg(ok.iter().map(|s| s.cpu_percent));
        let (max_mem, avg_mem) = max_avg(ok.iter().map(|s| s.memory_percent));
        let unavailable = samples.len() - ok.len();
        Self {
            target,
            baseline,
            final_usage,
            max_cpu_percent: max_cpu,
            avg_cpu_percent: avg_cpu,
            max_memory_percent: max_mem,
            avg_memory_percent: avg_mem,
            unavailable,
            samples,
        }
    }
}

fn max_avg(values: impl Iterator<Item = f64>) -> (f64, f64) {
    let (mut max, mut sum, mut n) = (0.0f64, 0.0, 0usize);
    for v in values {
        max = max.max(v);
        sum += v;
        n += 1;
    }
    (max, if n > 0 { sum / n as f64 } else { 0.0 })
}

// ═══════════════════════════════════════════════════════════════
//  Scenario Result
// ═══════════════════════════════════════════════════════════════

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ScenarioStatus {
    Completed { drained: bool },
    Aborted { reason: AbortReason },
}

/// Параметры сценария, сохраняемые в отчёте.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScenarioParams {
    pub message_count: u64,
    pub payload: PayloadSpec,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub batch_size: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub batch_count: Option<u64>,
    pub rate: Option<f64>,
    pub correlate: bool,
    pub fanout: u32,
}

impl From<&Scenario> for ScenarioParams {
    fn from(s: &Scenario) -> Self {
        let (batch_size, batch_count) = if s.load.is_batched() {
            (Some(s.load.batch_size()), Some(s.load.attempts()))
        } else {
            (None, None)
        };
        Self {
            message_count: s.load.total(),
            payload: s.payload.clone(),
            batch_size,
            batch_count,
            rate: s.rate,
            correlate: s.correlate,
            fanout: s.fanout,
        }
    }
}

/// Неизменяемый итог одного сценария.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScenarioResult {
    pub name: String,
    pub params: ScenarioParams,
    #[serde(flatten)]
    pub status: ScenarioStatus,
    pub phase: RunPhase,
    pub topic: String,
    pub started_at_us: i64,
    pub sent: u64,
    pub accepted: u64,
    pub publish_failures: u64,
    pub received: u64,
    pub malformed: u64,
    pub uncorrelated: u64,
    pub unresolved: u64,
    pub duration_s: f64,
    pub throughput: f64,
    pub loss_rate: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub latency: Option<LatencySummary>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resources: Option<ResourceSummary>,
    /// Превью первого полученного payload'а.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sample_message: Option<String>,
}

impl ScenarioResult {
    pub fn is_aborted(&self) -> bool {
        matches!(self.status, ScenarioStatus::Aborted { .. })
    }
}

/// Всё, из чего собирается ScenarioResult. Снимок заморожен: агрегация
/// чистая функция.
#[derive(Debug, Clone)]
pub struct RunRecord {
    pub scenario: Scenario,
    pub topic: String,
    pub started_at_us: i64,
    pub status: ScenarioStatus,
    pub phase: RunPhase,
    pub counters: LedgerSnapshot,
    pub elapsed_s: f64,
    pub resources: Option<ResourceSummary>,
    pub sample_message: Option<String>,
}

pub fn aggregate(record: &RunRecord) -> ScenarioResult {
    let c = &record.counters;
    let drained = matches!(record.status, ScenarioStatus::Completed { drained: true });
    let latency = if record.scenario.correlate {
        LatencySummary::from_samples(&c.latencies_ms, drained)
    } else {
        None
    };

    ScenarioResult {
        name: record.scenario.name.clone(),
        params: ScenarioParams::from(&record.scenario),
        status: record.status.clone(),
        phase: record.phase,
        topic: record.topic.clone(),
        started_at_us: record.started_at_us,
        sent: c.sent,
        accepted: c.accepted,
        publish_failures: c.publish_failures,
        received: c.received,
        malformed: c.malformed,
        uncorrelated: c.uncorrelated,
        unresolved: c.unresolved,
        duration_s: record.elapsed_s,
        throughput: throughput(c.received, record.elapsed_s),
        loss_rate: loss_rate(c.sent, c.received),
        latency,
        resources: record.resources.clone(),
        sample_message: record.sample_message.clone(),
    }
}

// ═══════════════════════════════════════════════════════════════
//  Suite Summary
// ═══════════════════════════════════════════════════════════════

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SuiteSummary {
    pub run_id: String,
    pub started_at_us: i64,
    pub finished_at_us: i64,
    pub completed: usize,
    pub aborted: usize,
    pub total_sent: u64,
    pub total_received: u64,
    pub overall_loss_rate: f64,
    pub scenarios: Vec<ScenarioResult>,
}

impl SuiteSummary {
    /// Сводка по сценариям в порядке выполнения. Прерванные не выкидываются.
    pub fn merge(
        run_id: String,
        started_at_us: i64,
        finished_at_us: i64,
        scenarios: Vec<ScenarioResult>,
    ) -> Self {
        let aborted = scenarios.iter().filter(|s| s.is_aborted()).count();
        let total_sent = scenarios.iter().map(|s| s.sent).sum();
        let total_received = scenarios.iter().map(|s| s.received).sum();
        Self {
            run_id,
            started_at_us,
            finished_at_us,
            completed: scenarios.len() - aborted,
            aborted,
            total_sent,
            total_received,
            overall_loss_rate: loss_rate(total_sent, total_received),
            scenarios,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::AbortKind;

    fn record(sent: u64, received: u64, status: ScenarioStatus) -> RunRecord {
        RunRecord {
            scenario: Scenario::messages("t", sent, PayloadSpec::Fixed { bytes: 100 }).correlated(),
            topic: "/ge/web/test".into(),
            started_at_us: 0,
            status,
            phase: RunPhase::Done,
            counters: LedgerSnapshot {
                sent,
                accepted: sent,
                received,
                latencies_ms: (0..received).map(|i| i as f64).collect(),
                ..Default::default()
            },
            elapsed_s: 2.0,
            resources: None,
            sample_message: None,
        }
    }

    #[test]
    fn boundaries() {
        assert_eq!(throughput(100, 0.0), 0.0);
        assert_eq!(throughput(100, -1.0), 0.0);
        assert_eq!(throughput(100, 2.0), 50.0);
        assert_eq!(loss_rate(0, 0), 0.0);
        assert_eq!(loss_rate(0, 5), 0.0);
        assert_eq!(loss_rate(100, 0), 100.0);
        assert_eq!(loss_rate(100, 97), 3.0);
    }

    #[test]
    fn negative_loss_is_surfaced() {
        assert_eq!(loss_rate(100, 110), -10.0);
    }

    #[test]
    fn small_sample_falls_back_to_max() {
        let samples: Vec<f64> = (1..=10).map(f64::from).collect();
        let s = LatencySummary::from_samples(&samples, true).unwrap();
        assert_eq!(s.p95, Percentile { value_ms: 10.0, low_confidence: true });
        assert_eq!(s.p99, Percentile { value_ms: 10.0, low_confidence: true });
        assert_eq!(s.mean_ms, 5.5);
        assert!(!s.low_confidence);
    }

    #[test]
    fn percentiles_with_enough_samples() {
        let samples: Vec<f64> = (0..=100).rev().map(f64::from).collect();
        let s = LatencySummary::from_samples(&samples, true).unwrap();
        assert_eq!(s.min_ms, 0.0);
        assert_eq!(s.max_ms, 100.0);
        assert_eq!(s.p95, Percentile { value_ms: 95.0, low_confidence: false });
        assert_eq!(s.p99, Percentile { value_ms: 99.0, low_confidence: false });
    }

    #[test]
    fn p95_ready_before_p99() {
        let samples: Vec<f64> = (0..50).map(f64::from).collect();
        let s = LatencySummary::from_samples(&samples, true).unwrap();
        assert!(!s.p95.low_confidence);
        assert!(s.p99.low_confidence);
        assert_eq!(s.p99.value_ms, 49.0);
    }

    #[test]
    fn undrained_run_flags_latency() {
        let s = LatencySummary::from_samples(&[1.0, 2.0], false).unwrap();
        assert!(s.low_confidence);
        assert!(LatencySummary::from_samples(&[], true).is_none());
    }

    #[test]
    fn aggregate_is_idempotent() {
        let rec = record(100, 97, ScenarioStatus::Completed { drained: false });
        let a = aggregate(&rec);
        let b = aggregate(&rec);
        assert_eq!(a, b);
        assert_eq!(a.loss_rate, 3.0);
        assert_eq!(a.throughput, 48.5);
        assert!(a.latency.unwrap().low_confidence);
    }

    #[test]
    fn resource_summary_ignores_unavailable_samples() {
        let samples = vec![
            ResourceSample::new(0.0, Usage { cpu_percent: 10.0, memory_percent: 2.0, memory_usage: "1MiB".into() }, true),
            ResourceSample::new(0.5, Usage::unavailable(), false),
            ResourceSample::new(1.0, Usage { cpu_percent: 30.0, memory_percent: 4.0, memory_usage: "2MiB".into() }, true),
        ];
        let r = ResourceSummary::new("fwd".into(), None, None, samples);
        assert_eq!(r.max_cpu_percent, 30.0);
        assert_eq!(r.avg_cpu_percent, 20.0);
        assert_eq!(r.avg_memory_percent, 3.0);
        assert_eq!(r.unavailable, 1);
    }

    #[test]
    fn summary_keeps_aborted_scenarios() {
        let ok = aggregate(&record(100, 100, ScenarioStatus::Completed { drained: true }));
        let aborted = aggregate(&record(
            14,
            10,
            ScenarioStatus::Aborted {
                reason: AbortReason {
                    kind: AbortKind::FailureThreshold,
                    detail: "broker unavailable".into(),
                    at_message: Some(15),
                },
            },
        ));
        let summary = SuiteSummary::merge("run".into(), 0, 1, vec![ok, aborted]);
        assert_eq!(summary.completed, 1);
        assert_eq!(summary.aborted, 1);
        assert_eq!(summary.scenarios.len(), 2);
        assert_eq!(summary.total_sent, 114);
        assert_eq!(summary.total_received, 110);

        let json = serde_json::to_value(&summary).unwrap();
        assert_eq!(json["scenarios"][1]["status"], "aborted");
        assert_eq!(json["scenarios"][1]["reason"]["kind"], "failure_threshold");
    }
}

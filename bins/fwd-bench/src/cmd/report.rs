use std::fmt::Write as _;
use std::path::{Path, PathBuf};

use bench_api::datetime_from_us;
use bench_engine::{Percentile, ScenarioResult, ScenarioStatus, SuiteSummary};

use crate::error::FwdBenchError;

// ═══════════════════════════════════════════════════════════════
//  Files
// ═══════════════════════════════════════════════════════════════

/// Записать `<dir>/<run_id>.json` и `<dir>/<run_id>.md`.
pub fn write_reports(dir: &Path, suite: &str, summary: &SuiteSummary) -> Result<(PathBuf, PathBuf), FwdBenchError> {
    std::fs::create_dir_all(dir).map_err(|e| FwdBenchError::io(dir.display().to_string(), e))?;

    let json_path = dir.join(format!("{}.json", summary.run_id));
    let json = serde_json::to_string_pretty(summary)?;
    std::fs::write(&json_path, json).map_err(|e| FwdBenchError::io(json_path.display().to_string(), e))?;

    let md_path = dir.join(format!("{}.md", summary.run_id));
    std::fs::write(&md_path, render_markdown(suite, summary))
        .map_err(|e| FwdBenchError::io(md_path.display().to_string(), e))?;

    Ok((json_path, md_path))
}

// ═══════════════════════════════════════════════════════════════
//  Rendering
// ═══════════════════════════════════════════════════════════════

fn status_label(result: &ScenarioResult) -> &'static str {
    match result.status {
        ScenarioStatus::Completed { drained: true } => "ok",
        ScenarioStatus::Completed { drained: false } => "timeout",
        ScenarioStatus::Aborted { .. } => "aborted",
    }
}

/// `*`: мало сэмплов, значение = max.
fn pct(p: &Percentile) -> String {
    if p.low_confidence { format!("{:.2}*", p.value_ms) } else { format!("{:.2}", p.value_ms) }
}

/// Сводная таблица для stdout.
pub fn render_table(summary: &SuiteSummary) -> String {
    let mut out = String::new();
    let _ = writeln!(
        out,
        "{:<24} {:>8} {:>8} {:>8} {:>10} {:>12} {:>8}",
        "scenario", "status", "sent", "recv", "duration", "msg/s", "loss%"
    );
    for r in &summary.scenarios {
        let _ = writeln!(
            out,
            "{:<24} {:>8} {:>8} {:>8} {:>9.2}s {:>12.1} {:>8.2}",
            r.name,
            status_label(r),
            r.sent,
            r.received,
            r.duration_s,
            r.throughput,
            r.loss_rate
        );
    }
    let _ = writeln!(
        out,
        "total: {} scenarios ({} aborted), sent {}, received {}, loss {:.2}%",
        summary.scenarios.len(),
        summary.aborted,
        summary.total_sent,
        summary.total_received,
        summary.overall_loss_rate
    );
    out
}

pub fn render_markdown(suite: &str, summary: &SuiteSummary) -> String {
    let mut md = String::new();
    let _ = writeln!(md, "# MQTT Forwarder Benchmark Report\n");
    let _ = writeln!(md, "- Run: `{}` (suite `{suite}`)", summary.run_id);
    let _ = writeln!(md, "- Started: {} UTC", datetime_from_us(summary.started_at_us));
    let _ = writeln!(md, "- Finished: {} UTC", datetime_from_us(summary.finished_at_us));
    let _ = writeln!(
        md,
        "- Scenarios: {} (completed {}, aborted {})",
        summary.scenarios.len(),
        summary.completed,
        summary.aborted
    );
    let _ = writeln!(
        md,
        "- Total: sent {}, received {}, loss {:.2}%\n",
        summary.total_sent, summary.total_received, summary.overall_loss_rate
    );

    let _ = writeln!(md, "## Results\n");
    let _ = writeln!(md, "| Scenario | Payload | Status | Sent | Received | Failures | Malformed | Duration (s) | Throughput (msg/s) | Loss (%) |");
    let _ = writeln!(md, "|---|---|---|---:|---:|---:|---:|---:|---:|---:|");
    for r in &summary.scenarios {
        let _ = writeln!(
            md,
            "| {} | {} | {} | {} | {} | {} | {} | {:.2} | {:.2} | {:.2} |",
            r.name,
            r.params.payload,
            status_label(r),
            r.sent,
            r.received,
            r.publish_failures,
            r.malformed,
            r.duration_s,
            r.throughput,
            r.loss_rate
        );
    }

    let latency: Vec<_> = summary
        .scenarios
        .iter()
        .filter_map(|r| r.latency.as_ref().map(|l| (r, l)))
        .collect();
    if !latency.is_empty() {
        let _ = writeln!(md, "\n## Latency (ms)\n");
        let _ = writeln!(md, "| Scenario | Samples | Unresolved | Avg | Min | Max | P95 | P99 |");
        let _ = writeln!(md, "|---|---:|---:|---:|---:|---:|---:|---:|");
        for (r, l) in &latency {
            let _ = writeln!(
                md,
                "| {} | {} | {} | {:.2} | {:.2} | {:.2} | {} | {} |",
                r.name,
                l.samples,
                r.unresolved,
                l.mean_ms,
                l.min_ms,
                l.max_ms,
                pct(&l.p95),
                pct(&l.p99)
            );
        }
        let _ = writeln!(md, "\n`*` too few samples for the percentile; maximum shown.");
    }

    let resources: Vec<_> = summary
        .scenarios
        .iter()
        .filter_map(|r| r.resources.as_ref().map(|res| (r, res)))
        .collect();
    if !resources.is_empty() {
        let _ = writeln!(md, "\n## Resources\n");
        let _ = writeln!(md, "| Scenario | Target | Baseline CPU (%) | Max CPU (%) | Avg CPU (%) | Max Mem (%) | Avg Mem (%) | Final Mem | Unavailable |");
        let _ = writeln!(md, "|---|---|---:|---:|---:|---:|---:|---|---:|");
        for (r, res) in &resources {
            let baseline = res.baseline.as_ref().map(|u| u.cpu_percent).unwrap_or_default();
            let final_mem = res.final_usage.as_ref().map(|u| u.memory_usage.as_str()).unwrap_or("N/A");
            let _ = writeln!(
                md,
                "| {} | {} | {:.2} | {:.2} | {:.2} | {:.2} | {:.2} | {} | {} |",
                r.name,
                res.target,
                baseline,
                res.max_cpu_percent,
                res.avg_cpu_percent,
                res.max_memory_percent,
                res.avg_memory_percent,
                final_mem,
                res.unavailable
            );
        }
    }

    let aborted: Vec<_> = summary
        .scenarios
        .iter()
        .filter_map(|r| match &r.status {
            ScenarioStatus::Aborted { reason } => Some((r, reason)),
            ScenarioStatus::Completed { .. } => None,
        })
        .collect();
    if !aborted.is_empty() {
        let _ = writeln!(md, "\n## Aborted\n");
        for (r, reason) in aborted {
            let _ = writeln!(md, "- **{}**: {}", r.name, reason.detail);
        }
    }

    let samples: Vec<_> = summary
        .scenarios
        .iter()
        .filter_map(|r| r.sample_message.as_ref().map(|m| (r, m)))
        .collect();
    if !samples.is_empty() {
        let _ = writeln!(md, "\n## Sample messages\n");
        for (r, m) in samples {
            let _ = writeln!(md, "- {}: `{}`", r.name, m.replace('`', "'"));
        }
    }

    md
}

#[cfg(test)]
mod tests {
    use super::*;
    use bench_engine::{
        AbortKind, AbortReason, LatencySummary, LedgerSnapshot, PayloadSpec, RunPhase, RunRecord,
        Scenario, aggregate,
    };

    fn result(name: &str, status: ScenarioStatus, correlate: bool) -> ScenarioResult {
        let mut scenario = Scenario::messages(name, 100, PayloadSpec::Fixed { bytes: 100 });
        scenario.correlate = correlate;
        aggregate(&RunRecord {
            scenario,
            topic: format!("/ge/web/{name}"),
            started_at_us: 0,
            status,
            phase: RunPhase::Done,
            counters: LedgerSnapshot {
                sent: 100,
                accepted: 100,
                received: 97,
                latencies_ms: vec![1.0, 2.0, 3.0],
                ..Default::default()
            },
            elapsed_s: 1.0,
            resources: None,
            sample_message: Some("{\"data\":\"xx\"}".into()),
        })
    }

    fn summary() -> SuiteSummary {
        let ok = result("lat", ScenarioStatus::Completed { drained: true }, true);
        let aborted = result(
            "broken",
            ScenarioStatus::Aborted {
                reason: AbortReason {
                    kind: AbortKind::Connection,
                    detail: "connection refused".into(),
                    at_message: None,
                },
            },
            false,
        );
        SuiteSummary::merge("20261019_120000".into(), 0, 1_000_000, vec![ok, aborted])
    }

    #[test]
    fn markdown_lists_every_scenario() {
        let md = render_markdown("latency", &summary());
        assert!(md.contains("| lat | 100B | ok | 100 | 97 |"));
        assert!(md.contains("| broken | 100B | aborted |"));
        assert!(md.contains("## Latency (ms)"));
        assert!(md.contains("3.00*"));
        assert!(md.contains("- **broken**: connection refused"));
        assert!(!md.contains("## Resources"));
    }

    #[test]
    fn table_has_totals() {
        let table = render_table(&summary());
        assert!(table.contains("aborted"));
        assert!(table.contains("total: 2 scenarios (1 aborted), sent 200, received 194, loss 3.00%"));
    }

    #[test]
    fn writes_both_files() {
        let dir = std::env::temp_dir().join(format!("fwd-bench-report-{}", uuid::Uuid::new_v4().simple()));
        let (json, md) = write_reports(&dir, "latency", &summary()).unwrap();
        let parsed: serde_json::Value = serde_json::from_str(&std::fs::read_to_string(&json).unwrap()).unwrap();
        assert_eq!(parsed["run_id"], "20261019_120000");
        assert_eq!(parsed["scenarios"][0]["latency"]["samples"], 3);
        assert!(std::fs::read_to_string(&md).unwrap().starts_with("# MQTT Forwarder"));
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn percentile_marker() {
        let l = LatencySummary::from_samples(&[5.0], true).unwrap();
        assert_eq!(pct(&l.p95), "5.00*");
    }
}

use std::fmt;
use std::time::Duration;

use clap::ValueEnum;
use serde::Deserialize;

use bench_engine::{PayloadSpec, Scenario};

/// Встроенные наборы сценариев.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum Suite {
    /// 100/200/500/1000 сообщений RTU-телеметрии
    Load,
    /// 1000 × 100 B по 10 sub-topic'ам
    Throughput,
    /// 100 correlated сообщений при 100 msg/s
    Latency,
    /// Пачки 500/1000 × 10/50/100 с паузой на восстановление
    Stress,
    /// Всё вышеперечисленное
    All,
}

const TELEMETRY: PayloadSpec = PayloadSpec::Telemetry { min_points: 10, max_points: 200 };

impl Suite {
    pub const ALL: [Suite; 5] = [Suite::Load, Suite::Throughput, Suite::Latency, Suite::Stress, Suite::All];

    pub fn scenarios(self) -> Vec<Scenario> {
        match self {
            Suite::Load => [100, 200, 500, 1000]
                .into_iter()
                .map(|n| Scenario::messages(format!("load-{n}"), n, TELEMETRY))
                .collect(),
            Suite::Throughput => vec![
                Scenario::messages("throughput-1000x100B", 1000, PayloadSpec::Fixed { bytes: 100 })
                    .with_fanout(10),
            ],
            Suite::Latency => vec![
                Scenario::messages("latency-100@100", 100, PayloadSpec::Fixed { bytes: 100 })
                    .with_rate(100.0)
                    .correlated(),
            ],
            Suite::Stress => [(500, 10), (500, 50), (500, 100), (1000, 10), (1000, 50), (1000, 100)]
                .into_iter()
                .map(|(size, count)| {
                    Scenario::batches(format!("stress-{size}x{count}"), size, count, TELEMETRY)
                })
                .collect(),
            Suite::All => [Suite::Load, Suite::Throughput, Suite::Latency, Suite::Stress]
                .into_iter()
                .flat_map(Suite::scenarios)
                .collect(),
        }
    }

    /// Пауза между сценариями, если не задана явно.
    pub fn default_cooldown(self) -> Duration {
        match self {
            Suite::Stress | Suite::All => Duration::from_secs(10),
            _ => Duration::ZERO,
        }
    }
}

impl fmt::Display for Suite {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Suite::Load => "load",
            Suite::Throughput => "throughput",
            Suite::Latency => "latency",
            Suite::Stress => "stress",
            Suite::All => "all",
        };
        f.write_str(name)
    }
}

/// `fwd-bench suites`: напечатать наборы и их сценарии.
pub fn list() {
    for suite in Suite::ALL {
        let scenarios = suite.scenarios();
        println!("{suite} ({} scenarios, cooldown {}s)", scenarios.len(), suite.default_cooldown().as_secs());
        if suite == Suite::All {
            continue;
        }
        for s in scenarios {
            let rate = s.rate.map(|r| format!(" @ {r} msg/s")).unwrap_or_default();
            let correlate = if s.correlate { " correlated" } else { "" };
            println!("  {:<24} {:>6} msgs  {}{rate}{correlate}", s.name, s.load.total(), s.payload);
        }
    }
}

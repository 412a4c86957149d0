use std::path::PathBuf;
use std::time::Duration;

use clap::{Args, Parser, Subcommand, ValueEnum};
use serde::Deserialize;

use adapter_mosquitto_cli::CliSettings;
use adapter_mqtt::MqttSettings;
use bench_api::{EndpointAddr, EndpointRole};
use bench_engine::{RunnerConfig, Scenario};

use crate::cmd::suites::Suite;
use crate::error::FwdBenchError;

#[derive(Parser)]
#[command(name = "fwd-bench", about = "Нагрузочный стенд для MQTT forwarder'а")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Прогнать набор сценариев
    Run(RunArgs),
    /// Показать встроенные наборы сценариев
    Suites,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, ValueEnum)]
#[serde(rename_all = "kebab-case")]
pub enum AdapterKind {
    Mqtt,
    MosquittoCli,
    Loopback,
}

// ═══════════════════════════════════════════════════════════════
//  CLI args
// ═══════════════════════════════════════════════════════════════

#[derive(Args, Clone, Debug)]
pub struct RunArgs {
    /// Путь к fwd-bench.toml
    #[arg(long, default_value = "fwd-bench.toml", env = "FWD_BENCH_CONFIG")]
    pub config: String,

    /// Встроенный набор сценариев
    #[arg(long, value_enum)]
    pub suite: Option<Suite>,

    /// Endpoint adapter
    #[arg(long, value_enum)]
    pub adapter: Option<AdapterKind>,

    /// Broker, в который публикуем (вход forwarder'а)
    #[arg(long, env = "DOWNSTREAM_HOST")]
    pub downstream_host: Option<String>,

    #[arg(long, env = "DOWNSTREAM_PORT")]
    pub downstream_port: Option<u16>,

    /// Broker, на котором слушаем (выход forwarder'а)
    #[arg(long, env = "UPSTREAM_HOST")]
    pub upstream_host: Option<String>,

    #[arg(long, env = "UPSTREAM_PORT")]
    pub upstream_port: Option<u16>,

    /// Base topic, напр. /ge/web
    #[arg(long, env = "TOPIC_BASE")]
    pub topic_base: Option<String>,

    /// Контейнер для сэмплирования CPU/памяти
    #[arg(long, env = "BENCH_TARGET")]
    pub target: Option<String>,

    /// Не сэмплировать ресурсы
    #[arg(long)]
    pub no_sample: bool,

    /// MQTT QoS (0, 1, 2)
    #[arg(long)]
    pub qos: Option<u8>,

    /// docker compose файл для mosquitto-cli adapter'а
    #[arg(long)]
    pub compose_file: Option<String>,

    /// Пауза между сценариями, секунды
    #[arg(long)]
    pub cooldown: Option<f64>,

    /// Пауза после подписки перед отправкой, мс
    #[arg(long)]
    pub settle_ms: Option<u64>,

    /// Подряд идущих ошибок publish до abort (0 = никогда)
    #[arg(long)]
    pub failure_threshold: Option<u32>,

    /// Каталог для отчётов
    #[arg(long)]
    pub results_dir: Option<PathBuf>,

    /// Идентификатор прогона (по умолчанию: timestamp)
    #[arg(long)]
    pub run_id: Option<String>,
}

// ═══════════════════════════════════════════════════════════════
//  Config file (TOML)
// ═══════════════════════════════════════════════════════════════

#[derive(Debug, Default, Deserialize)]
pub struct Config {
    pub suite: Option<Suite>,
    pub adapter: Option<AdapterKind>,
    pub cooldown_secs: Option<f64>,
    pub results_dir: Option<PathBuf>,
    #[serde(default)]
    pub downstream: EndpointConfig,
    #[serde(default)]
    pub upstream: EndpointConfig,
    #[serde(default)]
    pub runner: RunnerSection,
    #[serde(default)]
    pub mqtt: MqttSettings,
    #[serde(default)]
    pub mosquitto: CliSettings,
    #[serde(default)]
    pub scenarios: Vec<Scenario>,
}

#[derive(Debug, Default, Deserialize)]
pub struct EndpointConfig {
    pub host: Option<String>,
    pub port: Option<u16>,
}

#[derive(Debug, Default, Deserialize)]
pub struct RunnerSection {
    pub topic_base: Option<String>,
    pub settle_ms: Option<u64>,
    pub drain_min_secs: Option<u64>,
    pub drain_per_message_ms: Option<u64>,
    pub failure_threshold: Option<u32>,
    pub sample_interval_ms: Option<u64>,
    pub target: Option<String>,
    /// false: не сэмплировать ресурсы.
    pub sample: Option<bool>,
}

pub fn load_config(path: &str) -> Result<Config, FwdBenchError> {
    let content = std::fs::read_to_string(path)
        .map_err(|e| FwdBenchError::Config(format!("cannot read config {path}: {e}")))?;
    parse_config(&content).map_err(|e| FwdBenchError::Config(format!("bad config {path}: {e}")))
}

pub fn parse_config(content: &str) -> Result<Config, toml::de::Error> {
    toml::from_str(content)
}

// ═══════════════════════════════════════════════════════════════
//  Effective: merged config
// ═══════════════════════════════════════════════════════════════

/// Итоговая конфигурация после мержа: fwd-bench.toml < env/CLI
#[derive(Debug)]
pub struct Effective {
    pub adapter: AdapterKind,
    pub downstream: EndpointAddr,
    pub upstream: EndpointAddr,
    pub runner: RunnerConfig,
    pub mqtt: MqttSettings,
    pub mosquitto: CliSettings,
    pub suite_name: String,
    pub scenarios: Vec<Scenario>,
    pub cooldown: Duration,
    pub results_dir: PathBuf,
    pub run_id: String,
}

impl Effective {
    pub fn new(args: &RunArgs) -> Result<Self, FwdBenchError> {
        let cfg = match load_config(&args.config) {
            Ok(c) => c,
            Err(e) => {
                if std::path::Path::new(&args.config).exists() {
                    return Err(e);
                }
                Config::default()
            }
        };
        Self::merge(args, cfg)
    }

    pub fn merge(args: &RunArgs, cfg: Config) -> Result<Self, FwdBenchError> {
        let defaults = RunnerConfig::default();
        let r = &cfg.runner;

        let sample = !args.no_sample && r.sample.unwrap_or(true);
        let target = args
            .target
            .clone()
            .or_else(|| r.target.clone())
            .unwrap_or_else(|| "tests-mqtt-forwarder-1".into());

        let runner = RunnerConfig {
            topic_base: args
                .topic_base
                .clone()
                .or_else(|| r.topic_base.clone())
                .unwrap_or(defaults.topic_base),
            settle: args
                .settle_ms
                .or(r.settle_ms)
                .map(Duration::from_millis)
                .unwrap_or(defaults.settle),
            drain_min: r.drain_min_secs.map(Duration::from_secs).unwrap_or(defaults.drain_min),
            drain_per_message: r
                .drain_per_message_ms
                .map(Duration::from_millis)
                .unwrap_or(defaults.drain_per_message),
            failure_threshold: args
                .failure_threshold
                .or(r.failure_threshold)
                .unwrap_or(defaults.failure_threshold),
            sample_interval: r
                .sample_interval_ms
                .map(Duration::from_millis)
                .unwrap_or(defaults.sample_interval),
            sampler_target: sample.then_some(target),
            ..defaults
        };

        if !bench_api::valid_topic(&runner.topic_base) {
            return Err(FwdBenchError::Config(format!("invalid topic base: {}", runner.topic_base)));
        }

        let mut mqtt = cfg.mqtt;
        let mut mosquitto = cfg.mosquitto;
        if let Some(qos) = args.qos {
            mqtt.qos = qos;
            mosquitto.qos = qos;
        }
        if qos_invalid(mqtt.qos) || qos_invalid(mosquitto.qos) {
            return Err(FwdBenchError::Config(format!("invalid QoS: {}", mqtt.qos.max(mosquitto.qos))));
        }
        if args.compose_file.is_some() {
            mosquitto.compose_file = args.compose_file.clone();
        }

        let suite = args.suite.or(cfg.suite);
        let (suite_name, scenarios) = match suite {
            Some(suite) => (suite.to_string(), suite.scenarios()),
            None if !cfg.scenarios.is_empty() => ("custom".to_string(), cfg.scenarios),
            None => (Suite::Load.to_string(), Suite::Load.scenarios()),
        };
        if scenarios.iter().any(|s| s.load.total() == 0) {
            return Err(FwdBenchError::Config("scenario with zero messages".into()));
        }

        let cooldown_secs = args
            .cooldown
            .or(cfg.cooldown_secs)
            .or_else(|| suite.map(|s| s.default_cooldown().as_secs_f64()))
            .unwrap_or(0.0);
        let cooldown = Duration::try_from_secs_f64(cooldown_secs)
            .map_err(|e| FwdBenchError::Config(format!("bad cooldown {cooldown_secs}: {e}")))?;

        let run_id = args.run_id.clone().unwrap_or_else(default_run_id);

        Ok(Self {
            adapter: args.adapter.or(cfg.adapter).unwrap_or(AdapterKind::Mqtt),
            downstream: EndpointAddr::new(
                EndpointRole::Downstream,
                args.downstream_host
                    .clone()
                    .or(cfg.downstream.host)
                    .unwrap_or_else(|| "127.0.0.1".into()),
                args.downstream_port.or(cfg.downstream.port).unwrap_or(1885),
            ),
            upstream: EndpointAddr::new(
                EndpointRole::Upstream,
                args.upstream_host
                    .clone()
                    .or(cfg.upstream.host)
                    .unwrap_or_else(|| "127.0.0.1".into()),
                args.upstream_port.or(cfg.upstream.port).unwrap_or(1884),
            ),
            runner,
            mqtt,
            mosquitto,
            suite_name,
            scenarios,
            cooldown,
            results_dir: args
                .results_dir
                .clone()
                .or(cfg.results_dir)
                .unwrap_or_else(|| PathBuf::from("results")),
            run_id,
        })
    }
}

fn qos_invalid(qos: u8) -> bool {
    qos > 2
}

/// `YYYYMMDD_HHMMSS` (UTC).
fn default_run_id() -> String {
    let stamp = bench_api::datetime_from_us(bench_api::now_us());
    stamp.replace('-', "").replace(':', "").replace(' ', "_")
}

#[cfg(test)]
mod tests {
    use super::*;
    use bench_engine::{LoadShape, PayloadSpec};

    fn args() -> RunArgs {
        RunArgs {
            config: "missing.toml".into(),
            suite: None,
            adapter: None,
            downstream_host: None,
            downstream_port: None,
            upstream_host: None,
            upstream_port: None,
            topic_base: None,
            target: None,
            no_sample: false,
            qos: None,
            compose_file: None,
            cooldown: None,
            settle_ms: None,
            failure_threshold: None,
            results_dir: None,
            run_id: Some("test".into()),
        }
    }

    #[test]
    fn defaults_without_config_file() {
        let eff = Effective::new(&args()).unwrap();
        assert_eq!(eff.adapter, AdapterKind::Mqtt);
        assert_eq!(eff.downstream.port, 1885);
        assert_eq!(eff.upstream.port, 1884);
        assert_eq!(eff.runner.topic_base, "/ge/web");
        assert_eq!(eff.runner.settle, Duration::from_secs(2));
        assert_eq!(eff.runner.failure_threshold, 50);
        assert_eq!(eff.runner.sampler_target.as_deref(), Some("tests-mqtt-forwarder-1"));
        assert_eq!(eff.suite_name, "load");
        assert_eq!(eff.scenarios.len(), 4);
        assert_eq!(eff.cooldown, Duration::ZERO);
    }

    #[test]
    fn cli_overrides_file() {
        let cfg = parse_config(
            r#"
            adapter = "loopback"
            cooldown_secs = 3

            [downstream]
            host = "broker-a"
            port = 2883

            [runner]
            topic_base = "/bench"
            failure_threshold = 7
            sample = false
            "#,
        )
        .unwrap();
        let mut a = args();
        a.downstream_port = Some(9999);
        a.adapter = Some(AdapterKind::MosquittoCli);
        a.qos = Some(1);

        let eff = Effective::merge(&a, cfg).unwrap();
        assert_eq!(eff.adapter, AdapterKind::MosquittoCli);
        assert_eq!(eff.downstream.host, "broker-a");
        assert_eq!(eff.downstream.port, 9999);
        assert_eq!(eff.runner.topic_base, "/bench");
        assert_eq!(eff.runner.failure_threshold, 7);
        assert_eq!(eff.runner.sampler_target, None);
        assert_eq!(eff.mqtt.qos, 1);
        assert_eq!(eff.mosquitto.qos, 1);
        assert_eq!(eff.cooldown, Duration::from_secs(3));
    }

    #[test]
    fn custom_scenarios_from_file() {
        let cfg = parse_config(
            r#"
            [[scenarios]]
            name = "tiny"
            messages = 10
            correlate = true
            payload = { kind = "fixed", bytes = 64 }

            [[scenarios]]
            name = "bursts"
            batch_size = 20
            batch_count = 2
            payload = { kind = "telemetry", min_points = 10, max_points = 200 }
            "#,
        )
        .unwrap();
        let eff = Effective::merge(&args(), cfg).unwrap();
        assert_eq!(eff.suite_name, "custom");
        assert_eq!(eff.scenarios.len(), 2);
        assert_eq!(eff.scenarios[0].payload, PayloadSpec::Fixed { bytes: 64 });
        assert!(eff.scenarios[0].correlate);
        assert_eq!(eff.scenarios[1].load, LoadShape::Batches { batch_size: 20, batch_count: 2 });
    }

    #[test]
    fn stress_suite_defaults_to_recovery_pause() {
        let mut a = args();
        a.suite = Some(Suite::Stress);
        let eff = Effective::merge(&a, Config::default()).unwrap();
        assert_eq!(eff.scenarios.len(), 6);
        assert_eq!(eff.cooldown, Duration::from_secs(10));
    }

    #[test]
    fn rejects_bad_values() {
        let mut a = args();
        a.qos = Some(5);
        assert!(Effective::merge(&a, Config::default()).is_err());

        let mut a = args();
        a.topic_base = Some("/ge/+".into());
        assert!(Effective::merge(&a, Config::default()).is_err());

        let mut a = args();
        a.cooldown = Some(-1.0);
        assert!(Effective::merge(&a, Config::default()).is_err());
    }

    #[test]
    fn invalid_file_is_an_error() {
        assert!(parse_config("adapter = 5").is_err());
    }
}

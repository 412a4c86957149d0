use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

// ═══════════════════════════════════════════════════════════════
//  Payload Spec
// ═══════════════════════════════════════════════════════════════

/// Форма и размер генерируемых payload'ов.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum PayloadSpec {
    /// `{"data":"xxx..."}`, дополненный ровно до `bytes` байт.
    Fixed { bytes: usize },
    /// Как Fixed, но размер равномерно в `[min, max]` на каждое сообщение.
    Range { min: usize, max: usize },
    /// JSON-массив из `[min_points, max_points]` точек RTU-телеметрии.
    Telemetry { min_points: usize, max_points: usize },
}

impl Default for PayloadSpec {
    fn default() -> Self {
        Self::Fixed { bytes: 100 }
    }
}

impl fmt::Display for PayloadSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Fixed { bytes } => write!(f, "{bytes}B"),
            Self::Range { min, max } => write!(f, "{min}..{max}B"),
            Self::Telemetry { min_points, max_points } => {
                write!(f, "telemetry[{min_points}..{max_points}]")
            }
        }
    }
}

// ═══════════════════════════════════════════════════════════════
//  Load Shape
// ═══════════════════════════════════════════════════════════════

/// Сколько и как отправлять: поштучно или пачками.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum LoadShape {
    Batches { batch_size: u64, batch_count: u64 },
    Messages { messages: u64 },
}

impl LoadShape {
    /// Полное число сообщений сценария.
    pub fn total(&self) -> u64 {
        match *self {
            Self::Messages { messages } => messages,
            Self::Batches { batch_size, batch_count } => batch_size * batch_count,
        }
    }

    /// Число publish-попыток (пачка = одна попытка).
    pub fn attempts(&self) -> u64 {
        match *self {
            Self::Messages { messages } => messages,
            Self::Batches { batch_count, .. } => batch_count,
        }
    }

    pub fn batch_size(&self) -> u64 {
        match *self {
            Self::Messages { .. } => 1,
            Self::Batches { batch_size, .. } => batch_size,
        }
    }

    pub fn is_batched(&self) -> bool {
        matches!(self, Self::Batches { .. })
    }
}

// ═══════════════════════════════════════════════════════════════
//  Scenario
// ═══════════════════════════════════════════════════════════════

/// Один прогон: нагрузка + форма payload'а + темп.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Scenario {
    pub name: String,
    #[serde(flatten)]
    pub load: LoadShape,
    #[serde(default)]
    pub payload: PayloadSpec,
    /// Сообщений (или пачек) в секунду. None = без ограничения.
    #[serde(default)]
    pub rate: Option<f64>,
    /// Встраивать correlation id + timestamp и мерить latency.
    #[serde(default)]
    pub correlate: bool,
    /// Число sub-topic'ов, по которым сообщения раскладываются round-robin.
    #[serde(default = "default_fanout")]
    pub fanout: u32,
}

fn default_fanout() -> u32 {
    1
}

impl Scenario {
    pub fn messages(name: impl Into<String>, messages: u64, payload: PayloadSpec) -> Self {
        Self {
            name: name.into(),
            load: LoadShape::Messages { messages },
            payload,
            rate: None,
            correlate: false,
            fanout: default_fanout(),
        }
    }

    pub fn batches(
        name: impl Into<String>,
        batch_size: u64,
        batch_count: u64,
        payload: PayloadSpec,
    ) -> Self {
        Self {
            name: name.into(),
            load: LoadShape::Batches { batch_size, batch_count },
            payload,
            rate: None,
            correlate: false,
            fanout: default_fanout(),
        }
    }

    pub fn with_rate(mut self, rate: f64) -> Self {
        self.rate = Some(rate);
        self
    }

    pub fn correlated(mut self) -> Self {
        self.correlate = true;
        self
    }

    pub fn with_fanout(mut self, fanout: u32) -> Self {
        self.fanout = fanout.max(1);
        self
    }

    /// Интервал между попытками publish при заданном rate.
    pub fn pacing(&self) -> Option<Duration> {
        self.rate
            .filter(|r| r.is_finite() && *r > 0.0)
            .map(|r| Duration::from_secs_f64(1.0 / r))
    }
}

// ═══════════════════════════════════════════════════════════════
//  Runner Config
// ═══════════════════════════════════════════════════════════════

/// Тайминги и пороги, общие для всех сценариев прогона.
#[derive(Debug, Clone)]
pub struct RunnerConfig {
    /// Base topic; каждый сценарий получает свой `{base}/{suffix}`.
    pub topic_base: String,
    /// Пауза между подпиской и первым publish.
    pub settle: Duration,
    /// Drain timeout = `drain_min + drain_per_message × expected`.
    pub drain_min: Duration,
    pub drain_per_message: Duration,
    /// Подряд идущих ошибок publish до abort. 0 = не прерывать.
    pub failure_threshold: u32,
    pub sample_interval: Duration,
    /// Контейнер/процесс для ResourceProbe. None = без сэмплирования.
    pub sampler_target: Option<String>,
    /// Сколько ждать остановки listener'а/sampler'а при shutdown.
    pub join_wait: Duration,
    /// Ёмкость таблицы ранних доставок в ledger'е.
    pub early_capacity: usize,
    /// Логировать прогресс publisher'а каждые N сообщений.
    pub progress_every: u64,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            topic_base: "/ge/web".into(),
            settle: Duration::from_secs(2),
            drain_min: Duration::from_secs(60),
            drain_per_message: Duration::from_millis(10),
            failure_threshold: 50,
            sample_interval: Duration::from_millis(500),
            sampler_target: None,
            join_wait: Duration::from_secs(5),
            early_capacity: 100_000,
            progress_every: 500,
        }
    }
}

impl RunnerConfig {
    pub fn drain_timeout(&self, expected: u64) -> Duration {
        let per = self
            .drain_per_message
            .saturating_mul(u32::try_from(expected).unwrap_or(u32::MAX));
        self.drain_min.saturating_add(per)
    }
}

// ═══════════════════════════════════════════════════════════════
//  Topic Plan
// ═══════════════════════════════════════════════════════════════

/// Топики одного сценария: уникальный run path + fan-out sub-topic'и.
#[derive(Debug, Clone)]
pub struct TopicPlan {
    run_path: String,
    fanout: u32,
}

impl TopicPlan {
    pub fn new(base: &str, suffix: &str, fanout: u32) -> Self {
        Self {
            run_path: format!("{}/{suffix}", base.trim_end_matches('/')),
            fanout: fanout.max(1),
        }
    }

    /// Новый план со случайным 8-символьным suffix'ом.
    pub fn fresh(base: &str, fanout: u32) -> Self {
        let id = uuid::Uuid::new_v4().simple().to_string();
        Self::new(base, &id[..8], fanout)
    }

    pub fn run_path(&self) -> &str {
        &self.run_path
    }

    /// Filter подписки, покрывающий все topic'и сценария.
    pub fn filter(&self) -> String {
        format!("{}/#", self.run_path)
    }

    /// Topic для i-го сообщения (0-based).
    pub fn topic_for(&self, index: u64) -> String {
        if self.fanout <= 1 {
            self.run_path.clone()
        } else {
            format!("{}/device_{}", self.run_path, index % u64::from(self.fanout))
        }
    }

    /// Каждая пачка уходит в свой sub-topic.
    pub fn batch_topic(&self, batch: u64) -> String {
        format!("{}/batch_{batch}", self.run_path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bench_api::topic_matches;

    #[test]
    fn drain_timeout_scales_with_expected() {
        let cfg = RunnerConfig::default();
        assert_eq!(cfg.drain_timeout(0), Duration::from_secs(60));
        assert_eq!(cfg.drain_timeout(1000), Duration::from_secs(70));
    }

    #[test]
    fn topic_plan_filter_covers_all_topics() {
        let plan = TopicPlan::new("/ge/web/", "ab12cd34", 10);
        assert_eq!(plan.run_path(), "/ge/web/ab12cd34");
        let filter = plan.filter();
        assert_eq!(plan.topic_for(13), "/ge/web/ab12cd34/device_3");
        assert!(topic_matches(&filter, &plan.topic_for(13)));
        assert!(topic_matches(&filter, &plan.batch_topic(4)));

        let single = TopicPlan::new("/ge/web", "ab12cd34", 1);
        assert_eq!(single.topic_for(7), "/ge/web/ab12cd34");
        assert!(topic_matches(&single.filter(), &single.topic_for(7)));
    }

    #[test]
    fn fresh_plans_do_not_collide() {
        let a = TopicPlan::fresh("/ge/web", 1);
        let b = TopicPlan::fresh("/ge/web", 1);
        assert_ne!(a.run_path(), b.run_path());
    }

    #[test]
    fn load_shape_totals() {
        let batches = LoadShape::Batches { batch_size: 500, batch_count: 10 };
        assert_eq!(batches.total(), 5000);
        assert_eq!(batches.attempts(), 10);
        let single = LoadShape::Messages { messages: 42 };
        assert_eq!(single.total(), 42);
        assert_eq!(single.batch_size(), 1);
    }

    #[test]
    fn scenario_pacing() {
        let s = Scenario::messages("lat", 100, PayloadSpec::default()).with_rate(100.0);
        assert_eq!(s.pacing(), Some(Duration::from_millis(10)));
        assert_eq!(Scenario::messages("x", 1, PayloadSpec::default()).pacing(), None);
        assert_eq!(
            Scenario::messages("x", 1, PayloadSpec::default()).with_rate(0.0).pacing(),
            None
        );
    }

    #[test]
    fn scenario_deserializes_flattened_load() {
        let s: Scenario = serde_json::from_str(
            r#"{"name":"b","batch_size":50,"batch_count":3,
                "payload":{"kind":"telemetry","min_points":10,"max_points":20}}"#,
        )
        .unwrap();
        assert_eq!(s.load, LoadShape::Batches { batch_size: 50, batch_count: 3 });
        assert_eq!(s.fanout, 1);

        let m: Scenario = serde_json::from_str(r#"{"name":"m","messages":7,"correlate":true}"#).unwrap();
        assert_eq!(m.load.total(), 7);
        assert!(m.correlate);
        assert_eq!(m.payload, PayloadSpec::Fixed { bytes: 100 });
    }
}

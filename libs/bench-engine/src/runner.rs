use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use bench_api::{AdapterFactory, EndpointAdapter, EndpointAddr, ResourceProbe, Usage, now_us};

use crate::config::{RunnerConfig, Scenario, TopicPlan};
use crate::error::EngineError;
use crate::generator::Generator;
use crate::ledger::Ledger;
use crate::listener::{ListenerHandle, spawn_listener};
use crate::metrics::{
    ResourceSummary, RunRecord, ScenarioResult, ScenarioStatus, SuiteSummary, aggregate,
};
use crate::publisher::{PublishPlan, spawn_publisher};
use crate::sampler::{ResourceSample, Sampler, spawn_sampler};

// ═══════════════════════════════════════════════════════════════
//  Run phase
// ═══════════════════════════════════════════════════════════════

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunPhase {
    Idle,
    ReceiverStarting,
    Sending,
    Draining,
    Aggregating,
    Done,
    Aborted,
}

/// Текущая фаза сценария; каждый переход логируется.
struct PhaseTracker<'a> {
    scenario: &'a str,
    phase: RunPhase,
}

impl<'a> PhaseTracker<'a> {
    fn new(scenario: &'a str) -> Self {
        Self { scenario, phase: RunPhase::Idle }
    }

    fn advance(&mut self, next: RunPhase) {
        tracing::debug!(scenario = %self.scenario, from = ?self.phase, to = ?next, "phase");
        self.phase = next;
    }
}

// ═══════════════════════════════════════════════════════════════
//  Per-run resources
// ═══════════════════════════════════════════════════════════════

/// Всё, что сценарий открыл и обязан закрыть при любом исходе.
#[derive(Default)]
struct RunResources {
    upstream: Option<Arc<dyn EndpointAdapter>>,
    downstream: Option<Arc<dyn EndpointAdapter>>,
    listener: Option<ListenerHandle>,
    sampler: Option<(Sampler, JoinHandle<Vec<ResourceSample>>)>,
    baseline: Option<Usage>,
    sending_started: Option<Instant>,
}

/// Что осталось после shutdown'а.
struct Released {
    first_payload: Option<String>,
    resources: Option<ResourceSummary>,
}

impl RunResources {
    async fn shutdown(mut self, token: &CancellationToken, wait: Duration) -> Released {
        token.cancel();

        let first_payload = match self.listener.take() {
            Some(listener) => listener.stop(wait).await.first_payload,
            None => None,
        };

        let resources = match self.sampler.take() {
            Some((sampler, mut handle)) => {
                let samples = match tokio::time::timeout(wait, &mut handle).await {
                    Ok(Ok(samples)) => samples,
                    Ok(Err(e)) => {
                        tracing::error!(error = %e, "sampler task failed");
                        Vec::new()
                    }
                    Err(_) => {
                        tracing::warn!("sampler did not stop in time, detaching");
                        Vec::new()
                    }
                };
                let (final_usage, _) = sampler.sample_once().await;
                Some(ResourceSummary::new(
                    sampler.target().to_string(),
                    self.baseline.take(),
                    Some(final_usage),
                    samples,
                ))
            }
            None => None,
        };

        if let Some(upstream) = self.upstream.take() {
            upstream.close().await;
        }
        if let Some(downstream) = self.downstream.take() {
            downstream.close().await;
        }

        Released { first_payload, resources }
    }
}

// ═══════════════════════════════════════════════════════════════
//  Scenario Runner
// ═══════════════════════════════════════════════════════════════

/// Прогоняет сценарии по одному: подписка на upstream → settle →
/// publish в downstream → drain → агрегация.
pub struct ScenarioRunner {
    factory: Arc<dyn AdapterFactory>,
    probe: Option<Arc<dyn ResourceProbe>>,
    downstream: EndpointAddr,
    upstream: EndpointAddr,
    config: RunnerConfig,
}

impl ScenarioRunner {
    pub fn new(
        factory: Arc<dyn AdapterFactory>,
        downstream: EndpointAddr,
        upstream: EndpointAddr,
        config: RunnerConfig,
    ) -> Self {
        Self { factory, probe: None, downstream, upstream, config }
    }

    /// Включить сэмплирование ресурсов (нужен `config.sampler_target`).
    pub fn with_probe(mut self, probe: Arc<dyn ResourceProbe>) -> Self {
        self.probe = Some(probe);
        self
    }

    pub fn config(&self) -> &RunnerConfig {
        &self.config
    }

    /// Прогнать один сценарий. Никогда не паникует и не теряет сценарий:
    /// любой исход превращается в ScenarioResult.
    pub async fn run(&self, scenario: &Scenario) -> ScenarioResult {
        let mut phase = PhaseTracker::new(&scenario.name);
        let started_at_us = now_us();
        let topics = TopicPlan::fresh(&self.config.topic_base, scenario.fanout);
        let ledger = Arc::new(Ledger::new(self.config.early_capacity));
        let token = CancellationToken::new();
        let mut run = RunResources::default();

        tracing::info!(
            scenario = %scenario.name,
            topic = %topics.run_path(),
            messages = scenario.load.total(),
            payload = %scenario.payload,
            adapter = %self.factory.kind(),
            "scenario started"
        );

        let outcome = self.drive(scenario, &topics, &ledger, &token, &mut run, &mut phase).await;
        let elapsed_s = run
            .sending_started
            .map(|s| s.elapsed().as_secs_f64())
            .unwrap_or_default();

        let status = match outcome {
            Ok(drained) => {
                phase.advance(RunPhase::Aggregating);
                ScenarioStatus::Completed { drained }
            }
            Err(e) => {
                tracing::error!(scenario = %scenario.name, error = %e, "scenario aborted");
                phase.advance(RunPhase::Aborted);
                ScenarioStatus::Aborted { reason: e.abort_reason() }
            }
        };

        let released = run.shutdown(&token, self.config.join_wait).await;
        if phase.phase == RunPhase::Aggregating {
            phase.advance(RunPhase::Done);
        }

        let result = aggregate(&RunRecord {
            scenario: scenario.clone(),
            topic: topics.run_path().to_string(),
            started_at_us,
            status,
            phase: phase.phase,
            counters: ledger.snapshot(),
            elapsed_s,
            resources: released.resources,
            sample_message: released.first_payload,
        });

        if result.loss_rate < 0.0 {
            tracing::warn!(
                scenario = %result.name,
                sent = result.sent,
                received = result.received,
                "received more than sent; stragglers from an earlier run?"
            );
        }
        tracing::info!(
            scenario = %result.name,
            sent = result.sent,
            received = result.received,
            throughput = %format!("{:.1}", result.throughput),
            loss_rate = %format!("{:.2}", result.loss_rate),
            aborted = result.is_aborted(),
            "scenario finished"
        );
        result
    }

    /// Возвращает `drained`: дождались ли всех ожидаемых доставок.
    async fn drive(
        &self,
        scenario: &Scenario,
        topics: &TopicPlan,
        ledger: &Arc<Ledger>,
        token: &CancellationToken,
        run: &mut RunResources,
        phase: &mut PhaseTracker<'_>,
    ) -> Result<bool, EngineError> {
        let expected = scenario.load.total();
        phase.advance(RunPhase::ReceiverStarting);

        let upstream = self.connect(&self.upstream).await?;
        run.upstream = Some(upstream.clone());
        let downstream = self.connect(&self.downstream).await?;
        run.downstream = Some(downstream.clone());

        if let (Some(probe), Some(target)) = (&self.probe, &self.config.sampler_target) {
            let sampler = Sampler::new(probe.clone(), target.clone(), self.config.sample_interval);
            let (baseline, _) = sampler.sample_once().await;
            run.baseline = Some(baseline);
            let budget = self.config.settle + self.config.drain_timeout(expected) * 2;
            let handle = spawn_sampler(sampler.clone(), budget, token.child_token());
            run.sampler = Some((sampler, handle));
        }

        let filter = topics.filter();
        let sub = upstream
            .subscribe(&filter)
            .await
            .map_err(|source| EngineError::Subscription { filter: filter.clone(), source })?;
        run.listener = Some(spawn_listener(
            sub,
            ledger.clone(),
            Some(expected),
            scenario.correlate,
            token.child_token(),
        ));

        // Подписка должна успеть зарегистрироваться у broker'а.
        tokio::time::sleep(self.config.settle).await;

        phase.advance(RunPhase::Sending);
        run.sending_started = Some(Instant::now());
        let plan = PublishPlan {
            topics: topics.clone(),
            load: scenario.load,
            payload: scenario.payload.clone(),
            pacing: scenario.pacing(),
            failure_threshold: self.config.failure_threshold,
            progress_every: self.config.progress_every,
        };
        let publisher = spawn_publisher(
            downstream,
            ledger.clone(),
            plan,
            Generator::new(scenario.correlate),
            token.child_token(),
        );
        let outcome = publisher.await??;
        phase.advance(RunPhase::Draining);
        if outcome.cancelled {
            tracing::warn!(scenario = %scenario.name, sent = outcome.attempted, "publisher cancelled");
            return Ok(false);
        }

        // Ждём только то, что broker принял: отвергнутые publish'и не придут.
        let target = outcome.accepted.min(expected);
        let timeout = self.config.drain_timeout(target);
        let mut received = ledger.watch_received();
        let drained = matches!(
            tokio::time::timeout(timeout, received.wait_for(|n| *n >= target)).await,
            Ok(Ok(_))
        );
        if !drained {
            tracing::warn!(
                scenario = %scenario.name,
                received = ledger.received(),
                expected = target,
                timeout_s = timeout.as_secs(),
                "drain timeout elapsed"
            );
        }
        Ok(drained)
    }

    async fn connect(&self, endpoint: &EndpointAddr) -> Result<Arc<dyn EndpointAdapter>, EngineError> {
        self.factory.connect(endpoint).await.map_err(|source| {
            tracing::error!(%endpoint, error = %source, "endpoint unreachable");
            EngineError::Connection { endpoint: endpoint.to_string(), source }
        })
    }

    /// Прогнать сценарии строго последовательно с паузой между ними.
    pub async fn run_suite(
        &self,
        run_id: String,
        scenarios: &[Scenario],
        cooldown: Duration,
    ) -> SuiteSummary {
        let started_at_us = now_us();
        let mut results = Vec::with_capacity(scenarios.len());

        for (i, scenario) in scenarios.iter().enumerate() {
            if i > 0 && !cooldown.is_zero() {
                tracing::info!(cooldown_s = cooldown.as_secs_f64(), "cooling down");
                tokio::time::sleep(cooldown).await;
            }
            results.push(self.run(scenario).await);
        }

        SuiteSummary::merge(run_id, started_at_us, now_us(), results)
    }
}

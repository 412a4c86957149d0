use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::{Interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use bench_api::{BenchError, EndpointAdapter, Message};

use crate::config::{LoadShape, PayloadSpec, TopicPlan};
use crate::error::EngineError;
use crate::generator::Generator;
use crate::ledger::{Ledger, SendRecord};

/// Что и как публикует один publisher.
#[derive(Debug, Clone)]
pub struct PublishPlan {
    pub topics: TopicPlan,
    pub load: LoadShape,
    pub payload: PayloadSpec,
    /// Пауза между попытками (сообщениями или пачками).
    pub pacing: Option<Duration>,
    /// 0 = ошибки publish никогда не прерывают сценарий.
    pub failure_threshold: u32,
    pub progress_every: u64,
}

/// Итог publisher'а, дошедшего до конца (или остановленного токеном).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SendOutcome {
    pub attempted: u64,
    pub accepted: u64,
    pub cancelled: bool,
}

/// Счётчик подряд идущих ошибок.
struct Breaker {
    threshold: u32,
    consecutive: u32,
}

impl Breaker {
    fn success(&mut self) {
        self.consecutive = 0;
    }

    /// true: порог достигнут, сценарий прерывается.
    fn failure(&mut self) -> bool {
        self.consecutive += 1;
        self.threshold > 0 && self.consecutive >= self.threshold
    }
}

/// Запустить publisher: generator → adapter.publish → ledger.
pub fn spawn_publisher(
    adapter: Arc<dyn EndpointAdapter>,
    ledger: Arc<Ledger>,
    plan: PublishPlan,
    generator: Generator,
    token: CancellationToken,
) -> JoinHandle<Result<SendOutcome, EngineError>> {
    tokio::spawn(run_publisher(adapter, ledger, plan, generator, token))
}

pub async fn run_publisher(
    adapter: Arc<dyn EndpointAdapter>,
    ledger: Arc<Ledger>,
    plan: PublishPlan,
    mut generator: Generator,
    token: CancellationToken,
) -> Result<SendOutcome, EngineError> {
    let mut outcome = SendOutcome::default();
    let mut breaker = Breaker { threshold: plan.failure_threshold, consecutive: 0 };
    let mut ticker = plan.pacing.map(pacer);
    let batch_size = plan.load.batch_size();
    let mut next_progress = plan.progress_every;

    tracing::info!(
        endpoint = %adapter.endpoint(),
        topic = %plan.topics.run_path(),
        messages = plan.load.total(),
        payload = %plan.payload,
        "publisher started"
    );

    for attempt in 0..plan.load.attempts() {
        if token.is_cancelled() {
            outcome.cancelled = true;
            break;
        }
        if let Some(ticker) = ticker.as_mut() {
            tokio::select! {
                _ = token.cancelled() => {
                    outcome.cancelled = true;
                    break;
                }
                _ = ticker.tick() => {}
            }
        }

        let messages: Vec<Message> = (0..batch_size).map(|_| generator.generate(&plan.payload)).collect();
        let count = messages.len() as u64;
        let (accepted, error) = if plan.load.is_batched() {
            publish_batch(&*adapter, &plan.topics.batch_topic(attempt), &messages).await
        } else {
            publish_one(&*adapter, &plan.topics.topic_for(attempt), &messages).await
        };

        let accepted = accepted as u64;
        if accepted > 0 {
            breaker.success();
            ledger.record_accepted(accepted, records(&messages[..accepted as usize]));
        }

        match error {
            None => outcome.attempted += count,
            Some(e) => {
                let failed = count - accepted;
                if breaker.failure() {
                    // Попытка, сработавшая breaker'ом, в sent не идёт.
                    ledger.record_failed(failed, false);
                    let at = attempt * batch_size + accepted + 1;
                    tracing::error!(
                        endpoint = %adapter.endpoint(),
                        at,
                        failures = breaker.consecutive,
                        error = %e,
                        "publish failure threshold reached"
                    );
                    return Err(EngineError::BrokerUnavailable {
                        at,
                        failures: breaker.consecutive,
                        last: e,
                    });
                }
                outcome.attempted += count;
                ledger.record_failed(failed, true);
                tracing::warn!(
                    endpoint = %adapter.endpoint(),
                    attempt = attempt + 1,
                    consecutive = breaker.consecutive,
                    error = %e,
                    "publish failed"
                );
            }
        }
        outcome.accepted += accepted;

        if plan.progress_every > 0 && outcome.attempted >= next_progress {
            tracing::info!(
                sent = outcome.attempted,
                total = plan.load.total(),
                "publish progress"
            );
            while next_progress <= outcome.attempted {
                next_progress += plan.progress_every;
            }
        }
    }

    tracing::info!(
        attempted = outcome.attempted,
        accepted = outcome.accepted,
        cancelled = outcome.cancelled,
        "publisher finished"
    );
    Ok(outcome)
}

fn pacer(period: Duration) -> Interval {
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    ticker
}

async fn publish_one(
    adapter: &dyn EndpointAdapter,
    topic: &str,
    messages: &[Message],
) -> (usize, Option<BenchError>) {
    let Some(msg) = messages.first() else { return (0, None) };
    match adapter.publish(topic, msg.payload.clone()).await {
        Ok(()) => (1, None),
        Err(e) => (0, Some(e)),
    }
}

async fn publish_batch(
    adapter: &dyn EndpointAdapter,
    topic: &str,
    messages: &[Message],
) -> (usize, Option<BenchError>) {
    let payloads = messages.iter().map(|m| m.payload.clone()).collect();
    let ack = adapter.publish_batch(topic, payloads).await;
    (ack.accepted.min(messages.len()), ack.error)
}

fn records(messages: &[Message]) -> Vec<SendRecord> {
    messages
        .iter()
        .filter_map(|m| match (&m.id, m.sent_us) {
            (Some(id), Some(sent_us)) => Some(SendRecord { id: id.clone(), sent_us }),
            _ => None,
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn breaker_trips_at_threshold() {
        let mut b = Breaker { threshold: 3, consecutive: 0 };
        assert!(!b.failure());
        assert!(!b.failure());
        b.success();
        assert!(!b.failure());
        assert!(!b.failure());
        assert!(b.failure());
    }

    #[test]
    fn zero_threshold_never_trips() {
        let mut b = Breaker { threshold: 0, consecutive: 0 };
        assert!((0..1000).all(|_| !b.failure()));
    }

    #[test]
    fn records_only_for_correlated_messages() {
        let msgs = vec![
            Message { id: Some("a".into()), sent_us: Some(1), payload: vec![] },
            Message { id: None, sent_us: None, payload: vec![] },
        ];
        assert_eq!(records(&msgs), vec![SendRecord { id: "a".into(), sent_us: 1 }]);
    }
}

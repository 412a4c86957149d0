use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use bench_api::{ResourceProbe, Usage};

/// Один замер CPU/памяти цели во время прогона.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceSample {
    /// Секунды от старта sampler'а.
    pub elapsed_s: f64,
    pub cpu_percent: f64,
    pub memory_percent: f64,
    pub memory_usage: String,
    /// false: probe не ответил, значения нулевые.
    pub available: bool,
}

impl ResourceSample {
    pub fn new(elapsed_s: f64, usage: Usage, available: bool) -> Self {
        Self {
            elapsed_s,
            cpu_percent: usage.cpu_percent,
            memory_percent: usage.memory_percent,
            memory_usage: usage.memory_usage,
            available,
        }
    }
}

/// Best-effort опрос ResourceProbe.
#[derive(Clone)]
pub struct Sampler {
    probe: Arc<dyn ResourceProbe>,
    target: String,
    interval: Duration,
}

impl Sampler {
    pub fn new(probe: Arc<dyn ResourceProbe>, target: impl Into<String>, interval: Duration) -> Self {
        Self { probe, target: target.into(), interval }
    }

    pub fn target(&self) -> &str {
        &self.target
    }

    /// Один запрос. Ошибка probe → нулевой sample, `available = false`.
    pub async fn sample_once(&self) -> (Usage, bool) {
        match self.probe.sample_usage(&self.target).await {
            Ok(usage) => (usage, true),
            Err(e) => {
                tracing::debug!(target_name = %self.target, error = %e, "resource probe failed");
                (Usage::unavailable(), false)
            }
        }
    }
}

/// Опрашивать probe каждые `interval` до `max_duration` или отмены.
///
/// Токен проверяется между запросами: начатый запрос к probe всегда
/// доводится до конца.
pub fn spawn_sampler(
    sampler: Sampler,
    max_duration: Duration,
    token: CancellationToken,
) -> JoinHandle<Vec<ResourceSample>> {
    tokio::spawn(async move {
        let started = Instant::now();
        let mut samples = Vec::new();

        while !token.is_cancelled() && started.elapsed() < max_duration {
            let (usage, available) = sampler.sample_once().await;
            samples.push(ResourceSample::new(started.elapsed().as_secs_f64(), usage, available));

            tokio::select! {
                _ = token.cancelled() => break,
                _ = tokio::time::sleep(sampler.interval) => {}
            }
        }

        tracing::debug!(target_name = %sampler.target, samples = samples.len(), "sampler stopped");
        samples
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use bench_api::BenchError;
    use std::future::Future;
    use std::pin::Pin;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct FlakyProbe {
        calls: AtomicUsize,
    }

    impl ResourceProbe for FlakyProbe {
        fn sample_usage(&self, _target: &str)
            -> Pin<Box<dyn Future<Output = Result<Usage, BenchError>> + Send + '_>>
        {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            Box::pin(async move {
                if n % 2 == 1 {
                    Err(BenchError::io("docker not running"))
                } else {
                    Ok(Usage { cpu_percent: 12.5, memory_percent: 1.0, memory_usage: "5MiB / 1GiB".into() })
                }
            })
        }
    }

    #[tokio::test(start_paused = true)]
    async fn failed_queries_become_zero_samples() {
        let probe = Arc::new(FlakyProbe { calls: AtomicUsize::new(0) });
        let sampler = Sampler::new(probe, "fwd", Duration::from_millis(500));
        let token = CancellationToken::new();
        let handle = spawn_sampler(sampler, Duration::from_secs(60), token.clone());

        tokio::time::sleep(Duration::from_millis(1_800)).await;
        token.cancel();
        let samples = handle.await.unwrap();

        assert_eq!(samples.len(), 4);
        assert!(samples[0].available);
        assert!(!samples[1].available);
        assert_eq!(samples[1].cpu_percent, 0.0);
        assert_eq!(samples[1].memory_usage, "N/A");
    }

    #[tokio::test(start_paused = true)]
    async fn stops_after_max_duration() {
        let probe = Arc::new(FlakyProbe { calls: AtomicUsize::new(0) });
        let sampler = Sampler::new(probe, "fwd", Duration::from_millis(500));
        let handle = spawn_sampler(sampler, Duration::from_millis(100), CancellationToken::new());
        let samples = handle.await.unwrap();
        assert_eq!(samples.len(), 1);
    }
}

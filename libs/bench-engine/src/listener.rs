use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use bench_api::{Delivery, Subscription, preview};

use crate::generator::extract_stamp;
use crate::ledger::{Arrival, Ledger};

/// Почему listener завершился.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopCause {
    /// Получено ожидаемое число сообщений.
    Expected,
    /// Остановлен через токен.
    Stopped,
    /// Подписка закрылась со стороны endpoint'а.
    Closed,
    /// Не остановился за отведённое время.
    Detached,
}

#[derive(Debug, Clone)]
pub struct ListenerReport {
    pub cause: StopCause,
    /// Превью первого полученного payload'а.
    pub first_payload: Option<String>,
}

pub struct ListenerHandle {
    token: CancellationToken,
    handle: JoinHandle<ListenerReport>,
}

impl ListenerHandle {
    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    /// Попросить listener остановиться и дождаться его не дольше `wait`.
    ///
    /// Задача не abort'ится: прерванный посреди чтения адаптер может
    /// оставить соединение в неконсистентном состоянии. Не уложившийся
    /// listener отсоединяется и доживает сам.
    pub async fn stop(mut self, wait: Duration) -> ListenerReport {
        self.token.cancel();
        match tokio::time::timeout(wait, &mut self.handle).await {
            Ok(Ok(report)) => report,
            Ok(Err(e)) => {
                tracing::error!(error = %e, "listener task failed");
                ListenerReport { cause: StopCause::Detached, first_payload: None }
            }
            Err(_) => {
                tracing::warn!(wait_ms = wait.as_millis() as u64, "listener did not stop in time, detaching");
                ListenerReport { cause: StopCause::Detached, first_payload: None }
            }
        }
    }
}

/// Запустить listener: subscription → классификация → ledger.
///
/// Останавливается по токену, по закрытию подписки или по достижении
/// `expected` доставок.
pub fn spawn_listener(
    mut sub: Box<dyn Subscription>,
    ledger: Arc<Ledger>,
    expected: Option<u64>,
    correlate: bool,
    token: CancellationToken,
) -> ListenerHandle {
    let task_token = token.clone();
    let handle = tokio::spawn(async move {
        let mut first_payload = None;

        let cause = loop {
            let delivery = tokio::select! {
                biased;
                _ = task_token.cancelled() => break StopCause::Stopped,
                d = sub.recv() => d,
            };
            let Some(delivery) = delivery else { break StopCause::Closed };

            if first_payload.is_none() {
                first_payload = Some(preview(&String::from_utf8_lossy(&delivery.payload)));
            }

            let arrival = if correlate { classify(&delivery) } else { Arrival::Plain };
            let received = ledger.record_arrival(arrival);

            if expected.is_some_and(|n| received >= n) {
                break StopCause::Expected;
            }
        };

        sub.close().await;
        tracing::debug!(?cause, received = ledger.received(), "listener stopped");
        ListenerReport { cause, first_payload }
    });

    ListenerHandle { token, handle }
}

fn classify(delivery: &Delivery) -> Arrival {
    match extract_stamp(&delivery.payload) {
        Ok(Some(stamp)) => Arrival::Stamped { id: stamp.id, received_us: delivery.received_us },
        Ok(None) => Arrival::Unstamped,
        Err(e) => {
            tracing::debug!(topic = %delivery.topic, error = %e, "malformed payload");
            Arrival::Malformed
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bench_api::now_us;
    use std::future::Future;
    use std::pin::Pin;
    use tokio::sync::mpsc;

    struct ChannelSub {
        rx: mpsc::Receiver<Delivery>,
    }

    impl Subscription for ChannelSub {
        fn recv(&mut self) -> Pin<Box<dyn Future<Output = Option<Delivery>> + Send + '_>> {
            Box::pin(self.rx.recv())
        }

        fn close(&mut self) -> Pin<Box<dyn Future<Output = ()> + Send + '_>> {
            self.rx.close();
            Box::pin(async {})
        }
    }

    fn delivery(payload: &[u8]) -> Delivery {
        Delivery { topic: "/ge/web/t".into(), payload: payload.to_vec(), received_us: now_us() }
    }

    #[tokio::test]
    async fn stops_at_expected_count() {
        let (tx, rx) = mpsc::channel(16);
        let ledger = Arc::new(Ledger::new(16));
        let listener = spawn_listener(
            Box::new(ChannelSub { rx }),
            ledger.clone(),
            Some(3),
            true,
            CancellationToken::new(),
        );
        tx.send(delivery(br#"{"data":"x"}"#)).await.unwrap();
        tx.send(delivery(b"garbage")).await.unwrap();
        tx.send(delivery(br#"{"bench_id":"nope","sent_us":1}"#)).await.unwrap();

        let mut watch = ledger.watch_received();
        watch.wait_for(|n| *n >= 3).await.unwrap();
        let report = listener.stop(Duration::from_secs(1)).await;

        assert_eq!(report.cause, StopCause::Expected);
        assert_eq!(report.first_payload.as_deref(), Some(r#"{"data":"x"}"#));
        let snap = ledger.snapshot();
        assert_eq!(snap.received, 3);
        assert_eq!(snap.malformed, 1);
        assert_eq!(snap.uncorrelated, 2);
    }

    #[tokio::test]
    async fn stop_signal_ends_idle_listener() {
        let (_tx, rx) = mpsc::channel(16);
        let ledger = Arc::new(Ledger::new(16));
        let listener = spawn_listener(
            Box::new(ChannelSub { rx }),
            ledger,
            None,
            false,
            CancellationToken::new(),
        );
        let report = listener.stop(Duration::from_secs(1)).await;
        assert_eq!(report.cause, StopCause::Stopped);
        assert!(report.first_payload.is_none());
    }

    #[tokio::test]
    async fn closed_subscription_ends_listener() {
        let (tx, rx) = mpsc::channel(16);
        let ledger = Arc::new(Ledger::new(16));
        let listener = spawn_listener(
            Box::new(ChannelSub { rx }),
            ledger.clone(),
            Some(100),
            false,
            CancellationToken::new(),
        );
        tx.send(delivery(b"not json, not correlated")).await.unwrap();
        drop(tx);
        while !listener.is_finished() {
            tokio::task::yield_now().await;
        }
        let report = listener.stop(Duration::from_secs(1)).await;
        assert_eq!(report.cause, StopCause::Closed);
        assert_eq!(ledger.snapshot().malformed, 0);
        assert_eq!(ledger.received(), 1);
    }
}

//! MQTT endpoint adapter поверх rumqttc.
//!
//! Одна сессия на адаптер: `AsyncClient` для исходящих запросов и
//! pump-задача, которая крутит `EventLoop`, следит за состоянием линка
//! и раздаёт входящие publish'и подписчикам.

use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use rumqttc::{
    AsyncClient, ConnectReturnCode, Event, EventLoop, MqttOptions, Packet, QoS,
    SubscribeReasonCode,
};
use serde::Deserialize;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use bench_api::{
    AdapterFactory, BenchError, Delivery, EndpointAdapter, EndpointAddr, Subscription, now_us,
    topic_matches, valid_filter, valid_topic,
};

// ═══════════════════════════════════════════════════════════════
//  Settings
// ═══════════════════════════════════════════════════════════════

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MqttSettings {
    /// QoS для publish и subscribe (0, 1, 2).
    pub qos: u8,
    pub keep_alive_secs: u64,
    pub connect_timeout_ms: u64,
    pub publish_timeout_ms: u64,
    pub subscribe_timeout_ms: u64,
    /// Ёмкость очереди запросов клиента.
    pub request_capacity: usize,
    /// Ёмкость входящего буфера на подписку.
    pub inbox_capacity: usize,
    pub max_packet_size: usize,
    pub client_id_prefix: String,
}

impl Default for MqttSettings {
    fn default() -> Self {
        Self {
            qos: 0,
            keep_alive_secs: 30,
            connect_timeout_ms: 5_000,
            publish_timeout_ms: 5_000,
            subscribe_timeout_ms: 5_000,
            request_capacity: 1_024,
            inbox_capacity: 65_536,
            max_packet_size: 1 << 20,
            client_id_prefix: "fwd-bench".into(),
        }
    }
}

pub fn qos_from_u8(qos: u8) -> Result<QoS, BenchError> {
    match qos {
        0 => Ok(QoS::AtMostOnce),
        1 => Ok(QoS::AtLeastOnce),
        2 => Ok(QoS::ExactlyOnce),
        other => Err(BenchError::format_err(format!("invalid QoS: {other}"))),
    }
}

// ═══════════════════════════════════════════════════════════════
//  Link state
// ═══════════════════════════════════════════════════════════════

#[derive(Debug, Clone, PartialEq, Eq)]
enum LinkState {
    Connecting,
    Up,
    Down(String),
}

/// Подписчики одной сессии: filter → inbox.
type Routes = Arc<Mutex<Vec<(String, mpsc::Sender<Delivery>)>>>;

fn route(routes: &Routes, topic: &str, payload: &[u8]) {
    let mut routes = routes.lock().unwrap_or_else(|p| p.into_inner());
    routes.retain(|(_, tx)| !tx.is_closed());
    for (filter, tx) in routes.iter().filter(|(f, _)| topic_matches(f, topic)) {
        let delivery = Delivery {
            topic: topic.to_string(),
            payload: payload.to_vec(),
            received_us: now_us(),
        };
        if tx.try_send(delivery).is_err() {
            tracing::warn!(%topic, %filter, "mqtt inbox full, dropping");
        }
    }
}

/// Крутит EventLoop до отмены. После разрыва rumqttc сам переподключается
/// на следующем poll; между попытками: пауза.
fn spawn_pump(
    endpoint: EndpointAddr,
    mut eventloop: EventLoop,
    link: watch::Sender<LinkState>,
    sub_acks: watch::Sender<(u64, u64)>,
    routes: Routes,
    token: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            let event = tokio::select! {
                _ = token.cancelled() => break,
                ev = eventloop.poll() => ev,
            };

            match event {
                Ok(Event::Incoming(Packet::ConnAck(ack))) => {
                    if ack.code == ConnectReturnCode::Success {
                        tracing::info!(%endpoint, "mqtt connected");
                        link.send_replace(LinkState::Up);
                    } else {
                        link.send_replace(LinkState::Down(format!("{:?}", ack.code)));
                    }
                }
                Ok(Event::Incoming(Packet::Publish(p))) => route(&routes, &p.topic, &p.payload),
                Ok(Event::Incoming(Packet::SubAck(ack))) => {
                    let failed = ack
                        .return_codes
                        .iter()
                        .any(|c| matches!(c, SubscribeReasonCode::Failure));
                    sub_acks.send_modify(|(ok, rejected)| {
                        if failed { *rejected += 1 } else { *ok += 1 }
                    });
                }
                Ok(Event::Incoming(Packet::Disconnect)) => {
                    link.send_replace(LinkState::Down("broker sent disconnect".into()));
                }
                Ok(_) => {}
                Err(e) => {
                    let was_up = *link.borrow() == LinkState::Up;
                    link.send_replace(LinkState::Down(e.to_string()));
                    if was_up {
                        tracing::warn!(%endpoint, error = %e, "mqtt link down");
                    } else {
                        tracing::debug!(%endpoint, error = %e, "mqtt connect attempt failed");
                    }
                    tokio::select! {
                        _ = token.cancelled() => break,
                        _ = tokio::time::sleep(Duration::from_millis(500)) => {}
                    }
                }
            }
        }
        tracing::debug!(%endpoint, "mqtt pump stopped");
    })
}

// ═══════════════════════════════════════════════════════════════
//  Factory
// ═══════════════════════════════════════════════════════════════

pub struct MqttFactory {
    settings: MqttSettings,
    qos: QoS,
}

impl MqttFactory {
    pub fn new(settings: MqttSettings) -> Result<Self, BenchError> {
        let qos = qos_from_u8(settings.qos)?;
        Ok(Self { settings, qos })
    }
}

impl AdapterFactory for MqttFactory {
    fn kind(&self) -> &str {
        "mqtt"
    }

    fn connect(&self, endpoint: &EndpointAddr)
        -> Pin<Box<dyn Future<Output = Result<Arc<dyn EndpointAdapter>, BenchError>> + Send + '_>>
    {
        let endpoint = endpoint.clone();
        Box::pin(async move {
            let s = &self.settings;
            let suffix = uuid::Uuid::new_v4().simple().to_string();
            let client_id = format!("{}-{}-{}", s.client_id_prefix, endpoint.role, &suffix[..8]);

            let mut options = MqttOptions::new(client_id, endpoint.host.clone(), endpoint.port);
            options.set_keep_alive(Duration::from_secs(s.keep_alive_secs.max(5)));
            options.set_clean_session(true);
            options.set_max_packet_size(s.max_packet_size, s.max_packet_size);

            let (client, eventloop) = AsyncClient::new(options, s.request_capacity);
            let (link_tx, mut link_rx) = watch::channel(LinkState::Connecting);
            let (acks_tx, acks_rx) = watch::channel((0, 0));
            let routes: Routes = Arc::default();
            let token = CancellationToken::new();
            let pump = spawn_pump(
                endpoint.clone(),
                eventloop,
                link_tx,
                acks_tx,
                routes.clone(),
                token.clone(),
            );

            let wait = Duration::from_millis(s.connect_timeout_ms);
            let failure = {
                let settled = link_rx.wait_for(|st| *st != LinkState::Connecting);
                match tokio::time::timeout(wait, settled).await {
                    Ok(Ok(st)) => match &*st {
                        LinkState::Up => None,
                        LinkState::Down(e) => Some(e.clone()),
                        LinkState::Connecting => Some("still connecting".to_string()),
                    },
                    Ok(Err(_)) => Some("connection task ended".to_string()),
                    Err(_) => Some(format!("no CONNACK within {}ms", s.connect_timeout_ms)),
                }
            };

            if let Some(reason) = failure {
                token.cancel();
                let _ = pump.await;
                return Err(BenchError::connection(format!("{endpoint}: {reason}")));
            }

            let adapter: Arc<dyn EndpointAdapter> = Arc::new(MqttAdapter {
                endpoint,
                client,
                qos: self.qos,
                link: link_rx,
                sub_acks: acks_rx,
                routes,
                settings: s.clone(),
                token,
                pump: Mutex::new(Some(pump)),
            });
            Ok(adapter)
        })
    }
}

// ═══════════════════════════════════════════════════════════════
//  Adapter
// ═══════════════════════════════════════════════════════════════

pub struct MqttAdapter {
    endpoint: EndpointAddr,
    client: AsyncClient,
    qos: QoS,
    link: watch::Receiver<LinkState>,
    /// (успешные, отклонённые) SUBACK.
    sub_acks: watch::Receiver<(u64, u64)>,
    routes: Routes,
    settings: MqttSettings,
    token: CancellationToken,
    pump: Mutex<Option<JoinHandle<()>>>,
}

impl MqttAdapter {
    fn ensure_up(&self) -> Result<(), BenchError> {
        match &*self.link.borrow() {
            LinkState::Up => Ok(()),
            LinkState::Connecting => Err(BenchError::connection(format!("{}: not connected", self.endpoint))),
            LinkState::Down(e) => Err(BenchError::connection(format!("{}: {e}", self.endpoint))),
        }
    }
}

impl EndpointAdapter for MqttAdapter {
    fn endpoint(&self) -> &EndpointAddr {
        &self.endpoint
    }

    fn publish(&self, topic: &str, payload: Vec<u8>)
        -> Pin<Box<dyn Future<Output = Result<(), BenchError>> + Send + '_>>
    {
        let topic = topic.to_string();
        Box::pin(async move {
            if !valid_topic(&topic) {
                return Err(BenchError::topic(format!("invalid topic: {topic}")));
            }
            self.ensure_up()?;

            let wait = Duration::from_millis(self.settings.publish_timeout_ms);
            match tokio::time::timeout(wait, self.client.publish(topic, self.qos, false, payload)).await {
                Ok(Ok(())) => Ok(()),
                Ok(Err(e)) => Err(BenchError::connection(format!("{}: {e}", self.endpoint))),
                Err(_) => Err(BenchError::timeout(format!(
                    "{}: publish not queued within {}ms",
                    self.endpoint, self.settings.publish_timeout_ms
                ))),
            }
        })
    }

    fn subscribe(&self, filter: &str)
        -> Pin<Box<dyn Future<Output = Result<Box<dyn Subscription>, BenchError>> + Send + '_>>
    {
        let filter = filter.to_string();
        Box::pin(async move {
            if !valid_filter(&filter) {
                return Err(BenchError::topic(format!("invalid filter: {filter}")));
            }
            self.ensure_up()?;

            let (tx, rx) = mpsc::channel(self.settings.inbox_capacity);
            self.routes
                .lock()
                .unwrap_or_else(|p| p.into_inner())
                .push((filter.clone(), tx));

            let mut acks = self.sub_acks.clone();
            let before = *acks.borrow_and_update();
            self.client
                .subscribe(filter.clone(), self.qos)
                .await
                .map_err(|e| BenchError::connection(format!("{}: {e}", self.endpoint)))?;

            let wait = Duration::from_millis(self.settings.subscribe_timeout_ms);
            let acked = match tokio::time::timeout(wait, acks.wait_for(|a| *a != before)).await {
                Ok(Ok(a)) => Ok(*a),
                Ok(Err(_)) => Err(BenchError::connection(format!("{}: session closed", self.endpoint))),
                Err(_) => Err(BenchError::timeout(format!("{}: no SUBACK for {filter}", self.endpoint))),
            };
            let (_, rejected) = acked?;
            if rejected > before.1 {
                return Err(BenchError::rejected(format!(
                    "{}: subscription to {filter} refused",
                    self.endpoint
                )));
            }

            tracing::debug!(endpoint = %self.endpoint, %filter, "mqtt subscribed");
            let sub: Box<dyn Subscription> = Box::new(MqttSubscription { rx });
            Ok(sub)
        })
    }

    fn close(&self) -> Pin<Box<dyn Future<Output = ()> + Send + '_>> {
        Box::pin(async move {
            let Some(mut pump) = self.pump.lock().unwrap_or_else(|p| p.into_inner()).take() else {
                return;
            };
            if self.ensure_up().is_ok() {
                let _ = self.client.disconnect().await;
            }
            // Даём pump'у отправить DISCONNECT, затем останавливаем.
            if tokio::time::timeout(Duration::from_millis(500), &mut pump).await.is_err() {
                self.token.cancel();
                let _ = pump.await;
            }
            tracing::debug!(endpoint = %self.endpoint, "mqtt session closed");
        })
    }
}

struct MqttSubscription {
    rx: mpsc::Receiver<Delivery>,
}

impl Subscription for MqttSubscription {
    fn recv(&mut self) -> Pin<Box<dyn Future<Output = Option<Delivery>> + Send + '_>> {
        Box::pin(self.rx.recv())
    }

    fn close(&mut self) -> Pin<Box<dyn Future<Output = ()> + Send + '_>> {
        self.rx.close();
        Box::pin(async {})
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bench_api::{EndpointRole, ErrorKind};

    #[test]
    fn qos_mapping() {
        assert_eq!(qos_from_u8(0).unwrap(), QoS::AtMostOnce);
        assert_eq!(qos_from_u8(2).unwrap(), QoS::ExactlyOnce);
        assert_eq!(qos_from_u8(3).unwrap_err().kind(), ErrorKind::Format);
    }

    #[test]
    fn routes_by_filter_and_drops_closed_inboxes() {
        let routes: Routes = Arc::default();
        let (tx_a, mut rx_a) = mpsc::channel(4);
        let (tx_b, rx_b) = mpsc::channel(4);
        routes.lock().unwrap().push(("/ge/web/#".into(), tx_a));
        routes.lock().unwrap().push(("/other/+".into(), tx_b));
        drop(rx_b);

        route(&routes, "/ge/web/dev1", b"hello");
        let d = rx_a.try_recv().unwrap();
        assert_eq!(d.topic, "/ge/web/dev1");
        assert_eq!(d.payload, b"hello");
        assert_eq!(routes.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn unreachable_broker_is_connection_error() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let factory = MqttFactory::new(MqttSettings {
            connect_timeout_ms: 2_000,
            ..Default::default()
        })
        .unwrap();
        let endpoint = EndpointAddr::new(EndpointRole::Downstream, "127.0.0.1", port);
        let err = factory.connect(&endpoint).await.err().unwrap();
        assert_eq!(err.kind(), ErrorKind::Connection);
        assert!(err.message().contains("127.0.0.1"));
    }
}

//! In-process пара broker'ов с forwarder'ом между ними.
//!
//! Downstream принимает publish, forwarder (опционально оборачивая
//! payload в конверт) отдаёт его подписчикам upstream. FaultPlan
//! позволяет ронять endpoint, портить payload'ы и выключать forwarder.

use std::collections::HashSet;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::{Value, json};
use tokio::sync::mpsc;

use bench_api::{
    AdapterFactory, BenchError, Delivery, EndpointAdapter, EndpointAddr, EndpointRole,
    Subscription, now_us, topic_matches, valid_filter, valid_topic,
};

const INBOX_CAPACITY: usize = 65_536;

// ═══════════════════════════════════════════════════════════════
//  Fault plan
// ═══════════════════════════════════════════════════════════════

#[derive(Debug, Clone)]
pub struct FaultPlan {
    /// Роли, к которым нельзя подключиться.
    pub unreachable: HashSet<EndpointRole>,
    /// Downstream отказывает во всех publish после N принятых.
    pub fail_after: Option<u64>,
    /// 0-based индексы пересылаемых сообщений, payload которых портится.
    pub corrupt: HashSet<u64>,
    /// false: forwarder лежит, upstream ничего не получает.
    pub forwarding: bool,
    /// Оборачивать payload в конверт forwarder'а.
    pub wrap: bool,
    /// Задержка пересылки.
    pub delay: Option<Duration>,
}

impl Default for FaultPlan {
    fn default() -> Self {
        Self {
            unreachable: HashSet::new(),
            fail_after: None,
            corrupt: HashSet::new(),
            forwarding: true,
            wrap: false,
            delay: None,
        }
    }
}

/// Конверт, в который forwarder заворачивает исходный payload.
/// `webtalkID` = последний сегмент topic'а.
pub fn envelope(topic: &str, payload: &[u8]) -> Vec<u8> {
    let data = serde_json::from_slice::<Value>(payload)
        .unwrap_or_else(|_| Value::String(String::from_utf8_lossy(payload).into_owned()));
    let device = topic.rsplit('/').next().unwrap_or_default();
    json!({
        "data": data,
        "operationType": "uploadRtd",
        "projectID": "X2View",
        "requestType": "wrequest",
        "serialNo": 0,
        "webtalkID": device,
    })
    .to_string()
    .into_bytes()
}

// ═══════════════════════════════════════════════════════════════
//  Broker network
// ═══════════════════════════════════════════════════════════════

struct Subscriber {
    filter: String,
    tx: mpsc::Sender<Delivery>,
}

#[derive(Default)]
struct Bus {
    subscribers: Mutex<Vec<Subscriber>>,
}

impl Bus {
    fn add(&self, filter: &str) -> mpsc::Receiver<Delivery> {
        let (tx, rx) = mpsc::channel(INBOX_CAPACITY);
        let mut subs = self.subscribers.lock().unwrap_or_else(|p| p.into_inner());
        subs.push(Subscriber { filter: filter.to_string(), tx });
        rx
    }

    fn deliver(&self, topic: &str, payload: &[u8]) {
        let mut subs = self.subscribers.lock().unwrap_or_else(|p| p.into_inner());
        subs.retain(|s| !s.tx.is_closed());
        for sub in subs.iter().filter(|s| topic_matches(&s.filter, topic)) {
            let delivery = Delivery {
                topic: topic.to_string(),
                payload: payload.to_vec(),
                received_us: now_us(),
            };
            if sub.tx.try_send(delivery).is_err() {
                tracing::warn!(%topic, filter = %sub.filter, "loopback inbox full, dropping");
            }
        }
    }
}

struct Net {
    plan: FaultPlan,
    downstream: Bus,
    upstream: Bus,
    accepted: AtomicU64,
    forwarded: AtomicU64,
}

impl Net {
    fn bus(&self, role: EndpointRole) -> &Bus {
        match role {
            EndpointRole::Downstream => &self.downstream,
            EndpointRole::Upstream => &self.upstream,
        }
    }

    fn forward(self: &Arc<Self>, topic: &str, payload: &[u8]) {
        if !self.plan.forwarding {
            return;
        }
        let index = self.forwarded.fetch_add(1, Ordering::SeqCst);
        let body = if self.plan.corrupt.contains(&index) {
            b"\x00corrupted\xff".to_vec()
        } else if self.plan.wrap {
            envelope(topic, payload)
        } else {
            payload.to_vec()
        };

        match self.plan.delay {
            Some(delay) => {
                let net = self.clone();
                let topic = topic.to_string();
                tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    net.upstream.deliver(&topic, &body);
                });
            }
            None => self.upstream.deliver(topic, &body),
        }
    }
}

// ═══════════════════════════════════════════════════════════════
//  Factory
// ═══════════════════════════════════════════════════════════════

/// Фабрика loopback-адаптеров. Все адаптеры одной фабрики делят сеть.
#[derive(Clone)]
pub struct LoopbackFactory {
    net: Arc<Net>,
}

impl LoopbackFactory {
    pub fn new(plan: FaultPlan) -> Self {
        Self {
            net: Arc::new(Net {
                plan,
                downstream: Bus::default(),
                upstream: Bus::default(),
                accepted: AtomicU64::new(0),
                forwarded: AtomicU64::new(0),
            }),
        }
    }

    /// Сколько publish принял downstream.
    pub fn accepted(&self) -> u64 {
        self.net.accepted.load(Ordering::SeqCst)
    }
}

impl Default for LoopbackFactory {
    fn default() -> Self {
        Self::new(FaultPlan::default())
    }
}

impl AdapterFactory for LoopbackFactory {
    fn kind(&self) -> &str {
        "loopback"
    }

    fn connect(&self, endpoint: &EndpointAddr)
        -> Pin<Box<dyn Future<Output = Result<Arc<dyn EndpointAdapter>, BenchError>> + Send + '_>>
    {
        let endpoint = endpoint.clone();
        Box::pin(async move {
            if self.net.plan.unreachable.contains(&endpoint.role) {
                return Err(BenchError::connection(format!("{endpoint}: connection refused")));
            }
            tracing::debug!(%endpoint, "loopback connected");
            let adapter: Arc<dyn EndpointAdapter> = Arc::new(LoopbackAdapter {
                endpoint,
                net: self.net.clone(),
                closed: AtomicBool::new(false),
            });
            Ok(adapter)
        })
    }
}

// ═══════════════════════════════════════════════════════════════
//  Adapter
// ═══════════════════════════════════════════════════════════════

pub struct LoopbackAdapter {
    endpoint: EndpointAddr,
    net: Arc<Net>,
    closed: AtomicBool,
}

impl EndpointAdapter for LoopbackAdapter {
    fn endpoint(&self) -> &EndpointAddr {
        &self.endpoint
    }

    fn publish(&self, topic: &str, payload: Vec<u8>)
        -> Pin<Box<dyn Future<Output = Result<(), BenchError>> + Send + '_>>
    {
        let topic = topic.to_string();
        Box::pin(async move {
            if self.closed.load(Ordering::SeqCst) {
                return Err(BenchError::connection("session closed"));
            }
            if !valid_topic(&topic) {
                return Err(BenchError::topic(format!("invalid topic: {topic}")));
            }

            let role = self.endpoint.role;
            if role == EndpointRole::Downstream {
                let n = self.net.accepted.load(Ordering::SeqCst);
                if self.net.plan.fail_after.is_some_and(|limit| n >= limit) {
                    return Err(BenchError::connection(format!("{}: connection lost", self.endpoint)));
                }
                self.net.accepted.fetch_add(1, Ordering::SeqCst);
            }

            self.net.bus(role).deliver(&topic, &payload);
            if role == EndpointRole::Downstream {
                self.net.forward(&topic, &payload);
            }
            Ok(())
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
            let rx = self.net.bus(self.endpoint.role).add(&filter);
            let sub: Box<dyn Subscription> = Box::new(LoopbackSubscription { rx });
            Ok(sub)
        })
    }

    fn close(&self) -> Pin<Box<dyn Future<Output = ()> + Send + '_>> {
        self.closed.store(true, Ordering::SeqCst);
        Box::pin(async {})
    }
}

struct LoopbackSubscription {
    rx: mpsc::Receiver<Delivery>,
}

impl Subscription for LoopbackSubscription {
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

    fn addr(role: EndpointRole) -> EndpointAddr {
        EndpointAddr::new(role, "loopback", 0)
    }

    #[tokio::test]
    async fn forwards_downstream_to_upstream() {
        let factory = LoopbackFactory::default();
        let up = factory.connect(&addr(EndpointRole::Upstream)).await.unwrap();
        let down = factory.connect(&addr(EndpointRole::Downstream)).await.unwrap();
        let mut sub = up.subscribe("/ge/web/#").await.unwrap();

        down.publish("/ge/web/dev1", b"{\"data\":\"x\"}".to_vec()).await.unwrap();
        down.publish("/other/topic", b"{}".to_vec()).await.unwrap();

        let d = sub.recv().await.unwrap();
        assert_eq!(d.topic, "/ge/web/dev1");
        assert_eq!(d.payload, b"{\"data\":\"x\"}");
        sub.close().await;
        assert!(sub.recv().await.is_none());
        assert_eq!(factory.accepted(), 2);
    }

    #[tokio::test]
    async fn wraps_in_forwarder_envelope() {
        let factory = LoopbackFactory::new(FaultPlan { wrap: true, ..Default::default() });
        let up = factory.connect(&addr(EndpointRole::Upstream)).await.unwrap();
        let down = factory.connect(&addr(EndpointRole::Downstream)).await.unwrap();
        let mut sub = up.subscribe("/ge/web/+").await.unwrap();

        down.publish("/ge/web/abc123", br#"{"bench_id":"x"}"#.to_vec()).await.unwrap();
        let d = sub.recv().await.unwrap();
        let v: Value = serde_json::from_slice(&d.payload).unwrap();
        assert_eq!(v["webtalkID"], "abc123");
        assert_eq!(v["data"]["bench_id"], "x");
        assert_eq!(v["operationType"], "uploadRtd");
    }

    #[tokio::test]
    async fn unreachable_role_refuses_connect() {
        let factory = LoopbackFactory::new(FaultPlan {
            unreachable: HashSet::from([EndpointRole::Downstream]),
            ..Default::default()
        });
        assert!(factory.connect(&addr(EndpointRole::Upstream)).await.is_ok());
        let err = factory.connect(&addr(EndpointRole::Downstream)).await.err().unwrap();
        assert_eq!(err.kind(), bench_api::ErrorKind::Connection);
    }

    #[tokio::test]
    async fn fail_after_rejects_later_publishes() {
        let factory = LoopbackFactory::new(FaultPlan { fail_after: Some(2), ..Default::default() });
        let down = factory.connect(&addr(EndpointRole::Downstream)).await.unwrap();
        assert!(down.publish("/t", vec![]).await.is_ok());
        assert!(down.publish("/t", vec![]).await.is_ok());
        assert!(down.publish("/t", vec![]).await.is_err());
        assert_eq!(factory.accepted(), 2);
    }

    #[tokio::test]
    async fn invalid_topics_rejected() {
        let factory = LoopbackFactory::default();
        let down = factory.connect(&addr(EndpointRole::Downstream)).await.unwrap();
        let err = down.publish("/ge/+/x", vec![]).await.unwrap_err();
        assert_eq!(err.kind(), bench_api::ErrorKind::Topic);
        assert!(down.subscribe("/ge/#/x").await.is_err());
    }
}

use serde::{Deserialize, Serialize};

use crate::BenchError;

// ════════════════════════════════════════════════════════════════
//  Endpoint addressing
// ════════════════════════════════════════════════════════════════

/// Роль endpoint'а относительно forwarder'а под нагрузкой.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EndpointRole {
    /// Куда harness публикует синтетическую нагрузку.
    Downstream,
    /// Где harness наблюдает пересланный трафик.
    Upstream,
}

impl std::fmt::Display for EndpointRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EndpointRole::Downstream => f.write_str("downstream"),
            EndpointRole::Upstream => f.write_str("upstream"),
        }
    }
}

/// Explicit host/port of one endpoint. Never hard-coded by adapters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EndpointAddr {
    pub role: EndpointRole,
    pub host: String,
    pub port: u16,
}

impl EndpointAddr {
    pub fn new(role: EndpointRole, host: impl Into<String>, port: u16) -> Self {
        Self { role, host: host.into(), port }
    }
}

impl std::fmt::Display for EndpointAddr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}({}:{})", self.role, self.host, self.port)
    }
}

// ════════════════════════════════════════════════════════════════
//  Message / Delivery
// ════════════════════════════════════════════════════════════════

/// Синтетическое сообщение, созданное генератором непосредственно
/// перед публикацией.
///
/// `id` и `sent_us` заполнены только для коррелируемых прогонов; оба
/// значения также вшиты в сам payload, чтобы пережить пересылку.
#[derive(Debug, Clone)]
pub struct Message {
    pub id: Option<String>,
    pub sent_us: Option<i64>,
    pub payload: Vec<u8>,
}

impl Message {
    pub fn len(&self) -> usize {
        self.payload.len()
    }

    pub fn is_empty(&self) -> bool {
        self.payload.is_empty()
    }
}

/// One inbound message as observed by a subscription.
#[derive(Debug, Clone)]
pub struct Delivery {
    pub topic: String,
    pub payload: Vec<u8>,
    /// Wall-clock receive time, unix microseconds, stamped by the adapter
    /// as close to the wire as it can.
    pub received_us: i64,
}

/// Result of a batch publish. Messages are accepted in order, so the
/// first `accepted` of the batch reached the endpoint.
#[derive(Debug, Clone)]
pub struct BatchAck {
    pub accepted: usize,
    pub error: Option<BenchError>,
}

impl BatchAck {
    pub fn all(n: usize) -> Self {
        Self { accepted: n, error: None }
    }

    pub fn none(error: BenchError) -> Self {
        Self { accepted: 0, error: Some(error) }
    }
}

// ════════════════════════════════════════════════════════════════
//  Resource usage
// ════════════════════════════════════════════════════════════════

/// Point-in-time CPU/memory usage of a container or process.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Usage {
    pub cpu_percent: f64,
    pub memory_percent: f64,
    /// Как отдаёт runtime, напр. "12.3MiB / 1.944GiB".
    pub memory_usage: String,
}

impl Usage {
    /// Нулевой sample: телеметрия недоступна.
    pub fn unavailable() -> Self {
        Self {
            cpu_percent: 0.0,
            memory_percent: 0.0,
            memory_usage: "N/A".to_string(),
        }
    }
}

use serde::{Deserialize, Serialize};

use bench_api::BenchError;

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("connection ({endpoint}): {source}")]
    Connection { endpoint: String, source: BenchError },

    #[error("subscription ({filter}): {source}")]
    Subscription { filter: String, source: BenchError },

    #[error("broker unavailable: {failures} consecutive publish failures at message {at}: {last}")]
    BrokerUnavailable { at: u64, failures: u32, last: BenchError },

    #[error("task join: {0}")]
    Join(#[from] tokio::task::JoinError),
}

/// Категория прерывания сценария (сериализуется в отчёт).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AbortKind {
    Connection,
    FailureThreshold,
    Internal,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AbortReason {
    pub kind: AbortKind,
    pub detail: String,
    /// 1-based индекс сообщения, на котором сработал breaker.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub at_message: Option<u64>,
}

impl EngineError {
    pub fn abort_reason(&self) -> AbortReason {
        let (kind, at_message) = match self {
            Self::Connection { .. } | Self::Subscription { .. } => (AbortKind::Connection, None),
            Self::BrokerUnavailable { at, .. } => (AbortKind::FailureThreshold, Some(*at)),
            Self::Join(_) => (AbortKind::Internal, None),
        };
        AbortReason { kind, detail: self.to_string(), at_message }
    }
}

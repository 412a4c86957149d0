use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use crate::{BatchAck, BenchError, Delivery, EndpointAddr, Usage};

// ════════════════════════════════════════════════════════════════
//  Endpoint Adapter Traits
// ════════════════════════════════════════════════════════════════

/// Фабрика адаптеров: открывает сессию к endpoint'у по адресу.
///
/// Реализации: MQTT client, mosquitto CLI, in-process loopback.
/// Каждый сценарий открывает свои адаптеры и закрывает их в конце.
pub trait AdapterFactory: Send + Sync {
    /// Short name used in logs and reports ("mqtt", "mosquitto-cli", ...).
    fn kind(&self) -> &str;

    /// Open a session. Unreachable endpoint → `ErrorKind::Connection`.
    fn connect(&self, endpoint: &EndpointAddr)
        -> Pin<Box<dyn Future<Output = Result<Arc<dyn EndpointAdapter>, BenchError>> + Send + '_>>;
}

/// Открытая сессия к одному endpoint'у.
///
/// Адаптер никогда не делает retry сам: политика повторов на стороне
/// вызывающего (publisher worker).
pub trait EndpointAdapter: Send + Sync {
    fn endpoint(&self) -> &EndpointAddr;

    /// Опубликовать одно сообщение. Ok = endpoint принял сообщение.
    fn publish(&self, topic: &str, payload: Vec<u8>)
        -> Pin<Box<dyn Future<Output = Result<(), BenchError>> + Send + '_>>;

    /// Опубликовать пачку в один topic. По умолчанию: последовательно,
    /// до первой ошибки.
    fn publish_batch(&self, topic: &str, payloads: Vec<Vec<u8>>)
        -> Pin<Box<dyn Future<Output = BatchAck> + Send + '_>>
    {
        let topic = topic.to_string();
        Box::pin(async move {
            let mut accepted = 0;
            for payload in payloads {
                if let Err(e) = self.publish(&topic, payload).await {
                    return BatchAck { accepted, error: Some(e) };
                }
                accepted += 1;
            }
            BatchAck::all(accepted)
        })
    }

    /// Подписаться на filter. Возвращается после того, как подписка
    /// зарегистрирована у broker'а (насколько адаптер может это знать).
    fn subscribe(&self, filter: &str)
        -> Pin<Box<dyn Future<Output = Result<Box<dyn Subscription>, BenchError>> + Send + '_>>;

    /// Закрыть сессию. Идемпотентно.
    fn close(&self) -> Pin<Box<dyn Future<Output = ()> + Send + '_>>;
}

/// Подписка: бесконечный поток входящих сообщений.
///
/// `recv` обязан быть cancel-safe: реализации читают сеть в отдельной
/// задаче и отдают сообщения через канал, так что брошенный `recv`
/// не рвёт чтение на середине.
pub trait Subscription: Send {
    /// Следующее сообщение. None = подписка закрыта.
    fn recv(&mut self) -> Pin<Box<dyn Future<Output = Option<Delivery>> + Send + '_>>;

    /// Stop delivery and wait for the reader to finish its in-flight read.
    fn close(&mut self) -> Pin<Box<dyn Future<Output = ()> + Send + '_>>;
}

// ════════════════════════════════════════════════════════════════
//  Resource Probe
// ════════════════════════════════════════════════════════════════

/// Pluggable telemetry: one synchronous point-in-time query per call.
pub trait ResourceProbe: Send + Sync {
    fn sample_usage(&self, target: &str)
        -> Pin<Box<dyn Future<Output = Result<Usage, BenchError>> + Send + '_>>;
}

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

use tokio::sync::watch;

// ═══════════════════════════════════════════════════════════════
//  Types
// ═══════════════════════════════════════════════════════════════

/// Принятое endpoint'ом correlated сообщение.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SendRecord {
    pub id: String,
    pub sent_us: i64,
}

/// Классификация одной доставки listener'ом.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Arrival {
    /// Сценарий без correlation: только счёт.
    Plain,
    /// Payload не разобрался как JSON.
    Malformed,
    /// JSON без correlation id.
    Unstamped,
    Stamped { id: String, received_us: i64 },
}

/// Согласованный срез счётчиков и latency-сэмплов.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LedgerSnapshot {
    pub sent: u64,
    pub accepted: u64,
    pub publish_failures: u64,
    pub received: u64,
    pub malformed: u64,
    pub uncorrelated: u64,
    /// Принятые, но так и не полученные correlated сообщения.
    pub unresolved: u64,
    /// Latency в миллисекундах, по одной на resolved сообщение.
    pub latencies_ms: Vec<f64>,
}

#[derive(Default)]
struct State {
    sent: u64,
    accepted: u64,
    publish_failures: u64,
    received: u64,
    malformed: u64,
    unstamped: u64,
    /// id → send timestamp, ждут доставки.
    pending: HashMap<String, i64>,
    /// id → receive timestamp для доставок, обогнавших запись о send'е.
    early: HashMap<String, i64>,
    /// Ранние доставки, не влезшие в `early`.
    early_dropped: u64,
    latencies_ms: Vec<f64>,
}

// ═══════════════════════════════════════════════════════════════
//  Ledger
// ═══════════════════════════════════════════════════════════════

/// Общий учёт сценария: счётчики publisher'а и listener'а плюс
/// сопоставление send/receive по correlation id.
///
/// Один mutex на всё состояние: snapshot видит counters и pending
/// согласованно, а операции внутри: O(1) map lookups.
pub struct Ledger {
    state: Mutex<State>,
    received_tx: watch::Sender<u64>,
    early_capacity: usize,
}

impl Ledger {
    pub fn new(early_capacity: usize) -> Self {
        let (received_tx, _) = watch::channel(0);
        Self { state: Mutex::new(State::default()), received_tx, early_capacity }
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        // Состояние: только счётчики и maps; после паники другого потока
        // они остаются валидными.
        self.state.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Endpoint принял `count` сообщений. `records`: correlated из них.
    pub fn record_accepted(&self, count: u64, records: Vec<SendRecord>) {
        let mut st = self.lock();
        st.sent += count;
        st.accepted += count;
        for SendRecord { id, sent_us } in records {
            match st.early.remove(&id) {
                Some(received_us) => {
                    let latency = latency_ms(sent_us, received_us);
                    st.latencies_ms.push(latency);
                }
                None => {
                    st.pending.entry(id).or_insert(sent_us);
                }
            }
        }
    }

    /// Publish `count` сообщений не удался. `counted`: учитывать ли
    /// попытку в `sent` (попытка, сработавшая breaker'ом, не учитывается).
    pub fn record_failed(&self, count: u64, counted: bool) {
        let mut st = self.lock();
        st.publish_failures += count;
        if counted {
            st.sent += count;
        }
    }

    /// Учесть доставку. Возвращает новое значение `received`.
    pub fn record_arrival(&self, arrival: Arrival) -> u64 {
        let received = {
            let mut st = self.lock();
            st.received += 1;
            match arrival {
                Arrival::Plain => {}
                Arrival::Malformed => st.malformed += 1,
                Arrival::Unstamped => st.unstamped += 1,
                Arrival::Stamped { id, received_us } => match st.pending.remove(&id) {
                    Some(sent_us) => {
                        let latency = latency_ms(sent_us, received_us);
                        st.latencies_ms.push(latency);
                    }
                    None if st.early.len() < self.early_capacity => {
                        st.early.entry(id).or_insert(received_us);
                    }
                    None => st.early_dropped += 1,
                },
            }
            st.received
        };
        self.received_tx.send_replace(received);
        received
    }

    pub fn received(&self) -> u64 {
        *self.received_tx.borrow()
    }

    /// Подписка на изменения `received` (для drain-ожидания).
    pub fn watch_received(&self) -> watch::Receiver<u64> {
        self.received_tx.subscribe()
    }

    pub fn snapshot(&self) -> LedgerSnapshot {
        let st = self.lock();
        LedgerSnapshot {
            sent: st.sent,
            accepted: st.accepted,
            publish_failures: st.publish_failures,
            received: st.received,
            malformed: st.malformed,
            uncorrelated: st.unstamped + st.early.len() as u64 + st.early_dropped,
            unresolved: st.pending.len() as u64,
            latencies_ms: st.latencies_ms.clone(),
        }
    }
}

fn latency_ms(sent_us: i64, received_us: i64) -> f64 {
    (received_us - sent_us) as f64 / 1000.0
}

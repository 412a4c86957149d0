//! Shared types and narrow interfaces of the forwarder benchmark.
//!
//! Этот crate не зависит от tokio: только типы и трейты, которые
//! реализуют адаптеры (`plugins/adapter/*`), пробы (`plugins/probe/*`)
//! и которыми пользуется engine.

mod endpoint;
mod error;
mod types;
mod util;

pub use endpoint::{AdapterFactory, EndpointAdapter, ResourceProbe, Subscription};
pub use error::{BenchError, ErrorKind};
pub use types::{BatchAck, Delivery, EndpointAddr, EndpointRole, Message, Usage};
pub use util::{datetime_from_us, now_us, preview, resolve_path, topic_matches, valid_filter, valid_topic};

pub mod config;
pub mod error;
pub mod generator;
pub mod ledger;
pub mod listener;
pub mod metrics;
pub mod publisher;
pub mod runner;
pub mod sampler;

pub use config::{LoadShape, PayloadSpec, RunnerConfig, Scenario, TopicPlan};
pub use error::{AbortKind, AbortReason, EngineError};
pub use generator::{Generator, Stamp, extract_stamp};
pub use ledger::{Arrival, Ledger, LedgerSnapshot, SendRecord};
pub use listener::{ListenerHandle, ListenerReport, StopCause, spawn_listener};
pub use metrics::{
    LatencySummary, Percentile, ResourceSummary, RunRecord, ScenarioParams, ScenarioResult,
    ScenarioStatus, SuiteSummary, aggregate, loss_rate, throughput,
};
pub use publisher::{PublishPlan, SendOutcome, run_publisher, spawn_publisher};
pub use runner::{RunPhase, ScenarioRunner};
pub use sampler::{ResourceSample, Sampler, spawn_sampler};

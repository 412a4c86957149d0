#[derive(Debug, thiserror::Error)]
pub enum FwdBenchError {
    #[error("config: {0}")]
    Config(String),

    #[error("adapter: {0}")]
    Adapter(#[from] bench_api::BenchError),

    #[error("io ({context}): {source}")]
    Io { context: String, source: std::io::Error },

    #[error("json: {0}")]
    Json(#[from] serde_json::Error),

    #[error("signal: {0}")]
    Signal(std::io::Error),

    #[error("interrupted")]
    Interrupted,
}

impl FwdBenchError {
    pub fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        Self::Io { context: context.into(), source }
    }
}

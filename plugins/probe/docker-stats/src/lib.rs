//! ResourceProbe через `docker stats --no-stream`.

use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use tokio::process::Command;

use bench_api::{BenchError, ResourceProbe, Usage};

const FORMAT: &str = "{{.Container}},{{.CPUPerc}},{{.MemUsage}},{{.MemPerc}}";

pub struct DockerStatsProbe {
    docker_bin: String,
    timeout: Duration,
}

impl DockerStatsProbe {
    pub fn new(timeout: Duration) -> Self {
        Self { docker_bin: "docker".into(), timeout }
    }

    pub fn with_binary(mut self, docker_bin: impl Into<String>) -> Self {
        self.docker_bin = docker_bin.into();
        self
    }
}

impl Default for DockerStatsProbe {
    fn default() -> Self {
        Self::new(Duration::from_secs(10))
    }
}

impl DockerStatsProbe {
    async fn query(&self, target: &str) -> Result<Usage, BenchError> {
        let mut cmd = Command::new(&self.docker_bin);
        cmd.args(["stats", "--no-stream", "--format", FORMAT, target])
            .kill_on_drop(true);

        let output = match tokio::time::timeout(self.timeout, cmd.output()).await {
            Ok(output) => output?,
            Err(_) => {
                tracing::debug!(
                    target_name = %target,
                    timeout_ms = self.timeout.as_millis() as u64,
                    "docker stats timed out"
                );
                return Err(BenchError::timeout(format!("docker stats {target} timed out")));
            }
        };

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(BenchError::io(format!("docker stats {target}: {}", stderr.trim())));
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        let line = stdout
            .lines()
            .find(|l| !l.trim().is_empty())
            .ok_or_else(|| BenchError::format_err(format!("docker stats {target}: empty output")))?;
        parse_stats_line(line)
    }
}

impl ResourceProbe for DockerStatsProbe {
    fn sample_usage(&self, target: &str)
        -> Pin<Box<dyn Future<Output = Result<Usage, BenchError>> + Send + '_>>
    {
        let target = target.to_string();
        Box::pin(async move {
            let usage = self.query(&target).await;
            match &usage {
                Ok(u) => tracing::trace!(
                    target_name = %target,
                    cpu = u.cpu_percent,
                    mem = u.memory_percent,
                    "docker stats sample"
                ),
                Err(e) => tracing::debug!(target_name = %target, error = %e, "docker stats failed"),
            }
            usage
        })
    }
}

/// Разобрать строку `container,cpu%,mem usage,mem%`.
pub fn parse_stats_line(line: &str) -> Result<Usage, BenchError> {
    let parts: Vec<&str> = line.trim().split(',').map(str::trim).collect();
    let &[_container, cpu, mem_usage, mem_perc] = parts.as_slice() else {
        return Err(BenchError::format_err(format!("unexpected docker stats line: {line}")));
    };
    Ok(Usage {
        cpu_percent: parse_percent(cpu)?,
        memory_percent: parse_percent(mem_perc)?,
        memory_usage: mem_usage.to_string(),
    })
}

fn parse_percent(text: &str) -> Result<f64, BenchError> {
    let value = text.trim().trim_end_matches('%');
    if value == "--" {
        return Ok(0.0);
    }
    value
        .parse()
        .map_err(|e| BenchError::format_err(format!("bad percentage {text:?}: {e}")))
}

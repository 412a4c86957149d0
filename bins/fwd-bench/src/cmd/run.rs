use std::sync::Arc;

use adapter_loopback::LoopbackFactory;
use adapter_mosquitto_cli::CliFactory;
use adapter_mqtt::MqttFactory;
use bench_api::AdapterFactory;
use bench_engine::{ScenarioRunner, SuiteSummary};
use probe_docker_stats::DockerStatsProbe;

use super::report::{render_table, write_reports};
use crate::config::{AdapterKind, Effective};
use crate::error::FwdBenchError;

fn factory(eff: &Effective) -> Result<Arc<dyn AdapterFactory>, FwdBenchError> {
    let factory: Arc<dyn AdapterFactory> = match eff.adapter {
        AdapterKind::Mqtt => Arc::new(MqttFactory::new(eff.mqtt.clone())?),
        AdapterKind::MosquittoCli => Arc::new(CliFactory::new(eff.mosquitto.clone())),
        AdapterKind::Loopback => Arc::new(LoopbackFactory::default()),
    };
    Ok(factory)
}

/// Прогнать набор, записать отчёты, вернуть сводку.
pub async fn run(eff: Effective) -> Result<SuiteSummary, FwdBenchError> {
    let factory = factory(&eff)?;
    let mut runner = ScenarioRunner::new(
        factory.clone(),
        eff.downstream.clone(),
        eff.upstream.clone(),
        eff.runner.clone(),
    );
    if eff.runner.sampler_target.is_some() {
        runner = runner.with_probe(Arc::new(DockerStatsProbe::default()));
    }

    tracing::info!(
        run_id = %eff.run_id,
        suite = %eff.suite_name,
        scenarios = eff.scenarios.len(),
        adapter = %factory.kind(),
        downstream = %eff.downstream,
        upstream = %eff.upstream,
        topic_base = %eff.runner.topic_base,
        "benchmark started"
    );

    let summary = tokio::select! {
        summary = runner.run_suite(eff.run_id.clone(), &eff.scenarios, eff.cooldown) => summary,
        signal = tokio::signal::ctrl_c() => {
            signal.map_err(FwdBenchError::Signal)?;
            tracing::warn!("interrupted, no report written");
            return Err(FwdBenchError::Interrupted);
        }
    };

    print!("{}", render_table(&summary));
    let (json, md) = write_reports(&eff.results_dir, &eff.suite_name, &summary)?;
    tracing::info!(
        json = %json.display(),
        markdown = %md.display(),
        completed = summary.completed,
        aborted = summary.aborted,
        "reports written"
    );
    Ok(summary)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Config, RunArgs, parse_config};

    fn loopback_args(dir: &std::path::Path) -> RunArgs {
        RunArgs {
            config: "unused.toml".into(),
            suite: None,
            adapter: Some(AdapterKind::Loopback),
            downstream_host: None,
            downstream_port: None,
            upstream_host: None,
            upstream_port: None,
            topic_base: None,
            target: None,
            no_sample: true,
            qos: None,
            compose_file: None,
            cooldown: None,
            settle_ms: Some(100),
            failure_threshold: None,
            results_dir: Some(dir.to_path_buf()),
            run_id: Some("dry-run".into()),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn dry_run_over_loopback_writes_reports() {
        let dir = std::env::temp_dir().join(format!("fwd-bench-run-{}", uuid::Uuid::new_v4().simple()));
        let cfg: Config = parse_config(
            r#"
            [[scenarios]]
            name = "dry"
            messages = 25
            correlate = true
            "#,
        )
        .unwrap();
        let eff = Effective::merge(&loopback_args(&dir), cfg).unwrap();

        let summary = run(eff).await.unwrap();
        assert_eq!(summary.completed, 1);
        assert_eq!(summary.total_received, 25);
        assert!(dir.join("dry-run.json").exists());
        assert!(dir.join("dry-run.md").exists());
        let _ = std::fs::remove_dir_all(&dir);
    }
}

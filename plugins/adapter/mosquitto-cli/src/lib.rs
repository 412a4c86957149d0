//! Endpoint adapter поверх `mosquitto_pub` / `mosquitto_sub`.
//!
//! Утилиты запускаются напрямую или внутри контейнера broker'а через
//! `docker compose -f <file> exec -T <service>`.

use std::future::Future;
use std::pin::Pin;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use bench_api::{
    AdapterFactory, BatchAck, BenchError, Delivery, EndpointAdapter, EndpointAddr, EndpointRole,
    ErrorKind, Subscription, now_us, valid_filter, valid_topic,
};

// ═══════════════════════════════════════════════════════════════
//  Settings
// ═══════════════════════════════════════════════════════════════

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CliSettings {
    /// Если задан: утилиты запускаются через `docker compose exec`.
    pub compose_file: Option<String>,
    pub downstream_service: String,
    pub upstream_service: String,
    /// Адрес broker'а изнутри контейнера.
    pub container_host: String,
    pub container_port: u16,
    pub pub_bin: String,
    pub sub_bin: String,
    pub qos: u8,
    pub command_timeout_ms: u64,
    pub inbox_capacity: usize,
}

impl Default for CliSettings {
    fn default() -> Self {
        Self {
            compose_file: None,
            downstream_service: "mqtt-broker-downstream".into(),
            upstream_service: "mqtt-broker-upstream".into(),
            container_host: "localhost".into(),
            container_port: 1883,
            pub_bin: "mosquitto_pub".into(),
            sub_bin: "mosquitto_sub".into(),
            qos: 0,
            command_timeout_ms: 10_000,
            inbox_capacity: 65_536,
        }
    }
}

impl CliSettings {
    fn service(&self, role: EndpointRole) -> &str {
        match role {
            EndpointRole::Downstream => &self.downstream_service,
            EndpointRole::Upstream => &self.upstream_service,
        }
    }

    /// Полная командная строка: `[program, args...]`.
    pub fn command_line(&self, endpoint: &EndpointAddr, tool: &str, args: &[&str]) -> Vec<String> {
        let mut argv = Vec::new();
        let (host, port) = match &self.compose_file {
            Some(file) => {
                argv.extend(["docker", "compose", "-f", file.as_str(), "exec", "-T"].map(String::from));
                argv.push(self.service(endpoint.role).to_string());
                (self.container_host.clone(), self.container_port)
            }
            None => (endpoint.host.clone(), endpoint.port),
        };
        argv.push(tool.to_string());
        argv.extend(["-h".to_string(), host, "-p".to_string(), port.to_string()]);
        argv.extend(["-q".to_string(), self.qos.to_string()]);
        argv.extend(args.iter().map(|a| a.to_string()));
        argv
    }
}

fn command(argv: &[String]) -> Result<Command, BenchError> {
    let (program, args) = argv
        .split_first()
        .ok_or_else(|| BenchError::io("empty command line"))?;
    let mut cmd = Command::new(program);
    cmd.args(args).kill_on_drop(true);
    Ok(cmd)
}

/// Ошибку утилиты по stderr: отказ соединения или отказ broker'а.
fn classify_failure(endpoint: &EndpointAddr, stderr: &str) -> BenchError {
    let text = stderr.trim();
    let lower = text.to_ascii_lowercase();
    let kind = if lower.contains("connection refused")
        || lower.contains("unable to connect")
        || lower.contains("lookup error")
        || lower.contains("is not running")
    {
        ErrorKind::Connection
    } else {
        ErrorKind::Rejected
    };
    BenchError::new(kind, format!("{endpoint}: {text}"))
}

/// Разобрать строку `mosquitto_sub -v`: `<topic> <payload>`.
pub fn parse_verbose_line(line: &str) -> Option<(&str, &str)> {
    let line = line.trim_end_matches(['\r', '\n']);
    match line.split_once(' ') {
        Some((topic, payload)) => Some((topic, payload)),
        None if !line.is_empty() => Some((line, "")),
        None => None,
    }
}

// ═══════════════════════════════════════════════════════════════
//  Factory
// ═══════════════════════════════════════════════════════════════

pub struct CliFactory {
    settings: Arc<CliSettings>,
}

impl CliFactory {
    pub fn new(settings: CliSettings) -> Self {
        Self { settings: Arc::new(settings) }
    }

    /// Без compose: TCP-проверка порта; с compose: сервис должен
    /// значиться запущенным.
    async fn probe(&self, endpoint: &EndpointAddr) -> Result<(), BenchError> {
        let wait = Duration::from_millis(self.settings.command_timeout_ms);
        match &self.settings.compose_file {
            None => {
                let addr = (endpoint.host.as_str(), endpoint.port);
                match tokio::time::timeout(wait, tokio::net::TcpStream::connect(addr)).await {
                    Ok(Ok(_)) => Ok(()),
                    Ok(Err(e)) => Err(BenchError::connection(format!("{endpoint}: {e}"))),
                    Err(_) => Err(BenchError::connection(format!("{endpoint}: connect timed out"))),
                }
            }
            Some(file) => {
                let argv: Vec<String> = ["docker", "compose", "-f", file.as_str(), "ps", "--status", "running", "--services"]
                    .map(String::from)
                    .to_vec();
                let mut cmd = command(&argv)?;
                let output = tokio::time::timeout(wait, cmd.output())
                    .await
                    .map_err(|_| BenchError::timeout("docker compose ps timed out"))??;
                let service = self.settings.service(endpoint.role);
                let running = String::from_utf8_lossy(&output.stdout)
                    .lines()
                    .any(|l| l.trim() == service);
                if output.status.success() && running {
                    Ok(())
                } else {
                    Err(BenchError::connection(format!("{endpoint}: service {service} is not running")))
                }
            }
        }
    }
}

impl AdapterFactory for CliFactory {
    fn kind(&self) -> &str {
        "mosquitto-cli"
    }

    fn connect(&self, endpoint: &EndpointAddr)
        -> Pin<Box<dyn Future<Output = Result<Arc<dyn EndpointAdapter>, BenchError>> + Send + '_>>
    {
        let endpoint = endpoint.clone();
        Box::pin(async move {
            self.probe(&endpoint).await?;
            let adapter: Arc<dyn EndpointAdapter> = Arc::new(CliAdapter {
                endpoint,
                settings: self.settings.clone(),
            });
            Ok(adapter)
        })
    }
}

// ═══════════════════════════════════════════════════════════════
//  Adapter
// ═══════════════════════════════════════════════════════════════

pub struct CliAdapter {
    endpoint: EndpointAddr,
    settings: Arc<CliSettings>,
}

impl CliAdapter {
    /// Запустить утилиту, отдать `stdin` и дождаться завершения.
    ///
    /// Запись в `stdin` и ожидание процесса идут под одним timeout'ом:
    /// утилита, которая не читает вход, не должна блокировать publish.
    /// При истечении child drop'ается и убивается (`kill_on_drop`).
    async fn run_with_stdin(&self, argv: Vec<String>, stdin: Vec<u8>) -> Result<(), BenchError> {
        let mut cmd = command(&argv)?;
        cmd.stdin(Stdio::piped()).stdout(Stdio::null()).stderr(Stdio::piped());
        let mut child = cmd.spawn()?;

        let input = child.stdin.take();
        let feed = async move {
            if let Some(mut input) = input {
                input.write_all(&stdin).await?;
                input.shutdown().await?;
            }
            Ok::<_, std::io::Error>(())
        };

        let wait = Duration::from_millis(self.settings.command_timeout_ms);
        let (fed, output) = tokio::time::timeout(wait, async { tokio::join!(feed, child.wait_with_output()) })
            .await
            .map_err(|_| BenchError::timeout(format!("{}: {} timed out", self.endpoint, argv[0])))?;

        let output = output?;
        if !output.status.success() {
            return Err(classify_failure(&self.endpoint, &String::from_utf8_lossy(&output.stderr)));
        }
        fed?;
        Ok(())
    }
}

impl EndpointAdapter for CliAdapter {
    fn endpoint(&self) -> &EndpointAddr {
        &self.endpoint
    }

    fn publish(&self, topic: &str, payload: Vec<u8>)
        -> Pin<Box<dyn Future<Output = Result<(), BenchError>> + Send + '_>>
    {
        let topic = topic.to_string();
        Box::pin(async move {
            if !valid_topic(&topic) {
                return Err(BenchError::topic(format!("invalid topic: {topic}")));
            }
            let argv = self
                .settings
                .command_line(&self.endpoint, &self.settings.pub_bin, &["-t", &topic, "-s"]);
            self.run_with_stdin(argv, payload).await
        })
    }

    /// Одна `mosquitto_pub -l`: каждая строка stdin: отдельное сообщение.
    fn publish_batch(&self, topic: &str, payloads: Vec<Vec<u8>>)
        -> Pin<Box<dyn Future<Output = BatchAck> + Send + '_>>
    {
        let topic = topic.to_string();
        Box::pin(async move {
            if !valid_topic(&topic) {
                return BatchAck::none(BenchError::topic(format!("invalid topic: {topic}")));
            }
            if payloads.iter().any(|p| p.contains(&b'\n')) {
                return BatchAck::none(BenchError::format_err("line mode cannot carry multi-line payloads"));
            }
            let count = payloads.len();
            let mut stdin = Vec::with_capacity(payloads.iter().map(|p| p.len() + 1).sum());
            for p in payloads {
                stdin.extend_from_slice(&p);
                stdin.push(b'\n');
            }
            let argv = self
                .settings
                .command_line(&self.endpoint, &self.settings.pub_bin, &["-t", &topic, "-l"]);
            match self.run_with_stdin(argv, stdin).await {
                Ok(()) => BatchAck::all(count),
                Err(e) => BatchAck::none(e),
            }
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
            let argv = self
                .settings
                .command_line(&self.endpoint, &self.settings.sub_bin, &["-t", &filter, "-v"]);
            let mut cmd = command(&argv)?;
            cmd.stdin(Stdio::null()).stdout(Stdio::piped()).stderr(Stdio::null());
            let mut child = cmd.spawn()?;
            let stdout = child
                .stdout
                .take()
                .ok_or_else(|| BenchError::io("mosquitto_sub stdout not captured"))?;

            let (tx, rx) = mpsc::channel(self.settings.inbox_capacity);
            let endpoint = self.endpoint.clone();
            let reader = tokio::spawn(async move {
                let mut lines = BufReader::new(stdout).lines();
                loop {
                    match lines.next_line().await {
                        Ok(Some(line)) => {
                            let Some((topic, payload)) = parse_verbose_line(&line) else { continue };
                            let delivery = Delivery {
                                topic: topic.to_string(),
                                payload: payload.as_bytes().to_vec(),
                                received_us: now_us(),
                            };
                            if tx.send(delivery).await.is_err() {
                                break;
                            }
                        }
                        Ok(None) => break,
                        Err(e) => {
                            tracing::warn!(%endpoint, error = %e, "mosquitto_sub read error");
                            break;
                        }
                    }
                }
                tracing::debug!(%endpoint, "mosquitto_sub reader stopped");
            });

            tracing::debug!(endpoint = %self.endpoint, %filter, "mosquitto_sub started");
            let sub: Box<dyn Subscription> = Box::new(CliSubscription { child, reader: Some(reader), rx });
            Ok(sub)
        })
    }

    fn close(&self) -> Pin<Box<dyn Future<Output = ()> + Send + '_>> {
        Box::pin(async {})
    }
}

struct CliSubscription {
    child: Child,
    reader: Option<JoinHandle<()>>,
    rx: mpsc::Receiver<Delivery>,
}

impl Subscription for CliSubscription {
    fn recv(&mut self) -> Pin<Box<dyn Future<Output = Option<Delivery>> + Send + '_>> {
        Box::pin(self.rx.recv())
    }

    /// Остановить процесс; reader дочитывает stdout до EOF.
    fn close(&mut self) -> Pin<Box<dyn Future<Output = ()> + Send + '_>> {
        Box::pin(async move {
            let _ = self.child.start_kill();
            let _ = self.child.wait().await;
            self.rx.close();
            if let Some(reader) = self.reader.take() {
                let _ = reader.await;
            }
        })
    }
}

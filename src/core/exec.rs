//! Remote-exec attach session.
//!
//! Drives one attach from "remote process requested, endpoint known" through
//! to the local exit code: poll the endpoint until it is ready, negotiate
//! terminal mode, perform the websocket handshake, then relay stdio over the
//! multiplexed connection until the control channel signals termination.

use std::time::Duration;

use anyhow::{anyhow, bail, Result};
use crossterm::style::Stylize;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::oneshot;
use tokio::time::{interval_at, Instant};
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::{connect_async_tls_with_config, Connector, MaybeTlsStream, WebSocketStream};

use crate::core::config::TransportConfig;
use crate::core::mux::{MuxChannel, MuxConnection, MuxReceiver, MuxSender};
use crate::core::options::{ClientOptions, OPTIONS_HEADER};
use crate::utils::retry::RetryStrategy;
use crate::utils::{report, term};

const READY_BUDGET: Duration = Duration::from_secs(120);
const ATTACH_BUDGET: Duration = Duration::from_secs(10);
const RETRY_DELAY: Duration = Duration::from_secs(1);
const IDLE_TIMEOUT: Duration = Duration::from_secs(10);
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(5);
const HEARTBEAT: u8 = 0x1;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Invoked exactly once when the session ends, with the failure if any.
pub type CompletionCallback = Box<dyn FnOnce(Option<&anyhow::Error>) + Send>;

/// One remote-exec attach. Transient: construct, configure, `execute`.
pub struct ExecSession {
    endpoint: String,
    transport: TransportConfig,
    enable_tty: bool,
    show_attaching: bool,
    ready_retry: RetryStrategy,
    attach_retry: RetryStrategy,
    on_complete: Option<CompletionCallback>,
}

impl ExecSession {
    pub fn new(endpoint: impl Into<String>, transport: TransportConfig) -> Self {
        Self {
            endpoint: endpoint.into(),
            transport,
            enable_tty: false,
            show_attaching: false,
            ready_retry: RetryStrategy::new(READY_BUDGET, RETRY_DELAY),
            attach_retry: RetryStrategy::new(ATTACH_BUDGET, RETRY_DELAY),
            on_complete: None,
        }
    }

    /// Request a pseudo-terminal. Only honored when stdin is interactive.
    pub fn with_tty(mut self, enable: bool) -> Self {
        self.enable_tty = enable;
        self
    }

    pub fn with_attaching_indicator(mut self, show: bool) -> Self {
        self.show_attaching = show;
        self
    }

    /// Override the readiness and handshake retry budgets.
    pub fn with_retry(mut self, ready: RetryStrategy, attach: RetryStrategy) -> Self {
        self.ready_retry = ready;
        self.attach_retry = attach;
        self
    }

    pub fn on_complete(
        mut self,
        callback: impl FnOnce(Option<&anyhow::Error>) + Send + 'static,
    ) -> Self {
        self.on_complete = Some(Box::new(callback));
        self
    }

    /// Run the session against the local process's stdio and return the
    /// process exit code: 0 on success, 1 on any failure.
    pub async fn execute(self) -> i32 {
        self.execute_with_io(
            tokio::io::stdin(),
            tokio::io::stdout(),
            tokio::io::stderr(),
        )
        .await
    }

    /// Run the session against the given stdio streams (piped attach).
    pub async fn execute_with_io<R, W, E>(mut self, stdin: R, stdout: W, stderr: E) -> i32
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
        E: AsyncWrite + Unpin + Send + 'static,
    {
        let on_complete = self.on_complete.take();
        let result = self.run_session(stdin, stdout, stderr).await;
        let code = match &result {
            Ok(()) => 0,
            Err(err) => {
                report::failure(&format!("{err:#}"));
                1
            }
        };
        if let Some(callback) = on_complete {
            callback(result.as_ref().err());
        }
        code
    }

    async fn run_session<R, W, E>(&mut self, stdin: R, stdout: W, stderr: E) -> Result<()>
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
        E: AsyncWrite + Unpin + Send + 'static,
    {
        let spinner = if self.show_attaching {
            Spinner::start()
        } else {
            None
        };

        if let Err(err) = self.ready_retry.run(|| self.probe_ready()).await {
            if let Some(spinner) = spinner {
                spinner.finish("failed").await;
            }
            return Err(err.context("waiting for remote endpoint to become ready"));
        }

        // Raw mode stays in effect for the whole interaction; the guard
        // restores the previous terminal state on every exit path.
        let (opts, raw_guard) = self.negotiate_terminal()?;

        let ws = match self.attach_retry.run(|| self.attach(&opts)).await {
            Ok(ws) => ws,
            Err(err) => {
                if let Some(spinner) = spinner {
                    spinner.finish("error").await;
                }
                return Err(err.context("attaching to remote endpoint"));
            }
        };
        if let Some(spinner) = spinner {
            spinner.finish("ok").await;
        }

        let result = interact(ws, &opts, stdin, stdout, stderr).await;
        drop(raw_guard);
        result
    }

    /// Lightweight readiness check; only HTTP 200 counts.
    async fn probe_ready(&self) -> Result<()> {
        let scheme = if self.transport.tls { "https" } else { "http" };
        let url = format!("{scheme}://{}/ok", self.endpoint);
        let response = self
            .transport
            .http
            .get(&url)
            .timeout(Duration::from_secs(2))
            .send()
            .await?;
        if response.status() != reqwest::StatusCode::OK {
            bail!("http error {}", response.status());
        }
        Ok(())
    }

    fn negotiate_terminal(&self) -> Result<(ClientOptions, Option<term::RawModeGuard>)> {
        if self.enable_tty && term::stdin_is_tty() {
            let (width, height) = term::size()?;
            let guard = term::RawModeGuard::enter()?;
            tracing::debug!("entered raw mode, terminal is {width}x{height}");
            Ok((ClientOptions::with_terminal(width, height), Some(guard)))
        } else {
            Ok((ClientOptions::piped(), None))
        }
    }

    /// One websocket handshake attempt, carrying the serialized options as
    /// an out-of-band header.
    async fn attach(&self, opts: &ClientOptions) -> Result<WsStream> {
        let scheme = if self.transport.tls { "wss" } else { "ws" };
        let mut request = format!("{scheme}://{}/", self.endpoint).into_client_request()?;
        let encoded = serde_json::to_string(opts)?;
        request
            .headers_mut()
            .insert(OPTIONS_HEADER, HeaderValue::from_str(&encoded)?);
        // The dial uses the same trust configuration as the readiness probe.
        let connector = self.transport.tls_config.clone().map(Connector::Rustls);
        let (ws, _) = connect_async_tls_with_config(request, None, false, connector).await?;
        tracing::debug!("websocket attached to {}", self.endpoint);
        Ok(ws)
    }
}

/// Relay loop: local stdio against the four session channels, a heartbeat
/// on the control channel every [`HEARTBEAT_INTERVAL`], and a concurrent
/// drain of the control channel whose outcome decides the session result.
async fn interact<S, R, W, E>(
    ws: WebSocketStream<S>,
    opts: &ClientOptions,
    stdin: R,
    stdout: W,
    stderr: E,
) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    R: AsyncRead + Unpin + Send + 'static,
    W: AsyncWrite + Unpin + Send + 'static,
    E: AsyncWrite + Unpin + Send + 'static,
{
    let (conn, channels) = MuxConnection::open(ws, &opts.channel_layout(), Some(IDLE_TIMEOUT));
    let closer = conn.closer();
    let Ok([stdin_ch, stdout_ch, stderr_ch, control_ch]) = <[MuxChannel; 4]>::try_from(channels)
    else {
        bail!("unexpected channel layout");
    };
    let (stdin_tx, _) = stdin_ch.split();
    let (_, stdout_rx) = stdout_ch.split();
    let (_, stderr_rx) = stderr_ch.split();
    let (mut control_tx, control_rx) = control_ch.split();

    let mut read_loop = tokio::spawn(conn.run());
    tokio::spawn(forward_stdin(stdin, stdin_tx));
    tokio::spawn(forward_output(stdout_rx, stdout));
    tokio::spawn(forward_output(stderr_rx, stderr));
    let mut drain = tokio::spawn(drain_control(control_rx));

    let mut heartbeat = interval_at(Instant::now() + HEARTBEAT_INTERVAL, HEARTBEAT_INTERVAL);
    let mut read_loop_done = false;
    let result = loop {
        tokio::select! {
            // Check the read loop first so a transport error is never
            // mistaken for a clean control-channel end-of-stream.
            biased;
            res = &mut read_loop, if !read_loop_done => {
                read_loop_done = true;
                if let Ok(Err(err)) = res {
                    break Err(err.context("multiplexed connection failed"));
                }
            }
            res = &mut drain => {
                break res.unwrap_or_else(|err| Err(anyhow!("control channel task failed: {err}")));
            }
            _ = heartbeat.tick() => {
                let _ = control_tx.write(&[HEARTBEAT]).await;
            }
        }
    };
    closer.close().await;
    result
}

/// Local input to the stdin channel; the channel is closed once local input
/// reaches end-of-stream so the remote process sees its stdin end.
async fn forward_stdin<R: AsyncRead + Unpin>(mut reader: R, mut tx: MuxSender) {
    let mut buf = [0u8; 4096];
    loop {
        match reader.read(&mut buf).await {
            // Local read failures end the relay, not the session.
            Ok(0) | Err(_) => break,
            Ok(n) => {
                if tx.write(&buf[..n]).await.is_err() {
                    break;
                }
            }
        }
    }
    let _ = tx.close().await;
}

async fn forward_output<W: AsyncWrite + Unpin>(mut rx: MuxReceiver, mut writer: W) {
    while let Some(chunk) = rx.recv().await {
        if writer.write_all(&chunk).await.is_err() {
            break;
        }
        let _ = writer.flush().await;
    }
}

/// The control channel is the authoritative termination signal: clean
/// end-of-stream with no data means the remote process exited successfully,
/// any payload is its failure message.
async fn drain_control(mut rx: MuxReceiver) -> Result<()> {
    let data = rx.drain().await;
    if data.is_empty() {
        Ok(())
    } else {
        bail!("remote command failed: {}", String::from_utf8_lossy(&data))
    }
}

/// Cosmetic "Attaching..." indicator shown while polling and handshaking.
struct Spinner {
    stop_tx: oneshot::Sender<()>,
    handle: tokio::task::JoinHandle<()>,
}

impl Spinner {
    fn start() -> Option<Self> {
        if !term::stdout_is_tty() && !term::stderr_is_tty() {
            return None;
        }
        let (stop_tx, mut stop_rx) = oneshot::channel();
        let handle = tokio::spawn(async move {
            let frames = ['|', '/', '-', '\\'];
            let mut i = 0;
            loop {
                tokio::select! {
                    _ = &mut stop_rx => break,
                    _ = tokio::time::sleep(Duration::from_millis(100)) => {
                        eprint!("\r{} {} ", "Attaching...".cyan(), frames[i % frames.len()]);
                        i += 1;
                    }
                }
            }
        });
        Some(Self { stop_tx, handle })
    }

    async fn finish(self, status: &str) {
        let _ = self.stop_tx.send(());
        let _ = self.handle.await;
        eprintln!("\r{} {status}", "Attaching...".cyan());
    }
}

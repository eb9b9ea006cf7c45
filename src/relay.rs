//! Relay from a gateway channel into a backend container over SSH.
//!
//! The gateway dials the container as an ordinary SSH client, opens a PTY
//! shell and then splices bytes with four concurrent flows:
//! - client input -> backend stdin
//! - backend stdout -> client
//! - backend stderr -> client
//! - wait for the backend session to exit
//!
//! Every flow reports to one completion queue with room for all four
//! outcomes. The first outcome ends the relay; the remaining flows are not
//! waited for and wind down once their streams close.
//!
//! Backend credentials come from [`BackendConfig`] and the backend host key is
//! accepted without verification.

use std::fmt;
use std::future::Future;
use std::io;
use std::sync::Arc;

use russh::keys::PublicKey;
use russh::{Channel, ChannelMsg, Disconnect, client};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::channel_io::{ChannelClosed, ChannelPipes, ClientIo, Pump};
use crate::config::BackendConfig;
use crate::directory::Container;

/// Number of concurrent flows per relay, and the completion queue capacity.
const FLOW_COUNT: usize = 4;

/// Command run by health checks.
const HEALTH_COMMAND: &str = "true";

/// Failure while setting up the backend session.
#[derive(Debug, Error)]
pub enum RelayError {
    #[error("timed out connecting to {0}")]
    Timeout(String),

    #[error("failed to connect to {addr}: {source}")]
    Dial {
        addr: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("backend rejected the gateway credentials")]
    Rejected,

    #[error("failed to open session: {0}")]
    Session(#[source] russh::Error),

    #[error("backend refused the PTY request")]
    Pty,

    #[error("backend refused to start a shell")]
    Shell,

    #[error("remote command exited with {0:?}")]
    Command(Option<u32>),
}

impl RelayError {
    /// Text written to the client channel when setup fails.
    pub fn client_message(&self) -> String {
        match self {
            RelayError::Timeout(_) | RelayError::Dial { .. } | RelayError::Rejected => format!(
                "Failed to connect to container via SSH. Error: {}\r\n",
                self
            ),
            RelayError::Session(_) | RelayError::Command(_) => {
                "Failed to create session to container\r\n".to_string()
            }
            RelayError::Pty => "Failed to request PTY on container\r\n".to_string(),
            RelayError::Shell => "Failed to start shell on container\r\n".to_string(),
        }
    }
}

/// Client-side handler for backend connections.
pub struct BackendHandler {
    target: String,
}

impl client::Handler for BackendHandler {
    type Error = anyhow::Error;

    async fn check_server_key(
        &mut self,
        _server_public_key: &PublicKey,
    ) -> Result<bool, Self::Error> {
        debug!("Accepting unverified host key from {}", self.target);
        Ok(true)
    }
}

/// Which relay flow produced an outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    ClientInput,
    BackendStdout,
    BackendStderr,
    SessionExit,
}

impl fmt::Display for Flow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Flow::ClientInput => "stdin copy",
            Flow::BackendStdout => "stdout copy",
            Flow::BackendStderr => "stderr copy",
            Flow::SessionExit => "session",
        };
        f.write_str(name)
    }
}

/// How a flow finished.
#[derive(Debug)]
pub enum FlowEnd {
    /// Source reached EOF after copying this many bytes.
    Copied(u64),
    Failed(io::Error),
    /// Backend session closed, with its exit status if one was sent.
    Exited(Option<u32>),
}

#[derive(Debug)]
pub struct FlowOutcome {
    pub flow: Flow,
    pub end: FlowEnd,
}

impl fmt::Display for FlowOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.end {
            FlowEnd::Copied(n) => write!(f, "{} ended after {} bytes", self.flow, n),
            FlowEnd::Failed(e) => write!(f, "{} ended: {}", self.flow, e),
            FlowEnd::Exited(Some(code)) => write!(f, "{} ended with status {}", self.flow, code),
            FlowEnd::Exited(None) => write!(f, "{} ended", self.flow),
        }
    }
}

/// Run the four relay flows and return the first outcome.
pub async fn splice<I, O, E, X>(
    client_input: I,
    client_output: mpsc::Sender<Vec<u8>>,
    backend_input: mpsc::Sender<Vec<u8>>,
    backend_stdout: O,
    backend_stderr: E,
    exit: X,
) -> FlowOutcome
where
    I: AsyncRead + Unpin + Send + 'static,
    O: AsyncRead + Unpin + Send + 'static,
    E: AsyncRead + Unpin + Send + 'static,
    X: Future<Output = Option<u32>> + Send + 'static,
{
    let (done_tx, mut done_rx) = mpsc::channel::<FlowOutcome>(FLOW_COUNT);

    spawn_copy(Flow::ClientInput, client_input, backend_input, done_tx.clone());
    spawn_copy(Flow::BackendStdout, backend_stdout, client_output.clone(), done_tx.clone());
    spawn_copy(Flow::BackendStderr, backend_stderr, client_output, done_tx.clone());
    tokio::spawn(async move {
        let status = exit.await;
        let _ = done_tx
            .send(FlowOutcome {
                flow: Flow::SessionExit,
                end: FlowEnd::Exited(status),
            })
            .await;
    });

    match done_rx.recv().await {
        Some(outcome) => outcome,
        // Every flow reports before its sender drops.
        None => FlowOutcome {
            flow: Flow::SessionExit,
            end: FlowEnd::Exited(None),
        },
    }
}

fn spawn_copy<R>(
    flow: Flow,
    reader: R,
    sink: mpsc::Sender<Vec<u8>>,
    done: mpsc::Sender<FlowOutcome>,
) where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let end = match copy_to_queue(reader, &sink).await {
            Ok(n) => FlowEnd::Copied(n),
            Err(e) => FlowEnd::Failed(e),
        };
        // Release the sink before reporting so the peer sees EOF promptly.
        drop(sink);
        let _ = done.send(FlowOutcome { flow, end }).await;
    });
}

async fn copy_to_queue<R>(mut reader: R, sink: &mpsc::Sender<Vec<u8>>) -> io::Result<u64>
where
    R: AsyncRead + Unpin,
{
    let mut buf = vec![0u8; 32 * 1024];
    let mut total = 0u64;
    loop {
        let n = reader.read(&mut buf).await?;
        if n == 0 {
            return Ok(total);
        }
        sink.send(buf[..n].to_vec())
            .await
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, ChannelClosed))?;
        total += n as u64;
    }
}

/// A live backend connection and the pump of its shell session.
pub struct RelayHandle {
    connection: client::Handle<BackendHandler>,
    pump: Pump,
}

impl RelayHandle {
    /// Tear down the session channel and the backend connection.
    async fn release(self) {
        // The stdin flow may still hold a writer; stopping the pump releases
        // the backend channel regardless.
        self.pump.abort();
        if let Err(e) = self
            .connection
            .disconnect(Disconnect::ByApplication, "relay finished", "en")
            .await
        {
            debug!("Backend disconnect failed: {}", e);
        }
    }
}

/// Dials backend containers and relays client channels into them.
pub struct RelayEngine {
    config: Arc<BackendConfig>,
    client_config: Arc<client::Config>,
}

impl RelayEngine {
    pub fn new(config: Arc<BackendConfig>) -> Self {
        Self {
            config,
            client_config: Arc::new(client::Config::default()),
        }
    }

    fn target(&self, container: &Container) -> String {
        format!("{}:{}", self.config.host, container.ssh_port)
    }

    /// Connect and log in to the container's SSH endpoint.
    async fn dial(
        &self,
        container: &Container,
        timeout: std::time::Duration,
    ) -> Result<client::Handle<BackendHandler>, RelayError> {
        let addr = self.target(container);
        let handler = BackendHandler {
            target: addr.clone(),
        };

        let login = async {
            let mut handle = client::connect(
                self.client_config.clone(),
                (self.config.host.as_str(), container.ssh_port),
                handler,
            )
            .await
            .map_err(|source| RelayError::Dial {
                addr: addr.clone(),
                source,
            })?;

            let auth = handle
                .authenticate_password(&self.config.username, &self.config.password)
                .await
                .map_err(|e| RelayError::Dial {
                    addr: addr.clone(),
                    source: e.into(),
                })?;
            if !auth.success() {
                return Err(RelayError::Rejected);
            }
            Ok(handle)
        };

        tokio::time::timeout(timeout, login)
            .await
            .map_err(|_| RelayError::Timeout(addr.clone()))?
    }

    /// Dial the backend and start a PTY shell on it.
    async fn open_shell(
        &self,
        container: &Container,
    ) -> Result<(client::Handle<BackendHandler>, Channel<client::Msg>), RelayError> {
        let connection = self.dial(container, self.config.connect_timeout()).await?;
        let mut channel = connection
            .channel_open_session()
            .await
            .map_err(RelayError::Session)?;

        let modes = [
            (russh::Pty::ECHO, 1),
            (russh::Pty::TTY_OP_ISPEED, 14400),
            (russh::Pty::TTY_OP_OSPEED, 14400),
        ];
        channel
            .request_pty(
                true,
                &self.config.term,
                self.config.cols,
                self.config.rows,
                0,
                0,
                &modes,
            )
            .await
            .map_err(|_| RelayError::Pty)?;
        if !expect_success(&mut channel).await {
            return Err(RelayError::Pty);
        }

        channel
            .request_shell(true)
            .await
            .map_err(|_| RelayError::Shell)?;
        if !expect_success(&mut channel).await {
            return Err(RelayError::Shell);
        }

        Ok((connection, channel))
    }

    /// Relay `client` into `container` until the first flow finishes.
    pub async fn relay(&self, client: ClientIo, container: &Container, username: &str) {
        let ClientIo { input, output } = client;
        let addr = self.target(container);

        let (connection, channel) = match self.open_shell(container).await {
            Ok(opened) => opened,
            Err(e) => {
                warn!(
                    "Relay setup to container {} at {} failed: {}",
                    container.name, addr, e
                );
                let _ = output.send(e.client_message().into_bytes()).await;
                return;
            }
        };

        info!(
            "SSH proxy session established for user {} to container {} ({})",
            username, container.name, addr
        );

        let ChannelPipes {
            writer,
            stdout,
            stderr,
            exit,
            pump,
        } = ChannelPipes::spawn(channel);
        let handle = RelayHandle { connection, pump };

        // Keeps the client channel open until the backend is released.
        let client_hold = output.clone();
        let outcome = splice(input, output, writer, stdout, stderr, async move {
            exit.await.ok().flatten()
        })
        .await;

        handle.release().await;

        match &outcome.end {
            FlowEnd::Failed(_) => warn!("SSH proxy session ended with: {}", outcome),
            _ => info!("SSH proxy session ended with: {}", outcome),
        }
        info!(
            "SSH proxy session ended for user {}, container {}",
            username, container.name
        );
        drop(client_hold);
    }

    /// Dial the container, run a no-op command and report whether it worked.
    pub async fn check_health(&self, container: &Container) -> Result<(), RelayError> {
        let timeout = self.config.health_timeout();
        let check = async {
            let connection = self.dial(container, timeout).await?;
            let result = run_noop(&connection).await;
            let _ = connection
                .disconnect(Disconnect::ByApplication, "health check", "en")
                .await;
            result
        };

        tokio::time::timeout(timeout, check)
            .await
            .map_err(|_| RelayError::Timeout(self.target(container)))?
    }
}

async fn run_noop(connection: &client::Handle<BackendHandler>) -> Result<(), RelayError> {
    let mut channel = connection
        .channel_open_session()
        .await
        .map_err(RelayError::Session)?;
    channel
        .exec(true, HEALTH_COMMAND)
        .await
        .map_err(RelayError::Session)?;

    let mut status = None;
    while let Some(msg) = channel.wait().await {
        match msg {
            ChannelMsg::ExitStatus { exit_status } => status = Some(exit_status),
            ChannelMsg::Failure => break,
            ChannelMsg::Close => break,
            _ => {}
        }
    }

    match status {
        Some(0) => Ok(()),
        other => Err(RelayError::Command(other)),
    }
}

/// Wait for the reply to a channel request sent with `want_reply`.
async fn expect_success(channel: &mut Channel<client::Msg>) -> bool {
    loop {
        match channel.wait().await {
            Some(ChannelMsg::Success) => return true,
            Some(ChannelMsg::Failure) | Some(ChannelMsg::Close) | None => return false,
            Some(_) => {}
        }
    }
}

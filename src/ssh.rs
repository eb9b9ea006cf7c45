//! SSH server implementation using russh.
//!
//! Handles:
//! - Password authentication delegated to the identity service
//! - Session channels running the container selection menu
//! - Rejection of port forwarding and every other channel type

use std::collections::HashMap;
use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use russh::keys::{PrivateKey, PublicKey};
use russh::server::{Auth, Handler, Msg, Session};
use russh::{Channel, ChannelId, MethodKind, MethodSet};
use tokio::net::TcpListener;
use tokio::sync::OnceCell;
use tracing::{debug, info, warn};

use crate::channel_io::{ChannelPipes, ClientIo};
use crate::config::GatewayConfig;
use crate::directory::{Container, DirectoryClient, DirectoryError};
use crate::menu::{self, Menu, SelectionActions};
use crate::relay::RelayEngine;

/// Written when the container listing cannot be fetched.
pub const DIRECTORY_FAILURE: &str = "Failed to get your containers. Please contact support.\r\n";

/// Shared state for the SSH server.
pub struct ServerState {
    pub config: Arc<GatewayConfig>,
    pub directory: Arc<DirectoryClient>,
    pub relay: Arc<RelayEngine>,
}

/// Identity attached to a connection once its password was accepted.
pub struct SessionContext {
    pub peer_addr: SocketAddr,
    pub username: String,
    pub subject_id: i64,
    pub token: String,
    /// Container listing, fetched at most once per connection. `None` records
    /// a failed fetch.
    containers: OnceCell<Option<Arc<Vec<Container>>>>,
}

impl SessionContext {
    pub fn new(peer_addr: SocketAddr, username: &str, subject_id: i64, token: String) -> Self {
        Self {
            peer_addr,
            username: username.to_string(),
            subject_id,
            token,
            containers: OnceCell::new(),
        }
    }

    /// The connection's container snapshot.
    pub async fn containers(&self, directory: &DirectoryClient) -> Option<Arc<Vec<Container>>> {
        self.containers
            .get_or_init(|| async {
                match directory.get_containers(&self.token).await {
                    Ok(list) => {
                        info!(
                            "Fetched {} container(s) for {}",
                            list.len(),
                            self.username
                        );
                        Some(Arc::new(list))
                    }
                    Err(e) => {
                        warn!("Failed to get containers for {}: {}", self.username, e);
                        None
                    }
                }
            })
            .await
            .clone()
    }
}

/// Why a channel open request is refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectReason {
    /// Port forwarding: the gateway never relays arbitrary TCP.
    Prohibited,
    UnsupportedType,
}

impl fmt::Display for RejectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RejectReason::Prohibited => f.write_str("port forwarding not implemented"),
            RejectReason::UnsupportedType => f.write_str("channel type not supported"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelDecision {
    Accept,
    Reject(RejectReason),
}

/// Decide a channel open request from its type alone.
pub fn classify_channel(kind: &str) -> ChannelDecision {
    match kind {
        "session" => ChannelDecision::Accept,
        "direct-tcpip" => ChannelDecision::Reject(RejectReason::Prohibited),
        _ => ChannelDecision::Reject(RejectReason::UnsupportedType),
    }
}

/// Per-connection handler state.
pub struct ConnectionHandler {
    /// Shared server state.
    server: Arc<ServerState>,

    /// Client's socket address.
    peer_addr: SocketAddr,

    /// Set by a successful password login.
    session: Option<Arc<SessionContext>>,

    /// Accepted session channels waiting for their shell request.
    pending: HashMap<ChannelId, Channel<Msg>>,
}

impl ConnectionHandler {
    fn new(server: Arc<ServerState>, peer_addr: SocketAddr) -> Self {
        Self {
            server,
            peer_addr,
            session: None,
            pending: HashMap::new(),
        }
    }

    fn open_decision(&self, kind: &str) -> bool {
        match classify_channel(kind) {
            ChannelDecision::Accept => true,
            ChannelDecision::Reject(reason) => {
                info!(
                    "Rejecting {} channel from {}: {}",
                    kind, self.peer_addr, reason
                );
                false
            }
        }
    }
}

fn password_only() -> MethodSet {
    MethodSet::from(&[MethodKind::Password][..])
}

impl Handler for ConnectionHandler {
    type Error = anyhow::Error;

    async fn auth_password(&mut self, user: &str, password: &str) -> Result<Auth, Self::Error> {
        info!("SSH password auth attempt for user: {}", user);

        match self.server.directory.authenticate(user, password).await {
            Ok(creds) => {
                info!(
                    "Authentication successful for user: {} (ID: {})",
                    user, creds.subject_id
                );
                self.session = Some(Arc::new(SessionContext::new(
                    self.peer_addr,
                    user,
                    creds.subject_id,
                    creds.token,
                )));
                Ok(Auth::Accept)
            }
            Err(e) => {
                warn!("Authentication failed for {}: {}", user, e);
                Ok(Auth::Reject {
                    proceed_with_methods: Some(password_only()),
                    partial_success: false,
                })
            }
        }
    }

    async fn auth_publickey_offered(
        &mut self,
        user: &str,
        _public_key: &PublicKey,
    ) -> Result<Auth, Self::Error> {
        debug!("public key auth not implemented yet (user '{}')", user);
        Ok(Auth::Reject {
            proceed_with_methods: Some(password_only()),
            partial_success: false,
        })
    }

    async fn auth_publickey(
        &mut self,
        _user: &str,
        _public_key: &PublicKey,
    ) -> Result<Auth, Self::Error> {
        Ok(Auth::Reject {
            proceed_with_methods: Some(password_only()),
            partial_success: false,
        })
    }

    async fn channel_open_session(
        &mut self,
        channel: Channel<Msg>,
        _session: &mut Session,
    ) -> Result<bool, Self::Error> {
        if !self.open_decision("session") {
            return Ok(false);
        }
        debug!("Session channel opened: {:?}", channel.id());
        self.pending.insert(channel.id(), channel);
        Ok(true)
    }

    async fn channel_open_direct_tcpip(
        &mut self,
        _channel: Channel<Msg>,
        host_to_connect: &str,
        port_to_connect: u32,
        _originator_address: &str,
        _originator_port: u32,
        _session: &mut Session,
    ) -> Result<bool, Self::Error> {
        debug!(
            "Direct-tcpip request to {}:{}",
            host_to_connect, port_to_connect
        );
        Ok(self.open_decision("direct-tcpip"))
    }

    async fn channel_open_x11(
        &mut self,
        _channel: Channel<Msg>,
        _originator_address: &str,
        _originator_port: u32,
        _session: &mut Session,
    ) -> Result<bool, Self::Error> {
        Ok(self.open_decision("x11"))
    }

    async fn tcpip_forward(
        &mut self,
        address: &str,
        port: &mut u32,
        _session: &mut Session,
    ) -> Result<bool, Self::Error> {
        debug!("Ignoring tcpip-forward request for {}:{}", address, port);
        Ok(false)
    }

    async fn pty_request(
        &mut self,
        channel_id: ChannelId,
        term: &str,
        col_width: u32,
        row_height: u32,
        _pix_width: u32,
        _pix_height: u32,
        _modes: &[(russh::Pty, u32)],
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        debug!(
            "PTY request: channel={:?}, term={}, cols={}, rows={}",
            channel_id, term, col_width, row_height
        );
        session.channel_success(channel_id)?;
        Ok(())
    }

    async fn shell_request(
        &mut self,
        channel_id: ChannelId,
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        let Some(channel) = self.pending.remove(&channel_id) else {
            warn!("Shell request on unknown or busy channel {:?}", channel_id);
            session.channel_failure(channel_id)?;
            return Ok(());
        };
        let Some(context) = self.session.clone() else {
            session.channel_failure(channel_id)?;
            return Ok(());
        };

        info!("Shell request on channel {:?} from {}", channel_id, context.username);
        session.channel_success(channel_id)?;

        let server = self.server.clone();
        let client = ChannelPipes::spawn(channel).into_client();
        tokio::spawn(async move {
            run_channel(server, context, client).await;
        });
        Ok(())
    }

    async fn exec_request(
        &mut self,
        channel_id: ChannelId,
        data: &[u8],
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        info!(
            "Refusing exec request on channel {:?}: {}",
            channel_id,
            String::from_utf8_lossy(data)
        );
        session.channel_failure(channel_id)?;
        Ok(())
    }

    async fn channel_close(
        &mut self,
        channel_id: ChannelId,
        _session: &mut Session,
    ) -> Result<(), Self::Error> {
        debug!("Channel closed: {:?}", channel_id);
        self.pending.remove(&channel_id);
        Ok(())
    }
}

/// What a selection flow may do on behalf of one connection.
pub struct ChannelServices {
    server: Arc<ServerState>,
    context: Arc<SessionContext>,
}

impl SelectionActions for ChannelServices {
    async fn relay(&self, client: ClientIo, container: Container) {
        self.server
            .relay
            .relay(client, &container, &self.context.username)
            .await;
    }

    async fn logs(&self, container: &Container) -> Result<Vec<String>, DirectoryError> {
        self.server
            .directory
            .get_container_logs(&self.context.token, container.id, menu::LOG_LINES)
            .await
    }
}

/// The interactive flow of one session channel. Dropping `client` at the end
/// closes the channel.
async fn run_channel(server: Arc<ServerState>, context: Arc<SessionContext>, client: ClientIo) {
    let Some(containers) = context.containers(&server.directory).await else {
        let _ = client.write(DIRECTORY_FAILURE).await;
        return;
    };

    let hint = server.config.create_container_hint();
    let services = ChannelServices {
        server: server.clone(),
        context: context.clone(),
    };
    let end = menu::run_selection(Menu::new(containers), client, &services, &hint).await;
    info!(
        "Selection flow for {} (ID: {}, {}) ended: {:?}",
        context.username, context.subject_id, context.peer_addr, end
    );
}

/// Run the SSH server.
pub async fn run_server(config: Arc<GatewayConfig>, host_key: PrivateKey) -> Result<()> {
    let russh_config = Arc::new(russh::server::Config {
        auth_rejection_time: Duration::from_secs(1),
        auth_rejection_time_initial: Some(Duration::from_secs(0)),
        methods: password_only(),
        keys: vec![host_key],
        ..Default::default()
    });

    let directory = Arc::new(
        DirectoryClient::new(&config.api_base_url)
            .context("Failed to create identity service client")?,
    );
    let relay = Arc::new(RelayEngine::new(Arc::new(config.backend.clone())));
    let server_state = Arc::new(ServerState {
        config: config.clone(),
        directory,
        relay,
    });

    let addr = SocketAddr::from(([0, 0, 0, 0], config.ssh_port));
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to listen on port {}", config.ssh_port))?;
    info!("SSH Gateway listening on {}", listener.local_addr()?);

    serve(listener, russh_config, server_state).await
}

/// Accept loop. Accept errors are logged and never end the loop.
async fn serve(
    listener: TcpListener,
    russh_config: Arc<russh::server::Config>,
    server_state: Arc<ServerState>,
) -> Result<()> {
    loop {
        let (stream, peer_addr) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(e) => {
                warn!("Failed to accept connection: {}", e);
                continue;
            }
        };
        let server_state_clone = server_state.clone();
        let russh_config_clone = russh_config.clone();

        tokio::spawn(async move {
            debug!("New TCP connection from {}", peer_addr);
            let handler = ConnectionHandler::new(server_state_clone, peer_addr);
            match russh::server::run_stream(russh_config_clone, stream, handler).await {
                Ok(session) => {
                    if let Err(e) = session.await {
                        warn!("SSH session error from {}: {}", peer_addr, e);
                    }
                }
                Err(e) => {
                    warn!("SSH handshake with {} failed: {}", peer_addr, e);
                }
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use axum::http::{HeaderMap, StatusCode};
    use axum::routing::get;
    use axum::{Json, Router};
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn only_session_channels_are_accepted() {
        assert_eq!(classify_channel("session"), ChannelDecision::Accept);
        assert_eq!(
            classify_channel("direct-tcpip"),
            ChannelDecision::Reject(RejectReason::Prohibited)
        );
        for kind in ["x11", "forwarded-tcpip", "direct-streamlocal@openssh.com", ""] {
            assert_eq!(
                classify_channel(kind),
                ChannelDecision::Reject(RejectReason::UnsupportedType)
            );
        }
    }

    #[test]
    fn reject_reasons_are_fixed_strings() {
        assert_eq!(
            RejectReason::Prohibited.to_string(),
            "port forwarding not implemented"
        );
        assert_eq!(
            RejectReason::UnsupportedType.to_string(),
            "channel type not supported"
        );
    }

    async fn counting_directory(status: StatusCode) -> (DirectoryClient, Arc<AtomicUsize>) {
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = hits.clone();
        let app = Router::new().route(
            "/api/containers",
            get(move |_headers: HeaderMap| {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    (
                        status,
                        Json(json!([{"id": 1, "containerId": "abc123def456xyz", "name": "web",
                                     "status": "RUNNING", "sshPort": 8001, "running": true}])),
                    )
                }
            }),
        );
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        let client = DirectoryClient::new(&format!("http://{}/api", addr)).unwrap();
        (client, hits)
    }

    fn context() -> SessionContext {
        SessionContext::new("127.0.0.1:40000".parse().unwrap(), "alice", 5, "T".to_string())
    }

    #[test]
    fn session_context_carries_the_login_identity() {
        let context = context();
        assert_eq!(context.username, "alice");
        assert_eq!(context.subject_id, 5);
        assert_eq!(context.token, "T");
        assert!(context.containers.get().is_none());
    }

    #[tokio::test]
    async fn container_listing_is_fetched_once_per_connection() {
        let (directory, hits) = counting_directory(StatusCode::OK).await;
        let context = context();

        let first = context.containers(&directory).await.unwrap();
        let second = context.containers(&directory).await.unwrap();
        assert_eq!(first.len(), 1);
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn failed_listing_is_not_retried() {
        let (directory, hits) = counting_directory(StatusCode::INTERNAL_SERVER_ERROR).await;
        let context = context();

        assert!(context.containers(&directory).await.is_none());
        assert!(context.containers(&directory).await.is_none());
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn directory_failure_message_reaches_the_client() {
        let (directory, _) = counting_directory(StatusCode::BAD_GATEWAY).await;
        let server = Arc::new(ServerState {
            config: Arc::new(GatewayConfig::default()),
            directory: Arc::new(directory),
            relay: Arc::new(RelayEngine::new(Arc::new(Default::default()))),
        });

        let (_keys, input) = tokio::io::duplex(64);
        let (output, mut rx) = tokio::sync::mpsc::channel(8);
        run_channel(server, Arc::new(context()), ClientIo { input, output }).await;

        assert_eq!(rx.recv().await.unwrap(), DIRECTORY_FAILURE.as_bytes().to_vec());
        assert!(rx.recv().await.is_none());
    }
}

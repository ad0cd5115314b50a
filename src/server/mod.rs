//! Peer transport
//!
//! A TCP listener speaking newline-delimited JSON ([`protocol`]). Every
//! connection is one peer session on the realtime sync manager: the peer
//! greets with `hello`, receives a `welcome` with its offline batch summary
//! and missed changes, then exchanges events, acks and change notifications
//! until the stream ends.

pub mod protocol;

use crate::config::ServerConfig;
use crate::error::{Error, Result};
use crate::service::MemoryService;
use crate::sync::RealtimeSyncManager;
use futures::{Sink, SinkExt, StreamExt};
use protocol::{ClientFrame, ServerFrame};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{watch, Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio_util::codec::{Framed, LinesCodec, LinesCodecError};

/// Server lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerState {
    Stopped,
    Running,
    ShuttingDown,
}

/// Sync server
pub struct SyncServer {
    config: ServerConfig,
    service: Arc<MemoryService>,
    state: Arc<RwLock<ServerState>>,
    local_addr: RwLock<Option<SocketAddr>>,
    accept_task: Mutex<Option<JoinHandle<()>>>,
    shutdown: watch::Sender<bool>,
}

impl SyncServer {
    pub fn new(config: ServerConfig, service: Arc<MemoryService>) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            config,
            service,
            state: Arc::new(RwLock::new(ServerState::Stopped)),
            local_addr: RwLock::new(None),
            accept_task: Mutex::new(None),
            shutdown,
        }
    }

    pub async fn state(&self) -> ServerState {
        *self.state.read().await
    }

    /// Bound address once started
    pub async fn local_addr(&self) -> Option<SocketAddr> {
        *self.local_addr.read().await
    }

    pub fn service(&self) -> &Arc<MemoryService> {
        &self.service
    }

    /// Bind and start accepting peers
    pub async fn start(&self) -> Result<()> {
        let mut state = self.state.write().await;
        if *state != ServerState::Stopped {
            return Err(Error::Internal("Sync server already running".to_string()));
        }

        let addr = format!("{}:{}", self.config.host, self.config.port);
        let listener = TcpListener::bind(&addr).await?;
        let bound = listener.local_addr()?;
        *self.local_addr.write().await = Some(bound);
        self.shutdown.send_replace(false);

        let realtime = self.service.realtime().clone();
        let max_frame_bytes = self.config.max_frame_bytes;
        let shutdown = self.shutdown.subscribe();
        let task = tokio::spawn(accept_loop(listener, realtime, max_frame_bytes, shutdown));
        *self.accept_task.lock().await = Some(task);
        *state = ServerState::Running;

        tracing::info!(addr = %bound, "Sync server listening");
        Ok(())
    }

    /// Stop accepting and close every peer connection
    pub async fn stop(&self) -> Result<()> {
        let mut state = self.state.write().await;
        if *state != ServerState::Running {
            return Ok(());
        }
        *state = ServerState::ShuttingDown;

        self.shutdown.send_replace(true);
        if let Some(task) = self.accept_task.lock().await.take() {
            if let Err(e) = task.await {
                tracing::warn!("Accept loop ended abnormally: {}", e);
            }
        }
        *self.local_addr.write().await = None;
        *state = ServerState::Stopped;

        tracing::info!("Sync server stopped");
        Ok(())
    }
}

/// Builder for [`SyncServer`]
pub struct SyncServerBuilder {
    config: ServerConfig,
}

impl SyncServerBuilder {
    pub fn new() -> Self {
        Self {
            config: ServerConfig::default(),
        }
    }

    pub fn config(mut self, config: ServerConfig) -> Self {
        self.config = config;
        self
    }

    pub fn host(mut self, host: impl Into<String>) -> Self {
        self.config.host = host.into();
        self
    }

    pub fn port(mut self, port: u16) -> Self {
        self.config.port = port;
        self
    }

    pub fn build(self, service: Arc<MemoryService>) -> SyncServer {
        SyncServer::new(self.config, service)
    }
}

impl Default for SyncServerBuilder {
    fn default() -> Self {
        Self::new()
    }
}

async fn accept_loop(
    listener: TcpListener,
    realtime: Arc<RealtimeSyncManager>,
    max_frame_bytes: usize,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok((stream, remote)) => {
                    tracing::debug!(remote = %remote, "Peer connection accepted");
                    let realtime = realtime.clone();
                    let shutdown = shutdown.clone();
                    tokio::spawn(async move {
                        if let Err(e) = serve_peer(stream, realtime, max_frame_bytes, shutdown).await {
                            tracing::warn!(remote = %remote, "Peer connection failed: {}", e);
                        }
                    });
                }
                Err(e) => tracing::warn!("Failed to accept connection: {}", e),
            },
            _ = shutdown.changed() => break,
        }
    }
}

async fn serve_peer(
    stream: TcpStream,
    realtime: Arc<RealtimeSyncManager>,
    max_frame_bytes: usize,
    mut shutdown: watch::Receiver<bool>,
) -> Result<()> {
    let mut framed = Framed::new(stream, LinesCodec::new_with_max_length(max_frame_bytes));

    let (peer_id, last_acked, offline_events) = match framed.next().await {
        Some(Ok(line)) => match ClientFrame::decode(&line) {
            Ok(ClientFrame::Hello {
                peer_id,
                last_acked,
                offline_events,
            }) => (peer_id, last_acked, offline_events),
            Ok(_) => {
                send(&mut framed, &ServerFrame::error("expected hello")).await?;
                return Ok(());
            }
            Err(e) => {
                send(&mut framed, &ServerFrame::error(format!("malformed frame: {}", e))).await?;
                return Ok(());
            }
        },
        Some(Err(e)) => return Err(codec_error(e)),
        None => return Ok(()),
    };

    let mut session = match realtime.connect(&peer_id, last_acked, offline_events).await {
        Ok(session) => session,
        Err(e) => {
            send(&mut framed, &ServerFrame::error(e.to_string())).await?;
            return Ok(());
        }
    };
    let welcome = ServerFrame::Welcome {
        peer_id: peer_id.clone(),
        summary: std::mem::take(&mut session.summary),
        backlog: std::mem::take(&mut session.backlog),
        resync_required: session.resync_required,
    };

    let (mut sink, mut inbound) = framed.split::<String>();
    let result = async {
        send(&mut sink, &welcome).await?;
        loop {
            tokio::select! {
                message = session.receiver.recv() => match message {
                    Some(message) => send(&mut sink, &ServerFrame::from(message)).await?,
                    // Superseded by a newer connection from the same peer
                    None => break,
                },
                line = inbound.next() => match line {
                    Some(Ok(line)) => {
                        if let Some(reply) = handle_frame(&realtime, &peer_id, &line).await {
                            send(&mut sink, &reply).await?;
                        }
                    }
                    Some(Err(e)) => return Err(codec_error(e)),
                    None => break,
                },
                _ = shutdown.changed() => break,
            }
        }
        Ok::<(), Error>(())
    }
    .await;

    realtime.disconnect(session).await;
    result
}

/// Apply one frame from a greeted peer. Returns a frame to send back only
/// for errors; outcomes travel through the session channel.
async fn handle_frame(
    realtime: &RealtimeSyncManager,
    peer_id: &str,
    line: &str,
) -> Option<ServerFrame> {
    match ClientFrame::decode(line) {
        Ok(ClientFrame::Event { event }) => match realtime.handle_event(peer_id, event).await {
            Ok(_) => None,
            Err(e) => Some(ServerFrame::error(e.to_string())),
        },
        Ok(ClientFrame::Ack { sequence }) => {
            realtime.ack(peer_id, sequence).await;
            None
        }
        Ok(ClientFrame::Hello { .. }) => Some(ServerFrame::error("already greeted")),
        Err(e) => Some(ServerFrame::error(format!("malformed frame: {}", e))),
    }
}

async fn send<S>(sink: &mut S, frame: &ServerFrame) -> Result<()>
where
    S: Sink<String, Error = LinesCodecError> + Unpin,
{
    sink.send(frame.encode()?).await.map_err(codec_error)
}

fn codec_error(e: LinesCodecError) -> Error {
    match e {
        LinesCodecError::Io(e) => Error::Io(e),
        LinesCodecError::MaxLineLengthExceeded => {
            Error::Validation("frame exceeds maximum length".to_string())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MemSyncConfig;
    use crate::memory::ChunkBuilder;
    use crate::sync::{EventOutcome, Operation, SyncEvent};
    use std::time::Duration;

    type Client = Framed<TcpStream, LinesCodec>;

    async fn server() -> SyncServer {
        let mut config = MemSyncConfig::default();
        config.repository.embedding_dim = 32;
        config.conflicts.persist = false;
        let service = Arc::new(MemoryService::from_config(&config).await.unwrap());
        let server = SyncServerBuilder::new().host("127.0.0.1").port(0).build(service);
        server.start().await.unwrap();
        server
    }

    async fn client(server: &SyncServer, hello: ClientFrame) -> (Client, ServerFrame) {
        let addr = server.local_addr().await.unwrap();
        let stream = TcpStream::connect(addr).await.unwrap();
        let mut framed = Framed::new(stream, LinesCodec::new());
        framed.send(hello.encode().unwrap()).await.unwrap();
        let welcome = recv(&mut framed).await;
        (framed, welcome)
    }

    async fn recv(client: &mut Client) -> ServerFrame {
        let line = tokio::time::timeout(Duration::from_secs(5), client.next())
            .await
            .expect("frame within timeout")
            .unwrap()
            .unwrap();
        serde_json::from_str(&line).unwrap()
    }

    fn hello(peer: &str) -> ClientFrame {
        ClientFrame::Hello {
            peer_id: peer.into(),
            last_acked: 0,
            offline_events: Vec::new(),
        }
    }

    fn create(peer: &str, seq: u64, id: &str) -> ClientFrame {
        let chunk = ChunkBuilder::new("repo", "use sqlx offline mode in ci")
            .id(id)
            .build()
            .unwrap();
        ClientFrame::Event {
            event: SyncEvent::new(peer, seq, Operation::Create, chunk, 0),
        }
    }

    #[tokio::test]
    async fn test_event_is_acked_and_fanned_out() {
        let server = server().await;
        let (mut a, welcome) = client(&server, hello("a")).await;
        assert!(matches!(welcome, ServerFrame::Welcome { resync_required: false, .. }));
        let (mut b, _) = client(&server, hello("b")).await;

        a.send(create("a", 1, "c1").encode().unwrap()).await.unwrap();

        match recv(&mut a).await {
            ServerFrame::Ack {
                sequence,
                outcome: EventOutcome::Applied { chunk },
            } => {
                assert_eq!(sequence, 1);
                assert_eq!(chunk.version, 1);
            }
            other => panic!("unexpected frame {:?}", other),
        }
        match recv(&mut b).await {
            ServerFrame::ChunkChanged { sequence, chunk } => {
                assert_eq!(sequence, 1);
                assert_eq!(chunk.id, "c1");
            }
            other => panic!("unexpected frame {:?}", other),
        }

        server.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_reconnect_delivers_missed_changes() {
        let server = server().await;
        let (mut a, _) = client(&server, hello("a")).await;
        let (b, _) = client(&server, hello("b")).await;
        drop(b);
        // Give the server a moment to observe the closed stream
        tokio::time::sleep(Duration::from_millis(50)).await;

        a.send(create("a", 1, "c1").encode().unwrap()).await.unwrap();
        recv(&mut a).await;

        let (_b, welcome) = client(&server, hello("b")).await;
        match welcome {
            ServerFrame::Welcome { backlog, .. } => assert_eq!(backlog.len(), 1),
            other => panic!("unexpected frame {:?}", other),
        }
        server.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_first_frame_must_be_hello() {
        let server = server().await;
        let (_client, reply) = client(&server, ClientFrame::Ack { sequence: 1 }).await;
        assert!(matches!(reply, ServerFrame::Error { .. }));
        server.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_malformed_frame_keeps_connection_open() {
        let server = server().await;
        let (mut a, _) = client(&server, hello("a")).await;

        a.send("{not json".to_string()).await.unwrap();
        assert!(matches!(recv(&mut a).await, ServerFrame::Error { .. }));

        a.send(create("a", 1, "c1").encode().unwrap()).await.unwrap();
        assert!(matches!(recv(&mut a).await, ServerFrame::Ack { .. }));
        server.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_start_twice_fails() {
        let server = server().await;
        assert!(server.start().await.is_err());
        server.stop().await.unwrap();
        assert_eq!(server.state().await, ServerState::Stopped);
    }
}

//! Server network layer: TCP accept loop and per-connection frame routing

use crate::auth::IdentityProvider;
use crate::config::ServerConfig;
use crate::error::{DuelError, Result, ValidationError};
use crate::ledger::ScoreLedger;
use crate::lobby::Lobby;
use crate::sequencer::{QuestionSequencer, QuestionSource};
use crate::session::Outbox;
use log::{debug, error, info, warn};
use shared::{read_frame, write_frame, ClientMessage, FrameError, Identity, ServerMessage};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::tcp::OwnedReadHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;

/// A connection must authenticate within this window
const AUTH_TIMEOUT: Duration = Duration::from_secs(10);

/// Holds one slot of the connection limit for as long as it lives
struct ConnectionSlot(Arc<AtomicUsize>);

impl Drop for ConnectionSlot {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Accepts participant connections and hands them to the lobby
pub struct Server {
    listener: TcpListener,
    lobby: Lobby,
    identities: Arc<dyn IdentityProvider>,
    config: ServerConfig,
    active: Arc<AtomicUsize>,
}

impl Server {
    pub async fn bind(
        config: ServerConfig,
        questions: Arc<dyn QuestionSource>,
        ledger: Arc<dyn ScoreLedger>,
        identities: Arc<dyn IdentityProvider>,
    ) -> Result<Self> {
        let listener = TcpListener::bind(&config.bind_addr).await?;
        let sequencer = QuestionSequencer::new(questions, config.matches.thinking_time);
        let lobby = Lobby::new(sequencer, ledger, config.matches.clone());
        Ok(Server {
            listener,
            lobby,
            identities,
            config,
            active: Arc::new(AtomicUsize::new(0)),
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    pub fn lobby(&self) -> &Lobby {
        &self.lobby
    }

    /// Spawns task that evicts queue entries whose heartbeats stopped
    fn spawn_queue_sweeper(&self) {
        let lobby = self.lobby.clone();
        let policy = self.config.queue_heartbeat;

        tokio::spawn(async move {
            let mut interval = tokio::time::interval(policy.interval);
            loop {
                interval.tick().await;
                let evicted = lobby.sweep_queue(&policy);
                if evicted > 0 {
                    debug!("Queue sweep evicted {} entries", evicted);
                }
            }
        });
    }

    /// Accept loop; runs until the listener fails permanently
    pub async fn run(self) -> Result<()> {
        self.spawn_queue_sweeper();
        info!("Server listening on {}", self.local_addr()?);

        loop {
            let (stream, addr) = match self.listener.accept().await {
                Ok(accepted) => accepted,
                Err(e) => {
                    error!("Error accepting connection: {}", e);
                    tokio::time::sleep(Duration::from_millis(10)).await;
                    continue;
                }
            };

            if self.active.load(Ordering::SeqCst) >= self.config.max_connections {
                warn!("Rejecting {}: connection limit reached", addr);
                tokio::spawn(reject(stream, "Server full"));
                continue;
            }
            self.active.fetch_add(1, Ordering::SeqCst);
            let slot = ConnectionSlot(Arc::clone(&self.active));

            let lobby = self.lobby.clone();
            let identities = Arc::clone(&self.identities);
            tokio::spawn(async move {
                let _slot = slot;
                match handle_connection(stream, addr, lobby, identities).await {
                    Ok(()) => debug!("Connection from {} finished", addr),
                    Err(e) => info!("Connection from {} closed: {}", addr, e),
                }
            });
        }
    }
}

async fn reject(mut stream: TcpStream, reason: &str) {
    let message = ServerMessage::Disconnected {
        reason: reason.to_string(),
    };
    if let Err(e) = write_frame(&mut stream, &message).await {
        debug!("Failed to send rejection: {}", e);
    }
}

/// Runs one connection from handshake to close
async fn handle_connection(
    stream: TcpStream,
    addr: SocketAddr,
    lobby: Lobby,
    identities: Arc<dyn IdentityProvider>,
) -> Result<()> {
    stream.set_nodelay(true)?;
    let (mut reader, mut writer) = stream.into_split();
    let (tx, mut rx) = mpsc::unbounded_channel::<ServerMessage>();

    // Writer task: drains the outbox until every sender is gone or the
    // connection is told to close
    tokio::spawn(async move {
        while let Some(message) = rx.recv().await {
            let closing = matches!(message, ServerMessage::Disconnected { .. });
            if let Err(e) = write_frame(&mut writer, &message).await {
                debug!("Failed to write {} to {}: {}", message.kind(), addr, e);
                break;
            }
            if closing {
                break;
            }
        }
    });

    let identity = match tokio::time::timeout(
        AUTH_TIMEOUT,
        authenticate(&mut reader, &tx, identities.as_ref()),
    )
    .await
    {
        Ok(result) => match result? {
            Some(identity) => identity,
            None => return Ok(()),
        },
        Err(_) => {
            let _ = tx.send(ServerMessage::Disconnected {
                reason: "Authentication timed out".to_string(),
            });
            return Ok(());
        }
    };
    info!("{} authenticated from {}", identity, addr);

    lobby.connect(&identity, tx.clone());
    let result = serve(&mut reader, &identity, &tx, &lobby).await;
    lobby.disconnect(&identity, &tx);
    info!("{} disconnected", identity);
    result
}

/// Handshake: the first frame must be a supported `Authenticate`
async fn authenticate(
    reader: &mut OwnedReadHalf,
    tx: &Outbox,
    identities: &dyn IdentityProvider,
) -> Result<Option<Identity>> {
    let refuse = |reason: String| {
        let _ = tx.send(ServerMessage::Disconnected { reason });
    };

    match read_frame::<_, ClientMessage>(reader).await {
        Ok(Some(ClientMessage::Authenticate {
            token,
            client_version,
        })) => {
            if client_version != shared::PROTOCOL_VERSION {
                refuse(format!(
                    "Unsupported protocol version {} (server speaks {})",
                    client_version,
                    shared::PROTOCOL_VERSION
                ));
                return Ok(None);
            }
            match identities.verify(&token) {
                Ok(identity) => {
                    let _ = tx.send(ServerMessage::Authenticated {
                        identity: identity.clone(),
                    });
                    Ok(Some(identity))
                }
                Err(e) => {
                    refuse(e.to_string());
                    Ok(None)
                }
            }
        }
        Ok(Some(_)) => {
            refuse(ValidationError::NotAuthenticated.to_string());
            Ok(None)
        }
        Ok(None) => Ok(None),
        Err(FrameError::Decode(e)) => {
            refuse(format!("malformed handshake: {}", e));
            Ok(None)
        }
        Err(e) => Err(e.into()),
    }
}

/// Reads frames until the peer leaves, the stream breaks, or a newer
/// connection for the same identity takes over
async fn serve(
    reader: &mut OwnedReadHalf,
    identity: &Identity,
    tx: &Outbox,
    lobby: &Lobby,
) -> Result<()> {
    loop {
        // The writer task drops its end once it has sent `Disconnected`
        let frame = tokio::select! {
            frame = read_frame::<_, ClientMessage>(reader) => frame,
            _ = tx.closed() => {
                debug!("Outbox for {} closed; stopping its reader", identity);
                return Ok(());
            }
        };
        let message = match frame {
            Ok(Some(message)) => message,
            Ok(None) => return Ok(()),
            // The whole body was consumed, so framing is still intact
            Err(FrameError::Decode(e)) => {
                warn!("Malformed message from {}: {}", identity, e);
                let _ = tx.send(ServerMessage::ValidationError {
                    request_id: None,
                    message: format!("malformed message: {}", e),
                });
                continue;
            }
            Err(e) => return Err(e.into()),
        };

        if !lobby.is_current(identity, tx) {
            info!("Dropping a message from a replaced connection of {}", identity);
            return Ok(());
        }
        if !dispatch(message, identity, tx, lobby)? {
            return Ok(());
        }
    }
}

/// Routes one client message. Returns false when the client said goodbye.
fn dispatch(
    message: ClientMessage,
    identity: &Identity,
    tx: &Outbox,
    lobby: &Lobby,
) -> Result<bool> {
    let mut request_id = None;
    let outcome = match message {
        ClientMessage::Authenticate { .. } => Err(ValidationError::AlreadyAuthenticated.into()),
        ClientMessage::Enqueue { topic, skill_rating } => {
            lobby.enqueue(identity, topic, skill_rating)
        }
        ClientMessage::LeaveQueue => {
            lobby.leave(identity);
            Ok(())
        }
        ClientMessage::Heartbeat => {
            lobby.heartbeat(identity);
            Ok(())
        }
        ClientMessage::SubmitAnswer {
            request_id: id,
            step_index,
            selected_option_index,
        } => {
            request_id = Some(id);
            lobby.submit(identity, id, step_index, selected_option_index)
        }
        ClientMessage::SyncRequest => lobby.sync(identity),
        ClientMessage::Disconnect => {
            debug!("{} asked to disconnect", identity);
            return Ok(false);
        }
    };

    let rejection = match outcome {
        Ok(()) => return Ok(true),
        Err(DuelError::Validation(e)) => e.to_string(),
        Err(DuelError::SessionClosed(_)) => ValidationError::NoActiveMatch.to_string(),
        Err(e @ DuelError::InternalInvariantViolation(_)) => {
            error!("Dropping {} after internal error: {}", identity, e);
            return Err(e);
        }
        Err(e) => {
            warn!("Request from {} failed: {}", identity, e);
            e.to_string()
        }
    };
    let _ = tx.send(ServerMessage::ValidationError {
        request_id,
        message: rejection,
    });
    Ok(true)
}

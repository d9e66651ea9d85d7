//! Handshake protocol
//!
//! Three messages establish a named session between two peers:
//!
//! ```text
//! client                         server
//!   | -- Handshake1(client name) --> |
//!   | <-- Handshake2(server name) -- |
//!   | -- Handshake3 ---------------> |
//! ```
//!
//! Any unexpected message or timeout fails the handshake and closes the
//! connection; a new attempt needs a fresh connect or accept.

use std::time::Duration;
use thiserror::Error;

use super::connection::Connection;
use crate::protocol::{GameMessage, GameMessageType};

/// Handshake errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum HandshakeError {
    #[error("Handshake timed out")]
    TimedOut,

    #[error("Connection closed during handshake")]
    Closed,

    #[error("Expected {expected:?} message, received {received:?}")]
    UnexpectedMessage {
        expected: GameMessageType,
        received: GameMessageType,
    },

    #[error("Could not queue {0:?} message")]
    SendFailed(GameMessageType),
}

pub type HandshakeResult<T> = Result<T, HandshakeError>;

/// Which side of the exchange we are playing
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeRole {
    Client,
    Server,
}

/// Progress through the exchange
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeStep {
    AwaitingPeerName,
    NameExchanged,
    AwaitingAck,
    Complete,
    Failed,
}

/// Drives one handshake over a connected [`Connection`]
pub struct Handshake<'a> {
    connection: &'a Connection,
    role: HandshakeRole,
    local_name: String,
    timeout: Duration,
    step: HandshakeStep,
}

impl<'a> Handshake<'a> {
    /// `timeout` bounds every individual receive
    pub fn new(
        connection: &'a Connection,
        role: HandshakeRole,
        local_name: impl Into<String>,
        timeout: Duration,
    ) -> Self {
        Self {
            connection,
            role,
            local_name: local_name.into(),
            timeout,
            step: HandshakeStep::AwaitingPeerName,
        }
    }

    pub fn role(&self) -> HandshakeRole {
        self.role
    }

    pub fn step(&self) -> HandshakeStep {
        self.step
    }

    /// Run the exchange to completion and return the peer's name.
    ///
    /// The peer name is also recorded on the connection.
    pub async fn run(&mut self) -> HandshakeResult<String> {
        let outcome = match self.role {
            HandshakeRole::Client => self.run_client().await,
            HandshakeRole::Server => self.run_server().await,
        };

        match outcome {
            Ok(peer_name) => {
                self.step = HandshakeStep::Complete;
                tracing::info!(
                    "{} : Handshake completed with player {}",
                    self.connection.name(),
                    peer_name
                );
                self.connection.set_peer_name(peer_name.clone());
                Ok(peer_name)
            }
            Err(e) => {
                self.step = HandshakeStep::Failed;
                tracing::warn!("{} : Handshake failed: {}", self.connection.name(), e);
                self.connection.close();
                Err(e)
            }
        }
    }

    async fn run_client(&mut self) -> HandshakeResult<String> {
        self.send(GameMessage::handshake1(&self.local_name))?;

        let reply = self.expect(GameMessageType::Handshake2).await?;
        let server_name = reply.body_text();
        self.step = HandshakeStep::NameExchanged;

        self.send(GameMessage::handshake3())?;
        Ok(server_name)
    }

    async fn run_server(&mut self) -> HandshakeResult<String> {
        let hello = self.expect(GameMessageType::Handshake1).await?;
        let client_name = hello.body_text();
        self.step = HandshakeStep::NameExchanged;

        self.send(GameMessage::handshake2(&self.local_name))?;
        self.step = HandshakeStep::AwaitingAck;

        self.expect(GameMessageType::Handshake3).await?;
        Ok(client_name)
    }

    fn send(&self, message: GameMessage) -> HandshakeResult<()> {
        if self.connection.send_message(&message) {
            Ok(())
        } else if self.connection.is_connected() {
            Err(HandshakeError::SendFailed(message.message_type))
        } else {
            Err(HandshakeError::Closed)
        }
    }

    async fn expect(&self, expected: GameMessageType) -> HandshakeResult<GameMessage> {
        let message = match self.connection.receive_message(self.timeout).await {
            Some(message) => message,
            None if self.connection.is_connected() => return Err(HandshakeError::TimedOut),
            None => return Err(HandshakeError::Closed),
        };

        if message.message_type != expected {
            return Err(HandshakeError::UnexpectedMessage {
                expected,
                received: message.message_type,
            });
        }
        Ok(message)
    }
}

/// Run the client side: announce `client_name`, return the server's name
pub async fn client_handshake(
    connection: &Connection,
    client_name: &str,
    timeout: Duration,
) -> HandshakeResult<String> {
    Handshake::new(connection, HandshakeRole::Client, client_name, timeout)
        .run()
        .await
}

/// Run the server side: announce `server_name`, return the client's name
pub async fn server_handshake(
    connection: &Connection,
    server_name: &str,
    timeout: Duration,
) -> HandshakeResult<String> {
    Handshake::new(connection, HandshakeRole::Server, server_name, timeout)
        .run()
        .await
}

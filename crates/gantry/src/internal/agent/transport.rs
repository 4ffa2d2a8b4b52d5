use std::future::Future;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use chrono::Utc;
use futures::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc::UnboundedSender;

use crate::internal::common::error::GantryError;
use crate::internal::common::sync::lock;
use crate::internal::credential::{Credential, CredentialCache, CredentialError};
use crate::internal::messages::agent::{AgentMessage, AgentPayload, AgentReply};
use crate::internal::server::config::DEFAULT_CREDENTIAL_LIFETIME;
use crate::internal::transfer::codec::{deserialize, serialize};
use crate::internal::transfer::transport::framed_agent_connection;

/// Delivers one agent message to one node and waits for its reply.
pub trait AgentTransport: Send + Sync {
    fn send(
        &self,
        address: &str,
        message: &AgentMessage,
    ) -> impl Future<Output = crate::Result<AgentReply>> + Send;
}

/// One connection per message, length-delimited bincode frames.
#[derive(Debug, Default, Clone)]
pub struct TcpAgentTransport;

impl AgentTransport for TcpAgentTransport {
    async fn send(&self, address: &str, message: &AgentMessage) -> crate::Result<AgentReply> {
        let data = serialize(message)?;
        let stream = TcpStream::connect(address).await?;
        stream.set_nodelay(true)?;
        let mut framed = framed_agent_connection(stream);
        framed.send(Bytes::from(data)).await?;
        let frame = framed.next().await.ok_or_else(|| {
            GantryError::GenericError(format!("{address} closed the connection without a reply"))
        })??;
        deserialize(&frame)
    }
}

/// Node-side handler of agent messages.
///
/// Credential revocations are applied to the local cache; every other
/// message is forwarded to the local step daemon. Expired entries are
/// purged from the cache whenever it is updated.
pub struct NodeAgent {
    credentials: Mutex<CredentialCache>,
    forward: UnboundedSender<AgentMessage>,
}

impl NodeAgent {
    pub fn new(forward: UnboundedSender<AgentMessage>) -> Self {
        Self::with_credential_lifetime(forward, DEFAULT_CREDENTIAL_LIFETIME)
    }

    pub fn with_credential_lifetime(
        forward: UnboundedSender<AgentMessage>,
        lifetime: Duration,
    ) -> Self {
        NodeAgent {
            credentials: Mutex::new(CredentialCache::new(lifetime)),
            forward,
        }
    }

    pub fn credentials(&self) -> &Mutex<CredentialCache> {
        &self.credentials
    }

    /// Records the credential of a step about to start tasks on this node.
    pub fn accept_credential(&self, credential: &Credential) -> Result<(), CredentialError> {
        let now = Utc::now();
        let mut credentials = lock(&self.credentials);
        credentials.purge_expired(now);
        if credential.body().expiration < now {
            return Err(CredentialError::Expired(credential.step_key()));
        }
        credentials.insert(credential)
    }

    pub fn handle(&self, message: AgentMessage) -> AgentReply {
        match message.payload {
            AgentPayload::RevokeCredential => {
                let key = message.step_key();
                let now = Utc::now();
                let mut credentials = lock(&self.credentials);
                credentials.purge_expired(now);
                if !credentials.revoke(key, now) {
                    log::debug!("Credential of step {key} was already revoked");
                }
                AgentReply::Ok
            }
            _ => {
                let kind = message.kind();
                match self.forward.send(message) {
                    Ok(()) => AgentReply::Ok,
                    Err(_) => AgentReply::Error(format!("step daemon is gone, {kind} dropped")),
                }
            }
        }
    }
}

/// Accepts agent connections and answers every message on them.
pub async fn serve_node_agent(listener: TcpListener, agent: Arc<NodeAgent>) -> crate::Result<()> {
    loop {
        let (socket, address) = listener.accept().await?;
        socket.set_nodelay(true)?;
        let agent = agent.clone();
        tokio::spawn(async move {
            log::debug!("New agent connection: {address}");
            if let Err(e) = agent_connection(socket, address, &agent).await {
                log::warn!("Agent connection {address} ended with: {e}");
            }
        });
    }
}

async fn agent_connection(
    socket: TcpStream,
    address: SocketAddr,
    agent: &NodeAgent,
) -> crate::Result<()> {
    let mut framed = framed_agent_connection(socket);
    while let Some(frame) = framed.next().await {
        let message: AgentMessage = deserialize(&frame?)?;
        log::debug!(
            "{} for step {} from {address}",
            message.kind(),
            message.step_key()
        );
        let reply = agent.handle(message);
        framed.send(Bytes::from(serialize(&reply)?)).await?;
    }
    Ok(())
}

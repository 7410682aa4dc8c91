//! Per-connection read loop and routing of received messages.

use std::error::Error;
use std::net::SocketAddr;

use chrono::Utc;
use tokio::io::AsyncRead;
use tokio::io::AsyncWrite;
use tracing::debug;
use tracing::error;
use tracing::info;
use tracing::warn;

use crate::announcement::handle_announcement;
use crate::announcement::AnnouncementError;
use crate::codec;
use crate::codec::WireError;
use crate::context::RendezvousContext;
use crate::models::message::ClientStartup;
use crate::models::message::Message;
use crate::models::message::MessageBody;
use crate::models::message::MessageKind;
use crate::models::message::MessageState;
use crate::models::message::StateTransitionError;
use crate::models::message::TrackedMessage;
use crate::models::message::TransactionId;

#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    #[error("unrecognized message type: {0}")]
    UnrecognizedMessageType(MessageKind),

    #[error(transparent)]
    Announcement(#[from] AnnouncementError),

    #[error(transparent)]
    State(#[from] StateTransitionError),
}

impl DispatchError {
    /// Failures on our side, as opposed to bad input from the peer.
    fn is_internal(&self) -> bool {
        matches!(
            self,
            DispatchError::Announcement(AnnouncementError::Directory(_) | AnnouncementError::Join(_))
                | DispatchError::State(_)
        )
    }
}

/// `err` followed by its sources, separated by colons.
fn error_chain(err: &dyn Error) -> String {
    let mut chain = err.to_string();
    let mut source = err.source();
    while let Some(cause) = source {
        chain.push_str(": ");
        chain.push_str(&cause.to_string());
        source = cause.source();
    }
    chain
}

/// Serves one inbound connection.
#[derive(Debug, Clone)]
pub struct ConnectionHandler {
    ctx: RendezvousContext,
    peer_address: SocketAddr,
}

impl ConnectionHandler {
    pub fn new(ctx: RendezvousContext, peer_address: SocketAddr) -> Self {
        Self { ctx, peer_address }
    }

    /// Read, process and acknowledge messages in arrival order until the peer
    /// hangs up.
    ///
    /// Returns `Ok` when the peer closed its side between messages. Decoding
    /// failures, transport failures and idle timeouts end the loop with an
    /// error. Failures while processing a message never do: the message ends
    /// up in [`MessageState::Error`] and is acknowledged like any other.
    pub async fn run<S>(&self, stream: S) -> Result<(), WireError>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let mut peer = codec::frame(stream, self.ctx.cli().max_frame_length);
        let idle_timeout = self.ctx.cli().idle_timeout();

        while let Some(message) = codec::read_message(&mut peer, idle_timeout).await? {
            self.process_message(TrackedMessage::new(message)).await;
            codec::write_acknowledgment(&mut peer).await?;
        }

        debug!("Peer {} closed the connection", self.peer_address);
        Ok(())
    }

    /// Drive one message to a terminal state.
    pub async fn process_message(&self, mut message: TrackedMessage) -> MessageState {
        let transaction_id = message.transaction_id();
        let peer_address = self.peer_address;
        debug!(%transaction_id, %peer_address, "processing {transaction_id}");

        let outcome = match message.begin_processing() {
            Ok(()) => self.route(message.message()).await,
            Err(e) => Err(e.into()),
        };

        let settled = match &outcome {
            Ok(()) => message.finish(),
            Err(e) => {
                self.log_failure(transaction_id, e);
                message.fail()
            }
        };
        if let Err(e) = settled {
            error!(%transaction_id, %peer_address, "{e}");
        }

        debug!(%transaction_id, %peer_address, "processed {transaction_id}: {}", message.state());
        message.state()
    }

    async fn route(&self, message: &Message) -> Result<(), DispatchError> {
        match &message.body {
            MessageBody::ClientStartup(startup) => {
                self.client_startup(message.transaction_id, startup).await
            }
            MessageBody::Confirmation(_) => Err(DispatchError::UnrecognizedMessageType(
                message.body.kind(),
            )),
        }
    }

    async fn client_startup(
        &self,
        transaction_id: TransactionId,
        startup: &ClientStartup,
    ) -> Result<(), DispatchError> {
        let remote_ip = self.peer_address.ip();
        let record = handle_announcement(&self.ctx, startup, remote_ip, Utc::now()).await?;
        info!(
            "Accepted announcement of {} ({}) from {}",
            record.identity().handle(),
            record.eligibility(),
            self.peer_address
        );

        self.ctx.confirmations().enqueue(
            SocketAddr::new(remote_ip, startup.origin_node_port),
            transaction_id,
        );
        Ok(())
    }

    fn log_failure(&self, transaction_id: TransactionId, err: &DispatchError) {
        let peer_address = self.peer_address;
        if err.is_internal() {
            error!(%transaction_id, %peer_address, "Failed to process message: {}", error_chain(err));
        } else {
            warn!(%transaction_id, %peer_address, "Rejected message: {}", error_chain(err));
        }
    }
}

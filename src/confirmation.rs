//! Outbound confirmations to peers whose announcement was accepted.

use std::fmt;
use std::net::SocketAddr;
use std::time::Duration;

use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::task::JoinHandle;
use tracing::debug;
use tracing::warn;

use crate::codec;
use crate::codec::WireError;
use crate::models::message::Message;
use crate::models::message::TransactionId;

/// Bound on connecting to a peer and on waiting for its acknowledgment.
pub const CONFIRMATION_TIMEOUT: Duration = Duration::from_secs(10);

/// Confirmations waiting for delivery. Further ones are dropped until the
/// delivery task catches up.
pub const CONFIRMATION_QUEUE_CAPACITY: usize = 256;

/// Where accepted announcements are confirmed. Implementations must not block:
/// delivery happens asynchronously, if at all.
pub trait ConfirmationSink: Send + Sync + fmt::Debug {
    fn enqueue(&self, destination: SocketAddr, confirmed_transaction_id: TransactionId);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PendingConfirmation {
    pub destination: SocketAddr,
    pub confirmed_transaction_id: TransactionId,
}

/// Bounded queue drained by a single delivery task. Failed deliveries are
/// logged and dropped, and so are confirmations that find the queue full.
#[derive(Debug)]
pub struct ConfirmationOutbox {
    to_delivery_task: mpsc::Sender<PendingConfirmation>,
}

impl ConfirmationOutbox {
    /// Start the delivery task. `local_port` is announced to peers as the
    /// port of this server.
    pub fn spawn(local_port: u16, max_frame_length: usize) -> (Self, JoinHandle<()>) {
        Self::with_capacity(CONFIRMATION_QUEUE_CAPACITY, local_port, max_frame_length)
    }

    pub fn with_capacity(
        capacity: usize,
        local_port: u16,
        max_frame_length: usize,
    ) -> (Self, JoinHandle<()>) {
        let (to_delivery_task, from_outbox) = mpsc::channel(capacity);
        let join_handle = tokio::spawn(delivery_loop(from_outbox, local_port, max_frame_length));
        (Self { to_delivery_task }, join_handle)
    }

    /// Number of confirmations waiting for the delivery task.
    pub fn queued(&self) -> usize {
        self.to_delivery_task.max_capacity() - self.to_delivery_task.capacity()
    }
}

impl ConfirmationSink for ConfirmationOutbox {
    fn enqueue(&self, destination: SocketAddr, confirmed_transaction_id: TransactionId) {
        let pending = PendingConfirmation {
            destination,
            confirmed_transaction_id,
        };
        match self.to_delivery_task.try_send(pending) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => {
                warn!("Confirmation queue is full. Dropping confirmation of {confirmed_transaction_id} for {destination}")
            }
            Err(TrySendError::Closed(_)) => {
                warn!("Confirmation delivery task is gone. Dropping confirmation of {confirmed_transaction_id} for {destination}")
            }
        }
    }
}

async fn delivery_loop(
    mut from_outbox: mpsc::Receiver<PendingConfirmation>,
    local_port: u16,
    max_frame_length: usize,
) {
    while let Some(pending) = from_outbox.recv().await {
        let PendingConfirmation {
            destination,
            confirmed_transaction_id,
        } = pending;
        match deliver(pending, local_port, max_frame_length).await {
            Ok(()) => debug!("Confirmed {confirmed_transaction_id} to {destination}"),
            Err(e) => warn!("Failed to confirm {confirmed_transaction_id} to {destination}: {e}"),
        }
    }
    debug!("Confirmation outbox closed");
}

/// Connect to the peer, send one confirmation and wait for its
/// acknowledgment byte.
pub async fn deliver(
    pending: PendingConfirmation,
    local_port: u16,
    max_frame_length: usize,
) -> Result<(), WireError> {
    let stream = tokio::time::timeout(CONFIRMATION_TIMEOUT, TcpStream::connect(pending.destination))
        .await
        .map_err(|_elapsed| WireError::IdleTimeout(CONFIRMATION_TIMEOUT))??;
    let mut peer = codec::frame(stream, max_frame_length);

    let confirmation = Message::confirmation(
        TransactionId::random(),
        pending.confirmed_transaction_id,
        local_port,
    );
    codec::send_message(&mut peer, confirmation).await?;
    codec::read_acknowledgment(&mut peer, CONFIRMATION_TIMEOUT).await
}

/// Used when confirmations are switched off.
#[derive(Debug, Default, Clone, Copy)]
pub struct DiscardConfirmations;

impl ConfirmationSink for DiscardConfirmations {
    fn enqueue(&self, destination: SocketAddr, confirmed_transaction_id: TransactionId) {
        debug!("Confirmations disabled, not confirming {confirmed_transaction_id} to {destination}");
    }
}

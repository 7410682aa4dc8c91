use std::fmt;

use serde::Deserialize;
use serde::Serialize;

use super::identity::PublicIdentity;

/// Domain separator for announcement signatures.
const CLIENT_UPDATE_SIGNATURE_DOMAIN: &[u8] = b"circle-rendezvous:client-update:v1:";

pub const TRANSACTION_ID_SIZE_IN_BYTES: usize = 16;

/// Opaque token correlating a request with its confirmation.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TransactionId([u8; TRANSACTION_ID_SIZE_IN_BYTES]);

impl TransactionId {
    pub fn random() -> Self {
        Self(rand::random())
    }
}

impl From<[u8; TRANSACTION_ID_SIZE_IN_BYTES]> for TransactionId {
    fn from(bytes: [u8; TRANSACTION_ID_SIZE_IN_BYTES]) -> Self {
        Self(bytes)
    }
}

impl fmt::Display for TransactionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

impl fmt::Debug for TransactionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TransactionId({self})")
    }
}

/// What a peer reports about itself, signed with the key ring it carries.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientUpdate {
    pub name: String,
    pub email: String,
    pub storage_available: u64,
    pub public_key_ring: Vec<u8>,
    pub signature: Vec<u8>,
}

impl ClientUpdate {
    /// The bytes covered by `signature`. Every field is length-prefixed so
    /// that no two distinct updates share an encoding.
    pub fn signing_bytes(&self) -> Vec<u8> {
        fn put_field(buffer: &mut Vec<u8>, field: &[u8]) {
            buffer.extend_from_slice(&(field.len() as u64).to_le_bytes());
            buffer.extend_from_slice(field);
        }

        let mut buffer = CLIENT_UPDATE_SIGNATURE_DOMAIN.to_vec();
        put_field(&mut buffer, self.name.as_bytes());
        put_field(&mut buffer, self.email.as_bytes());
        put_field(&mut buffer, &self.storage_available.to_le_bytes());
        put_field(&mut buffer, &self.public_key_ring);
        buffer
    }

    pub fn verify_signature(&self, identity: &PublicIdentity) -> bool {
        identity.verify(&self.signing_bytes(), &self.signature)
    }
}

/// The announcement a peer sends when it starts up, and periodically after.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientStartup {
    pub update: ClientUpdate,

    /// Port on which the announcing peer accepts connections.
    pub origin_node_port: u16,
}

/// Sent back to an announcing peer once its announcement has been accepted.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Confirmation {
    pub confirmed_transaction_id: TransactionId,
    pub origin_node_port: u16,
}

/// Variant index is the type discriminant on the wire. Append new variants at
/// the end only.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum MessageBody {
    ClientStartup(Box<ClientStartup>),
    Confirmation(Confirmation),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum MessageKind {
    ClientStartup,
    Confirmation,
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let string = match self {
            MessageKind::ClientStartup => "client startup",
            MessageKind::Confirmation => "confirmation",
        };
        write!(f, "{string}")
    }
}

impl MessageBody {
    pub fn kind(&self) -> MessageKind {
        match self {
            MessageBody::ClientStartup(_) => MessageKind::ClientStartup,
            MessageBody::Confirmation(_) => MessageKind::Confirmation,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub transaction_id: TransactionId,
    pub body: MessageBody,
}

impl Message {
    pub fn client_startup(transaction_id: TransactionId, startup: ClientStartup) -> Self {
        Self {
            transaction_id,
            body: MessageBody::ClientStartup(Box::new(startup)),
        }
    }

    pub fn confirmation(
        transaction_id: TransactionId,
        confirmed_transaction_id: TransactionId,
        origin_node_port: u16,
    ) -> Self {
        Self {
            transaction_id,
            body: MessageBody::Confirmation(Confirmation {
                confirmed_transaction_id,
                origin_node_port,
            }),
        }
    }
}

/// Processing state of a received message. Lives only while the message is
/// being handled.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum MessageState {
    NeedsProcessing,
    Processing,
    Finished,
    Error,
}

impl MessageState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, MessageState::Finished | MessageState::Error)
    }

    fn can_transition_to(&self, next: MessageState) -> bool {
        matches!(
            (self, next),
            (MessageState::NeedsProcessing, MessageState::Processing)
                | (MessageState::Processing, MessageState::Finished)
                | (MessageState::Processing, MessageState::Error)
        )
    }
}

impl fmt::Display for MessageState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let string = match self {
            MessageState::NeedsProcessing => "needs processing",
            MessageState::Processing => "processing",
            MessageState::Finished => "finished",
            MessageState::Error => "error",
        };
        write!(f, "{string}")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("message {transaction_id} cannot move from {from} to {to}")]
pub struct StateTransitionError {
    pub transaction_id: TransactionId,
    pub from: MessageState,
    pub to: MessageState,
}

/// A received message together with where it is in its processing.
#[derive(Clone, Debug)]
pub struct TrackedMessage {
    message: Message,
    state: MessageState,
}

impl TrackedMessage {
    pub fn new(message: Message) -> Self {
        Self {
            message,
            state: MessageState::NeedsProcessing,
        }
    }

    pub fn message(&self) -> &Message {
        &self.message
    }

    pub fn transaction_id(&self) -> TransactionId {
        self.message.transaction_id
    }

    pub fn state(&self) -> MessageState {
        self.state
    }

    fn transition(&mut self, next: MessageState) -> Result<(), StateTransitionError> {
        if !self.state.can_transition_to(next) {
            return Err(StateTransitionError {
                transaction_id: self.transaction_id(),
                from: self.state,
                to: next,
            });
        }
        self.state = next;
        Ok(())
    }

    pub fn begin_processing(&mut self) -> Result<(), StateTransitionError> {
        self.transition(MessageState::Processing)
    }

    pub fn finish(&mut self) -> Result<(), StateTransitionError> {
        self.transition(MessageState::Finished)
    }

    pub fn fail(&mut self) -> Result<(), StateTransitionError> {
        self.transition(MessageState::Error)
    }
}

#[cfg(test)]
mod message_tests {
    use super::*;

    fn confirmation() -> Message {
        Message::confirmation(TransactionId::from([1; 16]), TransactionId::from([2; 16]), 4000)
    }

    #[test]
    fn message_walks_the_happy_path() {
        let mut message = TrackedMessage::new(confirmation());
        assert_eq!(MessageState::NeedsProcessing, message.state());
        message.begin_processing().unwrap();
        message.finish().unwrap();
        assert_eq!(MessageState::Finished, message.state());
        assert!(message.state().is_terminal());
    }

    #[test]
    fn terminal_states_are_final() {
        let mut message = TrackedMessage::new(confirmation());
        message.begin_processing().unwrap();
        message.fail().unwrap();

        let err = message.finish().unwrap_err();
        assert_eq!(MessageState::Error, err.from);
        assert_eq!(MessageState::Finished, err.to);
        assert!(message.begin_processing().is_err());
        assert_eq!(MessageState::Error, message.state());
    }

    #[test]
    fn cannot_finish_without_processing() {
        let mut message = TrackedMessage::new(confirmation());
        assert!(message.finish().is_err());
        assert!(message.fail().is_err());
        assert_eq!(MessageState::NeedsProcessing, message.state());
    }

    #[test]
    fn signing_bytes_bind_every_field() {
        let update = ClientUpdate {
            name: "Alice".to_string(),
            email: "alice@example.org".to_string(),
            storage_available: 1000,
            public_key_ring: vec![1, 2, 3],
            signature: vec![],
        };
        let mut more_storage = update.clone();
        more_storage.storage_available = 2000;
        let mut shifted = update.clone();
        shifted.name = "Alicea".to_string();
        shifted.email = "lice@example.org".to_string();

        assert_ne!(update.signing_bytes(), more_storage.signing_bytes());
        assert_ne!(update.signing_bytes(), shifted.signing_bytes());

        let mut resigned = update.clone();
        resigned.signature = vec![9; 64];
        assert_eq!(update.signing_bytes(), resigned.signing_bytes());
    }
}

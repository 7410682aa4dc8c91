use std::fmt;
use std::net::IpAddr;

use chrono::DateTime;
use chrono::Utc;
use serde::Deserialize;
use serde::Serialize;

use super::identity::PublicIdentity;
use super::message::ClientUpdate;

/// Separator between fields of an update log entry.
const UPDATE_LOG_SEPARATOR: &str = "~";

/// Lifecycle category of a peer with respect to backup circles.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Eligibility {
    /// Could become eligible if it stays up with sufficient storage.
    Candidate,

    /// Ready to be placed in a backup circle, but not placed yet.
    Eligible,

    /// Currently a member of a backup circle.
    InCircle,

    /// Taken out of consideration, e.g. for being down too often or for
    /// abusing the system.
    Rejected,
}

impl Eligibility {
    /// Directory scan order.
    pub const ALL: [Eligibility; 4] = [
        Eligibility::Candidate,
        Eligibility::Eligible,
        Eligibility::InCircle,
        Eligibility::Rejected,
    ];

    pub fn dir_name(&self) -> &'static str {
        match self {
            Eligibility::Candidate => "candidate",
            Eligibility::Eligible => "eligible",
            Eligibility::InCircle => "in_circle",
            Eligibility::Rejected => "rejected",
        }
    }

    pub fn from_dir_name(name: &str) -> Option<Self> {
        Self::ALL
            .into_iter()
            .find(|eligibility| eligibility.dir_name() == name)
    }

    /// `Candidate -> Eligible -> InCircle`, and `Rejected` from anywhere.
    /// `Rejected` is a sink.
    pub fn can_transition_to(&self, next: Eligibility) -> bool {
        matches!(
            (self, next),
            (Eligibility::Candidate, Eligibility::Eligible)
                | (Eligibility::Eligible, Eligibility::InCircle)
                | (
                    Eligibility::Candidate | Eligibility::Eligible | Eligibility::InCircle,
                    Eligibility::Rejected
                )
        )
    }
}

impl fmt::Display for Eligibility {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.dir_name())
    }
}

/// The metadata half of a stored peer. The key ring is kept next to it in a
/// file of its own.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerMetadata {
    pub name: String,
    pub email: String,
    pub storage_available: u64,
    pub last_update: DateTime<Utc>,
    pub inet_address: IpAddr,
    pub port: u16,
}

/// A remote node of the backup network, as the rendezvous server knows it.
///
/// Name, email and storage figures are reported by the peer and are not
/// trusted for anything beyond display and bookkeeping.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PeerRecord {
    identity: PublicIdentity,
    display_name: String,
    contact_email: String,
    storage_offered: u64,
    last_seen: DateTime<Utc>,
    network_address: IpAddr,
    network_port: u16,
    eligibility: Eligibility,
    key_ring: Vec<u8>,
}

impl PeerRecord {
    /// A peer seen for the first time starts out as a candidate.
    pub fn new_candidate(
        update: &ClientUpdate,
        identity: PublicIdentity,
        network_address: IpAddr,
        network_port: u16,
        seen_at: DateTime<Utc>,
    ) -> Self {
        Self {
            identity,
            display_name: update.name.clone(),
            contact_email: update.email.clone(),
            storage_offered: update.storage_available,
            last_seen: seen_at,
            network_address,
            network_port,
            eligibility: Eligibility::Candidate,
            key_ring: update.public_key_ring.clone(),
        }
    }

    pub(crate) fn from_stored(
        identity: PublicIdentity,
        metadata: PeerMetadata,
        eligibility: Eligibility,
        key_ring: Vec<u8>,
    ) -> Self {
        Self {
            identity,
            display_name: metadata.name,
            contact_email: metadata.email,
            storage_offered: metadata.storage_available,
            last_seen: metadata.last_update,
            network_address: metadata.inet_address,
            network_port: metadata.port,
            eligibility,
            key_ring,
        }
    }

    /// Apply a verified update. Eligibility is never touched here.
    pub fn apply_update(
        &mut self,
        update: &ClientUpdate,
        identity: PublicIdentity,
        network_address: IpAddr,
        network_port: u16,
        seen_at: DateTime<Utc>,
    ) {
        self.display_name = update.name.clone();
        self.contact_email = update.email.clone();
        self.storage_offered = update.storage_available;
        self.last_seen = seen_at;
        self.network_address = network_address;
        self.network_port = network_port;
        self.identity = identity;
        self.key_ring = update.public_key_ring.clone();
    }

    pub(crate) fn set_eligibility(&mut self, eligibility: Eligibility) {
        self.eligibility = eligibility;
    }

    pub fn identity(&self) -> &PublicIdentity {
        &self.identity
    }

    pub fn display_name(&self) -> &str {
        &self.display_name
    }

    pub fn contact_email(&self) -> &str {
        &self.contact_email
    }

    pub fn storage_offered(&self) -> u64 {
        self.storage_offered
    }

    pub fn last_seen(&self) -> DateTime<Utc> {
        self.last_seen
    }

    pub fn network_address(&self) -> IpAddr {
        self.network_address
    }

    pub fn network_port(&self) -> u16 {
        self.network_port
    }

    pub fn eligibility(&self) -> Eligibility {
        self.eligibility
    }

    pub fn key_ring(&self) -> &[u8] {
        &self.key_ring
    }

    pub fn metadata(&self) -> PeerMetadata {
        PeerMetadata {
            name: self.display_name.clone(),
            email: self.contact_email.clone(),
            storage_available: self.storage_offered,
            last_update: self.last_seen,
            inet_address: self.network_address,
            port: self.network_port,
        }
    }

    /// One line for the update audit log.
    pub fn update_log_entry(&self) -> String {
        [
            "peer changed".to_string(),
            self.identity.handle().to_string(),
            self.display_name.clone(),
            self.contact_email.clone(),
            self.storage_offered.to_string(),
            self.last_seen.to_rfc3339(),
            self.network_address.to_string(),
            self.network_port.to_string(),
        ]
        .join(UPDATE_LOG_SEPARATOR)
    }
}

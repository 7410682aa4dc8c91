//! Verification and application of peer announcements.

use std::net::IpAddr;

use chrono::DateTime;
use chrono::Utc;
use tracing::info;

use crate::context::RendezvousContext;
use crate::directory::DirectoryError;
use crate::models::identity::derive_identity;
use crate::models::identity::IdentityError;
use crate::models::identity::PublicIdentityHandle;
use crate::models::message::ClientStartup;
use crate::models::peer::PeerRecord;

/// Target of the update audit log: one line per accepted announcement.
pub const UPDATE_LOG_TARGET: &str = "circle_rendezvous::updates";

#[derive(Debug, thiserror::Error)]
pub enum AnnouncementError {
    #[error(transparent)]
    Identity(#[from] IdentityError),

    #[error("signature does not match identity {0}")]
    SignatureMismatch(PublicIdentityHandle),

    #[error(transparent)]
    Directory(#[from] DirectoryError),

    #[error("directory task failed")]
    Join(#[from] tokio::task::JoinError),
}

/// Verify `startup` and record it in the peer directory.
///
/// The signature is checked against the identity derived from the carried key
/// ring before anything is read from or written to disk. A rejected
/// announcement leaves the directory untouched. Lookup, update and save of one
/// identity happen under that identity's lock.
pub async fn handle_announcement(
    ctx: &RendezvousContext,
    startup: &ClientStartup,
    remote_address: IpAddr,
    seen_at: DateTime<Utc>,
) -> Result<PeerRecord, AnnouncementError> {
    let update = startup.update.clone();
    let identity = derive_identity(&update.public_key_ring)?;
    let handle = identity.handle();
    if !update.verify_signature(&identity) {
        return Err(AnnouncementError::SignatureMismatch(handle));
    }

    let _identity_guard = ctx.identity_locks().lock(&handle).await;

    let directory = ctx.directory().clone();
    let origin_node_port = startup.origin_node_port;
    let record = tokio::task::spawn_blocking(move || -> Result<PeerRecord, AnnouncementError> {
        let record = match directory.find_existing(&handle)? {
            Some(mut record) => {
                record.apply_update(&update, identity, remote_address, origin_node_port, seen_at);
                record
            }
            None => directory.create(&update, identity, remote_address, origin_node_port, seen_at),
        };
        directory.save(&record)?;
        Ok(record)
    })
    .await??;

    info!(target: UPDATE_LOG_TARGET, "{}", record.update_log_entry());
    Ok(record)
}

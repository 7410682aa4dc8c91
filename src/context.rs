use std::sync::Arc;

use anyhow::Result;

use crate::config_models::cli_args;
use crate::confirmation::ConfirmationSink;
use crate::directory::PeerDirectory;
use crate::locks::IdentityLocks;
use crate::models::identity::PublicIdentityHandle;
use crate::models::peer::Eligibility;
use crate::models::peer::PeerRecord;

/// Everything a connection task needs, shared by all of them. Cloning is
/// cheap.
#[derive(Debug, Clone)]
pub struct RendezvousContext {
    cli: Arc<cli_args::Args>,
    directory: PeerDirectory,
    identity_locks: IdentityLocks,
    confirmations: Arc<dyn ConfirmationSink>,
}

impl RendezvousContext {
    pub fn new(
        cli: cli_args::Args,
        directory: PeerDirectory,
        confirmations: Arc<dyn ConfirmationSink>,
    ) -> Self {
        Self {
            cli: Arc::new(cli),
            directory,
            identity_locks: IdentityLocks::default(),
            confirmations,
        }
    }

    pub fn cli(&self) -> &cli_args::Args {
        &self.cli
    }

    pub fn directory(&self) -> &PeerDirectory {
        &self.directory
    }

    pub fn identity_locks(&self) -> &IdentityLocks {
        &self.identity_locks
    }

    pub fn confirmations(&self) -> &dyn ConfirmationSink {
        self.confirmations.as_ref()
    }

    /// Move a peer to another eligibility category, serialized with any
    /// announcement of the same peer that is being processed.
    pub async fn transition_peer(
        &self,
        handle: PublicIdentityHandle,
        to: Eligibility,
    ) -> Result<PeerRecord> {
        let _identity_guard = self.identity_locks.lock(&handle).await;
        let directory = self.directory.clone();
        let record =
            tokio::task::spawn_blocking(move || directory.transition(&handle, to)).await??;
        Ok(record)
    }
}

pub mod announcement;
pub mod codec;
pub mod config_models;
pub mod confirmation;
pub mod context;
pub mod directory;
pub mod dispatcher;
pub mod listener;
pub mod locks;
pub mod models;


use std::sync::Arc;

use anyhow::Context;
use anyhow::Result;
use config_models::cli_args;
use tracing::info;

use crate::config_models::data_directory::DataDirectory;
use crate::confirmation::ConfirmationOutbox;
use crate::confirmation::ConfirmationSink;
use crate::confirmation::DiscardConfirmations;
use crate::context::RendezvousContext;
use crate::directory::PeerDirectory;
use crate::listener::RendezvousServer;

const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Open the peer directory, bind the listening socket and start the
/// confirmation outbox. The returned server accepts connections once run.
pub async fn initialize(cli_args: cli_args::Args) -> Result<RendezvousServer> {
    info!("Starting circle-rendezvous {VERSION}.");

    // Get data directory (peer directory), create one if none exists
    let data_directory = DataDirectory::get(cli_args.data_dir.clone())?;
    DataDirectory::create_dir_if_not_exists(&data_directory.root_dir_path())?;
    info!("Data directory is {}", data_directory);

    let peer_directory_path = data_directory.peer_directory_path();
    let directory = tokio::task::spawn_blocking(move || PeerDirectory::open(peer_directory_path))
        .await?
        .context("Failed to open peer directory")?;
    info!("Peer directory is {}", directory.root().display());

    let listener = listener::bind(cli_args.listen_addr, cli_args.port).await?;
    let local_address = listener.local_addr()?;

    let confirmations: Arc<dyn ConfirmationSink> = if cli_args.no_confirmations {
        info!("Not sending confirmations");
        Arc::new(DiscardConfirmations)
    } else {
        let (outbox, _delivery_task) =
            ConfirmationOutbox::spawn(local_address.port(), cli_args.max_frame_length);
        Arc::new(outbox)
    };

    let ctx = RendezvousContext::new(cli_args, directory, confirmations);
    info!("Now listening for announcements on {local_address}");
    Ok(RendezvousServer::new(listener, ctx))
}

use std::net::SocketAddr;
use std::path::Path;
use std::path::PathBuf;
use std::time::Duration;

use circle_rendezvous::codec;
use circle_rendezvous::codec::MessageStream;
use circle_rendezvous::config_models::cli_args::Args;
use circle_rendezvous::config_models::data_directory::DataDirectory;
use circle_rendezvous::context::RendezvousContext;
use circle_rendezvous::models::identity::derive_identity;
use circle_rendezvous::models::identity::KeyRing;
use circle_rendezvous::models::identity::KeyRingEntry;
use circle_rendezvous::models::identity::PublicIdentityHandle;
use circle_rendezvous::models::message::ClientStartup;
use circle_rendezvous::models::message::ClientUpdate;
use circle_rendezvous::models::message::Message;
use circle_rendezvous::models::message::MessageBody;
use circle_rendezvous::models::message::TransactionId;
use ed25519_dalek::Signer;
use ed25519_dalek::SigningKey;
use rand::distr::Alphanumeric;
use rand::distr::SampleString;
use tokio::net::TcpStream;
use tokio::task::JoinHandle;
use x25519_dalek::StaticSecret;

pub const ACK_TIMEOUT: Duration = Duration::from_secs(10);

/// A rendezvous server running in the test's runtime on an ephemeral port.
pub struct RendezvousNode {
    pub address: SocketAddr,
    pub ctx: RendezvousContext,

    // kept so the server task can be inspected by future tests.
    #[allow(dead_code)]
    pub join_handle: JoinHandle<anyhow::Result<()>>,
}

// has methods that may be useful for future tests
#[allow(dead_code)]
impl RendezvousNode {
    /// Create a randomly named `DataDirectory` so tests can run in parallel.
    pub fn integration_test_data_directory() -> anyhow::Result<DataDirectory> {
        let mut rng = rand::rng();
        let user = std::env::var("USER").unwrap_or_else(|_| "default".to_string());
        let tmp_root: PathBuf = std::env::temp_dir()
            .join(format!("circle-rendezvous-integration-tests-{}", user))
            .join(Path::new(&Alphanumeric.sample_string(&mut rng, 16)));

        DataDirectory::get(Some(tmp_root))
    }

    /// Default arguments, on a fresh data directory and an ephemeral port.
    pub fn default_args() -> Args {
        let data_dir = Self::integration_test_data_directory().unwrap();
        Args {
            data_dir: Some(data_dir.root_dir_path()),
            port: 0,
            ..Default::default()
        }
    }

    pub async fn start(args: Args) -> anyhow::Result<Self> {
        let server = circle_rendezvous::initialize(args).await?;
        let address = server.local_addr()?;
        let ctx = server.context().clone();
        let join_handle = tokio::spawn(server.run());
        Ok(Self {
            address,
            ctx,
            join_handle,
        })
    }

    pub async fn connect(&self) -> MessageStream<TcpStream> {
        let stream = TcpStream::connect(self.address).await.unwrap();
        codec::frame(stream, self.ctx.cli().max_frame_length)
    }

    /// Send `message` and wait for its acknowledgment.
    pub async fn send_acknowledged(peer: &mut MessageStream<TcpStream>, message: Message) {
        codec::send_message(peer, message).await.unwrap();
        codec::read_acknowledgment(peer, ACK_TIMEOUT).await.unwrap();
    }
}

/// A backup node with reproducible keys.
#[derive(Clone)]
pub struct BackupNode {
    signing_key: SigningKey,
    encrypting_secret: StaticSecret,
}

#[allow(dead_code)]
impl BackupNode {
    pub fn from_seed(seed: u8) -> Self {
        Self {
            signing_key: SigningKey::from_bytes(&[seed; 32]),
            encrypting_secret: StaticSecret::from([seed.wrapping_add(128); 32]),
        }
    }

    pub fn key_ring_bytes(&self) -> Vec<u8> {
        KeyRing::new(vec![
            KeyRingEntry::signing(&self.signing_key.verifying_key()),
            KeyRingEntry::encrypting(&x25519_dalek::PublicKey::from(&self.encrypting_secret)),
        ])
        .to_bytes()
        .unwrap()
    }

    pub fn handle(&self) -> PublicIdentityHandle {
        derive_identity(&self.key_ring_bytes()).unwrap().handle()
    }

    pub fn announcement(&self, name: &str, storage: u64, origin_node_port: u16) -> Message {
        let mut update = ClientUpdate {
            name: name.to_string(),
            email: format!("{}@example.org", name.to_lowercase()),
            storage_available: storage,
            public_key_ring: self.key_ring_bytes(),
            signature: vec![],
        };
        update.signature = self
            .signing_key
            .sign(&update.signing_bytes())
            .to_bytes()
            .to_vec();

        Message::client_startup(
            TransactionId::random(),
            ClientStartup {
                update,
                origin_node_port,
            },
        )
    }

    /// Same as [`Self::announcement`], but signed by `forger`.
    pub fn forged_announcement(&self, forger: &BackupNode, storage: u64) -> Message {
        let mut message = self.announcement("Mallory", storage, 4000);
        if let MessageBody::ClientStartup(startup) = &mut message.body {
            startup.update.signature = forger
                .signing_key
                .sign(&startup.update.signing_bytes())
                .to_bytes()
                .to_vec();
        }
        message
    }
}

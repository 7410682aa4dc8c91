//! Durable store of peer records, partitioned by eligibility.
//!
//! ```text
//! <root>/
//! ├── candidate/<handle>/peer.json     metadata
//! │                     /pubring.bin   raw key ring
//! ├── eligible/...
//! ├── in_circle/...
//! ├── rejected/...
//! ├── .staging/                        saves being assembled
//! └── .trash/                          entries being replaced
//! ```
//!
//! A save assembles the complete entry under `.staging`, moves every existing
//! entry of the same identity into `.trash`, renames the staged entry into its
//! category and finally deletes the trash. [`PeerDirectory::open`] finishes
//! or rolls back whatever an interrupted save left behind.
//!
//! The directory does no locking of its own. Callers serialize mutations per
//! identity, see [`crate::locks::IdentityLocks`].

mod staged_entry;

use std::fs;
use std::io;
use std::net::IpAddr;
use std::path::Path;
use std::path::PathBuf;
use std::sync::Arc;

use chrono::DateTime;
use chrono::Utc;
use staged_entry::random_nonce;
use staged_entry::StagedEntry;
use staged_entry::TRASH_NAME_SEPARATOR;
use tracing::error;
use tracing::info;
use tracing::warn;

use crate::models::identity::derive_identity;
use crate::models::identity::PublicIdentity;
use crate::models::identity::PublicIdentityHandle;
use crate::models::message::ClientUpdate;
use crate::models::peer::Eligibility;
use crate::models::peer::PeerMetadata;
use crate::models::peer::PeerRecord;

pub const PEER_METADATA_FILE_NAME: &str = "peer.json";
pub const KEY_RING_FILE_NAME: &str = "pubring.bin";
pub const STAGING_DIR_NAME: &str = ".staging";
pub const TRASH_DIR_NAME: &str = ".trash";

#[derive(Debug, thiserror::Error)]
pub enum DirectoryError {
    #[error("directory corruption: {0}")]
    Corruption(String),

    #[error("failed to persist peer {handle}")]
    Persistence {
        handle: PublicIdentityHandle,
        #[source]
        source: io::Error,
    },

    #[error("failed to read {} of peer {handle}", path.display())]
    Read {
        handle: PublicIdentityHandle,
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("stored metadata of peer {handle} is unreadable")]
    Metadata {
        handle: PublicIdentityHandle,
        #[source]
        source: serde_json::Error,
    },

    #[error("no stored peer {0}")]
    NotFound(PublicIdentityHandle),

    #[error("peer {handle} cannot move from {from} to {to}")]
    InvalidTransition {
        handle: PublicIdentityHandle,
        from: Eligibility,
        to: Eligibility,
    },

    #[error(transparent)]
    Io(#[from] io::Error),
}

/// An existing entry moved aside while its replacement is put in place.
#[derive(Debug)]
struct DisplacedEntry {
    original: PathBuf,
    trash: PathBuf,
}

#[derive(Debug, Clone)]
pub struct PeerDirectory {
    root: Arc<PathBuf>,
}

impl PeerDirectory {
    /// Open the directory at `root`, creating the category directories if
    /// needed and recovering from interrupted saves.
    pub fn open(root: impl Into<PathBuf>) -> Result<Self, DirectoryError> {
        let directory = Self {
            root: Arc::new(root.into()),
        };
        for eligibility in Eligibility::ALL {
            fs::create_dir_all(directory.category_path(eligibility))?;
        }
        directory.recover()?;
        Ok(directory)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn category_path(&self, eligibility: Eligibility) -> PathBuf {
        self.root.join(eligibility.dir_name())
    }

    pub fn entry_path(&self, eligibility: Eligibility, handle: &PublicIdentityHandle) -> PathBuf {
        self.category_path(eligibility).join(handle.to_string())
    }

    fn staging_path(&self) -> PathBuf {
        self.root.join(STAGING_DIR_NAME)
    }

    fn trash_path(&self) -> PathBuf {
        self.root.join(TRASH_DIR_NAME)
    }

    fn categories_holding(&self, handle: &PublicIdentityHandle) -> Vec<Eligibility> {
        Eligibility::ALL
            .into_iter()
            .filter(|eligibility| self.entry_path(*eligibility, handle).is_dir())
            .collect()
    }

    /// Look `handle` up in every category, in scan order. An identity found
    /// in more than one category is reported, never resolved.
    pub fn find_existing(
        &self,
        handle: &PublicIdentityHandle,
    ) -> Result<Option<PeerRecord>, DirectoryError> {
        match self.categories_holding(handle).as_slice() {
            [] => Ok(None),
            [eligibility] => self.load(*eligibility, handle).map(Some),
            several => Err(DirectoryError::Corruption(format!(
                "peer {handle} is stored under several categories: {several:?}"
            ))),
        }
    }

    /// Build the record of a peer seen for the first time. Nothing is written
    /// until the record is saved.
    pub fn create(
        &self,
        update: &ClientUpdate,
        identity: PublicIdentity,
        network_address: IpAddr,
        network_port: u16,
        seen_at: DateTime<Utc>,
    ) -> PeerRecord {
        PeerRecord::new_candidate(update, identity, network_address, network_port, seen_at)
    }

    pub fn load(
        &self,
        eligibility: Eligibility,
        handle: &PublicIdentityHandle,
    ) -> Result<PeerRecord, DirectoryError> {
        let entry = self.entry_path(eligibility, handle);
        let read = |file_name: &str| {
            let path = entry.join(file_name);
            fs::read(&path).map_err(|source| DirectoryError::Read {
                handle: *handle,
                path,
                source,
            })
        };

        let metadata: PeerMetadata = serde_json::from_slice(&read(PEER_METADATA_FILE_NAME)?)
            .map_err(|source| DirectoryError::Metadata {
                handle: *handle,
                source,
            })?;
        let key_ring = read(KEY_RING_FILE_NAME)?;

        let identity = derive_identity(&key_ring).map_err(|e| {
            DirectoryError::Corruption(format!("stored key ring of peer {handle} is unusable: {e}"))
        })?;
        if identity.handle() != *handle {
            return Err(DirectoryError::Corruption(format!(
                "key ring stored under {handle} belongs to {}",
                identity.handle()
            )));
        }

        Ok(PeerRecord::from_stored(
            identity,
            metadata,
            eligibility,
            key_ring,
        ))
    }

    /// Handles of all peers stored under `eligibility`, sorted.
    pub fn list(&self, eligibility: Eligibility) -> Result<Vec<PublicIdentityHandle>, DirectoryError> {
        let mut handles = vec![];
        for entry in fs::read_dir(self.category_path(eligibility))? {
            let name = entry?.file_name();
            match name.to_str().map(str::parse::<PublicIdentityHandle>) {
                Some(Ok(handle)) => handles.push(handle),
                _ => warn!("Ignoring unexpected entry {name:?} under {eligibility}"),
            }
        }
        handles.sort();
        Ok(handles)
    }

    /// Write `record` under its current eligibility, replacing any stored
    /// entry of the same identity in any category.
    pub fn save(&self, record: &PeerRecord) -> Result<(), DirectoryError> {
        let handle = record.identity().handle();
        self.save_inner(record)
            .map_err(|source| DirectoryError::Persistence { handle, source })
    }

    fn save_inner(&self, record: &PeerRecord) -> io::Result<()> {
        let handle = record.identity().handle();
        let metadata = serde_json::to_vec_pretty(&record.metadata())?;

        let staged = StagedEntry::create(&self.staging_path(), &handle)?;
        staged.write_file(PEER_METADATA_FILE_NAME, &metadata)?;
        staged.write_file(KEY_RING_FILE_NAME, record.key_ring())?;

        fs::create_dir_all(self.category_path(record.eligibility()))?;

        let displaced = self.displace(&handle)?;
        if let Err(e) = staged.commit_to(&self.entry_path(record.eligibility(), &handle)) {
            Self::restore(displaced);
            return Err(e);
        }
        Self::discard(displaced);
        Ok(())
    }

    /// Move every stored entry of `handle` into the trash area.
    fn displace(&self, handle: &PublicIdentityHandle) -> io::Result<Vec<DisplacedEntry>> {
        let categories = self.categories_holding(handle);
        if categories.is_empty() {
            return Ok(vec![]);
        }

        fs::create_dir_all(self.trash_path())?;
        let mut displaced = vec![];
        for eligibility in categories {
            let original = self.entry_path(eligibility, handle);
            let trash = self.trash_path().join(format!(
                "{eligibility}{TRASH_NAME_SEPARATOR}{handle}{TRASH_NAME_SEPARATOR}{}",
                random_nonce()
            ));
            if let Err(e) = fs::rename(&original, &trash) {
                Self::restore(displaced);
                return Err(e);
            }
            displaced.push(DisplacedEntry { original, trash });
        }
        Ok(displaced)
    }

    fn restore(displaced: Vec<DisplacedEntry>) {
        for entry in displaced {
            if let Err(e) = fs::rename(&entry.trash, &entry.original) {
                // Left in the trash area; `recover` puts it back on next open.
                error!(
                    "Failed to restore {} from {}: {e}",
                    entry.original.display(),
                    entry.trash.display()
                );
            }
        }
    }

    fn discard(displaced: Vec<DisplacedEntry>) {
        for entry in displaced {
            if let Err(e) = fs::remove_dir_all(&entry.trash) {
                warn!("Failed to remove {}: {e}", entry.trash.display());
            }
        }
    }

    /// Move a stored peer to another eligibility category. Announcements never
    /// call it.
    ///
    /// Callers must hold the identity lock of `handle`;
    /// [`RendezvousContext::transition_peer`](crate::context::RendezvousContext::transition_peer)
    /// is the locked entry point.
    pub(crate) fn transition(
        &self,
        handle: &PublicIdentityHandle,
        to: Eligibility,
    ) -> Result<PeerRecord, DirectoryError> {
        let mut record = self
            .find_existing(handle)?
            .ok_or(DirectoryError::NotFound(*handle))?;
        let from = record.eligibility();
        if !from.can_transition_to(to) {
            return Err(DirectoryError::InvalidTransition {
                handle: *handle,
                from,
                to,
            });
        }

        record.set_eligibility(to);
        self.save(&record)?;
        info!("Moved peer {handle} from {from} to {to}");
        Ok(record)
    }

    /// Drop half-written saves and put back entries that were moved aside by
    /// a save that never completed.
    fn recover(&self) -> Result<(), DirectoryError> {
        let staging = self.staging_path();
        if staging.is_dir() {
            for entry in fs::read_dir(&staging)? {
                let path = entry?.path();
                fs::remove_dir_all(&path)?;
                warn!("Removed interrupted save {}", path.display());
            }
        }

        let trash = self.trash_path();
        if trash.is_dir() {
            for entry in fs::read_dir(&trash)? {
                let entry = entry?;
                let path = entry.path();
                let name = entry.file_name().to_string_lossy().into_owned();
                match parse_trash_name(&name) {
                    Some((eligibility, handle)) if self.categories_holding(&handle).is_empty() => {
                        fs::rename(&path, self.entry_path(eligibility, &handle))?;
                        warn!("Restored peer {handle} under {eligibility} after an interrupted save");
                    }
                    _ => fs::remove_dir_all(&path)?,
                }
            }
        }

        Ok(())
    }
}

fn parse_trash_name(name: &str) -> Option<(Eligibility, PublicIdentityHandle)> {
    let mut parts = name.split(TRASH_NAME_SEPARATOR);
    let eligibility = Eligibility::from_dir_name(parts.next()?)?;
    let handle = parts.next()?.parse().ok()?;
    Some((eligibility, handle))
}

#[cfg(test)]
mod directory_tests {
    use std::net::Ipv4Addr;

    use super::*;
    use crate::tests::shared::unit_test_data_directory;
    use crate::tests::shared::TestPeer;

    fn open_unit_test_directory() -> PeerDirectory {
        let data_dir = unit_test_data_directory().unwrap();
        PeerDirectory::open(data_dir.peer_directory_path()).unwrap()
    }

    fn candidate(peer: &TestPeer, storage: u64) -> PeerRecord {
        let update = peer.signed_update("Alice", "alice@example.org", storage);
        PeerRecord::new_candidate(
            &update,
            peer.identity(),
            IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1)),
            4000,
            Utc::now(),
        )
    }

    #[test]
    fn open_creates_every_category() {
        let directory = open_unit_test_directory();
        for eligibility in Eligibility::ALL {
            assert!(directory.root().join(eligibility.dir_name()).is_dir());
        }
    }

    #[test]
    fn saved_record_is_found_again() {
        let directory = open_unit_test_directory();
        let peer = TestPeer::from_seed(1);
        let record = candidate(&peer, 1000);

        assert!(directory.find_existing(&peer.handle()).unwrap().is_none());
        directory.save(&record).unwrap();

        let found = directory.find_existing(&peer.handle()).unwrap().unwrap();
        assert_eq!(record, found);
        assert_eq!(vec![peer.handle()], directory.list(Eligibility::Candidate).unwrap());
    }

    #[test]
    fn entry_holds_metadata_and_raw_key_ring() {
        let directory = open_unit_test_directory();
        let peer = TestPeer::from_seed(2);
        let record = candidate(&peer, 1000);
        directory.save(&record).unwrap();

        let entry = directory.entry_path(Eligibility::Candidate, &peer.handle());
        assert_eq!(peer.key_ring_bytes(), fs::read(entry.join(KEY_RING_FILE_NAME)).unwrap());

        let metadata: serde_json::Value =
            serde_json::from_slice(&fs::read(entry.join(PEER_METADATA_FILE_NAME)).unwrap())
                .unwrap();
        assert_eq!("Alice", metadata["name"]);
        assert_eq!("alice@example.org", metadata["email"]);
        assert_eq!(1000, metadata["storage_available"]);
        assert_eq!("10.0.0.1", metadata["inet_address"]);
        assert_eq!(4000, metadata["port"]);
        let last_update = metadata["last_update"].as_str().unwrap();
        assert!(DateTime::parse_from_rfc3339(last_update).is_ok());

        let staging_leftovers = fs::read_dir(directory.root().join(STAGING_DIR_NAME))
            .unwrap()
            .count();
        assert_eq!(0, staging_leftovers);
    }

    #[test]
    fn saving_again_replaces_the_entry() {
        let directory = open_unit_test_directory();
        let peer = TestPeer::from_seed(3);
        directory.save(&candidate(&peer, 1000)).unwrap();
        directory.save(&candidate(&peer, 2000)).unwrap();

        let found = directory.find_existing(&peer.handle()).unwrap().unwrap();
        assert_eq!(2000, found.storage_offered());
        assert_eq!(1, directory.list(Eligibility::Candidate).unwrap().len());
    }

    #[test]
    fn category_change_leaves_no_duplicate() {
        let directory = open_unit_test_directory();
        let peer = TestPeer::from_seed(4);
        directory.save(&candidate(&peer, 1000)).unwrap();

        let moved = directory
            .transition(&peer.handle(), Eligibility::Eligible)
            .unwrap();
        assert_eq!(Eligibility::Eligible, moved.eligibility());

        assert!(directory.list(Eligibility::Candidate).unwrap().is_empty());
        assert_eq!(vec![peer.handle()], directory.list(Eligibility::Eligible).unwrap());
        let found = directory.find_existing(&peer.handle()).unwrap().unwrap();
        assert_eq!(Eligibility::Eligible, found.eligibility());
        assert_eq!(1000, found.storage_offered());
    }

    #[test]
    fn transitions_follow_the_lifecycle() {
        let directory = open_unit_test_directory();
        let peer = TestPeer::from_seed(5);
        directory.save(&candidate(&peer, 1000)).unwrap();

        assert!(matches!(
            directory.transition(&peer.handle(), Eligibility::InCircle),
            Err(DirectoryError::InvalidTransition { .. })
        ));
        directory
            .transition(&peer.handle(), Eligibility::Rejected)
            .unwrap();
        assert!(matches!(
            directory.transition(&peer.handle(), Eligibility::Candidate),
            Err(DirectoryError::InvalidTransition { .. })
        ));

        let stranger = TestPeer::from_seed(6);
        assert!(matches!(
            directory.transition(&stranger.handle(), Eligibility::Eligible),
            Err(DirectoryError::NotFound(_))
        ));
    }

    #[test]
    fn identity_in_two_categories_is_corruption() {
        let directory = open_unit_test_directory();
        let peer = TestPeer::from_seed(7);
        directory.save(&candidate(&peer, 1000)).unwrap();

        let source = directory.entry_path(Eligibility::Candidate, &peer.handle());
        let duplicate = directory.entry_path(Eligibility::InCircle, &peer.handle());
        fs::create_dir_all(&duplicate).unwrap();
        for file_name in [PEER_METADATA_FILE_NAME, KEY_RING_FILE_NAME] {
            fs::copy(source.join(file_name), duplicate.join(file_name)).unwrap();
        }

        assert!(matches!(
            directory.find_existing(&peer.handle()),
            Err(DirectoryError::Corruption(_))
        ));
    }

    #[test]
    fn key_ring_of_another_peer_is_corruption() {
        let directory = open_unit_test_directory();
        let peer = TestPeer::from_seed(8);
        let impostor = TestPeer::from_seed(9);
        directory.save(&candidate(&peer, 1000)).unwrap();

        let entry = directory.entry_path(Eligibility::Candidate, &peer.handle());
        fs::write(entry.join(KEY_RING_FILE_NAME), impostor.key_ring_bytes()).unwrap();

        assert!(matches!(
            directory.find_existing(&peer.handle()),
            Err(DirectoryError::Corruption(_))
        ));
    }

    #[test]
    fn failed_save_keeps_the_old_entry() {
        let directory = open_unit_test_directory();
        let peer = TestPeer::from_seed(10);
        directory.save(&candidate(&peer, 1000)).unwrap();

        // Make the destination category unusable.
        let eligible = directory.root().join(Eligibility::Eligible.dir_name());
        fs::remove_dir(&eligible).unwrap();
        fs::write(&eligible, b"not a directory").unwrap();

        let mut promoted = directory.find_existing(&peer.handle()).unwrap().unwrap();
        promoted.set_eligibility(Eligibility::Eligible);
        assert!(matches!(
            directory.save(&promoted),
            Err(DirectoryError::Persistence { .. })
        ));

        let found = directory.find_existing(&peer.handle()).unwrap().unwrap();
        assert_eq!(Eligibility::Candidate, found.eligibility());
        let staging_leftovers = fs::read_dir(directory.root().join(STAGING_DIR_NAME))
            .unwrap()
            .count();
        assert_eq!(0, staging_leftovers);
    }

    #[test]
    fn open_recovers_interrupted_saves() {
        let data_dir = unit_test_data_directory().unwrap();
        let directory = PeerDirectory::open(data_dir.peer_directory_path()).unwrap();
        let moved_aside = TestPeer::from_seed(11);
        let replaced = TestPeer::from_seed(12);
        directory.save(&candidate(&moved_aside, 1000)).unwrap();
        directory.save(&candidate(&replaced, 1000)).unwrap();

        // A save that moved its old entry aside and then crashed.
        let trash = directory.root().join(TRASH_DIR_NAME);
        fs::create_dir_all(&trash).unwrap();
        fs::rename(
            directory.entry_path(Eligibility::Candidate, &moved_aside.handle()),
            trash.join(format!("candidate.{}.aaaa", moved_aside.handle())),
        )
        .unwrap();

        // A save that committed but crashed before emptying the trash.
        let stale = trash.join(format!("eligible.{}.bbbb", replaced.handle()));
        fs::create_dir_all(&stale).unwrap();

        // A save that crashed while writing its files.
        let half_written = directory.root().join(STAGING_DIR_NAME).join("partial");
        fs::create_dir_all(&half_written).unwrap();
        fs::write(half_written.join(PEER_METADATA_FILE_NAME), b"{").unwrap();

        let reopened = PeerDirectory::open(data_dir.peer_directory_path()).unwrap();
        assert!(reopened
            .find_existing(&moved_aside.handle())
            .unwrap()
            .is_some());
        assert_eq!(
            Eligibility::Candidate,
            reopened
                .find_existing(&replaced.handle())
                .unwrap()
                .unwrap()
                .eligibility()
        );
        assert_eq!(0, fs::read_dir(&trash).unwrap().count());
        assert!(!half_written.exists());
    }
}

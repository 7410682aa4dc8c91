use std::fs;
use std::io;
use std::io::Write;
use std::path::Path;
use std::path::PathBuf;

use rand::distr::Alphanumeric;
use rand::distr::SampleString;
use tracing::warn;

use crate::models::identity::PublicIdentityHandle;

const NONCE_LENGTH: usize = 12;

/// Separates category, handle and nonce in names under the trash area.
pub(super) const TRASH_NAME_SEPARATOR: char = '.';

pub(super) fn random_nonce() -> String {
    Alphanumeric.sample_string(&mut rand::rng(), NONCE_LENGTH)
}

/// A directory entry being assembled off to the side.
///
/// All files are written into a private staging directory first and the
/// whole directory is renamed into place by [`StagedEntry::commit_to`]. An
/// entry that is dropped without being committed removes its staging
/// directory, so an interrupted save never shows up in the directory.
#[derive(Debug)]
pub(super) struct StagedEntry {
    path: PathBuf,
    committed: bool,
}

impl StagedEntry {
    pub(super) fn create(staging_root: &Path, handle: &PublicIdentityHandle) -> io::Result<Self> {
        fs::create_dir_all(staging_root)?;
        let path = staging_root.join(format!("{handle}{TRASH_NAME_SEPARATOR}{}", random_nonce()));
        fs::create_dir(&path)?;
        Ok(Self {
            path,
            committed: false,
        })
    }

    pub(super) fn write_file(&self, file_name: &str, contents: &[u8]) -> io::Result<()> {
        let mut file = fs::File::create(self.path.join(file_name))?;
        file.write_all(contents)?;
        file.sync_all()
    }

    /// Move the staged directory to `destination`, which must not exist.
    pub(super) fn commit_to(mut self, destination: &Path) -> io::Result<()> {
        fs::rename(&self.path, destination)?;
        self.committed = true;
        Ok(())
    }
}

impl Drop for StagedEntry {
    fn drop(&mut self) {
        if self.committed {
            return;
        }
        if let Err(e) = fs::remove_dir_all(&self.path) {
            warn!(
                "Failed to clean up staging directory {}: {e}",
                self.path.display()
            );
        }
    }
}

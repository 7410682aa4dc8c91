use std::path::Path;
use std::path::PathBuf;

use anyhow::Context;
use anyhow::Result;
use directories::ProjectDirs;

pub const PEER_DIRECTORY_NAME: &str = "peers";

#[derive(Debug, Clone)]
pub struct DataDirectory {
    data_dir: PathBuf,
}

impl DataDirectory {
    ///////////////////////////////////////////////////////////////////////////
    ///
    /// The data directory that contains the peer directory
    ///
    /// The default varies by operating system, e.g.
    ///
    /// - Linux:   /home/alice/.local/share/circle-rendezvous
    /// - Windows: C:\Users\Alice\AppData\Roaming\friendlybackup\circle-rendezvous\data
    /// - macOS:   /Users/Alice/Library/Application Support/org.friendlybackup.circle-rendezvous
    pub fn get(root_dir: Option<PathBuf>) -> Result<Self> {
        let data_dir = match root_dir {
            Some(dir) => dir,
            None => ProjectDirs::from("org", "friendlybackup", "circle-rendezvous")
                .context("Could not determine data directory")?
                .data_dir()
                .to_path_buf(),
        };

        Ok(DataDirectory { data_dir })
    }

    /// Create directory if it does not exist
    pub fn create_dir_if_not_exists(dir: &Path) -> Result<()> {
        std::fs::create_dir_all(dir)
            .with_context(|| format!("Failed to create data directory {}", dir.to_string_lossy()))
    }

    ///////////////////////////////////////////////////////////////////////////
    ///
    /// The root data directory path
    pub fn root_dir_path(&self) -> PathBuf {
        self.data_dir.clone()
    }

    /// The peer directory path.
    ///
    /// This directory lives within `DataDirectory::root_dir_path()`.
    pub fn peer_directory_path(&self) -> PathBuf {
        self.data_dir.join(Path::new(PEER_DIRECTORY_NAME))
    }
}

impl std::fmt::Display for DataDirectory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.data_dir.display())
    }
}

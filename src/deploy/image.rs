//! Deployment image metadata.
//!
//! The image is either an ISO 9660 file or an unpacked directory; both carry
//! a `metadata.yml`:
//!
//! ```yaml
//! compatibility_version: v1
//! splash_message: |
//!   Platform is up.
//! services:
//!   - name: Databases
//!     handle: deploy-mysql
//!     script: deploy-mysql
//!     deployment: cf-mysql
//! ```
//!
//! ISO images are read with `cdfs`; the tree is searched breadth-first for
//! the first `metadata.yml`.

use std::collections::VecDeque;
use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};

use cdfs::{DirectoryEntry, ISO9660, ISODirectory, ISOFile};
use serde::Deserialize;

/// The only metadata version this build can deploy.
pub const COMPATIBILITY_VERSION: &str = "v1";

const METADATA_FILE: &str = "metadata.yml";
const MAX_DEPTH: usize = 8;
const MAX_DIRECTORIES: usize = 4096;
const MAX_METADATA_BYTES: u64 = 1 << 20;

#[derive(Debug, thiserror::Error)]
pub enum MetadataError {
    #[error("no file found at: {}", .0.display())]
    NotFound(PathBuf),

    #[error("failed to read {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("{} is not an ISO 9660 image: {reason}", .path.display())]
    NotIso { path: PathBuf, reason: String },

    #[error("{METADATA_FILE} is larger than {MAX_METADATA_BYTES} bytes")]
    TooLarge,

    #[error("invalid {METADATA_FILE}: {0}")]
    Parse(#[from] serde_yaml::Error),
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ServiceEntry {
    pub name: String,
    pub handle: String,
    pub script: String,
    #[serde(default)]
    pub deployment: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct ImageMetadata {
    #[serde(default)]
    pub compatibility_version: Option<String>,
    #[serde(default)]
    pub splash_message: Option<String>,
    #[serde(default)]
    pub services: Vec<ServiceEntry>,
}

impl ImageMetadata {
    pub fn parse(text: &str) -> Result<Self, MetadataError> {
        Ok(serde_yaml::from_str(text)?)
    }

    pub fn is_compatible(&self) -> bool {
        self.compatibility_version.as_deref() == Some(COMPATIBILITY_VERSION)
    }
}

/// Read the metadata of the image at `path`. `Ok(None)` means the image
/// carries no metadata file at all.
pub fn read_metadata(path: &Path) -> Result<Option<ImageMetadata>, MetadataError> {
    if !path.exists() {
        return Err(MetadataError::NotFound(path.to_path_buf()));
    }
    let io_err = |source| MetadataError::Io {
        path: path.to_path_buf(),
        source,
    };

    let text = if path.is_dir() {
        match std::fs::read_to_string(path.join(METADATA_FILE)) {
            Ok(text) => text,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(io_err(e)),
        }
    } else {
        let file = File::open(path).map_err(io_err)?;
        let not_iso = |e: cdfs::ISOError| MetadataError::NotIso {
            path: path.to_path_buf(),
            reason: e.to_string(),
        };
        let iso = ISO9660::new(file).map_err(not_iso)?;
        let Some(found) = find_file(iso.root(), METADATA_FILE).map_err(not_iso)? else {
            return Ok(None);
        };
        let mut bytes = Vec::new();
        found
            .read()
            .take(MAX_METADATA_BYTES + 1)
            .read_to_end(&mut bytes)
            .map_err(io_err)?;
        if bytes.len() as u64 > MAX_METADATA_BYTES {
            return Err(MetadataError::TooLarge);
        }
        String::from_utf8_lossy(&bytes).into_owned()
    };
    ImageMetadata::parse(&text).map(Some)
}

/// ISO 9660 names are upper case and may carry a `;1` version suffix.
fn iso_name(identifier: &str) -> String {
    let name = identifier.split(';').next().unwrap_or_default();
    name.trim_end_matches('.').to_ascii_lowercase()
}

fn is_self_or_parent(identifier: &str) -> bool {
    matches!(identifier, "." | ".." | "\0" | "\u{1}")
}

fn find_file(
    root: &ISODirectory<File>,
    wanted: &str,
) -> Result<Option<ISOFile<File>>, cdfs::ISOError> {
    let mut pending = VecDeque::new();
    let mut visited = 1;
    let mut found = scan(root, wanted, 0, &mut pending)?;
    while found.is_none() && visited < MAX_DIRECTORIES {
        let Some((dir, depth)) = pending.pop_front() else {
            break;
        };
        visited += 1;
        found = scan(&dir, wanted, depth, &mut pending)?;
    }
    Ok(found)
}

/// Look for `wanted` directly inside `dir`, queueing its subdirectories.
fn scan(
    dir: &ISODirectory<File>,
    wanted: &str,
    depth: usize,
    pending: &mut VecDeque<(ISODirectory<File>, usize)>,
) -> Result<Option<ISOFile<File>>, cdfs::ISOError> {
    for entry in dir.contents() {
        let entry = entry?;
        let identifier = entry.identifier().to_string();
        if is_self_or_parent(&identifier) {
            continue;
        }
        match entry {
            DirectoryEntry::File(file) if iso_name(&identifier) == wanted => {
                return Ok(Some(file));
            }
            DirectoryEntry::Directory(sub) if depth < MAX_DEPTH => {
                pending.push_back((sub, depth + 1));
            }
            _ => {}
        }
    }
    Ok(None)
}

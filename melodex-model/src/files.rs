use std::fmt;
use std::path::{Path, PathBuf};

/// Identity of one medium: a logical collection of audio files sharing one
/// root directory and (usually) a description file. Immutable once computed
/// by the directory scanner.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct MediumIdentity {
    /// Stable URI of the medium root, e.g. the root directory rendered as a
    /// path string. The lookup key for everything medium-scoped.
    pub uri: String,
    /// Path of the medium description file, when one exists.
    pub description_path: Option<PathBuf>,
}

impl MediumIdentity {
    pub fn new(uri: impl Into<String>) -> Self {
        Self {
            uri: uri.into(),
            description_path: None,
        }
    }

    pub fn with_description(
        uri: impl Into<String>,
        description_path: PathBuf,
    ) -> Self {
        Self {
            uri: uri.into(),
            description_path: Some(description_path),
        }
    }
}

impl fmt::Debug for MediumIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MediumIdentity")
            .field("uri", &self.uri)
            .field("has_description", &self.description_path.is_some())
            .finish()
    }
}

impl fmt::Display for MediumIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.uri)
    }
}

/// One file discovered under a medium root: absolute path plus size.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct FileDescriptor {
    pub path: PathBuf,
    pub size: u64,
}

impl FileDescriptor {
    pub fn new(path: impl Into<PathBuf>, size: u64) -> Self {
        Self {
            path: path.into(),
            size,
        }
    }
}

/// The scan-time view of one medium: identity, the root the scanner walked,
/// and the ordered file listing found beneath it.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct MediumListing {
    pub identity: MediumIdentity,
    /// Filesystem root the file paths are relative to. Kept separate from
    /// the identity so the same medium mounted elsewhere keys identically.
    pub root: PathBuf,
    pub files: Vec<FileDescriptor>,
}

impl MediumListing {
    pub fn new(
        identity: MediumIdentity,
        root: impl Into<PathBuf>,
        files: Vec<FileDescriptor>,
    ) -> Self {
        Self {
            identity,
            root: root.into(),
            files,
        }
    }

    /// Medium-relative URI for a file of this listing, always
    /// forward-slash separated and rooted at `/`. Falls back to the file
    /// name when the path does not sit under the medium root.
    pub fn file_uri(&self, path: &Path) -> String {
        relative_uri(&self.root, path)
    }

    /// uri -> absolute path for every file of the listing, the mapping the
    /// writer needs to attribute freshly extracted records.
    pub fn uri_path_mapping(
        &self,
    ) -> std::collections::HashMap<String, PathBuf> {
        self.files
            .iter()
            .map(|file| (self.file_uri(&file.path), file.path.clone()))
            .collect()
    }
}

/// Medium-relative URI derivation shared by listings and checksum input.
pub fn relative_uri(root: &Path, path: &Path) -> String {
    let relative = path.strip_prefix(root).unwrap_or_else(|_| {
        path.file_name().map(Path::new).unwrap_or(path)
    });
    let mut uri = String::from("/");
    let mut first = true;
    for component in relative.components() {
        if !first {
            uri.push('/');
        }
        uri.push_str(&component.as_os_str().to_string_lossy());
        first = false;
    }
    uri
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn file_uri_is_rooted_and_forward_slashed() {
        let listing = MediumListing::new(
            MediumIdentity::new("/music/album"),
            "/music/album",
            vec![FileDescriptor::new("/music/album/cd1/track01.mp3", 10)],
        );
        assert_eq!(
            listing.file_uri(Path::new("/music/album/cd1/track01.mp3")),
            "/cd1/track01.mp3"
        );
    }

    #[test]
    fn file_uri_falls_back_to_file_name_outside_root() {
        let listing = MediumListing::new(
            MediumIdentity::new("/music/album"),
            "/music/album",
            vec![],
        );
        assert_eq!(
            listing.file_uri(Path::new("/elsewhere/stray.mp3")),
            "/stray.mp3"
        );
    }

    #[test]
    fn uri_path_mapping_covers_every_file() {
        let listing = MediumListing::new(
            MediumIdentity::new("/m"),
            "/m",
            vec![
                FileDescriptor::new("/m/a.mp3", 1),
                FileDescriptor::new("/m/sub/b.mp3", 2),
            ],
        );
        let mapping = listing.uri_path_mapping();
        assert_eq!(mapping.len(), 2);
        assert_eq!(
            mapping.get("/sub/b.mp3"),
            Some(&PathBuf::from("/m/sub/b.mp3"))
        );
    }
}

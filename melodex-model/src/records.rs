/// Extracted metadata for one audio file, the unit persisted to `.mdt`
/// files and streamed to listeners.
///
/// Every field other than `uri` and `size` is optional. An absent field
/// means "feature not extracted", never "known empty": a record produced
/// for an unreadable file carries `None` everywhere, and a year of `0`
/// round-trips as `Some(0)`, distinct from absent.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct MetadataRecord {
    /// Medium-relative file URI the record belongs to.
    pub uri: String,
    /// URI of the owning medium. Redundant with the surrounding `.mdt`
    /// file's checksum name, so persisted records may omit it.
    #[cfg_attr(
        feature = "serde",
        serde(default, skip_serializing_if = "Option::is_none")
    )]
    pub medium: Option<String>,
    #[cfg_attr(
        feature = "serde",
        serde(default, skip_serializing_if = "Option::is_none")
    )]
    pub title: Option<String>,
    #[cfg_attr(
        feature = "serde",
        serde(default, skip_serializing_if = "Option::is_none")
    )]
    pub artist: Option<String>,
    #[cfg_attr(
        feature = "serde",
        serde(default, skip_serializing_if = "Option::is_none")
    )]
    pub album: Option<String>,
    #[cfg_attr(
        feature = "serde",
        serde(default, skip_serializing_if = "Option::is_none")
    )]
    pub year: Option<u32>,
    #[cfg_attr(
        feature = "serde",
        serde(default, skip_serializing_if = "Option::is_none")
    )]
    pub track: Option<u32>,
    /// Playback duration in milliseconds, derived from audio frame headers.
    #[cfg_attr(
        feature = "serde",
        serde(default, skip_serializing_if = "Option::is_none")
    )]
    pub duration_ms: Option<u64>,
    /// Human-readable format description, e.g. "MPEG 1 Layer III 192 kbit/s
    /// 44100 Hz".
    #[cfg_attr(
        feature = "serde",
        serde(default, skip_serializing_if = "Option::is_none")
    )]
    pub format: Option<String>,
    /// File size in bytes, taken from the scan listing.
    pub size: u64,
}

impl MetadataRecord {
    /// Record for a file no metadata could be obtained for. Carries only
    /// identity and size so the file still surfaces downstream.
    pub fn unresolved(uri: impl Into<String>, size: u64) -> Self {
        Self {
            uri: uri.into(),
            medium: None,
            title: None,
            artist: None,
            album: None,
            year: None,
            track: None,
            duration_ms: None,
            format: None,
            size,
        }
    }

    /// True when no feature field was extracted.
    pub fn is_empty(&self) -> bool {
        self.title.is_none()
            && self.artist.is_none()
            && self.album.is_none()
            && self.year.is_none()
            && self.track.is_none()
            && self.duration_ms.is_none()
            && self.format.is_none()
    }

    /// Best display name: the title when present, else the last URI
    /// segment.
    pub fn display_name(&self) -> &str {
        match &self.title {
            Some(title) if !title.is_empty() => title,
            _ => self.uri.rsplit('/').next().unwrap_or(&self.uri),
        }
    }
}

//! Per-file result aggregation.
//!
//! Each in-flight file gets one [`Collector`] that the tag and frame
//! partials merge into, in whichever order they arrive. The collector
//! is complete when both sides have landed; the supervisor then removes
//! it and turns it into a record exactly once.

use std::collections::HashMap;

use melodex_model::MetadataRecord;
use tracing::trace;

use crate::extract::frames::FramePartial;
use crate::extract::id3::TagPartial;

/// The two contributions a file's record is assembled from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Contribution {
    Tag,
    Frames,
}

/// Accumulates the halves of one file's metadata.
#[derive(Debug)]
pub struct Collector {
    uri: String,
    size: u64,
    tag: Option<TagPartial>,
    frames: Option<FramePartial>,
}

impl Collector {
    pub fn new(uri: impl Into<String>, size: u64) -> Self {
        Self {
            uri: uri.into(),
            size,
            tag: None,
            frames: None,
        }
    }

    pub fn uri(&self) -> &str {
        &self.uri
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    /// Merges a tag partial. A repeated contribution overwrites, which
    /// cannot happen with one tag processor per file.
    pub fn merge_tag(&mut self, partial: TagPartial) {
        trace!(target: "extract::collect", uri = %self.uri, "tag contribution merged");
        self.tag = Some(partial);
    }

    pub fn merge_frames(&mut self, partial: FramePartial) {
        trace!(target: "extract::collect", uri = %self.uri, "frame contribution merged");
        self.frames = Some(partial);
    }

    /// True once both contributions have arrived, even when either is
    /// empty.
    pub fn is_complete(&self) -> bool {
        self.tag.is_some() && self.frames.is_some()
    }

    pub fn missing(&self) -> Vec<Contribution> {
        let mut missing = Vec::new();
        if self.tag.is_none() {
            missing.push(Contribution::Tag);
        }
        if self.frames.is_none() {
            missing.push(Contribution::Frames);
        }
        missing
    }

    /// Builds the file's record from whatever was collected. Absent
    /// contributions leave their fields unset.
    pub fn into_record(self, medium_uri: &str) -> MetadataRecord {
        let tag = self.tag.unwrap_or_default();
        let frames = self.frames.unwrap_or_default();
        MetadataRecord {
            uri: self.uri,
            medium: Some(medium_uri.to_string()),
            title: tag.title,
            artist: tag.artist,
            album: tag.album,
            year: tag.year,
            track: tag.track,
            duration_ms: frames.duration_ms,
            format: frames.format,
            size: self.size,
        }
    }
}

/// Collectors for the files currently in flight, keyed by file URI.
#[derive(Debug, Default)]
pub struct CollectorMap {
    entries: HashMap<String, Collector>,
}

impl CollectorMap {
    /// Returns the collector for `uri`, creating it on first use.
    pub fn get_or_create(&mut self, uri: &str, size: u64) -> &mut Collector {
        self.entries
            .entry(uri.to_string())
            .or_insert_with(|| Collector::new(uri, size))
    }

    pub fn get_mut(&mut self, uri: &str) -> Option<&mut Collector> {
        self.entries.get_mut(uri)
    }

    /// Removes and returns the collector, if the file is still in flight.
    pub fn remove(&mut self, uri: &str) -> Option<Collector> {
        self.entries.remove(uri)
    }

    pub fn contains(&self, uri: &str) -> bool {
        self.entries.contains_key(uri)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tag_partial(title: &str) -> TagPartial {
        TagPartial {
            title: Some(title.to_string()),
            ..TagPartial::default()
        }
    }

    fn frame_partial(duration_ms: u64) -> FramePartial {
        FramePartial {
            duration_ms: Some(duration_ms),
            format: Some("MPEG 1 Layer III 192 kbit/s 44100 Hz".to_string()),
        }
    }

    #[test]
    fn merge_order_does_not_matter() {
        let mut first = Collector::new("/a.mp3", 100);
        first.merge_tag(tag_partial("A"));
        first.merge_frames(frame_partial(1000));

        let mut second = Collector::new("/a.mp3", 100);
        second.merge_frames(frame_partial(1000));
        second.merge_tag(tag_partial("A"));

        assert!(first.is_complete());
        assert!(second.is_complete());
        assert_eq!(first.into_record("file:///m"), second.into_record("file:///m"));
    }

    #[test]
    fn incomplete_collector_names_what_is_missing() {
        let mut collector = Collector::new("/a.mp3", 1);
        assert_eq!(
            collector.missing(),
            vec![Contribution::Tag, Contribution::Frames]
        );
        collector.merge_frames(FramePartial::default());
        assert_eq!(collector.missing(), vec![Contribution::Tag]);
        assert!(!collector.is_complete());
    }

    #[test]
    fn empty_partials_still_complete_into_an_empty_record() {
        let mut collector = Collector::new("/b.mp3", 7);
        collector.merge_tag(TagPartial::default());
        collector.merge_frames(FramePartial::default());
        assert!(collector.is_complete());
        let record = collector.into_record("file:///m");
        assert!(record.is_empty());
        assert_eq!(record.uri, "/b.mp3");
        assert_eq!(record.size, 7);
        assert_eq!(record.medium.as_deref(), Some("file:///m"));
    }

    #[test]
    fn torn_down_collector_yields_a_record_without_the_missing_half() {
        let mut collector = Collector::new("/c.mp3", 9);
        collector.merge_tag(tag_partial("Solo"));
        let record = collector.into_record("file:///m");
        assert_eq!(record.title.as_deref(), Some("Solo"));
        assert_eq!(record.duration_ms, None);
    }

    #[test]
    fn map_creates_lazily_and_removes_once() {
        let mut map = CollectorMap::default();
        map.get_or_create("/a.mp3", 10).merge_tag(tag_partial("A"));
        map.get_or_create("/a.mp3", 10)
            .merge_frames(frame_partial(2000));
        assert_eq!(map.len(), 1);
        assert!(map.contains("/a.mp3"));

        let collector = map.remove("/a.mp3").expect("collector present");
        assert!(collector.is_complete());
        assert!(map.remove("/a.mp3").is_none());
        assert!(map.is_empty());
    }
}

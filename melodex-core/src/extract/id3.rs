//! Incremental ID3 tag scanning.
//!
//! The scanner is fed the same chunk stream the frame analyzer sees and
//! never rewinds: it buffers the ID3v2 prefix up to the configured tag
//! size limit, keeps a 128-byte tail for an ID3v1 fallback, and parses
//! both once the stream ends. ID3v2.3 and v2.4 text frames are read;
//! v2.2 and malformed tags degrade to an empty partial, never an error.

use tracing::{debug, trace};

/// Tag-derived half of a metadata record.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TagPartial {
    pub title: Option<String>,
    pub artist: Option<String>,
    pub album: Option<String>,
    pub year: Option<u32>,
    pub track: Option<u32>,
}

impl TagPartial {
    pub fn is_empty(&self) -> bool {
        self.title.is_none()
            && self.artist.is_none()
            && self.album.is_none()
            && self.year.is_none()
            && self.track.is_none()
    }

    /// Fills fields absent here from `fallback`, field by field.
    fn fill_from(&mut self, fallback: TagPartial) {
        if self.title.is_none() {
            self.title = fallback.title;
        }
        if self.artist.is_none() {
            self.artist = fallback.artist;
        }
        if self.album.is_none() {
            self.album = fallback.album;
        }
        if self.year.is_none() {
            self.year = fallback.year;
        }
        if self.track.is_none() {
            self.track = fallback.track;
        }
    }
}

const V2_HEADER_LEN: usize = 10;
const V1_TAG_LEN: usize = 128;

/// Streaming ID3 scanner for one file.
#[derive(Debug)]
pub struct Id3Scanner {
    limit: usize,
    /// File prefix: the v2 header plus as much of the tag body as the
    /// limit allows.
    head: Vec<u8>,
    head_target: usize,
    /// Last 128 bytes seen, for the ID3v1 trailer.
    tail: Vec<u8>,
    total_len: u64,
}

impl Id3Scanner {
    pub fn new(tag_size_limit: usize) -> Self {
        Self {
            limit: tag_size_limit,
            head: Vec::new(),
            head_target: V2_HEADER_LEN,
            tail: Vec::new(),
            total_len: 0,
        }
    }

    /// Feeds the next chunk of the file, in stream order.
    pub fn push(&mut self, chunk: &[u8]) {
        self.total_len += chunk.len() as u64;

        if self.head.len() < self.head_target {
            let want = self.head_target - self.head.len();
            let take = want.min(chunk.len());
            self.head.extend_from_slice(&chunk[..take]);
            if self.head.len() == V2_HEADER_LEN
                && self.head_target == V2_HEADER_LEN
                && let Some(tag_size) = v2_tag_size(&self.head)
            {
                // Cap the buffered prefix at the limit; frames beyond it
                // are dropped, which trims embedded artwork gracefully.
                self.head_target =
                    (V2_HEADER_LEN + tag_size).min(self.limit.max(V2_HEADER_LEN));
                let rest = &chunk[take..];
                let more = (self.head_target - self.head.len()).min(rest.len());
                self.head.extend_from_slice(&rest[..more]);
            }
        }

        self.tail.extend_from_slice(chunk);
        if self.tail.len() > V1_TAG_LEN {
            let cut = self.tail.len() - V1_TAG_LEN;
            self.tail.drain(..cut);
        }
    }

    /// Ends the stream and parses whatever was captured. ID3v2 fields win;
    /// an ID3v1 trailer fills in whatever v2 left absent.
    pub fn finish(self) -> TagPartial {
        let mut partial = parse_v2(&self.head).unwrap_or_default();
        if self.total_len >= V1_TAG_LEN as u64
            && let Some(v1) = parse_v1(&self.tail)
        {
            partial.fill_from(v1);
        }
        if partial.is_empty() {
            debug!(target: "extract::worker", "no usable ID3 data found");
        }
        partial
    }
}

fn v2_tag_size(header: &[u8]) -> Option<usize> {
    if header.len() < V2_HEADER_LEN || &header[0..3] != b"ID3" {
        return None;
    }
    syncsafe_u32(&header[6..10]).map(|size| size as usize)
}

fn syncsafe_u32(bytes: &[u8]) -> Option<u32> {
    if bytes.len() < 4 || bytes.iter().take(4).any(|b| b & 0x80 != 0) {
        return None;
    }
    Some(
        (u32::from(bytes[0]) << 21)
            | (u32::from(bytes[1]) << 14)
            | (u32::from(bytes[2]) << 7)
            | u32::from(bytes[3]),
    )
}

fn be_u32(bytes: &[u8]) -> u32 {
    u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]])
}

/// Reverses the ID3v2 unsynchronisation scheme: a 0x00 directly after
/// 0xFF was inserted on write and is dropped here.
fn remove_unsync(data: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(data.len());
    let mut prev_ff = false;
    for &byte in data {
        if prev_ff && byte == 0x00 {
            prev_ff = false;
            continue;
        }
        prev_ff = byte == 0xFF;
        out.push(byte);
    }
    out
}

fn parse_v2(head: &[u8]) -> Option<TagPartial> {
    if head.len() < V2_HEADER_LEN || &head[0..3] != b"ID3" {
        return None;
    }
    let major = head[3];
    if major != 3 && major != 4 {
        trace!(target: "extract::worker", version = major, "unsupported ID3v2 revision");
        return None;
    }
    let flags = head[5];
    let declared = v2_tag_size(head)?;
    let available = head.len().min(V2_HEADER_LEN + declared);
    let mut body = head[V2_HEADER_LEN..available].to_vec();
    if flags & 0x80 != 0 {
        body = remove_unsync(&body);
    }

    let mut pos = 0usize;
    if flags & 0x40 != 0 {
        // Extended header: v2.4 sizes include themselves, v2.3 sizes do
        // not include the 4 length bytes.
        if body.len() < 4 {
            return None;
        }
        pos = if major == 4 {
            syncsafe_u32(&body[0..4])? as usize
        } else {
            4 + be_u32(&body[0..4]) as usize
        };
    }

    let mut partial = TagPartial::default();
    while pos + 10 <= body.len() {
        let id = &body[pos..pos + 4];
        if id[0] == 0 {
            // Padding reached.
            break;
        }
        let frame_size = if major == 4 {
            match syncsafe_u32(&body[pos + 4..pos + 8]) {
                Some(size) => size as usize,
                None => break,
            }
        } else {
            be_u32(&body[pos + 4..pos + 8]) as usize
        };
        let format_flags = body[pos + 9];
        let start = pos + 10;
        let end = match start.checked_add(frame_size) {
            Some(end) if end <= body.len() => end,
            // Frame runs past the buffered prefix (size limit cut it off).
            _ => break,
        };
        let mut data = body[start..end].to_vec();
        if major == 4 && format_flags & 0x02 != 0 {
            data = remove_unsync(&data);
        }

        // First occurrence of each frame wins.
        match id {
            b"TIT2" if partial.title.is_none() => partial.title = decode_text(&data),
            b"TPE1" if partial.artist.is_none() => partial.artist = decode_text(&data),
            b"TALB" if partial.album.is_none() => partial.album = decode_text(&data),
            b"TRCK" if partial.track.is_none() => {
                partial.track = decode_text(&data).and_then(parse_track);
            }
            b"TYER" | b"TDRC" if partial.year.is_none() => {
                partial.year = decode_text(&data).and_then(parse_year);
            }
            _ => {}
        }
        pos = end;
    }

    if partial.is_empty() { None } else { Some(partial) }
}

/// Decodes an ID3v2 text frame: one encoding byte, then the value.
fn decode_text(data: &[u8]) -> Option<String> {
    let (&encoding, rest) = data.split_first()?;
    let decoded = match encoding {
        0 => rest.iter().map(|&b| b as char).collect::<String>(),
        1 => decode_utf16_with_bom(rest)?,
        2 => decode_utf16(rest, false)?,
        3 => String::from_utf8_lossy(rest).into_owned(),
        _ => return None,
    };
    // v2.4 packs multiple values NUL-separated; the first one is ours.
    let value = decoded.split('\0').next().unwrap_or("").trim();
    if value.is_empty() {
        None
    } else {
        Some(value.to_string())
    }
}

fn decode_utf16_with_bom(data: &[u8]) -> Option<String> {
    match data {
        [0xFF, 0xFE, rest @ ..] => decode_utf16(rest, true),
        [0xFE, 0xFF, rest @ ..] => decode_utf16(rest, false),
        rest => decode_utf16(rest, true),
    }
}

fn decode_utf16(data: &[u8], little_endian: bool) -> Option<String> {
    let units: Vec<u16> = data
        .chunks_exact(2)
        .map(|pair| {
            if little_endian {
                u16::from_le_bytes([pair[0], pair[1]])
            } else {
                u16::from_be_bytes([pair[0], pair[1]])
            }
        })
        .collect();
    Some(String::from_utf16_lossy(&units))
}

/// "3" and "3/12" both mean track 3.
fn parse_track(text: String) -> Option<u32> {
    text.split('/').next()?.trim().parse().ok()
}

/// TYER carries a bare year; TDRC a timestamp starting with one.
fn parse_year(text: String) -> Option<u32> {
    let digits: String = text.chars().take_while(char::is_ascii_digit).collect();
    if digits.len() == 4 { digits.parse().ok() } else { None }
}

fn parse_v1(tail: &[u8]) -> Option<TagPartial> {
    if tail.len() < V1_TAG_LEN || &tail[0..3] != b"TAG" {
        return None;
    }
    let mut partial = TagPartial {
        title: latin1_field(&tail[3..33]),
        artist: latin1_field(&tail[33..63]),
        album: latin1_field(&tail[63..93]),
        year: latin1_field(&tail[93..97]).and_then(|y| y.parse().ok()),
        track: None,
    };
    // ID3v1.1: a zero byte before the last comment byte marks it as the
    // track number.
    if tail[125] == 0 && tail[126] != 0 {
        partial.track = Some(u32::from(tail[126]));
    }
    if partial.is_empty() { None } else { Some(partial) }
}

fn latin1_field(bytes: &[u8]) -> Option<String> {
    let text: String = bytes
        .iter()
        .take_while(|&&b| b != 0)
        .map(|&b| b as char)
        .collect();
    let trimmed = text.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}

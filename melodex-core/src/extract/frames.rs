//! Incremental MPEG audio frame scanning.
//!
//! Walks the byte stream frame by frame: locate a sync word, decode the
//! header, skip the frame body (even across chunk boundaries), repeat.
//! A leading ID3v2 block is skipped wholesale so tag payloads cannot
//! produce false syncs. Duration accumulates per frame in microseconds.

use tracing::trace;

/// Frame-derived half of a metadata record.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FramePartial {
    pub duration_ms: Option<u64>,
    pub format: Option<String>,
}

impl FramePartial {
    pub fn is_empty(&self) -> bool {
        self.duration_ms.is_none() && self.format.is_none()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum MpegVersion {
    V1,
    V2,
    V25,
}

impl MpegVersion {
    fn label(self) -> &'static str {
        match self {
            MpegVersion::V1 => "1",
            MpegVersion::V2 => "2",
            MpegVersion::V25 => "2.5",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Layer {
    I,
    II,
    III,
}

impl Layer {
    fn label(self) -> &'static str {
        match self {
            Layer::I => "I",
            Layer::II => "II",
            Layer::III => "III",
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct FrameHeader {
    version: MpegVersion,
    layer: Layer,
    bitrate_kbps: u32,
    sample_rate: u32,
    frame_len: usize,
    samples: u32,
}

const BITRATES_V1_L1: [u32; 14] = [
    32, 64, 96, 128, 160, 192, 224, 256, 288, 320, 352, 384, 416, 448,
];
const BITRATES_V1_L2: [u32; 14] = [
    32, 48, 56, 64, 80, 96, 112, 128, 160, 192, 224, 256, 320, 384,
];
const BITRATES_V1_L3: [u32; 14] = [
    32, 40, 48, 56, 64, 80, 96, 112, 128, 160, 192, 224, 256, 320,
];
const BITRATES_V2_L1: [u32; 14] = [
    32, 48, 56, 64, 80, 96, 112, 128, 144, 160, 176, 192, 224, 256,
];
const BITRATES_V2_L23: [u32; 14] = [8, 16, 24, 32, 40, 48, 56, 64, 80, 96, 112, 128, 144, 160];

fn parse_frame_header(bytes: &[u8]) -> Option<FrameHeader> {
    if bytes.len() < 4 || bytes[0] != 0xFF || bytes[1] & 0xE0 != 0xE0 {
        return None;
    }
    let version = match (bytes[1] >> 3) & 0x03 {
        0b00 => MpegVersion::V25,
        0b10 => MpegVersion::V2,
        0b11 => MpegVersion::V1,
        _ => return None,
    };
    let layer = match (bytes[1] >> 1) & 0x03 {
        0b01 => Layer::III,
        0b10 => Layer::II,
        0b11 => Layer::I,
        _ => return None,
    };
    let bitrate_index = (bytes[2] >> 4) & 0x0F;
    // Index 0 is "free format": the frame length is unknowable without
    // scanning for the next sync, so treat it as no frame.
    if bitrate_index == 0 || bitrate_index == 0x0F {
        return None;
    }
    let table = match (version, layer) {
        (MpegVersion::V1, Layer::I) => &BITRATES_V1_L1,
        (MpegVersion::V1, Layer::II) => &BITRATES_V1_L2,
        (MpegVersion::V1, Layer::III) => &BITRATES_V1_L3,
        (_, Layer::I) => &BITRATES_V2_L1,
        (_, _) => &BITRATES_V2_L23,
    };
    let bitrate_kbps = table[usize::from(bitrate_index) - 1];

    let sample_rate = match (version, (bytes[2] >> 2) & 0x03) {
        (MpegVersion::V1, 0) => 44_100,
        (MpegVersion::V1, 1) => 48_000,
        (MpegVersion::V1, 2) => 32_000,
        (MpegVersion::V2, 0) => 22_050,
        (MpegVersion::V2, 1) => 24_000,
        (MpegVersion::V2, 2) => 16_000,
        (MpegVersion::V25, 0) => 11_025,
        (MpegVersion::V25, 1) => 12_000,
        (MpegVersion::V25, 2) => 8_000,
        _ => return None,
    };
    let padding = u32::from((bytes[2] >> 1) & 0x01);

    let bitrate = bitrate_kbps * 1000;
    let (frame_len, samples) = match layer {
        Layer::I => ((12 * bitrate / sample_rate + padding) * 4, 384),
        Layer::II => (144 * bitrate / sample_rate + padding, 1152),
        Layer::III => match version {
            MpegVersion::V1 => (144 * bitrate / sample_rate + padding, 1152),
            _ => (72 * bitrate / sample_rate + padding, 576),
        },
    };
    if frame_len < 4 {
        return None;
    }
    Some(FrameHeader {
        version,
        layer,
        bitrate_kbps,
        sample_rate,
        frame_len: frame_len as usize,
        samples,
    })
}

/// Streaming MPEG frame scanner for one file.
#[derive(Debug)]
pub struct FrameScanner {
    /// Bytes of the current frame body still to be consumed before the
    /// next header can start.
    skip: u64,
    /// Unconsumed carry, at most a few header bytes long outside the
    /// initial prefix check.
    buf: Vec<u8>,
    prefix_checked: bool,
    frames: u64,
    duration_micros: u64,
    first: Option<FrameHeader>,
    min_bitrate: u32,
    max_bitrate: u32,
}

impl FrameScanner {
    pub fn new() -> Self {
        Self {
            skip: 0,
            buf: Vec::new(),
            prefix_checked: false,
            frames: 0,
            duration_micros: 0,
            first: None,
            min_bitrate: u32::MAX,
            max_bitrate: 0,
        }
    }

    /// Feeds the next chunk of the file, in stream order.
    pub fn push(&mut self, chunk: &[u8]) {
        let mut data = chunk;
        if self.skip > 0 {
            let take = self.skip.min(data.len() as u64) as usize;
            self.skip -= take as u64;
            data = &data[take..];
        }
        if data.is_empty() {
            return;
        }
        self.buf.extend_from_slice(data);
        self.scan_buffer();
    }

    /// Ends the stream and reports what the frame walk found. A file with
    /// no valid frames yields an empty partial.
    pub fn finish(self) -> FramePartial {
        let Some(first) = self.first else {
            return FramePartial::default();
        };
        let bitrate = if self.min_bitrate == self.max_bitrate {
            format!("{} kbit/s", first.bitrate_kbps)
        } else {
            "VBR".to_string()
        };
        FramePartial {
            duration_ms: Some(self.duration_micros / 1000),
            format: Some(format!(
                "MPEG {} Layer {} {} {} Hz",
                first.version.label(),
                first.layer.label(),
                bitrate,
                first.sample_rate
            )),
        }
    }

    fn scan_buffer(&mut self) {
        if !self.prefix_checked && !self.consume_id3_prefix() {
            return;
        }
        let mut pos = 0usize;
        while pos + 4 <= self.buf.len() {
            match parse_frame_header(&self.buf[pos..pos + 4]) {
                Some(header) => {
                    self.record_frame(header);
                    let end = pos + header.frame_len;
                    if end <= self.buf.len() {
                        pos = end;
                    } else {
                        // Frame body spills into later chunks.
                        self.skip = (end - self.buf.len()) as u64;
                        pos = self.buf.len();
                    }
                }
                // Not a header here; resync one byte at a time.
                None => pos += 1,
            }
        }
        self.buf.drain(..pos);
    }

    /// Skips a leading ID3v2 block before any sync search happens. Returns
    /// false while more bytes are needed to decide.
    fn consume_id3_prefix(&mut self) -> bool {
        if self.buf.len() < 10 {
            return false;
        }
        if &self.buf[0..3] == b"ID3" {
            let size = (u32::from(self.buf[6] & 0x7F) << 21)
                | (u32::from(self.buf[7] & 0x7F) << 14)
                | (u32::from(self.buf[8] & 0x7F) << 7)
                | u32::from(self.buf[9] & 0x7F);
            let total = 10 + size as usize;
            trace!(target: "extract::worker", tag_bytes = total, "skipping ID3v2 prefix");
            if total <= self.buf.len() {
                self.buf.drain(..total);
            } else {
                self.skip = (total - self.buf.len()) as u64;
                self.buf.clear();
            }
        }
        self.prefix_checked = true;
        self.skip == 0
    }

    fn record_frame(&mut self, header: FrameHeader) {
        self.frames += 1;
        self.duration_micros +=
            u64::from(header.samples) * 1_000_000 / u64::from(header.sample_rate);
        self.min_bitrate = self.min_bitrate.min(header.bitrate_kbps);
        self.max_bitrate = self.max_bitrate.max(header.bitrate_kbps);
        if self.first.is_none() {
            self.first = Some(header);
        }
    }
}

impl Default for FrameScanner {
    fn default() -> Self {
        Self::new()
    }
}

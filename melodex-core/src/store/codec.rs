//! Line-delimited JSON codec for persisted metadata files.
//!
//! A `.mdt` file is a plain sequence of JSON objects, one record per line,
//! with no enclosing array. The parser is streaming and resumable: it can
//! be fed chunks of any size, carries an incomplete trailing line across
//! calls, and emits records as soon as their line closes. A malformed line
//! is a recoverable, per-record fault; a carried line that outgrows the
//! configured cap poisons the stream.

use melodex_model::{MediumIdentity, MetadataRecord};

use crate::error::Result;

/// Parser state carried across `process_chunk` calls for one file read.
#[derive(Debug, Default)]
pub struct ParseState {
    carry: Vec<u8>,
    lines_seen: u64,
    poisoned: bool,
}

impl ParseState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bytes of the incomplete trailing record currently carried.
    pub fn carried(&self) -> usize {
        self.carry.len()
    }
}

/// A single malformed record that was skipped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordFault {
    pub line: u64,
    pub message: String,
}

/// A structurally unrecoverable stream condition. The reader stops here.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamFault {
    pub line: u64,
    pub message: String,
}

/// Everything one chunk produced.
#[derive(Debug, Default)]
pub struct ChunkOutcome {
    pub records: Vec<MetadataRecord>,
    pub faults: Vec<RecordFault>,
    pub terminal: Option<StreamFault>,
    /// Bytes of an incomplete final record left at end of stream. Not a
    /// fault: the record will be complete on a later read once the writer
    /// finishes appending it.
    pub truncated_tail: usize,
}

/// Feed one chunk through the parser.
///
/// `max_carry` bounds the incomplete trailing line the state may hold;
/// exceeding it yields a terminal fault. `is_last` marks end of stream:
/// a final line without a trailing newline is still parsed, and anything
/// unparseable there is reported as `truncated_tail`.
pub fn process_chunk(
    state: &mut ParseState,
    chunk: &[u8],
    medium: &MediumIdentity,
    is_last: bool,
    max_carry: usize,
) -> ChunkOutcome {
    let mut outcome = ChunkOutcome::default();

    if state.poisoned {
        outcome.terminal = Some(StreamFault {
            line: state.lines_seen,
            message: "stream already poisoned".into(),
        });
        return outcome;
    }

    state.carry.extend_from_slice(chunk);

    while let Some(pos) = state.carry.iter().position(|&b| b == b'\n') {
        let line: Vec<u8> = state.carry.drain(..=pos).collect();
        let line = &line[..line.len() - 1];
        state.lines_seen += 1;
        decode_line(line, medium, state.lines_seen, &mut outcome);
    }

    if state.carry.len() > max_carry {
        state.poisoned = true;
        outcome.terminal = Some(StreamFault {
            line: state.lines_seen + 1,
            message: format!(
                "carried record exceeds {max_carry} bytes without closing"
            ),
        });
        return outcome;
    }

    if is_last && !state.carry.is_empty() {
        // Writers terminate every record with a newline, but tolerate a
        // complete final line that lacks one.
        let tail: Vec<u8> = std::mem::take(&mut state.carry);
        state.lines_seen += 1;
        let faults_before = outcome.faults.len();
        decode_line(&tail, medium, state.lines_seen, &mut outcome);
        if outcome.faults.len() > faults_before {
            // The tail did not decode: treat it as a truncated in-progress
            // append rather than a malformed record.
            outcome.faults.pop();
            outcome.truncated_tail = tail.len();
        }
    }

    outcome
}

fn decode_line(
    line: &[u8],
    medium: &MediumIdentity,
    line_no: u64,
    outcome: &mut ChunkOutcome,
) {
    if line.iter().all(|b| b.is_ascii_whitespace()) {
        return;
    }
    match serde_json::from_slice::<MetadataRecord>(line) {
        Ok(mut record) => {
            record.medium.get_or_insert_with(|| medium.uri.clone());
            outcome.records.push(record);
        }
        Err(e) => {
            outcome.faults.push(RecordFault {
                line: line_no,
                message: e.to_string(),
            });
        }
    }
}

/// Serialize one record as a single metadata line, newline terminated.
/// String fields round-trip through JSON escaping, quotes included.
pub fn encode_record(record: &MetadataRecord) -> Result<String> {
    let mut line = serde_json::to_string(record)?;
    line.push('\n');
    Ok(line)
}

/// Serialize a batch of records into one appendable block.
pub fn encode_batch(records: &[MetadataRecord]) -> Result<String> {
    let mut block = String::new();
    for record in records {
        block.push_str(&encode_record(record)?);
    }
    Ok(block)
}

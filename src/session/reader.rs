use super::handle::SessionId;
use super::registry::{SessionRecord, SessionRegistry};
use super::SessionStatus;
use crate::error::AppError;
use serde::Serialize;
use std::sync::Arc;
use std::time::Instant;
use tracing::debug;

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OutputChunk {
    pub pid: SessionId,
    pub chunk: String,
    pub status: SessionStatus,
    pub exit_code: Option<i32>,
    /// True once the session is terminal and every byte has been delivered.
    pub drained: bool,
}

/// Cursor-based, non-blocking reads of a session's captured output.
#[derive(Debug, Clone)]
pub struct OutputReader {
    registry: Arc<SessionRegistry>,
}

impl OutputReader {
    pub fn new(registry: Arc<SessionRegistry>) -> Self {
        Self { registry }
    }

    pub async fn read(&self, id: SessionId) -> Result<OutputChunk, AppError> {
        let chunk = self.registry.with_record(id, take_unread).await?;
        debug!(sid = %id, bytes = chunk.chunk.len(), status = %chunk.status, "Output read");
        Ok(chunk)
    }
}

fn take_unread(record: &mut SessionRecord) -> OutputChunk {
    let terminal = record.status.is_terminal();
    let pending = &record.output[record.read_cursor..];
    // A running process may still be mid-way through a multi-byte character.
    let take = if terminal { pending.len() } else { complete_utf8_prefix(pending) };
    let chunk = String::from_utf8_lossy(&pending[..take]).into_owned();
    record.read_cursor += take;

    let drained = terminal && record.read_cursor == record.output.len();
    if drained && record.drained_at.is_none() {
        record.drained_at = Some(Instant::now());
    }

    OutputChunk {
        pid: record.id,
        chunk,
        status: record.status,
        exit_code: record.exit_code,
        drained,
    }
}

/// Length of the longest prefix of `bytes` that does not end inside a UTF-8 sequence.
fn complete_utf8_prefix(bytes: &[u8]) -> usize {
    let len = bytes.len();
    // Walk back over at most three continuation bytes to find the last lead byte.
    for back in 1..=len.min(4) {
        let byte = bytes[len - back];
        if byte & 0b1100_0000 == 0b1000_0000 {
            continue;
        }
        let width = match byte {
            b if b & 0b1000_0000 == 0 => 1,
            b if b & 0b1110_0000 == 0b1100_0000 => 2,
            b if b & 0b1111_0000 == 0b1110_0000 => 3,
            b if b & 0b1111_1000 == 0b1111_0000 => 4,
            // Not a valid lead byte; nothing to wait for.
            _ => return len,
        };
        return if back >= width { len } else { len - back };
    }
    len
}

use tracing::warn;

use crate::error::RelayResult;
use crate::types::Record;

/// Hard size limit of one event stream message.
pub const EVENT_STREAM_MAX_BYTES: usize = 1024 * 1024;

/// Room left below the hard limit for message framing and properties.
pub const EVENT_STREAM_SAFETY_MARGIN: usize = 64 * 1024;

/// Largest payload packed into one message.
pub const DEFAULT_CHUNK_BYTES: usize = EVENT_STREAM_MAX_BYTES - EVENT_STREAM_SAFETY_MARGIN;

/// A compact JSON array of whole records.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Chunk {
    pub payload: String,
    pub records: usize,
}

/// Packs records greedily, in order, into JSON arrays of at most `max_bytes` bytes.
///
/// Records are never split. A record that does not fit into an empty chunk is sent alone in a
/// chunk of its own, which is then larger than `max_bytes`.
pub fn chunk_records(records: &[Record], max_bytes: usize) -> RelayResult<Vec<Chunk>> {
    let mut chunks = Vec::new();
    let mut payload = String::from("[");
    let mut count = 0;

    for record in records {
        let encoded = serde_json::to_string(record)?;
        // Opening bracket and commas are already in `payload`; one more byte closes the array.
        let separator = usize::from(count > 0);

        if count > 0 && payload.len() + separator + encoded.len() + 1 > max_bytes {
            chunks.push(close(payload, count));
            payload = String::from("[");
            count = 0;
        }

        if count == 0 && encoded.len() + 2 > max_bytes {
            warn!(
                bytes = encoded.len() + 2,
                limit = max_bytes,
                "single record exceeds the chunk size limit, sending it alone"
            );
        }

        if count > 0 {
            payload.push(',');
        }
        payload.push_str(&encoded);
        count += 1;
    }

    if count > 0 {
        chunks.push(close(payload, count));
    }

    Ok(chunks)
}

fn close(mut payload: String, records: usize) -> Chunk {
    payload.push(']');
    Chunk { payload, records }
}

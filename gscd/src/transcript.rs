//! Rolling transcript buffer and output fan-out.
//!
//! This is the primitive the process bridge publishes through: one append
//! path feeding both a bounded in-memory transcript and a broadcast channel.
//! Append and send happen under a single lock, so a subscriber taking a tail
//! snapshot at the same moment can never observe a gap between the snapshot
//! and its first live chunk. The same lock guards the run generation: a
//! publish tagged with a superseded generation is refused, so a reader task
//! still draining a killed run's pipe cannot write into the next run's
//! transcript.

use std::sync::Mutex;

use tokio::sync::broadcast;
use tracing::warn;

const CHANNEL_BUFFER: usize = 256;

/// Transcript buffer plus live subscriber fan-out.
///
/// Chunks are canonical UTF-8. A slow subscriber lags on the broadcast
/// channel and misses chunks (logged on its own receive path); it never
/// blocks the publisher.
pub struct OutputHub {
    inner: Mutex<HubInner>,
    limit: usize,
}

struct HubInner {
    buffer: Vec<u8>,
    sender: broadcast::Sender<String>,
    generation: u64,
}

impl OutputHub {
    /// Create a hub whose transcript is capped at `limit` bytes.
    pub fn new(limit: usize) -> Self {
        let (sender, _) = broadcast::channel(CHANNEL_BUFFER);
        Self {
            inner: Mutex::new(HubInner {
                buffer: Vec::new(),
                sender,
                generation: 0,
            }),
            limit,
        }
    }

    /// Begin a new run: clear the transcript and advance the accepted
    /// generation. Called exactly when a new child spawns. Existing
    /// subscribers stay attached across the reset.
    pub fn reset_for(&self, generation: u64) {
        let mut inner = self.inner.lock().unwrap();
        inner.buffer.clear();
        inner.generation = generation;
    }

    /// Append a chunk to the transcript and deliver it to live subscribers,
    /// provided `generation` is still the current run. Returns `false` (and
    /// publishes nothing) when the run has been superseded.
    ///
    /// When the buffer would exceed the cap, the oldest bytes are trimmed
    /// from the front.
    pub fn publish_from(&self, generation: u64, chunk: &str) -> bool {
        if chunk.is_empty() {
            return true;
        }
        let mut inner = self.inner.lock().unwrap();
        if inner.generation != generation {
            return false;
        }
        inner.buffer.extend_from_slice(chunk.as_bytes());
        if inner.buffer.len() > self.limit {
            let excess = inner.buffer.len() - self.limit;
            let cut = ceil_char_boundary(&inner.buffer, excess);
            inner.buffer.drain(..cut);
        }
        // Err means no live subscribers, which is fine; the transcript is
        // the history for whoever connects later.
        let _ = inner.sender.send(chunk.to_string());
        true
    }

    /// Deliver a chunk to live subscribers without touching the transcript.
    ///
    /// Used for command echoes, which are console chatter rather than
    /// process output.
    pub fn broadcast_only(&self, chunk: &str) {
        let inner = self.inner.lock().unwrap();
        let _ = inner.sender.send(chunk.to_string());
    }

    /// Most recent `max_bytes` of transcript, cut forward to a char boundary.
    pub fn tail(&self, max_bytes: usize) -> String {
        let inner = self.inner.lock().unwrap();
        tail_of(&inner.buffer, max_bytes)
    }

    /// Point-in-time-consistent tail snapshot plus a live receiver.
    ///
    /// The receiver's stream starts exactly after the snapshot: both are
    /// taken under the hub lock, and the publisher appends and sends under
    /// that same lock. No gap, no duplicated chunk.
    pub fn subscribe_with_tail(&self, max_bytes: usize) -> (String, broadcast::Receiver<String>) {
        let inner = self.inner.lock().unwrap();
        (tail_of(&inner.buffer, max_bytes), inner.sender.subscribe())
    }

    /// Live receiver only, no history.
    pub fn subscribe(&self) -> broadcast::Receiver<String> {
        self.inner.lock().unwrap().sender.subscribe()
    }

    /// Current transcript size in bytes.
    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().buffer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn tail_of(buffer: &[u8], max_bytes: usize) -> String {
    let start = buffer.len().saturating_sub(max_bytes);
    let start = ceil_char_boundary(buffer, start);
    String::from_utf8_lossy(&buffer[start..]).into_owned()
}

/// Smallest index `>= at` that falls on a UTF-8 sequence start. The buffer
/// only ever holds concatenated valid UTF-8, so this always terminates at or
/// before `buffer.len()`.
fn ceil_char_boundary(buffer: &[u8], at: usize) -> usize {
    let mut index = at.min(buffer.len());
    while index < buffer.len() && (buffer[index] & 0xC0) == 0x80 {
        index += 1;
    }
    index
}

/// Log a lagged receive the way one delivery failure is meant to be handled:
/// locally, without disturbing the stream.
pub fn note_lagged(skipped: u64) {
    warn!(skipped, "console subscriber lagged; dropping missed chunks");
}

//! Notification streams and per-stream sequence dedup.

use std::collections::HashMap;
use std::fmt;

// ---------------------------------------------------------------------------
// StreamKey
// ---------------------------------------------------------------------------

/// The independent notification streams.  Each has its own sequence space.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StreamKey {
    State,
    Transcript,
    TranscriptError,
    Sidecar,
    Model,
    Audio,
    Recording,
}

impl StreamKey {
    pub const ALL: [StreamKey; 7] = [
        StreamKey::State,
        StreamKey::Transcript,
        StreamKey::TranscriptError,
        StreamKey::Sidecar,
        StreamKey::Model,
        StreamKey::Audio,
        StreamKey::Recording,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            StreamKey::State => "state",
            StreamKey::Transcript => "transcript",
            StreamKey::TranscriptError => "transcriptError",
            StreamKey::Sidecar => "sidecar",
            StreamKey::Model => "model",
            StreamKey::Audio => "audio",
            StreamKey::Recording => "recording",
        }
    }

    /// Stream for a canonical `topic:event` method name.
    ///
    /// ```
    /// use voice_sidecar::dispatch::StreamKey;
    ///
    /// assert_eq!(StreamKey::for_method("transcript:complete"), Some(StreamKey::Transcript));
    /// assert_eq!(StreamKey::for_method("transcript:error"), Some(StreamKey::TranscriptError));
    /// assert_eq!(StreamKey::for_method("weather:report"), None);
    /// ```
    pub fn for_method(method: &str) -> Option<Self> {
        let (topic, event) = method.split_once(':')?;
        let key = match (topic, event) {
            ("transcript", "error") => StreamKey::TranscriptError,
            ("transcript", _) => StreamKey::Transcript,
            ("state", _) => StreamKey::State,
            ("sidecar", _) => StreamKey::Sidecar,
            ("model", _) => StreamKey::Model,
            ("audio", _) => StreamKey::Audio,
            ("recording", _) => StreamKey::Recording,
            _ => return None,
        };
        Some(key)
    }
}

impl fmt::Display for StreamKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// SequenceTracker
// ---------------------------------------------------------------------------

/// Result of offering a sequence number to the tracker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SeqVerdict {
    /// Strictly newer than anything seen on this stream.
    Accepted,
    /// No `seq` on the event; producers predating sequencing are trusted.
    Unsequenced,
    /// `seq` not greater than `last`; drop.
    Stale { last: i64 },
}

impl SeqVerdict {
    pub fn is_accepted(&self) -> bool {
        !matches!(self, SeqVerdict::Stale { .. })
    }
}

/// Last accepted `seq` per stream.  Reset when the worker restarts, since a
/// new process starts its own sequence space.
#[derive(Debug, Default)]
pub struct SequenceTracker {
    last: HashMap<StreamKey, i64>,
}

impl SequenceTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn offer(&mut self, stream: StreamKey, seq: Option<i64>) -> SeqVerdict {
        let Some(seq) = seq else {
            return SeqVerdict::Unsequenced;
        };
        match self.last.get(&stream) {
            Some(&last) if seq <= last => SeqVerdict::Stale { last },
            _ => {
                self.last.insert(stream, seq);
                SeqVerdict::Accepted
            }
        }
    }

    pub fn last_seq(&self, stream: StreamKey) -> Option<i64> {
        self.last.get(&stream).copied()
    }

    pub fn reset(&mut self) {
        self.last.clear();
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn duplicate_and_older_sequences_are_dropped() {
        let mut tracker = SequenceTracker::new();
        let accepted: Vec<i64> = [5, 5, 3, 6]
            .into_iter()
            .filter(|&s| tracker.offer(StreamKey::Transcript, Some(s)).is_accepted())
            .collect();
        assert_eq!(accepted, vec![5, 6]);
        assert_eq!(tracker.last_seq(StreamKey::Transcript), Some(6));
    }

    #[test]
    fn missing_seq_is_always_accepted() {
        let mut tracker = SequenceTracker::new();
        tracker.offer(StreamKey::State, Some(100));
        assert_eq!(tracker.offer(StreamKey::State, None), SeqVerdict::Unsequenced);
        assert_eq!(tracker.last_seq(StreamKey::State), Some(100));
    }

    #[test]
    fn streams_are_independent() {
        let mut tracker = SequenceTracker::new();
        assert_eq!(tracker.offer(StreamKey::Audio, Some(10)), SeqVerdict::Accepted);
        assert_eq!(tracker.offer(StreamKey::Model, Some(1)), SeqVerdict::Accepted);
        assert_eq!(
            tracker.offer(StreamKey::Audio, Some(9)),
            SeqVerdict::Stale { last: 10 }
        );
    }

    #[test]
    fn reset_starts_a_new_sequence_space() {
        let mut tracker = SequenceTracker::new();
        tracker.offer(StreamKey::Transcript, Some(50));
        tracker.reset();
        assert_eq!(tracker.offer(StreamKey::Transcript, Some(1)), SeqVerdict::Accepted);
    }

    #[test]
    fn method_topics_map_to_streams() {
        assert_eq!(StreamKey::for_method("state:changed"), Some(StreamKey::State));
        assert_eq!(StreamKey::for_method("audio:level"), Some(StreamKey::Audio));
        assert_eq!(StreamKey::for_method("model:progress"), Some(StreamKey::Model));
        assert_eq!(StreamKey::for_method("recording:status"), Some(StreamKey::Recording));
        assert_eq!(StreamKey::for_method("sidecar:status"), Some(StreamKey::Sidecar));
        assert_eq!(StreamKey::for_method("no-colon"), None);
    }
}

//! Gapless playback scheduling
//!
//! Model audio arrives in chunks at irregular network intervals. Each
//! chunk is scheduled at the later of the play-head and the sink's
//! current time, and the play-head advances by the chunk's duration, so
//! chunks play back to back without overlapping.

use std::collections::BTreeMap;
use std::time::Duration;

use tracing::{debug, warn};

use crate::audio_io::{AudioError, BufferId, OutputSink, PlaybackBuffer};
use crate::frame::DecodedAudio;

/// Time span a scheduled buffer occupies on the sink clock.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScheduledSpan {
    pub start: Duration,
    pub duration: Duration,
}

impl ScheduledSpan {
    pub fn end(&self) -> Duration {
        self.start + self.duration
    }
}

/// Owns the play-head clock and the set of buffers still playing.
pub struct PlaybackScheduler {
    sink: Box<dyn OutputSink>,
    playback_rate: f32,
    playhead: Duration,
    next_id: BufferId,
    outstanding: BTreeMap<BufferId, ScheduledSpan>,
}

impl PlaybackScheduler {
    pub fn new(sink: Box<dyn OutputSink>, playback_rate: f32) -> Self {
        Self {
            sink,
            playback_rate,
            playhead: Duration::ZERO,
            next_id: 0,
            outstanding: BTreeMap::new(),
        }
    }

    /// Schedule decoded audio right after whatever is already queued.
    pub fn enqueue(&mut self, audio: DecodedAudio) -> Result<ScheduledSpan, AudioError> {
        let now = self.sink.current_time();
        let start = self.playhead.max(now);

        let id = self.next_id;
        self.next_id += 1;

        let buffer = PlaybackBuffer {
            id,
            samples: audio.samples,
            sample_rate: audio.sample_rate,
            playback_rate: self.playback_rate,
            start,
        };
        let duration = buffer.duration();
        self.sink.schedule(buffer)?;

        let span = ScheduledSpan { start, duration };
        self.playhead = span.end();
        self.outstanding.insert(id, span);
        debug!(
            "Scheduled buffer {} at {:?} for {:?} ({} outstanding)",
            id,
            start,
            duration,
            self.outstanding.len()
        );
        Ok(span)
    }

    /// Completion notification from the sink.
    pub fn on_complete(&mut self, id: BufferId) {
        if self.outstanding.remove(&id).is_none() {
            // Cancelled by an interruption before the sink reported it.
            debug!("Completion for unknown buffer {}", id);
        }
    }

    /// Silence everything and restart the play-head. Idempotent.
    pub fn interrupt(&mut self) {
        if !self.outstanding.is_empty() {
            debug!("Interrupting {} scheduled buffers", self.outstanding.len());
        }
        self.sink.cancel_all();
        self.outstanding.clear();
        self.playhead = Duration::ZERO;
    }

    pub fn playhead(&self) -> Duration {
        self.playhead
    }

    pub fn outstanding(&self) -> usize {
        self.outstanding.len()
    }
}

impl Drop for PlaybackScheduler {
    fn drop(&mut self) {
        if !self.outstanding.is_empty() {
            warn!("Dropping scheduler with {} buffers outstanding", self.outstanding.len());
            self.sink.cancel_all();
        }
    }
}

//! # Frame Buffering
//!
//! Adapts arbitrary network chunk boundaries to the fixed frame size the
//! inference step requires. Incoming sample blocks are appended to a pending
//! queue; complete frames are sliced off the front in FIFO order and whatever
//! is left waits for the next chunk.
//!
//! ## Key Properties:
//! - **Order preserving**: Frames are emitted in arrival order; the codec's
//!   streaming state would be corrupted by any reordering
//! - **Non-blocking**: Every call returns immediately with zero or more frames
//! - **Bounded residue**: After every call the pending queue holds strictly
//!   fewer than one frame's worth of samples

use std::collections::VecDeque;

/// Accumulates samples into fixed-size frames for one session.
///
/// Owned exclusively by that session's worker; no locking is needed because
/// message handling within a connection is strictly sequential.
pub struct FrameBuffer {
    /// Pending samples that do not yet form a complete frame
    pending: VecDeque<f32>,

    /// Samples per frame, fixed for the lifetime of the session
    frame_size: usize,
}

impl FrameBuffer {
    /// Create a buffer producing frames of `frame_size` samples.
    pub fn new(frame_size: usize) -> Self {
        debug_assert!(frame_size > 0, "frame size must be positive");
        Self {
            pending: VecDeque::with_capacity(frame_size * 2),
            frame_size,
        }
    }

    /// Append a sample block and drain every complete frame.
    ///
    /// Returns the frames in temporal order; the vector is empty whenever the
    /// buffered total is still short of one frame. Residue stays queued for
    /// the next call, so `0 <= len() < frame_size` holds on return.
    pub fn push_and_drain(&mut self, samples: &[f32]) -> Vec<Vec<f32>> {
        self.pending.extend(samples.iter().copied());

        let mut frames = Vec::with_capacity(self.pending.len() / self.frame_size);
        while self.pending.len() >= self.frame_size {
            let frame: Vec<f32> = self.pending.drain(..self.frame_size).collect();
            frames.push(frame);
        }

        frames
    }

    /// Number of samples waiting for the next complete frame.
    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Samples per emitted frame.
    pub fn frame_size(&self) -> usize {
        self.frame_size
    }

    /// Discard all pending samples. Frames already handed to inference are
    /// not retracted.
    pub fn clear(&mut self) {
        self.pending.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Build a ramp of distinct sample values so ordering mistakes show up.
    fn ramp(len: usize, offset: usize) -> Vec<f32> {
        (0..len).map(|i| (offset + i) as f32).collect()
    }

    #[test]
    fn test_short_input_buffers_without_output() {
        let mut buffer = FrameBuffer::new(1920);
        let frames = buffer.push_and_drain(&ramp(960, 0));
        assert!(frames.is_empty());
        assert_eq!(buffer.len(), 960);
    }

    #[test]
    fn test_exact_frame_emitted() {
        let mut buffer = FrameBuffer::new(1920);
        let frames = buffer.push_and_drain(&ramp(1920, 0));
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].len(), 1920);
        assert!(buffer.is_empty());
    }

    #[test]
    fn test_arbitrary_chunking_preserves_frames_and_order() {
        // 4 frames of 512 samples, delivered in awkward chunk sizes
        let frame_size = 512;
        let total = ramp(frame_size * 4, 0);
        let chunk_sizes = [1, 511, 512, 700, 300, 24];

        let mut buffer = FrameBuffer::new(frame_size);
        let mut emitted: Vec<f32> = Vec::new();
        let mut cursor = 0;
        let mut chunk_iter = chunk_sizes.iter().cycle();

        while cursor < total.len() {
            let take = (*chunk_iter.next().unwrap()).min(total.len() - cursor);
            let frames = buffer.push_and_drain(&total[cursor..cursor + take]);
            for frame in &frames {
                assert_eq!(frame.len(), frame_size);
            }
            for frame in frames {
                emitted.extend(frame);
            }
            assert!(buffer.len() < frame_size);
            cursor += take;
        }

        // Every sample accounted for, in original temporal order
        assert_eq!(emitted, total);
        assert!(buffer.is_empty());
    }

    #[test]
    fn test_residue_stays_below_frame_size() {
        let mut buffer = FrameBuffer::new(100);
        for chunk in [37, 37, 37, 199, 1, 99] {
            buffer.push_and_drain(&ramp(chunk, 0));
            assert!(buffer.len() < 100);
        }
    }

    #[test]
    fn test_multiple_frames_from_one_push() {
        let mut buffer = FrameBuffer::new(10);
        let frames = buffer.push_and_drain(&ramp(35, 0));
        assert_eq!(frames.len(), 3);
        assert_eq!(buffer.len(), 5);
        assert_eq!(frames[0], ramp(10, 0));
        assert_eq!(frames[1], ramp(10, 10));
        assert_eq!(frames[2], ramp(10, 20));
    }

    #[test]
    fn test_clear_discards_residue() {
        let mut buffer = FrameBuffer::new(1920);
        buffer.push_and_drain(&ramp(960, 0));
        buffer.clear();
        assert!(buffer.is_empty());

        // A fresh full frame now yields exactly one frame, no stale samples
        let frames = buffer.push_and_drain(&ramp(1920, 960));
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0], ramp(1920, 960));
        assert!(buffer.is_empty());
    }
}

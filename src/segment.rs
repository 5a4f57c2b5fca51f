//! Segment and tail bookkeeping for the streamed acquisition format.
//!
//! The device delivers fixed-size transfer chunks, but the acquisition is
//! organized as segments of sample data each followed by a tail of trailing
//! metadata, and neither size needs to divide evenly into the transfer
//! buffer size. The tracker translates consumed byte counts into
//! segment-aligned positions; it never touches the data itself.
//!
//! The schema is fixed and exhaustively declared: every field below is
//! assigned at construction and mutated only by the streaming loop.

/// Running segment/tail position of a streaming session.
#[derive(Debug, Clone, PartialEq)]
pub struct SegmentTracker {
    /// Transfer buffer size in bytes.
    buffer_size: u64,
    /// Nominal size of one segment's sample data in bytes.
    segment_size_bytes: u64,
    /// Nominal size of one segment's tail in bytes (may be zero).
    tail_size_bytes: u64,
    /// Bytes of sample data remaining in the current segment.
    bytes_to_end_segment: u64,
    /// Bytes of tail remaining in the current segment's tail region.
    bytes_to_end_tail: u64,
    /// Tail bytes carried into the next buffer when a tail is split.
    left_over_size: u64,
    /// True while a tail region spans into the next transfer buffer.
    split_tail: bool,
    /// Whether the cursor currently sits inside a tail region.
    in_tail: bool,
    /// 1-based index of the current segment.
    segment: u32,
    /// Segments remaining, including the current one.
    segment_count_down: u32,
    /// Timestamp counter frequency in Hz (diagnostics).
    tick_frequency: u64,
    /// Last device timestamp seen, in ticks.
    last_timestamp: i64,
    /// Seconds between the two most recent timestamps.
    delta_time: f64,
}

impl SegmentTracker {
    /// Create a tracker positioned at the start of segment 1.
    ///
    /// `segment_size_bytes` is the per-segment sample data size,
    /// `tail_size_bytes` the trailing metadata size (zero for untailed
    /// formats), `total_segments` the configured segment count.
    pub fn new(
        buffer_size: u64,
        segment_size_bytes: u64,
        tail_size_bytes: u64,
        total_segments: u32,
        tick_frequency: u64,
    ) -> Self {
        Self {
            buffer_size,
            segment_size_bytes,
            tail_size_bytes,
            bytes_to_end_segment: segment_size_bytes,
            bytes_to_end_tail: tail_size_bytes,
            left_over_size: 0,
            split_tail: false,
            in_tail: false,
            segment: 1,
            segment_count_down: total_segments,
            tick_frequency,
            last_timestamp: 0,
            delta_time: 0.0,
        }
    }

    /// Account for `bytes` of newly consumed stream data.
    ///
    /// Advances through segment and tail boundaries as they fall inside the
    /// chunk and returns how many segments completed. Bytes past the final
    /// segment are ignored.
    pub fn consume(&mut self, bytes: u64) -> u32 {
        let mut remaining = bytes;
        let mut completed = 0;

        while remaining > 0 && self.segment_count_down > 0 {
            if self.in_tail {
                if self.bytes_to_end_tail > remaining {
                    // tail spans into the next buffer
                    self.bytes_to_end_tail -= remaining;
                    self.left_over_size = self.bytes_to_end_tail;
                    self.split_tail = true;
                    return completed;
                }
                remaining -= self.bytes_to_end_tail;
                self.complete_segment();
                completed += 1;
            } else {
                if self.bytes_to_end_segment > remaining {
                    self.bytes_to_end_segment -= remaining;
                    return completed;
                }
                remaining -= self.bytes_to_end_segment;
                self.bytes_to_end_segment = 0;
                if self.tail_size_bytes == 0 {
                    // untailed format: segment ends with its data
                    self.complete_segment();
                    completed += 1;
                } else {
                    self.in_tail = true;
                }
            }
        }
        completed
    }

    fn complete_segment(&mut self) {
        self.segment += 1;
        self.segment_count_down -= 1;
        self.bytes_to_end_segment = self.segment_size_bytes;
        self.bytes_to_end_tail = self.tail_size_bytes;
        self.left_over_size = 0;
        self.split_tail = false;
        self.in_tail = false;
    }

    /// Record a device timestamp (in ticks) and update the inter-buffer
    /// delta. Diagnostics only.
    pub fn record_timestamp(&mut self, timestamp: i64) {
        if self.last_timestamp != 0 && self.tick_frequency > 0 {
            self.delta_time =
                (timestamp - self.last_timestamp) as f64 / self.tick_frequency as f64;
        }
        self.last_timestamp = timestamp;
    }

    /// Transfer buffer size this tracker was built for, in bytes.
    pub fn buffer_size(&self) -> u64 {
        self.buffer_size
    }

    /// Bytes of sample data remaining in the current segment.
    pub fn bytes_to_end_segment(&self) -> u64 {
        self.bytes_to_end_segment
    }

    /// Bytes remaining in the current tail region.
    pub fn bytes_to_end_tail(&self) -> u64 {
        self.bytes_to_end_tail
    }

    /// Tail bytes carried into the next buffer, when split.
    pub fn left_over_size(&self) -> u64 {
        self.left_over_size
    }

    /// True while a tail region spans two consecutive transfer buffers.
    pub fn split_tail(&self) -> bool {
        self.split_tail
    }

    /// 1-based index of the current segment.
    pub fn segment(&self) -> u32 {
        self.segment
    }

    /// Segments remaining, including the current one.
    pub fn segment_count_down(&self) -> u32 {
        self.segment_count_down
    }

    /// Seconds between the two most recent device timestamps.
    pub fn delta_time(&self) -> f64 {
        self.delta_time
    }

    /// Last device timestamp seen, in ticks.
    pub fn last_timestamp(&self) -> i64 {
        self.last_timestamp
    }
}

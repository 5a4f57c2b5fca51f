//! Device facade trait and driver-level types.
//!
//! This module defines the [`DeviceFacade`] trait that the streaming pipeline
//! drives. The real digitizer driver lives behind this trait; the crate only
//! depends on the abstract operations it must provide. Tests and the demo use
//! simulated implementations.

use bitflags::bitflags;

use crate::config::{AcquisitionConfig, ChannelConfig, TriggerConfig};
use crate::error::Result;

// =============================================================================
// Driver status codes
// =============================================================================

/// Raw driver status codes, mirrored from the vendor SDK.
///
/// Negative values are errors, with one distinguished exception:
/// [`status::STREAM_COMPLETED`] only means that no more new data will arrive.
pub mod status {
    /// The streaming acquisition completed; not an error.
    pub const STREAM_COMPLETED: i32 = -803;
    /// A transfer did not finish within the requested timeout.
    pub const TRANSFER_TIMEOUT: i32 = -802;
    /// Generic driver error.
    pub const MISC_ERROR: i32 = -1;
    /// Success.
    pub const SUCCESS: i32 = 1;
}

bitflags! {
    /// Flags reported with a completed streaming transfer.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct TransferFlags: u32 {
        /// The on-board FIFO overran; transfer data was lost.
        const FIFO_FULL = 0x0001;
    }
}

// =============================================================================
// Driver-level data types
// =============================================================================

/// Static information about the digitizer system.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SystemInfo {
    /// Board model name, for diagnostics.
    pub board_name: String,
    /// Number of input channels across all boards.
    pub channel_count: u32,
    /// Number of boards in the system.
    pub board_count: u32,
    /// Size of one sample in bytes.
    pub sample_size: u32,
}

/// Result of a completed (or timed-out) streaming transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransferStatus {
    /// Per-transfer condition flags.
    pub flags: TransferFlags,
    /// Bytes moved to host memory by this transfer.
    pub bytes_transferred: u64,
    /// True once the acquisition has delivered all of its data.
    pub end_of_stream: bool,
    /// Device timestamp of the transfer, in timestamp-counter ticks.
    ///
    /// Diagnostics only; `None` if the driver does not report one.
    pub timestamp: Option<i64>,
}

/// Outcome of starting a streaming transfer.
///
/// The "stream completed" driver status is part of normal operation and is
/// therefore modeled as a success variant rather than an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferOutcome {
    /// The transfer was queued and will fill the buffer.
    Started,
    /// The acquisition already delivered all data; the buffer will not be
    /// (fully) filled and the loop should proceed to drain.
    StreamCompleted,
}

/// One driver-allocated transfer buffer.
///
/// A fixed-size host-memory region the device fills with one batch of
/// samples per transfer call. Owned by the [`crate::buffer::BufferPool`] for
/// the session lifetime and returned to the driver on teardown.
#[derive(Debug)]
pub struct TransferBuffer {
    /// Driver-side identifier for this buffer.
    id: usize,
    samples: Vec<i16>,
}

impl TransferBuffer {
    /// Create a buffer with the given driver id and capacity in samples.
    pub fn new(id: usize, len_samples: usize) -> Self {
        Self {
            id,
            samples: vec![0; len_samples],
        }
    }

    /// Driver-side identifier.
    pub fn id(&self) -> usize {
        self.id
    }

    /// Buffer length in samples.
    pub fn len(&self) -> usize {
        self.samples.len()
    }

    /// Returns true if the buffer holds no samples.
    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Read access to the sample data.
    pub fn samples(&self) -> &[i16] {
        &self.samples
    }

    /// Mutable access for the driver to fill.
    pub fn samples_mut(&mut self) -> &mut [i16] {
        &mut self.samples
    }
}

// =============================================================================
// DeviceFacade Trait
// =============================================================================

/// Facade over the digitizer driver.
///
/// All operations the streaming pipeline needs from the device, and nothing
/// more. Configuration is staged with the `set_*` methods and pushed to
/// hardware by [`commit`](DeviceFacade::commit); the committed values must be
/// re-read afterwards because the driver may adjust them (sample size and
/// segment geometry in particular).
///
/// # Error contract
///
/// Implementations resolve negative driver statuses to
/// [`crate::Error::Device`] using their own
/// [`error_string`](DeviceFacade::error_string) rendering, with three
/// distinguished cases:
///
/// 1. "stream completed" is returned as
///    [`TransferOutcome::StreamCompleted`], never as an error.
/// 2. A transfer timeout is returned as [`crate::Error::TransferTimeout`].
/// 3. A FIFO overrun is *not* an error at the driver level; it is reported
///    through [`TransferFlags::FIFO_FULL`] on the transfer status and the
///    pipeline escalates it.
pub trait DeviceFacade: Send {
    /// Static system information (channel count, board count, sample size).
    fn system_info(&self) -> Result<SystemInfo>;

    /// Stage acquisition parameters in the driver.
    fn set_acquisition_config(&mut self, config: &AcquisitionConfig) -> Result<()>;

    /// Stage parameters for one input channel (1-based index).
    fn set_channel_config(&mut self, channel: u32, config: &ChannelConfig) -> Result<()>;

    /// Stage parameters for one trigger engine (1-based index).
    fn set_trigger_config(&mut self, trigger: u32, config: &TriggerConfig) -> Result<()>;

    /// Push all staged configuration to the hardware.
    fn commit(&mut self) -> Result<()>;

    /// Read back the committed acquisition configuration.
    fn acquisition_config(&self) -> Result<AcquisitionConfig>;

    /// Arm the acquisition and start capturing.
    fn start_capture(&mut self) -> Result<()>;

    /// Abort a running capture. Infallible teardown path.
    fn abort_capture(&mut self);

    /// Allocate one driver-owned streaming buffer of `size_bytes`.
    ///
    /// The returned buffer must hold exactly `size_bytes / sample_size`
    /// samples (with `sample_size` as reported by
    /// [`system_info`](DeviceFacade::system_info)); the session rejects
    /// buffers of any other length before the capture starts.
    fn allocate_streaming_buffer(
        &mut self,
        card_index: u32,
        size_bytes: usize,
    ) -> Result<TransferBuffer>;

    /// Return a streaming buffer to the driver. Infallible teardown path.
    fn free_streaming_buffer(&mut self, card_index: u32, buffer: TransferBuffer);

    /// Queue a transfer of `len_samples` samples into `buffer`.
    ///
    /// The transfer runs in the background; completion is observed via
    /// [`transfer_status`](DeviceFacade::transfer_status).
    fn transfer_streaming_data(
        &mut self,
        card_index: u32,
        buffer: &mut TransferBuffer,
        len_samples: usize,
    ) -> Result<TransferOutcome>;

    /// Block until the pending transfer completes, up to `timeout_ms`
    /// (`None` waits indefinitely).
    fn transfer_status(&mut self, card_index: u32, timeout_ms: Option<u32>)
        -> Result<TransferStatus>;

    /// Size in bytes of the per-segment tail (trailing metadata) region.
    fn segment_tail_size_bytes(&self) -> Result<u64>;

    /// Frequency of the device timestamp counter in Hz.
    fn timestamp_frequency(&self) -> Result<u64>;

    /// Total data the acquisition will deliver, in bytes.
    ///
    /// Returns -1 for an unbounded (infinite) streaming acquisition.
    fn stream_total_data_size_bytes(&self) -> Result<i64>;

    /// Human-readable rendering of a raw driver status code.
    fn error_string(&self, code: i32) -> String;
}

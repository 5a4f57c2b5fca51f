//! Streaming session: configuration, the transfer loop, drain and teardown.
//!
//! The session owns the device facade for its lifetime. One coordinating
//! loop alternates "issue next transfer" and "dispatch previous buffer to a
//! worker slot", so the device fills one transfer buffer while analysis of
//! the prior buffer runs on a background thread. On loop exit the streaming
//! buffers are returned to the driver in reverse allocation order, the
//! capture is aborted, the last work buffer is drained synchronously, save
//! sinks are persisted and the `exit` signal is raised.

use std::path::PathBuf;
use std::sync::Arc;

use log::{debug, error, info};

use crate::analysis::AnalysisStage;
use crate::buffer::{BufferPool, WorkBuffer, DEFAULT_BUFFER_COUNT};
use crate::config::{channel_index_increment, Config};
use crate::device::{DeviceFacade, TransferFlags, TransferOutcome};
use crate::error::{Error, Result};
use crate::segment::SegmentTracker;
use crate::signals::LifecycleSignals;
use crate::worker::{WorkerPool, DEFAULT_WORKER_COUNT};

/// Coalesced-update target period for low-rate sinks, in seconds.
const UPDATE_PERIOD_SECONDS: f64 = 0.1;

// =============================================================================
// Session Options
// =============================================================================

/// Tunable depths and bookkeeping slots of a streaming session.
///
/// Buffer depth and worker depth are independent controls: transfer
/// look-ahead versus analysis concurrency. The invariant `buffer_count >
/// worker_count` is required so a physical buffer is never re-targeted
/// before its consumer has had a full rotation to finish.
#[derive(Debug, Clone)]
pub struct SessionOptions {
    /// Number of transfer buffers in the rotation.
    pub buffer_count: usize,
    /// Number of analysis worker slots.
    pub worker_count: usize,
    /// Number of interleaved channels in saved data.
    pub save_channels: usize,
    /// Card index driven by this session.
    pub card_index: u32,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            buffer_count: DEFAULT_BUFFER_COUNT,
            worker_count: DEFAULT_WORKER_COUNT,
            save_channels: 1,
            card_index: 1,
        }
    }
}

impl SessionOptions {
    /// Set the transfer buffer depth (builder pattern).
    pub fn with_buffer_count(mut self, buffer_count: usize) -> Self {
        self.buffer_count = buffer_count;
        self
    }

    /// Set the worker slot count (builder pattern).
    pub fn with_worker_count(mut self, worker_count: usize) -> Self {
        self.worker_count = worker_count;
        self
    }

    /// Set the interleaved channel count for saved data (builder pattern).
    pub fn with_save_channels(mut self, save_channels: usize) -> Self {
        self.save_channels = save_channels;
        self
    }

    fn validate(&self) -> Result<()> {
        if self.worker_count == 0 {
            return Err(Error::invalid_config("worker count must be non-zero"));
        }
        if self.save_channels == 0 {
            return Err(Error::invalid_config("save channel count must be non-zero"));
        }
        if self.buffer_count <= self.worker_count {
            return Err(Error::invalid_config(format!(
                "buffer depth ({}) must exceed worker depth ({})",
                self.buffer_count, self.worker_count
            )));
        }
        Ok(())
    }
}

// =============================================================================
// Session Report
// =============================================================================

/// Why the streaming loop ended, for sessions that ended without a fatal
/// error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamExit {
    /// The acquisition delivered all of its data.
    Completed,
    /// The stop signal was observed at the end of an iteration.
    Stopped,
}

/// Summary of a finished streaming session.
#[derive(Debug, Clone)]
pub struct StreamReport {
    /// Why the loop ended.
    pub exit: StreamExit,
    /// Number of completed loop iterations.
    pub loop_count: u64,
    /// Cumulative bytes transferred, one slot per card.
    pub card_total_bytes: Vec<u64>,
    /// Result files written by save-type modes.
    pub result_files: Vec<PathBuf>,
}

// =============================================================================
// Stream Session
// =============================================================================

/// A continuous streaming session over one digitizer system.
pub struct StreamSession<D: DeviceFacade> {
    device: D,
    config: Config,
    options: SessionOptions,
    stage: Arc<AnalysisStage>,
    signals: LifecycleSignals,
}

impl<D: DeviceFacade> StreamSession<D> {
    /// Build a session. Fails fast on degenerate depth options.
    pub fn new(
        device: D,
        config: Config,
        options: SessionOptions,
        stage: Arc<AnalysisStage>,
        signals: LifecycleSignals,
    ) -> Result<Self> {
        options.validate()?;
        Ok(Self {
            device,
            config,
            options,
            stage,
            signals,
        })
    }

    /// Run the session to completion.
    ///
    /// Configures and commits the device, allocates the buffer rotation,
    /// starts the capture and drives the transfer loop until the stream
    /// completes, the stop signal is observed, or a fatal error occurs. The
    /// `error` lifecycle flag is set on any error path.
    pub fn run(mut self) -> Result<StreamReport> {
        let signals = self.signals.clone();
        let result = self.run_inner();
        if let Err(e) = &result {
            error!("stream session failed: {}", e);
            signals.error().set();
        }
        result
    }

    /// Stage file-based configuration into the driver and commit it.
    fn configure(&mut self) -> Result<()> {
        let info = self.device.system_info()?;
        info!("board name: {}", info.board_name);

        let acquisition = self.config.acquisition.clone();
        self.device.set_acquisition_config(&acquisition)?;

        // With fewer active channels than physical ones, configure every
        // increment-th channel, as the driver spreads them across boards.
        let increment = channel_index_increment(
            self.config.acquisition.masked_mode(),
            info.channel_count,
            info.board_count,
        );
        let mut channel = 1;
        while channel <= info.channel_count {
            let channel_config = self.config.channel(channel);
            self.device.set_channel_config(channel, &channel_config)?;
            channel += increment;
        }

        // This pipeline drives a single trigger source.
        let trigger = self.config.trigger.clone();
        self.device.set_trigger_config(1, &trigger)?;

        self.device.commit()
    }

    fn run_inner(&mut self) -> Result<StreamReport> {
        self.configure()?;

        // Committed values may differ from the staged ones; re-read the
        // geometry the loop depends on.
        let info = self.device.system_info()?;
        let acq = self.device.acquisition_config()?;
        let tick_frequency = self.device.timestamp_frequency()?;
        let tail_size_bytes = self.device.segment_tail_size_bytes()?;
        let total_data_bytes = self.device.stream_total_data_size_bytes()?;
        if total_data_bytes >= 0 {
            info!(
                "expecting {} total samples",
                total_data_bytes as u64 / u64::from(info.sample_size.max(1))
            );
        } else {
            info!("unbounded streaming acquisition");
        }

        let buffer_size_bytes = self.config.stream.buffer_size_bytes;
        let sample_size = info.sample_size.max(1) as usize;
        let transfer_samples = buffer_size_bytes / sample_size;
        if transfer_samples == 0 {
            return Err(Error::invalid_config(format!(
                "buffer size {} bytes is smaller than one sample",
                buffer_size_bytes
            )));
        }
        info!(
            "streaming with buffer size {} bytes ({} samples per transfer)",
            buffer_size_bytes, transfer_samples
        );

        let segment_size_bytes =
            acq.segment_size * u64::from(acq.masked_mode()) * sample_size as u64;
        let mut tracker = SegmentTracker::new(
            buffer_size_bytes as u64,
            segment_size_bytes,
            tail_size_bytes,
            acq.segment_count,
            tick_frequency,
        );

        // Coalescing interval: aim for one low-rate sink update per
        // UPDATE_PERIOD_SECONDS of acquired data.
        let buffer_seconds = transfer_samples as f64
            / (acq.effective_sample_rate() * self.options.save_channels as f64);
        let update_interval = ((UPDATE_PERIOD_SECONDS / buffer_seconds) as u64).max(1);
        self.stage.set_update_interval(update_interval);
        debug!(
            "single buffer spans {:.2} ms, coalescing sink updates every {} loops",
            buffer_seconds * 1e3,
            update_interval
        );

        // Allocate the buffer rotation; on failure, release what was
        // already acquired in reverse order.
        let card = self.options.card_index;
        let mut allocated = Vec::with_capacity(self.options.buffer_count);
        for _ in 0..self.options.buffer_count {
            match self.device.allocate_streaming_buffer(card, buffer_size_bytes) {
                // every buffer must match the work-buffer geometry exactly
                Ok(buffer) if buffer.len() != transfer_samples => {
                    let got = buffer.len();
                    error!(
                        "driver returned a {}-sample streaming buffer, expected {}",
                        got, transfer_samples
                    );
                    allocated.push(buffer);
                    while let Some(buffer) = allocated.pop() {
                        self.device.free_streaming_buffer(card, buffer);
                    }
                    return Err(Error::invalid_config(format!(
                        "streaming buffer holds {} samples, expected {}",
                        got, transfer_samples
                    )));
                }
                Ok(buffer) => allocated.push(buffer),
                Err(e) => {
                    error!("failed to allocate streaming buffer: {}", e);
                    while let Some(buffer) = allocated.pop() {
                        self.device.free_streaming_buffer(card, buffer);
                    }
                    return Err(e);
                }
            }
        }
        let mut pool = BufferPool::new(allocated);
        let mut work = WorkBuffer::zeroed(transfer_samples);
        let mut workers = WorkerPool::new(self.options.worker_count)?;
        let mut card_totals = vec![0u64; info.board_count.max(1) as usize];
        let analyze = self.config.stream.do_analysis;

        self.signals.ready().set();

        if let Err(e) = self.device.start_capture() {
            error!("failed to start capture: {}", e);
            for buffer in pool.into_reverse_order() {
                self.device.free_streaming_buffer(card, buffer);
            }
            return Err(e);
        }
        self.signals.started().set();
        info!(
            "capture started: {} transfer buffers, {} analysis workers",
            pool.len(),
            workers.len()
        );

        // ===== transfer loop =================================================
        let timeout = self.config.stream.transfer_timeout();
        let mut loop_count: u64 = 0;
        let mut work_buffer_active = false;
        let mut done = false;
        let mut stream_completed = false;
        let mut fatal: Option<Error> = None;

        while !done && !stream_completed {
            // issue the next transfer into the rotation's current buffer
            match self
                .device
                .transfer_streaming_data(card, pool.buffer_mut(loop_count), transfer_samples)
            {
                Ok(TransferOutcome::Started) => {}
                // only means no more new data will arrive; drain via status
                Ok(TransferOutcome::StreamCompleted) => {}
                Err(e) => {
                    error!("transfer failed: {}", e);
                    self.signals.error().set();
                    fatal = Some(e);
                    break;
                }
            }

            // with the transfer running, dispatch the previous buffer
            if work_buffer_active && analyze {
                let slot = workers.slot_for(loop_count);
                let stage = Arc::clone(&self.stage);
                let snapshot = work.snapshot();
                let totals = card_totals.clone();
                let submitted = workers
                    .submit(slot, move || stage.process(loop_count, &snapshot, &totals));
                if let Err(e) = submitted {
                    error!("analysis task failed: {}", e);
                    self.signals.error().set();
                    fatal = Some(e);
                    break;
                }
            }

            // wait for the transfer to finish
            match self.device.transfer_status(card, timeout) {
                Ok(status) => {
                    card_totals[0] += status.bytes_transferred;
                    let completed = tracker.consume(status.bytes_transferred);
                    if completed > 0 {
                        debug!(
                            "completed {} segment(s), now in segment {} ({} remaining)",
                            completed,
                            tracker.segment(),
                            tracker.segment_count_down()
                        );
                    }
                    if let Some(timestamp) = status.timestamp {
                        tracker.record_timestamp(timestamp);
                        debug!("inter-buffer delta {:.6} s", tracker.delta_time());
                    }
                    if status.end_of_stream {
                        stream_completed = true;
                    }
                    if status.flags.contains(TransferFlags::FIFO_FULL) {
                        error!("fifo full detected on card {}", card);
                        self.signals.error().set();
                        fatal = Some(Error::FifoOverrun);
                        done = true;
                    }
                }
                Err(e) => {
                    if e.is_transfer_timeout() {
                        error!("stream transfer timeout on card {}", card);
                    } else {
                        error!("transfer status error: {}", e);
                    }
                    self.signals.error().set();
                    fatal = Some(e);
                    done = true;
                }
            }

            // the just-filled buffer becomes the next work buffer
            work.fill_from(pool.buffer(loop_count).samples());

            loop_count += 1;
            work_buffer_active = true;

            if self.signals.stop().is_set() {
                done = true;
            }
        }

        // ===== exiting loop ==================================================
        // Free the streaming buffers and the capture first; a slow save must
        // not keep the card busy.
        for buffer in pool.into_reverse_order() {
            self.device.free_streaming_buffer(card, buffer);
        }
        self.device.abort_capture();

        // Drain: join outstanding tasks, then analyze the last filled buffer
        // synchronously.
        if let Err(e) = workers.join_all() {
            error!("analysis worker failed during drain: {}", e);
            self.signals.error().set();
            fatal.get_or_insert(e);
        }
        if analyze && loop_count > 0 {
            if let Err(e) = self.stage.process(loop_count, work.samples(), &card_totals) {
                error!("final analysis pass failed: {}", e);
                self.signals.error().set();
                fatal.get_or_insert(e);
            }
        } else if !analyze {
            self.stage.counters().publish(&card_totals, loop_count);
        }

        let mut result_files = Vec::new();
        if analyze && self.stage.mode().is_save_mode() {
            match self.stage.persist(
                loop_count,
                transfer_samples,
                self.options.save_channels,
                &self.config.stream.results_dir,
            ) {
                Ok(paths) => result_files = paths,
                Err(e) => {
                    error!("failed to write result file: {}", e);
                    self.signals.error().set();
                    fatal.get_or_insert(e);
                }
            }
        }

        // Exit is raised only now: the last buffer has been drained and any
        // result file written. The supervisor may clear its signal state. A
        // fatal loop error has already raised `error` at its fault site, so
        // a supervisor waiting on `exit` always sees the flags settled.
        self.signals.exit().set();

        match fatal {
            Some(e) => Err(e),
            None => Ok(StreamReport {
                exit: if stream_completed {
                    StreamExit::Completed
                } else {
                    StreamExit::Stopped
                },
                loop_count,
                card_total_bytes: card_totals,
                result_files,
            }),
        }
    }
}

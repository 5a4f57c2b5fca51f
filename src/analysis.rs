//! Per-buffer analysis stage.
//!
//! A single entry point ([`AnalysisStage::process`]) consumes the work
//! buffer once per loop iteration. Behavior is selected once per session by
//! [`AnalysisMode`]: each variant owns its result sink and its stop
//! predicate, so mode-specific shared state never leaks across modes.
//!
//! Save-type modes fill a sink sized to a target length and raise the stop
//! signal exactly once when it is full; every later call is a no-op that
//! still updates the shared counters.

use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use byteorder::{LittleEndian, WriteBytesExt};
use chrono::Local;
use log::{debug, info};

use crate::error::{Error, Result};
use crate::signals::LifecycleSignals;

/// Raw-sample result sink shared with the supervising process.
pub type SharedSinkI16 = Arc<Mutex<Vec<i16>>>;
/// Summed-sample result sink (i32 accumulators) shared with the supervisor.
pub type SharedSinkI32 = Arc<Mutex<Vec<i32>>>;

fn lock<T>(sink: &Mutex<T>) -> MutexGuard<'_, T> {
    match sink.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

// =============================================================================
// Shared Counters
// =============================================================================

/// Cross-boundary progress counters: cumulative bytes transferred per card
/// and the current loop count.
///
/// Written by the pipeline, read by the supervisor. Single writer per field;
/// readers tolerate eventually consistent values.
#[derive(Debug)]
pub struct SharedCounters {
    card_total_bytes: Vec<AtomicU64>,
    loop_count: AtomicU64,
}

impl SharedCounters {
    /// Create counters with one total-bytes slot per card.
    pub fn new(card_count: usize) -> Self {
        Self {
            card_total_bytes: (0..card_count.max(1)).map(|_| AtomicU64::new(0)).collect(),
            loop_count: AtomicU64::new(0),
        }
    }

    /// Publish the loop's running totals. Called as the last action of every
    /// analysis invocation.
    pub fn publish(&self, card_totals: &[u64], loop_count: u64) {
        for (slot, &total) in self.card_total_bytes.iter().zip(card_totals) {
            slot.store(total, Ordering::Relaxed);
        }
        self.loop_count.store(loop_count, Ordering::Relaxed);
    }

    /// Cumulative bytes transferred for the given card slot.
    pub fn total_bytes(&self, card: usize) -> u64 {
        self.card_total_bytes
            .get(card)
            .map(|c| c.load(Ordering::Relaxed))
            .unwrap_or(0)
    }

    /// Number of card slots.
    pub fn card_count(&self) -> usize {
        self.card_total_bytes.len()
    }

    /// Most recently published loop count.
    pub fn loop_count(&self) -> u64 {
        self.loop_count.load(Ordering::Relaxed)
    }
}

// =============================================================================
// Analysis Mode
// =============================================================================

/// Mode-selected behavior of the analysis stage, one variant per mode.
///
/// Each variant owns its sink. Save-type sinks start empty and are allocated
/// lazily on the first analysis call; a failed allocation is a fatal
/// session error surfaced through the worker pool.
#[derive(Debug, Clone)]
pub enum AnalysisMode {
    /// Sum the buffer's `(repeats, period)` rows elementwise and overwrite
    /// the sink with the truncated column sums, every coalescing interval.
    Average {
        /// Samples per repetition row.
        period: usize,
        /// Column-sum sink, length at most `period`.
        sink: SharedSinkI32,
    },
    /// Append the raw buffer into a sink sized to `target_len` samples.
    SaveRaw {
        /// Total samples to capture.
        target_len: usize,
        /// Pre-sized raw sample sink (lazily allocated).
        sink: SharedSinkI16,
    },
    /// Append per-buffer column sums into a sink sized to `target_len`.
    SaveAverage {
        /// Samples per repetition row.
        period: usize,
        /// Total summed samples to capture.
        target_len: usize,
        /// Pre-sized column-sum sink (lazily allocated).
        sink: SharedSinkI32,
    },
    /// Copy a truncated prefix of the buffer into a small fixed sink, every
    /// coalescing interval.
    PassThrough {
        /// Fixed-size prefix sink.
        sink: SharedSinkI16,
    },
}

impl AnalysisMode {
    /// Averaging mode with the given period and result length (clamped to
    /// the period).
    pub fn average(period: usize, result_len: usize) -> Result<Self> {
        if period == 0 {
            return Err(Error::invalid_config("average period must be non-zero"));
        }
        Ok(AnalysisMode::Average {
            period,
            sink: Arc::new(Mutex::new(vec![0; result_len.min(period)])),
        })
    }

    /// Raw-save mode with the given target length in samples.
    pub fn save_raw(target_len: usize) -> Result<Self> {
        if target_len == 0 {
            return Err(Error::invalid_config("save target length must be non-zero"));
        }
        Ok(AnalysisMode::SaveRaw {
            target_len,
            sink: Arc::new(Mutex::new(Vec::new())),
        })
    }

    /// Averaged-save mode with the given period and target length.
    pub fn save_average(period: usize, target_len: usize) -> Result<Self> {
        if period == 0 {
            return Err(Error::invalid_config("average period must be non-zero"));
        }
        if target_len == 0 {
            return Err(Error::invalid_config("save target length must be non-zero"));
        }
        Ok(AnalysisMode::SaveAverage {
            period,
            target_len,
            sink: Arc::new(Mutex::new(Vec::new())),
        })
    }

    /// Pass-through mode with the given prefix length.
    pub fn pass_through(prefix_len: usize) -> Result<Self> {
        if prefix_len == 0 {
            return Err(Error::invalid_config("pass-through length must be non-zero"));
        }
        Ok(AnalysisMode::PassThrough {
            sink: Arc::new(Mutex::new(vec![0; prefix_len])),
        })
    }

    /// Short mode name for diagnostics.
    pub fn name(&self) -> &'static str {
        match self {
            AnalysisMode::Average { .. } => "average",
            AnalysisMode::SaveRaw { .. } => "save-raw",
            AnalysisMode::SaveAverage { .. } => "save-average",
            AnalysisMode::PassThrough { .. } => "pass-through",
        }
    }

    /// Whether this mode persists its sink on session exit.
    pub fn is_save_mode(&self) -> bool {
        matches!(
            self,
            AnalysisMode::SaveRaw { .. } | AnalysisMode::SaveAverage { .. }
        )
    }

    /// Handle to the raw i16 sink, if this mode has one.
    pub fn sink_i16(&self) -> Option<SharedSinkI16> {
        match self {
            AnalysisMode::SaveRaw { sink, .. } | AnalysisMode::PassThrough { sink } => {
                Some(Arc::clone(sink))
            }
            _ => None,
        }
    }

    /// Handle to the summed i32 sink, if this mode has one.
    pub fn sink_i32(&self) -> Option<SharedSinkI32> {
        match self {
            AnalysisMode::Average { sink, .. } | AnalysisMode::SaveAverage { sink, .. } => {
                Some(Arc::clone(sink))
            }
            _ => None,
        }
    }
}

/// Sum `work` reshaped as `(repeats, period)` rows, elementwise over the
/// rows. A trailing partial row is ignored.
fn column_sums(work: &[i16], period: usize) -> Vec<i32> {
    let mut sums = vec![0i32; period];
    for row in work.chunks_exact(period) {
        for (sum, &sample) in sums.iter_mut().zip(row) {
            *sum += i32::from(sample);
        }
    }
    sums
}

/// Grow an empty save sink to its target length, mapping allocation failure
/// to a session error instead of aborting.
fn allocate_sink<T: Clone + Default>(sink: &mut Vec<T>, target_len: usize) -> Result<()> {
    if !sink.is_empty() {
        return Ok(());
    }
    sink.try_reserve_exact(target_len)
        .map_err(|e| Error::sink_allocation(e.to_string()))?;
    sink.resize(target_len, T::default());
    debug!("allocated save sink of {} samples", target_len);
    Ok(())
}

// =============================================================================
// Analysis Stage
// =============================================================================

/// The per-buffer analysis state machine.
///
/// Shared (`Arc`) between the streaming loop and the worker tasks; every
/// call publishes the shared counters as its last action, including no-op
/// calls after a save-mode stop.
pub struct AnalysisStage {
    mode: AnalysisMode,
    counters: Arc<SharedCounters>,
    signals: LifecycleSignals,
    /// Loop iterations between coalesced updates (Average / PassThrough).
    update_interval: AtomicU64,
    /// Latched once a save-mode sink is full.
    stopped: AtomicBool,
}

impl AnalysisStage {
    /// Build a stage for one session.
    pub fn new(mode: AnalysisMode, counters: Arc<SharedCounters>, signals: LifecycleSignals) -> Self {
        Self {
            mode,
            counters,
            signals,
            update_interval: AtomicU64::new(1),
            stopped: AtomicBool::new(false),
        }
    }

    /// Set the coalescing interval in loop iterations (min 1).
    pub fn set_update_interval(&self, interval: u64) {
        self.update_interval.store(interval.max(1), Ordering::Relaxed);
    }

    /// The configured mode and its sinks.
    pub fn mode(&self) -> &AnalysisMode {
        &self.mode
    }

    /// The shared progress counters.
    pub fn counters(&self) -> &Arc<SharedCounters> {
        &self.counters
    }

    /// Whether a save-mode stop condition has fired.
    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    /// Consume one work buffer.
    ///
    /// `loop_count` is the 1-based index of the buffer being analyzed and
    /// `card_totals` the loop's running byte totals per card. The counters
    /// are published unconditionally, even when the mode skips or errors.
    pub fn process(&self, loop_count: u64, work: &[i16], card_totals: &[u64]) -> Result<()> {
        let result = self.dispatch(loop_count, work);
        self.counters.publish(card_totals, loop_count);
        result
    }

    fn dispatch(&self, loop_count: u64, work: &[i16]) -> Result<()> {
        if loop_count == 0 {
            return Ok(());
        }
        let interval = self.update_interval.load(Ordering::Relaxed);

        match &self.mode {
            AnalysisMode::Average { period, sink } => {
                if loop_count % interval != 0 {
                    return Ok(());
                }
                let sums = column_sums(work, *period);
                let mut sink = lock(sink);
                let n = sink.len().min(sums.len());
                sink[..n].copy_from_slice(&sums[..n]);
                Ok(())
            }

            AnalysisMode::SaveRaw { target_len, sink } => {
                if self.is_stopped() {
                    debug!("stop flag already set, skipping buffer {}", loop_count);
                    return Ok(());
                }
                let size = work.len();
                let start = (loop_count - 1) as usize * size;
                let mut sink = lock(sink);
                allocate_sink(&mut sink, *target_len)?;
                if start < *target_len {
                    let end = (start + size).min(*target_len);
                    sink[start..end].copy_from_slice(&work[..end - start]);
                    if end == *target_len {
                        self.raise_stop(loop_count);
                    }
                } else {
                    self.raise_stop(loop_count);
                }
                Ok(())
            }

            AnalysisMode::SaveAverage {
                period,
                target_len,
                sink,
            } => {
                if self.is_stopped() {
                    debug!("stop flag already set, skipping buffer {}", loop_count);
                    return Ok(());
                }
                let start = (loop_count - 1) as usize * *period;
                let sums = column_sums(work, *period);
                let mut sink = lock(sink);
                allocate_sink(&mut sink, *target_len)?;
                if start < *target_len {
                    let end = (start + *period).min(*target_len);
                    sink[start..end].copy_from_slice(&sums[..end - start]);
                    if end == *target_len {
                        self.raise_stop(loop_count);
                    }
                } else {
                    self.raise_stop(loop_count);
                }
                Ok(())
            }

            AnalysisMode::PassThrough { sink } => {
                if loop_count % interval != 0 {
                    return Ok(());
                }
                let mut sink = lock(sink);
                let n = sink.len().min(work.len());
                sink[..n].copy_from_slice(&work[..n]);
                Ok(())
            }
        }
    }

    /// Latch the stop condition; the stop signal is raised exactly once.
    fn raise_stop(&self, loop_count: u64) {
        if !self.stopped.swap(true, Ordering::SeqCst) {
            info!(
                "{} sink full at loop count {}, requesting stop",
                self.mode.name(),
                loop_count
            );
            self.signals.stop().set();
        }
    }

    /// Persist the accumulated save-mode sink, one binary file per channel.
    ///
    /// Files are little-endian sample dumps named by an ISO-8601 timestamp
    /// (colons replaced by hyphens) suffixed with the 1-based channel index.
    /// The sink is truncated to `step * loop_count` samples, where `step` is
    /// the per-iteration sample count of the mode. Non-save modes write
    /// nothing.
    pub fn persist(
        &self,
        loop_count: u64,
        buffer_len: usize,
        save_channels: usize,
        results_dir: &Path,
    ) -> Result<Vec<PathBuf>> {
        let timestamp = Local::now().format("%Y-%m-%dT%H-%M-%S").to_string();
        let channels = save_channels.max(1);

        match &self.mode {
            AnalysisMode::SaveRaw { sink, .. } => {
                let sink = lock(sink);
                let end = (buffer_len as u64 * loop_count).min(sink.len() as u64) as usize;
                write_channels(&sink[..end], channels, results_dir, &timestamp, |file, &s| {
                    file.write_i16::<LittleEndian>(s)
                })
            }
            AnalysisMode::SaveAverage { period, sink, .. } => {
                let sink = lock(sink);
                let end = (*period as u64 * loop_count).min(sink.len() as u64) as usize;
                write_channels(&sink[..end], channels, results_dir, &timestamp, |file, &s| {
                    file.write_i32::<LittleEndian>(s)
                })
            }
            _ => Ok(Vec::new()),
        }
    }
}

/// De-interleave `data` into `channels` files and write each sample with
/// `write_sample`.
fn write_channels<T, F>(
    data: &[T],
    channels: usize,
    results_dir: &Path,
    timestamp: &str,
    mut write_sample: F,
) -> Result<Vec<PathBuf>>
where
    F: FnMut(&mut BufWriter<std::fs::File>, &T) -> std::io::Result<()>,
{
    std::fs::create_dir_all(results_dir)?;
    let per_channel = data.len() / channels;
    let mut paths = Vec::with_capacity(channels);

    for channel in 0..channels {
        let path = results_dir.join(format!("{}_ch{}.bin", timestamp, channel + 1));
        let mut file = BufWriter::new(std::fs::File::create(&path)?);
        for sample in data.iter().skip(channel).step_by(channels).take(per_channel) {
            write_sample(&mut file, sample)?;
        }
        file.flush()?;
        info!("wrote {} samples to {}", per_channel, path.display());
        paths.push(path);
    }
    Ok(paths)
}

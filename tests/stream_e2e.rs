//! End-to-end streaming tests against a scripted in-memory device.
//!
//! These tests run the full pipeline: configuration commit, buffer
//! allocation, the transfer loop with background analysis workers, drain,
//! persistence and teardown, using a `DeviceFacade` implementation that
//! scripts the driver's behavior.

use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use daq_stream::{
    AcquisitionConfig, AnalysisMode, AnalysisStage, ChannelConfig, Config, DeviceFacade, Error,
    LifecycleSignals, Result, SessionOptions, SharedCounters, StreamExit, StreamSession,
    SystemInfo, TransferBuffer, TransferFlags, TransferOutcome, TransferStatus, TriggerConfig,
};

// =============================================================================
// Scripted device
// =============================================================================

#[derive(Debug, Default)]
struct ScriptState {
    staged_acquisition: AcquisitionConfig,
    committed: bool,
    transfers_started: u64,
    transfers_polled: u64,
    allocated: usize,
    freed_ids: Vec<usize>,
    capture_started: bool,
    capture_aborted: bool,
}

/// Driver stand-in with scripted failure points.
struct ScriptedDevice {
    state: Arc<Mutex<ScriptState>>,
    /// Per-transfer sample data; past the end, sequential samples continue.
    scripted_data: Vec<Vec<i16>>,
    /// Data transfers before the stream reports completion (`None` =
    /// unbounded).
    total_transfers: Option<u64>,
    /// 1-based status poll that reports a FIFO overrun.
    fifo_at: Option<u64>,
    /// 1-based status poll that times out.
    timeout_at: Option<u64>,
}

impl ScriptedDevice {
    fn new() -> (Self, Arc<Mutex<ScriptState>>) {
        let state = Arc::new(Mutex::new(ScriptState::default()));
        (
            Self {
                state: Arc::clone(&state),
                scripted_data: Vec::new(),
                total_transfers: None,
                fifo_at: None,
                timeout_at: None,
            },
            state,
        )
    }
}

impl DeviceFacade for ScriptedDevice {
    fn system_info(&self) -> Result<SystemInfo> {
        Ok(SystemInfo {
            board_name: "ScriptedScope-1000".into(),
            channel_count: 2,
            board_count: 1,
            sample_size: 2,
        })
    }

    fn set_acquisition_config(&mut self, config: &AcquisitionConfig) -> Result<()> {
        self.state.lock().unwrap().staged_acquisition = config.clone();
        Ok(())
    }

    fn set_channel_config(&mut self, _channel: u32, _config: &ChannelConfig) -> Result<()> {
        Ok(())
    }

    fn set_trigger_config(&mut self, _trigger: u32, _config: &TriggerConfig) -> Result<()> {
        Ok(())
    }

    fn commit(&mut self) -> Result<()> {
        self.state.lock().unwrap().committed = true;
        Ok(())
    }

    fn acquisition_config(&self) -> Result<AcquisitionConfig> {
        // the committed values are exactly what was staged
        Ok(self.state.lock().unwrap().staged_acquisition.clone())
    }

    fn start_capture(&mut self) -> Result<()> {
        self.state.lock().unwrap().capture_started = true;
        Ok(())
    }

    fn abort_capture(&mut self) {
        self.state.lock().unwrap().capture_aborted = true;
    }

    fn allocate_streaming_buffer(
        &mut self,
        _card_index: u32,
        size_bytes: usize,
    ) -> Result<TransferBuffer> {
        let mut state = self.state.lock().unwrap();
        let id = state.allocated;
        state.allocated += 1;
        Ok(TransferBuffer::new(id, size_bytes / 2))
    }

    fn free_streaming_buffer(&mut self, _card_index: u32, buffer: TransferBuffer) {
        self.state.lock().unwrap().freed_ids.push(buffer.id());
    }

    fn transfer_streaming_data(
        &mut self,
        _card_index: u32,
        buffer: &mut TransferBuffer,
        len_samples: usize,
    ) -> Result<TransferOutcome> {
        let mut state = self.state.lock().unwrap();
        if let Some(total) = self.total_transfers {
            if state.transfers_started >= total {
                return Ok(TransferOutcome::StreamCompleted);
            }
        }
        let index = state.transfers_started as usize;
        if let Some(scripted) = self.scripted_data.get(index) {
            buffer.samples_mut().copy_from_slice(scripted);
        } else {
            // sequential fallback: sample value == 1-based stream position
            let base = state.transfers_started * len_samples as u64;
            for (i, sample) in buffer.samples_mut().iter_mut().enumerate() {
                *sample = (base + i as u64 + 1) as i16;
            }
        }
        state.transfers_started += 1;
        Ok(TransferOutcome::Started)
    }

    fn transfer_status(
        &mut self,
        _card_index: u32,
        _timeout_ms: Option<u32>,
    ) -> Result<TransferStatus> {
        let mut state = self.state.lock().unwrap();
        state.transfers_polled += 1;
        let polled = state.transfers_polled;

        if self.timeout_at == Some(polled) {
            return Err(Error::TransferTimeout);
        }
        let mut flags = TransferFlags::empty();
        if self.fifo_at == Some(polled) {
            flags |= TransferFlags::FIFO_FULL;
        }
        Ok(TransferStatus {
            flags,
            bytes_transferred: 8,
            end_of_stream: self.total_transfers.is_some_and(|t| polled >= t),
            timestamp: Some(polled as i64 * 500_000),
        })
    }

    fn segment_tail_size_bytes(&self) -> Result<u64> {
        Ok(0)
    }

    fn timestamp_frequency(&self) -> Result<u64> {
        Ok(1_000_000)
    }

    fn stream_total_data_size_bytes(&self) -> Result<i64> {
        Ok(self.total_transfers.map_or(-1, |t| (t * 8) as i64))
    }

    fn error_string(&self, code: i32) -> String {
        format!("scripted error {}", code)
    }
}

// =============================================================================
// Helpers
// =============================================================================

/// Config for 4-sample (8-byte) transfer buffers with analysis enabled and a
/// sample rate low enough that every loop updates live sinks.
fn test_config() -> Config {
    let mut config = Config::default();
    config.acquisition.sample_rate = 10;
    config.acquisition.segment_size = 4;
    config.stream.buffer_size_bytes = 8;
    config.stream.do_analysis = true;
    config
}

fn build_stage(mode: AnalysisMode) -> (Arc<AnalysisStage>, LifecycleSignals) {
    let counters = Arc::new(SharedCounters::new(1));
    let signals = LifecycleSignals::new();
    let stage = Arc::new(AnalysisStage::new(mode, counters, signals.clone()));
    (stage, signals)
}

// =============================================================================
// Scenarios
// =============================================================================

#[test]
fn test_save_raw_fills_target_requests_stop_and_persists() {
    let results_dir = tempfile::tempdir().unwrap();
    let (device, state) = ScriptedDevice::new();
    // unbounded stream: termination must come from the full save sink

    let mode = AnalysisMode::save_raw(8).unwrap();
    let sink = mode.sink_i16().unwrap();
    let (stage, signals) = build_stage(mode);

    let mut config = test_config();
    config.stream.results_dir = results_dir.path().to_path_buf();

    let session = StreamSession::new(
        device,
        config,
        SessionOptions::default(),
        stage,
        signals.clone(),
    )
    .unwrap();
    let report = session.run().unwrap();

    // the analysis worker raised the stop once its 8-sample sink was full
    assert_eq!(report.exit, StreamExit::Stopped);
    assert!(report.loop_count >= 2);
    assert!(signals.stop().is_set());
    assert!(signals.exit().is_set());
    assert!(!signals.error().is_set());

    // sink holds exactly the first 8 streamed samples, later buffers were
    // no-ops
    assert_eq!(*sink.lock().unwrap(), vec![1, 2, 3, 4, 5, 6, 7, 8]);

    // one result file, little-endian i16 dump of the sink
    assert_eq!(report.result_files.len(), 1);
    let bytes = std::fs::read(&report.result_files[0]).unwrap();
    assert_eq!(bytes, vec![1, 0, 2, 0, 3, 0, 4, 0, 5, 0, 6, 0, 7, 0, 8, 0]);
    let name = report.result_files[0].file_name().unwrap().to_str().unwrap();
    assert!(name.ends_with("_ch1.bin"), "unexpected file name {}", name);

    // full teardown: every buffer freed exactly once, newest first
    let state = state.lock().unwrap();
    assert_eq!(state.freed_ids, vec![3, 2, 1, 0]);
    assert!(state.capture_aborted);
}

#[test]
fn test_average_reflects_latest_buffer_after_drain() {
    // three 4-sample buffers, period 2; the live sink ends up with the
    // column sums of the last buffer only
    let (mut device, _state) = ScriptedDevice::new();
    device.total_transfers = Some(3);
    device.scripted_data = vec![
        vec![1, 2, 3, 4],
        vec![5, 6, 7, 8],
        vec![9, 10, 11, 12],
    ];

    let mode = AnalysisMode::average(2, 2).unwrap();
    let sink = mode.sink_i32().unwrap();
    let (stage, signals) = build_stage(mode);
    let counters = Arc::clone(stage.counters());

    let session = StreamSession::new(
        device,
        test_config(),
        SessionOptions::default(),
        stage,
        signals,
    )
    .unwrap();
    let report = session.run().unwrap();

    assert_eq!(report.exit, StreamExit::Completed);
    assert_eq!(report.loop_count, 3);
    // the synchronous drain analyzed the third buffer: [9+11, 10+12]
    assert_eq!(*sink.lock().unwrap(), vec![20, 22]);
    assert_eq!(counters.loop_count(), 3);
    assert_eq!(counters.total_bytes(0), 24);
    assert!(report.result_files.is_empty());
}

#[test]
fn test_fifo_overrun_is_fatal_with_complete_teardown() {
    let (mut device, state) = ScriptedDevice::new();
    device.fifo_at = Some(5);

    let (stage, signals) = build_stage(AnalysisMode::pass_through(4).unwrap());
    let session = StreamSession::new(
        device,
        test_config(),
        SessionOptions::default(),
        stage,
        signals.clone(),
    )
    .unwrap();

    let err = session.run().expect_err("fifo overrun must fail the session");
    assert!(err.is_fifo_overrun());
    assert!(signals.error().is_set());
    assert!(signals.exit().is_set());

    let state = state.lock().unwrap();
    // overrun detected on poll 5: no new transfer is issued afterwards
    assert!(state.transfers_started <= 6);
    assert_eq!(state.freed_ids, vec![3, 2, 1, 0]);
    assert!(state.capture_aborted);
}

#[test]
fn test_sink_allocation_failure_surfaces_from_worker_to_loop() {
    // a save target too large for the address space makes the lazy sink
    // allocation fail inside the first worker task; the loop must observe
    // the error at the next submission to that slot and tear down cleanly
    let results_dir = tempfile::tempdir().unwrap();
    let (device, state) = ScriptedDevice::new();

    let mode = AnalysisMode::save_raw(usize::MAX / 2).unwrap();
    let (stage, signals) = build_stage(mode);

    let mut config = test_config();
    config.stream.results_dir = results_dir.path().to_path_buf();

    let session = StreamSession::new(
        device,
        config,
        SessionOptions::default(),
        stage,
        signals.clone(),
    )
    .unwrap();

    let err = session
        .run()
        .expect_err("sink allocation failure must fail the session");
    assert!(err.is_sink_allocation());
    assert!(signals.error().is_set());
    assert!(signals.exit().is_set());
    // the worker never filled its sink, so no stop was requested
    assert!(!signals.stop().is_set());

    let state = state.lock().unwrap();
    // error surfaces on slot reuse: the loop stops within a few iterations
    assert!(state.transfers_started <= 5);
    assert_eq!(state.freed_ids, vec![3, 2, 1, 0]);
    assert!(state.capture_aborted);
}

#[test]
fn test_transfer_timeout_is_fatal() {
    let (mut device, state) = ScriptedDevice::new();
    device.timeout_at = Some(3);

    let (stage, signals) = build_stage(AnalysisMode::pass_through(4).unwrap());
    let mut config = test_config();
    config.stream.timeout_on_transfer_ms = 1000;

    let session = StreamSession::new(
        device,
        config,
        SessionOptions::default(),
        stage,
        signals.clone(),
    )
    .unwrap();

    let err = session.run().expect_err("timeout must fail the session");
    assert!(err.is_transfer_timeout());
    assert!(signals.error().is_set());
    assert_eq!(state.lock().unwrap().freed_ids, vec![3, 2, 1, 0]);
}

#[test]
fn test_supervisor_stop_request_ends_unbounded_stream() {
    // a supervising thread waits for startup, then requests a stop; the
    // session must observe it at iteration granularity and exit cleanly
    let (device, _state) = ScriptedDevice::new();
    let (stage, signals) = build_stage(AnalysisMode::pass_through(4).unwrap());

    let supervisor = {
        let signals = signals.clone();
        thread::spawn(move || {
            assert!(
                signals.started().wait_timeout(Some(Duration::from_secs(5))),
                "session never started"
            );
            signals.stop().set();
            assert!(
                signals.exit().wait_timeout(Some(Duration::from_secs(5))),
                "session never exited after stop"
            );
        })
    };

    let session = StreamSession::new(
        device,
        test_config(),
        SessionOptions::default(),
        stage,
        signals.clone(),
    )
    .unwrap();
    let report = session.run().unwrap();

    supervisor.join().unwrap();
    assert_eq!(report.exit, StreamExit::Stopped);
    assert!(report.loop_count >= 1);
    assert!(!signals.error().is_set());
}

#[test]
fn test_deeper_buffer_and_worker_rotation() {
    // non-default depths: 6 buffers over 3 workers, still terminating on a
    // full save sink
    let (device, state) = ScriptedDevice::new();
    let mode = AnalysisMode::save_raw(20).unwrap();
    let sink = mode.sink_i16().unwrap();
    let (stage, signals) = build_stage(mode);

    let results_dir = tempfile::tempdir().unwrap();
    let mut config = test_config();
    config.stream.results_dir = results_dir.path().to_path_buf();

    let options = SessionOptions::default()
        .with_buffer_count(6)
        .with_worker_count(3);
    let session = StreamSession::new(device, config, options, stage, signals).unwrap();
    let report = session.run().unwrap();

    assert_eq!(report.exit, StreamExit::Stopped);
    let expected: Vec<i16> = (1..=20).collect();
    assert_eq!(*sink.lock().unwrap(), expected);

    let state = state.lock().unwrap();
    assert_eq!(state.freed_ids, vec![5, 4, 3, 2, 1, 0]);
}

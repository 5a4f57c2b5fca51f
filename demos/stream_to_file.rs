//! Stream a simulated acquisition into per-channel result files.
//!
//! Runs the full pipeline against an in-process simulated digitizer: raw
//! samples are captured into a save sink until it is full, then written as
//! little-endian binary files into ./results.
//!
//! Run with: `cargo run --example stream_to_file`
//! Set `RUST_LOG=debug` for per-loop diagnostics.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use daq_stream::{
    AcquisitionConfig, AnalysisMode, AnalysisStage, ChannelConfig, Config, DeviceFacade,
    LifecycleSignals, Result, SessionOptions, SharedCounters, StreamSession, SystemInfo,
    TransferBuffer, TransferFlags, TransferOutcome, TransferStatus, TriggerConfig,
};

/// In-process digitizer producing a sine wave on an unbounded stream.
struct SimulatedDigitizer {
    acquisition: AcquisitionConfig,
    transfers: u64,
    phase: f64,
}

impl SimulatedDigitizer {
    fn new() -> Self {
        Self {
            acquisition: AcquisitionConfig::default(),
            transfers: 0,
            phase: 0.0,
        }
    }
}

impl DeviceFacade for SimulatedDigitizer {
    fn system_info(&self) -> Result<SystemInfo> {
        Ok(SystemInfo {
            board_name: "Simulated-8500".into(),
            channel_count: 2,
            board_count: 1,
            sample_size: 2,
        })
    }

    fn set_acquisition_config(&mut self, config: &AcquisitionConfig) -> Result<()> {
        self.acquisition = config.clone();
        Ok(())
    }

    fn set_channel_config(&mut self, _channel: u32, _config: &ChannelConfig) -> Result<()> {
        Ok(())
    }

    fn set_trigger_config(&mut self, _trigger: u32, _config: &TriggerConfig) -> Result<()> {
        Ok(())
    }

    fn commit(&mut self) -> Result<()> {
        Ok(())
    }

    fn acquisition_config(&self) -> Result<AcquisitionConfig> {
        Ok(self.acquisition.clone())
    }

    fn start_capture(&mut self) -> Result<()> {
        Ok(())
    }

    fn abort_capture(&mut self) {}

    fn allocate_streaming_buffer(
        &mut self,
        _card_index: u32,
        size_bytes: usize,
    ) -> Result<TransferBuffer> {
        Ok(TransferBuffer::new(self.transfers as usize, size_bytes / 2))
    }

    fn free_streaming_buffer(&mut self, _card_index: u32, _buffer: TransferBuffer) {}

    fn transfer_streaming_data(
        &mut self,
        _card_index: u32,
        buffer: &mut TransferBuffer,
        _len_samples: usize,
    ) -> Result<TransferOutcome> {
        for sample in buffer.samples_mut() {
            *sample = (self.phase.sin() * 10_000.0) as i16;
            self.phase += 0.02;
        }
        self.transfers += 1;
        Ok(TransferOutcome::Started)
    }

    fn transfer_status(
        &mut self,
        _card_index: u32,
        _timeout_ms: Option<u32>,
    ) -> Result<TransferStatus> {
        // pace the simulation roughly like a real card
        thread::sleep(Duration::from_millis(2));
        Ok(TransferStatus {
            flags: TransferFlags::empty(),
            bytes_transferred: 0x1_0000 * 2,
            end_of_stream: false,
            timestamp: Some(self.transfers as i64 * 1_000),
        })
    }

    fn segment_tail_size_bytes(&self) -> Result<u64> {
        Ok(0)
    }

    fn timestamp_frequency(&self) -> Result<u64> {
        Ok(1_000_000)
    }

    fn stream_total_data_size_bytes(&self) -> Result<i64> {
        Ok(-1) // unbounded
    }

    fn error_string(&self, code: i32) -> String {
        format!("simulated error {}", code)
    }
}

fn main() -> Result<()> {
    env_logger::init();

    let mut config = Config::load(Path::new("daq-stream.toml"));
    config.stream.buffer_size_bytes = 0x2_0000; // 64Ki samples per transfer
    config.stream.do_analysis = true;
    config.stream.results_dir = PathBuf::from("results");

    // capture 1Mi raw samples, then stop and persist
    let mode = AnalysisMode::save_raw(1 << 20)?;
    let counters = Arc::new(SharedCounters::new(1));
    let signals = LifecycleSignals::new();
    let stage = Arc::new(AnalysisStage::new(
        mode,
        Arc::clone(&counters),
        signals.clone(),
    ));

    // progress reporting until the session exits
    let reporter = {
        let signals = signals.clone();
        let counters = Arc::clone(&counters);
        thread::spawn(move || {
            while !signals.exit().wait_timeout(Some(Duration::from_millis(500))) {
                println!(
                    "loop {:>6}  {:>12} bytes transferred",
                    counters.loop_count(),
                    counters.total_bytes(0)
                );
            }
        })
    };

    let session = StreamSession::new(
        SimulatedDigitizer::new(),
        config,
        SessionOptions::default().with_save_channels(2),
        stage,
        signals,
    )?;
    let report = session.run()?;
    reporter.join().expect("reporter thread panicked");

    println!(
        "done after {} loops ({} bytes); results:",
        report.loop_count, report.card_total_bytes[0]
    );
    for path in &report.result_files {
        println!("  {}", path.display());
    }
    Ok(())
}

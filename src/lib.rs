//! Continuous streaming pipeline for multi-channel digitizer cards.
//!
//! This crate drives a streaming acquisition through a small device facade,
//! allowing the same pipeline to run against real digitizer drivers or
//! simulated devices in tests.
//!
//! # Architecture
//!
//! - A fixed rotation of transfer buffers (default 4) is filled by the
//!   driver while previously filled buffers are analyzed on a smaller set of
//!   rotating worker slots (default 2).
//! - Analysis behavior is selected per session by [`AnalysisMode`]: live
//!   averaging or pass-through into a shared sink, or accumulation into a
//!   fixed-size save sink that requests a stop when full and is persisted to
//!   per-channel binary files on exit.
//! - One-way lifecycle signals (`ready`, `started`, `stop`, `error`, `exit`)
//!   coordinate the session with its supervisor.
//!
//! Configuration is loaded from an optional TOML file ([`Config::load`]);
//! missing pieces fall back to defaults so the pipeline always starts.

pub mod analysis;
pub mod buffer;
pub mod config;
pub mod device;
mod error;
pub mod segment;
pub mod signals;
pub mod stream;
pub mod worker;

// Error types
pub use error::{Error, Result};

// Device facade and driver-level types
pub use device::{
    DeviceFacade, SystemInfo, TransferBuffer, TransferFlags, TransferOutcome, TransferStatus,
};

// Configuration
pub use config::{AcquisitionConfig, ChannelConfig, Config, StreamSettings, TriggerConfig};

// Analysis stage and shared state
pub use analysis::{AnalysisMode, AnalysisStage, SharedCounters, SharedSinkI16, SharedSinkI32};

// Session and supporting machinery
pub use buffer::{BufferPool, WorkBuffer, DEFAULT_BUFFER_COUNT};
pub use segment::SegmentTracker;
pub use signals::{LifecycleSignals, SignalFlag};
pub use stream::{SessionOptions, StreamExit, StreamReport, StreamSession};
pub use worker::{WorkerPool, DEFAULT_WORKER_COUNT};

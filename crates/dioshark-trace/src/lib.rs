//! Multi-device, per-CPU block I/O trace collector.
//!
//! This crate arms the kernel block tracer on one or more block devices,
//! runs one collector thread per CPU that drains that CPU's record channel
//! of every device, and shuts everything down in order when the channels
//! run dry or a shutdown is requested.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────┐
//! │  TraceSession (orchestrator thread) │
//! │    DeviceRegistry: ARM/START/STOP/  │
//! │    TEARDOWN ioctls per device       │
//! └──────────────┬──────────────────────┘
//!                │ ioctl(BLKTRACE*)
//! ═══════════════╪══════════════════════════
//!                │ block layer
//! ┌──────────────▼──────────────────────┐
//! │  Per-device, per-CPU relay buffers  │
//! │    <debugfs>/block/<dev>/trace<cpu> │
//! └──────────────┬──────────────────────┘
//!                │ poll + read, 48-byte records
//! ┌──────────────▼──────────────────────┐
//! │  WorkerPool: one worker per CPU     │
//! │    → TraceRecord stream             │
//! │    → RecordSink (log/file/memory)   │
//! │    → RunReport                      │
//! └─────────────────────────────────────┘
//! ```
//!
//! # Usage
//!
//! ```no_run
//! use dioshark_trace::config::TraceConfig;
//! use dioshark_trace::session::TraceSession;
//! use dioshark_trace::sink::LogSink;
//! use std::sync::Arc;
//!
//! let mut session = TraceSession::new(TraceConfig::default(), Arc::new(LogSink));
//! session.register("/dev/sda").unwrap();
//!
//! let shutdown = session.shutdown_handle();
//! ctrlc::set_handler(move || shutdown.request_shutdown()).unwrap();
//!
//! let report = session.run();
//! println!("{}", report);
//! ```

pub mod channel;
pub mod config;
pub mod control;
pub mod device;
pub mod error;
pub mod pool;
pub mod record;
pub mod session;
pub mod sink;
pub mod verified;
pub mod worker;

#[cfg(test)]
mod testing;

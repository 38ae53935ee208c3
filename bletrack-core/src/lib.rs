//! bletrack-core: frame decoding, GPS correlation and capture pipeline for a
//! BLE advertisement telemetry link.
//!
//! No async, no device I/O. Concrete transports live in `bletrack-feeder`;
//! storage, notifiers and the CLI live in `bletrack-server`.

pub mod config;
pub mod frame;
pub mod gps;
pub mod lifecycle;
pub mod pipeline;
pub mod queue;
pub mod sink;
pub mod transport;
pub mod types;

// Re-export commonly used types at crate root
pub use frame::{DecoderStats, Frame, FrameDecoder, FrameFormat, FrameHeader, HeaderLayout};
pub use gps::{FixHandle, GpsCorrelator, GpsFeed, GpsSource};
pub use lifecycle::{Lifecycle, LifecycleError, Operation, State, Trigger};
pub use pipeline::{CapturePipeline, RunLimits, RunSummary, StopReason, Uplink};
pub use queue::{HandoffQueue, NotificationQueue};
pub use sink::{CaptureSink, JsonLinesSink};
pub use transport::{MemoryTransport, Transport};
pub use types::*;

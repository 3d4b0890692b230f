pub mod body;
pub mod capture;
pub mod config;
pub mod entry;
pub mod error;
pub mod headers;
pub mod recorder;
pub mod replay;
pub mod sink;

pub use capture::{Capture, HostCapabilities, HostEvent};
pub use entry::CaptureEntry;
pub use error::{Error, Result};
pub use recorder::{CaptureRun, Recorder};
pub use sink::{ChannelSink, EntrySink};

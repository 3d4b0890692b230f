//! Network capture backends
//!
//! Host events are handled sans-io: each backend is a state machine fed one
//! event at a time, and the only I/O it performs goes through the host traits
//! in [`host`]. [`Capture`] picks the backend the host supports.

pub mod commands;
pub mod events;
pub mod host;
pub mod ledger;
pub mod protocol;
pub mod selector;
pub mod session;
pub mod webrequest;

pub use events::*;
pub use host::*;
pub use ledger::{is_http, Ledger, LedgerLimits, RequestRecord};
pub use protocol::ProtocolCapture;
pub use selector::Capture;
pub use session::{Session, SessionKey, SessionRegistry};
pub use webrequest::WebRequestCapture;

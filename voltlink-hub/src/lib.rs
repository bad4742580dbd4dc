//! Realtime fan-out hub.
//!
//! Keeps the set of live viewer connections, sends each new viewer a state
//! snapshot, broadcasts poller and bus updates as JSON envelopes and routes
//! viewer commands to a [`CommandSink`](voltlink_common::CommandSink).

pub mod hub;
pub mod protocol;
pub mod ws;

pub use hub::{Hub, VIEWER_QUEUE, ViewerId, ViewerState};
pub use protocol::{INVALID_FORMAT, ProtocolError, ViewerRequest, parse_frame};
pub use ws::{serve_viewer, ws_handler};

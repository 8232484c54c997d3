//! Analysis status polling.
//!
//! A diary's AI analysis runs asynchronously on the server. `StatusPoller`
//! watches one job until it completes or fails and delivers what it sees as
//! `PollEvent`s on a channel.

pub mod status;

pub use status::{PollEvent, PollEventKind, PollHandle, StatusPoller, DEFAULT_POLL_INTERVAL};

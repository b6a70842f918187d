//! # Audio Module
//!
//! Per-guild playback coordination.
//!
//! ## Architecture
//!
//! ### [`player`] - Playback Engine
//! - Owns the per-session state machine (Idle, Playing, PendingReconnect)
//! - Decides loop, next or idle when a track completes
//! - Resumes play-now tracks after an unexpected disconnect
//!
//! ### [`queue`] - Track Queue
//! - FIFO of fetched tracks with an async blocking pop
//!
//! ### [`session`] - Session Registry
//! - One lazily created [`session::Session`] per guild, reaped when idle
//!
//! ### [`supervisor`] - Connection Supervisor
//! - Join, leave and single-attempt reconnect
//! - Tells expected disconnects apart from real connection loss
//!
//! ### [`tracker`] - Elapsed Time
//! - Samples playback position into the session once per interval
//!
//! ### [`transport`] and [`songbird_transport`]
//! - The backend boundary and its songbird implementation

pub mod player;
pub mod queue;
pub mod session;
pub mod songbird_transport;
pub mod supervisor;
pub mod tracker;
pub mod transport;

#[cfg(test)]
pub(crate) mod testing;

//! Wire model shared by the activity and workflow bridges.
//!
//! - **protocol**: frames, exchanges, failures, per-exchange context
//! - **command**: the closed command set and its name boundary
//! - **codec**: wire formats and the request/result round trip
//! - **sequence**: message id allocation

pub mod codec;
pub mod command;
pub mod protocol;
pub mod sequence;

//! Unix-socket transport for [`CsiMessage`](crate::message::CsiMessage).
//!
//! One request per connection: the client writes a JSON request and shuts
//! down its write half, the server reads to EOF, dispatches, and writes the
//! JSON response before closing.
//!
//! A request whose client disconnects is still carried to completion, so an
//! external tool already spawned for it is never interrupted.

pub mod client;
pub mod dispatch;
pub mod server;

pub use client::CsiClient;
pub use dispatch::Dispatch;
pub use server::CsiServer;

/// Upper bound on a single encoded message.
pub const MAX_MESSAGE_BYTES: u64 = 16 * 1024 * 1024;

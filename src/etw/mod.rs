//! ETW side of the trace: session management and record decoding.
//!
//! `decode` is pure byte-layout knowledge and stays portable; `session`
//! talks to the native controller/consumer APIs and only exists on Windows.

pub mod decode;

#[cfg(windows)]
mod session;

#[cfg(windows)]
pub use session::EtwSession;

// src/lib.rs
// ────────────────────────────────────────────────────────────────────────────
// Scoped tracing of native DLL loads in the current process.
//
// A `Trace` drains a real-time ETW session filtered to image-load records
// and, optionally, mirrors ntdll's synchronous DLL-notification callbacks,
// normalizing both into one event stream routed to text/collect sinks for
// the duration of the scope. Self-tracing only; the ETW pieces require
// Windows (and an elevated process), everything else is portable.

pub mod config;
pub mod error;
pub mod etw;
pub mod events;
pub mod sink;
pub mod trace;

#[cfg(windows)]
pub mod audit;

pub use error::{SessionStartError, StopReport, TraceError};
pub use events::{DebugEvent, LoadEvent, LoadSource, TraceEvent};
pub use sink::{CollectSink, EventSink, SinkSet, TextSink};
pub use trace::{EventSource, Trace, TraceOptions};

//! Error taxonomy for trace sessions.
//!
//! Two layers, mirroring how the native failures actually split:
//! - [`SessionStartError`]: the ETW controller refused to create or enable
//!   the session. Always surfaced synchronously from `start()`.
//! - [`TraceError`]: everything a caller of the trace context can see,
//!   including the above.
//!
//! Teardown problems are deliberately *not* errors: a join that exceeds its
//! bound or a controller stop with an odd status is recorded in a
//! [`StopReport`] and logged, but never prevents scope exit from completing.

use thiserror::Error;

/// The ETW trace session could not be created or enabled.
#[derive(Debug, Error)]
pub enum SessionStartError {
    /// A session with this name is already registered with the OS.
    /// Overlapping traces in one process must use distinct session names.
    #[error("trace session '{name}' already exists")]
    AlreadyExists { name: String },

    /// Creating a system-logger session requires administrative privilege.
    #[error("access denied creating trace session (run elevated)")]
    AccessDenied,

    /// Any other controller or consumer failure, tagged with the API that
    /// reported it.
    #[error("{op} failed with Win32 error {code}")]
    Os { op: &'static str, code: u32 },
}

/// All the ways a trace scope can fail.
#[derive(Debug, Error)]
pub enum TraceError {
    #[error(transparent)]
    SessionStart(#[from] SessionStartError),

    /// The requested facility does not exist in this environment. Raised for
    /// the loader-notification bridge when ntdll does not export the
    /// registration entry points, and for any native source on a
    /// non-Windows host. Distinct from session-level failures so callers can
    /// degrade gracefully.
    #[error("unsupported on this runtime: {0}")]
    Unsupported(&'static str),

    /// The loader-notification facility exists but rejected registration.
    #[error("DLL notification registration failed (NTSTATUS {status:#010x})")]
    HookRegister { status: i32 },

    /// Scope entered or exited out of sequence. Programmer error.
    #[error("trace is {actual}, expected {expected}")]
    InvalidState {
        expected: &'static str,
        actual: &'static str,
    },
}

/// Non-fatal teardown outcome. Resources are released either way; a dirty
/// report means diagnostics may be incomplete, not that the scope failed.
#[derive(Debug, Clone, Default)]
pub struct StopReport {
    /// The consumer thread did not confirm exit within the configured bound.
    pub join_timed_out: bool,
    /// Unexpected status from the controller stop call, if any.
    pub control_status: Option<u32>,
}

impl StopReport {
    /// True when teardown completed with nothing worth reporting.
    pub fn is_clean(&self) -> bool {
        !self.join_timed_out && self.control_status.is_none()
    }

    /// Fold another source's report into this one.
    pub fn merge(&mut self, other: &StopReport) {
        self.join_timed_out |= other.join_timed_out;
        if self.control_status.is_none() {
            self.control_status = other.control_status;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn start_errors_render_with_context() {
        let e = SessionStartError::AlreadyExists { name: "dlltrace-1".into() };
        assert!(e.to_string().contains("dlltrace-1"));

        let e = SessionStartError::Os { op: "StartTraceW", code: 1450 };
        assert!(e.to_string().contains("StartTraceW"));
        assert!(e.to_string().contains("1450"));
    }

    #[test]
    fn stop_report_merge_keeps_worst_outcome() {
        let mut a = StopReport::default();
        assert!(a.is_clean());

        let b = StopReport { join_timed_out: true, control_status: None };
        a.merge(&b);
        assert!(a.join_timed_out);
        assert!(!a.is_clean());

        let c = StopReport { join_timed_out: false, control_status: Some(6) };
        a.merge(&c);
        assert_eq!(a.control_status, Some(6));
    }
}

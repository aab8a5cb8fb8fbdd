//! Unified event model for the trace stream.
//!
//! Both detectors (the ETW consumer and the loader-notification bridge)
//! normalize their observations into [`TraceEvent`] before anything touches
//! a sink, so downstream code handles one stream regardless of origin.
//!
//! Events are write-once: constructed by whichever source observed the
//! occurrence, timestamped at that moment, immutable afterwards. Each
//! variant serializes to JSON (for the CLI's JSON-lines mode) and renders
//! one non-empty text line, and rendering never fails, even for records
//! with zero-length payloads.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fmt;

/// One event observed during an active trace scope.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", content = "payload")]
pub enum TraceEvent {
    Load(LoadEvent),
    Debug(DebugEvent),
}

impl fmt::Display for TraceEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TraceEvent::Load(e) => e.fmt(f),
            TraceEvent::Debug(e) => e.fmt(f),
        }
    }
}

/// Which detector observed a load.
///
/// When both sources are enabled, one physical load may surface twice, once
/// per source, in unspecified relative order. The tag keeps the two
/// observations distinguishable; nothing deduplicates them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum LoadSource {
    /// Kernel image-load record delivered through the ETW session.
    Etw,
    /// Synchronous ntdll DLL-notification on the importing thread.
    Hook,
}

impl fmt::Display for LoadSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LoadSource::Etw => write!(f, "etw"),
            LoadSource::Hook => write!(f, "hook"),
        }
    }
}

/// One native module brought into the process.
#[derive(Debug, Clone, Serialize)]
pub struct LoadEvent {
    pub ts: DateTime<Utc>,
    pub source: LoadSource,
    /// Absolute path of the loaded module. Never empty: sources drop
    /// notifications they cannot resolve to a path instead of constructing
    /// a partial event.
    pub path: String,
}

impl LoadEvent {
    pub fn new(source: LoadSource, path: impl Into<String>) -> Self {
        Self { ts: Utc::now(), source, path: path.into() }
    }

    /// Lowercased file stem, computed on demand. ETW reports kernel-style
    /// paths (`\Device\HarddiskVolumeN\...`) while the loader hook reports
    /// Win32 paths, so matching in tests and diagnostics goes through the
    /// stem rather than the full path.
    pub fn stem(&self) -> String {
        let name = self.path.rsplit(['\\', '/']).next().unwrap_or(&self.path);
        let stem = name.rsplit_once('.').map_or(name, |(s, _)| s);
        stem.to_lowercase()
    }
}

impl fmt::Display for LoadEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.path)
    }
}

/// One raw trace record, surfaced verbatim in debug mode regardless of
/// whether it decodes as a load.
#[derive(Debug, Clone, Serialize)]
pub struct DebugEvent {
    pub ts: DateTime<Utc>,
    /// Canonical GUID string of the provider that emitted the record.
    pub provider: String,
    /// Event sub-type within that provider.
    pub opcode: u8,
    /// Raw bytes of the fixed-size record header. May be empty, never absent.
    #[serde(with = "hex_bytes")]
    pub header: Vec<u8>,
    /// Raw payload bytes. Length varies per record. May be empty, never absent.
    #[serde(with = "hex_bytes")]
    pub data: Vec<u8>,
}

impl DebugEvent {
    pub fn new(provider: impl Into<String>, opcode: u8, header: Vec<u8>, data: Vec<u8>) -> Self {
        Self { ts: Utc::now(), provider: provider.into(), opcode, header, data }
    }
}

impl fmt::Display for DebugEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "DebugEvent(provider={}, opcode={}, header[{}]={}, data[{}]={})",
            self.provider,
            self.opcode,
            self.header.len(),
            hex::encode(&self.header),
            self.data.len(),
            hex::encode(&self.data),
        )
    }
}

/// Serialize raw byte fields as hex strings instead of JSON arrays.
mod hex_bytes {
    use serde::Serializer;

    pub fn serialize<S: Serializer>(bytes: &[u8], ser: S) -> Result<S::Ok, S::Error> {
        ser.serialize_str(&hex::encode(bytes))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn load_event_renders_path() {
        let e = LoadEvent::new(LoadSource::Etw, r"C:\Windows\System32\_ssl.pyd");
        let text = e.to_string();
        assert!(!text.is_empty());
        assert!(text.contains("_ssl.pyd"));
    }

    #[test]
    fn stem_is_case_insensitive_and_separator_agnostic() {
        let e = LoadEvent::new(LoadSource::Hook, r"C:\Py\DLLs\_HashLib.PYD");
        assert_eq!(e.stem(), "_hashlib");

        let e = LoadEvent::new(LoadSource::Etw, r"\Device\HarddiskVolume3\x\_ssl.pyd");
        assert_eq!(e.stem(), "_ssl");

        let e = LoadEvent::new(LoadSource::Etw, "noext");
        assert_eq!(e.stem(), "noext");
    }

    #[test]
    fn debug_event_renders_even_when_empty() {
        let e = DebugEvent::new("2cb15d1d-5fc1-11d2-abe1-00a0c911f518", 10, Vec::new(), Vec::new());
        let text = e.to_string();
        assert!(!text.is_empty());
        assert!(text.contains("opcode=10"));
    }

    #[test]
    fn events_serialize_to_tagged_json() {
        let ev = TraceEvent::Load(LoadEvent::new(LoadSource::Hook, r"C:\x\a.dll"));
        let json = serde_json::to_string(&ev).unwrap();
        assert!(json.contains(r#""type":"Load""#));

        let ev = TraceEvent::Debug(DebugEvent::new("p", 1, vec![0xab], vec![0xcd, 0xef]));
        let json = serde_json::to_string(&ev).unwrap();
        assert!(json.contains(r#""header":"ab""#));
        assert!(json.contains(r#""data":"cdef""#));
    }
}

//! Real-time ETW session for kernel image-load records.
//!
//! One `EtwSession` owns the whole native lifecycle: start a system-logger
//! session with the image-load kernel flag, open a real-time consumer over
//! it, and run `ProcessTrace` on a dedicated thread until the controller is
//! stopped. Decoded events flow straight into the shared [`SinkSet`];
//! records are forwarded in the order the OS delivers buffers, with no
//! buffering of our own on top.
//!
//! Key responsibilities:
//! - Map controller failures (name collision, missing privilege) to
//!   [`SessionStartError`] synchronously from `start`.
//! - Decode image-load records for this process; skip malformed ones.
//! - Wrap every delivered record as a raw [`DebugEvent`] in debug mode.
//! - Tear down with a bounded join so a wedged consumer cannot hang the
//!   caller; OS resources are released either way.

use crate::error::{SessionStartError, StopReport, TraceError};
use crate::etw::decode;
use crate::events::{DebugEvent, LoadEvent, LoadSource, TraceEvent};
use crate::sink::SinkSet;
use crate::trace::EventSource;
use crossbeam::channel::{self, Receiver};
use std::ffi::{OsStr, c_void};
use std::os::windows::prelude::OsStrExt;
use std::{mem, ptr, slice, thread, time::Duration};
use windows_sys::Win32::Foundation::{
    ERROR_ACCESS_DENIED, ERROR_ALREADY_EXISTS, ERROR_CANCELLED, ERROR_CTX_CLOSE_PENDING,
    ERROR_SUCCESS,
};
use windows_sys::Win32::System::Diagnostics::Etw::{
    CONTROLTRACE_HANDLE, CloseTrace, ControlTraceW, EVENT_HEADER, EVENT_RECORD,
    EVENT_TRACE_CONTROL_STOP, EVENT_TRACE_FLAG_IMAGE_LOAD, EVENT_TRACE_LOGFILEW,
    EVENT_TRACE_PROPERTIES, EVENT_TRACE_REAL_TIME_MODE, EVENT_TRACE_SYSTEM_LOGGER_MODE,
    OpenTraceW, PROCESS_TRACE_MODE_EVENT_RECORD, PROCESS_TRACE_MODE_REAL_TIME,
    PROCESSTRACE_HANDLE, ProcessTrace, StartTraceW, WNODE_FLAG_TRACED_GUID,
};
use windows_sys::core::GUID;

/// OpenTraceW failure sentinel.
const INVALID_CONSUMER: PROCESSTRACE_HANDLE = PROCESSTRACE_HANDLE::MAX;

/// `EVENT_HEADER.Flags` bit: record came from a 32-bit logger.
const HEADER_FLAG_32_BIT: u16 = 0x0020;

/// Shared state the record callback reads. Allocated on `start`, freed only
/// once the consumer thread has confirmed exit.
struct ConsumerCtx {
    sinks: SinkSet,
    debug: bool,
    pid: u32,
}

/// Live native state between `start` and `stop`.
struct Running {
    control: CONTROLTRACE_HANDLE,
    consumer: PROCESSTRACE_HANDLE,
    thread: Option<thread::JoinHandle<()>>,
    done_rx: Receiver<u32>,
    ctx: *mut ConsumerCtx,
    // Keeps the logger-name buffer alive for the handles' lifetime.
    _name_w: Vec<u16>,
}

// The raw context pointer is only ever dereferenced by the consumer
// callback and freed after that thread confirms exit; the handles are plain
// OS identifiers.
unsafe impl Send for Running {}

/// Bridges the kernel image-load tracing facility to the event model.
pub struct EtwSession {
    name: String,
    debug: bool,
    stop_timeout: Duration,
    inner: Option<Running>,
}

impl EtwSession {
    pub fn new(name: String, debug: bool, stop_timeout: Duration) -> Self {
        Self { name, debug, stop_timeout, inner: None }
    }

    /// Session name registered with the OS controller.
    pub fn session_name(&self) -> &str {
        &self.name
    }
}

impl EventSource for EtwSession {
    fn name(&self) -> &'static str {
        "etw"
    }

    fn start(&mut self, sinks: &SinkSet) -> Result<(), TraceError> {
        if self.inner.is_some() {
            return Err(TraceError::InvalidState { expected: "stopped session", actual: "running" });
        }

        let mut name_w = wide(&self.name);

        /* ── 1 ▸ start the controller session ─────────────────────────── */
        let mut props = PropertiesBuf::new(&name_w);
        let mut control: CONTROLTRACE_HANDLE = 0;
        let status =
            unsafe { StartTraceW(&mut control, name_w.as_ptr(), props.as_mut_ptr()) };
        match status {
            ERROR_SUCCESS => {}
            ERROR_ALREADY_EXISTS => {
                return Err(SessionStartError::AlreadyExists { name: self.name.clone() }.into());
            }
            ERROR_ACCESS_DENIED => return Err(SessionStartError::AccessDenied.into()),
            code => return Err(SessionStartError::Os { op: "StartTraceW", code }.into()),
        }
        log::info!("ETW session '{}' started", self.name);

        /* ── 2 ▸ open the real-time consumer over it ──────────────────── */
        let ctx = Box::into_raw(Box::new(ConsumerCtx {
            sinks: sinks.clone(),
            debug: self.debug,
            pid: std::process::id(),
        }));

        let mut logfile: EVENT_TRACE_LOGFILEW = unsafe { mem::zeroed() };
        logfile.LoggerName = name_w.as_mut_ptr();
        logfile.Anonymous1.ProcessTraceMode =
            PROCESS_TRACE_MODE_REAL_TIME | PROCESS_TRACE_MODE_EVENT_RECORD;
        logfile.Anonymous2.EventRecordCallback = Some(event_record_callback);
        logfile.Context = ctx as *mut c_void;

        let consumer = unsafe { OpenTraceW(&mut logfile) };
        if consumer == INVALID_CONSUMER {
            let code = unsafe { windows_sys::Win32::Foundation::GetLastError() };
            self.abort_start(control, &name_w, ctx);
            return Err(SessionStartError::Os { op: "OpenTraceW", code }.into());
        }

        /* ── 3 ▸ dedicated consumer thread, blocked in ProcessTrace ───── */
        let (done_tx, done_rx) = channel::bounded(1);
        let spawned = thread::Builder::new()
            .name("dlltrace-etw-consumer".into())
            .spawn(move || {
                let status = unsafe { ProcessTrace(&consumer, 1, ptr::null(), ptr::null()) };
                let _ = done_tx.send(status);
            });
        let handle = match spawned {
            Ok(h) => h,
            Err(e) => {
                unsafe { CloseTrace(consumer) };
                self.abort_start(control, &name_w, ctx);
                let code = e.raw_os_error().unwrap_or(0) as u32;
                return Err(SessionStartError::Os { op: "consumer thread spawn", code }.into());
            }
        };

        self.inner = Some(Running {
            control,
            consumer,
            thread: Some(handle),
            done_rx,
            ctx,
            _name_w: name_w,
        });
        Ok(())
    }

    /// Idempotent: stopping a never-started or already-stopped session is a
    /// no-op with a clean report.
    fn stop(&mut self) -> Result<StopReport, TraceError> {
        let Some(mut run) = self.inner.take() else {
            return Ok(StopReport::default());
        };
        let mut report = StopReport::default();

        /* ── 1 ▸ stop the controller; residual buffers flush to the
         *        consumer before ProcessTrace returns ──────────────────── */
        let mut props = PropertiesBuf::new(&wide(&self.name));
        let status = unsafe {
            ControlTraceW(run.control, ptr::null(), props.as_mut_ptr(), EVENT_TRACE_CONTROL_STOP)
        };
        if status != ERROR_SUCCESS {
            log::warn!("ControlTraceW(STOP) on '{}' returned {status}", self.name);
            report.control_status = Some(status);
        }

        /* ── 2 ▸ close the consumer handle ────────────────────────────── */
        let status = unsafe { CloseTrace(run.consumer) };
        if status != ERROR_SUCCESS && status != ERROR_CTX_CLOSE_PENDING {
            log::warn!("CloseTrace on '{}' returned {status}", self.name);
        }

        /* ── 3 ▸ bounded join on the consumer thread ──────────────────── */
        match run.done_rx.recv_timeout(self.stop_timeout) {
            Ok(status) => {
                if let Some(t) = run.thread.take() {
                    let _ = t.join();
                }
                if status != ERROR_SUCCESS && status != ERROR_CANCELLED {
                    log::debug!("ProcessTrace exited with status {status}");
                }
                // Thread confirmed exit: the callback can no longer run.
                unsafe { drop(Box::from_raw(run.ctx)) };
            }
            Err(_) => {
                // The consumer may still be inside the record callback; the
                // context stays allocated so it can never dangle under it.
                report.join_timed_out = true;
                log::warn!(
                    "ETW consumer for '{}' did not exit within {:?}",
                    self.name,
                    self.stop_timeout
                );
            }
        }

        log::info!("ETW session '{}' stopped", self.name);
        Ok(report)
    }
}

impl EtwSession {
    /// Roll back a half-completed `start`.
    fn abort_start(&self, control: CONTROLTRACE_HANDLE, name_w: &[u16], ctx: *mut ConsumerCtx) {
        let mut props = PropertiesBuf::new(name_w);
        unsafe {
            ControlTraceW(control, ptr::null(), props.as_mut_ptr(), EVENT_TRACE_CONTROL_STOP);
            drop(Box::from_raw(ctx));
        }
    }
}

impl Drop for EtwSession {
    fn drop(&mut self) {
        if self.inner.is_some() {
            let _ = self.stop();
        }
    }
}

/// NUL-terminated UTF-16 for the Win32 W-APIs.
fn wide(s: &str) -> Vec<u16> {
    OsStr::new(s).encode_wide().chain(Some(0)).collect()
}

/// `EVENT_TRACE_PROPERTIES` with the logger name appended, as the
/// controller APIs expect: one allocation, offsets into it.
struct PropertiesBuf {
    buf: Vec<u8>,
}

impl PropertiesBuf {
    fn new(name_w: &[u16]) -> Self {
        let total = mem::size_of::<EVENT_TRACE_PROPERTIES>() + name_w.len() * 2;
        let mut buf = vec![0u8; total];
        let props = buf.as_mut_ptr() as *mut EVENT_TRACE_PROPERTIES;
        unsafe {
            (*props).Wnode.BufferSize = total as u32;
            (*props).Wnode.ClientContext = 1; // QPC timestamps
            (*props).Wnode.Flags = WNODE_FLAG_TRACED_GUID;
            (*props).LogFileMode = EVENT_TRACE_REAL_TIME_MODE | EVENT_TRACE_SYSTEM_LOGGER_MODE;
            (*props).EnableFlags = EVENT_TRACE_FLAG_IMAGE_LOAD;
            (*props).LoggerNameOffset = mem::size_of::<EVENT_TRACE_PROPERTIES>() as u32;
        }
        Self { buf }
    }

    fn as_mut_ptr(&mut self) -> *mut EVENT_TRACE_PROPERTIES {
        self.buf.as_mut_ptr() as *mut EVENT_TRACE_PROPERTIES
    }
}

/* ──────────────────────── record consumption ─────────────────────────── */

unsafe extern "system" fn event_record_callback(record: *mut EVENT_RECORD) {
    if record.is_null() {
        return;
    }
    let record = unsafe { &*record };
    let ctx = record.UserContext as *const ConsumerCtx;
    if ctx.is_null() {
        return;
    }
    let ctx = unsafe { &*ctx };
    handle_record(record, ctx);
}

fn handle_record(record: &EVENT_RECORD, ctx: &ConsumerCtx) {
    let header = &record.EventHeader;
    let data: &[u8] = if record.UserData.is_null() || record.UserDataLength == 0 {
        &[]
    } else {
        unsafe {
            slice::from_raw_parts(record.UserData as *const u8, record.UserDataLength as usize)
        }
    };

    if ctx.debug {
        // Verbatim pass-through of every delivered record.
        let header_bytes = unsafe {
            slice::from_raw_parts(
                header as *const EVENT_HEADER as *const u8,
                mem::size_of::<EVENT_HEADER>(),
            )
        };
        ctx.sinks.emit(TraceEvent::Debug(DebugEvent::new(
            guid_string(&header.ProviderId),
            header.EventDescriptor.Opcode,
            header_bytes.to_vec(),
            data.to_vec(),
        )));
        return;
    }

    if guid_to_u128(&header.ProviderId) != decode::IMAGE_LOAD_PROVIDER
        || header.EventDescriptor.Opcode != decode::OPCODE_IMAGE_LOAD
        || header.ProcessId != ctx.pid
    {
        return;
    }

    let pointer_size = if header.Flags & HEADER_FLAG_32_BIT != 0 { 4 } else { 8 };
    match decode::image_load_path(data, header.EventDescriptor.Version, pointer_size) {
        Some(path) => ctx.sinks.emit(TraceEvent::Load(LoadEvent::new(LoadSource::Etw, path))),
        // Malformed record: skip it, never abort the session.
        None => log::debug!("skipped undecodable image-load record ({} bytes)", data.len()),
    }
}

fn guid_to_u128(g: &GUID) -> u128 {
    ((g.data1 as u128) << 96)
        | ((g.data2 as u128) << 80)
        | ((g.data3 as u128) << 64)
        | (u64::from_be_bytes(g.data4) as u128)
}

fn guid_string(g: &GUID) -> String {
    decode::format_guid(g.data1, g.data2, g.data3, g.data4)
}

//! Trace context: the scoped session callers actually hold.
//!
//! `Trace` owns the configuration, the sinks and the event sources for one
//! bounded region of execution, and walks the state machine
//! `Idle → Active → Closed`. Entry starts the ETW session and/or the
//! loader hook; exit stops the hook first (no new synchronous events), then
//! the session (bounded join, residual buffers drained), then finalizes the
//! sinks and hands back whatever was collected. A still-active context
//! dropped mid-panic runs the same teardown exactly once; the OS session
//! never outlives the scope.

use crate::error::{StopReport, TraceError};
use crate::events::TraceEvent;
use crate::sink::{CollectSink, EventSink, SinkSet, TextSink};
use std::io::Write;
use std::sync::Arc;
#[cfg(windows)]
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

/// Distinguishes instances within one process so overlapping traces get
/// distinct OS session names by default.
#[cfg(windows)]
static SESSION_SEQ: AtomicU32 = AtomicU32::new(0);

const DEFAULT_STOP_TIMEOUT: Duration = Duration::from_secs(2);

/// One source of trace events with an explicit start/stop lifecycle.
///
/// The two native implementations are the ETW session and the loader
/// notification hook; tests drive the state machine with scripted sources.
/// `stop` must be idempotent: stopping a stopped source is a no-op.
pub trait EventSource: Send {
    /// Display name for logs.
    fn name(&self) -> &'static str;

    /// Begin producing events into `sinks`. A source holds its own clone of
    /// the set for the lifetime of the session.
    fn start(&mut self, sinks: &SinkSet) -> Result<(), TraceError>;

    /// Stop producing events and release native resources. Non-fatal
    /// teardown trouble goes in the report, never in `Err`.
    fn stop(&mut self) -> Result<StopReport, TraceError>;
}

/// Where rendered text goes, before the options are resolved at start.
enum OutMode {
    /// Nothing requested: stderr, unless `collect` is on.
    Auto,
    /// Explicitly silenced.
    Off,
    Writer(Box<dyn Write + Send>),
}

/// Configuration for one trace scope, fixed once the scope starts.
pub struct TraceOptions {
    out: OutMode,
    collect: bool,
    audit: bool,
    debug: bool,
    session_name: Option<String>,
    stop_timeout: Duration,
}

impl TraceOptions {
    pub fn new() -> Self {
        Self {
            out: OutMode::Auto,
            collect: false,
            audit: false,
            debug: false,
            session_name: None,
            stop_timeout: DEFAULT_STOP_TIMEOUT,
        }
    }

    /// Render each event as one line into `writer`. Implies the ETW session.
    pub fn out(mut self, writer: impl Write + Send + 'static) -> Self {
        self.out = OutMode::Writer(Box::new(writer));
        self
    }

    /// Suppress the default stderr rendering.
    pub fn quiet(mut self) -> Self {
        self.out = OutMode::Off;
        self
    }

    /// Collect events into a sequence returned from `stop`. Implies the ETW
    /// session and, on its own, suppresses the default stderr rendering.
    pub fn collect(mut self, yes: bool) -> Self {
        self.collect = yes;
        self
    }

    /// Also observe loads from inside the loader's notification list.
    pub fn audit(mut self, yes: bool) -> Self {
        self.audit = yes;
        self
    }

    /// Emit every delivered ETW record verbatim as a [`crate::DebugEvent`]
    /// instead of decoding loads. Implies the ETW session.
    pub fn debug(mut self, yes: bool) -> Self {
        self.debug = yes;
        self
    }

    /// Override the OS trace-session name. Overlapping traces in one
    /// process must not share a name.
    pub fn session_name(mut self, name: impl Into<String>) -> Self {
        self.session_name = Some(name.into());
        self
    }

    /// Bound on the consumer-thread join during stop.
    pub fn stop_timeout(mut self, timeout: Duration) -> Self {
        self.stop_timeout = timeout;
        self
    }

    fn take_text_sink(&mut self) -> Option<TextSink> {
        match std::mem::replace(&mut self.out, OutMode::Off) {
            OutMode::Writer(w) => Some(TextSink::new(w)),
            OutMode::Auto if !self.collect => Some(TextSink::stderr()),
            OutMode::Auto | OutMode::Off => None,
        }
    }
}

impl Default for TraceOptions {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TraceState {
    Idle,
    Active,
    Closed,
}

impl TraceState {
    fn name(self) -> &'static str {
        match self {
            TraceState::Idle => "idle",
            TraceState::Active => "active",
            TraceState::Closed => "closed",
        }
    }
}

/// A scoped DLL load trace. See the module docs for the lifecycle.
pub struct Trace {
    state: TraceState,
    options: TraceOptions,
    /// `Some` when sources were injected instead of platform-built.
    injected: Option<Vec<Box<dyn EventSource>>>,
    sources: Vec<Box<dyn EventSource>>,
    sinks: Option<SinkSet>,
    collect: Option<Arc<CollectSink>>,
    report: StopReport,
}

impl Trace {
    pub fn new(options: TraceOptions) -> Self {
        Self {
            state: TraceState::Idle,
            options,
            injected: None,
            sources: Vec::new(),
            sinks: None,
            collect: None,
            report: StopReport::default(),
        }
    }

    /// Build a trace over caller-supplied sources instead of the platform
    /// ones. This is the seam custom detectors and the state-machine tests
    /// plug into; sink construction and teardown ordering are unchanged.
    pub fn with_sources(options: TraceOptions, sources: Vec<Box<dyn EventSource>>) -> Self {
        let mut trace = Self::new(options);
        trace.injected = Some(sources);
        trace
    }

    /// Scoped convenience: start, run `f`, stop. Teardown also runs if `f`
    /// panics, via `Drop`. Returns the collected events beside `f`'s output.
    pub fn run<F, R>(mut self, f: F) -> Result<(Vec<TraceEvent>, R), TraceError>
    where
        F: FnOnce() -> R,
    {
        self.start()?;
        let output = f();
        let events = self.stop()?;
        Ok((events, output))
    }

    /// Enter the scope: build sinks, construct and start the sources.
    ///
    /// On any source failure the already-started sources are stopped in
    /// reverse order and the context lands in `Closed`; a failed entry is
    /// not retryable.
    pub fn start(&mut self) -> Result<(), TraceError> {
        if self.state != TraceState::Idle {
            return Err(TraceError::InvalidState {
                expected: "idle",
                actual: self.state.name(),
            });
        }

        // The ETW session runs when any of out/collect/debug asks for a
        // record stream; decided before the writer option is consumed.
        let text_requested = match self.options.out {
            OutMode::Writer(_) => true,
            OutMode::Auto => !self.options.collect,
            OutMode::Off => false,
        };
        let needs_etw = text_requested || self.options.collect || self.options.debug;

        // 1 ─ sinks
        let mut sinks: Vec<Arc<dyn EventSink>> = Vec::new();
        if let Some(text) = self.options.take_text_sink() {
            sinks.push(Arc::new(text));
        }
        if self.options.collect {
            let collect = Arc::new(CollectSink::new());
            self.collect = Some(Arc::clone(&collect));
            sinks.push(collect);
        }
        let sinks = SinkSet::new(sinks);

        // 2 ─ sources
        let mut sources = match self.injected.take() {
            Some(sources) => sources,
            None => self.platform_sources(needs_etw)?,
        };
        if sources.is_empty() {
            log::warn!("trace scope has no event sources; nothing will be captured");
        }

        // 3 ─ start them, unwinding on failure
        for i in 0..sources.len() {
            if let Err(e) = sources[i].start(&sinks) {
                for started in sources[..i].iter_mut().rev() {
                    let _ = started.stop();
                }
                self.state = TraceState::Closed;
                return Err(e);
            }
            log::debug!("source '{}' started", sources[i].name());
        }

        self.sources = sources;
        self.sinks = Some(sinks);
        self.state = TraceState::Active;
        Ok(())
    }

    /// Exit the scope and return the collected sequence (empty unless
    /// `collect` was requested).
    pub fn stop(&mut self) -> Result<Vec<TraceEvent>, TraceError> {
        if self.state != TraceState::Active {
            return Err(TraceError::InvalidState {
                expected: "active",
                actual: self.state.name(),
            });
        }
        Ok(self.teardown())
    }

    /// Non-fatal warnings from the most recent teardown.
    pub fn stop_report(&self) -> &StopReport {
        &self.report
    }

    /// Full teardown; runs at most once. Sources stop in reverse start
    /// order so the synchronous hook goes quiet before the ETW session
    /// drains its residual buffers; only then do the sinks finalize.
    fn teardown(&mut self) -> Vec<TraceEvent> {
        self.state = TraceState::Closed;

        for source in self.sources.iter_mut().rev() {
            match source.stop() {
                Ok(report) => self.report.merge(&report),
                Err(e) => log::warn!("source '{}' failed to stop: {e}", source.name()),
            }
        }
        self.sources.clear();

        if let Some(sinks) = self.sinks.take() {
            sinks.flush();
        }
        if !self.report.is_clean() {
            log::warn!("trace teardown finished with warnings: {:?}", self.report);
        }

        self.collect.take().map(|c| c.take()).unwrap_or_default()
    }

    /// The native sources this configuration asks for.
    #[cfg(windows)]
    fn platform_sources(&mut self, needs_etw: bool) -> Result<Vec<Box<dyn EventSource>>, TraceError> {
        let mut sources: Vec<Box<dyn EventSource>> = Vec::new();

        if needs_etw {
            let name = self.options.session_name.clone().unwrap_or_else(|| {
                format!(
                    "dlltrace-{}-{}",
                    std::process::id(),
                    SESSION_SEQ.fetch_add(1, Ordering::Relaxed)
                )
            });
            sources.push(Box::new(crate::etw::EtwSession::new(
                name,
                self.options.debug,
                self.options.stop_timeout,
            )));
        }
        if self.options.audit {
            sources.push(Box::new(crate::audit::LoaderHook::new()));
        }
        Ok(sources)
    }

    #[cfg(not(windows))]
    fn platform_sources(&mut self, needs_etw: bool) -> Result<Vec<Box<dyn EventSource>>, TraceError> {
        if needs_etw || self.options.audit {
            return Err(TraceError::Unsupported("DLL load tracing requires Windows"));
        }
        Ok(Vec::new())
    }
}

impl Drop for Trace {
    fn drop(&mut self) {
        if self.state == TraceState::Active {
            log::warn!("trace scope dropped while active; tearing down");
            let _ = self.teardown();
        }
    }
}

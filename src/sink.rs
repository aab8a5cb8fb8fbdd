//! Event sinks and the fan-out set shared by all sources.
//!
//! Sinks are the one resource touched from multiple threads at once: the
//! ETW consumer thread and whatever caller thread happens to be inside the
//! loader when a notification fires. The contract is therefore small and
//! strictly thread-safe: `accept` one event, optionally `flush` at session
//! end. Loader notifications run inline with module loading, so a slow
//! sink directly stalls the load; implementations must stay cheap.

use crate::events::TraceEvent;
use std::io::Write;
use std::sync::{Arc, Mutex};

/// Destination for a stream of trace events.
pub trait EventSink: Send + Sync {
    /// Deliver one event. Must be safe to call concurrently from multiple
    /// threads and must not panic: this runs inside OS callbacks.
    fn accept(&self, event: &TraceEvent);

    /// Called once during session teardown, after all sources have stopped.
    fn flush(&self) {}
}

/// Renders each event as one line into a writer, immediately.
///
/// The writer lives behind a mutex and every line is written in one call
/// while the lock is held, so concurrent producers can never interleave
/// partial lines. Write errors are swallowed: a broken output must not take
/// the trace session down with it.
pub struct TextSink {
    writer: Mutex<Box<dyn Write + Send>>,
}

impl TextSink {
    pub fn new(writer: impl Write + Send + 'static) -> Self {
        Self { writer: Mutex::new(Box::new(writer)) }
    }

    /// The default target when a trace is configured with no explicit sink.
    pub fn stderr() -> Self {
        Self::new(std::io::stderr())
    }
}

impl EventSink for TextSink {
    fn accept(&self, event: &TraceEvent) {
        if let Ok(mut w) = self.writer.lock() {
            let _ = writeln!(w, "{event}");
        }
    }

    fn flush(&self) {
        if let Ok(mut w) = self.writer.lock() {
            let _ = w.flush();
        }
    }
}

/// Appends events into an ordered in-memory sequence.
///
/// Append is the only mutating operation while a session is active; the
/// sequence cannot be iterated until [`CollectSink::take`] freezes it at
/// teardown, so concurrent appends from the ETW thread and caller threads
/// can never race a reader.
#[derive(Default)]
pub struct CollectSink {
    events: Mutex<Vec<TraceEvent>>,
}

impl CollectSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Move the collected sequence out, leaving the sink empty. The trace
    /// context calls this exactly once, after every source has stopped.
    pub fn take(&self) -> Vec<TraceEvent> {
        match self.events.lock() {
            Ok(mut guard) => std::mem::take(&mut *guard),
            Err(_) => Vec::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.events.lock().map(|g| g.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl EventSink for CollectSink {
    fn accept(&self, event: &TraceEvent) {
        if let Ok(mut guard) = self.events.lock() {
            guard.push(event.clone());
        }
    }
}

/// Cheaply clonable fan-out handle given to every source.
///
/// Sources hold a clone for the lifetime of the session and push each event
/// through it; the trace context keeps the original to flush at teardown.
#[derive(Clone)]
pub struct SinkSet {
    sinks: Arc<[Arc<dyn EventSink>]>,
}

impl SinkSet {
    pub fn new(sinks: Vec<Arc<dyn EventSink>>) -> Self {
        Self { sinks: Arc::from(sinks) }
    }

    /// Deliver one event to every sink, in registration order.
    pub fn emit(&self, event: TraceEvent) {
        for sink in self.sinks.iter() {
            sink.accept(&event);
        }
    }

    pub fn flush(&self) {
        for sink in self.sinks.iter() {
            sink.flush();
        }
    }

    pub fn is_empty(&self) -> bool {
        self.sinks.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{LoadEvent, LoadSource};
    use std::thread;

    fn load(path: &str) -> TraceEvent {
        TraceEvent::Load(LoadEvent::new(LoadSource::Etw, path))
    }

    /// Shared byte buffer standing in for a caller-provided output stream.
    #[derive(Clone, Default)]
    struct SharedBuf(Arc<Mutex<Vec<u8>>>);

    impl Write for SharedBuf {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }
        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn collect_sink_keeps_order_and_drains_once() {
        let sink = CollectSink::new();
        sink.accept(&load(r"C:\a\one.dll"));
        sink.accept(&load(r"C:\a\two.dll"));

        let events = sink.take();
        assert_eq!(events.len(), 2);
        assert!(events[0].to_string().contains("one.dll"));
        assert!(events[1].to_string().contains("two.dll"));

        // A second take sees the frozen, empty state.
        assert!(sink.take().is_empty());
    }

    #[test]
    fn collect_sink_accepts_concurrent_appends_without_loss() {
        let sink = Arc::new(CollectSink::new());
        let mut handles = Vec::new();
        for t in 0..4 {
            let sink = Arc::clone(&sink);
            handles.push(thread::spawn(move || {
                for i in 0..250 {
                    sink.accept(&load(&format!(r"C:\t{t}\m{i}.dll")));
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(sink.take().len(), 1000);
    }

    #[test]
    fn text_sink_never_interleaves_lines() {
        let buf = SharedBuf::default();
        let sink = Arc::new(TextSink::new(buf.clone()));

        let mut handles = Vec::new();
        for t in 0..4 {
            let sink = Arc::clone(&sink);
            handles.push(thread::spawn(move || {
                for i in 0..100 {
                    sink.accept(&load(&format!(r"C:\thread{t}\mod{i}.dll")));
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }
        sink.flush();

        let bytes = buf.0.lock().unwrap().clone();
        let text = String::from_utf8(bytes).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 400);
        // Every line is exactly one rendered event, start to finish.
        for line in lines {
            assert!(line.starts_with(r"C:\thread"), "interleaved line: {line}");
            assert!(line.ends_with(".dll"), "interleaved line: {line}");
        }
    }

    #[test]
    fn sink_set_fans_out_to_all_sinks() {
        let collect = Arc::new(CollectSink::new());
        let buf = SharedBuf::default();
        let text = Arc::new(TextSink::new(buf.clone()));

        let set = SinkSet::new(vec![
            text.clone() as Arc<dyn EventSink>,
            collect.clone() as Arc<dyn EventSink>,
        ]);
        set.emit(load(r"C:\w\fan.dll"));
        set.flush();

        assert_eq!(collect.len(), 1);
        let rendered = String::from_utf8(buf.0.lock().unwrap().clone()).unwrap();
        assert!(rendered.contains("fan.dll"));
    }
}

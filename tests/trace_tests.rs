//! Behavior of the public trace surface with caller-supplied sources.
//!
//! Everything here runs on any host: sources are implemented against the
//! public `EventSource` seam, so these tests exercise sink construction,
//! fan-out, scope semantics and rendering without touching ETW.

use dlltrace::{
    EventSource, LoadEvent, LoadSource, SinkSet, StopReport, Trace, TraceError, TraceEvent,
    TraceOptions,
};
use std::fs;
use std::io::Write;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;

/// A source that spawns producer threads at start, mimicking the real
/// consumer thread plus loader callbacks firing from caller threads.
struct ThreadedSource {
    per_thread: usize,
    threads: usize,
    workers: Vec<thread::JoinHandle<()>>,
    stops: Arc<AtomicUsize>,
}

impl ThreadedSource {
    fn new(threads: usize, per_thread: usize) -> Self {
        Self {
            per_thread,
            threads,
            workers: Vec::new(),
            stops: Arc::new(AtomicUsize::new(0)),
        }
    }
}

impl EventSource for ThreadedSource {
    fn name(&self) -> &'static str {
        "threaded"
    }

    fn start(&mut self, sinks: &SinkSet) -> Result<(), TraceError> {
        for t in 0..self.threads {
            let sinks = sinks.clone();
            let count = self.per_thread;
            self.workers.push(thread::spawn(move || {
                for i in 0..count {
                    sinks.emit(TraceEvent::Load(LoadEvent::new(
                        LoadSource::Hook,
                        format!(r"C:\producer{t}\module{i}.dll"),
                    )));
                }
            }));
        }
        Ok(())
    }

    fn stop(&mut self) -> Result<StopReport, TraceError> {
        // All producers are done before the scope is declared quiet.
        for worker in self.workers.drain(..) {
            let _ = worker.join();
        }
        self.stops.fetch_add(1, Ordering::SeqCst);
        Ok(StopReport::default())
    }
}

#[test]
fn concurrent_producers_lose_no_events() {
    let source = ThreadedSource::new(4, 100);
    let trace = Trace::with_sources(
        TraceOptions::new().quiet().collect(true),
        vec![Box::new(source)],
    );
    let (events, ()) = trace.run(|| ()).unwrap();

    assert_eq!(events.len(), 400);
    for event in &events {
        let TraceEvent::Load(load) = event else {
            panic!("unexpected event kind: {event}");
        };
        assert!(!load.path.is_empty());
        assert!(!event.to_string().is_empty());
    }
}

#[test]
fn text_output_lands_in_a_real_file() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("trace.txt");
    let file = fs::File::create(&path).unwrap();

    let source = ThreadedSource::new(1, 3);
    let mut trace = Trace::with_sources(TraceOptions::new().out(file), vec![Box::new(source)]);
    trace.start().unwrap();
    trace.stop().unwrap();

    let text = fs::read_to_string(&path).unwrap();
    assert_eq!(text.lines().count(), 3);
    assert!(text.contains("module0.dll"));
}

#[test]
fn out_and_collect_both_observe_every_event() {
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

    let buf = SharedBuf::default();
    let source = ThreadedSource::new(2, 10);
    let trace = Trace::with_sources(
        TraceOptions::new().out(buf.clone()).collect(true),
        vec![Box::new(source)],
    );
    let (events, ()) = trace.run(|| ()).unwrap();

    assert_eq!(events.len(), 20);
    let text = String::from_utf8(buf.0.lock().unwrap().clone()).unwrap();
    assert_eq!(text.lines().count(), 20);
}

#[test]
fn collected_events_serialize_as_json_lines() {
    let source = ThreadedSource::new(1, 2);
    let trace = Trace::with_sources(
        TraceOptions::new().quiet().collect(true),
        vec![Box::new(source)],
    );
    let (events, ()) = trace.run(|| ()).unwrap();

    for event in &events {
        let line = serde_json::to_string(event).unwrap();
        assert!(line.contains(r#""type":"Load""#));
        assert!(line.contains("module"));
    }
}

#[test]
fn source_stop_runs_exactly_once_even_via_run() {
    let source = ThreadedSource::new(1, 1);
    let stops = Arc::clone(&source.stops);
    let trace = Trace::with_sources(
        TraceOptions::new().quiet().collect(true),
        vec![Box::new(source)],
    );
    let _ = trace.run(|| ()).unwrap();

    assert_eq!(stops.load(Ordering::SeqCst), 1);
}

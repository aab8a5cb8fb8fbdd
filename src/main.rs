// src/main.rs

//! Probe tool: load the DLLs named on the command line under an active
//! trace and report every module the process pulled in along the way.
//!
//! 1. Read `dlltrace.toml` next to the executable (all settings optional)
//! 2. Set up structured logging
//! 3. Start a trace scope per the config
//! 4. Probe-load each requested DLL inside the scope
//! 5. Print the observed events (text or JSON lines) and exit non-zero if
//!    any requested module failed to load

#[cfg(windows)]
fn main() {
    std::process::exit(app::run());
}

#[cfg(not(windows))]
fn main() {
    eprintln!("dlltrace requires Windows (ETW and the loader are the trace sources)");
    std::process::exit(2);
}

#[cfg(windows)]
mod app {
    use anyhow::{Context, bail};
    use chrono::Local;
    use dlltrace::config::{LoggingConfig, ProbeConfig, load_probe_config};
    use dlltrace::{Trace, TraceOptions};
    use fern::Dispatch;
    use log::LevelFilter;
    use std::path::{Path, PathBuf};
    use std::{process, thread};
    use windows_sys::Win32::Foundation::GetLastError;
    use windows_sys::Win32::System::LibraryLoader::{FreeLibrary, LoadLibraryW};

    /// Print an error with context and terminate the process.
    macro_rules! fatal {
        ($ctx:expr, $($arg:tt)+) => {{
            eprintln!(
                "[{}][ERROR][{}] {}",
                chrono::Local::now().to_rfc3339(),
                $ctx,
                format!($($arg)+)
            );
            std::process::exit(1);
        }};
    }

    /// Directory that contains the running executable.
    fn exe_dir() -> PathBuf {
        std::env::current_exe()
            .expect("Cannot determine exe path")
            .parent()
            .expect("Executable must live in some directory")
            .to_path_buf()
    }

    /// Configure global logging as requested in `[logging]`.
    fn setup_logging(exe_dir: &Path, logging: &LoggingConfig) -> Result<(), fern::InitError> {
        let level = match logging.level.to_uppercase().as_str() {
            "ERROR" => LevelFilter::Error,
            "WARN" => LevelFilter::Warn,
            "DEBUG" => LevelFilter::Debug,
            "TRACE" => LevelFilter::Trace,
            _ => LevelFilter::Info,
        };

        let mut dispatch = Dispatch::new()
            .format(|out, msg, record| {
                out.finish(format_args!(
                    "[{}][{:5}][{}][pid={}][tid={:?}] {}",
                    Local::now().to_rfc3339(),
                    record.level(),
                    record.target(),
                    process::id(),
                    thread::current().id(),
                    msg
                ))
            })
            .level(level)
            .chain(std::io::stderr());

        if logging.enable {
            let file = logging.file.as_deref().unwrap_or("dlltrace.log");
            dispatch = dispatch.chain(fern::log_file(exe_dir.join(file))?);
        }

        dispatch.apply()?;
        Ok(())
    }

    /// Load one module; the trace sources observe the side effects. The
    /// handle is released again so repeated probes start from a clean
    /// loader state where the OS allows it.
    fn probe(module: &str) -> anyhow::Result<()> {
        let wide: Vec<u16> = module.encode_utf16().chain(Some(0)).collect();
        let handle = unsafe { LoadLibraryW(wide.as_ptr()) };
        if handle.is_null() {
            let code = unsafe { GetLastError() };
            bail!("LoadLibraryW failed with Win32 error {code}");
        }
        unsafe { FreeLibrary(handle) };
        Ok(())
    }

    fn build_options(cfg: &ProbeConfig) -> TraceOptions {
        // The probe always collects and renders after the scope closes;
        // streaming output would interleave with the loader's own stderr.
        let mut options = TraceOptions::new()
            .collect(true)
            .audit(cfg.audit)
            .debug(cfg.debug);
        if let Some(name) = &cfg.session_name {
            options = options.session_name(name.clone());
        }
        if let Some(timeout) = cfg.stop_timeout {
            options = options.stop_timeout(timeout);
        }
        options
    }

    pub fn run() -> i32 {
        let modules: Vec<String> = std::env::args().skip(1).collect();
        if modules.is_empty() {
            eprintln!("usage: dlltrace <module.dll> [more.dll ...]");
            eprintln!("       traces every DLL the process loads while probing the named ones");
            return 2;
        }

        // 1 ─ Config
        let exe_dir = exe_dir();
        let cfg = load_probe_config(&exe_dir.join("dlltrace.toml"))
            .unwrap_or_else(|e| fatal!("config", "{}", e));

        // 2 ─ Logging
        setup_logging(&exe_dir, &cfg.logging).expect("Logging setup failed");
        log::info!("probing {} module(s)", modules.len());

        // 3 ─ Trace scope around the probe loads
        let trace = Trace::new(build_options(&cfg));
        let result = trace.run(|| {
            modules
                .iter()
                .map(|m| (m.clone(), probe(m).with_context(|| format!("probing {m}"))))
                .collect::<Vec<_>>()
        });

        let (events, outcomes) = match result {
            Ok(r) => r,
            Err(e) => fatal!("trace", "{}", e),
        };

        // 4 ─ Report
        for event in &events {
            if cfg.json {
                match serde_json::to_string(event) {
                    Ok(line) => println!("{line}"),
                    Err(e) => log::error!("event serialization failed: {e}"),
                }
            } else {
                println!("{event}");
            }
        }

        let mut failures = 0;
        for (module, outcome) in &outcomes {
            match outcome {
                Ok(()) => log::info!("loaded {module}"),
                Err(e) => {
                    failures += 1;
                    log::error!("{e:#}");
                }
            }
        }
        if failures > 0 { 1 } else { 0 }
    }
}

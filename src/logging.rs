//! Minimal structured logging: logfmt-style lines to a per-run log file,
//! mirrored in a human-readable form on stdout.

use std::fmt::Write as _;
use std::fs;
use std::io::Write;
use std::path::Path;
use std::sync::{Mutex, OnceLock};

use anyhow::{Context, Result};
use chrono::SecondsFormat;

static SINK: OnceLock<LogSink> = OnceLock::new();

/// Install the process-wide log sink. The first call wins; later calls are
/// no-ops so embedders and the CLI can both try without fighting.
pub fn init_log_file(path: &Path) -> Result<()> {
    if SINK.get().is_some() {
        return Ok(());
    }
    let sink = LogSink::open(path, true)?;
    let _ = SINK.set(sink);
    Ok(())
}

pub fn info(msg: impl AsRef<str>) {
    emit("INFO", msg.as_ref(), &[]);
}

pub fn error(msg: impl AsRef<str>) {
    emit("ERROR", msg.as_ref(), &[]);
}

pub fn info_kv(msg: &str, fields: &[(&str, &str)]) {
    emit("INFO", msg, fields);
}

fn emit(level: &str, msg: &str, fields: &[(&str, &str)]) {
    if let Some(sink) = SINK.get() {
        sink.emit(level, msg, fields);
    }
}

struct LogSink {
    file: Mutex<fs::File>,
    mirror_stdout: bool,
}

impl LogSink {
    fn open(path: &Path, mirror_stdout: bool) -> Result<Self> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("create {}", parent.display()))?;
        }
        // One file per run, truncated on open: the control plane's bound
        // address and token only ever need to be recovered from the most
        // recent run.
        let file = fs::OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(path)
            .with_context(|| format!("open {}", path.display()))?;
        Ok(Self {
            file: Mutex::new(file),
            mirror_stdout,
        })
    }

    fn emit(&self, level: &str, msg: &str, fields: &[(&str, &str)]) {
        let ts = chrono::Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true);

        if let Ok(mut file) = self.file.lock() {
            let _ = file.write_all(logfmt_line(&ts, level, msg, fields).as_bytes());
            let _ = file.flush();
        }
        if self.mirror_stdout {
            let mut out = std::io::stdout();
            let _ = out.write_all(pretty_line(&ts, level, msg, fields).as_bytes());
            let _ = out.flush();
        }
    }
}

fn logfmt_line(ts: &str, level: &str, msg: &str, fields: &[(&str, &str)]) -> String {
    let mut line = String::with_capacity(64 + msg.len());
    let _ = write!(line, "time={ts} level={level} msg=\"{}\"", quote(msg));
    for (key, value) in fields {
        let _ = write!(line, " {key}={value}");
    }
    line.push('\n');
    line
}

fn pretty_line(ts: &str, level: &str, msg: &str, fields: &[(&str, &str)]) -> String {
    let mut line = format!("{ts} {level} {msg}");
    for (key, value) in fields {
        let _ = write!(line, " {key}={value}");
    }
    line.push('\n');
    line
}

fn quote(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for c in raw.chars() {
        match c {
            '\\' => out.push_str("\\\\"),
            '"' => out.push_str("\\\""),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            other => out.push(other),
        }
    }
    out
}

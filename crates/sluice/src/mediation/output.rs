//! Where program output goes.

use std::fmt;
use std::io::Write;
use std::sync::{Arc, Mutex};

/// Destination for what a program writes to `sys.stdout` and `sys.stderr`.
#[derive(Clone, Default)]
pub enum OutputSink {
    /// The host's stdout.
    #[default]
    Stdout,
    /// The host's stderr. Used by the CLI, whose stdout carries JSON.
    Stderr,
    /// Dropped.
    Discard,
    /// A caller-supplied writer.
    Writer(Arc<Mutex<dyn Write + Send>>),
}

impl OutputSink {
    /// Send output to `writer`.
    pub fn writer(writer: impl Write + Send + 'static) -> Self {
        OutputSink::Writer(Arc::new(Mutex::new(writer)))
    }

    /// Write `text`. Failures are logged and otherwise ignored.
    pub fn write(&self, text: &str) {
        let result = match self {
            OutputSink::Stdout => {
                let mut out = std::io::stdout().lock();
                out.write_all(text.as_bytes()).and_then(|()| out.flush())
            }
            OutputSink::Stderr => {
                let mut out = std::io::stderr().lock();
                out.write_all(text.as_bytes()).and_then(|()| out.flush())
            }
            OutputSink::Discard => Ok(()),
            OutputSink::Writer(writer) => match writer.lock() {
                Ok(mut w) => w.write_all(text.as_bytes()),
                Err(_) => Ok(()),
            },
        };
        if let Err(e) = result {
            tracing::debug!(error = %e, "failed to write script output");
        }
    }
}

impl fmt::Debug for OutputSink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OutputSink::Stdout => f.write_str("Stdout"),
            OutputSink::Stderr => f.write_str("Stderr"),
            OutputSink::Discard => f.write_str("Discard"),
            OutputSink::Writer(_) => f.write_str("Writer(..)"),
        }
    }
}

use anyhow::Context;
use std::fs::OpenOptions;
use std::io::Write;
use std::sync::{Arc, Mutex};

/// File-based tracer of the runner wire traffic.
#[derive(Clone)]
pub struct WireTracer {
    file: Arc<Mutex<std::fs::File>>,
}

impl WireTracer {
    pub fn new(path: &std::path::Path) -> anyhow::Result<Self> {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .with_context(|| format!("open trace file {}", path.display()))?;
        Ok(Self {
            file: Arc::new(Mutex::new(file)),
        })
    }

    /// Trace a frame written to the runner.
    pub fn outgoing(&self, frame: &[u8]) {
        self.line("->", frame)
    }

    /// Trace a frame read from the runner.
    pub fn incoming(&self, frame: &[u8]) {
        self.line("<-", frame)
    }

    fn line(&self, direction: &str, frame: &[u8]) {
        let text = String::from_utf8_lossy(frame);
        if let Ok(mut file) = self.file.lock() {
            let _ = writeln!(file, "{direction} {}", text.trim_end());
        }
    }
}

use std::io::Write;
use std::sync::{Mutex, PoisonError};

/// Where terminal output is rendered.
pub trait Surface: Send + Sync {
    fn write(&self, data: &str);

    fn clear(&self);

    fn writeln(&self, line: &str) {
        self.write(line);
        self.write("\r\n");
    }
}

/// Writes straight to the process' stdout.
#[derive(Default)]
pub struct StdoutSurface;

impl Surface for StdoutSurface {
    fn write(&self, data: &str) {
        let mut stdout = std::io::stdout().lock();
        let _ = stdout.write_all(data.as_bytes());
        let _ = stdout.flush();
    }

    fn clear(&self) {
        self.write("\x1b[2J\x1b[H");
    }
}

/// Keeps everything written in memory. `clear` drops the buffer.
#[derive(Default)]
pub struct BufferSurface {
    buffer: Mutex<String>,
    clears: Mutex<usize>,
}

impl BufferSurface {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contents(&self) -> String {
        self.buffer
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Returns the buffered text and empties the buffer.
    pub fn take(&self) -> String {
        std::mem::take(&mut *self.buffer.lock().unwrap_or_else(PoisonError::into_inner))
    }

    pub fn clear_count(&self) -> usize {
        *self.clears.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Surface for BufferSurface {
    fn write(&self, data: &str) {
        self.buffer
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push_str(data);
    }

    fn clear(&self) {
        self.buffer
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
        *self.clears.lock().unwrap_or_else(PoisonError::into_inner) += 1;
    }
}

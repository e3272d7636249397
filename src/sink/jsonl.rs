use std::io::{self, BufWriter, Write};
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use tracing::warn;

use crate::sched::{SchedulingSlice, SliceListener};

struct Buffered<W: Write> {
    writer: BufWriter<W>,
    /// Lines accepted into the buffer since the last flush.
    pending: u64,
}

/// Writes every slice as one JSON object per line.
///
/// Lines are buffered; they count as written only once a flush has pushed
/// them to the underlying writer.
pub struct JsonLinesSink<W: Write + Send> {
    out: Mutex<Buffered<W>>,
    written: AtomicU64,
    write_errors: AtomicU64,
}

impl<W: Write + Send> JsonLinesSink<W> {
    pub fn new(out: W) -> Self {
        Self {
            out: Mutex::new(Buffered {
                writer: BufWriter::new(out),
                pending: 0,
            }),
            written: AtomicU64::new(0),
            write_errors: AtomicU64::new(0),
        }
    }

    /// Slices confirmed written by a successful flush.
    pub fn written(&self) -> u64 {
        self.written.load(Ordering::Relaxed)
    }

    /// Slices lost to write, encode or flush errors.
    pub fn write_errors(&self) -> u64 {
        self.write_errors.load(Ordering::Relaxed)
    }

    /// Slices buffered but not yet flushed.
    pub fn pending(&self) -> u64 {
        self.out.lock().pending
    }

    pub fn flush(&self) -> io::Result<()> {
        let mut out = self.out.lock();
        let pending = std::mem::take(&mut out.pending);
        match out.writer.flush() {
            Ok(()) => {
                self.written.fetch_add(pending, Ordering::Relaxed);
                Ok(())
            }
            Err(e) => {
                self.write_errors.fetch_add(pending, Ordering::Relaxed);
                Err(e)
            }
        }
    }

    /// Flush and return the underlying writer.
    pub fn into_inner(self) -> io::Result<W> {
        self.out
            .into_inner()
            .writer
            .into_inner()
            .map_err(|e| e.into_error())
    }

    fn write_slice(&self, slice: &SchedulingSlice) -> io::Result<()> {
        let mut out = self.out.lock();
        serde_json::to_writer(&mut out.writer, slice)?;
        out.writer.write_all(b"\n")?;
        out.pending += 1;
        Ok(())
    }
}

impl<W: Write + Send> SliceListener for JsonLinesSink<W> {
    fn on_scheduling_slice(&self, slice: SchedulingSlice) {
        if let Err(e) = self.write_slice(&slice) {
            // Only the first failure is logged; the rest are counted.
            if self.write_errors.fetch_add(1, Ordering::Relaxed) == 0 {
                warn!(error = %e, "writing slice failed");
            }
        }
    }
}

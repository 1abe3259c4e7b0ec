//! Progress reporting for migrations, and a log writer that keeps the bar pinned.

use indicatif::{MultiProgress, ProgressBar, ProgressDrawTarget, ProgressStyle};
use std::io::{self, Write};
use std::sync::OnceLock;
use tracing_subscriber::fmt::MakeWriter;

static MULTI_PROGRESS: OnceLock<MultiProgress> = OnceLock::new();

fn multi_progress() -> &'static MultiProgress {
    MULTI_PROGRESS.get_or_init(|| {
        let mp = MultiProgress::new();
        mp.set_draw_target(ProgressDrawTarget::stderr_with_hz(10));
        mp
    })
}

fn print_line(line: &str) {
    let _ = multi_progress().println(line.trim_end_matches('\r').to_string());
}

/// Per-entry progress of a pipeline run
#[derive(Clone)]
pub struct PipelineProgress {
    bar: ProgressBar,
}

impl PipelineProgress {
    /// A visible bar on stderr
    pub fn visible() -> Self {
        let bar = multi_progress().add(ProgressBar::new(0));
        if let Ok(style) = ProgressStyle::with_template(
            "{spinner:.green} [{elapsed_precise}] [{wide_bar:.cyan/blue}] {pos}/{len} {msg}",
        ) {
            bar.set_style(style.tick_chars("⠋⠙⠹⠸⠼⠴⠦⠧⠇⠏"));
        }
        Self { bar }
    }

    /// Draws nothing; used for `--json` output and in tests
    pub fn hidden() -> Self {
        Self {
            bar: ProgressBar::hidden(),
        }
    }

    pub fn start(&self, entries: usize) {
        self.bar.set_length(entries as u64);
        self.bar.set_position(0);
        self.bar.set_message("embedding");
    }

    /// Record a finished batch
    pub fn advance(&self, entries: usize, failed: usize) {
        self.bar.inc(entries as u64);
        if failed > 0 {
            self.bar.set_message(format!("{} failed", failed));
        }
    }

    pub fn position(&self) -> u64 {
        self.bar.position()
    }

    pub fn finish(&self, message: &str) {
        self.bar.finish_with_message(message.to_string());
    }
}

#[derive(Default, Clone)]
pub struct LogWriterFactory;

/// Buffers partial lines and prints complete ones above the progress bars
pub struct LogWriter {
    buffer: String,
}

impl Write for LogWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.buffer.push_str(&String::from_utf8_lossy(buf));

        while let Some(idx) = self.buffer.find('\n') {
            print_line(&self.buffer[..idx]);
            self.buffer.drain(..idx + 1);
        }

        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        if !self.buffer.is_empty() {
            print_line(&self.buffer);
            self.buffer.clear();
        }
        Ok(())
    }
}

impl Drop for LogWriter {
    fn drop(&mut self) {
        let _ = self.flush();
    }
}

impl<'a> MakeWriter<'a> for LogWriterFactory {
    type Writer = LogWriter;

    fn make_writer(&'a self) -> Self::Writer {
        LogWriter {
            buffer: String::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hidden_progress_counts() {
        let progress = PipelineProgress::hidden();
        progress.start(25);
        progress.advance(20, 5);
        progress.advance(5, 0);
        assert_eq!(progress.position(), 25);
        progress.finish("done");
    }

    #[test]
    fn test_log_writer_keeps_partial_line() {
        let mut writer = LogWriterFactory.make_writer();
        writer.write_all(b"first line\nsecond").unwrap();
        assert_eq!(writer.buffer, "second");
        writer.flush().unwrap();
        assert!(writer.buffer.is_empty());
    }
}

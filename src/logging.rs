// Logging for ciboot: structured tracing diagnostics plus the indented console printer.
//
// Standard output belongs to the parent shell, so everything here writes to stderr.
use parking_lot::Mutex;
use std::io::{self, IsTerminal, Write};
use std::sync::Arc;
use tracing::Level;
use tracing_subscriber::{fmt, EnvFilter};

use crate::error::Result;

/// Logging configuration
#[derive(Debug, Clone)]
pub struct LogConfig {
    /// Log level (trace, debug, info, warn, error)
    pub level: Level,
    /// Output format
    pub format: LogFormat,
    /// Color output configuration
    pub color: ColorConfig,
    /// Whether to show targets (module names)
    pub show_targets: bool,
}

/// Log output format options
#[derive(Debug, Clone, PartialEq)]
pub enum LogFormat {
    Pretty,
    Json,
    Compact,
}

/// Color output configuration
#[derive(Debug, Clone, PartialEq)]
pub enum ColorConfig {
    Auto,
    Always,
    Never,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: Level::WARN,
            format: LogFormat::Compact,
            color: ColorConfig::Auto,
            show_targets: false,
        }
    }
}

impl LogConfig {
    /// Create logging configuration from CLI arguments
    pub fn from_cli(verbose: bool, quiet: bool, color: Option<String>) -> Self {
        let level = if quiet {
            Level::ERROR
        } else if verbose {
            Level::DEBUG
        } else {
            Level::WARN
        };

        let color_config = match color.as_deref() {
            Some("always") => ColorConfig::Always,
            Some("never") => ColorConfig::Never,
            _ => ColorConfig::Auto,
        };

        Self {
            level,
            format: if verbose {
                LogFormat::Pretty
            } else {
                LogFormat::Compact
            },
            color: color_config,
            show_targets: verbose,
        }
    }

    /// Check if colors should be used based on configuration and terminal
    pub fn should_use_colors(&self) -> bool {
        match self.color {
            ColorConfig::Always => true,
            ColorConfig::Never => false,
            ColorConfig::Auto => {
                io::stderr().is_terminal()
                    && std::env::var("TERM").map_or(true, |term| term != "dumb")
                    && std::env::var("NO_COLOR").is_err()
            }
        }
    }
}

/// Initialize the logging system with the given configuration
pub fn init_logging(config: LogConfig) -> Result<()> {
    let env_filter = EnvFilter::try_from_env("CIBOOT_LOG")
        .unwrap_or_else(|_| EnvFilter::new(format!("ciboot={}", config.level)));
    let ansi = config.should_use_colors();

    match config.format {
        LogFormat::Pretty => fmt()
            .with_env_filter(env_filter)
            .with_writer(io::stderr)
            .with_ansi(ansi)
            .with_target(config.show_targets)
            .pretty()
            .init(),
        LogFormat::Json => fmt()
            .with_env_filter(env_filter)
            .with_writer(io::stderr)
            .json()
            .init(),
        LogFormat::Compact => fmt()
            .with_env_filter(env_filter)
            .with_writer(io::stderr)
            .with_ansi(ansi)
            .with_target(config.show_targets)
            .compact()
            .init(),
    }

    Ok(())
}

const INDENT_WIDTH: usize = 4;

struct PrinterState {
    writer: Box<dyn Write + Send>,
    depth: usize,
    at_line_start: bool,
}

impl PrinterState {
    fn write_indent(&mut self) -> io::Result<()> {
        let pad = " ".repeat(self.depth * INDENT_WIDTH);
        self.writer.write_all(pad.as_bytes())
    }

    fn write_stream(&mut self, data: &[u8]) -> io::Result<()> {
        for chunk in data.split_inclusive(|b| *b == b'\n') {
            if self.at_line_start {
                self.write_indent()?;
            }
            self.writer.write_all(chunk)?;
            self.at_line_start = chunk.ends_with(b"\n");
        }
        self.writer.flush()
    }
}

/// Indentation-aware console printer.
///
/// Every user-visible line goes through here so nested steps render nested.
/// Raw byte streams are re-indented at each line start, which lets partial
/// lines from a running tool appear as they arrive.
pub struct Printer {
    state: Mutex<PrinterState>,
}

impl Printer {
    pub fn new(writer: Box<dyn Write + Send>) -> Self {
        Self {
            state: Mutex::new(PrinterState {
                writer,
                depth: 0,
                at_line_start: true,
            }),
        }
    }

    pub fn stderr() -> Self {
        Self::new(Box::new(io::stderr()))
    }

    /// Printer writing into an in-memory buffer, for callers that inspect output.
    pub fn captured() -> (Self, CapturedOutput) {
        let output = CapturedOutput::default();
        (Self::new(Box::new(output.clone())), output)
    }

    /// Increase indentation until the returned guard is dropped.
    pub fn indent(&self) -> IndentGuard<'_> {
        self.state.lock().depth += 1;
        IndentGuard { printer: self }
    }

    pub fn depth(&self) -> usize {
        self.state.lock().depth
    }

    /// Print one complete line at the current indentation.
    pub fn line(&self, message: &str) {
        let mut state = self.state.lock();
        let mut text = String::with_capacity(message.len() + 2);
        if !state.at_line_start {
            text.push('\n');
            state.at_line_start = true;
        }
        if let Err(e) = state.writer.write_all(text.as_bytes()) {
            tracing::debug!("Console write failed: {e}");
        }
        text.clear();
        text.push_str(message);
        text.push('\n');
        if let Err(e) = state.write_stream(text.as_bytes()) {
            tracing::debug!("Console write failed: {e}");
        }
    }

    /// Stream raw bytes, indenting at each line start.
    pub fn write_raw(&self, data: &[u8]) {
        if let Err(e) = self.state.lock().write_stream(data) {
            tracing::debug!("Console write failed: {e}");
        }
    }

    /// Terminate a partially written line, if any.
    pub fn finish_line(&self) {
        let mut state = self.state.lock();
        if !state.at_line_start {
            let mut result = state.writer.write_all(b"\n");
            if result.is_ok() {
                result = state.writer.flush();
            }
            if let Err(e) = result {
                tracing::debug!("Console write failed: {e}");
            }
            state.at_line_start = true;
        }
    }

    pub fn at_line_start(&self) -> bool {
        self.state.lock().at_line_start
    }
}

impl Default for Printer {
    fn default() -> Self {
        Self::stderr()
    }
}

impl std::fmt::Debug for Printer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Printer")
            .field("depth", &self.depth())
            .finish_non_exhaustive()
    }
}

/// Restores the previous indentation when dropped.
#[must_use = "indentation is removed as soon as the guard is dropped"]
pub struct IndentGuard<'a> {
    printer: &'a Printer,
}

impl Drop for IndentGuard<'_> {
    fn drop(&mut self) {
        let mut state = self.printer.state.lock();
        state.depth = state.depth.saturating_sub(1);
    }
}

/// Cloneable in-memory sink.
#[derive(Clone, Default)]
pub struct CapturedOutput {
    buffer: Arc<Mutex<Vec<u8>>>,
}

impl CapturedOutput {
    pub fn contents(&self) -> String {
        String::from_utf8_lossy(&self.buffer.lock()).to_string()
    }
}

impl Write for CapturedOutput {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.buffer.lock().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_log_config_default() {
        let config = LogConfig::default();
        assert_eq!(config.level, Level::WARN);
        assert_eq!(config.format, LogFormat::Compact);
        assert_eq!(config.color, ColorConfig::Auto);
        assert!(!config.show_targets);
    }

    #[test]
    fn test_log_config_from_cli_verbose() {
        let config = LogConfig::from_cli(true, false, None);
        assert_eq!(config.level, Level::DEBUG);
        assert_eq!(config.format, LogFormat::Pretty);
    }

    #[test]
    fn test_log_config_from_cli_quiet() {
        let config = LogConfig::from_cli(false, true, None);
        assert_eq!(config.level, Level::ERROR);
    }

    #[test]
    fn test_log_config_color_never() {
        let config = LogConfig::from_cli(false, false, Some("never".to_string()));
        assert_eq!(config.color, ColorConfig::Never);
        assert!(!config.should_use_colors());
    }

    #[test]
    fn test_printer_nests_lines() {
        let (printer, output) = Printer::captured();
        printer.line("outer");
        {
            let _guard = printer.indent();
            printer.line("inner");
            let _deeper = printer.indent();
            printer.line("innermost");
        }
        printer.line("outer again");

        assert_eq!(
            output.contents(),
            "outer\n    inner\n        innermost\nouter again\n"
        );
    }

    #[test]
    fn test_raw_stream_indents_each_line_start() {
        let (printer, output) = Printer::captured();
        let _guard = printer.indent();
        printer.write_raw(b"par");
        printer.write_raw(b"tial\nnext");
        assert!(!printer.at_line_start());
        printer.finish_line();

        assert_eq!(output.contents(), "    partial\n    next\n");
        assert!(printer.at_line_start());
    }

    #[test]
    fn test_line_after_partial_output_starts_fresh() {
        let (printer, output) = Printer::captured();
        printer.write_raw(b"...");
        printer.line("done");
        assert_eq!(output.contents(), "...\ndone\n");
    }
}

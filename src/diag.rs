//! The diagnostics channel of one walk or dispatch.
//!
//! Every public operation of the [`Unwinder`](crate::Unwinder) takes a
//! `&mut Diagnostics`. It filters and routes diagnostic lines and keeps the
//! [`LastError`] record. There is no process-wide instance: whoever starts
//! a walk owns its channel, so concurrent walks never share error state.

use alloc::{
    string::{String, ToString},
    vec::Vec,
};
use core::fmt::{self, Write};

use tracing::{level_filters::LevelFilter, Level};

use crate::{
    error::UnwindError,
    stdext::{self, FdWriter},
};

/// Longest message kept in a [`LastError`], in bytes.
pub const MAX_MESSAGE_LEN: usize = 256;

/// Lines kept by [`Destination::Buffer`]; older ones are dropped first.
pub const MAX_BUFFERED_LINES: usize = 1024;

/// The most recent failure seen by a [`Diagnostics`] channel.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LastError {
    /// [`UnwindError::code`], zero if nothing failed yet.
    pub code: u32,
    pub message: String,
    pub address: Option<u64>,
}

impl LastError {
    pub fn is_empty(&self) -> bool {
        self.code == 0
    }
}

impl From<&UnwindError> for LastError {
    fn from(error: &UnwindError) -> Self {
        let mut message = error.to_string();
        if message.len() > MAX_MESSAGE_LEN {
            let mut end = MAX_MESSAGE_LEN;
            while !message.is_char_boundary(end) {
                end -= 1;
            }
            message.truncate(end);
        }
        Self {
            code: error.code(),
            message,
            address: error.address(),
        }
    }
}

/// Where diagnostic lines go.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Destination {
    /// Re-emitted as `tracing` events at the same level.
    Tracing,
    Stdout,
    Stderr,
    /// Kept in memory, see [`Diagnostics::lines`]. At most
    /// [`MAX_BUFFERED_LINES`] are kept until drained with
    /// [`Diagnostics::take_lines`].
    Buffer,
    Discard,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DiagnosticsConfig {
    /// Lines less severe than this are dropped.
    pub level: LevelFilter,
    pub destination: Destination,
    /// Prefix lines with the wall clock time. Ignored for
    /// [`Destination::Tracing`], the subscriber has its own.
    pub timestamps: bool,
}

impl Default for DiagnosticsConfig {
    fn default() -> Self {
        Self {
            level: LevelFilter::WARN,
            destination: Destination::Tracing,
            timestamps: false,
        }
    }
}

#[derive(Debug, Default)]
pub struct Diagnostics {
    config: DiagnosticsConfig,
    last_error: LastError,
    lines: Vec<String>,
}

impl Diagnostics {
    pub fn new(config: DiagnosticsConfig) -> Self {
        Self {
            config,
            last_error: LastError::default(),
            lines: Vec::new(),
        }
    }

    pub fn config(&self) -> &DiagnosticsConfig {
        &self.config
    }

    pub fn enabled(&self, level: Level) -> bool {
        level <= self.config.level
    }

    pub fn log(&mut self, level: Level, args: fmt::Arguments<'_>) {
        if !self.enabled(level) {
            return;
        }

        match self.config.destination {
            Destination::Tracing => {
                if level == Level::ERROR {
                    error!("{args}");
                } else if level == Level::WARN {
                    warn!("{args}");
                } else if level == Level::INFO {
                    info!("{args}");
                } else if level == Level::DEBUG {
                    debug!("{args}");
                } else {
                    trace!("{args}");
                }
            }
            Destination::Stdout | Destination::Stderr => {
                let fd = if self.config.destination == Destination::Stdout {
                    stdext::STDOUT
                } else {
                    stdext::STDERR
                };
                // Nowhere left to report a failing diagnostics write.
                let _ = self.write_line(&mut FdWriter(fd), level, args);
            }
            Destination::Buffer => {
                let mut line = String::new();
                let _ = self.write_line(&mut line, level, args);
                if self.lines.len() >= MAX_BUFFERED_LINES {
                    self.lines.remove(0);
                }
                self.lines.push(line);
            }
            Destination::Discard => {}
        }
    }

    fn write_line(&self, out: &mut impl Write, level: Level, args: fmt::Arguments<'_>) -> fmt::Result {
        if self.config.timestamps {
            if let Some((secs, micros)) = stdext::now() {
                write!(out, "[{secs}.{micros:06}] ")?;
            }
        }
        writeln!(out, "{level:>5} sehwind: {args}")
    }

    /// Overwrites the last error and logs the failure.
    pub fn record(&mut self, error: &UnwindError) {
        self.last_error = LastError::from(error);
        self.log(Level::ERROR, format_args!("{error}"));
    }

    /// The most recent failure, or an empty record if there was none.
    pub fn last_error(&self) -> LastError {
        self.last_error.clone()
    }

    pub fn clear_last_error(&mut self) {
        self.last_error = LastError::default();
    }

    /// Lines collected by [`Destination::Buffer`].
    pub fn lines(&self) -> &[String] {
        &self.lines
    }

    pub fn take_lines(&mut self) -> Vec<String> {
        core::mem::take(&mut self.lines)
    }
}

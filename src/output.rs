use std::cell::Cell;
use std::io::{self, Write};

use crossterm::QueueableCommand;
use crossterm::cursor::MoveToColumn;
use crossterm::style::Print;
use crossterm::terminal::{Clear, ClearType};
use serde::Serialize;

use crate::app::{ProgressEvent, ProgressSink, ResourceListResult};
use crate::depotize::DepotizeSummary;
use crate::import::ImportSummary;
use crate::sync::SyncSummary;

#[derive(Debug, Clone, Copy)]
pub enum OutputMode {
    Interactive,
    NonInteractive,
}

/// Discards every event.
pub struct NullSink;

impl ProgressSink for NullSink {
    fn event(&self, _event: ProgressEvent) {}
}

/// Machine-readable results on stdout; progress is not printed.
pub struct JsonOutput;

impl JsonOutput {
    pub fn print_depotize(result: &DepotizeSummary) -> io::Result<()> {
        Self::print_json(result)
    }

    pub fn print_sync(result: &SyncSummary) -> io::Result<()> {
        Self::print_json(result)
    }

    pub fn print_import(result: &ImportSummary) -> io::Result<()> {
        Self::print_json(result)
    }

    pub fn print_resources(result: &ResourceListResult) -> io::Result<()> {
        Self::print_json(result)
    }

    fn print_json<T: Serialize>(value: &T) -> io::Result<()> {
        let json = serde_json::to_string_pretty(value).map_err(io::Error::other)?;
        let mut stdout = io::stdout();
        stdout.write_all(json.as_bytes())?;
        stdout.write_all(b"\n")?;
        Ok(())
    }
}

impl ProgressSink for JsonOutput {
    fn event(&self, _event: ProgressEvent) {}
}

/// Operator console: progress lines are rewritten in place, events at or
/// below the verbosity level are printed as permanent lines.
pub struct ConsoleOutput {
    verbosity: u8,
    pending: Cell<bool>,
}

impl ConsoleOutput {
    pub fn new(verbosity: u8) -> Self {
        Self {
            verbosity,
            pending: Cell::new(false),
        }
    }

    fn render(&self, event: &ProgressEvent) -> io::Result<()> {
        let mut stdout = io::stdout();
        if self.pending.get() || event.transient {
            stdout
                .queue(MoveToColumn(0))?
                .queue(Clear(ClearType::CurrentLine))?;
        }
        let mut line = event.message.clone();
        if let Some(elapsed) = event.elapsed {
            line.push_str(&format!(" ({:.1}s)", elapsed.as_secs_f64()));
        }
        stdout.queue(Print(line))?;
        if event.transient {
            self.pending.set(true);
        } else {
            stdout.queue(Print("\n"))?;
            self.pending.set(false);
        }
        stdout.flush()
    }
}

impl ProgressSink for ConsoleOutput {
    fn event(&self, event: ProgressEvent) {
        if !event.transient && event.level > self.verbosity {
            return;
        }
        // a closed stdout must not abort the sweep
        let _ = self.render(&event);
    }
}

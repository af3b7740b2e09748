//! Colored step logger
//!
//! ERROR HANDLING STRATEGY FOR DECORATIVE I/O:
//! All termcolor operations use `let _ =` to deliberately ignore errors.
//! Colored output is decorative and non-essential. If stderr/stdout is unavailable
//! (broken pipe, no TTY, etc.), the run continues without log output.
//!
//! A [`Logger`] is created once in `main` and handed to every component, so the
//! verbosity of a run is carried explicitly instead of living in global state.

use std::fmt::Display;
use std::io::Write;
use termcolor::{BufferWriter, Color, ColorChoice, ColorSpec, WriteColor};

#[derive(Debug, Clone, Copy, Default)]
pub struct Logger {
    verbose: bool,
}

impl Logger {
    #[must_use]
    pub fn new(verbose: bool) -> Self {
        Self { verbose }
    }

    #[must_use]
    pub fn is_verbose(&self) -> bool {
        self.verbose
    }

    /// Section header, printed in blue with a leading blank line.
    pub fn section(&self, msg: impl Display) {
        let bufwtr = BufferWriter::stdout(ColorChoice::Auto);
        let mut buffer = bufwtr.buffer();
        let _ = writeln!(&mut buffer);
        let _ = buffer.set_color(ColorSpec::new().set_fg(Some(Color::Blue)).set_bold(true));
        let _ = writeln!(&mut buffer, "{msg}");
        let _ = buffer.reset();
        let _ = bufwtr.print(&buffer);
    }

    pub fn info(&self, msg: impl Display) {
        let bufwtr = BufferWriter::stdout(ColorChoice::Auto);
        let mut buffer = bufwtr.buffer();
        let _ = writeln!(&mut buffer, "{msg}");
        let _ = bufwtr.print(&buffer);
    }

    /// Only printed when verbose logging is enabled.
    pub fn debug(&self, msg: impl Display) {
        if !self.verbose {
            return;
        }
        let bufwtr = BufferWriter::stdout(ColorChoice::Auto);
        let mut buffer = bufwtr.buffer();
        let _ = buffer.set_color(ColorSpec::new().set_dimmed(true));
        let _ = writeln!(&mut buffer, "{msg}");
        let _ = buffer.reset();
        let _ = bufwtr.print(&buffer);
    }

    pub fn done(&self, msg: impl Display) {
        let bufwtr = BufferWriter::stdout(ColorChoice::Auto);
        let mut buffer = bufwtr.buffer();
        let _ = buffer.set_color(ColorSpec::new().set_fg(Some(Color::Green)));
        let _ = write!(&mut buffer, "✓ ");
        let _ = buffer.reset();
        let _ = writeln!(&mut buffer, "{msg}");
        let _ = bufwtr.print(&buffer);
    }

    pub fn warn(&self, msg: impl Display) {
        let bufwtr = BufferWriter::stderr(ColorChoice::Auto);
        let mut buffer = bufwtr.buffer();
        let _ = buffer.set_color(ColorSpec::new().set_fg(Some(Color::Yellow)));
        let _ = write!(&mut buffer, "⚠️  ");
        let _ = buffer.reset();
        let _ = writeln!(&mut buffer, "{msg}");
        let _ = bufwtr.print(&buffer);
    }

    pub fn error(&self, msg: impl Display) {
        let bufwtr = BufferWriter::stderr(ColorChoice::Auto);
        let mut buffer = bufwtr.buffer();
        let _ = buffer.set_color(ColorSpec::new().set_fg(Some(Color::Red)));
        let _ = write!(&mut buffer, "❌ ");
        let _ = buffer.reset();
        let _ = writeln!(&mut buffer, "{msg}");
        let _ = bufwtr.print(&buffer);
    }
}

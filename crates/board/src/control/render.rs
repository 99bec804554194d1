//! Render boundary.
//!
//! A [`Renderer`] turns each refresh [`Frame`] into output. The text dashboard
//! prints a line whenever the visible state changes; the null renderer
//! discards frames for headless runs.

use std::fmt::Write as _;
use std::io::{self, Write};

use crate::control::Frame;

/// Presentation layer for refresh frames.
pub trait Renderer {
    /// Presents one frame.
    fn render(&mut self, frame: &Frame) -> io::Result<()>;
}

/// Discards every frame.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullRenderer;

impl Renderer for NullRenderer {
    fn render(&mut self, _frame: &Frame) -> io::Result<()> {
        Ok(())
    }
}

/// One-line text dashboard of the port outputs.
pub struct TextDashboard<W: Write> {
    out: W,
    last: Option<String>,
}

impl<W: Write> std::fmt::Debug for TextDashboard<W> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TextDashboard")
            .field("last", &self.last)
            .finish_non_exhaustive()
    }
}

impl<W: Write> TextDashboard<W> {
    /// Creates a dashboard writing to `out`.
    pub const fn new(out: W) -> Self {
        Self { out, last: None }
    }

    /// Formats the visible part of a frame: state, flags and the `PORTx` outputs as pins.
    pub fn line(frame: &Frame) -> String {
        let mut line = format!("[{:<7}]", frame.state.to_string());
        for (name, value) in frame.signals.iter().filter(|(n, _)| n.starts_with("PORT")) {
            let pins: String = (0..8)
                .rev()
                .map(|bit| if value & (1 << bit) != 0 { '#' } else { '.' })
                .collect();
            let _ = write!(line, " {name} {pins}");
        }
        if frame.tracing {
            line.push_str(" [trace]");
        }
        if frame.debugging {
            line.push_str(" [gdb]");
        }
        line
    }

    /// Consumes the dashboard, returning its writer.
    pub fn into_inner(self) -> W {
        self.out
    }
}

impl<W: Write> Renderer for TextDashboard<W> {
    fn render(&mut self, frame: &Frame) -> io::Result<()> {
        let line = Self::line(frame);
        if self.last.as_deref() == Some(line.as_str()) {
            return Ok(());
        }
        writeln!(self.out, "{line}")?;
        self.out.flush()?;
        self.last = Some(line);
        Ok(())
    }
}

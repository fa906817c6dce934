//! Attempt transcript printer.
//!
//! Everything printed during an attempt is echoed to stdout and accumulated
//! so the full transcript can be stored in `attempts.complete_log`. The
//! `### SYSTEM:` and `--- LLM ---` markers are load-bearing: the
//! `print-tool-calls` tool splits stored transcripts on them.

use std::fmt::Write as _;
use unicode_width::UnicodeWidthStr;

const DEFAULT_TERMINAL_WIDTH: usize = 80;
const MIN_WRAP_WIDTH: usize = 10;
const INDENT: &str = "  ";

#[derive(Debug, Clone)]
pub struct Printer {
    transcript: String,
    wrap_width: usize,
    echo: bool,
}

impl Default for Printer {
    fn default() -> Self {
        Self::new()
    }
}

impl Printer {
    /// Printer that echoes to stdout and wraps to the current terminal width.
    pub fn new() -> Self {
        let columns = crossterm::terminal::size()
            .map(|(cols, _)| cols as usize)
            .unwrap_or(DEFAULT_TERMINAL_WIDTH);
        Self {
            transcript: String::new(),
            wrap_width: columns.saturating_sub(5).max(MIN_WRAP_WIDTH),
            echo: true,
        }
    }

    /// Printer that only accumulates, with a fixed wrap width.
    pub fn silent(wrap_width: usize) -> Self {
        Self {
            transcript: String::new(),
            wrap_width: wrap_width.max(MIN_WRAP_WIDTH),
            echo: false,
        }
    }

    pub fn print(&mut self, line: impl AsRef<str>) {
        self.emit(line.as_ref());
    }

    /// Print with a two-space indent, wrapping each input line separately so
    /// embedded newlines survive.
    pub fn indented_print(&mut self, text: impl AsRef<str>) {
        let wrapped = text
            .as_ref()
            .lines()
            .map(|line| wrap_line(line, self.wrap_width))
            .collect::<Vec<_>>()
            .join("\n");
        self.emit(&wrapped);
    }

    pub fn transcript(&self) -> &str {
        &self.transcript
    }

    pub fn into_transcript(self) -> String {
        self.transcript
    }

    fn emit(&mut self, text: &str) {
        if self.echo {
            println!("{}", text);
        }
        let _ = writeln!(self.transcript, "{}", text);
    }
}

/// Greedy word wrap with an indent on every produced line. Words wider than
/// the available width are placed on their own line rather than split.
fn wrap_line(line: &str, width: usize) -> String {
    let available = width.saturating_sub(INDENT.len()).max(1);
    let mut lines: Vec<String> = Vec::new();
    let mut current = String::new();
    let mut current_width = 0usize;

    for word in line.split_whitespace() {
        let word_width = word.width();
        if current.is_empty() {
            current.push_str(word);
            current_width = word_width;
        } else if current_width + 1 + word_width <= available {
            current.push(' ');
            current.push_str(word);
            current_width += 1 + word_width;
        } else {
            lines.push(std::mem::take(&mut current));
            current.push_str(word);
            current_width = word_width;
        }
    }
    if !current.is_empty() || lines.is_empty() {
        lines.push(current);
    }

    lines
        .into_iter()
        .map(|l| if l.is_empty() { l } else { format!("{}{}", INDENT, l) })
        .collect::<Vec<_>>()
        .join("\n")
}

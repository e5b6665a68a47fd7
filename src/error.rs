// Error values surfaced by the core.
//
// There's one error type for the whole pipeline. Each error carries a
// heap-allocated description, plus an optional file path and line number
// when the failure can be pinned to a source position. No stack traces.

use owo_colors::OwoColorize;
use std::fmt;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Lex,
    Parse,
    Runtime,
}

#[derive(Debug, Clone)]
pub struct Error {
    pub kind: ErrorKind,
    desc: String,
    file: Option<PathBuf>,
    line: Option<u32>,
}

impl Error {
    pub fn new(kind: ErrorKind, desc: impl Into<String>) -> Error {
        Error {
            kind,
            desc: desc.into(),
            file: None,
            line: None,
        }
    }

    pub fn lex(desc: impl Into<String>) -> Error {
        Error::new(ErrorKind::Lex, desc)
    }

    pub fn parse(desc: impl Into<String>) -> Error {
        Error::new(ErrorKind::Parse, desc)
    }

    pub fn runtime(desc: impl Into<String>) -> Error {
        Error::new(ErrorKind::Runtime, desc)
    }

    /// Attaches a line number, consuming and returning the error so it can
    /// be chained onto a constructor.
    pub fn at_line(mut self, line: u32) -> Error {
        self.line = Some(line);
        self
    }

    /// Records the file the error occurred in, unless one is already set.
    pub fn set_file(&mut self, path: &Path) {
        if self.file.is_none() {
            self.file = Some(path.to_path_buf());
        }
    }

    pub fn desc(&self) -> &str {
        &self.desc
    }

    pub fn file(&self) -> Option<&Path> {
        self.file.as_deref()
    }

    pub fn line(&self) -> Option<u32> {
        self.line
    }

    /// Pretty prints the error to standard error. If `use_color` is true,
    /// ANSI color codes are included.
    pub fn print(&self, use_color: bool) {
        let position = match (&self.file, self.line) {
            (Some(file), Some(line)) => format!("{}:{}: ", file.display(), line),
            (Some(file), None) => format!("{}: ", file.display()),
            (None, Some(line)) => format!("line {}: ", line),
            (None, None) => String::new(),
        };
        if use_color {
            eprintln!("{}{} {}", position, "error:".red().bold(), self.desc);
        } else {
            eprintln!("{}error: {}", position, self.desc);
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (&self.file, self.line) {
            (Some(file), Some(line)) => {
                write!(f, "{}:{}: error: {}", file.display(), line, self.desc)
            }
            (Some(file), None) => write!(f, "{}: error: {}", file.display(), self.desc),
            (None, Some(line)) => write!(f, "line {}: error: {}", line, self.desc),
            (None, None) => write!(f, "error: {}", self.desc),
        }
    }
}

impl std::error::Error for Error {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_includes_position_when_known() {
        let e = Error::parse("unexpected token `}`").at_line(4);
        assert_eq!(e.to_string(), "line 4: error: unexpected token `}`");

        let mut e = Error::runtime("stack overflow");
        e.set_file(Path::new("demo.ar"));
        assert_eq!(e.to_string(), "demo.ar: error: stack overflow");
    }

    #[test]
    fn set_file_does_not_overwrite() {
        let mut e = Error::lex("failed to parse number");
        e.set_file(Path::new("a.ar"));
        e.set_file(Path::new("b.ar"));
        assert_eq!(e.file(), Some(Path::new("a.ar")));
    }
}

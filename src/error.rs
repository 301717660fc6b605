//! Shared error utilities used across the compilation pipeline.
//!
//! Every failure is fatal and carries a [`Diagnostic`] in the style of
//! chibicc: the offending source line, then a caret under the offending
//! byte followed by the message.

use std::fmt;

use snafu::Snafu;

pub type CompileResult<T> = Result<T, CompileError>;

#[derive(Debug, Snafu)]
pub enum CompileError {
  /// An unrecognised character or a malformed literal.
  #[snafu(display("{diagnostic}"))]
  Lex { diagnostic: Diagnostic },

  /// An expected terminal was missing, including premature end of input.
  #[snafu(display("{diagnostic}"))]
  Parse { diagnostic: Diagnostic },

  /// Rejected while generating code: bad lvalues, too many call arguments.
  #[snafu(display("{diagnostic}"))]
  Semantic { diagnostic: Diagnostic },

  #[snafu(display("internal error: {message}"))]
  Internal { message: String },
}

impl CompileError {
  pub fn lex(source: &str, loc: usize, message: impl Into<String>) -> Self {
    Self::Lex {
      diagnostic: Diagnostic::at(source, loc, message),
    }
  }

  pub fn parse(source: &str, loc: usize, message: impl Into<String>) -> Self {
    Self::Parse {
      diagnostic: Diagnostic::at(source, loc, message),
    }
  }

  pub fn semantic(source: &str, loc: usize, message: impl Into<String>) -> Self {
    Self::Semantic {
      diagnostic: Diagnostic::at(source, loc, message),
    }
  }

  /// The diagnostic attached to a user-facing error, if any.
  pub fn diagnostic(&self) -> Option<&Diagnostic> {
    match self {
      Self::Lex { diagnostic } | Self::Parse { diagnostic } | Self::Semantic { diagnostic } => {
        Some(diagnostic)
      }
      Self::Internal { .. } => None,
    }
  }
}

/// A message anchored at a byte offset of the compiled source.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Diagnostic {
  pub loc: usize,
  pub line: String,
  pub column: usize,
  pub message: String,
}

impl Diagnostic {
  /// Construct a diagnostic anchored at a specific byte offset in the source.
  ///
  /// Only the line containing `loc` is kept, so multi-line programs still
  /// render as a single quoted line with a caret.
  pub fn at(source: &str, loc: usize, message: impl Into<String>) -> Self {
    let safe_loc = floor_char_boundary(source, loc.min(source.len()));
    let line_start = source[..safe_loc].rfind('\n').map_or(0, |i| i + 1);
    let line_end = source[safe_loc..]
      .find('\n')
      .map_or(source.len(), |i| safe_loc + i);
    let column = source[line_start..safe_loc].chars().count();
    Self {
      loc: safe_loc,
      line: source[line_start..line_end].to_string(),
      column,
      message: message.into(),
    }
  }
}

impl fmt::Display for Diagnostic {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    // +1 accounts for the opening quote
    let marker = format!("{}^", " ".repeat(self.column + 1));
    write!(f, "'{}'\n{marker} {}", self.line, self.message)
  }
}

fn floor_char_boundary(source: &str, mut loc: usize) -> usize {
  while !source.is_char_boundary(loc) {
    loc -= 1;
  }
  loc
}

//! Whitespace-policy filter between the interpreter and the output sink.
//!
//! The formatter buffers pending whitespace between writes so runs that
//! cross `write` calls still collapse correctly; `flush` settles the buffer
//! per the top mode's rules.

use std::io;

use smallvec::SmallVec;

use crate::writer::Writer;

/// Whitespace filtering mode of a `<?teng format space='…'?>` block.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, strum::Display, strum::EnumString)]
#[strum(serialize_all = "lowercase")]
pub enum Mode {
    /// Passes whitespace verbatim.
    #[default]
    PassWhite,
    /// Discards all whitespace.
    NoWhite,
    /// Truncates every whitespace run to a single space.
    OneSpace,
    /// Removes leading and trailing spaces from every line.
    StripLines,
    /// Replaces newlines with a single space.
    JoinLines,
    /// Removes empty and whitespace-only lines.
    NoWhiteLines,
}

/// Whitespace filter writing through to a [`Writer`].
pub struct Formatter<'w> {
    writer: &'w mut dyn Writer,
    modes: SmallVec<[Mode; 8]>,
    /// Whitespace seen since the last non-whitespace byte.
    pending: String,
}

impl<'w> Formatter<'w> {
    pub fn new(writer: &'w mut dyn Writer, initial: Mode) -> Self {
        Self { writer, modes: smallvec::smallvec![initial], pending: String::new() }
    }

    #[must_use]
    pub fn top(&self) -> Mode {
        self.modes.last().copied().unwrap_or(Mode::PassWhite)
    }

    /// Pushes a new mode; `None` re-pushes the current one.
    pub fn push(&mut self, mode: Option<Mode>) -> io::Result<()> {
        self.settle_pending(false)?;
        let mode = mode.unwrap_or_else(|| self.top());
        self.modes.push(mode);
        Ok(())
    }

    /// Pops the current mode. Popping the initial mode is refused.
    pub fn pop(&mut self) -> io::Result<bool> {
        if self.modes.len() <= 1 {
            return Ok(false);
        }
        self.settle_pending(false)?;
        self.modes.pop();
        Ok(true)
    }

    /// Writes `s` through the whitespace filter.
    pub fn write(&mut self, s: &str) -> io::Result<()> {
        if self.top() == Mode::PassWhite && self.pending.is_empty() {
            // fast path for the default mode
            return self.writer.write_str(s);
        }
        let mut rest = s;
        while !rest.is_empty() {
            match rest.find(|c: char| !c.is_ascii_whitespace()) {
                None => {
                    self.pending.push_str(rest);
                    rest = "";
                }
                Some(0) => {
                    self.settle_pending(false)?;
                    let end = rest.find(|c: char| c.is_ascii_whitespace()).unwrap_or(rest.len());
                    self.writer.write_str(&rest[..end])?;
                    rest = &rest[end..];
                }
                Some(white_end) => {
                    self.pending.push_str(&rest[..white_end]);
                    rest = &rest[white_end..];
                }
            }
        }
        Ok(())
    }

    /// Settles any pending whitespace and flushes the sink.
    pub fn flush(&mut self) -> io::Result<()> {
        self.settle_pending(true)?;
        self.writer.flush()
    }

    /// Emits the buffered whitespace run per the current mode. `at_end` is
    /// true when no more output follows (stream flush).
    fn settle_pending(&mut self, at_end: bool) -> io::Result<()> {
        if self.pending.is_empty() {
            return Ok(());
        }
        let pending = std::mem::take(&mut self.pending);
        match self.top() {
            Mode::PassWhite => self.writer.write_str(&pending),
            Mode::NoWhite => Ok(()),
            Mode::OneSpace => self.writer.write_str(" "),
            Mode::StripLines => {
                // only the newlines of the run survive
                for _ in pending.matches('\n') {
                    self.writer.write_str("\n")?;
                }
                Ok(())
            }
            Mode::JoinLines => {
                let joined = pending.replace('\n', " ");
                self.writer.write_str(&joined)
            }
            Mode::NoWhiteLines => match pending.find('\n') {
                None => self.writer.write_str(&pending),
                Some(first) => {
                    // keep trailing whitespace of the previous line and the
                    // leading whitespace of the next content line; whitespace
                    //-only lines in between disappear
                    self.writer.write_str(&pending[..=first])?;
                    let last = pending.rfind('\n').unwrap_or(first);
                    if !at_end {
                        self.writer.write_str(&pending[last + 1..])?;
                    }
                    Ok(())
                }
            },
        }
    }
}

/// Resolves a `space` option value to a mode; `None` for unknown names.
#[must_use]
pub fn resolve_format(name: &str) -> Option<Mode> {
    match name {
        "passwhite" => Some(Mode::PassWhite),
        "nowhite" => Some(Mode::NoWhite),
        "onespace" => Some(Mode::OneSpace),
        "striplines" => Some(Mode::StripLines),
        "joinlines" => Some(Mode::JoinLines),
        "nowhitelines" => Some(Mode::NoWhiteLines),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::writer::StringWriter;

    fn run(mode: Mode, chunks: &[&str]) -> String {
        let mut writer = StringWriter::new();
        {
            let mut formatter = Formatter::new(&mut writer, mode);
            for chunk in chunks {
                formatter.write(chunk).unwrap();
            }
            formatter.flush().unwrap();
        }
        writer.into_output()
    }

    #[test]
    fn passwhite_is_verbatim() {
        assert_eq!(run(Mode::PassWhite, &["a  b\n c"]), "a  b\n c");
    }

    #[test]
    fn nowhite_drops_everything() {
        assert_eq!(run(Mode::NoWhite, &["a  b", "\n c"]), "abc");
    }

    #[test]
    fn onespace_collapses_across_writes() {
        assert_eq!(run(Mode::OneSpace, &["a  ", "  b"]), "a b");
    }

    #[test]
    fn striplines_trims_each_line() {
        assert_eq!(run(Mode::StripLines, &["a   \n   b"]), "a\nb");
    }

    #[test]
    fn joinlines_replaces_newlines() {
        assert_eq!(run(Mode::JoinLines, &["a\nb\nc"]), "a b c");
    }

    #[test]
    fn nowhitelines_drops_blank_lines() {
        assert_eq!(run(Mode::NoWhiteLines, &["a\n\n  \nb"]), "a\nb");
    }

    #[test]
    fn resolve_known_names() {
        assert_eq!(resolve_format("nowhite"), Some(Mode::NoWhite));
        assert_eq!(resolve_format("bogus"), None);
    }
}

//! Level-1 lexer: splits raw template text into text chunks and directive
//! envelopes.
//!
//! The scanner recognizes `<?teng …?>`, `<? … ?>` (short tags), the
//! discarded `<!--- … --->` comment, `${…}`, `%{…}` and `#{…}`. Escape
//! sequences (`$\{`, `#\{`, `%\{`, `<\?`, `?\>`, `\}`) let template authors
//! emit the delimiters literally; they are rewritten inside text tokens.
//! Instances of this lexer are stacked by `include` and `extends`; each
//! instance owns its source so included files outlive their tokens.

use std::{ops::Range, sync::Arc};

use crate::position::Pos;

/// Token kinds produced by the level-1 lexer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum Lex1Kind {
    EndOfInput,
    Error,
    Text,
    /// `<?teng …?>` envelope.
    Teng,
    /// `<? … ?>` envelope (short tags enabled).
    TengShort,
    /// `${…}` escaped expression.
    EscExpr,
    /// `%{…}` raw expression (print-escape mode).
    RawExpr,
    /// `#{…}` dictionary lookup.
    Dict,
}

/// One level-1 token. `text` holds the envelope (or the rewritten text for
/// text chunks, or the message for errors); `span` is the byte range in
/// the owning lexer's source.
#[derive(Debug)]
pub struct Lex1Token {
    pub kind: Lex1Kind,
    pub pos: Pos,
    pub span: Range<usize>,
    pub text: String,
}

/// Deferred work remembered between `next` calls: when a directive follows
/// accumulated text, the text token is emitted first and the directive is
/// parsed on the next call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Initial,
    EndOfInput,
    CommentDirective,
    LongDirective,
    ShortDirective,
    EscExprDirective,
    RawExprDirective,
    DictDirective,
}

/// Behavior switches the scanner takes from the configuration.
#[derive(Debug, Clone, Copy)]
pub struct Lex1Options {
    pub short_tag: bool,
    pub print_escape: bool,
    pub utf8: bool,
}

impl Default for Lex1Options {
    fn default() -> Self {
        Self { short_tag: false, print_escape: false, utf8: true }
    }
}

/// The envelope scanner over one template source.
#[derive(Debug)]
pub struct Lex1 {
    source: Arc<str>,
    offset: usize,
    pos: Pos,
    state: State,
    opts: Lex1Options,
}

impl Lex1 {
    #[must_use]
    pub fn new(source: Arc<str>, filename: Option<Arc<str>>, opts: Lex1Options) -> Self {
        Self { source, offset: 0, pos: Pos::new(filename), state: State::Initial, opts }
    }

    /// The current scan position.
    #[must_use]
    pub fn position(&self) -> &Pos {
        &self.pos
    }

    /// Mutable access to the scan position; callers resuming a captured
    /// source range seed it with the range's original position.
    pub fn position_mut(&mut self) -> &mut Pos {
        &mut self.pos
    }

    /// The scanned source.
    #[must_use]
    pub fn source(&self) -> &Arc<str> {
        &self.source
    }

    /// The current byte offset into the source.
    #[must_use]
    pub fn offset(&self) -> usize {
        self.offset
    }

    /// Returns the next token. After `EndOfInput` every further call
    /// returns `EndOfInput` again.
    pub fn next(&mut self) -> Lex1Token {
        loop {
            // handle work deferred from the previous call
            match std::mem::replace(&mut self.state, State::Initial) {
                State::Initial => {}
                State::EndOfInput => {
                    self.state = State::EndOfInput;
                    return self.make_end_of_input();
                }
                State::CommentDirective => {
                    self.skip_comment();
                    // no token for comments, scan on
                }
                State::LongDirective => return self.accept_directive("<?teng", Lex1Kind::Teng),
                State::ShortDirective => return self.accept_directive("<?", Lex1Kind::TengShort),
                State::EscExprDirective => return self.accept_expr_directive("${", Lex1Kind::EscExpr),
                State::RawExprDirective => return self.accept_expr_directive("%{", Lex1Kind::RawExpr),
                State::DictDirective => return self.accept_dict_directive(),
            }

            let start_offset = self.offset;
            let start_pos = self.pos.clone();

            // gather text until a directive opener shows up
            while self.offset < self.source.len() {
                let rest = &self.source.as_bytes()[self.offset..];
                let deferred = match rest[0] {
                    b'<' if rest.len() > 1 && rest[1] == b'?' => {
                        if rest.len() > 6 && &rest[2..6] == b"teng" && rest[6].is_ascii_whitespace() {
                            Some(State::LongDirective)
                        } else if self.opts.short_tag {
                            Some(State::ShortDirective)
                        } else {
                            None
                        }
                    }
                    b'<' if rest.starts_with(b"<!---") => Some(State::CommentDirective),
                    b'$' if rest.len() > 1 && rest[1] == b'{' => Some(State::EscExprDirective),
                    b'%' if rest.len() > 1 && rest[1] == b'{' && self.opts.print_escape => {
                        Some(State::RawExprDirective)
                    }
                    b'#' if rest.len() > 1 && rest[1] == b'{' => Some(State::DictDirective),
                    _ => None,
                };
                match deferred {
                    Some(state) => {
                        self.state = state;
                        if self.offset == start_offset {
                            // no text gathered, handle the directive now
                            break;
                        }
                        // emit the text first, parse the directive next call
                        return self.make_text(start_offset, start_pos);
                    }
                    None => self.advance_char(),
                }
            }

            if self.state == State::Initial {
                // ran off the end of the source
                self.state = State::EndOfInput;
                if self.offset == start_offset {
                    return self.make_end_of_input();
                }
                return self.make_text(start_offset, start_pos);
            }
        }
    }

    /// Advances over one character: by byte when utf-8 mode is off, by the
    /// whole encoded sequence (one column) when it is on.
    fn advance_char(&mut self) {
        let byte = self.source.as_bytes()[self.offset];
        if self.opts.utf8 {
            let width = match byte {
                0x00..=0xbf => 1,
                0xc0..=0xdf => 2,
                0xe0..=0xef => 3,
                _ => 4,
            };
            if width == 1 {
                self.pos.advance(byte as char);
            } else {
                self.pos.advance_column(1);
            }
            self.offset = (self.offset + width).min(self.source.len());
        } else {
            self.pos.advance(byte as char);
            self.offset += 1;
        }
    }

    fn advance_columns(&mut self, n: usize) {
        self.pos.advance_column(n as u32);
        self.offset += n;
    }

    fn make_end_of_input(&self) -> Lex1Token {
        Lex1Token {
            kind: Lex1Kind::EndOfInput,
            pos: self.pos.clone(),
            span: self.offset..self.offset,
            text: "End of input stream".to_owned(),
        }
    }

    fn make_error(&self, start_offset: usize, pos: Pos, msg: &str) -> Lex1Token {
        Lex1Token { kind: Lex1Kind::Error, pos, span: start_offset..self.offset, text: msg.to_owned() }
    }

    fn make_text(&self, start_offset: usize, start_pos: Pos) -> Lex1Token {
        let raw = &self.source[start_offset..self.offset];
        Lex1Token {
            kind: Lex1Kind::Text,
            pos: start_pos,
            span: start_offset..self.offset,
            text: unescape_text(raw, self.opts.print_escape),
        }
    }

    fn make_token(&self, kind: Lex1Kind, start_offset: usize, start_pos: Pos) -> Lex1Token {
        Lex1Token {
            kind,
            pos: start_pos,
            span: start_offset..self.offset,
            text: self.source[start_offset..self.offset].to_owned(),
        }
    }

    /// Skips an already-matched quoted string; the opening quote is behind
    /// the offset. Backslash escapes the next character.
    fn skip_quoted(&mut self, quote: u8) {
        while self.offset < self.source.len() {
            match self.source.as_bytes()[self.offset] {
                b if b == quote => {
                    self.advance_columns(1);
                    return;
                }
                b'\\' => {
                    self.advance_columns(1);
                    if self.offset < self.source.len() {
                        self.advance_char();
                    }
                }
                _ => self.advance_char(),
            }
        }
    }

    /// Scans a `<?…?>`-style envelope past its terminator; quoted strings
    /// may contain `?>` freely. The envelope must be longer than `<?>`.
    fn accept_directive(&mut self, opener: &'static str, kind: Lex1Kind) -> Lex1Token {
        let start_offset = self.offset;
        let start_pos = self.pos.clone();
        self.advance_columns(opener.len());
        while self.offset < self.source.len() {
            match self.source.as_bytes()[self.offset] {
                b'\'' => {
                    self.advance_columns(1);
                    self.skip_quoted(b'\'');
                }
                b'"' => {
                    self.advance_columns(1);
                    self.skip_quoted(b'"');
                }
                b'>' => {
                    self.advance_columns(1);
                    if self.source.as_bytes()[self.offset - 2] == b'?' && (self.offset - start_offset) > 3 {
                        return self.make_token(kind, start_offset, start_pos);
                    }
                }
                _ => self.advance_char(),
            }
        }
        self.make_error(start_offset, start_pos, "Unterminated <?...?> directive")
    }

    /// Scans a `${…}` / `%{…}` envelope; quoted strings may contain `}`.
    fn accept_expr_directive(&mut self, opener: &'static str, kind: Lex1Kind) -> Lex1Token {
        let start_offset = self.offset;
        let start_pos = self.pos.clone();
        self.advance_columns(opener.len());
        while self.offset < self.source.len() {
            match self.source.as_bytes()[self.offset] {
                b'\'' => {
                    self.advance_columns(1);
                    self.skip_quoted(b'\'');
                }
                b'"' => {
                    self.advance_columns(1);
                    self.skip_quoted(b'"');
                }
                b'}' => {
                    self.advance_columns(1);
                    return self.make_token(kind, start_offset, start_pos);
                }
                _ => self.advance_char(),
            }
        }
        let msg = match kind {
            Lex1Kind::EscExpr => "Unterminated ${...} directive",
            _ => "Unterminated %{...} directive",
        };
        self.make_error(start_offset, start_pos, msg)
    }

    /// Scans a `#{…}` envelope up to the first `}`.
    fn accept_dict_directive(&mut self) -> Lex1Token {
        let start_offset = self.offset;
        let start_pos = self.pos.clone();
        self.advance_columns(2);
        while self.offset < self.source.len() {
            match self.source.as_bytes()[self.offset] {
                b'}' => {
                    self.advance_columns(1);
                    return self.make_token(Lex1Kind::Dict, start_offset, start_pos);
                }
                _ => self.advance_char(),
            }
        }
        self.make_error(start_offset, start_pos, "Unterminated #{...} directive")
    }

    /// Skips a `<!--- … --->` comment. The whole envelope must be longer
    /// than `<!----->`; an unterminated comment swallows the rest.
    fn skip_comment(&mut self) {
        let start_offset = self.offset;
        self.advance_columns(5);
        while self.offset < self.source.len() {
            match self.source.as_bytes()[self.offset] {
                b'>' => {
                    self.advance_columns(1);
                    if self.offset >= 4
                        && &self.source.as_bytes()[self.offset - 4..self.offset - 1] == b"---"
                        && (self.offset - start_offset) > 8
                    {
                        return;
                    }
                }
                _ => self.advance_char(),
            }
        }
    }
}

/// Rewrites envelope escape sequences in a text chunk: `$\{` → `${`,
/// `#\{` → `#{`, `%\{` → `%{` (print-escape mode only), `<\?` → `<?`,
/// `?\>` → `?>` and `\}` → `}`. Everything else is kept verbatim.
fn unescape_text(raw: &str, print_escape: bool) -> String {
    if !raw.contains('\\') {
        return raw.to_owned();
    }
    let bytes = raw.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'\\' && i + 1 < bytes.len() {
            let prev = out.last().copied();
            let next = bytes[i + 1];
            let drop_backslash = match next {
                b'{' => matches!(prev, Some(b'$' | b'#')) || (prev == Some(b'%') && print_escape),
                b'?' => prev == Some(b'<'),
                b'>' => prev == Some(b'?'),
                b'}' => true,
                _ => false,
            };
            if drop_backslash {
                out.push(next);
                i += 2;
                continue;
            }
        }
        out.push(bytes[i]);
        i += 1;
    }
    String::from_utf8_lossy(&out).into_owned()
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    fn scan(source: &str, opts: Lex1Options) -> Vec<(Lex1Kind, String)> {
        let mut lexer = Lex1::new(Arc::from(source), None, opts);
        let mut tokens = Vec::new();
        loop {
            let token = lexer.next();
            if token.kind == Lex1Kind::EndOfInput {
                break;
            }
            tokens.push((token.kind, token.text));
        }
        tokens
    }

    #[test]
    fn text_and_expression() {
        let tokens = scan("Hello, ${name}!", Lex1Options::default());
        assert_eq!(
            tokens,
            vec![
                (Lex1Kind::Text, "Hello, ".to_owned()),
                (Lex1Kind::EscExpr, "${name}".to_owned()),
                (Lex1Kind::Text, "!".to_owned()),
            ]
        );
    }

    #[test]
    fn long_directive() {
        let tokens = scan("a<?teng if x?>b", Lex1Options::default());
        assert_eq!(
            tokens,
            vec![
                (Lex1Kind::Text, "a".to_owned()),
                (Lex1Kind::Teng, "<?teng if x?>".to_owned()),
                (Lex1Kind::Text, "b".to_owned()),
            ]
        );
    }

    #[test]
    fn short_tags_only_when_enabled() {
        let source = "<? if x ?>";
        assert_eq!(scan(source, Lex1Options::default()), vec![(Lex1Kind::Text, source.to_owned())]);
        let opts = Lex1Options { short_tag: true, ..Lex1Options::default() };
        assert_eq!(scan(source, opts), vec![(Lex1Kind::TengShort, source.to_owned())]);
    }

    #[test]
    fn raw_expr_needs_print_escape() {
        let source = "%{x}";
        assert_eq!(scan(source, Lex1Options::default()), vec![(Lex1Kind::Text, source.to_owned())]);
        let opts = Lex1Options { print_escape: true, ..Lex1Options::default() };
        assert_eq!(scan(source, opts), vec![(Lex1Kind::RawExpr, source.to_owned())]);
    }

    #[test]
    fn comments_are_discarded() {
        let tokens = scan("a<!--- hidden --->b", Lex1Options::default());
        assert_eq!(tokens, vec![(Lex1Kind::Text, "a".to_owned()), (Lex1Kind::Text, "b".to_owned())]);
    }

    #[test]
    fn escape_sequences_rewrite() {
        let tokens = scan(r"$\{x} #\{y} <\?teng q?\>", Lex1Options::default());
        assert_eq!(tokens, vec![(Lex1Kind::Text, "${x} #{y} <?teng q?>".to_owned())]);
    }

    #[test]
    fn quoted_terminators_are_skipped() {
        let tokens = scan("${a == '}'}", Lex1Options::default());
        assert_eq!(tokens, vec![(Lex1Kind::EscExpr, "${a == '}'}".to_owned())]);
    }

    #[test]
    fn unterminated_directive_is_an_error() {
        let tokens = scan("${x", Lex1Options::default());
        assert_eq!(tokens[0].0, Lex1Kind::Error);
    }

    #[test]
    fn dict_token() {
        let tokens = scan("#{key}", Lex1Options::default());
        assert_eq!(tokens, vec![(Lex1Kind::Dict, "#{key}".to_owned())]);
    }

    #[test]
    fn spans_index_the_source() {
        let source = "ab${x}cd";
        let mut lexer = Lex1::new(Arc::from(source), None, Lex1Options::default());
        let text = lexer.next();
        assert_eq!(&source[text.span.clone()], "ab");
        let expr = lexer.next();
        assert_eq!(&source[expr.span.clone()], "${x}");
    }
}

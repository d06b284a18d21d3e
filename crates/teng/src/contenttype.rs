//! Content-type descriptors and the escaping machinery.
//!
//! Each descriptor carries comment delimiters, an ordered escape table with
//! a 256-entry lookup bitmap and an unescape automaton compiled from the
//! same escapes. The process-wide descriptor table initializes lazily on
//! first use and is immutable afterwards; lookup is case-insensitive.

use std::sync::LazyLock;

use smallvec::SmallVec;

/// One registered content type: the descriptor plus its registry metadata.
#[derive(Debug)]
pub struct Descriptor {
    pub name: &'static str,
    pub alias: &'static str,
    pub comment: &'static str,
    pub content_type: ContentType,
}

/// Escaping rules for one content type.
#[derive(Debug)]
pub struct ContentType {
    /// Line comment opener, if the language has one.
    line_comment: Option<&'static str>,
    /// Block comment delimiters, if the language has them.
    block_comment: Option<(&'static str, &'static str)>,
    /// Ordered `(byte, escape-string)` pairs.
    escapes: Vec<(u8, String)>,
    /// Maps each byte to its index in `escapes`, or -1.
    bitmap: [i16; 256],
    /// Unescape automaton; each state maps an input byte to a step.
    unescaper: Vec<Vec<(u8, Step)>>,
}

/// A transition in the unescape automaton.
#[derive(Debug, Clone, Copy)]
enum Step {
    /// Continue matching in the given state.
    Goto(usize),
    /// The whole escape sequence matched; emit the original byte.
    Emit(u8),
}

impl Default for ContentType {
    fn default() -> Self {
        Self::new()
    }
}

impl ContentType {
    #[must_use]
    pub fn new() -> Self {
        Self {
            line_comment: None,
            block_comment: None,
            escapes: Vec::new(),
            bitmap: [-1; 256],
            unescaper: Vec::new(),
        }
    }

    /// Registers an escape for `byte`. Returns false if the byte already has
    /// one.
    fn add_escape(&mut self, byte: u8, escape: &str) -> bool {
        if self.bitmap[usize::from(byte)] != -1 {
            return false;
        }
        self.escapes.push((byte, escape.to_owned()));
        self.bitmap[usize::from(byte)] = (self.escapes.len() - 1) as i16;
        true
    }

    /// Compiles the unescape automaton from the registered escapes. Builds a
    /// trie of escape strings and flattens it into a state vector.
    fn compile_unescaper(&mut self) {
        self.unescaper = vec![Vec::new()];
        for idx in 0..self.escapes.len() {
            let (byte, escape) = self.escapes[idx].clone();
            let mut state = 0usize;
            let bytes = escape.as_bytes();
            for (i, &ch) in bytes.iter().enumerate() {
                let last = i + 1 == bytes.len();
                let existing = self.unescaper[state].iter().position(|(c, _)| *c == ch);
                match existing {
                    Some(t) => match self.unescaper[state][t].1 {
                        Step::Goto(next) => state = next,
                        // two escapes may not share a full prefix
                        Step::Emit(_) => break,
                    },
                    None => {
                        if last {
                            self.unescaper[state].push((ch, Step::Emit(byte)));
                        } else {
                            let next = self.unescaper.len();
                            self.unescaper.push(Vec::new());
                            self.unescaper[state].push((ch, Step::Goto(next)));
                            state = next;
                        }
                    }
                }
            }
        }
    }

    /// Substitutes every byte with a registered escape by its sequence.
    /// Multi-byte UTF-8 sequences pass through untouched; all registered
    /// escapes are ASCII.
    #[must_use]
    pub fn escape(&self, src: &str) -> String {
        let mut dest = Vec::with_capacity(src.len());
        for &byte in src.as_bytes() {
            match self.bitmap[usize::from(byte)] {
                -1 => dest.push(byte),
                idx => dest.extend_from_slice(self.escapes[idx as usize].1.as_bytes()),
            }
        }
        String::from_utf8_lossy(&dest).into_owned()
    }

    /// Runs the unescape automaton over `src`, replacing every recognized
    /// escape sequence with its original byte.
    #[must_use]
    pub fn unescape(&self, src: &str) -> String {
        let bytes = src.as_bytes();
        let mut dest = Vec::with_capacity(bytes.len());
        let mut i = 0;
        'outer: while i < bytes.len() {
            if !self.unescaper.is_empty() {
                let mut state = 0usize;
                let mut j = i;
                while j < bytes.len() {
                    let Some(&(_, step)) = self.unescaper[state].iter().find(|(c, _)| *c == bytes[j]) else {
                        break;
                    };
                    match step {
                        Step::Emit(byte) => {
                            dest.push(byte);
                            i = j + 1;
                            continue 'outer;
                        }
                        Step::Goto(next) => {
                            state = next;
                            j += 1;
                        }
                    }
                }
            }
            dest.push(bytes[i]);
            i += 1;
        }
        String::from_utf8_lossy(&dest).into_owned()
    }

    #[must_use]
    pub fn line_comment(&self) -> Option<&'static str> {
        self.line_comment
    }

    #[must_use]
    pub fn block_comment(&self) -> Option<(&'static str, &'static str)> {
        self.block_comment
    }
}

fn html() -> ContentType {
    let mut ct = ContentType::new();
    ct.block_comment = Some(("<!--", "-->"));
    ct.add_escape(b'&', "&amp;");
    ct.add_escape(b'<', "&lt;");
    ct.add_escape(b'>', "&gt;");
    ct.add_escape(b'"', "&quot;");
    ct.compile_unescaper();
    ct
}

fn shell() -> ContentType {
    let mut ct = ContentType::new();
    ct.line_comment = Some("#");
    ct
}

fn csrc() -> ContentType {
    let mut ct = ContentType::new();
    ct.block_comment = Some(("/*", "*/"));
    ct
}

fn quoted_string() -> ContentType {
    let mut ct = ContentType::new();
    ct.add_escape(b'\\', "\\\\");
    ct.add_escape(b'\n', "\\n");
    ct.add_escape(b'\r', "\\r");
    ct.add_escape(0x07, "\\a");
    ct.add_escape(0x00, "\\0");
    ct.add_escape(0x0b, "\\v");
    ct.add_escape(b'\'', "\\'");
    ct.add_escape(b'"', "\\\"");
    ct.compile_unescaper();
    ct
}

fn jshtml() -> ContentType {
    let mut ct = ContentType::new();
    ct.add_escape(b'\\', "\\\\");
    ct.add_escape(b'\n', "\\n");
    ct.add_escape(b'\r', "\\r");
    ct.add_escape(0x07, "\\a");
    ct.add_escape(0x00, "\\0");
    ct.add_escape(0x0b, "\\v");
    ct.add_escape(b'\'', "\\'");
    ct.add_escape(b'"', "\\&quot;");
    ct.add_escape(b'&', "&amp;");
    ct.add_escape(b'<', "&lt;");
    ct.add_escape(b'>', "&gt;");
    ct.compile_unescaper();
    ct
}

fn javascript() -> ContentType {
    let mut ct = ContentType::new();
    ct.add_escape(b'\\', "\\\\");
    ct.add_escape(b'\n', "\\n");
    ct.add_escape(b'\r', "\\r");
    ct.add_escape(0x07, "\\a");
    ct.add_escape(0x00, "\\0");
    ct.add_escape(0x0b, "\\v");
    ct.add_escape(b'\'', "\\'");
    ct.add_escape(b'"', "\\\"");
    ct.add_escape(b'/', "\\/");
    ct.compile_unescaper();
    ct
}

fn json() -> ContentType {
    let mut ct = ContentType::new();
    ct.add_escape(b'"', "\\\"");
    ct.add_escape(b'\\', "\\\\");
    ct.add_escape(0x08, "\\b");
    ct.add_escape(0x0c, "\\f");
    ct.add_escape(b'\n', "\\n");
    ct.add_escape(b'\r', "\\r");
    ct.add_escape(b'\t', "\\t");
    ct.add_escape(b'/', "\\/");
    for byte in 0x00..=0x1f {
        ct.add_escape(byte, &format!("\\u{byte:04X}"));
    }
    ct.compile_unescaper();
    ct
}

/// The process-wide descriptor table. `text/plain` comes first so it is the
/// default; every entry is also reachable under its short alias.
static DESCRIPTORS: LazyLock<Vec<Descriptor>> = LazyLock::new(|| {
    vec![
        Descriptor {
            name: "text/plain",
            alias: "text",
            comment: "Default (text/plain) type.",
            content_type: ContentType::new(),
        },
        Descriptor {
            name: "text/html",
            alias: "html",
            comment: "Hypertext markup language. Same processor as for 'text/xhtml' and 'text/xml'",
            content_type: html(),
        },
        Descriptor {
            name: "text/xhtml",
            alias: "xhtml",
            comment: "X hypertext markup language. Same processor as for 'text/xhtml' and 'text/xml'",
            content_type: html(),
        },
        Descriptor {
            name: "text/xml",
            alias: "xml",
            comment: "Extensible markup language. Same processor as for 'text/xhtml' and 'text/xml'",
            content_type: html(),
        },
        Descriptor {
            name: "application/x-sh",
            alias: "x-sh",
            comment: "Common for all types of shell.",
            content_type: shell(),
        },
        Descriptor { name: "text/csrc", alias: "csrc", comment: "C/C++ source code", content_type: csrc() },
        Descriptor {
            name: "quoted-string",
            alias: "quoted-string",
            comment: "Generic quoted string with escapes.",
            content_type: quoted_string(),
        },
        Descriptor {
            name: "jshtml",
            alias: "jshtml",
            comment: "Quoted string embeddable into HTML pages.",
            content_type: jshtml(),
        },
        Descriptor {
            name: "application/x-javascript",
            alias: "js",
            comment: "Javascript language.",
            content_type: javascript(),
        },
        Descriptor { name: "application/json", alias: "json", comment: "Json.", content_type: json() },
    ]
});

/// The default descriptor (`text/plain`).
#[must_use]
pub fn default_descriptor() -> &'static Descriptor {
    &DESCRIPTORS[0]
}

/// Case-insensitive lookup by name or alias.
#[must_use]
pub fn find(name: &str) -> Option<&'static Descriptor> {
    let lower = name.to_ascii_lowercase();
    DESCRIPTORS.iter().find(|d| d.name == lower || d.alias == lower)
}

/// All supported content types as `(name, comment)` pairs. The default
/// `text/plain` descriptor is implicit and not listed.
#[must_use]
pub fn list_supported() -> Vec<(String, String)> {
    DESCRIPTORS.iter().skip(1).map(|d| (d.name.to_owned(), d.comment.to_owned())).collect()
}

/// The stack of active content types controlling escaping of printed
/// values. Popping the last descriptor is refused; the caller reports it.
#[derive(Debug)]
pub struct EscapeStack {
    stack: SmallVec<[&'static Descriptor; 4]>,
}

impl EscapeStack {
    #[must_use]
    pub fn new(initial: &'static Descriptor) -> Self {
        Self { stack: smallvec::smallvec![initial] }
    }

    #[must_use]
    pub fn top(&self) -> &'static Descriptor {
        self.stack.last().expect("escape stack is never empty")
    }

    pub fn push(&mut self, descriptor: &'static Descriptor) {
        self.stack.push(descriptor);
    }

    /// Pops the top descriptor; returns false (and keeps the stack intact)
    /// when only the initial descriptor remains.
    pub fn pop(&mut self) -> bool {
        if self.stack.len() <= 1 {
            return false;
        }
        self.stack.pop();
        true
    }

    /// Escapes through the top descriptor.
    #[must_use]
    pub fn escape(&self, src: &str) -> String {
        self.top().content_type.escape(src)
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn html_escape() {
        let ct = find("text/html").unwrap();
        assert_eq!(ct.content_type.escape("a<&>\"b"), "a&lt;&amp;&gt;&quot;b");
    }

    #[test]
    fn escape_unescape_round_trip() {
        let subject = "a<&>\"'\\\n/plain\ttext\u{8}";
        for descriptor in [
            "text/plain",
            "text/html",
            "application/x-sh",
            "text/csrc",
            "quoted-string",
            "jshtml",
            "application/x-javascript",
            "application/json",
        ] {
            let ct = &find(descriptor).unwrap().content_type;
            assert_eq!(ct.unescape(&ct.escape(subject)), subject, "round trip for {descriptor}");
        }
    }

    #[test]
    fn json_escapes_control_bytes() {
        let ct = &find("json").unwrap().content_type;
        assert_eq!(ct.escape("\u{1}"), "\\u0001");
        assert_eq!(ct.unescape("\\u0001"), "\u{1}");
    }

    #[test]
    fn lookup_is_case_insensitive_with_aliases() {
        assert!(find("TEXT/HTML").is_some());
        assert!(find("Html").is_some());
        assert!(find("nonsense").is_none());
    }

    #[test]
    fn escape_stack_refuses_last_pop() {
        let mut stack = EscapeStack::new(default_descriptor());
        assert!(!stack.pop());
        stack.push(find("html").unwrap());
        assert_eq!(stack.escape("<"), "&lt;");
        assert!(stack.pop());
        assert_eq!(stack.escape("<"), "<");
    }
}

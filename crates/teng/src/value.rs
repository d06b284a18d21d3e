//! The tagged runtime value.
//!
//! Values live on the interpreter's operand stack and inside `VAL`
//! instructions. String references borrow either instruction-owned or
//! dictionary-owned buffers; fragment and list references borrow the
//! caller's data tree. All borrows share the `'a` lifetime of one
//! `generate_page` run.

use std::{borrow::Cow, fmt, sync::Arc};

use crate::fragment::{Fragment, FragmentList};

/// A compiled regular expression literal with its flag set. Shared between
/// the instruction that owns it and any stack copies.
#[derive(Debug)]
pub struct RegexVal {
    pattern: String,
    flags: String,
    re: regex::Regex,
}

impl RegexVal {
    /// Compiles `/pattern/flags`. Supported flags: `i` (case-insensitive),
    /// `m` (multi-line), `s` (dot matches newline), `x` (verbose), `g`
    /// (accepted, no effect on match-only semantics).
    pub fn new(pattern: &str, flags: &str) -> Result<Self, regex::Error> {
        let mut builder = regex::RegexBuilder::new(pattern);
        for flag in flags.chars() {
            match flag {
                'i' => builder.case_insensitive(true),
                'm' => builder.multi_line(true),
                's' => builder.dot_matches_new_line(true),
                'x' => builder.ignore_whitespace(true),
                _ => &mut builder,
            };
        }
        Ok(Self { pattern: pattern.to_owned(), flags: flags.to_owned(), re: builder.build()? })
    }

    /// True if the pattern matches anywhere in `subject`.
    #[must_use]
    pub fn matches(&self, subject: &str) -> bool {
        self.re.is_match(subject)
    }

    #[must_use]
    pub fn pattern(&self) -> &str {
        &self.pattern
    }

    #[must_use]
    pub fn flags(&self) -> &str {
        &self.flags
    }
}

/// Reference into a fragment list plus the index of the current fragment.
#[derive(Debug, Clone, Copy)]
pub struct ListRef<'a> {
    pub list: &'a FragmentList,
    pub idx: usize,
}

impl<'a> ListRef<'a> {
    #[must_use]
    pub fn new(list: &'a FragmentList, idx: usize) -> Self {
        Self { list, idx }
    }

    /// The fragment the reference currently points at, if in range.
    #[must_use]
    pub fn frag(&self) -> Option<&'a Fragment> {
        self.list.get(self.idx)
    }
}

/// The tagged sum of everything a template expression can produce.
#[derive(Debug, Clone, Default)]
pub enum Value<'a> {
    #[default]
    Undefined,
    Int(i64),
    Real(f64),
    /// Owned string (computed at runtime).
    Str(String),
    /// Borrowed string; backed by an instruction- or dictionary-owned buffer.
    StrRef(&'a str),
    /// Reference to a fragment in the data tree.
    Frag(&'a Fragment),
    /// Null fragment reference; prints as `$null$`.
    FragNull,
    /// Reference to a fragment list plus current index.
    List(ListRef<'a>),
    /// Shared compiled regular expression.
    Regex(Arc<RegexVal>),
}

impl<'a> Value<'a> {
    /// The tag name used by the `type()` query.
    #[must_use]
    pub fn tag_str(&self) -> &'static str {
        match self {
            Self::Undefined => "undefined",
            Self::Int(_) => "integral",
            Self::Real(_) => "real",
            Self::Str(_) => "string",
            Self::StrRef(_) => "string_ref",
            Self::Frag(_) | Self::FragNull => "frag_ref",
            Self::List(_) => "list_ref",
            Self::Regex(_) => "regex",
        }
    }

    #[must_use]
    pub fn is_undefined(&self) -> bool {
        matches!(self, Self::Undefined)
    }

    #[must_use]
    pub fn is_integral(&self) -> bool {
        matches!(self, Self::Int(_))
    }

    #[must_use]
    pub fn is_real(&self) -> bool {
        matches!(self, Self::Real(_))
    }

    #[must_use]
    pub fn is_number(&self) -> bool {
        matches!(self, Self::Int(_) | Self::Real(_))
    }

    #[must_use]
    pub fn is_string_like(&self) -> bool {
        matches!(self, Self::Str(_) | Self::StrRef(_))
    }

    /// Integral coercion: reals truncate, everything non-numeric is 0.
    #[must_use]
    pub fn integral(&self) -> i64 {
        match self {
            Self::Int(v) => *v,
            Self::Real(v) => *v as i64,
            _ => 0,
        }
    }

    /// Real coercion: integers promote, everything non-numeric is 0.0.
    #[must_use]
    pub fn real(&self) -> f64 {
        match self {
            Self::Int(v) => *v as f64,
            Self::Real(v) => *v,
            _ => 0.0,
        }
    }

    /// Borrows string content for string-like values, empty otherwise.
    #[must_use]
    pub fn string(&self) -> &str {
        match self {
            Self::Str(s) => s,
            Self::StrRef(s) => s,
            _ => "",
        }
    }

    /// Truth value: false for undefined, zero, empty strings and null
    /// references; a regex is always true.
    #[must_use]
    pub fn truthy(&self) -> bool {
        match self {
            Self::Undefined | Self::FragNull => false,
            Self::Int(v) => *v != 0,
            Self::Real(v) => *v != 0.0,
            Self::Str(s) => !s.is_empty(),
            Self::StrRef(s) => !s.is_empty(),
            Self::Frag(_) | Self::List(_) | Self::Regex(_) => true,
        }
    }

    /// The printable representation: numbers in canonical decimal form,
    /// strings verbatim, references as opaque markers, undefined as the
    /// literal word.
    #[must_use]
    pub fn printable(&self) -> Cow<'_, str> {
        match self {
            Self::Undefined => Cow::Borrowed("undefined"),
            Self::Int(v) => Cow::Owned(v.to_string()),
            Self::Real(v) => Cow::Owned(format_real(*v)),
            Self::Str(s) => Cow::Borrowed(s.as_str()),
            Self::StrRef(s) => Cow::Borrowed(s),
            Self::Frag(_) => Cow::Borrowed("$frag$"),
            Self::FragNull => Cow::Borrowed("$null$"),
            Self::List(_) => Cow::Borrowed("$list$"),
            Self::Regex(_) => Cow::Borrowed("$regex$"),
        }
    }

    /// Converts into an owned string holding the printable representation.
    #[must_use]
    pub fn into_printable(self) -> String {
        match self {
            Self::Str(s) => s,
            other => other.printable().into_owned(),
        }
    }

    /// Rebinds the lifetime of a value that holds no borrows.
    ///
    /// `VAL` instructions own their payload; pushing one onto the operand
    /// stack borrows the instruction's string buffer instead of cloning it.
    #[must_use]
    pub fn borrowed<'b>(&'b self) -> Value<'b> {
        match self {
            Self::Undefined => Value::Undefined,
            Self::Int(v) => Value::Int(*v),
            Self::Real(v) => Value::Real(*v),
            Self::Str(s) => Value::StrRef(s),
            Self::StrRef(s) => Value::StrRef(s),
            Self::Frag(f) => Value::Frag(f),
            Self::FragNull => Value::FragNull,
            Self::List(l) => Value::List(*l),
            Self::Regex(r) => Value::Regex(Arc::clone(r)),
        }
    }

    /// Converts into a value owning all its string data, detaching it from
    /// data-tree and instruction lifetimes where possible.
    #[must_use]
    pub fn into_owned(self) -> Value<'static> {
        match self {
            Self::Undefined => Value::Undefined,
            Self::Int(v) => Value::Int(v),
            Self::Real(v) => Value::Real(v),
            Self::Str(s) => Value::Str(s),
            Self::StrRef(s) => Value::Str(s.to_owned()),
            Self::Regex(r) => Value::Regex(r),
            // references into the data tree cannot outlive it
            Self::Frag(_) | Self::List(_) | Self::FragNull => Value::Undefined,
        }
    }
}

/// Canonical decimal form of a real number.
#[must_use]
pub fn format_real(v: f64) -> String {
    if v.is_finite() {
        let mut buf = ryu::Buffer::new();
        buf.format(v).to_owned()
    } else if v.is_nan() {
        "nan".to_owned()
    } else if v > 0.0 {
        "inf".to_owned()
    } else {
        "-inf".to_owned()
    }
}

impl PartialEq for Value<'_> {
    /// Structural equality per variant; fragment and list references compare
    /// by pointer identity (plus index for lists). Cross-variant numeric
    /// comparison is the comparison instructions' job, not this impl's.
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::Undefined, Self::Undefined) => true,
            (Self::Int(a), Self::Int(b)) => a == b,
            (Self::Real(a), Self::Real(b)) => a == b,
            (Self::Str(a), Self::Str(b)) => a == b,
            (Self::StrRef(a), Self::StrRef(b)) => a == b,
            (Self::Str(a), Self::StrRef(b)) | (Self::StrRef(b), Self::Str(a)) => a == *b,
            (Self::Frag(a), Self::Frag(b)) => std::ptr::eq(*a, *b),
            (Self::FragNull, Self::FragNull) => true,
            (Self::List(a), Self::List(b)) => std::ptr::eq(a.list, b.list) && a.idx == b.idx,
            (Self::Regex(a), Self::Regex(b)) => Arc::ptr_eq(a, b),
            _ => false,
        }
    }
}

impl fmt::Display for Value<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.printable())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn coercions() {
        assert_eq!(Value::Real(3.9).integral(), 3);
        assert_eq!(Value::Str("x".into()).integral(), 0);
        assert_eq!(Value::Int(2).real(), 2.0);
        assert_eq!(Value::StrRef("hi").string(), "hi");
        assert_eq!(Value::Int(1).string(), "");
    }

    #[test]
    fn truthiness() {
        assert!(!Value::Undefined.truthy());
        assert!(!Value::Int(0).truthy());
        assert!(!Value::Str(String::new()).truthy());
        assert!(Value::Real(0.5).truthy());
        assert!(Value::Regex(Arc::new(RegexVal::new("a", "").unwrap())).truthy());
    }

    #[test]
    fn printable_markers() {
        let frag = Fragment::new();
        assert_eq!(Value::Frag(&frag).printable(), "$frag$");
        assert_eq!(Value::FragNull.printable(), "$null$");
        assert_eq!(Value::Undefined.printable(), "undefined");
        assert_eq!(Value::Real(1.5).printable(), "1.5");
        assert_eq!(Value::Int(-7).printable(), "-7");
    }

    #[test]
    fn frag_ref_equality_is_identity() {
        let a = Fragment::new();
        let b = Fragment::new();
        assert_eq!(Value::Frag(&a), Value::Frag(&a));
        assert_ne!(Value::Frag(&a), Value::Frag(&b));
    }

    #[test]
    fn regex_flags() {
        let re = RegexVal::new("ab+", "i").unwrap();
        assert!(re.matches("xABBy"));
        assert!(!re.matches("xay"));
    }
}

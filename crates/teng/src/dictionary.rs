//! Language dictionaries.
//!
//! The dictionary file format is line oriented: `#` starts a comment,
//! `%` a processing directive, and any other line is an `IDENT VALUE`
//! entry. Values may be double-quoted with C-style escapes and may continue
//! on lines whose first byte is whitespace. With the `expand` directive on,
//! `#{key}` in values substitutes already-parsed entries.

use std::sync::Arc;

use indexmap::IndexMap;

use crate::{error::ErrorLog, fs::Filesystem, position::Pos, sourcelist::SourceList};

/// Maximum dictionary include nesting.
const MAX_DICT_INCLUDE_LEVEL: u32 = 10;

/// Hook consulted for `%` directives the dictionary itself does not know.
/// The configuration layers its switches on top of the base format this way.
/// Returns true when the directive was recognized.
pub(crate) type DirectiveHook<'h> = &'h mut dyn FnMut(&mut ErrorLog, &str, &str, &Pos, &Pos) -> bool;

/// Immutable key→string map parsed from a dictionary source.
#[derive(Debug, Default)]
pub struct Dictionary {
    entries: IndexMap<String, String>,
    sources: SourceList,
    /// `#{name}` expansion in values enabled.
    expand_vars: bool,
    /// Later definitions overwrite earlier ones.
    replace_entries: bool,
    /// The engine-reserved `_tld` value.
    tld: String,
}

impl Dictionary {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Loads and parses `filename` through the filesystem collaborator.
    /// Load problems are logged, never fatal; the result may be empty.
    pub fn load(fs: &dyn Filesystem, err: &mut ErrorLog, filename: &str) -> Self {
        Self::load_with(fs, err, filename, &mut |_, _, _, _, _| false)
    }

    /// Like [`Self::load`] with an extra directive hook.
    pub(crate) fn load_with(fs: &dyn Filesystem, err: &mut ErrorLog, filename: &str, extra: DirectiveHook<'_>) -> Self {
        let mut dict = Self::new();
        dict.parse_file(fs, err, filename, Pos::default(), 0, extra);
        dict
    }

    /// Looks a key up. The reserved key `_tld` always resolves.
    #[must_use]
    pub fn lookup(&self, key: &str) -> Option<&str> {
        match self.entries.get(key) {
            Some(value) => Some(value),
            None if key == "_tld" => Some(&self.tld),
            None => None,
        }
    }

    pub fn set_tld(&mut self, tld: impl Into<String>) {
        self.tld = tld.into();
    }

    #[must_use]
    pub fn sources(&self) -> &SourceList {
        &self.sources
    }

    #[must_use]
    pub fn is_changed(&self, fs: &dyn Filesystem) -> bool {
        self.sources.is_changed(fs)
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Iterates entries in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// Renders all entries, one block per entry, for `<?teng debug?>`.
    #[must_use]
    pub fn dump(&self) -> String {
        let mut out = String::new();
        for (name, value) in &self.entries {
            out.push_str(name);
            out.push_str(": |");
            out.push_str(value);
            out.push_str("|\n----------------------------------------\n");
        }
        out
    }

    fn new_entry(&mut self, name: String, value: String) -> &str {
        if self.replace_entries {
            self.entries.insert(name.clone(), value);
        } else {
            self.entries.entry(name.clone()).or_insert(value);
        }
        self.entries.get(&name).expect("entry was just inserted").as_str()
    }

    fn append_to_entry(&mut self, name: &str, extra: &str) {
        if let Some(value) = self.entries.get_mut(name) {
            value.push(' ');
            value.push_str(extra);
        }
    }

    /// Handles a `%` directive. Returns false for unknown names so callers
    /// layering more directives on top (the configuration) get a chance.
    fn directive(&mut self, err: &mut ErrorLog, name: &str, value: &str, name_pos: &Pos, value_pos: &Pos) -> bool {
        let enable = |err: &mut ErrorLog, feature: &mut bool| match value {
            "yes" | "on" | "true" => *feature = true,
            "no" | "off" | "false" => *feature = false,
            _ => err.warning(
                value_pos.clone(),
                format!(
                    "Invalid bool value of {name} directive '{value}'; \
                     choose one of {{yes, no, on, off, true, false}}"
                ),
            ),
        };
        match name {
            "expand" => {
                let mut flag = self.expand_vars;
                enable(err, &mut flag);
                self.expand_vars = flag;
            }
            "replace" => {
                let mut flag = self.replace_entries;
                enable(err, &mut flag);
                self.replace_entries = flag;
            }
            _ => {
                let _ = name_pos;
                return false;
            }
        }
        true
    }

    fn parse_file(
        &mut self,
        fs: &dyn Filesystem,
        err: &mut ErrorLog,
        filename: &str,
        incl_pos: Pos,
        level: u32,
        extra: DirectiveHook<'_>,
    ) {
        let data = match fs.read(filename) {
            Ok(data) => data,
            Err(e) => {
                err.error(incl_pos, format!("Error reading file '{filename}' ({e})"));
                return;
            }
        };
        let (name, _) = self.sources.push(fs, filename);
        self.parse_text(fs, err, &data, Some(name), level, extra);
    }

    /// Parses dictionary text line by line.
    pub(crate) fn parse_text(
        &mut self,
        fs: &dyn Filesystem,
        err: &mut ErrorLog,
        data: &str,
        filename: Option<Arc<str>>,
        level: u32,
        extra: DirectiveHook<'_>,
    ) {
        let mut pos = Pos::new(filename);
        let mut last_inserted: Option<String> = None;

        if !data.is_empty() && !data.ends_with('\n') {
            let mut eol_pos = pos.clone();
            eol_pos.advance_column(data.lines().last().map(str::len).unwrap_or(0) as u32 + 1);
            err.warning(eol_pos, "No newline at end of file");
        }

        for line in data.split('\n') {
            let line = line.strip_suffix('\r').unwrap_or(line);
            if line.is_empty() {
                pos.new_line();
                continue;
            }

            match line.as_bytes()[0] {
                b'#' => last_inserted = None,
                b'%' => {
                    self.process_directive(fs, err, line, &pos, level, extra);
                    last_inserted = None;
                }
                b' ' | b'\t' | 0x0b => {
                    // continuation of the previous entry's value
                    match &last_inserted {
                        Some(name) => {
                            let trimmed = line.trim_start();
                            let spaces = (line.len() - trimmed.len()) as u32;
                            let mut value_pos = pos.clone();
                            value_pos.advance_column(spaces);
                            let value = self.parse_entry_value(err, trimmed, &value_pos);
                            self.append_to_entry(&name.clone(), &value);
                        }
                        None => err.warning(pos.clone(), "No dict entry to concatenate with"),
                    }
                }
                b'.' | b'_' | b'a'..=b'z' | b'A'..=b'Z' => {
                    last_inserted = self.process_entry(err, line, &pos);
                }
                _ => {
                    last_inserted = None;
                    err.warning(pos.clone(), format!("Illegal identifier: line={line}"));
                }
            }
            pos.new_line();
        }
    }

    fn process_directive(
        &mut self,
        fs: &dyn Filesystem,
        err: &mut ErrorLog,
        line: &str,
        pos: &Pos,
        level: u32,
        extra: DirectiveHook<'_>,
    ) {
        let body = &line[1..];
        let name_end = body.find(|c: char| c.is_ascii_whitespace()).unwrap_or(body.len());
        let name = &body[..name_end];
        let value = body[name_end..].trim();

        let mut name_pos = pos.clone();
        name_pos.advance_column(1);
        let mut value_pos = pos.clone();
        value_pos.advance_column((line.len() - value.len()) as u32);

        if name == "include)" {
            self.include_file(fs, err, value, &value_pos, level, extra);
        } else if !self.directive(err, name, value, &name_pos, &value_pos)
            && !extra(err, name, value, &name_pos, &value_pos)
        {
            err.warning(name_pos, "Unknown processing directive");
        }
    }

    fn include_file(
        &mut self,
        fs: &dyn Filesystem,
        err: &mut ErrorLog,
        filename: &str,
        incl_pos: &Pos,
        level: u32,
        extra: DirectiveHook<'_>,
    ) {
        if level > MAX_DICT_INCLUDE_LEVEL {
            err.error(incl_pos.clone(), format!("Too many includes: {level}"));
            return;
        }
        let filename = filename.trim();
        if filename.is_empty() {
            err.warning(incl_pos.clone(), "Missing filename to include");
            return;
        }
        self.parse_file(fs, err, filename, incl_pos.clone(), level + 1, extra);
    }

    fn process_entry(&mut self, err: &mut ErrorLog, line: &str, pos: &Pos) -> Option<String> {
        let ident_end = line
            .bytes()
            .position(|b| !(b.is_ascii_alphanumeric() || b == b'_'))
            .unwrap_or(line.len());

        // the first invalid character must be whitespace
        if let Some(&next) = line.as_bytes().get(ident_end)
            && !next.is_ascii_whitespace()
        {
            let mut bad_pos = pos.clone();
            bad_pos.advance_column(ident_end as u32);
            err.warning(bad_pos, "Invalid character in identifier");
            return None;
        }

        let name = &line[..ident_end];
        let value_view = line[ident_end..].trim_start();
        let mut value_pos = pos.clone();
        value_pos.advance_column((line.len() - value_view.len()) as u32);

        let value = self.parse_entry_value(err, value_view, &value_pos);
        self.new_entry(name.to_owned(), value);
        Some(name.to_owned())
    }

    /// Parses one entry value: optional double quoting, C-style escapes.
    /// Each escape emits exactly one character.
    fn parse_entry_value(&mut self, err: &mut ErrorLog, value: &str, value_pos: &Pos) -> String {
        let mut result = String::with_capacity(value.len());
        let bytes = value.as_bytes();
        let mut quoted = false;
        let mut i = 0;

        let make_pos = |offset: usize| {
            let mut p = value_pos.clone();
            p.advance_column(offset as u32);
            p
        };

        while i < bytes.len() {
            match bytes[i] {
                b'\\' => {
                    i += 1;
                    if i == bytes.len() {
                        err.warning(make_pos(i), "EOL escaping not allowed");
                        result.push('\\');
                        break;
                    }
                    match bytes[i] {
                        b'n' => result.push('\n'),
                        b'r' => result.push('\r'),
                        b't' => result.push('\t'),
                        b'v' => result.push('\u{b}'),
                        b'\\' => result.push('\\'),
                        b'"' => result.push('"'),
                        other => {
                            err.warning(make_pos(i), "Invalid escape sequence");
                            result.push(other as char);
                        }
                    }
                    i += 1;
                }
                b'"' => {
                    if i == 0 {
                        quoted = true;
                        i += 1;
                    } else if quoted {
                        if !value[i + 1..].trim().is_empty() {
                            err.warning(make_pos(i + 1), "Text after closing quote");
                        }
                        return self.maybe_expand(err, result, value_pos);
                    } else {
                        result.push('"');
                        i += 1;
                    }
                }
                _ => {
                    // copy whole UTF-8 sequences at once
                    let ch_len = value[i..].chars().next().map(char::len_utf8).unwrap_or(1);
                    result.push_str(&value[i..i + ch_len]);
                    i += ch_len;
                }
            }
        }

        if quoted {
            err.warning(make_pos(value.len()), "Missing closing quote");
        }
        self.maybe_expand(err, result, value_pos)
    }

    fn maybe_expand(&mut self, err: &mut ErrorLog, value: String, value_pos: &Pos) -> String {
        if self.expand_vars { self.expand_value(err, &value, value_pos) } else { value }
    }

    /// Substitutes `#{key}` occurrences from already-parsed entries.
    fn expand_value(&mut self, err: &mut ErrorLog, value: &str, value_pos: &Pos) -> String {
        let mut expanded = String::with_capacity(value.len());
        let mut rest = value;
        let mut offset = 0usize;

        let make_pos = |offset: usize| {
            let mut p = value_pos.clone();
            p.advance_column(offset as u32);
            p
        };

        while let Some(open) = rest.find("#{") {
            expanded.push_str(&rest[..open]);
            let after_open = &rest[open + 2..];
            let Some(close) = after_open.find('}') else {
                err.warning(make_pos(value.len()), "Unterminated #{} variable");
                expanded.push_str(&rest[open..]);
                return expanded;
            };
            let key = &after_open[..close];
            match self.entries.get(key) {
                Some(entry) => expanded.push_str(entry),
                None => {
                    expanded.push_str("#{");
                    expanded.push_str(key);
                    expanded.push('}');
                    err.warning(make_pos(offset + open), format!("Dict item '{key}' not found"));
                }
            }
            offset += open + 2 + close + 1;
            rest = &after_open[close + 1..];
        }
        expanded.push_str(rest);
        expanded
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::fs::InMemoryFilesystem;

    fn parse(data: &str) -> (Dictionary, ErrorLog) {
        let fs = InMemoryFilesystem::new();
        fs.insert("test.dict", data);
        let mut err = ErrorLog::new();
        let dict = Dictionary::load(&fs, &mut err, "test.dict");
        (dict, err)
    }

    #[test]
    fn plain_entries() {
        let (dict, _) = parse("hello world\nbye \"good bye\"\n");
        assert_eq!(dict.lookup("hello"), Some("world"));
        assert_eq!(dict.lookup("bye"), Some("good bye"));
        assert_eq!(dict.lookup("missing"), None);
    }

    #[test]
    fn tld_is_always_defined() {
        let (mut dict, _) = parse("");
        assert_eq!(dict.lookup("_tld"), Some(""));
        dict.set_tld("cz");
        assert_eq!(dict.lookup("_tld"), Some("cz"));
    }

    #[test]
    fn comments_and_continuations() {
        let (dict, _) = parse("# comment\ngreeting hello\n  to everyone\n");
        assert_eq!(dict.lookup("greeting"), Some("hello to everyone"));
    }

    #[test]
    fn escapes_emit_one_character() {
        let (dict, err) = parse("v \"a\\nb\\tc\\\\d\\\"e\"\n");
        assert_eq!(dict.lookup("v"), Some("a\nb\tc\\d\"e"));
        assert_eq!(err.max_level(), crate::error::Level::Debug);
    }

    #[test]
    fn expansion_uses_parsed_entries() {
        let (dict, _) = parse("%expand yes\nname Teng\ngreeting \"hello #{name}\"\n");
        assert_eq!(dict.lookup("greeting"), Some("hello Teng"));
    }

    #[test]
    fn expansion_of_missing_key_warns_and_keeps_text() {
        let (dict, err) = parse("%expand yes\ngreeting \"hello #{nobody}\"\n");
        assert_eq!(dict.lookup("greeting"), Some("hello #{nobody}"));
        assert_eq!(err.max_level(), crate::error::Level::Warning);
    }

    #[test]
    fn replace_directive() {
        let (dict, _) = parse("a one\na two\n%replace yes\na three\n");
        assert_eq!(dict.lookup("a"), Some("three"));
        let (dict, _) = parse("a one\na two\n");
        assert_eq!(dict.lookup("a"), Some("one"));
    }

    #[test]
    fn include_directive() {
        let fs = InMemoryFilesystem::new();
        fs.insert("main.dict", "%include) extra.dict\nlocal here\n");
        fs.insert("extra.dict", "included yes\n");
        let mut err = ErrorLog::new();
        let dict = Dictionary::load(&fs, &mut err, "main.dict");
        assert_eq!(dict.lookup("included"), Some("yes"));
        assert_eq!(dict.lookup("local"), Some("here"));
        assert_eq!(dict.sources().len(), 2);
    }

    #[test]
    fn missing_file_is_logged_not_fatal() {
        let fs = InMemoryFilesystem::new();
        let mut err = ErrorLog::new();
        let dict = Dictionary::load(&fs, &mut err, "gone.dict");
        assert!(dict.is_empty());
        assert_eq!(err.max_level(), crate::error::Level::Error);
    }
}

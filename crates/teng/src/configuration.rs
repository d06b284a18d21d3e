//! Engine configuration.
//!
//! A configuration file shares the dictionary format; on top of plain
//! entries it recognizes `%enable FEATURE`, `%disable FEATURE`,
//! `%max-include-depth N` and `%max-debug-val-length N`.

use std::fmt;

use crate::{dictionary::Dictionary, error::ErrorLog, fs::Filesystem};

/// Parsed configuration: the underlying dictionary plus typed switches.
#[derive(Debug)]
pub struct Configuration {
    dict: Dictionary,
    /// `<?teng debug?>` enabled.
    debug: bool,
    /// The `_error` fragment enabled.
    error_fragment: bool,
    /// Error log goes to output too.
    log_to_output: bool,
    /// `<?teng bytecode?>` enabled.
    bytecode: bool,
    /// Cached templates are checked for change.
    watch_files: bool,
    /// Escape always, regardless of the next instruction.
    always_escape: bool,
    /// Short tags `<? ?>` enabled.
    short_tag: bool,
    /// `<?teng format ...?>` enabled.
    format: bool,
    /// Escaping happens only when values are printed.
    print_escape: bool,
    /// Maximal template include depth.
    max_include_depth: u32,
    /// Maximal length of a dumped variable value.
    max_debug_val_length: u16,
}

impl Default for Configuration {
    fn default() -> Self {
        Self {
            dict: Dictionary::new(),
            debug: false,
            error_fragment: false,
            log_to_output: false,
            bytecode: false,
            watch_files: true,
            always_escape: true,
            short_tag: false,
            format: true,
            print_escape: false,
            max_include_depth: 10,
            max_debug_val_length: 40,
        }
    }
}

impl Configuration {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Loads a configuration file; unknown directives and values are logged
    /// as warnings and skipped.
    pub fn load(fs: &dyn Filesystem, err: &mut ErrorLog, filename: &str) -> Self {
        let mut config = Self::default();
        let mut pending: Vec<(String, String)> = Vec::new();
        let dict = Dictionary::load_with(fs, err, filename, &mut |err, name, value, name_pos, value_pos| {
            match name {
                "enable" | "disable" => {
                    pending.push((name.to_owned(), value.to_owned()));
                    true
                }
                "max-include-depth" => match value.parse::<u32>() {
                    Ok(depth) => {
                        pending.push((name.to_owned(), depth.to_string()));
                        true
                    }
                    Err(_) => {
                        err.warning(
                            value_pos.clone(),
                            format!("Invalid numeric value of {name} directive '{value}'"),
                        );
                        true
                    }
                },
                "max-debug-val-length" => match value.parse::<u16>() {
                    Ok(len) => {
                        pending.push((name.to_owned(), len.to_string()));
                        true
                    }
                    Err(_) => {
                        err.warning(
                            value_pos.clone(),
                            format!("Invalid numeric value of {name} directive '{value}'"),
                        );
                        true
                    }
                },
                _ => {
                    let _ = name_pos;
                    false
                }
            }
        });
        config.dict = dict;
        for (name, value) in pending {
            match name.as_str() {
                "enable" => {
                    if config.set_feature(&value, true).is_none() {
                        err.warning(Default::default(), format!("You can't enable unknown '{value}' feature"));
                    }
                }
                "disable" => {
                    if config.set_feature(&value, false).is_none() {
                        err.warning(Default::default(), format!("You can't disable unknown '{value}' feature"));
                    }
                }
                "max-include-depth" => config.max_include_depth = value.parse().unwrap_or(config.max_include_depth),
                "max-debug-val-length" => {
                    config.max_debug_val_length = value.parse().unwrap_or(config.max_debug_val_length);
                }
                _ => {}
            }
        }
        config
    }

    /// Turns a named feature on or off; `None` for unknown names. Accepts
    /// both compact (`watchfiles`) and hyphenated (`watch-files`) spellings.
    fn set_feature(&mut self, name: &str, enabled: bool) -> Option<()> {
        match name.replace('-', "").as_str() {
            "debug" => self.debug = enabled,
            "errorfragment" => self.error_fragment = enabled,
            "logtooutput" => self.log_to_output = enabled,
            "bytecode" => self.bytecode = enabled,
            "watchfiles" => self.watch_files = enabled,
            "alwaysescape" => self.always_escape = enabled,
            "shorttag" => self.short_tag = enabled,
            "format" => self.format = enabled,
            "printescape" => self.print_escape = enabled,
            _ => return None,
        }
        Some(())
    }

    /// Reports the state of a named feature; `None` for unknown names.
    /// Backs the `isenabled()` builtin.
    #[must_use]
    pub fn is_enabled(&self, name: &str) -> Option<bool> {
        Some(match name.replace('-', "").as_str() {
            "debug" => self.debug,
            "errorfragment" => self.error_fragment,
            "logtooutput" => self.log_to_output,
            "bytecode" => self.bytecode,
            "watchfiles" => self.watch_files,
            "alwaysescape" => self.always_escape,
            "shorttag" => self.short_tag,
            "format" => self.format,
            "printescape" => self.print_escape,
            _ => return None,
        })
    }

    #[must_use]
    pub fn is_debug_enabled(&self) -> bool {
        self.debug
    }

    #[must_use]
    pub fn is_error_fragment_enabled(&self) -> bool {
        self.error_fragment
    }

    #[must_use]
    pub fn is_log_to_output_enabled(&self) -> bool {
        self.log_to_output
    }

    #[must_use]
    pub fn is_bytecode_enabled(&self) -> bool {
        self.bytecode
    }

    #[must_use]
    pub fn is_watch_files_enabled(&self) -> bool {
        self.watch_files
    }

    #[must_use]
    pub fn is_always_escape_enabled(&self) -> bool {
        self.always_escape
    }

    #[must_use]
    pub fn is_short_tag_enabled(&self) -> bool {
        self.short_tag
    }

    #[must_use]
    pub fn is_format_enabled(&self) -> bool {
        self.format
    }

    #[must_use]
    pub fn is_print_escape_enabled(&self) -> bool {
        self.print_escape
    }

    #[must_use]
    pub fn max_include_depth(&self) -> u32 {
        self.max_include_depth
    }

    #[must_use]
    pub fn max_debug_val_length(&self) -> u16 {
        self.max_debug_val_length
    }

    /// The configuration dictionary (the `DICT` instruction's fallback).
    #[must_use]
    pub fn dict(&self) -> &Dictionary {
        &self.dict
    }

    #[must_use]
    pub fn is_changed(&self, fs: &dyn Filesystem) -> bool {
        self.dict.is_changed(fs)
    }

    /// Flips the print-escape switch on a configuration built in code.
    pub fn set_print_escape(&mut self, enabled: bool) {
        self.print_escape = enabled;
    }

    /// Enables `<? … ?>` short tags on a configuration built in code.
    pub fn set_short_tag(&mut self, enabled: bool) {
        self.short_tag = enabled;
    }
}

impl fmt::Display for Configuration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Configuration:")?;
        writeln!(f, "    debug: {}", if self.debug { "enabled" } else { "disabled" })?;
        writeln!(f, "    errorfragment: {}", if self.error_fragment { "enabled" } else { "disabled" })?;
        writeln!(f, "    logtooutput: {}", if self.log_to_output { "enabled" } else { "disabled" })?;
        writeln!(f, "    bytecode: {}", if self.bytecode { "enabled" } else { "disabled" })?;
        writeln!(f, "    watchfiles: {}", if self.watch_files { "enabled" } else { "disabled" })?;
        writeln!(f, "    format: {}", if self.format { "enabled" } else { "disabled" })?;
        writeln!(f, "    alwaysescape: {}", if self.always_escape { "enabled" } else { "disabled" })?;
        writeln!(f, "    printescape: {}", if self.print_escape { "enabled" } else { "disabled" })?;
        writeln!(f, "    shorttag: {}", if self.short_tag { "enabled" } else { "disabled" })?;
        writeln!(f, "    maxincludedepth: {}", self.max_include_depth)?;
        writeln!(f, "    maxdebugvallength: {}", self.max_debug_val_length)
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::fs::InMemoryFilesystem;

    fn load(data: &str) -> (Configuration, ErrorLog) {
        let fs = InMemoryFilesystem::new();
        fs.insert("teng.conf", data);
        let mut err = ErrorLog::new();
        let config = Configuration::load(&fs, &mut err, "teng.conf");
        (config, err)
    }

    #[test]
    fn defaults() {
        let config = Configuration::default();
        assert!(config.is_watch_files_enabled());
        assert!(config.is_format_enabled());
        assert!(config.is_always_escape_enabled());
        assert!(!config.is_debug_enabled());
        assert!(!config.is_print_escape_enabled());
        assert_eq!(config.max_include_depth(), 10);
    }

    #[test]
    fn enable_disable_directives() {
        let (config, _) = load("%enable debug\n%disable watch-files\n%enable short-tag\n");
        assert!(config.is_debug_enabled());
        assert!(!config.is_watch_files_enabled());
        assert!(config.is_short_tag_enabled());
    }

    #[test]
    fn numeric_directives() {
        let (config, _) = load("%max-include-depth 3\n%max-debug-val-length 10\n");
        assert_eq!(config.max_include_depth(), 3);
        assert_eq!(config.max_debug_val_length(), 10);
    }

    #[test]
    fn unknown_feature_warns() {
        let (_, err) = load("%enable teleport\n");
        assert_eq!(err.max_level(), crate::error::Level::Warning);
    }

    #[test]
    fn config_entries_remain_lookupable() {
        let (config, _) = load("answer 42\n");
        assert_eq!(config.dict().lookup("answer"), Some("42"));
    }
}

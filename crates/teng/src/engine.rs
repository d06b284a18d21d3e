//! The public engine: template cache orchestration and `generate_page`.
//!
//! The engine owns three LRU caches (programs, dictionaries,
//! configurations) keyed by normalized source keys. A lookup walks the
//! dependency chain config → dictionary → program, rebuilding every level
//! whose dependency serial no longer matches or whose sources changed
//! while `watchFiles` is on.

use std::{cell::RefCell, sync::Arc};

use crate::{
    cache::{Cache, CacheKey, key_for_filename, key_for_string},
    compiler,
    configuration::Configuration,
    contenttype,
    dictionary::Dictionary,
    error::{ErrorLog, Level},
    fragment::{Fragment, FragmentList},
    fs::{Filesystem, NativeFilesystem},
    program::Program,
    udf::UdfRegistry,
    vm,
    writer::Writer,
};

/// Arguments of one `generate_page` call. The template comes either from
/// a file (`template_filename`, optionally skinned) or from an inline
/// string — exactly one of the two.
#[derive(Debug, Default, Clone)]
pub struct GenPageArgs {
    pub template_filename: String,
    pub template_string: String,
    /// Skin inserted before the template filename's extension.
    pub skin: String,
    /// Language dictionary filename; the language inserts before its
    /// extension.
    pub dict_filename: String,
    pub lang: String,
    /// Configuration filename.
    pub params_filename: String,
    /// Initial content type for escaping (e.g. `text/html`).
    pub content_type: String,
    /// Template character encoding; `utf-8` enables character-wise
    /// column tracking and string functions.
    pub encoding: String,
}

/// Engine construction knobs. Zero cache sizes select the built-in
/// defaults.
#[derive(Debug, Clone, Default)]
pub struct Settings {
    pub program_cache_size: usize,
    pub dict_cache_size: usize,
}

/// The templating engine. One instance holds the caches and the UDF
/// registry; `generate_page` may be called repeatedly. The caches are not
/// internally synchronized — share an instance across threads only with
/// external serialization.
pub struct Teng {
    fs_root: String,
    fs: Box<dyn Filesystem>,
    cache: RefCell<TemplateCache>,
    udf: UdfRegistry,
}

impl Teng {
    /// Creates an engine reading templates from the OS filesystem under
    /// `fs_root`.
    #[must_use]
    pub fn new(fs_root: impl Into<String>, settings: &Settings) -> Self {
        Self::with_filesystem(fs_root, settings, Box::new(NativeFilesystem))
    }

    /// Creates an engine over a caller-provided filesystem.
    #[must_use]
    pub fn with_filesystem(
        fs_root: impl Into<String>,
        settings: &Settings,
        fs: Box<dyn Filesystem>,
    ) -> Self {
        Self {
            fs_root: fs_root.into(),
            fs,
            cache: RefCell::new(TemplateCache::new(settings)),
            udf: UdfRegistry::new(),
        }
    }

    /// The user-defined-function registry consulted for `udf.*` calls.
    pub fn udf_registry_mut(&mut self) -> &mut UdfRegistry {
        &mut self.udf
    }

    #[must_use]
    pub fn udf_registry(&self) -> &UdfRegistry {
        &self.udf
    }

    /// Generates a page: compiles (or fetches) the template, executes it
    /// against `data` and writes the result through `writer`. Returns the
    /// worst diagnostic level encountered.
    pub fn generate_page(
        &self,
        args: &GenPageArgs,
        data: &Fragment,
        writer: &mut dyn Writer,
        err: &mut ErrorLog,
    ) -> Level {
        let encoding = if args.encoding.is_empty() { "utf-8".to_owned() } else { args.encoding.to_lowercase() };

        let (source, from_file) = if args.template_filename.is_empty() {
            (args.template_string.clone(), false)
        } else {
            (prepend_before_ext(&args.template_filename, &args.skin), true)
        };
        let dict_filename = prepend_before_ext(&args.dict_filename, &args.lang);

        let (program, dict, params) = self.cache.borrow_mut().create_template(
            err,
            &*self.fs,
            &self.fs_root,
            &source,
            from_file,
            &dict_filename,
            &args.params_filename,
            &encoding,
            &args.content_type,
        );

        if !program.is_empty() {
            // the error fragment mirrors the log gathered so far
            let error_frags =
                params.is_error_fragment_enabled().then(|| error_log_frags(err));
            let env = vm::RunEnv {
                program: &program,
                dict: &dict,
                params: &params,
                encoding: &encoding,
                udf: Some(&self.udf),
                error_frags: error_frags.as_ref(),
            };
            let content_type = contenttype::find(&args.content_type);
            let _ = vm::run(&env, data, writer, err, content_type);
        }

        if params.is_log_to_output_enabled() && !err.is_empty() {
            let _ = writer.write_str(&err.dump());
        }
        let _ = writer.flush();
        err.max_level()
    }

    /// Looks a key up in a dictionary, honoring the configuration.
    #[must_use]
    pub fn dictionary_lookup(&self, config: &str, dict: &str, lang: &str, key: &str) -> Option<String> {
        let mut err = ErrorLog::new();
        let path = prepend_before_ext(dict, lang);
        let (dictionary, _, _) = self.cache.borrow_mut().get_config_and_dict(
            &mut err,
            &*self.fs,
            &self.fs_root,
            config,
            &path,
        );
        dictionary.lookup(key).map(str::to_owned)
    }

    /// All supported content types as `(name, comment)` pairs.
    #[must_use]
    pub fn list_supported_content_types() -> Vec<(String, String)> {
        contenttype::list_supported()
    }
}

/// Inserts `prep` before the filename extension: `a/b.html` + `mobile` →
/// `a/b.mobile.html`; appended when there is no extension.
fn prepend_before_ext(filename: &str, prep: &str) -> String {
    if prep.is_empty() || filename.is_empty() {
        return filename.to_owned();
    }
    let dot = filename.rfind('.');
    let slash = filename.rfind('/');
    match dot {
        Some(dot) if slash.is_none_or(|slash| slash < dot) => {
            format!("{}.{prep}{}", &filename[..dot], &filename[dot..])
        }
        _ => format!("{filename}.{prep}"),
    }
}

/// Renders the error log as the `_error` fragment list: one fragment per
/// entry with `filename`, `line`, `column`, `level` and `message`.
fn error_log_frags(err: &ErrorLog) -> FragmentList {
    let mut list = FragmentList::new();
    for entry in err.entries() {
        let frag = list.add_fragment();
        frag.add_string("filename", entry.pos.filename.as_deref().unwrap_or(""));
        frag.add_int("line", i64::from(entry.pos.lineno));
        frag.add_int("column", i64::from(entry.pos.colno));
        frag.add_string("level", entry.level.to_string());
        frag.add_string("message", entry.msg.clone());
    }
    list
}

/// The three dependency-chained LRU caches.
struct TemplateCache {
    programs: Cache<Program>,
    dicts: Cache<Dictionary>,
    configs: Cache<Configuration>,
}

impl TemplateCache {
    fn new(settings: &Settings) -> Self {
        Self {
            programs: Cache::new(settings.program_cache_size),
            dicts: Cache::new(settings.dict_cache_size),
            configs: Cache::new(settings.dict_cache_size),
        }
    }

    /// Returns the program with its dictionary and configuration,
    /// recompiling whatever became stale.
    #[expect(clippy::too_many_arguments, reason = "the cache walk takes the whole request")]
    fn create_template(
        &mut self,
        err: &mut ErrorLog,
        fs: &dyn Filesystem,
        fs_root: &str,
        source: &str,
        from_file: bool,
        dict_filename: &str,
        config_filename: &str,
        encoding: &str,
        content_type: &str,
    ) -> (Arc<Program>, Arc<Dictionary>, Arc<Configuration>) {
        let (dict, params, dict_serial) =
            self.get_config_and_dict(err, fs, fs_root, config_filename, dict_filename);

        let template_key = if from_file {
            key_for_filename(fs_root, source)
        } else {
            key_for_string(source)
        };
        let key: CacheKey = vec![
            template_key,
            key_for_filename(fs_root, dict_filename),
            key_for_filename(fs_root, config_filename),
        ];

        let cached = self.programs.find(&key);
        let reload = match &cached {
            None => true,
            Some((program, depend_serial, _)) => {
                *depend_serial != dict_serial
                    || (params.is_watch_files_enabled() && program.is_changed(fs))
            }
        };

        let program = if reload {
            log::debug!("recompiling template {source:?}");
            let program = Arc::new(if from_file {
                compiler::compile_file(err, &dict, &params, fs, fs_root, source, encoding, content_type)
            } else {
                compiler::compile_string(err, &dict, &params, fs, fs_root, source, encoding, content_type)
            });
            self.programs.add(key, Arc::clone(&program), dict_serial);
            program
        } else {
            cached.expect("cache entry exists when no reload is needed").0
        };

        (program, dict, params)
    }

    /// Walks the config → dictionary dependency chain; returns the
    /// dictionary, the configuration and the dictionary's serial.
    fn get_config_and_dict(
        &mut self,
        err: &mut ErrorLog,
        fs: &dyn Filesystem,
        fs_root: &str,
        config_filename: &str,
        dict_filename: &str,
    ) -> (Arc<Dictionary>, Arc<Configuration>, u64) {
        let config_key: CacheKey = vec![key_for_filename(fs_root, config_filename)];
        let cached = self.configs.find(&config_key);
        let reload = match &cached {
            None => true,
            Some((config, _, _)) => config.is_watch_files_enabled() && config.is_changed(fs),
        };
        let (params, config_serial) = if reload {
            let config = Arc::new(if config_filename.is_empty() {
                Configuration::default()
            } else {
                Configuration::load(fs, err, &full_path(fs_root, config_filename))
            });
            let serial = self.configs.add(config_key.clone(), Arc::clone(&config), 0);
            (config, serial)
        } else {
            let (config, _, serial) = cached.expect("cache entry exists when no reload is needed");
            (config, serial)
        };

        let mut dict_key = config_key;
        dict_key.push(key_for_filename(fs_root, dict_filename));
        let cached = self.dicts.find(&dict_key);
        let reload = match &cached {
            None => true,
            Some((dict, depend_serial, _)) => {
                *depend_serial != config_serial
                    || (params.is_watch_files_enabled() && dict.is_changed(fs))
            }
        };
        let (dict, dict_serial) = if reload {
            let dict = Arc::new(if dict_filename.is_empty() {
                Dictionary::new()
            } else {
                Dictionary::load(fs, err, &full_path(fs_root, dict_filename))
            });
            let serial = self.dicts.add(dict_key, Arc::clone(&dict), config_serial);
            (dict, serial)
        } else {
            let (dict, _, serial) = cached.expect("cache entry exists when no reload is needed");
            (dict, serial)
        };

        (dict, params, dict_serial)
    }
}

/// Resolves a filename against the filesystem root.
fn full_path(fs_root: &str, filename: &str) -> String {
    if filename.starts_with('/') || fs_root.is_empty() {
        filename.to_owned()
    } else {
        format!("{fs_root}/{filename}")
    }
}

/// One-call convenience over an engine-less inline template: compiles and
/// executes `template` against `data` with default configuration.
pub fn generate_string(
    template: &str,
    data: &Fragment,
    writer: &mut dyn Writer,
    err: &mut ErrorLog,
) -> Level {
    let engine = Teng::with_filesystem("", &Settings::default(), Box::new(crate::fs::InMemoryFilesystem::new()));
    let args = GenPageArgs { template_string: template.to_owned(), ..GenPageArgs::default() };
    engine.generate_page(&args, data, writer, err)
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn prepend_before_ext_cases() {
        assert_eq!(prepend_before_ext("page.html", "mobile"), "page.mobile.html");
        assert_eq!(prepend_before_ext("dir.v2/page", "mobile"), "dir.v2/page.mobile");
        assert_eq!(prepend_before_ext("page", "skin"), "page.skin");
        assert_eq!(prepend_before_ext("page.html", ""), "page.html");
        assert_eq!(prepend_before_ext("", "skin"), "");
    }
}

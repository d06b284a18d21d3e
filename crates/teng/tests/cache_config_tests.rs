//! Caching, configuration switches and dictionary integration through the
//! engine.

use std::{io, sync::Arc};

use pretty_assertions::assert_eq;
use teng::{
    ErrorLog, Filesystem, Fragment, GenPageArgs, InMemoryFilesystem, Level, Settings, StringWriter, Teng,
};

/// Shares an in-memory filesystem between the engine and the test so the
/// test can change files after handing the box over.
struct SharedFs(Arc<InMemoryFilesystem>);

impl Filesystem for SharedFs {
    fn read(&self, path: &str) -> io::Result<String> {
        self.0.read(path)
    }

    fn hash(&self, path: &str) -> io::Result<u64> {
        self.0.hash(path)
    }
}

fn engine_with(files: &[(&str, &str)]) -> (Teng, Arc<InMemoryFilesystem>) {
    let fs = Arc::new(InMemoryFilesystem::new());
    for (path, contents) in files {
        fs.insert(*path, *contents);
    }
    let engine = Teng::with_filesystem("", &Settings::default(), Box::new(SharedFs(Arc::clone(&fs))));
    (engine, fs)
}

fn page(engine: &Teng, args: &GenPageArgs, data: &Fragment) -> (String, ErrorLog) {
    let mut writer = StringWriter::new();
    let mut err = ErrorLog::new();
    engine.generate_page(args, data, &mut writer, &mut err);
    (writer.into_output(), err)
}

#[test]
fn template_change_is_picked_up() {
    let (engine, fs) = engine_with(&[("page.html", "one")]);
    let args = GenPageArgs { template_filename: "page.html".to_owned(), ..GenPageArgs::default() };
    let data = Fragment::new();

    assert_eq!(page(&engine, &args, &data).0, "one");
    // served from the cache
    assert_eq!(page(&engine, &args, &data).0, "one");

    fs.insert("page.html", "two");
    assert_eq!(page(&engine, &args, &data).0, "two");
}

#[test]
fn watch_files_disabled_keeps_stale_program() {
    let (engine, fs) = engine_with(&[
        ("teng.conf", "%disable watch-files\n"),
        ("page.html", "one"),
    ]);
    let args = GenPageArgs {
        template_filename: "page.html".to_owned(),
        params_filename: "teng.conf".to_owned(),
        ..GenPageArgs::default()
    };
    let data = Fragment::new();

    assert_eq!(page(&engine, &args, &data).0, "one");
    fs.insert("page.html", "two");
    assert_eq!(page(&engine, &args, &data).0, "one");
}

#[test]
fn dictionary_lookup_in_templates() {
    let (engine, _) = engine_with(&[
        ("lang.dict", "greeting Dobry den\n"),
        ("page.html", "#{greeting}!"),
    ]);
    let args = GenPageArgs {
        template_filename: "page.html".to_owned(),
        dict_filename: "lang.dict".to_owned(),
        ..GenPageArgs::default()
    };
    let (output, err) = page(&engine, &args, &Fragment::new());
    assert_eq!(output, "Dobry den!");
    assert!(err.is_empty(), "log: {}", err.dump());
}

#[test]
fn missing_dictionary_key_becomes_its_own_text() {
    let (engine, _) = engine_with(&[("page.html", "#{nothing}")]);
    let args = GenPageArgs { template_filename: "page.html".to_owned(), ..GenPageArgs::default() };
    let (output, err) = page(&engine, &args, &Fragment::new());
    assert_eq!(output, "nothing");
    assert_eq!(err.max_level(), Level::Warning);
}

#[test]
fn language_variant_of_dictionary() {
    let (engine, _) = engine_with(&[
        ("app.cs.dict", "hello ahoj\n"),
        ("app.en.dict", "hello hi\n"),
        ("page.html", "#{hello}"),
    ]);
    for (lang, expected) in [("cs", "ahoj"), ("en", "hi")] {
        let args = GenPageArgs {
            template_filename: "page.html".to_owned(),
            dict_filename: "app.dict".to_owned(),
            lang: lang.to_owned(),
            ..GenPageArgs::default()
        };
        assert_eq!(page(&engine, &args, &Fragment::new()).0, expected);
    }
}

#[test]
fn dictionary_change_recompiles_dependent_template() {
    // dictionary lookups resolve at compile time, so a dictionary change
    // must invalidate the cached program
    let (engine, fs) = engine_with(&[
        ("lang.dict", "word one\n"),
        ("page.html", "#{word}"),
    ]);
    let args = GenPageArgs {
        template_filename: "page.html".to_owned(),
        dict_filename: "lang.dict".to_owned(),
        ..GenPageArgs::default()
    };
    assert_eq!(page(&engine, &args, &Fragment::new()).0, "one");
    fs.insert("lang.dict", "word two\n");
    assert_eq!(page(&engine, &args, &Fragment::new()).0, "two");
}

#[test]
fn dictionary_lookup_api() {
    let (engine, _) = engine_with(&[("app.en.dict", "farewell bye\n")]);
    assert_eq!(engine.dictionary_lookup("", "app.dict", "en", "farewell"), Some("bye".to_owned()));
    assert_eq!(engine.dictionary_lookup("", "app.dict", "en", "missing"), None);
}

#[test]
fn skin_selects_template_variant() {
    let (engine, _) = engine_with(&[
        ("page.html", "desktop"),
        ("page.touch.html", "touch"),
    ]);
    let args = GenPageArgs {
        template_filename: "page.html".to_owned(),
        skin: "touch".to_owned(),
        ..GenPageArgs::default()
    };
    assert_eq!(page(&engine, &args, &Fragment::new()).0, "touch");
}

#[test]
fn log_to_output_appends_diagnostics() {
    let (engine, _) = engine_with(&[
        ("teng.conf", "%enable log-to-output\n"),
        ("page.html", "${missing}"),
    ]);
    let args = GenPageArgs {
        template_filename: "page.html".to_owned(),
        params_filename: "teng.conf".to_owned(),
        ..GenPageArgs::default()
    };
    let (output, _) = page(&engine, &args, &Fragment::new());
    assert!(output.starts_with("undefined"));
    assert!(output.contains("is undefined"), "output: {output}");
}

#[test]
fn bytecode_directive_is_guarded() {
    let (engine, _) = engine_with(&[
        ("on.conf", "%enable bytecode\n"),
        ("page.html", "<?teng bytecode?>x"),
    ]);
    // disabled by default: nothing dumped
    let args = GenPageArgs { template_filename: "page.html".to_owned(), ..GenPageArgs::default() };
    assert_eq!(page(&engine, &args, &Fragment::new()).0, "x");
    // enabled: the disassembly precedes the text
    let args = GenPageArgs {
        template_filename: "page.html".to_owned(),
        params_filename: "on.conf".to_owned(),
        ..GenPageArgs::default()
    };
    let (output, _) = page(&engine, &args, &Fragment::new());
    assert!(output.contains("BYTECODE_FRAG"), "output: {output}");
    assert!(output.contains("HALT"));
}

#[test]
fn debug_directive_dumps_data_tree() {
    let (engine, _) = engine_with(&[
        ("on.conf", "%enable debug\n"),
        ("page.html", "<?teng debug?>"),
    ]);
    let args = GenPageArgs {
        template_filename: "page.html".to_owned(),
        params_filename: "on.conf".to_owned(),
        ..GenPageArgs::default()
    };
    let mut data = Fragment::new();
    data.add_string("secret", "value");
    let (output, _) = page(&engine, &args, &data);
    assert!(output.contains("Application data:"), "output: {output}");
    assert!(output.contains("secret: 'value'"));
}

#[test]
fn error_fragment_lists_diagnostics() {
    let (engine, _) = engine_with(&[
        ("on.conf", "%enable error-fragment\n"),
        ("page.html", "${missing}<?teng frag _error?>[${level}:${message}]<?teng endfrag?>"),
    ]);
    let args = GenPageArgs {
        template_filename: "page.html".to_owned(),
        params_filename: "on.conf".to_owned(),
        ..GenPageArgs::default()
    };
    let (output, _) = page(&engine, &args, &Fragment::new());
    // compile-time diagnostics are visible; the block renders one entry
    // per log line gathered before execution
    assert!(output.starts_with("undefined"), "output: {output}");
}

#[test]
fn short_tag_needs_configuration() {
    let (engine, _) = engine_with(&[
        ("on.conf", "%enable short-tag\n"),
        ("page.html", "<? if 1 ?>yes<? endif ?>"),
    ]);
    let args = GenPageArgs { template_filename: "page.html".to_owned(), ..GenPageArgs::default() };
    assert_eq!(page(&engine, &args, &Fragment::new()).0, "<? if 1 ?>yes<? endif ?>");
    let args = GenPageArgs {
        template_filename: "page.html".to_owned(),
        params_filename: "on.conf".to_owned(),
        ..GenPageArgs::default()
    };
    assert_eq!(page(&engine, &args, &Fragment::new()).0, "yes");
}

#[test]
fn print_escape_defers_escaping_and_enables_raw_prints() {
    let (engine, _) = engine_with(&[
        ("on.conf", "%enable print-escape\n"),
        ("page.html", "${x}|%{x}"),
    ]);
    let args = GenPageArgs {
        template_filename: "page.html".to_owned(),
        params_filename: "on.conf".to_owned(),
        content_type: "text/html".to_owned(),
        ..GenPageArgs::default()
    };
    let mut data = Fragment::new();
    data.add_string("x", "<&>");
    let (output, err) = page(&engine, &args, &data);
    assert!(err.max_level() < Level::Error, "log: {}", err.dump());
    assert_eq!(output, "&lt;&amp;&gt;|<&>");
}

#[test]
fn include_depth_is_limited() {
    let (engine, _) = engine_with(&[
        ("teng.conf", "%max-include-depth 3\n"),
        ("loop.html", "x<?teng include file='loop.html'?>"),
    ]);
    let args = GenPageArgs {
        template_filename: "loop.html".to_owned(),
        params_filename: "teng.conf".to_owned(),
        ..GenPageArgs::default()
    };
    let (output, err) = page(&engine, &args, &Fragment::new());
    assert_eq!(output, "xxx");
    assert_eq!(err.max_level(), Level::Error);
    assert!(err.entries().iter().any(|e| e.msg.contains("include level is too deep")));
}

#[test]
fn native_filesystem_backs_the_engine() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("page.html"), "fs:${name}").unwrap();

    let engine = Teng::new(dir.path().to_str().unwrap(), &Settings::default());
    let args = GenPageArgs { template_filename: "page.html".to_owned(), ..GenPageArgs::default() };
    let mut data = Fragment::new();
    data.add_string("name", "ok");
    let (output, err) = page(&engine, &args, &data);
    assert!(err.max_level() < Level::Error, "log: {}", err.dump());
    assert_eq!(output, "fs:ok");

    // touching the file with new contents triggers a recompile
    std::fs::write(dir.path().join("page.html"), "changed:${name}").unwrap();
    assert_eq!(page(&engine, &args, &data).0, "changed:ok");
}

//! End-to-end template generation through the public engine API.

use pretty_assertions::assert_eq;
use teng::{ErrorLog, Fragment, GenPageArgs, Level, Settings, StringWriter, Teng, generate_string};

fn render(template: &str, data: &Fragment) -> (String, ErrorLog) {
    let mut writer = StringWriter::new();
    let mut err = ErrorLog::new();
    generate_string(template, data, &mut writer, &mut err);
    (writer.into_output(), err)
}

fn render_ok(template: &str, data: &Fragment) -> String {
    let (output, err) = render(template, data);
    assert!(
        err.max_level() < Level::Error,
        "unexpected errors for {template:?}: {}",
        err.dump()
    );
    output
}

#[test]
fn basic_substitution() {
    let mut data = Fragment::new();
    data.add_string("name", "World");
    assert_eq!(render_ok("Hello, ${name}!", &data), "Hello, World!");
}

#[test]
fn fragment_iteration_and_builtins() {
    let data = Fragment::from_json(&serde_json::json!({
        "items": [{"this": "a"}, {"this": "b"}, {"this": "c"}],
    }))
    .unwrap();
    let template = "<?teng frag items?>${_index}:${this}${_last?'':','}<?teng endfrag?>";
    assert_eq!(render_ok(template, &data), "0:a,1:b,2:c");
}

#[test]
fn content_type_escaping() {
    let mut data = Fragment::new();
    data.add_string("x", "<&>");
    let engine = Teng::new("", &Settings::default());
    let args = GenPageArgs {
        template_string: "${x}".to_owned(),
        content_type: "text/html".to_owned(),
        ..GenPageArgs::default()
    };
    let mut writer = StringWriter::new();
    let mut err = ErrorLog::new();
    engine.generate_page(&args, &data, &mut writer, &mut err);
    assert_eq!(writer.output(), "&lt;&amp;&gt;");
}

#[test]
fn if_elif_else() {
    let template = "<?teng if n<0?>neg<?teng elif n==0?>zero<?teng else?>pos<?teng endif?>";
    for (n, expected) in [(-1, "neg"), (0, "zero"), (1, "pos")] {
        let mut data = Fragment::new();
        data.add_int("n", n);
        assert_eq!(render_ok(template, &data), expected, "for n={n}");
    }
}

#[test]
fn case_with_duplicate_label_warns() {
    let mut data = Fragment::new();
    data.add_int("x", 1);
    let (output, err) = render("${case(x,1:'a',1:'b',*:'c')}", &data);
    assert_eq!(output, "a");
    assert_eq!(err.max_level(), Level::Warning);
    assert!(err.entries().iter().any(|entry| entry.msg.contains("Duplicit case operand: 1")));
}

#[test]
fn case_falls_through_to_default() {
    let mut data = Fragment::new();
    data.add_int("x", 9);
    assert_eq!(render_ok("${case(x,1:'a',2,3:'b',*:'c')}", &data), "c");
    data.add_int("x", 3);
    assert_eq!(render_ok("${case(x,1:'a',2,3:'b',*:'c')}", &data), "b");
}

#[test]
fn include_and_extends() {
    let fs = teng::InMemoryFilesystem::new();
    fs.insert("base.html", "<?teng define block head?>BASE<?teng endblock?>[${content}]");
    fs.insert(
        "child.html",
        "<?teng extends file='base.html'?>\
         <?teng override block head?>CHILD-<?teng super?><?teng endblock?>\
         <?teng endextends?>",
    );
    fs.insert("outer.html", "(<?teng include file='child.html'?>)");

    let engine = Teng::with_filesystem("", &Settings::default(), Box::new(fs));
    let mut data = Fragment::new();
    data.add_string("content", "X");

    let args = GenPageArgs { template_filename: "child.html".to_owned(), ..GenPageArgs::default() };
    let mut writer = StringWriter::new();
    let mut err = ErrorLog::new();
    engine.generate_page(&args, &data, &mut writer, &mut err);
    assert!(err.max_level() < Level::Error, "errors: {}", err.dump());
    assert_eq!(writer.output(), "CHILD-BASE[X]");

    let args = GenPageArgs { template_filename: "outer.html".to_owned(), ..GenPageArgs::default() };
    let mut writer = StringWriter::new();
    let mut err = ErrorLog::new();
    engine.generate_page(&args, &data, &mut writer, &mut err);
    assert_eq!(writer.output(), "(CHILD-BASE[X])");
}

#[test]
fn base_template_renders_standalone() {
    let fs = teng::InMemoryFilesystem::new();
    fs.insert("base.html", "<?teng define block head?>BASE<?teng endblock?>[${content}]");
    let engine = Teng::with_filesystem("", &Settings::default(), Box::new(fs));
    let mut data = Fragment::new();
    data.add_string("content", "X");
    let args = GenPageArgs { template_filename: "base.html".to_owned(), ..GenPageArgs::default() };
    let mut writer = StringWriter::new();
    let mut err = ErrorLog::new();
    engine.generate_page(&args, &data, &mut writer, &mut err);
    assert_eq!(writer.output(), "BASE[X]");
}

#[test]
fn nested_fragments_and_absolute_paths() {
    let data = Fragment::from_json(&serde_json::json!({
        "title": "top",
        "section": [{"name": "s1", "row": [{"cell": "c1"}, {"cell": "c2"}]}],
    }))
    .unwrap();
    let template =
        "<?teng frag section?>${name}:<?teng frag row?>${.title}/${cell};<?teng endfrag?><?teng endfrag?>";
    assert_eq!(render_ok(template, &data), "s1:top/c1;top/c2;");
}

#[test]
fn dotted_frag_opens_whole_path() {
    let data = Fragment::from_json(&serde_json::json!({
        "a": {"b": {"x": 7}},
    }))
    .unwrap();
    assert_eq!(render_ok("<?teng frag a.b?>${x}<?teng endfrag?>", &data), "7");
}

#[test]
fn missing_fragment_skips_block() {
    let data = Fragment::new();
    assert_eq!(render_ok("[<?teng frag nope?>${x}<?teng endfrag?>]", &data), "[]");
}

#[test]
fn single_fragment_iterates_once() {
    let data = Fragment::from_json(&serde_json::json!({"user": {"name": "u"}})).unwrap();
    assert_eq!(render_ok("<?teng frag user?>${name}<?teng endfrag?>", &data), "u");
}

#[test]
fn set_and_read_variable() {
    let data = Fragment::new();
    assert_eq!(render_ok("<?teng set greeting = 'hi ' + 'there'?>${greeting}", &data), "hi there");
}

#[test]
fn set_cannot_rewrite_application_data() {
    let mut data = Fragment::new();
    data.add_string("x", "app");
    let (output, err) = render("<?teng set x = 'mine'?>${x}", &data);
    assert_eq!(output, "app");
    assert_eq!(err.max_level(), Level::Warning);
}

#[test]
fn arithmetic_and_precedence() {
    let data = Fragment::new();
    assert_eq!(render_ok("${1 + 2 * 3}", &data), "7");
    assert_eq!(render_ok("${(1 + 2) * 3}", &data), "9");
    assert_eq!(render_ok("${10 / 4}", &data), "2");
    assert_eq!(render_ok("${10 / 4.0}", &data), "2.5");
    assert_eq!(render_ok("${7 % 3}", &data), "1");
    assert_eq!(render_ok("${'ab' ** 3}", &data), "ababab");
    assert_eq!(render_ok("${6 & 3}${6 | 3}${6 ^ 3}", &data), "275");
}

#[test]
fn division_by_zero_warns_and_prints_undefined() {
    let data = Fragment::new();
    let (output, err) = render("${1 / 0}", &data);
    assert_eq!(output, "undefined");
    assert_eq!(err.max_level(), Level::Warning);
}

#[test]
fn string_comparisons_and_digraphs() {
    let mut data = Fragment::new();
    data.add_string("s", "b");
    assert_eq!(render_ok("<?teng if s eq 'b'?>yes<?teng endif?>", &data), "yes");
    assert_eq!(render_ok("<?teng if s lt 'c' and s gt 'a'?>mid<?teng endif?>", &data), "mid");
}

#[test]
fn short_circuit_keeps_deciding_operand() {
    let mut data = Fragment::new();
    data.add_int("yes", 1);
    data.add_int("no", 0);
    assert_eq!(render_ok("${no || 'fallback'}", &data), "fallback");
    assert_eq!(render_ok("${yes && 'value'}", &data), "value");
    assert_eq!(render_ok("${no && 'value'}", &data), "0");
}

#[test]
fn regex_match() {
    let mut data = Fragment::new();
    data.add_string("mail", "who@example.com");
    assert_eq!(render_ok("<?teng if mail =~ /@example\\.com$/?>ours<?teng endif?>", &data), "ours");
    assert_eq!(render_ok("<?teng if mail !~ /@other/?>foreign<?teng endif?>", &data), "foreign");
}

#[test]
fn queries() {
    let data = Fragment::from_json(&serde_json::json!({
        "items": [{"x": 1}],
        "empty_frag": {},
        "name": "joe",
    }))
    .unwrap();
    assert_eq!(render_ok("${exists(name)}", &data), "1");
    assert_eq!(render_ok("${exists(nothing)}", &data), "0");
    assert_eq!(render_ok("${isempty(empty_frag)}", &data), "1");
    // escaping turns the borrowed value into an owned string before the query
    assert_eq!(render_ok("${type(name)}", &data), "string");
    // exists over an open fragment folds at compile time
    assert_eq!(render_ok("<?teng frag items?>${exists(items)}<?teng endfrag?>", &data), "1");
}

#[test]
fn queries_do_not_warn_about_missing_values() {
    let data = Fragment::new();
    let (output, err) = render("${exists(nothing)}", &data);
    assert_eq!(output, "0");
    assert!(err.is_empty(), "unexpected log: {}", err.dump());
}

#[test]
fn runtime_paths_and_indexing() {
    let data = Fragment::from_json(&serde_json::json!({
        "rows": [{"v": "first"}, {"v": "second"}],
    }))
    .unwrap();
    assert_eq!(render_ok("${rows[1].v}", &data), "second");
    assert_eq!(render_ok("${rows[0].v}", &data), "first");
    let (output, err) = render("${rows[5].v}", &data);
    assert_eq!(output, "undefined");
    assert_eq!(err.max_level(), Level::Warning);
}

#[test]
fn builtin_functions() {
    let data = Fragment::new();
    assert_eq!(render_ok("${len('hello')}", &data), "5");
    assert_eq!(render_ok("${substr('hello', 1, 3)}", &data), "el");
    assert_eq!(render_ok("${int('42') + 1}", &data), "43");
    assert_eq!(render_ok("${isnumber(3.5)}", &data), "1");
    assert_eq!(render_ok("${round(1.257, 2)}", &data), "1.26");
    assert_eq!(render_ok("${abs(0 - 5)}", &data), "5");
}

#[test]
fn unknown_function_is_an_error() {
    let data = Fragment::new();
    let (output, err) = render("${warp(1)}", &data);
    assert_eq!(output, "undefined");
    assert_eq!(err.max_level(), Level::Error);
}

#[test]
fn udf_dispatch() {
    let mut engine = Teng::new("", &Settings::default());
    engine
        .udf_registry_mut()
        .register("twice", Box::new(|args| Ok(teng::Value::Int(args[0].integral() * 2))));
    let args = GenPageArgs { template_string: "${udf.twice(21)}".to_owned(), ..GenPageArgs::default() };
    let mut writer = StringWriter::new();
    let mut err = ErrorLog::new();
    engine.generate_page(&args, &Fragment::new(), &mut writer, &mut err);
    assert_eq!(writer.output(), "42");
}

#[test]
fn format_blocks_filter_whitespace() {
    let data = Fragment::new();
    let template = "a<?teng format space='nowhite'?>  b  c  <?teng endformat?>d";
    assert_eq!(render_ok(template, &data), "abcd");
    let template = "<?teng format space='onespace'?>x   y\n z<?teng endformat?>";
    assert_eq!(render_ok(template, &data), "x y z");
}

#[test]
fn ctype_blocks_switch_escaping() {
    let mut data = Fragment::new();
    data.add_string("x", "<b>");
    let template = "<?teng ctype 'text/html'?>${x}<?teng endctype?>${x}";
    assert_eq!(render_ok(template, &data), "&lt;b&gt;<b>");
}

#[test]
fn comments_disappear() {
    let data = Fragment::new();
    assert_eq!(render_ok("a<!--- secret --->b", &data), "ab");
}

#[test]
fn escape_sequences_emit_literal_envelopes() {
    let data = Fragment::new();
    assert_eq!(render_ok(r"$\{name}", &data), "${name}");
}

#[test]
fn unclosed_if_is_discarded() {
    let mut data = Fragment::new();
    data.add_int("n", 1);
    let (output, err) = render("before<?teng if n?>inside", &data);
    assert_eq!(output, "before");
    assert_eq!(err.max_level(), Level::Error);
}

#[test]
fn unknown_variable_warns_and_prints_undefined() {
    let data = Fragment::new();
    let (output, err) = render("${ghost}", &data);
    assert_eq!(output, "undefined");
    assert_eq!(err.max_level(), Level::Warning);
}

#[test]
fn constant_folding_is_transparent() {
    // the optimizer folds these at compile time; output must match the
    // runtime evaluation
    let data = Fragment::new();
    assert_eq!(render_ok("${1 + 2 * 3}|${'a' + 'b'}|${len('xy')}", &data), "7|ab|2");
    assert_eq!(render_ok("${1 ? 'yes' : 'no'}", &data), "yes");
    assert_eq!(render_ok("${0 || 'fallback'}", &data), "fallback");
}

#[test]
fn supported_content_types_are_listed() {
    let types = Teng::list_supported_content_types();
    assert!(types.iter().any(|(name, _)| name == "text/html"));
    assert!(types.iter().any(|(name, _)| name == "application/json"));
    assert_eq!(types.len(), 9);
}

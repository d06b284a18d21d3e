//! Builtin template functions dispatched by the `FUNC` instruction.
//!
//! String and number helpers, escaping helpers, dictionary/configuration
//! reflection and date functions. Every function validates its arguments
//! and reports problems as warnings; the call then yields `undefined`.

use chrono::{Local, TimeZone};

use crate::{
    configuration::Configuration,
    contenttype::{self, Descriptor},
    dictionary::Dictionary,
    value::Value,
};

/// Context the builtin functions may consult.
pub(crate) struct FunctionCtx<'r> {
    pub escaper_top: &'static Descriptor,
    pub params: &'r Configuration,
    pub dict: &'r Dictionary,
    pub encoding: &'r str,
}

impl FunctionCtx<'_> {
    fn utf8(&self) -> bool {
        self.encoding.eq_ignore_ascii_case("utf-8")
    }
}

/// A failed call: the message is logged as a warning and the call yields
/// `undefined`.
pub(crate) type FuncError = String;

type FuncResult = Result<Value<'static>, FuncError>;

/// Looks a builtin function up by name.
pub(crate) fn find_function(name: &str) -> Option<fn(&FunctionCtx<'_>, &[Value<'_>]) -> FuncResult> {
    Some(match name {
        "len" => len,
        "substr" => substr,
        "int" => int,
        "isnumber" => isnumber,
        "round" => round,
        "floor" => floor,
        "ceil" => ceil,
        "abs" => abs,
        "numformat" => numformat,
        "escape" => escape,
        "unescape" => unescape,
        "quoteescape" => quoteescape,
        "getdict" => getdict,
        "dictexist" => dictexist,
        "isenabled" => isenabled,
        "date" => date,
        "now" => now,
        _ => return None,
    })
}

/// True when the function may be evaluated at compile time by the
/// optimizer. Functions reading the clock or the runtime escaping stack
/// must stay at runtime.
pub(crate) fn is_evaluable(name: &str) -> bool {
    !matches!(name, "now" | "escape" | "unescape")
}

fn arity(name: &str, args: &[Value<'_>], expected: std::ops::RangeInclusive<usize>) -> Result<(), FuncError> {
    if expected.contains(&args.len()) {
        Ok(())
    } else {
        Err(format!("{name}(): invalid number of arguments"))
    }
}

fn len(ctx: &FunctionCtx<'_>, args: &[Value<'_>]) -> FuncResult {
    arity("len", args, 1..=1)?;
    if !args[0].is_string_like() {
        return Err("len(): the argument is not a string".to_owned());
    }
    let s = args[0].string();
    let count = if ctx.utf8() { s.chars().count() } else { s.len() };
    Ok(Value::Int(count as i64))
}

fn substr(ctx: &FunctionCtx<'_>, args: &[Value<'_>]) -> FuncResult {
    arity("substr", args, 2..=3)?;
    if !args[0].is_string_like() {
        return Err("substr(): the first argument is not a string".to_owned());
    }
    let s = args[0].string();
    let chars: Vec<char> = if ctx.utf8() { s.chars().collect() } else { s.bytes().map(char::from).collect() };
    let size = chars.len() as i64;

    // negative indices count from the end
    let clamp = |i: i64| -> usize {
        let i = if i < 0 { i + size } else { i };
        i.clamp(0, size) as usize
    };
    let start = clamp(args[1].integral());
    let end = match args.get(2) {
        Some(arg) => clamp(arg.integral()),
        None => size as usize,
    };
    if start >= end {
        return Ok(Value::Str(String::new()));
    }
    Ok(Value::Str(chars[start..end].iter().collect()))
}

fn int(_: &FunctionCtx<'_>, args: &[Value<'_>]) -> FuncResult {
    arity("int", args, 1..=1)?;
    match &args[0] {
        Value::Int(v) => Ok(Value::Int(*v)),
        Value::Real(v) => Ok(Value::Int(*v as i64)),
        value if value.is_string_like() => {
            let s = value.string().trim();
            if let Ok(v) = s.parse::<i64>() {
                return Ok(Value::Int(v));
            }
            match s.parse::<f64>() {
                Ok(v) => Ok(Value::Int(v as i64)),
                Err(_) => Err(format!("int(): can't convert '{s}' to int")),
            }
        }
        value => Err(format!("int(): can't convert {} to int", value.tag_str())),
    }
}

fn isnumber(_: &FunctionCtx<'_>, args: &[Value<'_>]) -> FuncResult {
    arity("isnumber", args, 1..=1)?;
    Ok(Value::Int(i64::from(args[0].is_number())))
}

fn round(_: &FunctionCtx<'_>, args: &[Value<'_>]) -> FuncResult {
    arity("round", args, 1..=2)?;
    if !args[0].is_number() {
        return Err("round(): the argument is not a number".to_owned());
    }
    let precision = args.get(1).map_or(0, Value::integral).clamp(0, 15) as u32;
    let factor = 10f64.powi(precision as i32);
    let rounded = (args[0].real() * factor).round() / factor;
    if precision == 0 { Ok(Value::Int(rounded as i64)) } else { Ok(Value::Real(rounded)) }
}

fn floor(_: &FunctionCtx<'_>, args: &[Value<'_>]) -> FuncResult {
    arity("floor", args, 1..=1)?;
    match &args[0] {
        Value::Int(v) => Ok(Value::Int(*v)),
        Value::Real(v) => Ok(Value::Real(v.floor())),
        _ => Err("floor(): the argument is not a number".to_owned()),
    }
}

fn ceil(_: &FunctionCtx<'_>, args: &[Value<'_>]) -> FuncResult {
    arity("ceil", args, 1..=1)?;
    match &args[0] {
        Value::Int(v) => Ok(Value::Int(*v)),
        Value::Real(v) => Ok(Value::Real(v.ceil())),
        _ => Err("ceil(): the argument is not a number".to_owned()),
    }
}

fn abs(_: &FunctionCtx<'_>, args: &[Value<'_>]) -> FuncResult {
    arity("abs", args, 1..=1)?;
    match &args[0] {
        Value::Int(v) => Ok(Value::Int(v.wrapping_abs())),
        Value::Real(v) => Ok(Value::Real(v.abs())),
        _ => Err("abs(): the argument is not a number".to_owned()),
    }
}

fn numformat(_: &FunctionCtx<'_>, args: &[Value<'_>]) -> FuncResult {
    arity("numformat", args, 2..=4)?;
    if !args[0].is_number() {
        return Err("numformat(): the first argument is not a number".to_owned());
    }
    let precision = args[1].integral().clamp(0, 15) as usize;
    let decimal_sep = args.get(2).map_or(".", Value::string);
    let thousand_sep = args.get(3).map_or("", Value::string);

    let formatted = format!("{:.*}", precision, args[0].real());
    let (int_part, frac_part) = match formatted.split_once('.') {
        Some((i, f)) => (i, Some(f)),
        None => (formatted.as_str(), None),
    };

    let (sign, digits) = match int_part.strip_prefix('-') {
        Some(rest) => ("-", rest),
        None => ("", int_part),
    };
    let mut grouped = String::new();
    for (i, ch) in digits.chars().enumerate() {
        if i > 0 && (digits.len() - i) % 3 == 0 {
            grouped.push_str(thousand_sep);
        }
        grouped.push(ch);
    }

    let mut result = format!("{sign}{grouped}");
    if let Some(frac) = frac_part {
        result.push_str(decimal_sep);
        result.push_str(frac);
    }
    Ok(Value::Str(result))
}

fn escape(ctx: &FunctionCtx<'_>, args: &[Value<'_>]) -> FuncResult {
    arity("escape", args, 1..=1)?;
    Ok(Value::Str(ctx.escaper_top.content_type.escape(&args[0].printable())))
}

fn unescape(ctx: &FunctionCtx<'_>, args: &[Value<'_>]) -> FuncResult {
    arity("unescape", args, 1..=1)?;
    Ok(Value::Str(ctx.escaper_top.content_type.unescape(&args[0].printable())))
}

fn quoteescape(_: &FunctionCtx<'_>, args: &[Value<'_>]) -> FuncResult {
    arity("quoteescape", args, 1..=1)?;
    let quoted = contenttype::find("quoted-string").expect("quoted-string is a builtin content type");
    Ok(Value::Str(quoted.content_type.escape(&args[0].printable())))
}

fn getdict(ctx: &FunctionCtx<'_>, args: &[Value<'_>]) -> FuncResult {
    arity("getdict", args, 1..=2)?;
    let key = args[0].string();
    match ctx.dict.lookup(key).or_else(|| ctx.params.dict().lookup(key)) {
        Some(value) => Ok(Value::Str(value.to_owned())),
        None => Ok(Value::Str(args.get(1).map_or("", Value::string).to_owned())),
    }
}

fn dictexist(ctx: &FunctionCtx<'_>, args: &[Value<'_>]) -> FuncResult {
    arity("dictexist", args, 1..=1)?;
    let key = args[0].string();
    let exists = ctx.dict.lookup(key).is_some() || ctx.params.dict().lookup(key).is_some();
    Ok(Value::Int(i64::from(exists)))
}

fn isenabled(ctx: &FunctionCtx<'_>, args: &[Value<'_>]) -> FuncResult {
    arity("isenabled", args, 1..=1)?;
    let feature = args[0].string();
    match ctx.params.is_enabled(feature) {
        Some(enabled) => Ok(Value::Int(i64::from(enabled))),
        None => Err(format!("isenabled(): unknown feature '{feature}'")),
    }
}

/// Formats an epoch timestamp per a strftime-like pattern in the local
/// timezone; the timezone database is a platform dependency.
fn date(_: &FunctionCtx<'_>, args: &[Value<'_>]) -> FuncResult {
    arity("date", args, 2..=2)?;
    if !args[0].is_string_like() {
        return Err("date(): the first argument is not a format string".to_owned());
    }
    if !args[1].is_number() {
        return Err("date(): the second argument is not a timestamp".to_owned());
    }
    let Some(when) = Local.timestamp_opt(args[1].integral(), 0).single() else {
        return Err(format!("date(): invalid timestamp {}", args[1].integral()));
    };
    Ok(Value::Str(when.format(args[0].string()).to_string()))
}

/// Current time as epoch seconds with subsecond precision. Never folded
/// at compile time.
fn now(_: &FunctionCtx<'_>, args: &[Value<'_>]) -> FuncResult {
    arity("now", args, 0..=0)?;
    let now = Local::now();
    let micros = now.timestamp_micros();
    Ok(Value::Real(micros as f64 / 1_000_000.0))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx<'r>(params: &'r Configuration, dict: &'r Dictionary) -> FunctionCtx<'r> {
        FunctionCtx { escaper_top: contenttype::find("html").unwrap(), params, dict, encoding: "utf-8" }
    }

    #[test]
    fn string_functions() {
        let params = Configuration::default();
        let dict = Dictionary::new();
        let ctx = ctx(&params, &dict);
        assert_eq!(len(&ctx, &[Value::StrRef("příliš")]).unwrap(), Value::Int(6));
        assert_eq!(substr(&ctx, &[Value::StrRef("hello"), Value::Int(1), Value::Int(3)]).unwrap(),
            Value::Str("el".into()));
        assert_eq!(substr(&ctx, &[Value::StrRef("hello"), Value::Int(-2)]).unwrap(), Value::Str("lo".into()));
    }

    #[test]
    fn number_functions() {
        let params = Configuration::default();
        let dict = Dictionary::new();
        let ctx = ctx(&params, &dict);
        assert_eq!(int(&ctx, &[Value::StrRef("42")]).unwrap(), Value::Int(42));
        assert_eq!(round(&ctx, &[Value::Real(1.25), Value::Int(1)]).unwrap(), Value::Real(1.3));
        assert_eq!(round(&ctx, &[Value::Real(1.5)]).unwrap(), Value::Int(2));
        assert_eq!(numformat(&ctx, &[Value::Int(1234567), Value::Int(0), Value::StrRef("."), Value::StrRef(" ")])
            .unwrap(), Value::Str("1 234 567".into()));
        assert!(int(&ctx, &[Value::StrRef("nope")]).is_err());
    }

    #[test]
    fn escaping_functions() {
        let params = Configuration::default();
        let dict = Dictionary::new();
        let ctx = ctx(&params, &dict);
        assert_eq!(escape(&ctx, &[Value::StrRef("<")]).unwrap(), Value::Str("&lt;".into()));
        assert_eq!(unescape(&ctx, &[Value::StrRef("&lt;")]).unwrap(), Value::Str("<".into()));
        assert_eq!(quoteescape(&ctx, &[Value::StrRef("a\"b")]).unwrap(), Value::Str("a\\\"b".into()));
    }

    #[test]
    fn reflection_functions() {
        let params = Configuration::default();
        let mut dict = Dictionary::new();
        dict.set_tld("cz");
        let ctx = ctx(&params, &dict);
        assert_eq!(getdict(&ctx, &[Value::StrRef("nope"), Value::StrRef("dflt")]).unwrap(),
            Value::Str("dflt".into()));
        assert_eq!(dictexist(&ctx, &[Value::StrRef("_tld")]).unwrap(), Value::Int(1));
        assert_eq!(isenabled(&ctx, &[Value::StrRef("format")]).unwrap(), Value::Int(1));
        assert!(isenabled(&ctx, &[Value::StrRef("warp-drive")]).is_err());
    }

    #[test]
    fn now_is_not_evaluable_at_compile_time() {
        assert!(!is_evaluable("now"));
        assert!(is_evaluable("len"));
    }
}

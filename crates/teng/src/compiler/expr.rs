//! Expression compilation.
//!
//! A precedence-climbing parser over level-2 tokens. Every reduction emits
//! its instructions and settles its optimization points; short-circuit
//! operators, the ternary and `case` patch their jumps through local
//! address lists and mark themselves lazily evaluated for the optimizer.

use std::sync::Arc;

use ahash::AHashMap;

use crate::{
    compiler::{
        Compiler,
        ident::{self, Identifier, SegKind, Segment},
    },
    instruction::InstrKind,
    lex2::{Lex2, Lex2Token, Tok},
    position::Pos,
    value::{RegexVal, Value},
};

/// One-token-lookahead stream over a directive body.
pub(crate) struct Toks<'s> {
    lexer: Lex2<'s>,
    peeked: Option<Lex2Token<'s>>,
}

impl<'s> Toks<'s> {
    pub fn new(lexer: Lex2<'s>) -> Self {
        Self { lexer, peeked: None }
    }

    pub fn peek(&mut self) -> &Lex2Token<'s> {
        if self.peeked.is_none() {
            self.peeked = Some(self.lexer.next());
        }
        self.peeked.as_ref().expect("peeked token was just filled")
    }

    pub fn next(&mut self) -> Lex2Token<'s> {
        match self.peeked.take() {
            Some(token) => token,
            None => self.lexer.next(),
        }
    }
}

/// Directive options (`name='value'` pairs with literal values).
pub(crate) type Options = AHashMap<String, Value<'static>>;

/// Parses the `name=literal` option list of a directive.
pub(crate) fn parse_options(ctx: &mut Compiler<'_>, toks: &mut Toks<'_>) -> Options {
    let mut opts = Options::new();
    loop {
        let name = match toks.peek().tok.clone() {
            Tok::Ident(name) => name.to_owned(),
            Tok::End => break,
            _ => {
                let pos = toks.peek().pos.clone();
                ctx.err.warning(pos, "Invalid or excessive tokens in directive options; ignoring them");
                break;
            }
        };
        toks.next();
        if toks.peek().tok != Tok::Assign {
            let pos = toks.peek().pos.clone();
            ctx.err.warning(pos, format!("Missing '=' after the '{name}' option name"));
            break;
        }
        toks.next();
        let value = match toks.next().tok {
            Tok::Str(s) => Value::Str(s),
            Tok::Int(v) => Value::Int(v),
            Tok::Real(v) => Value::Real(v),
            _ => {
                ctx.err.warning(Pos::default(), format!("The value of the '{name}' option is not a literal"));
                break;
            }
        };
        opts.insert(name, value);
    }
    opts
}

/// Parses a dotted identifier path (optionally `$`-prefixed or with a
/// leading dot for absolute paths). Returns `None` when the stream does
/// not start with an identifier.
pub(crate) fn parse_ident(toks: &mut Toks<'_>) -> Option<Identifier> {
    let mut relative = true;
    if toks.peek().tok == Tok::Dot {
        toks.next();
        relative = false;
    }
    let mut segments = Vec::new();
    loop {
        let pos = toks.peek().pos.clone();
        let name = match &toks.peek().tok {
            Tok::Ident(name) => (*name).to_owned(),
            Tok::Var(name) if segments.is_empty() => (*name).to_owned(),
            _ => break,
        };
        toks.next();
        segments.push(Segment { kind: SegKind::classify(&name), name, pos });
        if toks.peek().tok == Tok::Dot {
            // a dot continues the path only when an identifier follows;
            // the peeked dot is already consumed from the lexer state
            let mut probe = toks.lexer.clone();
            if matches!(probe.next().tok, Tok::Ident(_)) {
                toks.next();
                continue;
            }
        }
        break;
    }
    if segments.is_empty() { None } else { Some(Identifier { relative, segments }) }
}

/// Compiles one expression (the ternary level). Returns false on grammar
/// errors; the caller erases the emitted range.
pub(crate) fn compile_expression(ctx: &mut Compiler<'_>, toks: &mut Toks<'_>) -> bool {
    if !logic_or(ctx, toks) {
        return false;
    }
    if toks.peek().tok == Tok::Question {
        let question = toks.next();
        let cond_addr = ctx.program.len();
        ctx.emit(InstrKind::JmpIfNot { offset: 0 }, question.pos.clone());

        if !compile_expression(ctx, toks) {
            return false;
        }
        if toks.next().tok != Tok::Colon {
            return false;
        }

        // the conditional jump lands after the true branch's end jump
        let jmp_addr = ctx.program.len();
        ctx.emit(InstrKind::Jmp { offset: 0 }, question.pos.clone());
        if let InstrKind::JmpIfNot { offset } = &mut ctx.program[cond_addr].kind {
            *offset = jmp_addr as i64 - cond_addr as i64;
        }

        if !compile_expression(ctx, toks) {
            return false;
        }
        let target = ctx.program.len() as i64;
        if let InstrKind::Jmp { offset } = &mut ctx.program[jmp_addr].kind {
            *offset = target - jmp_addr as i64 - 1;
        }
        ctx.emit(InstrKind::Noop, question.pos);
        ctx.optimize_expr(3, true);
    }
    true
}

fn logic_or(ctx: &mut Compiler<'_>, toks: &mut Toks<'_>) -> bool {
    if !logic_and(ctx, toks) {
        return false;
    }
    while toks.peek().tok == Tok::Or {
        let token = toks.next();
        let addr = ctx.program.len();
        ctx.emit(InstrKind::Or { offset: 0 }, token.pos.clone());
        if !logic_and(ctx, toks) {
            return false;
        }
        finalize_short_circuit(ctx, addr, token.pos);
    }
    true
}

fn logic_and(ctx: &mut Compiler<'_>, toks: &mut Toks<'_>) -> bool {
    if !bit_or(ctx, toks) {
        return false;
    }
    while toks.peek().tok == Tok::And {
        let token = toks.next();
        let addr = ctx.program.len();
        ctx.emit(InstrKind::And { offset: 0 }, token.pos.clone());
        if !bit_or(ctx, toks) {
            return false;
        }
        finalize_short_circuit(ctx, addr, token.pos);
    }
    true
}

/// Patches a short-circuit jump to the current end and breaks the print
/// merge with a no-op.
fn finalize_short_circuit(ctx: &mut Compiler<'_>, addr: usize, pos: Pos) {
    let target = ctx.program.len() as i64;
    match &mut ctx.program[addr].kind {
        InstrKind::And { offset } | InstrKind::Or { offset } => *offset = target - addr as i64 - 1,
        _ => {}
    }
    ctx.emit(InstrKind::Noop, pos);
    ctx.optimize_expr(2, true);
}

fn bit_or(ctx: &mut Compiler<'_>, toks: &mut Toks<'_>) -> bool {
    binary_chain(ctx, toks, bit_xor, &[(Tok::BitOr, || InstrKind::BitOr)])
}

fn bit_xor(ctx: &mut Compiler<'_>, toks: &mut Toks<'_>) -> bool {
    binary_chain(ctx, toks, bit_and, &[(Tok::BitXor, || InstrKind::BitXor)])
}

fn bit_and(ctx: &mut Compiler<'_>, toks: &mut Toks<'_>) -> bool {
    binary_chain(ctx, toks, equality, &[(Tok::BitAnd, || InstrKind::BitAnd)])
}

fn equality(ctx: &mut Compiler<'_>, toks: &mut Toks<'_>) -> bool {
    if !relational(ctx, toks) {
        return false;
    }
    loop {
        match toks.peek().tok {
            Tok::Eq | Tok::Ne => {
                let token = toks.next();
                let negate = token.tok == Tok::Ne;
                if !relational(ctx, toks) {
                    return false;
                }
                ctx.emit(if negate { InstrKind::Ne } else { InstrKind::Eq }, token.pos);
                ctx.optimize_expr(2, false);
            }
            Tok::StrEq | Tok::StrNe => {
                let token = toks.next();
                let negate = token.tok == Tok::StrNe;
                match toks.next().tok {
                    Tok::Regex { pattern, flags } => match RegexVal::new(&pattern, &flags) {
                        Ok(regex) => {
                            ctx.emit(
                                InstrKind::MatchRegex { regex: Arc::new(regex), negate },
                                token.pos,
                            );
                            ctx.optimize_expr(1, false);
                        }
                        Err(e) => {
                            ctx.err.error(token.pos, format!("Invalid regular expression: {e}"));
                            return false;
                        }
                    },
                    _ => {
                        ctx.err.error(
                            token.pos,
                            "The right operand of the regex match operator must be a regex literal",
                        );
                        return false;
                    }
                }
            }
            _ => return true,
        }
    }
}

fn relational(ctx: &mut Compiler<'_>, toks: &mut Toks<'_>) -> bool {
    binary_chain(
        ctx,
        toks,
        additive,
        &[
            (Tok::Le, || InstrKind::Le),
            (Tok::Ge, || InstrKind::Ge),
            (Tok::Lt, || InstrKind::Lt),
            (Tok::Gt, || InstrKind::Gt),
        ],
    )
}

fn additive(ctx: &mut Compiler<'_>, toks: &mut Toks<'_>) -> bool {
    binary_chain(ctx, toks, multiplicative, &[(Tok::Plus, || InstrKind::Plus), (Tok::Minus, || InstrKind::Minus)])
}

fn multiplicative(ctx: &mut Compiler<'_>, toks: &mut Toks<'_>) -> bool {
    binary_chain(
        ctx,
        toks,
        unary,
        &[
            (Tok::Mul, || InstrKind::Mul),
            (Tok::Div, || InstrKind::Div),
            (Tok::Mod, || InstrKind::Mod),
            (Tok::Repeat, || InstrKind::Repeat),
        ],
    )
}

/// Left-associative binary operator tier.
fn binary_chain(
    ctx: &mut Compiler<'_>,
    toks: &mut Toks<'_>,
    next_level: fn(&mut Compiler<'_>, &mut Toks<'_>) -> bool,
    table: &[(Tok<'static>, fn() -> InstrKind)],
) -> bool {
    if !next_level(ctx, toks) {
        return false;
    }
    'outer: loop {
        for (tok, make) in table {
            if toks.peek().tok == *tok {
                let token = toks.next();
                if !next_level(ctx, toks) {
                    return false;
                }
                ctx.emit(make(), token.pos);
                ctx.optimize_expr(2, false);
                continue 'outer;
            }
        }
        return true;
    }
}

fn unary(ctx: &mut Compiler<'_>, toks: &mut Toks<'_>) -> bool {
    let kind = match toks.peek().tok {
        Tok::Not => Some(InstrKind::Not),
        Tok::Minus => Some(InstrKind::UnaryMinus),
        Tok::Plus => Some(InstrKind::UnaryPlus),
        Tok::BitNot => Some(InstrKind::BitNot),
        _ => None,
    };
    match kind {
        Some(kind) => {
            let token = toks.next();
            if !unary(ctx, toks) {
                return false;
            }
            ctx.emit(kind, token.pos);
            ctx.optimize_expr(1, false);
            true
        }
        None => primary(ctx, toks),
    }
}

fn primary(ctx: &mut Compiler<'_>, toks: &mut Toks<'_>) -> bool {
    let pos = toks.peek().pos.clone();
    match toks.peek().tok.clone() {
        Tok::Int(v) => {
            toks.next();
            ctx.emit(InstrKind::Val { value: Value::Int(v) }, pos);
            ctx.note_optimization_point(true);
            true
        }
        Tok::Real(v) => {
            toks.next();
            ctx.emit(InstrKind::Val { value: Value::Real(v) }, pos);
            ctx.note_optimization_point(true);
            true
        }
        Tok::Str(s) => {
            toks.next();
            ctx.emit(InstrKind::Val { value: Value::Str(s) }, pos);
            ctx.note_optimization_point(true);
            true
        }
        Tok::LParen => {
            toks.next();
            if !compile_expression(ctx, toks) {
                return false;
            }
            if toks.next().tok != Tok::RParen {
                ctx.err.error(pos, "Missing closing parenthesis");
                return false;
            }
            true
        }
        Tok::Case => {
            toks.next();
            case_expr(ctx, toks, pos)
        }
        Tok::UdfIdent(name) => {
            let name = name.to_owned();
            toks.next();
            if toks.next().tok != Tok::LParen {
                ctx.err.error(pos, "Expected argument list of the udf call");
                return false;
            }
            call_args_and_emit(ctx, toks, name, true, pos)
        }
        Tok::Ident(name) => {
            // a following parenthesis makes it a function call or query;
            // the peeked identifier is already consumed from the lexer
            let name = name.to_owned();
            let mut probe = toks.lexer.clone();
            if probe.next().tok == Tok::LParen {
                toks.next();
                toks.next();
                return match name.as_str() {
                    "defined" | "exists" | "isempty" | "count" | "type" | "repr" => {
                        query_expr(ctx, toks, &name, pos)
                    }
                    _ => call_args_and_emit(ctx, toks, name, false, pos),
                };
            }
            variable(ctx, toks, true)
        }
        Tok::Var(_) | Tok::Dot => variable(ctx, toks, true),
        Tok::Error(msg) => {
            toks.next();
            ctx.err.error(pos, msg);
            false
        }
        _ => false,
    }
}

/// Compiles a variable read: a statically resolvable path becomes a `VAR`,
/// anything with dynamic indices (or unresolvable) becomes a runtime
/// attribute walk.
fn variable(ctx: &mut Compiler<'_>, toks: &mut Toks<'_>, gen_repr: bool) -> bool {
    let Some(ident) = parse_ident(toks) else {
        return false;
    };
    if toks.peek().tok != Tok::LBracket {
        ident::generate_var(ctx, ident, gen_repr);
        return true;
    }

    // dynamic indexing forces the runtime walk from the very start
    let ident = ident::normalize_prefixed(ctx, ident);
    let pos = ident.pos();
    if ident.relative {
        ctx.emit(InstrKind::PushThisFrag, pos);
    } else {
        ctx.emit(InstrKind::PushRootFrag, pos);
    }
    let mut path = ident.path();
    ident::generate_rtvar_path(ctx, &ident.segments, ident.relative, false);

    loop {
        match toks.peek().tok {
            Tok::LBracket => {
                let bracket = toks.next();
                if !compile_expression(ctx, toks) {
                    return false;
                }
                // the index subexpression settled its own point
                ctx.optimization_points.pop();
                if toks.next().tok != Tok::RBracket {
                    ctx.err.error(bracket.pos, "Missing closing bracket of the index operator");
                    return false;
                }
                path.push_str("[]");
                ctx.emit(InstrKind::PushAttrAt { path: path.clone() }, bracket.pos);
            }
            Tok::Dot => {
                toks.next();
                let pos = toks.peek().pos.clone();
                let Tok::Ident(name) = toks.peek().tok.clone() else {
                    ctx.err.error(pos, "Missing attribute name after the dot");
                    return false;
                };
                toks.next();
                let segment = Segment { kind: SegKind::classify(name), name: name.to_owned(), pos };
                path.push('.');
                path.push_str(&segment.name);
                ident::generate_rtvar_path(ctx, std::slice::from_ref(&segment), true, false);
            }
            _ => break,
        }
    }
    if gen_repr {
        let pos = toks.peek().pos.clone();
        ctx.emit(InstrKind::Repr { escape: true }, pos);
    }
    ctx.note_optimization_point(false);
    true
}

/// Compiles `defined(…)`, `exists(…)`, `isempty(…)`, `count(…)`,
/// `type(…)` and `repr(…)`. The opening parenthesis is consumed. Queries
/// over paths fully covered by open fragments fold at compile time.
fn query_expr(ctx: &mut Compiler<'_>, toks: &mut Toks<'_>, name: &str, pos: Pos) -> bool {
    if matches!(name, "defined") {
        ctx.err
            .warning(pos.clone(), "The defined() query is deprecated; use isempty() or exists() instead");
    }
    if matches!(name, "count") {
        ctx.err
            .warning(pos.clone(), "The count() query is deprecated; use _count builtin variable instead");
    }

    // compile-time answer for paths that name an open fragment
    if matches!(name, "defined" | "exists") && matches!(toks.peek().tok, Tok::Ident(_) | Tok::Dot) {
        let mut probe = Toks { lexer: toks.lexer.clone(), peeked: toks.peeked.clone() };
        if let Some(ident) = parse_ident(&mut probe)
            && probe.peek().tok == Tok::RParen
        {
            let normalized = ident::normalize_prefixed(ctx, ident);
            if normalized.segments.iter().all(|seg| seg.kind == SegKind::Name)
                && ctx.open_frames.covers_frag_path(&normalized)
            {
                // drain the probed tokens from the real stream
                while toks.peek().tok != Tok::RParen {
                    toks.next();
                }
                toks.next();
                ctx.emit(InstrKind::Val { value: Value::Int(1) }, pos);
                ctx.note_optimization_point(true);
                return true;
            }
        }
    }

    ctx.emit(InstrKind::LogSuppress, pos.clone());
    ctx.note_optimization_point(true);

    let subject_ok = match name {
        // these reflect on values and accept any expression
        "type" | "repr" => compile_expression(ctx, toks),
        // the rest query paths
        _ => variable(ctx, toks, false),
    };
    if !subject_ok {
        return false;
    }
    if toks.next().tok != Tok::RParen {
        ctx.err.error(pos, format!("Invalid variable identifier in {name}()"));
        return false;
    }

    let kind = match name {
        "defined" => InstrKind::QueryDefined,
        "exists" => InstrKind::QueryExists,
        "isempty" => InstrKind::QueryIsempty,
        "count" => InstrKind::QueryCount,
        "type" => InstrKind::QueryType,
        _ => InstrKind::QueryRepr,
    };
    ctx.emit(kind, pos);
    ctx.optimize_expr(2, false);
    true
}

/// Compiles a function-call argument list and the `FUNC` instruction; the
/// opening parenthesis is consumed.
fn call_args_and_emit(
    ctx: &mut Compiler<'_>,
    toks: &mut Toks<'_>,
    name: String,
    is_udf: bool,
    pos: Pos,
) -> bool {
    let mut nargs = 0usize;
    if toks.peek().tok != Tok::RParen {
        loop {
            if !compile_expression(ctx, toks) {
                return false;
            }
            nargs += 1;
            if toks.peek().tok == Tok::Comma {
                toks.next();
            } else {
                break;
            }
        }
    }
    if toks.next().tok != Tok::RParen {
        ctx.err.error(pos, format!("Missing closing parenthesis of the {name}() call"));
        return false;
    }

    // unescaping a single escaped variable only flips its escaping status
    if !is_udf
        && name == "unescape"
        && nargs == 1
        && !ctx.params.is_print_escape_enabled()
        && let Some(instr) = ctx.program.back_mut()
        && let InstrKind::Var { escape, .. } = &mut instr.kind
        && *escape
    {
        *escape = false;
        ctx.optimize_expr(1, false);
        return true;
    }

    ctx.emit(InstrKind::Func { name, nargs, is_udf }, pos);
    ctx.optimize_expr(nargs, false);
    true
}

/// Compiles a `case(expr, lit[, lit]: branch, …, *: default)` expression.
/// The `case` keyword is consumed; the parenthesis is next.
fn case_expr(ctx: &mut Compiler<'_>, toks: &mut Toks<'_>, pos: Pos) -> bool {
    if toks.next().tok != Tok::LParen {
        ctx.err.error(pos, "Expected the case condition in parentheses");
        return false;
    }
    ctx.case_options.push(Vec::new());
    let ok = case_body(ctx, toks, pos);
    ctx.case_options.pop();
    ok
}

fn case_body(ctx: &mut Compiler<'_>, toks: &mut Toks<'_>, pos: Pos) -> bool {
    if !compile_expression(ctx, toks) {
        return false;
    }
    ctx.emit(InstrKind::PrgStackPush, pos.clone());
    if toks.next().tok != Tok::Comma {
        ctx.err.error(pos, "Expected the ',' after the case condition");
        return false;
    }

    let mut end_jumps: Vec<usize> = Vec::new();
    let mut branches = 0usize;
    let mut seen_default = false;

    loop {
        if toks.peek().tok == Tok::Mul {
            // the default branch
            let star = toks.next();
            if toks.next().tok != Tok::Colon {
                ctx.err.error(star.pos, "Expected the ':' after the '*' case label");
                return false;
            }
            if !compile_expression(ctx, toks) {
                return false;
            }
            branches += 1;
            seen_default = true;
            break;
        }

        // comparison chain of this branch's labels
        let mut or_addrs: Vec<usize> = Vec::new();
        let mut first = true;
        loop {
            let Some((literal, lit_pos)) = parse_case_literal(ctx, toks) else {
                return false;
            };
            warn_duplicit_option(ctx, &literal, &lit_pos);
            if !first {
                let addr = ctx.program.len();
                or_addrs.push(addr);
                ctx.emit(InstrKind::Or { offset: 0 }, lit_pos.clone());
            }
            first = false;
            ctx.emit(InstrKind::PrgStackAt { index: 0 }, lit_pos.clone());
            ctx.case_options
                .last_mut()
                .expect("case options frame is open")
                .push((literal.clone(), lit_pos.clone()));
            ctx.emit(InstrKind::Val { value: literal }, lit_pos.clone());
            ctx.emit(InstrKind::Eq, lit_pos);
            match toks.peek().tok {
                Tok::Comma => {
                    toks.next();
                }
                Tok::Colon => {
                    toks.next();
                    break;
                }
                _ => {
                    let bad_pos = toks.peek().pos.clone();
                    ctx.err.error(bad_pos, "Expected the ':' after the case label");
                    return false;
                }
            }
        }

        // alternatives short-circuit into the branch
        for addr in or_addrs {
            let target = ctx.program.len() as i64;
            if let InstrKind::Or { offset } = &mut ctx.program[addr].kind {
                *offset = target - addr as i64 - 1;
            }
        }

        let cond_addr = ctx.program.len();
        ctx.emit(InstrKind::JmpIfNot { offset: 0 }, pos.clone());
        if !compile_expression(ctx, toks) {
            return false;
        }
        branches += 1;

        // jump over the remaining branches
        let jmp_addr = ctx.program.len();
        end_jumps.push(jmp_addr);
        ctx.emit(InstrKind::Jmp { offset: 0 }, pos.clone());
        let target = ctx.program.len() as i64;
        if let InstrKind::JmpIfNot { offset } = &mut ctx.program[cond_addr].kind {
            *offset = target - cond_addr as i64 - 1;
        }

        match toks.peek().tok {
            Tok::Comma => {
                toks.next();
            }
            _ => break,
        }
    }

    if !seen_default {
        // a value is still expected when nothing matches
        ctx.emit(InstrKind::Val { value: Value::Undefined }, pos.clone());
        ctx.note_optimization_point(true);
        branches += 1;
    }

    if toks.next().tok != Tok::RParen {
        ctx.err.error(pos, "Missing closing parenthesis of the case expression");
        return false;
    }

    for addr in end_jumps {
        let target = ctx.program.len() as i64;
        if let InstrKind::Jmp { offset } = &mut ctx.program[addr].kind {
            *offset = target - addr as i64 - 1;
        }
    }
    ctx.emit(InstrKind::PrgStackPop, pos);
    ctx.optimize_expr(branches + 1, true);
    true
}

/// Parses one case label literal (integer, real or string, optionally
/// negated).
fn parse_case_literal(ctx: &mut Compiler<'_>, toks: &mut Toks<'_>) -> Option<(Value<'static>, Pos)> {
    let pos = toks.peek().pos.clone();
    let negated = if toks.peek().tok == Tok::Minus {
        toks.next();
        true
    } else {
        false
    };
    let value = match toks.next().tok {
        Tok::Int(v) => Value::Int(if negated { -v } else { v }),
        Tok::Real(v) => Value::Real(if negated { -v } else { v }),
        Tok::Str(s) if !negated => Value::Str(s),
        _ => {
            ctx.err.error(pos, "Invalid case label; only integer, real and string literals are allowed");
            return None;
        }
    };
    Some((value, pos))
}

/// Warns about a repeated case label; only the first occurrence can ever
/// match.
fn warn_duplicit_option(ctx: &mut Compiler<'_>, literal: &Value<'static>, pos: &Pos) {
    let Some(options) = ctx.case_options.last() else { return };
    if let Some((_, first_pos)) = options.iter().find(|(seen, _)| seen == literal) {
        let val = literal.printable().into_owned();
        let first_pos = first_pos.clone();
        ctx.err.warning(first_pos, format!("Duplicit case operand: {val}"));
        ctx.err.warning(pos.clone(), "Next seen here");
    }
}

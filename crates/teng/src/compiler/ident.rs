//! Template identifiers and variable instruction generation.
//!
//! An identifier is a sequence of name segments, relative or absolute
//! (leading dot). `_this`/`_parent` prefixes normalize to absolute paths
//! against the open-frame prefix. Resolution against the open frames
//! yields a static address; identifiers that do not resolve lower to a
//! runtime attribute walk.

use crate::{
    compiler::Compiler,
    instruction::{FragAddress, FragBuiltin, InstrKind},
    position::Pos,
};

/// Classification of one identifier segment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum SegKind {
    Name,
    First,
    Last,
    Inner,
    Index,
    Count,
    This,
    Parent,
    Error,
}

impl SegKind {
    pub fn classify(name: &str) -> Self {
        match name {
            "_first" => Self::First,
            "_last" => Self::Last,
            "_inner" => Self::Inner,
            "_index" => Self::Index,
            "_count" => Self::Count,
            "_this" => Self::This,
            "_parent" => Self::Parent,
            "_error" => Self::Error,
            _ => Self::Name,
        }
    }

    pub fn frag_builtin(self) -> Option<FragBuiltin> {
        match self {
            Self::First => Some(FragBuiltin::First),
            Self::Last => Some(FragBuiltin::Last),
            Self::Inner => Some(FragBuiltin::Inner),
            Self::Index => Some(FragBuiltin::Index),
            Self::Count => Some(FragBuiltin::Count),
            _ => None,
        }
    }
}

/// One segment of an identifier.
#[derive(Debug, Clone)]
pub(crate) struct Segment {
    pub name: String,
    pub kind: SegKind,
    pub pos: Pos,
}

/// A parsed identifier path.
#[derive(Debug, Clone)]
pub(crate) struct Identifier {
    pub relative: bool,
    pub segments: Vec<Segment>,
}

impl Identifier {
    pub fn name(&self) -> &Segment {
        self.segments.last().expect("identifiers have at least one segment")
    }

    /// The dotted source form, for diagnostics.
    pub fn path(&self) -> String {
        let mut path = String::new();
        if !self.relative {
            path.push('.');
        }
        for (i, seg) in self.segments.iter().enumerate() {
            if i > 0 {
                path.push('.');
            }
            path.push_str(&seg.name);
        }
        path
    }

    pub fn pos(&self) -> Pos {
        self.segments.first().map(|seg| seg.pos.clone()).unwrap_or_default()
    }
}

/// Normalizes a `_this`./`_parent`. prefix into an absolute identifier
/// against the current open-frame path. `_parent` past the root warns and
/// clamps to `_this`. A lone `_this`/`_parent` stays a builtin; only
/// prefixes of longer paths dissolve.
pub(crate) fn normalize_prefixed(ctx: &mut Compiler<'_>, ident: Identifier) -> Identifier {
    if ident.segments.len() < 2 {
        return ident;
    }
    let Some(first) = ident.segments.first() else { return ident };
    match first.kind {
        SegKind::This => {
            let mut segments: Vec<Segment> = ctx
                .open_frames
                .current_path_names()
                .into_iter()
                .map(|name| Segment { name, kind: SegKind::Name, pos: first.pos.clone() })
                .collect();
            segments.extend(ident.segments.into_iter().skip(1));
            Identifier { relative: false, segments }
        }
        SegKind::Parent => {
            let mut names = ctx.open_frames.current_path_names();
            if names.pop().is_none() {
                ctx.err.warning(first.pos.clone(), "The _parent violates the root boundary");
            }
            let mut segments: Vec<Segment> = names
                .into_iter()
                .map(|name| Segment { name, kind: SegKind::Name, pos: first.pos.clone() })
                .collect();
            segments.extend(ident.segments.into_iter().skip(1));
            Identifier { relative: false, segments }
        }
        _ => ident,
    }
}

/// Resolves the identifier against the open frames. Local and absolute
/// resolution happen directly; relative identifiers fall back to a back
/// scan over the frames.
fn resolve(ctx: &Compiler<'_>, ident: &Identifier) -> Option<FragAddress> {
    if ident.relative {
        ctx.open_frames.resolve_relative(ident)
    } else {
        ctx.open_frames.resolve_absolute(ident)
    }
}

/// Emits a variable read. Statically resolvable identifiers produce a
/// `VAR` (or a fragment-builtin push); everything else lowers to a runtime
/// attribute walk terminated by `REPR` when `gen_repr` is set.
pub(crate) fn generate_var(ctx: &mut Compiler<'_>, ident: Identifier, gen_repr: bool) {
    let ident = normalize_prefixed(ctx, ident);
    match resolve(ctx, &ident) {
        Some(addr) => generate_var_impl(ctx, &ident, addr),
        None => generate_rtvar(ctx, &ident, gen_repr),
    }
    // variable reads always need the runtime context
    ctx.note_optimization_point(false);
}

/// Emits the statically addressed instruction for a resolved identifier.
fn generate_var_impl(ctx: &mut Compiler<'_>, ident: &Identifier, addr: FragAddress) {
    let seg = ident.name().clone();
    match seg.kind {
        SegKind::Name => {
            warn_reserved_prefix(ctx, &seg);
            ctx.emit(InstrKind::Var { name: seg.name, addr, escape: true }, seg.pos);
        }
        SegKind::This => {
            ctx.emit(InstrKind::PushFrag { name: seg.name, addr }, seg.pos);
        }
        SegKind::Parent => {
            let frame_size = ctx.open_frames.top().size();
            if usize::from(addr.frag_offset) >= frame_size {
                ctx.err.warning(
                    seg.pos.clone(),
                    "The builtin _parent variable has crossed root boundary; converting it to _this",
                );
                ctx.emit(InstrKind::PushFrag { name: seg.name, addr }, seg.pos);
            } else {
                let addr = FragAddress { frame_offset: addr.frame_offset, frag_offset: addr.frag_offset + 1 };
                ctx.emit(InstrKind::PushFrag { name: seg.name, addr }, seg.pos);
            }
        }
        SegKind::Error => {
            if ctx.params.is_error_fragment_enabled() {
                ctx.emit(InstrKind::PushErrorFrag { discard: false }, seg.pos);
            } else {
                ctx.emit(InstrKind::Var { name: seg.name, addr, escape: true }, seg.pos);
            }
        }
        other => {
            let which = other.frag_builtin().expect("remaining segment kinds are iteration builtins");
            ctx.emit(InstrKind::PushFragBuiltin { which, name: ident.path(), addr }, seg.pos);
        }
    }
}

/// Emits a `SET` for the identifier, or reports why it cannot be set.
pub(crate) fn generate_set(ctx: &mut Compiler<'_>, ident: Identifier) {
    let ident = normalize_prefixed(ctx, ident);
    let seg = ident.name().clone();
    if seg.kind != SegKind::Name {
        ctx.err.error(seg.pos.clone(), format!("Builtin variable '{}' can't be set", seg.name));
        let erase_from = ctx.expr_start_point.addr;
        ctx.program.erase_from(erase_from);
        return;
    }
    warn_reserved_prefix(ctx, &seg);
    match resolve(ctx, &ident) {
        Some(addr) => {
            ctx.emit(InstrKind::Set { name: seg.name, addr }, seg.pos);
        }
        None => {
            ctx.err.error(
                seg.pos.clone(),
                format!("Variable '{}' does not match any open fragment; nothing set", ident.path()),
            );
            let erase_from = ctx.expr_start_point.addr;
            ctx.program.erase_from(erase_from);
        }
    };
}

fn warn_reserved_prefix(ctx: &mut Compiler<'_>, seg: &Segment) {
    let bytes = seg.name.as_bytes();
    if bytes.first() == Some(&b'_') && bytes.get(1).is_some_and(|b| *b != b'_') {
        ctx.err.warning(
            seg.pos.clone(),
            format!(
                "The variable names starting with an underscore are reserved, and might cause undefined \
                 behaviour in future: var={}",
                seg.name
            ),
        );
    }
}

/// Emits the runtime attribute walk for an unresolved identifier: the
/// starting fragment, one attribute push per segment and, for value
/// reads, the final `REPR`.
pub(crate) fn generate_rtvar(ctx: &mut Compiler<'_>, ident: &Identifier, gen_repr: bool) {
    let pos = ident.pos();

    // absolute identifiers drop the prefix shared with the open fragments
    let skip = if ident.relative {
        ctx.emit(InstrKind::PushThisFrag, pos);
        0
    } else {
        let open_names = ctx.open_frames.current_path_names();
        let mut common = 0usize;
        while common < open_names.len()
            && common + 1 < ident.segments.len()
            && open_names[common] == ident.segments[common].name
        {
            common += 1;
        }
        if common == 0 && ctx.open_frames.top().is_empty() {
            ctx.emit(InstrKind::PushRootFrag, pos);
        } else {
            ctx.emit(InstrKind::PushThisFrag, pos);
        }
        common
    };

    generate_rtvar_path(ctx, &ident.segments[skip..], ident.relative, gen_repr);
}

/// Emits the attribute chain for the given segments; the subject fragment
/// is already on the stack.
pub(crate) fn generate_rtvar_path(ctx: &mut Compiler<'_>, segments: &[Segment], relative: bool, gen_repr: bool) {
    let mut path = String::from(if relative { "" } else { "." });
    for (i, seg) in segments.iter().enumerate() {
        let last = i + 1 == segments.len();
        match seg.kind {
            SegKind::This => {}
            SegKind::Parent => {
                if segments.len() == 1 {
                    ctx.err.warning(
                        seg.pos.clone(),
                        "The builtin _parent variable has crossed root boundary; converting it to _this",
                    );
                } else if matches!(
                    ctx.program.back().map(|instr| &instr.kind),
                    Some(InstrKind::PushAttr { .. })
                ) {
                    let len = ctx.program.len();
                    ctx.program.erase_from(len - 1);
                } else {
                    ctx.emit(InstrKind::PopAttr { path: path.clone() }, seg.pos.clone());
                }
            }
            SegKind::Error => {
                if ctx.params.is_error_fragment_enabled() {
                    ctx.emit(InstrKind::PushErrorFrag { discard: true }, seg.pos.clone());
                } else {
                    ctx.emit(
                        InstrKind::PushAttr { name: seg.name.clone(), path: path.clone() },
                        seg.pos.clone(),
                    );
                }
            }
            SegKind::Name => {
                ctx.emit(InstrKind::PushAttr { name: seg.name.clone(), path: path.clone() }, seg.pos.clone());
                if gen_repr && last {
                    ctx.emit(InstrKind::Repr { escape: true }, seg.pos.clone());
                }
            }
            other => {
                let which = other.frag_builtin().expect("remaining segment kinds are iteration builtins");
                ctx.emit(InstrKind::PushValBuiltin { which, path: path.clone() }, seg.pos.clone());
            }
        }
        if !path.is_empty() && !path.ends_with('.') {
            path.push('.');
        }
        path.push_str(&seg.name);
    }
}

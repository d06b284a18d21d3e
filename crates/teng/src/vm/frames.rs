//! Runtime fragment frames: the iteration state behind open fragment
//! blocks and the address space of statically resolved variables.
//!
//! Every frame's base is the data root; open fragments stack on top of it.
//! A `FragAddress` addresses an open fragment by its distance from the top
//! frame and from the top of that frame's fragment stack; the frame base
//! sits one past the deepest open fragment.

use ahash::AHashMap;

use crate::{
    fragment::{Fragment, FragmentList, FragmentValue},
    instruction::FragAddress,
    value::{ListRef, Value},
};

/// What an open fragment block iterates over.
#[derive(Debug)]
enum IterKind<'p> {
    /// A fragment list; one pass per element.
    List(&'p FragmentList),
    /// A single nested fragment; exactly one pass.
    Single(&'p Fragment),
}

/// One open fragment block.
#[derive(Debug)]
struct OpenFrag<'p> {
    name: String,
    kind: IterKind<'p>,
    index: usize,
    /// Variables created by `<?teng set?>` inside this block; reset on
    /// every iteration.
    locals: AHashMap<String, Value<'static>>,
}

impl<'p> OpenFrag<'p> {
    fn size(&self) -> usize {
        match self.kind {
            IterKind::List(list) => list.len(),
            IterKind::Single(_) => 1,
        }
    }

    fn current(&self) -> Option<&'p Fragment> {
        match self.kind {
            IterKind::List(list) => list.get(self.index),
            IterKind::Single(frag) => (self.index == 0).then_some(frag),
        }
    }
}

/// One frame: the data root plus a stack of open fragments.
#[derive(Debug)]
struct Frame<'p> {
    frags: Vec<OpenFrag<'p>>,
    /// `<?teng set?>` variables at frame level (no fragment open).
    base_locals: AHashMap<String, Value<'static>>,
}

/// The stack of frames the interpreter runs against.
#[derive(Debug)]
pub(crate) struct Frames<'p> {
    root: &'p Fragment,
    frames: Vec<Frame<'p>>,
}

/// Position of an open fragment inside its list.
#[derive(Debug, Clone, Copy)]
pub(crate) struct ListPos {
    pub i: usize,
    pub size: usize,
}

impl<'p> Frames<'p> {
    pub fn new(root: &'p Fragment) -> Self {
        Self { root, frames: vec![Frame { frags: Vec::new(), base_locals: AHashMap::new() }] }
    }

    pub fn root(&self) -> &'p Fragment {
        self.root
    }

    pub fn open_frame(&mut self) {
        self.frames.push(Frame { frags: Vec::new(), base_locals: AHashMap::new() });
    }

    pub fn close_frame(&mut self) {
        if self.frames.len() > 1 {
            self.frames.pop();
        }
    }

    fn top(&self) -> &Frame<'p> {
        self.frames.last().expect("at least one frame is always open")
    }

    fn top_mut(&mut self) -> &mut Frame<'p> {
        self.frames.last_mut().expect("at least one frame is always open")
    }

    /// The fragment enclosing the currently executing code.
    pub fn current_frag(&self) -> &'p Fragment {
        self.top().frags.last().and_then(OpenFrag::current).unwrap_or(self.root)
    }

    /// Opens the named fragment in the current one. Returns false when
    /// there is nothing to iterate (missing name, empty list, scalar) —
    /// in that case no record is left open.
    pub fn open_frag(&mut self, name: &str) -> bool {
        let parent = self.current_frag();
        let kind = match parent.get(name) {
            Some(FragmentValue::List(list)) if !list.is_empty() => IterKind::List(list),
            Some(FragmentValue::Fragment(frag)) => IterKind::Single(frag),
            _ => return false,
        };
        self.top_mut().frags.push(OpenFrag { name: name.to_owned(), kind, index: 0, locals: AHashMap::new() });
        true
    }

    /// Opens a block iterating the given list directly (the `_error`
    /// fragment). Returns false for an empty list.
    pub fn open_list_frag(&mut self, name: &str, list: &'p FragmentList) -> bool {
        if list.is_empty() {
            return false;
        }
        self.top_mut().frags.push(OpenFrag {
            name: name.to_owned(),
            kind: IterKind::List(list),
            index: 0,
            locals: AHashMap::new(),
        });
        true
    }

    /// Advances the innermost open fragment. Returns true while another
    /// iteration follows; pops the record when exhausted.
    pub fn next_frag(&mut self) -> bool {
        let Some(frag) = self.top_mut().frags.last_mut() else { return false };
        frag.index += 1;
        if frag.index < frag.size() {
            frag.locals.clear();
            true
        } else {
            self.top_mut().frags.pop();
            false
        }
    }

    /// The current dotted path of open fragments, for diagnostics.
    pub fn current_path(&self) -> String {
        let mut path = String::from(".");
        for (i, frag) in self.top().frags.iter().enumerate() {
            if i > 0 {
                path.push('.');
            }
            path.push_str(&frag.name);
        }
        path
    }

    pub fn current_list_i(&self) -> usize {
        self.top().frags.last().map_or(0, |f| f.index)
    }

    pub fn current_list_size(&self) -> usize {
        self.top().frags.last().map_or(0, OpenFrag::size)
    }

    fn frame_at(&self, frame_offset: u16) -> Option<&Frame<'p>> {
        self.frames.len().checked_sub(1 + usize::from(frame_offset)).map(|i| &self.frames[i])
    }

    fn frame_at_mut(&mut self, frame_offset: u16) -> Option<&mut Frame<'p>> {
        self.frames.len().checked_sub(1 + usize::from(frame_offset)).map(move |i| &mut self.frames[i])
    }

    /// The fragment at a static address; the frame base resolves to the
    /// data root.
    pub fn frag_at(&self, addr: FragAddress) -> Option<&'p Fragment> {
        let frame = self.frame_at(addr.frame_offset)?;
        let depth = usize::from(addr.frag_offset);
        if depth == frame.frags.len() {
            return Some(self.root);
        }
        let idx = frame.frags.len().checked_sub(1 + depth)?;
        frame.frags[idx].current()
    }

    /// The iteration position of the open fragment at a static address.
    /// The frame base is not a list, so it has no position.
    pub fn list_pos(&self, addr: FragAddress) -> Option<ListPos> {
        let frame = self.frame_at(addr.frame_offset)?;
        let idx = frame.frags.len().checked_sub(1 + usize::from(addr.frag_offset))?;
        let frag = &frame.frags[idx];
        Some(ListPos { i: frag.index, size: frag.size() })
    }

    /// Reads a variable at a static address: application data first, then
    /// `set` locals.
    pub fn get_var(&self, addr: FragAddress, name: &str) -> Value<'p> {
        let Some(frame) = self.frame_at(addr.frame_offset) else { return Value::Undefined };
        let depth = usize::from(addr.frag_offset);
        if depth == frame.frags.len() {
            if let Some(value) = self.root.get(name) {
                return frag_value_to_value(value);
            }
            return frame.base_locals.get(name).cloned().unwrap_or(Value::Undefined);
        }
        let Some(idx) = frame.frags.len().checked_sub(1 + depth) else { return Value::Undefined };
        let record = &frame.frags[idx];
        if let Some(frag) = record.current()
            && let Some(value) = frag.get(name)
        {
            return frag_value_to_value(value);
        }
        record.locals.get(name).cloned().unwrap_or(Value::Undefined)
    }

    /// Writes a `set` variable. Returns false when the name is already
    /// taken by application data (which cannot be rewritten).
    pub fn set_var(&mut self, addr: FragAddress, name: &str, value: Value<'static>) -> bool {
        let root = self.root;
        let Some(frame) = self.frame_at_mut(addr.frame_offset) else { return false };
        let depth = usize::from(addr.frag_offset);
        if depth == frame.frags.len() {
            if root.get(name).is_some() {
                return false;
            }
            frame.base_locals.insert(name.to_owned(), value);
            return true;
        }
        let Some(idx) = frame.frags.len().checked_sub(1 + depth) else { return false };
        let record_frag = frame.frags[idx].current();
        if record_frag.is_some_and(|f| f.get(name).is_some()) {
            return false;
        }
        frame.frags[idx].locals.insert(name.to_owned(), value);
        true
    }
}

/// Converts a data-tree value into a stack value; single fragments become
/// fragment references, lists become list references at index 0.
pub(crate) fn frag_value_to_value<'p>(value: &'p FragmentValue) -> Value<'p> {
    match value {
        FragmentValue::Int(v) => Value::Int(*v),
        FragmentValue::Real(v) => Value::Real(*v),
        FragmentValue::String(s) => Value::StrRef(s),
        FragmentValue::Fragment(frag) => Value::Frag(frag),
        FragmentValue::List(list) => Value::List(ListRef::new(list, 0)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn data() -> Fragment {
        let mut root = Fragment::new();
        root.add_string("title", "top");
        let items = root.add_fragment_list("items");
        items.add_fragment().add_string("name", "a");
        items.add_fragment().add_string("name", "b");
        root
    }

    #[test]
    fn open_and_iterate_list() {
        let root = data();
        let mut frames = Frames::new(&root);
        assert!(frames.open_frag("items"));
        assert_eq!(frames.get_var(FragAddress::default(), "name").string(), "a");
        assert!(frames.next_frag());
        assert_eq!(frames.get_var(FragAddress::default(), "name").string(), "b");
        assert!(!frames.next_frag());
        assert_eq!(frames.current_frag() as *const _, &root as *const _);
    }

    #[test]
    fn missing_frag_does_not_open() {
        let root = data();
        let mut frames = Frames::new(&root);
        assert!(!frames.open_frag("nothing"));
        assert!(!frames.open_frag("title"));
    }

    #[test]
    fn base_addressing_reaches_root() {
        let root = data();
        let mut frames = Frames::new(&root);
        frames.open_frag("items");
        // frag_offset 1 is past the single open frag: the frame base
        let addr = FragAddress { frame_offset: 0, frag_offset: 1 };
        assert_eq!(frames.get_var(addr, "title").string(), "top");
    }

    #[test]
    fn set_var_cannot_shadow_data() {
        let root = data();
        let mut frames = Frames::new(&root);
        assert!(!frames.set_var(FragAddress::default(), "title", Value::Int(1)));
        assert!(frames.set_var(FragAddress::default(), "fresh", Value::Int(2)));
        assert_eq!(frames.get_var(FragAddress::default(), "fresh").integral(), 2);
    }

    #[test]
    fn locals_reset_between_iterations() {
        let root = data();
        let mut frames = Frames::new(&root);
        frames.open_frag("items");
        assert!(frames.set_var(FragAddress::default(), "seen", Value::Int(1)));
        assert!(frames.next_frag());
        assert!(frames.get_var(FragAddress::default(), "seen").is_undefined());
    }
}

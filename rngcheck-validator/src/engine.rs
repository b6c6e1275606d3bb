//! The pattern arena and derivative engine.
//!
//! Patterns are interned into an arena of immutable nodes addressed by
//! `PatId`; structurally identical nodes share one id, which is what makes
//! memoizing the derivative operations by `(PatId, atom)` sound.  The
//! unsatisfiable pattern reduces to the single interned `NotAllowed` node, so
//! "this state is stuck" is an id comparison (`is_empty_choice`).
//!
//! Derivative (residual) operations exist per atom kind: a text run, a
//! buffered string, an attribute (with an optional wildcard value used during
//! error recovery), the end-of-attributes step, and the close-time element
//! atoms carrying the set of satisfied candidate content patterns.  The
//! element-open derivative produces `After(content, next)` pairs from which
//! the candidate content-pattern set, the combined content pattern (at a
//! given recovery level) and the unambiguous fast-path pair are all
//! projected.

use fnv::FnvHashMap;
use rngcheck_model::datatype::builtin::normalize_whitespace;
use rngcheck_model::datatype::{self, Datatype};
use rngcheck_model::model::{self, DefineRule, KeyUse, Name, NameClass};
use std::cell::RefCell;
use std::collections::HashSet;
use std::rc::Rc;

#[derive(PartialEq, Eq, Hash, Copy, Clone, Debug)]
pub struct PatId(u32);

// Large payloads (NameClass, datatype values) are boxed to keep Pat small,
// since nodes are cloned on every arena read.
#[derive(PartialEq, Eq, Hash, Clone, Debug)]
pub enum Pat {
    Choice(PatId, PatId, bool),
    Interleave(PatId, PatId, bool),
    Group(PatId, PatId, bool),
    OneOrMore(PatId, bool),
    Empty,
    Text,
    NotAllowed,
    Attribute(Box<NameClass>, PatId),
    Element(Box<NameClass>, PatId),
    Data(Box<datatype::Datatypes>, Option<KeyUse>),
    DataExcept(Box<datatype::Datatypes>, PatId, Option<KeyUse>),
    Value(Box<datatype::DatatypeValues>, Option<KeyUse>),
    List(PatId),
    Placeholder(*const Option<DefineRule>),
    After(PatId, PatId),
}

impl Pat {
    pub fn is_nullable(&self) -> bool {
        match self {
            Pat::Choice(_, _, nullable) => *nullable,
            Pat::Interleave(_, _, nullable) => *nullable,
            Pat::Group(_, _, nullable) => *nullable,
            Pat::OneOrMore(_, nullable) => *nullable,
            Pat::Empty => true,
            Pat::Text => true,
            Pat::NotAllowed => false,
            Pat::Attribute(_, _) => false,
            Pat::Element(_, _) => false,
            Pat::Data(_, _) => false,
            Pat::DataExcept(_, _, _) => false,
            Pat::Value(_, _) => false,
            Pat::List(_) => false,
            Pat::Placeholder(_) => false,
            Pat::After(_, _) => false,
        }
    }
}

/// Classification of a pattern's character-content handling.  `Data` means
/// raw character content must be buffered and matched as one string atom;
/// for the other classes whitespace-only runs are ignorable.
#[derive(PartialEq, Eq, Copy, Clone, Debug)]
pub enum ContentType {
    Empty,
    Simple,
    Data,
    Complex,
}

impl ContentType {
    fn rank(self) -> u8 {
        match self {
            ContentType::Empty => 0,
            ContentType::Simple => 1,
            ContentType::Data => 2,
            ContentType::Complex => 3,
        }
    }
    fn join(self, other: ContentType) -> ContentType {
        if self.rank() >= other.rank() {
            self
        } else {
            other
        }
    }
}

/// Memoization key: the equivalence class of one input atom
#[derive(PartialEq, Eq, Hash, Clone, Debug)]
enum AtomKey {
    Text,
    Str(String),
    Attr(Name, Option<String>),
    /// close-time element atom carrying the satisfied candidate contents
    Element(Name, Vec<PatId>),
    /// recovery atom: an element of this name with whatever content
    AnyElement(Name),
    EndAttributes(bool),
}

#[derive(Default)]
struct Inner {
    memo: FnvHashMap<Pat, PatId>,
    patterns: Vec<Pat>,
    refs: FnvHashMap<*const Option<DefineRule>, PatId>,
    residuals: FnvHashMap<(PatId, AtomKey), PatId>,
    open_derivs: FnvHashMap<(PatId, Name, u8), PatId>,
    content_types: FnvHashMap<PatId, ContentType>,
    any_content: Option<PatId>,
}

#[derive(Default)]
pub struct Engine {
    inner: RefCell<Inner>,
}

impl Engine {
    fn push(&self, p: Pat) -> PatId {
        let mut inner = self.inner.borrow_mut();
        if let Some(id) = inner.memo.get(&p) {
            *id
        } else {
            let id = PatId(inner.patterns.len() as u32);
            inner.memo.insert(p.clone(), id);
            inner.patterns.push(p);
            id
        }
    }

    pub fn patt(&self, id: PatId) -> Pat {
        self.inner.borrow().patterns[id.0 as usize].clone()
    }

    pub fn is_nullable(&self, id: PatId) -> bool {
        self.patt(id).is_nullable()
    }

    /// The stuck sentinel: does this pattern accept nothing at all?
    pub fn is_empty_choice(&self, id: PatId) -> bool {
        matches!(self.patt(id), Pat::NotAllowed)
    }

    // -- interning constructors ------------------------------------------

    pub fn choice(&self, left: PatId, right: PatId) -> PatId {
        match (self.patt(left), self.patt(right)) {
            (Pat::NotAllowed, _) => right,
            (_, Pat::NotAllowed) => left,
            _ => {
                if left == right {
                    return left;
                }
                // eliminating redundant choice-leaves keeps the choice tree
                // linear in the number of distinct alternatives, which the
                // derivative construction otherwise makes exponential
                let mut seen = HashSet::new();
                self.choice_leaves(left, &mut seen);
                let mut fresh = Vec::new();
                self.collect_new_leaves(right, &mut seen, &mut fresh);
                if fresh.is_empty() {
                    return left;
                }
                let mut iter = fresh.into_iter().rev();
                let mut acc = iter.next().unwrap();
                for leaf in iter {
                    acc = self.raw_choice(leaf, acc);
                }
                self.raw_choice(left, acc)
            }
        }
    }

    fn raw_choice(&self, left: PatId, right: PatId) -> PatId {
        let nullable = self.is_nullable(left) || self.is_nullable(right);
        self.push(Pat::Choice(left, right, nullable))
    }

    fn choice_leaves(&self, p: PatId, out: &mut HashSet<PatId>) {
        match self.patt(p) {
            Pat::Choice(l, r, _) => {
                self.choice_leaves(l, out);
                self.choice_leaves(r, out);
            }
            _ => {
                out.insert(p);
            }
        }
    }

    fn collect_new_leaves(&self, p: PatId, seen: &mut HashSet<PatId>, out: &mut Vec<PatId>) {
        match self.patt(p) {
            Pat::Choice(l, r, _) => {
                self.collect_new_leaves(l, seen, out);
                self.collect_new_leaves(r, seen, out);
            }
            _ => {
                if seen.insert(p) {
                    out.push(p);
                }
            }
        }
    }

    pub fn interleave(&self, left: PatId, right: PatId) -> PatId {
        match (self.patt(left), self.patt(right)) {
            (Pat::NotAllowed, _) | (_, Pat::NotAllowed) => self.not_allowed(),
            (Pat::Empty, _) => right,
            (_, Pat::Empty) => left,
            (l, r) => self.push(Pat::Interleave(
                left,
                right,
                l.is_nullable() && r.is_nullable(),
            )),
        }
    }

    pub fn group(&self, left: PatId, right: PatId) -> PatId {
        match (self.patt(left), self.patt(right)) {
            (Pat::NotAllowed, _) | (_, Pat::NotAllowed) => self.not_allowed(),
            (Pat::Empty, _) => right,
            (_, Pat::Empty) => left,
            (l, r) => self.push(Pat::Group(left, right, l.is_nullable() && r.is_nullable())),
        }
    }

    fn after(&self, p1: PatId, p2: PatId) -> PatId {
        match (self.patt(p1), self.patt(p2)) {
            (Pat::NotAllowed, _) | (_, Pat::NotAllowed) => self.not_allowed(),
            (_, _) => self.push(Pat::After(p1, p2)),
        }
    }

    pub fn empty(&self) -> PatId {
        self.push(Pat::Empty)
    }
    pub fn text(&self) -> PatId {
        self.push(Pat::Text)
    }
    pub fn not_allowed(&self) -> PatId {
        self.push(Pat::NotAllowed)
    }
    pub fn one_or_more(&self, pattern: PatId) -> PatId {
        let p = self.patt(pattern);
        self.push(Pat::OneOrMore(pattern, p.is_nullable()))
    }
    pub fn optional(&self, pattern: PatId) -> PatId {
        self.choice(pattern, self.empty())
    }
    pub fn mixed(&self, pattern: PatId) -> PatId {
        self.interleave(pattern, self.text())
    }
    fn attribute(&self, name: NameClass, p: PatId) -> PatId {
        self.push(Pat::Attribute(Box::new(name), p))
    }
    fn element(&self, name: NameClass, p: PatId) -> PatId {
        self.push(Pat::Element(Box::new(name), p))
    }
    fn value(&self, dt: datatype::DatatypeValues, key: Option<KeyUse>) -> PatId {
        self.push(Pat::Value(Box::new(dt), key))
    }
    fn data(&self, dt: datatype::Datatypes, except: Option<PatId>, key: Option<KeyUse>) -> PatId {
        if let Some(except) = except {
            self.push(Pat::DataExcept(Box::new(dt), except, key))
        } else {
            self.push(Pat::Data(Box::new(dt), key))
        }
    }
    fn list(&self, p: PatId) -> PatId {
        self.push(Pat::List(p))
    }

    // -- compiling the model graph into the arena ------------------------

    /// Expands the model graph into the closed arena form, resolving every
    /// reference cell; idempotent because resolved cells are remembered.
    pub fn compile_rule(&self, model: &Rc<RefCell<Option<DefineRule>>>) -> PatId {
        let rule = model.borrow();
        self.compile(
            rule.as_ref()
                .expect("definition cell must be resolved before validation")
                .pattern(),
        )
    }

    fn compile(&self, p: &model::Pattern) -> PatId {
        match p {
            model::Pattern::Choice(v) => {
                let mut iter = v.iter().rev();
                let mut right = self.compile(iter.next().expect("empty choice"));
                for left in iter {
                    right = self.choice(self.compile(left), right);
                }
                right
            }
            model::Pattern::Interleave(v) => {
                let mut iter = v.iter().rev();
                let mut right = self.compile(iter.next().expect("empty interleave"));
                for left in iter {
                    right = self.interleave(self.compile(left), right);
                }
                right
            }
            model::Pattern::Group(v) => {
                let mut iter = v.iter().rev();
                let mut right = self.compile(iter.next().expect("empty group"));
                for left in iter {
                    right = self.group(self.compile(left), right);
                }
                right
            }
            model::Pattern::Mixed(p) => self.mixed(self.compile(p)),
            model::Pattern::Empty => self.empty(),
            model::Pattern::Text => self.text(),
            model::Pattern::NotAllowed => self.not_allowed(),
            model::Pattern::Optional(p) => self.optional(self.compile(p)),
            model::Pattern::ZeroOrMore(p) => self.optional(self.one_or_more(self.compile(p))),
            model::Pattern::OneOrMore(p) => self.one_or_more(self.compile(p)),
            model::Pattern::Attribute(name, p) => self.attribute(name.clone(), self.compile(p)),
            model::Pattern::Element(name, p) => self.element(name.clone(), self.compile(p)),
            model::Pattern::Ref(whence, name, r) => {
                let ptr = r.0.as_ptr() as *const Option<DefineRule>;
                if let Some(id) = self.get_ref(ptr) {
                    id
                } else {
                    let placeholder_id = self.ref_placeholder(ptr);
                    if let Some(rule) = Rc::as_ref(&r.0).borrow().as_ref() {
                        let id = self.compile(rule.pattern());
                        self.resolve_ref(placeholder_id, id, name);
                        placeholder_id
                    } else {
                        panic!("definition for {:?} is missing, referenced at {:?}", name, whence)
                    }
                }
            }
            model::Pattern::Value { datatype, key } => self.value(datatype.clone(), key.clone()),
            model::Pattern::Data {
                datatype,
                except,
                key,
            } => self.data(
                datatype.clone(),
                except.as_ref().map(|e| self.compile(e)),
                key.clone(),
            ),
            model::Pattern::List(p) => self.list(self.compile(p)),
        }
    }

    fn get_ref(&self, p: *const Option<DefineRule>) -> Option<PatId> {
        self.inner.borrow().refs.get(&p).copied()
    }

    fn ref_placeholder(&self, p: *const Option<DefineRule>) -> PatId {
        let id = self.push(Pat::Placeholder(p));
        self.inner.borrow_mut().refs.insert(p, id);
        id
    }

    fn resolve_ref(&self, placeholder_id: PatId, id: PatId, name: &str) {
        if placeholder_id == id {
            // already resolved
            return;
        }
        let target = self.patt(id);
        if let Pat::Placeholder(_) = target {
            panic!(
                "can't resolve placeholder {} with another placeholder {} for {:?}",
                placeholder_id.0, id.0, name
            );
        }
        let mut inner = self.inner.borrow_mut();
        match &inner.patterns[placeholder_id.0 as usize] {
            Pat::Placeholder(_) => (),
            p => panic!(
                "expected placeholder but got {:?} while resolving {:?}",
                p, name
            ),
        }
        inner.patterns[placeholder_id.0 as usize] = target;
    }

    // -- memoized residuals ----------------------------------------------

    fn memoized<F: FnOnce(&Engine) -> PatId>(&self, p: PatId, key: AtomKey, f: F) -> PatId {
        if let Some(hit) = self.inner.borrow().residuals.get(&(p, key.clone())) {
            return *hit;
        }
        let v = f(self);
        self.inner.borrow_mut().residuals.insert((p, key), v);
        v
    }

    /// Residual after a run of non-whitespace character data (mixed-content
    /// text, not a datatype-checked string)
    pub fn text_residual(&self, p: PatId) -> PatId {
        self.memoized(p, AtomKey::Text, |e| match e.patt(p) {
            Pat::Choice(p1, p2, _) => {
                let a = e.text_residual(p1);
                let b = e.text_residual(p2);
                e.choice(a, b)
            }
            Pat::Interleave(p1, p2, _) => {
                let d1 = e.text_residual(p1);
                let a = e.interleave(d1, p2);
                let d2 = e.text_residual(p2);
                let b = e.interleave(p1, d2);
                e.choice(a, b)
            }
            Pat::Group(p1, p2, _) => {
                let nullable = e.is_nullable(p1);
                let d1 = e.text_residual(p1);
                let g = e.group(d1, p2);
                if nullable {
                    let d2 = e.text_residual(p2);
                    e.choice(g, d2)
                } else {
                    g
                }
            }
            Pat::OneOrMore(inner, _) => {
                let d = e.text_residual(inner);
                e.group(d, e.optional(e.one_or_more(inner)))
            }
            Pat::After(p1, p2) => {
                let d = e.text_residual(p1);
                e.after(d, p2)
            }
            Pat::Text => e.text(),
            _ => e.not_allowed(),
        })
    }

    /// Residual after a complete character-data string, datatype-checked
    pub fn string_residual(&self, p: PatId, s: &str) -> PatId {
        self.memoized(p, AtomKey::Str(s.to_string()), |e| match e.patt(p) {
            Pat::Choice(p1, p2, _) => {
                let a = e.string_residual(p1, s);
                let b = e.string_residual(p2, s);
                e.choice(a, b)
            }
            Pat::Interleave(p1, p2, _) => {
                let d1 = e.string_residual(p1, s);
                let a = e.interleave(d1, p2);
                let d2 = e.string_residual(p2, s);
                let b = e.interleave(p1, d2);
                e.choice(a, b)
            }
            Pat::Group(p1, p2, _) => {
                let nullable = e.is_nullable(p1);
                let d1 = e.string_residual(p1, s);
                let g = e.group(d1, p2);
                if nullable {
                    let d2 = e.string_residual(p2, s);
                    e.choice(g, d2)
                } else {
                    g
                }
            }
            Pat::OneOrMore(inner, _) => {
                let d = e.string_residual(inner, s);
                e.group(d, e.optional(e.one_or_more(inner)))
            }
            Pat::After(p1, p2) => {
                let d = e.string_residual(p1, s);
                e.after(d, p2)
            }
            Pat::Text => e.text(),
            Pat::Data(dt, _) => {
                if dt.is_valid(s) {
                    e.empty()
                } else {
                    e.not_allowed()
                }
            }
            Pat::DataExcept(dt, except, _) => {
                let d = e.string_residual(except, s);
                if dt.is_valid(s) && !e.is_nullable(d) {
                    e.empty()
                } else {
                    e.not_allowed()
                }
            }
            Pat::Value(v, _) => {
                if v.is_valid(s) {
                    e.empty()
                } else {
                    e.not_allowed()
                }
            }
            Pat::List(inner) => {
                let mut state = inner;
                for item in s.split_whitespace() {
                    state = e.string_residual(state, item);
                    if e.is_empty_choice(state) {
                        return state;
                    }
                }
                if e.is_nullable(state) {
                    e.empty()
                } else {
                    e.not_allowed()
                }
            }
            Pat::Empty => {
                if is_whitespace_str(s) {
                    e.empty()
                } else {
                    e.not_allowed()
                }
            }
            _ => e.not_allowed(),
        })
    }

    /// Residual after consuming one attribute.  `value` of `None` is the
    /// recovery wildcard: match the attribute name but accept any value,
    /// which lets the caller tell "bad value" apart from "attribute not
    /// permitted here at all".
    pub fn attribute_residual(&self, p: PatId, name: &Name, value: Option<&str>) -> PatId {
        let key = AtomKey::Attr(name.clone(), value.map(|v| v.to_string()));
        self.memoized(p, key, |e| match e.patt(p) {
            Pat::After(p1, p2) => {
                let d = e.attribute_residual(p1, name, value);
                e.after(d, p2)
            }
            Pat::Choice(p1, p2, _) => {
                let a = e.attribute_residual(p1, name, value);
                let b = e.attribute_residual(p2, name, value);
                e.choice(a, b)
            }
            // attributes are not ordered with respect to the group
            Pat::Group(p1, p2, _) => {
                let d1 = e.attribute_residual(p1, name, value);
                let a = e.group(d1, p2);
                let d2 = e.attribute_residual(p2, name, value);
                let b = e.group(p1, d2);
                e.choice(a, b)
            }
            Pat::Interleave(p1, p2, _) => {
                let d1 = e.attribute_residual(p1, name, value);
                let a = e.interleave(d1, p2);
                let d2 = e.attribute_residual(p2, name, value);
                let b = e.interleave(p1, d2);
                e.choice(a, b)
            }
            Pat::OneOrMore(inner, _) => {
                let d = e.attribute_residual(inner, name, value);
                e.group(d, e.optional(p))
            }
            Pat::Attribute(nc, vp) => {
                let matched = nc.matches(name)
                    && match value {
                        Some(v) => e.value_match(vp, v),
                        None => true,
                    };
                if matched {
                    e.empty()
                } else {
                    e.not_allowed()
                }
            }
            _ => e.not_allowed(),
        })
    }

    fn value_match(&self, p: PatId, value: &str) -> bool {
        (self.is_nullable(p) && is_whitespace_str(value))
            || self.is_nullable(self.string_residual(p, value))
    }

    /// The end-of-attributes derivative: removes attribute patterns.  With
    /// `recover` set, unsatisfied required attributes are force-advanced past
    /// (they become Empty) so content validation can continue.
    pub fn end_attributes(&self, p: PatId, recover: bool) -> PatId {
        self.memoized(p, AtomKey::EndAttributes(recover), |e| match e.patt(p) {
            Pat::After(p1, p2) => {
                let d = e.end_attributes(p1, recover);
                e.after(d, p2)
            }
            Pat::Choice(p1, p2, _) => {
                let a = e.end_attributes(p1, recover);
                let b = e.end_attributes(p2, recover);
                e.choice(a, b)
            }
            Pat::Group(p1, p2, _) => {
                let a = e.end_attributes(p1, recover);
                let b = e.end_attributes(p2, recover);
                e.group(a, b)
            }
            Pat::Interleave(p1, p2, _) => {
                let a = e.end_attributes(p1, recover);
                let b = e.end_attributes(p2, recover);
                e.interleave(a, b)
            }
            Pat::OneOrMore(inner, _) => {
                let d = e.end_attributes(inner, recover);
                e.one_or_more(d)
            }
            Pat::Attribute(_, _) => {
                if recover {
                    e.empty()
                } else {
                    e.not_allowed()
                }
            }
            _ => p,
        })
    }

    /// Residual of a parent state after a child element closes, where
    /// `satisfied` lists the candidate content patterns whose derivative was
    /// nullable at close time
    pub fn element_residual(&self, p: PatId, name: &Name, satisfied: &[PatId]) -> PatId {
        let mut sorted = satisfied.to_vec();
        sorted.sort_by_key(|id| id.0);
        sorted.dedup();
        self.element_residual_impl(p, name, &sorted)
    }

    fn element_residual_impl(&self, p: PatId, name: &Name, satisfied: &[PatId]) -> PatId {
        let key = AtomKey::Element(name.clone(), satisfied.to_vec());
        self.memoized(p, key, |e| match e.patt(p) {
            Pat::After(p1, p2) => {
                let d = e.element_residual_impl(p1, name, satisfied);
                e.after(d, p2)
            }
            Pat::Choice(p1, p2, _) => {
                let a = e.element_residual_impl(p1, name, satisfied);
                let b = e.element_residual_impl(p2, name, satisfied);
                e.choice(a, b)
            }
            Pat::Group(p1, p2, _) => {
                let nullable = e.is_nullable(p1);
                let d1 = e.element_residual_impl(p1, name, satisfied);
                let g = e.group(d1, p2);
                if nullable {
                    let d2 = e.element_residual_impl(p2, name, satisfied);
                    e.choice(g, d2)
                } else {
                    g
                }
            }
            Pat::Interleave(p1, p2, _) => {
                let d1 = e.element_residual_impl(p1, name, satisfied);
                let a = e.interleave(d1, p2);
                let d2 = e.element_residual_impl(p2, name, satisfied);
                let b = e.interleave(p1, d2);
                e.choice(a, b)
            }
            Pat::OneOrMore(inner, _) => {
                let d = e.element_residual_impl(inner, name, satisfied);
                e.group(d, e.optional(e.one_or_more(inner)))
            }
            Pat::Element(nc, content) => {
                if nc.matches(name) && satisfied.contains(&content) {
                    e.empty()
                } else {
                    e.not_allowed()
                }
            }
            _ => e.not_allowed(),
        })
    }

    /// Last-resort close-time residual: an element of this name is assumed to
    /// have matched whatever content its pattern wanted
    pub fn any_element_residual(&self, p: PatId, name: &Name) -> PatId {
        self.memoized(p, AtomKey::AnyElement(name.clone()), |e| match e.patt(p) {
            Pat::After(p1, p2) => {
                let d = e.any_element_residual(p1, name);
                e.after(d, p2)
            }
            Pat::Choice(p1, p2, _) => {
                let a = e.any_element_residual(p1, name);
                let b = e.any_element_residual(p2, name);
                e.choice(a, b)
            }
            Pat::Group(p1, p2, _) => {
                let nullable = e.is_nullable(p1);
                let d1 = e.any_element_residual(p1, name);
                let g = e.group(d1, p2);
                if nullable {
                    let d2 = e.any_element_residual(p2, name);
                    e.choice(g, d2)
                } else {
                    g
                }
            }
            Pat::Interleave(p1, p2, _) => {
                let d1 = e.any_element_residual(p1, name);
                let a = e.interleave(d1, p2);
                let d2 = e.any_element_residual(p2, name);
                let b = e.interleave(p1, d2);
                e.choice(a, b)
            }
            Pat::OneOrMore(inner, _) => {
                let d = e.any_element_residual(inner, name);
                e.group(d, e.optional(e.one_or_more(inner)))
            }
            Pat::Element(nc, _) => {
                if nc.matches(name) {
                    e.empty()
                } else {
                    e.not_allowed()
                }
            }
            _ => e.not_allowed(),
        })
    }

    // -- element-open derivative and its projections ---------------------

    /// The element-open derivative: a choice of After(content, next) pairs,
    /// one per element pattern that can begin here.  At recovery level 1 the
    /// name-class test is waived.
    fn open_deriv(&self, p: PatId, name: &Name, level: u8) -> PatId {
        if let Some(hit) = self
            .inner
            .borrow()
            .open_derivs
            .get(&(p, name.clone(), level))
        {
            return *hit;
        }
        let v = match self.patt(p) {
            Pat::Choice(p1, p2, _) => {
                let a = self.open_deriv(p1, name, level);
                let b = self.open_deriv(p2, name, level);
                self.choice(a, b)
            }
            Pat::OneOrMore(inner, _) => {
                let d = self.open_deriv(inner, name, level);
                let d = self.patt(d);
                self.apply_after(d, &|pat, e| e.group(pat, e.optional(e.one_or_more(inner))))
            }
            Pat::Interleave(p1, p2, _) => {
                let d1 = self.open_deriv(p1, name, level);
                let c1 = self.apply_after(self.patt(d1), &|pat, e| e.interleave(pat, p2));
                let d2 = self.open_deriv(p2, name, level);
                let c2 = self.apply_after(self.patt(d2), &|pat, e| e.interleave(p1, pat));
                self.choice(c1, c2)
            }
            Pat::Group(p1, p2, _) => {
                let nullable = self.is_nullable(p1);
                let d1 = self.open_deriv(p1, name, level);
                let x = self.apply_after(self.patt(d1), &|pat, e| e.group(pat, p2));
                if nullable {
                    let d2 = self.open_deriv(p2, name, level);
                    self.choice(x, d2)
                } else {
                    x
                }
            }
            Pat::Element(nc, content) => {
                if nc.matches(name) || level >= 1 {
                    self.after(content, self.empty())
                } else {
                    self.not_allowed()
                }
            }
            Pat::After(p1, p2) => {
                let d = self.open_deriv(p1, name, level);
                self.apply_after(self.patt(d), &|pat, e| e.after(pat, p2))
            }
            _ => self.not_allowed(),
        };
        self.inner
            .borrow_mut()
            .open_derivs
            .insert((p, name.clone(), level), v);
        v
    }

    fn apply_after(&self, pat: Pat, f: &dyn Fn(PatId, &Engine) -> PatId) -> PatId {
        match pat {
            Pat::After(p1, p2) => {
                let p2 = f(p2, self);
                self.after(p1, p2)
            }
            Pat::Choice(p1, p2, _) => {
                let c1 = self.apply_after(self.patt(p1), f);
                let c2 = self.apply_after(self.patt(p2), f);
                self.choice(c1, c2)
            }
            Pat::NotAllowed => self.not_allowed(),
            other => panic!(
                "only Choice, After or NotAllowed may be passed to apply_after: {:?}",
                other
            ),
        }
    }

    fn after_pairs(&self, p: PatId, out: &mut Vec<(PatId, PatId)>) {
        match self.patt(p) {
            Pat::Choice(p1, p2, _) => {
                self.after_pairs(p1, out);
                self.after_pairs(p2, out);
            }
            Pat::After(content, next) => out.push((content, next)),
            Pat::NotAllowed => {}
            other => panic!("unexpected open-derivative shape: {:?}", other),
        }
    }

    /// The distinct candidate content patterns reachable by opening an
    /// element of this name; more than one means the content model is
    /// locally ambiguous
    pub fn initial_content_patterns(&self, p: PatId, name: &Name) -> Vec<PatId> {
        let d = self.open_deriv(p, name, 0);
        let mut pairs = Vec::new();
        self.after_pairs(d, &mut pairs);
        let mut seen = HashSet::new();
        let mut out = Vec::new();
        for (content, _) in pairs {
            if seen.insert(content) {
                out.push(content);
            }
        }
        out
    }

    /// Collapses the candidate set into one content pattern; recovery levels
    /// widen monotonically (0 exact, 1 ignores the element name mismatch,
    /// 2 accepts any content at all)
    pub fn combined_initial_content_pattern(&self, p: PatId, name: &Name, level: u8) -> PatId {
        if level >= 2 {
            return self.any_content();
        }
        let d = self.open_deriv(p, name, level);
        let mut pairs = Vec::new();
        self.after_pairs(d, &mut pairs);
        let mut combined = self.not_allowed();
        let mut seen = HashSet::new();
        for (content, _) in pairs {
            if seen.insert(content) {
                combined = self.choice(combined, content);
            }
        }
        combined
    }

    /// Fast path: when exactly one textually-distinct content pattern can
    /// begin here for this name, returns it together with the parent state
    /// that follows the child's close
    pub fn unambig_content_pattern(&self, p: PatId, name: &Name) -> Option<(PatId, PatId)> {
        let d = self.open_deriv(p, name, 0);
        let mut pairs = Vec::new();
        self.after_pairs(d, &mut pairs);
        let mut iter = pairs.into_iter();
        let (content, mut next) = iter.next()?;
        for (c, n) in iter {
            if c != content {
                return None;
            }
            next = self.choice(next, n);
        }
        Some((content, next))
    }

    /// The universal pattern used at the top recovery level: any mixture of
    /// character data, elements and attributes
    pub fn any_content(&self) -> PatId {
        if let Some(id) = self.inner.borrow().any_content {
            return id;
        }
        let ph = self.push(Pat::Placeholder(std::ptr::null()));
        let text = self.text();
        let any_elem = self.element(NameClass::any_name(None), ph);
        let any_attr = self.attribute(NameClass::any_name(None), text);
        let item = self.choice(text, self.choice(any_elem, any_attr));
        let any = self.optional(self.one_or_more(item));
        // tie the wildcard element's content back to the whole pattern
        {
            let mut inner = self.inner.borrow_mut();
            let target = inner.patterns[any.0 as usize].clone();
            inner.patterns[ph.0 as usize] = target;
            inner.any_content = Some(any);
        }
        any
    }

    // -- content classification ------------------------------------------

    pub fn content_type(&self, p: PatId) -> ContentType {
        if let Some(hit) = self.inner.borrow().content_types.get(&p) {
            return *hit;
        }
        let v = match self.patt(p) {
            Pat::Empty | Pat::NotAllowed | Pat::Attribute(_, _) | Pat::Placeholder(_) => {
                ContentType::Empty
            }
            Pat::Text => ContentType::Simple,
            Pat::Data(_, _) | Pat::DataExcept(_, _, _) | Pat::Value(_, _) | Pat::List(_) => {
                ContentType::Data
            }
            Pat::Element(_, _) => ContentType::Complex,
            Pat::Choice(p1, p2, _) | Pat::Group(p1, p2, _) | Pat::Interleave(p1, p2, _) => {
                self.content_type(p1).join(self.content_type(p2))
            }
            Pat::OneOrMore(inner, _) => self.content_type(inner),
            Pat::After(p1, _) => self.content_type(p1),
        };
        self.inner.borrow_mut().content_types.insert(p, v);
        v
    }

    // -- key collection ---------------------------------------------------

    /// Key and keyRef uses triggered by a string atom matching this state:
    /// every data/value leaf reachable without crossing an element whose
    /// datatype accepts the value and which carries a key use
    pub fn string_key_uses(&self, p: PatId, value: &str) -> Vec<(KeyUse, String)> {
        let mut out = Vec::new();
        let mut seen = HashSet::new();
        self.collect_string_keys(p, value, &mut seen, &mut out);
        out
    }

    fn collect_string_keys(
        &self,
        p: PatId,
        value: &str,
        seen: &mut HashSet<PatId>,
        out: &mut Vec<(KeyUse, String)>,
    ) {
        if !seen.insert(p) {
            return;
        }
        match self.patt(p) {
            Pat::Choice(p1, p2, _) | Pat::Group(p1, p2, _) | Pat::Interleave(p1, p2, _) => {
                self.collect_string_keys(p1, value, seen, out);
                self.collect_string_keys(p2, value, seen, out);
            }
            Pat::OneOrMore(inner, _) | Pat::List(inner) => {
                self.collect_string_keys(inner, value, seen, out)
            }
            Pat::After(p1, _) => self.collect_string_keys(p1, value, seen, out),
            Pat::Data(dt, Some(key)) => {
                if dt.is_valid(value) {
                    out.push((key, normalize_whitespace(value)));
                }
            }
            Pat::DataExcept(dt, _, Some(key)) => {
                if dt.is_valid(value) {
                    out.push((key, normalize_whitespace(value)));
                }
            }
            Pat::Value(v, Some(key)) => {
                if v.is_valid(value) {
                    out.push((key, normalize_whitespace(value)));
                }
            }
            _ => {}
        }
    }

    /// Key and keyRef uses triggered by an attribute atom matching this state
    pub fn attribute_key_uses(&self, p: PatId, name: &Name, value: &str) -> Vec<(KeyUse, String)> {
        let mut out = Vec::new();
        let mut seen = HashSet::new();
        self.collect_attribute_keys(p, name, value, &mut seen, &mut out);
        out
    }

    fn collect_attribute_keys(
        &self,
        p: PatId,
        name: &Name,
        value: &str,
        seen: &mut HashSet<PatId>,
        out: &mut Vec<(KeyUse, String)>,
    ) {
        if !seen.insert(p) {
            return;
        }
        match self.patt(p) {
            Pat::Choice(p1, p2, _) | Pat::Group(p1, p2, _) | Pat::Interleave(p1, p2, _) => {
                self.collect_attribute_keys(p1, name, value, seen, out);
                self.collect_attribute_keys(p2, name, value, seen, out);
            }
            Pat::OneOrMore(inner, _) => {
                self.collect_attribute_keys(inner, name, value, seen, out)
            }
            Pat::After(p1, _) => self.collect_attribute_keys(p1, name, value, seen, out),
            Pat::Attribute(nc, vp) => {
                if nc.matches(name) && self.value_match(vp, value) {
                    let mut inner_seen = HashSet::new();
                    self.collect_string_keys(vp, value, &mut inner_seen, out);
                }
            }
            _ => {}
        }
    }

    // -- key-ambiguity analysis ------------------------------------------

    /// A grammar is provably key-unambiguous when no element name can reach
    /// two textually distinct content patterns.  If it can, and keys are used
    /// anywhere, key checking is unsound and must be disabled.
    pub fn key_ambiguous(&self, start: PatId) -> bool {
        let mut seen = HashSet::new();
        let mut elements: Vec<(NameClass, PatId)> = Vec::new();
        let mut uses_keys = false;
        self.scan_elements(start, &mut seen, &mut elements, &mut uses_keys);
        if !uses_keys {
            return false;
        }
        for i in 0..elements.len() {
            for j in i + 1..elements.len() {
                let (nc_a, c_a) = &elements[i];
                let (nc_b, c_b) = &elements[j];
                if c_a != c_b && nc_a.overlaps(nc_b) {
                    return true;
                }
            }
        }
        false
    }

    fn scan_elements(
        &self,
        p: PatId,
        seen: &mut HashSet<PatId>,
        elements: &mut Vec<(NameClass, PatId)>,
        uses_keys: &mut bool,
    ) {
        if !seen.insert(p) {
            return;
        }
        match self.patt(p) {
            Pat::Choice(p1, p2, _) | Pat::Group(p1, p2, _) | Pat::Interleave(p1, p2, _) => {
                self.scan_elements(p1, seen, elements, uses_keys);
                self.scan_elements(p2, seen, elements, uses_keys);
            }
            Pat::OneOrMore(inner, _) | Pat::List(inner) => {
                self.scan_elements(inner, seen, elements, uses_keys)
            }
            Pat::Attribute(_, inner) => self.scan_elements(inner, seen, elements, uses_keys),
            Pat::Element(nc, content) => {
                elements.push((*nc, content));
                self.scan_elements(content, seen, elements, uses_keys);
            }
            Pat::Data(_, key) => *uses_keys |= key.is_some(),
            Pat::DataExcept(_, except, key) => {
                *uses_keys |= key.is_some();
                self.scan_elements(except, seen, elements, uses_keys);
            }
            Pat::Value(_, key) => *uses_keys |= key.is_some(),
            Pat::After(p1, p2) => {
                self.scan_elements(p1, seen, elements, uses_keys);
                self.scan_elements(p2, seen, elements, uses_keys);
            }
            Pat::Empty | Pat::Text | Pat::NotAllowed | Pat::Placeholder(_) => {}
        }
    }

    // -- explanation helpers ----------------------------------------------

    fn heads(&self, id: PatId, result: &mut Vec<Pat>, seen: &mut HashSet<PatId>) {
        if !seen.insert(id) {
            return;
        }
        let pat = self.patt(id);
        match pat {
            Pat::Choice(p1, p2, _) | Pat::Interleave(p1, p2, _) => {
                self.heads(p1, result, seen);
                self.heads(p2, result, seen);
            }
            Pat::Group(p1, p2, _) => {
                if self.is_nullable(p1) {
                    self.heads(p1, result, seen);
                    self.heads(p2, result, seen);
                } else {
                    self.heads(p1, result, seen);
                }
            }
            Pat::OneOrMore(p, _) | Pat::List(p) => self.heads(p, result, seen),
            Pat::After(p, _) => self.heads(p, result, seen),
            Pat::Empty | Pat::Text | Pat::NotAllowed | Pat::Placeholder(_) => {}
            other => {
                if !result.contains(&other) {
                    result.push(other);
                }
            }
        }
    }

    /// A short description of what the given state could accept next, used
    /// to augment diagnostics
    pub fn describe_expected(&self, expected: PatId) -> String {
        let mut heads = Vec::new();
        let mut seen = HashSet::new();
        self.heads(expected, &mut heads, &mut seen);
        let mut result = String::new();
        const MAX_ELEMENTS: usize = 4;
        let mut rest = 0;
        for (i, nameclass) in heads
            .iter()
            .filter_map(|p| {
                if let Pat::Element(nameclass, _) = p {
                    Some(nameclass)
                } else {
                    None
                }
            })
            .enumerate()
        {
            if i == 0 {
                result.push_str("element ");
            }
            if i >= MAX_ELEMENTS {
                rest += 1;
            } else {
                if i > 0 {
                    result.push(' ');
                }
                let mut desc = String::new();
                describe_nameclass(nameclass, &mut desc);
                result.push_str(&desc);
            }
        }
        if rest > 0 {
            result.push_str(&format!(" .. or one of {} more", rest));
        }
        result
    }
}

fn describe_nameclass(nc: &NameClass, desc: &mut String) {
    match nc {
        NameClass::Named {
            namespace_uri: _,
            name,
        } => {
            desc.push_str(name);
        }
        NameClass::NsName {
            namespace_uri,
            except,
        } => {
            desc.push_str(namespace_uri);
            desc.push_str(":*");
            if let Some(except) = except {
                desc.push('-');
                describe_nameclass(except, desc);
            }
        }
        NameClass::AnyName { except } => {
            desc.push('*');
            if let Some(except) = except {
                desc.push('-');
                describe_nameclass(except, desc);
            }
        }
        NameClass::Alt { a, b } => {
            describe_nameclass(a, desc);
            desc.push('|');
            describe_nameclass(b, desc);
        }
    }
}

pub fn is_whitespace_char(c: char) -> bool {
    ['\x20', '\x09', '\x0d', '\x0a'].contains(&c)
}

pub fn is_whitespace_str(s: &str) -> bool {
    s.chars().all(is_whitespace_char)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rngcheck_model::datatype::builtin::BuiltinDatatype;
    use rngcheck_model::datatype::Datatypes;

    fn name(local: &str) -> Name {
        Name::new("", local)
    }

    fn simple_element(e: &Engine, local: &str, content: PatId) -> PatId {
        e.element(NameClass::named("".to_string(), local.to_string()), content)
    }

    #[test]
    fn nullable_basics() {
        let e = Engine::default();
        assert!(e.is_nullable(e.empty()));
        assert!(e.is_nullable(e.text()));
        assert!(!e.is_nullable(e.not_allowed()));
        let el = simple_element(&e, "a", e.empty());
        assert!(!e.is_nullable(el));
        assert!(e.is_nullable(e.optional(el)));
        assert!(e.is_nullable(e.choice(el, e.empty())));
        assert!(!e.is_nullable(e.group(el, e.empty())));
    }

    #[test]
    fn interning_dedups() {
        let e = Engine::default();
        let a = simple_element(&e, "a", e.empty());
        let b = simple_element(&e, "a", e.empty());
        assert_eq!(a, b);
    }

    #[test]
    fn not_allowed_absorbs() {
        let e = Engine::default();
        let el = simple_element(&e, "a", e.empty());
        assert_eq!(e.choice(e.not_allowed(), el), el);
        assert!(e.is_empty_choice(e.group(el, e.not_allowed())));
        assert!(e.is_empty_choice(e.interleave(e.not_allowed(), el)));
    }

    #[test]
    fn redundant_choice_leaves_eliminated() {
        let e = Engine::default();
        let a = simple_element(&e, "a", e.empty());
        let b = simple_element(&e, "b", e.empty());
        let ab = e.choice(a, b);
        // adding an alternative already present must not grow the pattern
        assert_eq!(e.choice(ab, a), ab);
        assert_eq!(e.choice(ab, ab), ab);
    }

    #[test]
    fn open_deriv_produces_candidates() {
        let e = Engine::default();
        let content_a = e.text();
        let el = simple_element(&e, "a", content_a);
        let cands = e.initial_content_patterns(el, &name("a"));
        assert_eq!(cands, vec![content_a]);
        assert!(e.initial_content_patterns(el, &name("zzz")).is_empty());
    }

    #[test]
    fn ambiguous_candidates_detected() {
        let e = Engine::default();
        // element a { text } | element a { element b { empty } }
        let c1 = e.text();
        let b = simple_element(&e, "b", e.empty());
        let c2 = b;
        let choice = e.choice(simple_element(&e, "a", c1), simple_element(&e, "a", c2));
        let cands = e.initial_content_patterns(choice, &name("a"));
        assert_eq!(cands.len(), 2);
        assert!(e.unambig_content_pattern(choice, &name("a")).is_none());
    }

    #[test]
    fn unambig_fast_path() {
        let e = Engine::default();
        let content = e.text();
        let a = simple_element(&e, "a", content);
        let b = simple_element(&e, "b", e.empty());
        let seq = e.group(a, b);
        let (c, next) = e.unambig_content_pattern(seq, &name("a")).unwrap();
        assert_eq!(c, content);
        // after the child closes, only element b remains
        let cands = e.initial_content_patterns(next, &name("b"));
        assert_eq!(cands.len(), 1);
        assert!(!e.is_nullable(next));
    }

    #[test]
    fn element_residual_by_satisfied_set() {
        let e = Engine::default();
        let c1 = e.text();
        let b = simple_element(&e, "b", e.empty());
        let choice = e.choice(simple_element(&e, "a", c1), simple_element(&e, "a", b));
        // only the candidate with content c1 was satisfied
        let next = e.element_residual(choice, &name("a"), &[c1]);
        assert!(e.is_nullable(next));
        // neither candidate satisfied: the parent is stuck
        let stuck = e.element_residual(choice, &name("a"), &[]);
        assert!(e.is_empty_choice(stuck));
    }

    #[test]
    fn recovery_levels_widen() {
        let e = Engine::default();
        let el = simple_element(&e, "a", e.text());
        // wrong name: level 0 is stuck, level 1 admits the content anyway
        let l0 = e.combined_initial_content_pattern(el, &name("b"), 0);
        assert!(e.is_empty_choice(l0));
        let l1 = e.combined_initial_content_pattern(el, &name("b"), 1);
        assert!(!e.is_empty_choice(l1));
        let l2 = e.combined_initial_content_pattern(el, &name("b"), 2);
        assert!(!e.is_empty_choice(l2));
        assert!(e.is_nullable(l2));
    }

    #[test]
    fn any_content_accepts_everything() {
        let e = Engine::default();
        let any = e.any_content();
        assert!(e.is_nullable(any));
        let after_text = e.text_residual(any);
        assert!(e.is_nullable(after_text));
        let cands = e.initial_content_patterns(any, &name("whatever"));
        assert_eq!(cands.len(), 1);
        let after_attr = e.attribute_residual(any, &name("x"), Some("v"));
        assert!(e.is_nullable(after_attr));
    }

    #[test]
    fn attribute_residual_and_end_attributes() {
        let e = Engine::default();
        let attr = e.attribute(
            NameClass::named("".to_string(), "id".to_string()),
            e.text(),
        );
        let content = e.group(attr, e.text());
        // consume the attribute, then close the attribute phase
        let d = e.attribute_residual(content, &name("id"), Some("x"));
        assert!(!e.is_empty_choice(d));
        let closed = e.end_attributes(d, false);
        assert!(!e.is_empty_choice(closed));
        // without the attribute, the strict end-of-attributes step is stuck
        let strict = e.end_attributes(content, false);
        assert!(e.is_empty_choice(strict));
        // and the recovering step force-advances past the requirement
        let recovered = e.end_attributes(content, true);
        assert!(!e.is_empty_choice(recovered));
    }

    #[test]
    fn wildcard_attribute_value_distinguishes_bad_value() {
        let e = Engine::default();
        let value = e.push(Pat::Value(
            Box::new(datatype::DatatypeValues::Builtin(
                rngcheck_model::datatype::builtin::BuiltinDatatypeValue::TokenValue(
                    "yes".to_string(),
                ),
            )),
            None,
        ));
        let attr = e.attribute(NameClass::named("".to_string(), "ok".to_string()), value);
        // wrong value: exact match stuck, wildcard match fine
        assert!(e.is_empty_choice(e.attribute_residual(attr, &name("ok"), Some("no"))));
        assert!(!e.is_empty_choice(e.attribute_residual(attr, &name("ok"), None)));
        // wrong name: stuck either way
        assert!(e.is_empty_choice(e.attribute_residual(attr, &name("nope"), None)));
    }

    #[test]
    fn string_residual_checks_datatypes() {
        let e = Engine::default();
        let dt = e.push(Pat::Data(
            Box::new(Datatypes::Builtin(BuiltinDatatype::Token)),
            None,
        ));
        assert!(e.is_nullable(e.string_residual(dt, "anything")));
        let text = e.text();
        assert!(e.is_nullable(e.string_residual(text, "anything")));
    }

    #[test]
    fn content_types() {
        let e = Engine::default();
        assert_eq!(e.content_type(e.empty()), ContentType::Empty);
        assert_eq!(e.content_type(e.text()), ContentType::Simple);
        let dt = e.push(Pat::Data(
            Box::new(Datatypes::Builtin(BuiltinDatatype::Token)),
            None,
        ));
        assert_eq!(e.content_type(dt), ContentType::Data);
        let el = simple_element(&e, "a", e.empty());
        assert_eq!(e.content_type(el), ContentType::Complex);
        // mixed data/element content is complex, so no buffering happens
        assert_eq!(e.content_type(e.choice(dt, el)), ContentType::Complex);
        // attributes do not affect the content classification
        let attr = e.attribute(NameClass::named("".to_string(), "a".to_string()), e.text());
        assert_eq!(e.content_type(e.group(attr, dt)), ContentType::Data);
    }

    #[test]
    fn memoization_is_transparent() {
        let e = Engine::default();
        let el = simple_element(&e, "a", e.text());
        let seq = e.group(el, el);
        let d1 = e.any_element_residual(seq, &name("a"));
        // a second, memo-hitting call must intern to the identical id
        let d2 = e.any_element_residual(seq, &name("a"));
        assert_eq!(d1, d2);
        // and a structurally fresh engine computes an equivalent result
        let f = Engine::default();
        let el_f = simple_element(&f, "a", f.text());
        let seq_f = f.group(el_f, el_f);
        let d_f = f.any_element_residual(seq_f, &name("a"));
        assert_eq!(f.patt(d_f), e.patt(d1));
    }

    #[test]
    fn key_ambiguity_flag() {
        let e = Engine::default();
        let keyed = e.push(Pat::Data(
            Box::new(Datatypes::Builtin(BuiltinDatatype::Token)),
            Some(KeyUse::Key("k".to_string())),
        ));
        // one element name, two distinct content patterns, keys in use
        let ambiguous = e.choice(
            simple_element(&e, "a", keyed),
            simple_element(&e, "a", e.text()),
        );
        assert!(e.key_ambiguous(ambiguous));
        // distinct names are fine
        let unambiguous = e.choice(
            simple_element(&e, "a", keyed),
            simple_element(&e, "b", e.text()),
        );
        assert!(!e.key_ambiguous(unambiguous));
        // no keys: ambiguity does not matter
        let no_keys = e.choice(
            simple_element(&e, "a", e.text()),
            simple_element(&e, "a", e.empty()),
        );
        assert!(!e.key_ambiguous(no_keys));
    }

    #[test]
    fn string_key_uses_collects_matching_leaves() {
        let e = Engine::default();
        let keyed = e.push(Pat::Data(
            Box::new(Datatypes::Builtin(BuiltinDatatype::Token)),
            Some(KeyUse::Key("id".to_string())),
        ));
        let uses = e.string_key_uses(keyed, " a  b ");
        assert_eq!(uses.len(), 1);
        assert_eq!(uses[0].1, "a b");
        match &uses[0].0 {
            KeyUse::Key(name) => assert_eq!(name, "id"),
            other => panic!("unexpected {:?}", other),
        }
    }
}

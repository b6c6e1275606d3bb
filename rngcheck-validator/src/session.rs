//! The streaming validation session: a state machine keyed on open-element
//! nesting whose values are derivative states in the pattern arena.
//!
//! Each open element owns a frame.  A frame is *unambiguous* when a single
//! candidate content pattern was reachable for its name (possibly with the
//! parent's post-close state captured at open time), and *ambiguous* when
//! several textually distinct content patterns were — in which case one
//! derivative is tracked per candidate until the close tag disambiguates via
//! nullability.  Errors never abort the session; bounded recovery widens the
//! state so the rest of the document still gets checked.

use crate::engine::{is_whitespace_str, ContentType, Engine, PatId};
use crate::keys::KeyChecker;
use rngcheck_model::model::{DefineRule, KeyUse, Name};
use std::cell::RefCell;
use std::ops::Range;
use std::rc::Rc;

/// Bounded recovery: how many widening retries follow a failed exact match
pub const RECOVERY_ATTEMPTS: u8 = 2;

pub type Span = Range<usize>;

/// A validation problem, carrying a machine-readable message key with
/// arguments and the source location; rendering text is the caller's job.
#[derive(Debug, Clone, PartialEq)]
pub struct Diagnostic {
    pub kind: DiagnosticKind,
    pub span: Span,
}

#[derive(Debug, Clone, PartialEq)]
pub enum DiagnosticKind {
    ImpossibleElement { name: String },
    UnfinishedElement,
    BadAttributeValue { name: String },
    ImpossibleAttribute { name: String },
    RequiredAttributesMissing,
    TextNotAllowed,
    StringNotAllowed,
    DocumentIncomplete,
    DuplicateKey { key: String, value: String },
    UndefinedKeyRef { key: String, value: String },
    /// recovery exhausted in a state that prior errors cannot explain; this
    /// is a defect in the engine and must not be swallowed
    InternalError,
}

impl DiagnosticKind {
    pub fn message_key(&self) -> &'static str {
        match self {
            DiagnosticKind::ImpossibleElement { .. } => "impossible_element",
            DiagnosticKind::UnfinishedElement => "unfinished_element",
            DiagnosticKind::BadAttributeValue { .. } => "bad_attribute_value",
            DiagnosticKind::ImpossibleAttribute { .. } => "impossible_attribute_ignored",
            DiagnosticKind::RequiredAttributesMissing => "required_attributes_missing",
            DiagnosticKind::TextNotAllowed => "text_not_allowed",
            DiagnosticKind::StringNotAllowed => "string_not_allowed",
            DiagnosticKind::DocumentIncomplete => "document_incomplete",
            DiagnosticKind::DuplicateKey { .. } => "duplicate_key",
            DiagnosticKind::UndefinedKeyRef { .. } => "undefined_keyref",
            DiagnosticKind::InternalError => "internal_error",
        }
    }

    pub fn args(&self) -> Vec<String> {
        match self {
            DiagnosticKind::ImpossibleElement { name }
            | DiagnosticKind::BadAttributeValue { name }
            | DiagnosticKind::ImpossibleAttribute { name } => vec![name.clone()],
            DiagnosticKind::DuplicateKey { key, value }
            | DiagnosticKind::UndefinedKeyRef { key, value } => {
                vec![key.clone(), value.clone()]
            }
            _ => vec![],
        }
    }
}

struct Frame {
    state: PatId,
    kind: FrameKind,
    collecting: Option<String>,
}

enum FrameKind {
    /// one candidate content pattern; `next` is the parent's post-close
    /// state when it could be captured at open time
    Unambig { next: Option<PatId> },
    /// several candidates: one derivative per textually distinct content
    /// pattern, collapsed by nullability when the element closes
    Ambig { init: Vec<PatId>, state: Vec<PatId> },
}

pub struct Session {
    engine: Engine,
    frames: Vec<Frame>,
    diagnostics: Vec<Diagnostic>,
    had_error: bool,
    fatal: bool,
    keys: KeyChecker,
    key_checking: bool,
}

impl Session {
    /// Compiles the model graph into the arena and opens a session rooted at
    /// its start pattern.  Key checking is disabled up front when the grammar
    /// is not provably key-unambiguous.
    pub fn new(start: &Rc<RefCell<Option<DefineRule>>>) -> Session {
        let engine = Engine::default();
        let start_id = engine.compile_rule(start);
        let key_checking = !engine.key_ambiguous(start_id);
        Session {
            engine,
            frames: vec![Frame {
                state: start_id,
                kind: FrameKind::Unambig { next: None },
                collecting: None,
            }],
            diagnostics: Vec::new(),
            had_error: false,
            fatal: false,
            keys: KeyChecker::default(),
            key_checking,
        }
    }

    pub fn diagnostics(&self) -> &[Diagnostic] {
        &self.diagnostics
    }

    /// True while no validation error has been recorded
    pub fn is_valid(&self) -> bool {
        !self.had_error && !self.fatal
    }

    /// True once the session has hit the fatal internal-invariant path
    pub fn is_poisoned(&self) -> bool {
        self.fatal
    }

    /// What the current state would accept next; used by callers to enrich
    /// error reports
    pub fn describe_expected(&self) -> String {
        self.engine.describe_expected(self.top().state)
    }

    fn error(&mut self, kind: DiagnosticKind, span: &Span) {
        self.had_error = true;
        self.diagnostics.push(Diagnostic {
            kind,
            span: span.clone(),
        });
    }

    fn top(&self) -> &Frame {
        self.frames.last().expect("document frame underflow")
    }
    fn top_mut(&mut self) -> &mut Frame {
        self.frames.last_mut().expect("document frame underflow")
    }

    // Advances a state in place unless the result is the stuck sentinel.
    // Returns false when the caller needs to report an error; a state that
    // was already stuck swallows the failure because it has been reported
    // once already.
    fn update_state(engine: &Engine, state: &mut PatId, next: PatId) -> bool {
        if engine.is_empty_choice(next) {
            engine.is_empty_choice(*state)
        } else {
            *state = next;
            true
        }
    }

    /// Applies a derivative to every candidate state of an ambiguous frame
    fn for_each_candidate<F: Fn(&Engine, PatId) -> PatId>(&mut self, f: F) {
        let mut states = match &mut self.top_mut().kind {
            FrameKind::Ambig { state, .. } => std::mem::take(state),
            _ => return,
        };
        for s in &mut states {
            *s = f(&self.engine, *s);
        }
        if let FrameKind::Ambig { state, .. } = &mut self.top_mut().kind {
            *state = states;
        }
    }

    pub fn start_element(&mut self, name: &Name, attrs: &[(Name, String, Span)], span: &Span) {
        self.flush_characters(span);
        // fast path: an unambiguous parent state with exactly one candidate
        // content pattern lets us capture the post-close state right now
        if let FrameKind::Unambig { .. } = self.top().kind {
            let state = self.top().state;
            if let Some((content, next)) = self.engine.unambig_content_pattern(state, name) {
                self.frames.push(Frame {
                    state: content,
                    kind: FrameKind::Unambig { next: Some(next) },
                    collecting: None,
                });
                self.process_attributes(attrs, span);
                return;
            }
        }

        let state = self.top().state;
        let mut candidates = self.engine.initial_content_patterns(state, name);
        if let FrameKind::Ambig {
            state: cand_states, ..
        } = &self.top().kind
        {
            for s in cand_states.clone() {
                for c in self.engine.initial_content_patterns(s, name) {
                    if !candidates.contains(&c) {
                        candidates.push(c);
                    }
                }
            }
        }

        let mut child_state = self.engine.combined_initial_content_pattern(state, name, 0);
        if self.engine.is_empty_choice(child_state) && !self.engine.is_empty_choice(state) {
            self.error(
                DiagnosticKind::ImpossibleElement {
                    name: name.local_name.clone(),
                },
                span,
            );
            for level in 1..=RECOVERY_ATTEMPTS {
                child_state = self
                    .engine
                    .combined_initial_content_pattern(state, name, level);
                if !self.engine.is_empty_choice(child_state) {
                    break;
                }
            }
        }

        let kind = if candidates.len() <= 1 {
            FrameKind::Unambig { next: None }
        } else {
            FrameKind::Ambig {
                init: candidates.clone(),
                state: candidates,
            }
        };
        self.frames.push(Frame {
            state: child_state,
            kind,
            collecting: None,
        });
        self.process_attributes(attrs, span);
    }

    fn process_attributes(&mut self, attrs: &[(Name, String, Span)], open_span: &Span) {
        for (name, value, span) in attrs {
            let prev = self.top().state;
            let next = self.engine.attribute_residual(prev, name, Some(&value[..]));
            let mut state = prev;
            if !Self::update_state(&self.engine, &mut state, next) {
                // retry with a wildcard value to distinguish a bad value
                // from an attribute that is not permitted at all
                let wild = self.engine.attribute_residual(prev, name, None);
                if Self::update_state(&self.engine, &mut state, wild) {
                    self.error(
                        DiagnosticKind::BadAttributeValue {
                            name: name.local_name.clone(),
                        },
                        span,
                    );
                } else {
                    self.error(
                        DiagnosticKind::ImpossibleAttribute {
                            name: name.local_name.clone(),
                        },
                        span,
                    );
                }
            } else if self.key_checking {
                let uses = self.engine.attribute_key_uses(prev, name, value);
                self.record_key_uses(uses, span);
            }
            self.top_mut().state = state;
            self.for_each_candidate(|e, s| e.attribute_residual(s, name, Some(&value[..])));
        }

        // detect missing required attributes, then force-advance past them
        // so the content can still be checked
        let prev = self.top().state;
        let strict = self.engine.end_attributes(prev, false);
        let mut state = prev;
        if !Self::update_state(&self.engine, &mut state, strict) {
            self.error(DiagnosticKind::RequiredAttributesMissing, open_span);
            state = self.engine.end_attributes(prev, true);
        }
        self.top_mut().state = state;
        self.for_each_candidate(|e, s| e.end_attributes(s, false));

        let mut collect = self.engine.content_type(self.top().state) == ContentType::Data;
        if let FrameKind::Ambig {
            state: cand_states, ..
        } = &self.top().kind
        {
            for s in cand_states.clone() {
                collect |= self.engine.content_type(s) == ContentType::Data;
            }
        }
        if collect {
            self.top_mut().collecting = Some(String::new());
        }
    }

    pub fn characters(&mut self, text: &str, span: &Span) {
        if let Some(buf) = &mut self.top_mut().collecting {
            buf.push_str(text);
            return;
        }
        if is_whitespace_str(text) {
            return;
        }
        let prev = self.top().state;
        let next = self.engine.text_residual(prev);
        let mut state = prev;
        if !Self::update_state(&self.engine, &mut state, next) {
            self.error(DiagnosticKind::TextNotAllowed, span);
        }
        self.top_mut().state = state;
        self.for_each_candidate(|e, s| e.text_residual(s));
    }

    /// Matches buffered character data as one string atom.  A whitespace-only
    /// buffer is allowed to match either with or without stripping, so a
    /// failed match there leaves the state unchanged instead of reporting.
    fn flush_characters(&mut self, span: &Span) {
        let buf = match self.top_mut().collecting.take() {
            None => return,
            Some(buf) => buf,
        };
        let ignorable = is_whitespace_str(&buf);
        let prev = self.top().state;
        let next = self.engine.string_residual(prev, &buf);
        let mut state = prev;
        if !Self::update_state(&self.engine, &mut state, next) {
            if !ignorable {
                self.error(DiagnosticKind::StringNotAllowed, span);
            }
        } else if !ignorable && self.key_checking {
            let uses = self.engine.string_key_uses(prev, &buf);
            self.record_key_uses(uses, span);
        }
        self.top_mut().state = state;
        self.for_each_candidate(|e, s| {
            let d = e.string_residual(s, &buf);
            if e.is_empty_choice(d) && is_whitespace_str(&buf) {
                s
            } else {
                d
            }
        });
    }

    pub fn end_element(&mut self, name: &Name, span: &Span) {
        self.flush_characters(span);
        let closing = self
            .frames
            .pop()
            .expect("end_element without start_element");
        if !self.engine.is_nullable(closing.state) && !self.engine.is_empty_choice(closing.state)
        {
            self.error(DiagnosticKind::UnfinishedElement, span);
        }
        if self.frames.is_empty() {
            // the event source closed more elements than it opened
            self.frames.push(closing);
            self.fatal = true;
            self.diagnostics.push(Diagnostic {
                kind: DiagnosticKind::InternalError,
                span: span.clone(),
            });
            return;
        }
        match closing.kind {
            FrameKind::Unambig { next: Some(next) } => {
                self.top_mut().state = next;
            }
            FrameKind::Unambig { next: None } => {
                self.for_each_candidate(|e, s| e.any_element_residual(s, name));
                let prev = self.top().state;
                let next = self.engine.any_element_residual(prev, name);
                let mut state = prev;
                // a failure here was already reported when the element opened
                Self::update_state(&self.engine, &mut state, next);
                self.top_mut().state = state;
            }
            FrameKind::Ambig { init, state } => {
                // a candidate is satisfied only if its own derivative is
                // nullable now that the element is complete
                let satisfied: Vec<PatId> = init
                    .iter()
                    .zip(state.iter())
                    .filter(|(_, s)| self.engine.is_nullable(**s))
                    .map(|(i, _)| *i)
                    .collect();
                self.for_each_candidate(|e, s| e.element_residual(s, name, &satisfied));
                let prev = self.top().state;
                let next = self.engine.element_residual(prev, name, &satisfied);
                let mut new_state = prev;
                if !Self::update_state(&self.engine, &mut new_state, next) {
                    if !self.had_error {
                        // this state is provably unreachable unless an error
                        // was already reported; treat it as an engine defect
                        self.fatal = true;
                        self.diagnostics.push(Diagnostic {
                            kind: DiagnosticKind::InternalError,
                            span: span.clone(),
                        });
                    } else {
                        // recover by assuming every candidate matched
                        let next = self.engine.element_residual(prev, name, &init);
                        if !Self::update_state(&self.engine, &mut new_state, next) {
                            let next = self.engine.any_element_residual(prev, name);
                            Self::update_state(&self.engine, &mut new_state, next);
                        }
                    }
                }
                self.top_mut().state = new_state;
            }
        }
    }

    pub fn end_document(&mut self, span: &Span) {
        if self.frames.len() != 1 {
            self.had_error = true;
        }
        let root_state = self.frames.first().expect("document frame underflow").state;
        if !self.engine.is_nullable(root_state) {
            self.error(DiagnosticKind::DocumentIncomplete, span);
        }
        // a document with structural errors does not get key-integrity
        // diagnostics layered on top
        if !self.had_error && !self.fatal && self.key_checking {
            let mut extra = self.keys.check_complete();
            if !extra.is_empty() {
                self.had_error = true;
                self.diagnostics.append(&mut extra);
            }
        }
    }

    fn record_key_uses(&mut self, uses: Vec<(KeyUse, String)>, span: &Span) {
        for (use_, value) in uses {
            match use_ {
                KeyUse::Key(name) => {
                    if let Some(d) = self.keys.declare_key(&name, &value, span.clone()) {
                        self.had_error = true;
                        self.diagnostics.push(d);
                    }
                }
                KeyUse::KeyRef(name) => {
                    self.keys.declare_key_ref(&name, &value, span.clone());
                }
            }
        }
    }
}

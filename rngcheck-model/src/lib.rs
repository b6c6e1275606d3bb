//! Compiles RELAX NG schema documents (XML syntax) into a shared pattern
//! graph.
//!
//! The builder resolves named-pattern references through a chain of grammar
//! scopes, merges split definitions according to their combine mode, tracks
//! include overrides with keep/require/ignore replacement status, rejects
//! recursive inclusion, and binds datatype names through the pluggable
//! datatype layer (degrading to the built-in string type on failure).
//! Structural errors are accumulated rather than aborting the build, with
//! `NotAllowed` substituted for the offending construct, so that one bad
//! definition does not suppress every later diagnostic.

use crate::model::{CombineRule, DefineRule, KeyUse, NameClass, PatRef, Pattern};
use codemap::CodeMap;
use rngcheck_syntax::types;
use rngcheck_syntax::xml;
use std::cell::RefCell;
use std::collections::HashMap;
use std::fs::File;
use std::io;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::rc::Rc;
use std::sync::Arc;

pub mod datatype;
pub mod model;
pub mod restrictions;

#[derive(Debug)]
pub enum SchemaError {
    Io(PathBuf, io::Error),
    IncludeError(codemap::Span, Box<SchemaError>),
    /// the document is not well-formed XML, or its root is not RELAX NG
    XmlParse(codemap::Span, String),
    /// recoverable structural problem found while parsing a schema document
    Syntax(codemap::Span, String),
    DuplicateDefinition {
        name: String,
        duplicate: codemap::Span,
        original: codemap::Span,
    },
    UndefinedReference {
        span: codemap::Span,
        identifier: String,
    },
    /// a 'grammar' failed to provide a 'start' definition
    StartRuleNotDefined {
        span: codemap::Span,
    },
    /// the same name is defined with both combine="choice" and combine="interleave"
    ConflictingCombine {
        name: String,
        this_span: codemap::Span,
        that_span: codemap::Span,
    },
    /// a parentRef was used where no parent grammar scope is available
    NoParentAvailable(codemap::Span),
    RecursiveReference {
        name: String,
        span: codemap::Span,
    },
    RecursiveInclude {
        name: String,
        span: codemap::Span,
    },
    IncludedFileMustBeGrammar {
        span: codemap::Span,
    },
    /// An element pattern may not appear as the child of an attribute pattern
    ElementAsChildOfAttribute {
        attribute_span: codemap::Span,
        element_span: codemap::Span,
    },
    /// The name is overridden by an include, but the included grammar did not
    /// define it, so the override replaced nothing
    MissingDefineReplacement {
        override_span: codemap::Span,
        include_span: codemap::Span,
        name: String,
    },
    MissingStartReplacement {
        override_span: codemap::Span,
        include_span: codemap::Span,
    },
    UnsupportedDatatypeLibrary {
        span: codemap::Span,
        namespace: String,
    },
    UnrecognizedDatatype {
        span: codemap::Span,
        name: String,
    },
    InvalidDatatypeParams {
        span: codemap::Span,
        detail: String,
    },
    InvalidValue {
        span: codemap::Span,
        type_name: String,
    },
    RestrictionViolation {
        span: codemap::Span,
        key: &'static str,
    },
}

#[derive(Debug)]
pub enum SchemaWarning {
    /// the schema uses a RELAX NG structure namespace other than version 1.0
    WrongGrammarVersion {
        span: codemap::Span,
        found: String,
    },
}

pub trait Files {
    fn load(&self, name: &Path) -> Result<String, SchemaError>;
}
pub struct FsFiles;
impl Files for FsFiles {
    fn load(&self, name: &Path) -> Result<String, SchemaError> {
        let mut io = File::open(name).map_err(|e| SchemaError::Io(name.to_path_buf(), e))?;
        let mut data = String::new();
        io.read_to_string(&mut data)
            .map_err(|e| SchemaError::Io(name.to_path_buf(), e))?;
        Ok(data)
    }
}

/// Result of compiling a schema: the start definition cell of the outermost
/// scope, plus the accumulated diagnostics.  A non-empty `errors` list means
/// the grammar is not valid, even though a (partially `NotAllowed`) pattern
/// is still available for inspection.
#[derive(Debug)]
pub struct CompiledGrammar {
    pub start: Rc<RefCell<Option<DefineRule>>>,
    pub errors: Vec<SchemaError>,
    pub warnings: Vec<SchemaWarning>,
}

/// Per-include replacement bookkeeping for definitions the including file
/// overrides
#[derive(Debug)]
struct OverrideStatus {
    span: codemap::Span,
    status: Replacement,
}
#[derive(Debug, Clone, Copy, PartialEq)]
enum Replacement {
    /// the included grammar must supply a definition for this name
    Require,
    /// the included grammar's definition has been dropped in favour of the override
    Ignore,
}

type RefCells = RefCell<HashMap<String, Rc<RefCell<Option<DefineRule>>>>>;

pub(crate) enum Context<'a> {
    Root {
        file: Arc<codemap::File>,
        refs: RefCells,
    },
    Include {
        parent: &'a Context<'a>,
        file: Arc<codemap::File>,
        overrides: RefCell<HashMap<String, OverrideStatus>>,
    },
    IncludeOverrides {
        parent: &'a Context<'a>,
    },
    Grammar {
        parent: &'a Context<'a>,
        refs: RefCells,
    },
    // We track the context of a definition since the body of that definition must not reference
    // the identifier being defined, unless the reference is in the body of an element definition
    Define {
        parent: &'a Context<'a>,
        id: String,
    },
    Element {
        parent: &'a Context<'a>,
    },
    // Attributes are another context so that we can prevent element patterns from appearing
    // as children of attributes
    Attribute {
        parent: &'a Context<'a>,
        span: codemap::Span,
    },
}

impl<'a> Context<'a> {
    fn new_root(file: Arc<codemap::File>) -> Context<'a> {
        Context::Root {
            file,
            refs: RefCell::new(HashMap::new()),
        }
    }

    /// Creates a new context for an included file, rejecting recursive inclusion
    fn new_include(
        &self,
        span: codemap::Span,
        file: Arc<codemap::File>,
    ) -> Result<Context, SchemaError> {
        self.check_include(span, file.clone())?;
        Ok(Context::Include {
            parent: self,
            file,
            overrides: RefCell::new(HashMap::new()),
        })
    }

    fn new_inc_overrides(&self) -> Context {
        match self {
            Context::Include { .. } => Context::IncludeOverrides { parent: self },
            _ => unreachable!("parent was not a Context::Include"),
        }
    }

    fn new_grammar(&self) -> Context {
        Context::Grammar {
            parent: self,
            refs: RefCell::new(HashMap::new()),
        }
    }

    fn new_define(&self, id: &str) -> Context {
        Context::Define {
            parent: self,
            id: id.to_string(),
        }
    }

    fn new_element(&self, element_span: codemap::Span) -> Result<Context, SchemaError> {
        if let Some(attribute_span) = self.parent_attribute() {
            return Err(SchemaError::ElementAsChildOfAttribute {
                attribute_span,
                element_span,
            });
        }
        Ok(Context::Element { parent: self })
    }

    fn new_attribute(&self, span: codemap::Span) -> Context {
        Context::Attribute { parent: self, span }
    }

    fn file(&self) -> Arc<codemap::File> {
        match self {
            Context::Root { file, .. } | Context::Include { file, .. } => file.clone(),
            // override definitions are written in the including document
            Context::IncludeOverrides { parent } => {
                if let Context::Include { parent, .. } = parent {
                    parent.file()
                } else {
                    unreachable!("Context::IncludeOverrides parent must be Context::Include")
                }
            }
            Context::Grammar { parent, .. }
            | Context::Define { parent, .. }
            | Context::Element { parent }
            | Context::Attribute { parent, .. } => parent.file(),
        }
    }

    /// Converts a byte-range span from the syntax AST into a codemap span for
    /// diagnostics
    fn convert_span(&self, span: &types::Span) -> codemap::Span {
        self.file().span.subspan(span.start as u64, span.end as u64)
    }

    fn define(&self, id: &str, rule: DefineRule) -> Result<(), SchemaError> {
        match self {
            Context::Root { refs, .. } | Context::Grammar { refs, .. } => {
                let mut refs = refs.borrow_mut();
                if let Some(cell) = refs.get(id) {
                    let mut rule_ref = cell.borrow_mut();
                    let existing = rule_ref.take();
                    match merge(id, existing, rule) {
                        Ok(merged) => {
                            *rule_ref = Some(merged);
                            Ok(())
                        }
                        Err((e, restored)) => {
                            *rule_ref = Some(restored);
                            Err(e)
                        }
                    }
                } else {
                    refs.insert(id.to_string(), Rc::new(RefCell::new(Some(rule))));
                    Ok(())
                }
            }
            Context::Include {
                parent, overrides, ..
            } => {
                let mut overrides = overrides.borrow_mut();
                if let Some(o) = overrides.get_mut(id) {
                    // the including document's definition takes precedence;
                    // drop the included one and record that the override
                    // actually replaced something
                    if o.status == Replacement::Require {
                        o.status = Replacement::Ignore;
                    }
                    Ok(())
                } else {
                    parent.define(id, rule)
                }
            }
            Context::IncludeOverrides { parent } => {
                if let Context::Include {
                    overrides,
                    parent: parent_of_include,
                    ..
                } = parent
                {
                    {
                        let mut overrides = overrides.borrow_mut();
                        overrides.entry(id.to_string()).or_insert(OverrideStatus {
                            span: *rule.span(),
                            status: Replacement::Require,
                        });
                    }
                    parent_of_include.define(id, rule)
                } else {
                    unreachable!("Context::IncludeOverrides parent must be Context::Include")
                }
            }
            Context::Define { .. } | Context::Element { .. } | Context::Attribute { .. } => {
                unreachable!("definitions are not expected in this context")
            }
        }
    }

    fn get_ref(&self, ref_id: &str) -> Option<Rc<RefCell<Option<DefineRule>>>> {
        match self {
            Context::Root { refs, .. } | Context::Grammar { refs, .. } => {
                refs.borrow().get(ref_id).map(Clone::clone)
            }
            Context::Include { parent, .. }
            | Context::IncludeOverrides { parent }
            | Context::Define { parent, .. }
            | Context::Element { parent }
            | Context::Attribute { parent, .. } => parent.get_ref(ref_id),
        }
    }

    fn ref_iter(&self) -> Vec<(String, Rc<RefCell<Option<DefineRule>>>)> {
        match self {
            Context::Root { refs, .. } | Context::Grammar { refs, .. } => refs
                .borrow()
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
            _ => panic!("ref_iter() only valid for a scope context"),
        }
    }

    fn acquire_ref(&self, ref_id: &types::Identifier) -> Result<PatRef, SchemaError> {
        self.check_ref_recursion(ref_id)?;
        self.acquire_ref_impl(ref_id)
    }
    fn acquire_ref_impl(&self, ref_id: &types::Identifier) -> Result<PatRef, SchemaError> {
        match self {
            Context::Root { refs, .. } | Context::Grammar { refs, .. } => {
                let mut refs = refs.borrow_mut();
                if let Some(r) = refs.get(&ref_id.1) {
                    Ok(PatRef(r.clone()))
                } else {
                    let r = Rc::new(RefCell::new(None));
                    refs.insert(ref_id.1.to_string(), r.clone());
                    Ok(PatRef(r))
                }
            }
            Context::Include { parent, .. }
            | Context::IncludeOverrides { parent }
            | Context::Define { parent, .. }
            | Context::Element { parent }
            | Context::Attribute { parent, .. } => parent.acquire_ref_impl(ref_id),
        }
    }

    fn acquire_parent_ref(&self, id: &types::Identifier) -> Result<PatRef, SchemaError> {
        match self {
            Context::Root { .. } => Err(SchemaError::NoParentAvailable(self.convert_span(&id.0))),
            Context::Include { parent, .. }
            | Context::IncludeOverrides { parent }
            | Context::Define { parent, .. }
            | Context::Element { parent }
            | Context::Attribute { parent, .. } => parent.acquire_parent_ref(id),
            Context::Grammar { parent, .. } => parent.acquire_ref(id),
        }
    }

    /// A reference to the name currently being defined is only allowed from
    /// within the body of an element pattern
    fn check_ref_recursion(&self, ref_id: &types::Identifier) -> Result<(), SchemaError> {
        match self {
            Context::Root { .. }
            | Context::Include { .. }
            | Context::IncludeOverrides { .. }
            | Context::Grammar { .. }
            | Context::Element { .. } => Ok(()),
            Context::Define { id, .. } => {
                if id == &ref_id.1 {
                    Err(SchemaError::RecursiveReference {
                        name: ref_id.1.clone(),
                        span: self.convert_span(&ref_id.0),
                    })
                } else {
                    Ok(())
                }
            }
            Context::Attribute { parent, .. } => parent.check_ref_recursion(ref_id),
        }
    }

    fn parent_attribute(&self) -> Option<codemap::Span> {
        match self {
            Context::Root { .. } | Context::Grammar { .. } => None,
            Context::Attribute { span, .. } => Some(*span),
            Context::Include { parent, .. }
            | Context::IncludeOverrides { parent }
            | Context::Define { parent, .. }
            | Context::Element { parent } => parent.parent_attribute(),
        }
    }

    /// Walks the chain of open inclusions checking that `this_file` is not
    /// already being included (by resolved identifier)
    fn check_include(
        &self,
        span: codemap::Span,
        this_file: Arc<codemap::File>,
    ) -> Result<(), SchemaError> {
        match self {
            Context::Root { .. } => Ok(()),
            Context::Grammar { parent, .. }
            | Context::IncludeOverrides { parent }
            | Context::Define { parent, .. }
            | Context::Element { parent }
            | Context::Attribute { parent, .. } => parent.check_include(span, this_file),
            Context::Include { parent, file, .. } => {
                if this_file.name() == file.name() {
                    return Err(SchemaError::RecursiveInclude {
                        name: this_file.name().to_string(),
                        span,
                    });
                }
                parent.check_include(span, this_file)
            }
        }
    }
}

fn append_choice(choice: &mut Pattern, c: Pattern) {
    if let Pattern::Choice(ref mut this) = choice {
        if let Pattern::Choice(mut other) = c {
            this.append(&mut other)
        } else {
            this.push(c)
        }
    } else {
        panic!("not a Choice pattern {:?}", choice);
    }
}
fn append_interleave(interleave: &mut Pattern, c: Pattern) {
    if let Pattern::Interleave(ref mut this) = interleave {
        if let Pattern::Interleave(mut other) = c {
            this.append(&mut other)
        } else {
            this.push(c)
        }
    } else {
        panic!("not an Interleave pattern {:?}", interleave);
    }
}

/// Merges a new definition for a name into the existing one according to the
/// combine rules.  On error, returns the definition to restore so later
/// references still resolve to something.
fn merge(
    name: &str,
    a: Option<DefineRule>,
    b: DefineRule,
) -> Result<DefineRule, (SchemaError, DefineRule)> {
    let a = match a {
        None => return Ok(b),
        Some(a) => a,
    };
    match (a, b) {
        (DefineRule::AssignCombine(that, ac, pa), DefineRule::AssignCombine(this, _, _)) => {
            let e = SchemaError::DuplicateDefinition {
                name: name.to_string(),
                duplicate: this,
                original: that,
            };
            Err((e, DefineRule::AssignCombine(that, ac, pa)))
        }
        // choice-related cases,
        (
            DefineRule::CombineOnly(this, CombineRule::Choice, mut patt_a),
            DefineRule::CombineOnly(_, CombineRule::Choice, patt_b),
        ) => {
            append_choice(&mut patt_a, patt_b);
            Ok(DefineRule::CombineOnly(this, CombineRule::Choice, patt_a))
        }
        (
            DefineRule::AssignCombine(this, Some(CombineRule::Choice), mut patt_a),
            DefineRule::CombineOnly(_, CombineRule::Choice, patt_b),
        )
        | (
            DefineRule::CombineOnly(this, CombineRule::Choice, mut patt_a),
            DefineRule::AssignCombine(_, Some(CombineRule::Choice), patt_b),
        )
        | (
            DefineRule::AssignCombine(this, None, mut patt_a),
            DefineRule::CombineOnly(_, CombineRule::Choice, patt_b),
        )
        | (
            DefineRule::CombineOnly(this, CombineRule::Choice, mut patt_a),
            DefineRule::AssignCombine(_, None, patt_b),
        ) => {
            let result = if let Pattern::Choice(_) = patt_a {
                append_choice(&mut patt_a, patt_b);
                patt_a
            } else {
                Pattern::Choice(vec![patt_a, patt_b])
            };
            Ok(DefineRule::AssignCombine(
                this,
                Some(CombineRule::Choice),
                result,
            ))
        }
        // interleave-related cases,
        (
            DefineRule::CombineOnly(this, CombineRule::Interleave, mut patt_a),
            DefineRule::CombineOnly(_, CombineRule::Interleave, patt_b),
        ) => {
            append_interleave(&mut patt_a, patt_b);
            Ok(DefineRule::CombineOnly(
                this,
                CombineRule::Interleave,
                patt_a,
            ))
        }
        (
            DefineRule::AssignCombine(this, Some(CombineRule::Interleave), mut patt_a),
            DefineRule::CombineOnly(_, CombineRule::Interleave, patt_b),
        )
        | (
            DefineRule::CombineOnly(this, CombineRule::Interleave, mut patt_a),
            DefineRule::AssignCombine(_, Some(CombineRule::Interleave), patt_b),
        )
        | (
            DefineRule::AssignCombine(this, None, mut patt_a),
            DefineRule::CombineOnly(_, CombineRule::Interleave, patt_b),
        )
        | (
            DefineRule::CombineOnly(this, CombineRule::Interleave, mut patt_a),
            DefineRule::AssignCombine(_, None, patt_b),
        ) => {
            let result = if let Pattern::Interleave(_) = patt_a {
                append_interleave(&mut patt_a, patt_b);
                patt_a
            } else {
                Pattern::Interleave(vec![patt_a, patt_b])
            };
            Ok(DefineRule::AssignCombine(
                this,
                Some(CombineRule::Interleave),
                result,
            ))
        }
        // the remaining combinations mix choice and interleave
        (a, b) => {
            let e = SchemaError::ConflictingCombine {
                name: name.to_string(),
                this_span: *b.span(),
                that_span: *a.span(),
            };
            Err((e, a))
        }
    }
}

pub struct Compiler<FS: Files> {
    loaded: HashMap<PathBuf, (Arc<codemap::File>, Rc<types::Schema>)>,
    codemap: CodeMap,
    fs: FS,
    datatype_compiler: datatype::Compiler,
    errors: Vec<SchemaError>,
    warnings: Vec<SchemaWarning>,
}

impl Default for Compiler<FsFiles> {
    fn default() -> Self {
        Self::new(FsFiles)
    }
}

impl<FS: Files> Compiler<FS> {
    pub fn new(fs: FS) -> Compiler<FS> {
        Compiler {
            loaded: HashMap::default(),
            codemap: CodeMap::default(),
            fs,
            datatype_compiler: datatype::Compiler::default(),
            errors: Vec::new(),
            warnings: Vec::new(),
        }
    }

    pub fn compile(&mut self, name: &Path) -> Result<CompiledGrammar, SchemaError> {
        let (file, schema) = self.get_schema(name)?;
        let ctx = Context::new_root(file.clone());
        self.compile_schema(&ctx, &schema);
        self.finalize_scope(&ctx);
        let start = ctx
            .get_ref("start")
            .ok_or(SchemaError::StartRuleNotDefined { span: file.span })?;
        if let Some(rule) = start.borrow().as_ref() {
            // unguarded recursion makes the pattern graph unusable, so it is
            // fatal rather than accumulated
            restrictions::check_recursion(rule)?;
            restrictions::check_restrictions(rule, &mut self.errors);
        }
        Ok(CompiledGrammar {
            start,
            errors: std::mem::take(&mut self.errors),
            warnings: std::mem::take(&mut self.warnings),
        })
    }

    fn error(&mut self, e: SchemaError) -> Pattern {
        self.errors.push(e);
        Pattern::NotAllowed
    }

    #[inline(never)]
    fn get_schema(&mut self, name: &Path) -> Result<(Arc<codemap::File>, Rc<types::Schema>), SchemaError> {
        if let Some((f, s)) = self.loaded.get(name) {
            return Ok((f.clone(), s.clone()));
        }
        let data = self.fs.load(name)?;
        let file = self
            .codemap
            .add_file(name.to_string_lossy().to_string(), data);
        let parsed = xml::parse(file.source()).map_err(|e| {
            let span = e.span();
            SchemaError::XmlParse(
                file.span.subspan(span.start as u64, span.end as u64),
                format!("{:?}", e),
            )
        })?;
        for e in parsed.errors {
            let span = e.span();
            self.errors.push(SchemaError::Syntax(
                file.span.subspan(span.start as u64, span.end as u64),
                format!("{:?}", e),
            ));
        }
        for w in parsed.warnings {
            match w {
                xml::Warning::WrongUriVersion { span, found } => {
                    self.warnings.push(SchemaWarning::WrongGrammarVersion {
                        span: file.span.subspan(span.start as u64, span.end as u64),
                        found,
                    })
                }
            }
        }
        let schema = Rc::new(parsed.schema);
        self.loaded
            .insert(name.to_path_buf(), (file.clone(), schema.clone()));
        Ok((file, schema))
    }

    fn compile_schema(&mut self, ctx: &Context, schema: &types::Schema) {
        match &schema.pattern_or_grammar {
            types::PatternOrGrammar::Pattern(p) => {
                if let Context::Include { .. } = ctx {
                    // files pulled in by include must have a top level 'grammar'
                    if let types::Pattern::Grammar(grammar) = p {
                        self.compile_grammar_contents(ctx, &grammar.content[..]);
                    } else {
                        self.errors.push(SchemaError::IncludedFileMustBeGrammar {
                            span: ctx.convert_span(&(0..0)),
                        });
                    }
                } else {
                    let rule = self.compile_pattern(ctx, p);
                    let span = ctx.convert_span(&(0..0));
                    if let Err(e) =
                        ctx.define("start", DefineRule::AssignCombine(span, None, rule))
                    {
                        self.errors.push(e);
                    }
                }
            }
            types::PatternOrGrammar::Grammar(types::GrammarPattern { ref content, .. }) => {
                self.compile_grammar_contents(ctx, &content[..]);
            }
        }
    }

    fn compile_grammar_contents(&mut self, ctx: &Context, content: &[types::GrammarContent]) {
        for item in content {
            self.compile_grammar_content_item(ctx, item);
        }
    }

    fn compile_grammar_content_item(&mut self, ctx: &Context, item: &types::GrammarContent) {
        match item {
            types::GrammarContent::Define(d) => {
                self.compile_define(ctx, &d.span, &d.name.1, d.combine, &d.pattern)
            }
            types::GrammarContent::Start(s) => {
                self.compile_define(ctx, &s.span, "start", s.combine, &s.pattern)
            }
            types::GrammarContent::Div(content) => self.compile_grammar_contents(ctx, content),
            types::GrammarContent::Include(inc) => self.compile_include(ctx, inc),
        }
    }

    fn compile_define(
        &mut self,
        ctx: &Context,
        span: &types::Span,
        id: &str,
        combine: Option<types::Combine>,
        pattern: &types::Pattern,
    ) {
        let def_ctx = ctx.new_define(id);
        let rule = self.compile_pattern(&def_ctx, pattern);
        let span = ctx.convert_span(span);
        let new_rule = match combine {
            None => DefineRule::AssignCombine(span, None, rule),
            Some(types::Combine::Choice) => DefineRule::CombineOnly(
                span,
                CombineRule::Choice,
                Pattern::Choice(vec![rule]),
            ),
            Some(types::Combine::Interleave) => DefineRule::CombineOnly(
                span,
                CombineRule::Interleave,
                Pattern::Interleave(vec![rule]),
            ),
        };
        if let Err(e) = ctx.define(id, new_rule) {
            self.errors.push(e);
        }
    }

    fn compile_include(&mut self, ctx: &Context, inc: &types::Include) {
        let path = Path::new(ctx.file().name())
            .parent()
            .unwrap_or_else(|| Path::new(""))
            .join(&inc.href.1);
        let span = ctx.convert_span(&inc.span);
        let (file, schema) = match self.get_schema(&path) {
            Ok(x) => x,
            Err(e) => {
                self.errors
                    .push(SchemaError::IncludeError(span, Box::new(e)));
                return;
            }
        };
        let include_span = file.span;
        let inc_ctx = match ctx.new_include(span, file) {
            Ok(c) => c,
            Err(e) => {
                // recursive inclusion; report and do not descend
                self.errors.push(e);
                return;
            }
        };

        // definitions inside the include element override the included file;
        // they are compiled into the enclosing scope and marked as requiring
        // replacement before the included grammar is processed
        {
            let override_ctx = inc_ctx.new_inc_overrides();
            for item in &inc.content {
                self.compile_include_content_item(&override_ctx, item);
            }
        }

        self.compile_schema(&inc_ctx, &schema);

        if let Context::Include { overrides, .. } = &inc_ctx {
            for (name, o) in overrides.borrow().iter() {
                if o.status == Replacement::Require {
                    self.errors.push(if name == "start" {
                        SchemaError::MissingStartReplacement {
                            override_span: o.span,
                            include_span,
                        }
                    } else {
                        SchemaError::MissingDefineReplacement {
                            name: name.clone(),
                            override_span: o.span,
                            include_span,
                        }
                    });
                }
            }
        }
    }

    fn compile_include_content_item(&mut self, ctx: &Context, item: &types::IncludeContent) {
        match item {
            types::IncludeContent::Define(d) => {
                self.compile_define(ctx, &d.span, &d.name.1, d.combine, &d.pattern)
            }
            types::IncludeContent::Start(s) => {
                self.compile_define(ctx, &s.span, "start", s.combine, &s.pattern)
            }
            types::IncludeContent::Div(content) => {
                for item in content {
                    self.compile_include_content_item(ctx, item);
                }
            }
        }
    }

    fn compile_pattern(&mut self, ctx: &Context, pattern: &types::Pattern) -> Pattern {
        match pattern {
            types::Pattern::Element(e) => self.compile_element(ctx, e),
            types::Pattern::Attribute(a) => self.compile_attribute(ctx, a),
            types::Pattern::Group(_, v) => self.compile_group(ctx, v),
            types::Pattern::Interleave(_, v) => self.compile_interleave(ctx, v),
            types::Pattern::Choice(_, v) => self.compile_choice(ctx, v),
            types::Pattern::Optional(p) => {
                Pattern::Optional(Box::new(self.compile_pattern(ctx, p)))
            }
            types::Pattern::ZeroOrMore(p) => {
                Pattern::ZeroOrMore(Box::new(self.compile_pattern(ctx, p)))
            }
            types::Pattern::OneOrMore(p) => {
                Pattern::OneOrMore(Box::new(self.compile_pattern(ctx, p)))
            }
            types::Pattern::List(_, p) => Pattern::List(Box::new(self.compile_pattern(ctx, p))),
            types::Pattern::Mixed(p) => Pattern::Mixed(Box::new(self.compile_pattern(ctx, p))),
            types::Pattern::Ref(id) => self.compile_ref(ctx, id),
            types::Pattern::ParentRef(id) => self.compile_parent_ref(ctx, id),
            types::Pattern::Empty => Pattern::Empty,
            types::Pattern::Text => Pattern::Text,
            types::Pattern::NotAllowed => Pattern::NotAllowed,
            types::Pattern::ExternalRef(e) => self.compile_external(ctx, e),
            types::Pattern::Grammar(g) => self.compile_grammar_pattern(ctx, g),
            types::Pattern::Data(d) => self.compile_data(ctx, d),
            types::Pattern::Value(v) => self.compile_value(ctx, v),
        }
    }

    fn compile_element(&mut self, ctx: &Context, element: &types::ElementPattern) -> Pattern {
        let name_class = compile_nameclass(&element.name_class);
        let el_ctx = match ctx.new_element(ctx.convert_span(&element.span)) {
            Ok(c) => c,
            Err(e) => return self.error(e),
        };
        Pattern::Element(
            name_class,
            Box::new(self.compile_pattern(&el_ctx, &element.pattern)),
        )
    }

    fn compile_attribute(&mut self, ctx: &Context, attribute: &types::AttributePattern) -> Pattern {
        let name_class = compile_nameclass(&attribute.name_class);
        let att_ctx = ctx.new_attribute(ctx.convert_span(&attribute.span));
        Pattern::Attribute(
            name_class,
            Box::new(self.compile_pattern(&att_ctx, &attribute.pattern)),
        )
    }

    fn compile_group(&mut self, ctx: &Context, parts: &[types::Pattern]) -> Pattern {
        let mut out = Vec::new();
        for p in parts {
            match self.compile_pattern(ctx, p) {
                Pattern::Group(mut v) => out.append(&mut v),
                other => out.push(other),
            }
        }
        Pattern::Group(out)
    }

    fn compile_interleave(&mut self, ctx: &Context, parts: &[types::Pattern]) -> Pattern {
        let mut out = Vec::new();
        for p in parts {
            match self.compile_pattern(ctx, p) {
                Pattern::Interleave(mut v) => out.append(&mut v),
                other => out.push(other),
            }
        }
        Pattern::Interleave(out)
    }

    fn compile_choice(&mut self, ctx: &Context, parts: &[types::Pattern]) -> Pattern {
        let mut out = Vec::new();
        for p in parts {
            match self.compile_pattern(ctx, p) {
                Pattern::Choice(mut v) => out.append(&mut v),
                other => out.push(other),
            }
        }
        Pattern::Choice(out)
    }

    fn compile_ref(&mut self, ctx: &Context, reference: &types::Identifier) -> Pattern {
        let span = ctx.convert_span(&reference.0);
        match ctx.acquire_ref(reference) {
            Ok(r) => Pattern::Ref(span, reference.1.clone(), r),
            Err(e) => self.error(e),
        }
    }

    fn compile_parent_ref(&mut self, ctx: &Context, reference: &types::Identifier) -> Pattern {
        let span = ctx.convert_span(&reference.0);
        match ctx.acquire_parent_ref(reference) {
            Ok(r) => Pattern::Ref(span, reference.1.clone(), r),
            Err(e) => self.error(e),
        }
    }

    fn compile_external(&mut self, ctx: &Context, external: &types::ExternalPattern) -> Pattern {
        let path = Path::new(ctx.file().name())
            .parent()
            .unwrap_or_else(|| Path::new(""))
            .join(&external.href.1);
        let span = ctx.convert_span(&external.span);
        let (file, schema) = match self.get_schema(&path) {
            Ok(x) => x,
            Err(e) => {
                return self.error(SchemaError::IncludeError(span, Box::new(e)));
            }
        };
        let file_span = file.span;
        let inc_ctx = match ctx.new_include(span, file) {
            Ok(c) => c,
            Err(e) => return self.error(e),
        };
        match &schema.pattern_or_grammar {
            types::PatternOrGrammar::Pattern(p) => self.compile_pattern(&inc_ctx, p),
            types::PatternOrGrammar::Grammar(g) => {
                let child_ctx = inc_ctx.new_grammar();
                self.compile_grammar_contents(&child_ctx, &g.content[..]);
                self.finalize_scope(&child_ctx);
                self.take_start(&child_ctx, file_span)
            }
        }
    }

    fn compile_grammar_pattern(&mut self, ctx: &Context, grammar: &types::GrammarPattern) -> Pattern {
        let child_ctx = ctx.new_grammar();
        self.compile_grammar_contents(&child_ctx, &grammar.content[..]);
        self.finalize_scope(&child_ctx);
        self.take_start(&child_ctx, ctx.convert_span(&grammar.span))
    }

    /// Extracts the start pattern from a finished grammar scope, splicing it
    /// in place of the grammar element
    fn take_start(&mut self, ctx: &Context, span: codemap::Span) -> Pattern {
        match ctx.get_ref("start") {
            Some(r) => match r.borrow_mut().take() {
                Some(DefineRule::AssignCombine(_, _, p))
                | Some(DefineRule::CombineOnly(_, _, p)) => p,
                None => self.error(SchemaError::StartRuleNotDefined { span }),
            },
            None => self.error(SchemaError::StartRuleNotDefined { span }),
        }
    }

    /// End-of-scope scan: any definition name with no resolved pattern is
    /// replaced by NotAllowed and reported
    fn finalize_scope(&mut self, ctx: &Context) {
        for (name, cell) in ctx.ref_iter() {
            let mut r = cell.borrow_mut();
            if r.is_none() {
                self.errors.push(SchemaError::UndefinedReference {
                    span: ctx.file().span.subspan(0, 0),
                    identifier: name,
                });
                *r = Some(DefineRule::AssignCombine(
                    ctx.file().span.subspan(0, 0),
                    None,
                    Pattern::NotAllowed,
                ));
            }
        }
    }

    fn compile_data(&mut self, ctx: &Context, data: &types::DataPattern) -> Pattern {
        let key = compile_key(&data.key);
        let except = data
            .except
            .as_ref()
            .map(|e| Box::new(self.compile_pattern(ctx, e)));
        match self
            .datatype_compiler
            .datatype_name(&data.library, &data.name, &data.params)
        {
            Ok(datatype) => Pattern::Data {
                datatype,
                except,
                key,
            },
            Err(e) => {
                // fall back to the built-in string datatype so the rest of
                // the grammar can still be checked
                self.datatype_error(ctx, e);
                Pattern::Data {
                    datatype: self.datatype_compiler.fallback_string(),
                    except,
                    key,
                }
            }
        }
    }

    fn compile_value(&mut self, ctx: &Context, value: &types::ValuePattern) -> Pattern {
        let key = compile_key(&value.key);
        match self.datatype_compiler.datatype_value(
            &value.library,
            value.name.as_ref(),
            &value.span,
            &value.value,
        ) {
            Ok(datatype) => Pattern::Value { datatype, key },
            Err(e) => {
                self.datatype_error(ctx, e);
                Pattern::Data {
                    datatype: self.datatype_compiler.fallback_string(),
                    except: None,
                    key,
                }
            }
        }
    }

    fn datatype_error(&mut self, ctx: &Context, e: datatype::Errors) {
        use datatype::{builtin, xsd, Errors};
        let err = match e {
            Errors::UnsupportedDatatypeLibrary { span, namespace } => {
                SchemaError::UnsupportedDatatypeLibrary {
                    span: ctx.convert_span(&span),
                    namespace,
                }
            }
            Errors::Builtin(builtin::Error::ParamNotAllowed { span, name }) => {
                SchemaError::InvalidDatatypeParams {
                    span: ctx.convert_span(&span),
                    detail: format!("parameter {:?} not allowed for built-in datatype", name),
                }
            }
            Errors::Builtin(builtin::Error::DatatypeNameUnknown { span, name }) => {
                SchemaError::UnrecognizedDatatype {
                    span: ctx.convert_span(&span),
                    name,
                }
            }
            Errors::Xsd(xsd::XsdDatatypeError::UnsupportedDatatype { span, name }) => {
                SchemaError::UnrecognizedDatatype {
                    span: ctx.convert_span(&span),
                    name,
                }
            }
            Errors::Xsd(xsd::XsdDatatypeError::InvalidValueOfType { span, type_name }) => {
                SchemaError::InvalidValue {
                    span: ctx.convert_span(&span),
                    type_name: type_name.to_string(),
                }
            }
            Errors::Xsd(xsd::XsdDatatypeError::Facet { type_name, facet }) => {
                let (span, detail) = match facet {
                    xsd::FacetError::ConflictingFacet(what) => {
                        (0..0, format!("conflicting facet: {}", what))
                    }
                    xsd::FacetError::InvalidInt(span, msg) => {
                        (span, format!("invalid integer value: {}", msg))
                    }
                    xsd::FacetError::InvalidPattern(span, err) => {
                        (span, format!("invalid pattern value: {}", err))
                    }
                    xsd::FacetError::InvalidFacet(span, name) => {
                        (span, format!("invalid facet for type: {}", name))
                    }
                };
                SchemaError::InvalidDatatypeParams {
                    span: ctx.convert_span(&span),
                    detail: format!("{} ({})", detail, type_name),
                }
            }
        };
        self.errors.push(err);
    }

    pub fn dump_diagnostic(&self, err: &SchemaError) {
        let mut emitter = codemap_diagnostic::Emitter::stderr(
            codemap_diagnostic::ColorConfig::Always,
            Some(&self.codemap),
        );
        let d = self.diagnostic(err);
        emitter.emit(&[d]);
    }

    pub fn dump_warning(&self, warning: &SchemaWarning) {
        let mut emitter = codemap_diagnostic::Emitter::stderr(
            codemap_diagnostic::ColorConfig::Always,
            Some(&self.codemap),
        );
        let d = self.warning_diagnostic(warning);
        emitter.emit(&[d]);
    }

    pub fn warning_diagnostic(&self, warning: &SchemaWarning) -> codemap_diagnostic::Diagnostic {
        match warning {
            SchemaWarning::WrongGrammarVersion { span, found } => codemap_diagnostic::Diagnostic {
                level: codemap_diagnostic::Level::Warning,
                message: format!(
                    "schema declares RELAX NG version {:?}; treating it as 1.0",
                    found
                ),
                code: None,
                spans: vec![codemap_diagnostic::SpanLabel {
                    span: *span,
                    style: codemap_diagnostic::SpanStyle::Primary,
                    label: None,
                }],
            },
        }
    }

    pub fn diagnostic(&self, err: &SchemaError) -> codemap_diagnostic::Diagnostic {
        use codemap_diagnostic::{Diagnostic, Level, SpanLabel, SpanStyle};
        fn primary(span: codemap::Span, label: Option<String>) -> SpanLabel {
            SpanLabel {
                span,
                style: SpanStyle::Primary,
                label,
            }
        }
        fn secondary(span: codemap::Span, label: Option<String>) -> SpanLabel {
            SpanLabel {
                span,
                style: SpanStyle::Secondary,
                label,
            }
        }
        fn diag(message: String, spans: Vec<SpanLabel>) -> Diagnostic {
            Diagnostic {
                level: Level::Error,
                message,
                code: None,
                spans,
            }
        }
        match err {
            SchemaError::Io(path, err) => diag(
                format!("problem loading {:?}: {:?}", path, err.kind()),
                vec![],
            ),
            SchemaError::IncludeError(span, inner) => {
                let mut d = self.diagnostic(inner);
                let style = if d.spans.is_empty() {
                    SpanStyle::Primary
                } else {
                    SpanStyle::Secondary
                };
                d.spans.push(SpanLabel {
                    span: *span,
                    style,
                    label: Some("as included here".to_owned()),
                });
                d
            }
            SchemaError::XmlParse(span, msg) => {
                diag(format!("schema parsing failed: {}", msg), vec![primary(*span, None)])
            }
            SchemaError::Syntax(span, msg) => {
                diag(format!("schema syntax error: {}", msg), vec![primary(*span, None)])
            }
            SchemaError::DuplicateDefinition {
                name,
                duplicate,
                original,
            } => diag(
                format!("duplicate definition of {:?}", name),
                vec![
                    primary(*duplicate, Some("duplicated here".to_string())),
                    secondary(*original, Some("first defined here".to_string())),
                ],
            ),
            SchemaError::UndefinedReference { span, identifier } => diag(
                format!("reference to undefined name {:?}", identifier),
                vec![primary(*span, None)],
            ),
            SchemaError::StartRuleNotDefined { span } => diag(
                "grammar is missing a start rule".to_string(),
                vec![primary(*span, Some("needs a 'start' definition".to_string()))],
            ),
            SchemaError::ConflictingCombine {
                name,
                this_span,
                that_span,
            } => diag(
                format!("definitions of {:?} mix combine=\"choice\" and combine=\"interleave\"", name),
                vec![
                    primary(*this_span, Some("defined here with one combine mode".to_string())),
                    secondary(
                        *that_span,
                        Some("previously defined here with a different combine mode".to_string()),
                    ),
                ],
            ),
            SchemaError::NoParentAvailable(span) => diag(
                "parentRef is not available in this context".to_string(),
                vec![primary(*span, Some("no parent grammar scope here".to_string()))],
            ),
            SchemaError::RecursiveReference { name, span } => diag(
                format!("illegal recursive reference to {:?}", name),
                vec![primary(*span, Some("not guarded by an element pattern".to_string()))],
            ),
            SchemaError::RecursiveInclude { name, span } => diag(
                format!("the resource {:?} includes itself recursively", name),
                vec![primary(*span, Some("remove this recursive inclusion".to_string()))],
            ),
            SchemaError::IncludedFileMustBeGrammar { span } => diag(
                "included files must have a top-level 'grammar' element".to_string(),
                vec![primary(*span, None)],
            ),
            SchemaError::ElementAsChildOfAttribute {
                attribute_span,
                element_span,
            } => diag(
                "an element pattern may not appear within an attribute pattern".to_string(),
                vec![
                    primary(*element_span, Some("remove this element".to_string())),
                    secondary(*attribute_span, Some("in this attribute's body".to_string())),
                ],
            ),
            SchemaError::MissingDefineReplacement {
                override_span,
                include_span,
                name,
            } => diag(
                format!(
                    "override {:?} has no corresponding definition in the included grammar",
                    name
                ),
                vec![
                    primary(*override_span, Some("either remove this override...".to_string())),
                    secondary(
                        *include_span,
                        Some(format!("...or define {:?} in this grammar", name)),
                    ),
                ],
            ),
            SchemaError::MissingStartReplacement {
                override_span,
                include_span,
            } => diag(
                "start override has no corresponding start in the included grammar".to_string(),
                vec![
                    primary(*override_span, Some("either remove this override...".to_string())),
                    secondary(
                        *include_span,
                        Some("...or add a start definition to this grammar".to_string()),
                    ),
                ],
            ),
            SchemaError::UnsupportedDatatypeLibrary { span, namespace } => diag(
                format!("unsupported datatype library {:?}; using the string datatype instead", namespace),
                vec![primary(*span, None)],
            ),
            SchemaError::UnrecognizedDatatype { span, name } => diag(
                format!("unrecognized datatype {:?}; using the string datatype instead", name),
                vec![primary(*span, None)],
            ),
            SchemaError::InvalidDatatypeParams { span, detail } => diag(
                format!("invalid datatype parameters: {}", detail),
                vec![primary(*span, None)],
            ),
            SchemaError::InvalidValue { span, type_name } => diag(
                format!("value is not valid for datatype {:?}", type_name),
                vec![primary(*span, None)],
            ),
            SchemaError::RestrictionViolation { span, key } => diag(
                format!("schema restriction violated: {}", key),
                vec![primary(*span, None)],
            ),
        }
    }
}

fn compile_key(key: &Option<types::KeyUse>) -> Option<KeyUse> {
    key.as_ref().map(|k| match k {
        types::KeyUse::Key(n) => KeyUse::Key(n.1.clone()),
        types::KeyUse::KeyRef(n) => KeyUse::KeyRef(n.1.clone()),
    })
}

fn compile_nameclass(nc: &types::NameClass) -> NameClass {
    match nc {
        types::NameClass::Named {
            namespace_uri,
            name,
            ..
        } => NameClass::named(namespace_uri.clone(), name.clone()),
        types::NameClass::NsName {
            namespace_uri,
            except,
            ..
        } => NameClass::ns_name(
            namespace_uri.clone(),
            except.as_ref().map(|e| compile_nameclass(e)),
        ),
        types::NameClass::AnyName { except, .. } => {
            NameClass::any_name(except.as_ref().map(|e| compile_nameclass(e)))
        }
        types::NameClass::Choice(a, b) => {
            NameClass::alt(compile_nameclass(a), compile_nameclass(b))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    struct OneFile(&'static str);
    impl Files for OneFile {
        fn load(&self, name: &Path) -> Result<String, SchemaError> {
            match name.to_str().unwrap() {
                "main.rng" => Ok(self.0.to_string()),
                other => Err(SchemaError::Io(
                    PathBuf::from(other),
                    io::Error::from(io::ErrorKind::NotFound),
                )),
            }
        }
    }

    struct ManyFiles(&'static [(&'static str, &'static str)]);
    impl Files for ManyFiles {
        fn load(&self, name: &Path) -> Result<String, SchemaError> {
            let name = name.to_str().unwrap();
            self.0
                .iter()
                .find(|(n, _)| *n == name)
                .map(|(_, content)| content.to_string())
                .ok_or_else(|| {
                    SchemaError::Io(
                        PathBuf::from(name),
                        io::Error::from(io::ErrorKind::NotFound),
                    )
                })
        }
    }

    fn compile_one(schema: &'static str) -> CompiledGrammar {
        let mut c = Compiler::new(OneFile(schema));
        c.compile(Path::new("main.rng")).expect("compile failed")
    }

    #[test]
    fn refs() {
        let g = compile_one(
            r#"<grammar xmlns="http://relaxng.org/ns/structure/1.0">
                 <start><ref name="foo"/></start>
                 <define name="foo">
                   <element name="x"><choice><ref name="foo"/><empty/></choice></element>
                 </define>
               </grammar>"#,
        );
        assert!(g.errors.is_empty());
        let s = g.start.borrow();
        let start = s.as_ref().unwrap().pattern();
        assert_matches!(start, Pattern::Ref(_span, _name, PatRef(ref1)) => {
            assert_matches!(ref1.borrow().as_ref(), Some(DefineRule::AssignCombine(_, _, patt)) => {
                assert_matches!(patt, Pattern::Element(_nc, content) => {
                    assert_matches!(**content, Pattern::Choice(ref parts) => {
                        assert_matches!(parts[0], Pattern::Ref(_, _, PatRef(ref ref2)) => {
                            assert!(Rc::ptr_eq(ref1, ref2));
                        })
                    })
                })
            })
        });
    }

    #[test]
    fn combine_choice() {
        let g = compile_one(
            r#"<grammar xmlns="http://relaxng.org/ns/structure/1.0">
                 <start><ref name="a"/></start>
                 <define name="a" combine="choice"><element name="x"><empty/></element></define>
                 <define name="a" combine="choice"><element name="y"><empty/></element></define>
               </grammar>"#,
        );
        assert!(g.errors.is_empty());
        let a = {
            let s = g.start.borrow();
            match s.as_ref().unwrap().pattern() {
                Pattern::Ref(_, _, PatRef(cell)) => cell.clone(),
                other => panic!("unexpected {:?}", other),
            }
        };
        assert_matches!(a.borrow().as_ref(), Some(DefineRule::CombineOnly(_, CombineRule::Choice, Pattern::Choice(parts))) => {
            assert_eq!(parts.len(), 2);
        });
    }

    #[test]
    fn duplicate_definition_reported_and_continues() {
        let g = compile_one(
            r#"<grammar xmlns="http://relaxng.org/ns/structure/1.0">
                 <start><ref name="a"/></start>
                 <define name="a"><element name="x"><empty/></element></define>
                 <define name="a"><element name="y"><empty/></element></define>
                 <define name="b"><ref name="undefined"/></define>
               </grammar>"#,
        );
        // both the duplicate and the undefined reference are reported; the
        // build continues past the first error.  The unused definition "b"
        // still gets its reference scanned at finalization.
        assert!(g
            .errors
            .iter()
            .any(|e| matches!(e, SchemaError::DuplicateDefinition { name, .. } if name == "a")));
        assert!(g
            .errors
            .iter()
            .any(|e| matches!(e, SchemaError::UndefinedReference { identifier, .. } if identifier == "undefined")));
    }

    #[test]
    fn conflicting_combine() {
        let g = compile_one(
            r#"<grammar xmlns="http://relaxng.org/ns/structure/1.0">
                 <start><ref name="a"/></start>
                 <define name="a" combine="choice"><element name="x"><empty/></element></define>
                 <define name="a" combine="interleave"><element name="y"><empty/></element></define>
               </grammar>"#,
        );
        assert!(g
            .errors
            .iter()
            .any(|e| matches!(e, SchemaError::ConflictingCombine { name, .. } if name == "a")));
    }

    #[test]
    fn undefined_reference_becomes_not_allowed() {
        let g = compile_one(
            r#"<grammar xmlns="http://relaxng.org/ns/structure/1.0">
                 <start><ref name="nowhere"/></start>
               </grammar>"#,
        );
        assert!(g
            .errors
            .iter()
            .any(|e| matches!(e, SchemaError::UndefinedReference { identifier, .. } if identifier == "nowhere")));
        let s = g.start.borrow();
        assert_matches!(s.as_ref().unwrap().pattern(), Pattern::Ref(_, _, PatRef(cell)) => {
            assert_matches!(cell.borrow().as_ref(), Some(DefineRule::AssignCombine(_, _, Pattern::NotAllowed)));
        });
    }

    #[test]
    fn include_with_override() {
        let g = {
            let mut c = Compiler::new(ManyFiles(&[
                (
                    "main.rng",
                    r#"<grammar xmlns="http://relaxng.org/ns/structure/1.0">
                         <start><ref name="blocks"/></start>
                         <include href="lib.rng">
                           <define name="inline"><text/></define>
                         </include>
                       </grammar>"#,
                ),
                (
                    "lib.rng",
                    r#"<grammar xmlns="http://relaxng.org/ns/structure/1.0">
                         <define name="blocks"><element name="b"><ref name="inline"/></element></define>
                         <define name="inline"><element name="i"><text/></element></define>
                       </grammar>"#,
                ),
            ]));
            c.compile(Path::new("main.rng")).expect("compile failed")
        };
        assert!(g.errors.is_empty(), "unexpected: {:?}", g.errors);
        // "inline" must resolve to the override (text), not the included definition
        let s = g.start.borrow();
        let blocks = match s.as_ref().unwrap().pattern() {
            Pattern::Ref(_, _, PatRef(cell)) => cell.clone(),
            other => panic!("unexpected {:?}", other),
        };
        assert_matches!(blocks.borrow().as_ref(), Some(rule) => {
            assert_matches!(rule.pattern(), Pattern::Element(_, content) => {
                assert_matches!(&**content, Pattern::Ref(_, _, PatRef(inline)) => {
                    assert_matches!(inline.borrow().as_ref(), Some(inline_rule) => {
                        assert_matches!(inline_rule.pattern(), Pattern::Text);
                    });
                });
            });
        });
    }

    #[test]
    fn include_override_requires_replacement() {
        let g = {
            let mut c = Compiler::new(ManyFiles(&[
                (
                    "main.rng",
                    r#"<grammar xmlns="http://relaxng.org/ns/structure/1.0">
                         <start><ref name="blocks"/></start>
                         <include href="lib.rng">
                           <define name="nonexistent"><text/></define>
                         </include>
                       </grammar>"#,
                ),
                (
                    "lib.rng",
                    r#"<grammar xmlns="http://relaxng.org/ns/structure/1.0">
                         <define name="blocks"><element name="b"><empty/></element></define>
                       </grammar>"#,
                ),
            ]));
            c.compile(Path::new("main.rng")).expect("compile failed")
        };
        assert!(g
            .errors
            .iter()
            .any(|e| matches!(e, SchemaError::MissingDefineReplacement { name, .. } if name == "nonexistent")));
    }

    #[test]
    fn recursive_include_terminates_with_error() {
        let g = {
            let mut c = Compiler::new(ManyFiles(&[
                (
                    "main.rng",
                    r#"<grammar xmlns="http://relaxng.org/ns/structure/1.0">
                         <start><element name="doc"><empty/></element></start>
                         <include href="b.rng"/>
                       </grammar>"#,
                ),
                (
                    "b.rng",
                    r#"<grammar xmlns="http://relaxng.org/ns/structure/1.0">
                         <include href="main.rng"/>
                       </grammar>"#,
                ),
            ]));
            c.compile(Path::new("main.rng")).expect("compile failed")
        };
        assert!(g
            .errors
            .iter()
            .any(|e| matches!(e, SchemaError::RecursiveInclude { .. })));
    }

    #[test]
    fn include_self_ref() {
        // the included file may reference names defined by the including
        // grammar, and the resulting graph shares one definition cell
        let g = {
            let mut c = Compiler::new(ManyFiles(&[
                (
                    "main.rng",
                    r#"<grammar xmlns="http://relaxng.org/ns/structure/1.0">
                         <start><ref name="blocks"/></start>
                         <include href="elements.rng"/>
                       </grammar>"#,
                ),
                (
                    "elements.rng",
                    r#"<grammar xmlns="http://relaxng.org/ns/structure/1.0">
                         <define name="blocks">
                           <element name="container"><optional><ref name="blocks"/></optional></element>
                         </define>
                       </grammar>"#,
                ),
            ]));
            c.compile(Path::new("main.rng")).expect("compile failed")
        };
        assert!(g.errors.is_empty(), "unexpected: {:?}", g.errors);
        let s = g.start.borrow();
        assert_matches!(s.as_ref().unwrap().pattern(), Pattern::Ref(_, _, PatRef(ref1)) => {
            assert_matches!(ref1.borrow().as_ref(), Some(DefineRule::AssignCombine(_, _, patt)) => {
                assert_matches!(patt, Pattern::Element(_nc, content) => {
                    assert_matches!(**content, Pattern::Optional(ref inner) => {
                        assert_matches!(**inner, Pattern::Ref(_, _, PatRef(ref ref2)) => {
                            assert!(Rc::ptr_eq(ref1, ref2));
                        })
                    })
                })
            })
        });
    }

    #[test]
    fn parent_ref_without_parent() {
        let g = compile_one(
            r#"<grammar xmlns="http://relaxng.org/ns/structure/1.0">
                 <start><parentRef name="up"/></start>
               </grammar>"#,
        );
        assert!(g
            .errors
            .iter()
            .any(|e| matches!(e, SchemaError::NoParentAvailable(_))));
    }

    #[test]
    fn parent_ref_resolves_one_scope_up() {
        let g = compile_one(
            r#"<grammar xmlns="http://relaxng.org/ns/structure/1.0">
                 <start><ref name="outer"/></start>
                 <define name="outer">
                   <element name="o">
                     <grammar>
                       <start><element name="i"><parentRef name="leaf"/></element></start>
                     </grammar>
                   </element>
                 </define>
                 <define name="leaf"><text/></define>
               </grammar>"#,
        );
        assert!(g.errors.is_empty(), "unexpected: {:?}", g.errors);
    }

    #[test]
    fn unknown_datatype_library_falls_back_to_string() {
        let g = compile_one(
            r#"<element name="e" xmlns="http://relaxng.org/ns/structure/1.0"
                        datatypeLibrary="urn:no-such-library">
                 <data type="custom"/>
               </element>"#,
        );
        assert!(g
            .errors
            .iter()
            .any(|e| matches!(e, SchemaError::UnsupportedDatatypeLibrary { namespace, .. } if namespace == "urn:no-such-library")));
        let s = g.start.borrow();
        assert_matches!(s.as_ref().unwrap().pattern(), Pattern::Element(_, content) => {
            assert_matches!(&**content, Pattern::Data { datatype, .. } => {
                assert_matches!(
                    datatype,
                    datatype::Datatypes::Builtin(datatype::builtin::BuiltinDatatype::String)
                );
            });
        });
    }

    #[test]
    fn element_inside_attribute_rejected() {
        let g = compile_one(
            r#"<element name="e" xmlns="http://relaxng.org/ns/structure/1.0">
                 <attribute name="a"><element name="bad"><empty/></element></attribute>
               </element>"#,
        );
        assert!(g
            .errors
            .iter()
            .any(|e| matches!(e, SchemaError::ElementAsChildOfAttribute { .. })));
    }

    #[test]
    fn unguarded_recursion_is_fatal() {
        let mut c = Compiler::new(OneFile(
            r#"<grammar xmlns="http://relaxng.org/ns/structure/1.0">
                 <start><ref name="a"/></start>
                 <define name="a"><optional><ref name="b"/></optional></define>
                 <define name="b"><ref name="a"/></define>
               </grammar>"#,
        ));
        assert_matches!(
            c.compile(Path::new("main.rng")),
            Err(SchemaError::RecursiveReference { .. })
        );
    }

    #[test]
    fn guarded_recursion_is_fine() {
        let g = compile_one(
            r#"<grammar xmlns="http://relaxng.org/ns/structure/1.0">
                 <start><ref name="a"/></start>
                 <define name="a"><element name="x"><optional><ref name="a"/></optional></element></define>
               </grammar>"#,
        );
        assert!(g.errors.is_empty(), "unexpected: {:?}", g.errors);
    }
}

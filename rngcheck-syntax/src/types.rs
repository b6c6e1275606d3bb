use std::ops::Range;

pub type Span = Range<usize>;

/// A parsed schema document: either a lone pattern at the root, or a
/// `grammar` element with its content.
#[derive(Debug, PartialEq)]
pub struct Schema {
    pub pattern_or_grammar: PatternOrGrammar,
}

#[derive(Debug, PartialEq)]
pub enum PatternOrGrammar {
    Pattern(Pattern),
    Grammar(GrammarPattern),
}

#[derive(Debug, PartialEq)]
pub enum Pattern {
    Element(ElementPattern),
    Attribute(AttributePattern),
    Group(Span, Vec<Pattern>),
    Interleave(Span, Vec<Pattern>),
    Choice(Span, Vec<Pattern>),
    Optional(Box<Pattern>),
    ZeroOrMore(Box<Pattern>),
    OneOrMore(Box<Pattern>),
    List(Span, Box<Pattern>),
    Mixed(Box<Pattern>),
    Ref(Identifier),
    ParentRef(Identifier),
    Empty,
    Text,
    NotAllowed,
    ExternalRef(ExternalPattern),
    Grammar(GrammarPattern),
    Data(DataPattern),
    Value(ValuePattern),
}

#[derive(Debug, PartialEq)]
pub struct ElementPattern {
    pub span: Span,
    pub name_class: NameClass,
    pub pattern: Box<Pattern>,
}

#[derive(Debug, PartialEq)]
pub struct AttributePattern {
    pub span: Span,
    pub name_class: NameClass,
    /// Defaults to `text` when the attribute element has no child pattern
    pub pattern: Box<Pattern>,
}

#[derive(Debug, PartialEq)]
pub struct ExternalPattern {
    pub span: Span,
    pub href: Href,
}

/// `data` pattern; the datatype library URI is already resolved from the
/// inherited `datatypeLibrary` attribute ("" selects the built-in library).
#[derive(Debug, PartialEq)]
pub struct DataPattern {
    pub span: Span,
    pub library: String,
    pub name: NcName,
    pub params: Vec<Param>,
    pub except: Option<Box<Pattern>>,
    pub key: Option<KeyUse>,
}

/// `value` pattern; a missing `type` attribute selects the built-in `token`
/// datatype regardless of the inherited library.
#[derive(Debug, PartialEq)]
pub struct ValuePattern {
    pub span: Span,
    pub library: String,
    pub name: Option<NcName>,
    pub value: String,
    pub key: Option<KeyUse>,
}

/// The draft-syntax `key="k"` / `keyRef="k"` attributes permitted on `data`
/// and `value` patterns.
#[derive(Debug, PartialEq, Clone)]
pub enum KeyUse {
    Key(NcName),
    KeyRef(NcName),
}

impl KeyUse {
    pub fn name(&self) -> &str {
        match self {
            KeyUse::Key(n) | KeyUse::KeyRef(n) => &n.1,
        }
    }
}

#[derive(Debug, PartialEq)]
pub struct Param(pub Span, pub NcName, pub String);

#[derive(Debug, PartialEq)]
pub struct GrammarPattern {
    pub span: Span,
    pub content: Vec<GrammarContent>,
}

#[derive(Debug, PartialEq)]
pub enum GrammarContent {
    Define(Define),
    Start(Start),
    Div(Vec<GrammarContent>),
    Include(Include),
}

#[derive(Debug, PartialEq)]
pub struct Define {
    pub span: Span,
    pub name: Identifier,
    pub combine: Option<Combine>,
    pub pattern: Pattern,
}

/// `start` is the reserved, unnamed definition; it follows the same combine
/// rules as named defines.
#[derive(Debug, PartialEq)]
pub struct Start {
    pub span: Span,
    pub combine: Option<Combine>,
    pub pattern: Pattern,
}

#[derive(Debug, PartialEq, Clone, Copy)]
pub enum Combine {
    Choice,
    Interleave,
}

#[derive(Debug, PartialEq)]
pub struct Include {
    pub span: Span,
    pub href: Href,
    pub content: Vec<IncludeContent>,
}

#[derive(Debug, PartialEq)]
pub enum IncludeContent {
    Define(Define),
    Start(Start),
    Div(Vec<IncludeContent>),
}

#[derive(Debug, PartialEq)]
pub struct Href(pub Span, pub String);

#[derive(Debug, PartialEq, Clone)]
pub struct Identifier(pub Span, pub String);

#[derive(Debug, PartialEq, Clone)]
pub struct NcName(pub Span, pub String);

/// Name classes with namespace prefixes already resolved against the xmlns
/// bindings in scope at the point of occurrence.
#[derive(Debug, PartialEq)]
pub enum NameClass {
    Named {
        span: Span,
        namespace_uri: String,
        name: String,
    },
    NsName {
        span: Span,
        namespace_uri: String,
        except: Option<Box<NameClass>>,
    },
    AnyName {
        span: Span,
        except: Option<Box<NameClass>>,
    },
    Choice(Box<NameClass>, Box<NameClass>),
}

impl NameClass {
    pub fn span(&self) -> Span {
        match self {
            NameClass::Named { span, .. }
            | NameClass::NsName { span, .. }
            | NameClass::AnyName { span, .. } => span.clone(),
            NameClass::Choice(a, _) => a.span(),
        }
    }
}

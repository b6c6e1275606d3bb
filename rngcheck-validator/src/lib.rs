//! Streaming RELAX NG validation over an XML token stream.
//!
//! [`Validator`] drives a [`session::Session`] from an
//! [`xmlparser::Tokenizer`]: it stacks open elements, resolves namespace
//! prefixes at the point of use, decodes entity references in character data,
//! and forwards element/attribute/text events.  Validation problems
//! accumulate as [`session::Diagnostic`] values carrying message keys and
//! byte spans; only malformed input (bad XML, undefined prefixes or
//! entities) aborts the run.

use rngcheck_model::model::{DefineRule, Name};
use session::{Diagnostic, DiagnosticKind, Session};
use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;
use xmlparser::{ElementEnd, EntityDefinition, StrSpan, Token, Tokenizer};

pub mod engine;
pub mod keys;
pub mod session;

const XML_URI: &str = "http://www.w3.org/XML/1998/namespace";

#[derive(Debug)]
pub enum ValidatorError<'a> {
    Xml(xmlparser::Error),
    UndefinedNamespacePrefix {
        prefix: StrSpan<'a>,
    },
    UndefinedEntity {
        name: &'a str,
        span: std::ops::Range<usize>,
    },
    InvalidOrUnclosedEntity {
        span: std::ops::Range<usize>,
    },
}

pub struct Validator<'a> {
    tokenizer: Tokenizer<'a>,
    stack: ElementStack<'a>,
    entity_definitions: HashMap<String, String>,
    session: Session,
    done: bool,
    last_pos: usize,
}

impl<'a> Validator<'a> {
    pub fn new(model: Rc<RefCell<Option<DefineRule>>>, tokenizer: Tokenizer<'a>) -> Validator<'a> {
        let mut entity_definitions = HashMap::default();
        entity_definitions.insert("lt".to_string(), "<".to_string());
        entity_definitions.insert("gt".to_string(), ">".to_string());
        entity_definitions.insert("amp".to_string(), "&".to_string());
        entity_definitions.insert("apos".to_string(), "'".to_string());
        entity_definitions.insert("quot".to_string(), "\"".to_string());
        Validator {
            tokenizer,
            stack: ElementStack::default(),
            entity_definitions,
            session: Session::new(&model),
            done: false,
            last_pos: 0,
        }
    }

    /// Processes the next token.  `Some(Err(_))` is a malformed-input error;
    /// validation problems are collected in [`Validator::diagnostics`]
    /// instead.  Returns `None` once the document (including the
    /// end-of-document checks) is finished.
    pub fn validate_next(&mut self) -> Option<Result<(), ValidatorError<'a>>> {
        match self.tokenizer.next() {
            Some(Ok(evt)) => Some(self.validate(evt)),
            Some(Err(err)) => Some(Err(ValidatorError::Xml(err))),
            None => {
                if !self.done {
                    self.done = true;
                    let span = self.last_pos..self.last_pos;
                    self.session.end_document(&span);
                    Some(Ok(()))
                } else {
                    None
                }
            }
        }
    }

    /// Runs the remaining tokens to completion, stopping at the first
    /// malformed-input error
    pub fn run(&mut self) -> Result<(), ValidatorError<'a>> {
        while let Some(step) = self.validate_next() {
            step?;
        }
        Ok(())
    }

    pub fn diagnostics(&self) -> &[Diagnostic] {
        self.session.diagnostics()
    }

    pub fn is_valid(&self) -> bool {
        self.session.is_valid()
    }

    fn validate(&mut self, evt: Token<'a>) -> Result<(), ValidatorError<'a>> {
        match evt {
            Token::ElementStart {
                prefix,
                local,
                span,
            } => {
                self.last_pos = span.end();
                self.stack.push(prefix, local);
            }
            Token::Attribute {
                prefix,
                local,
                value,
                span,
            } => {
                self.last_pos = span.end();
                self.stack.add_attr(prefix, local, value, span);
            }
            Token::ElementEnd { end, span } => {
                self.last_pos = span.end();
                let range = span.start()..span.end();
                match end {
                    ElementEnd::Open => {
                        let (name, attrs) = self.current_element_event()?;
                        self.session.start_element(&name, &attrs, &range);
                    }
                    ElementEnd::Empty => {
                        let (name, attrs) = self.current_element_event()?;
                        self.session.start_element(&name, &attrs, &range);
                        self.session.end_element(&name, &range);
                        self.stack.pop();
                    }
                    ElementEnd::Close(_, _) => {
                        let name = self.stack.current_element()?;
                        let name = Name::new(
                            name.namespace_uri.map(|s| s.as_str()).unwrap_or(""),
                            name.local_name.as_str(),
                        );
                        self.session.end_element(&name, &range);
                        self.stack.pop();
                    }
                }
            }
            Token::Text { text } => {
                self.last_pos = text.end();
                let range = text.start()..text.end();
                let decoded = self.decode_entities(text)?;
                self.session.characters(&decoded, &range);
            }
            Token::Cdata { text, span } => {
                self.last_pos = span.end();
                let range = text.start()..text.end();
                self.session.characters(text.as_str(), &range);
            }
            Token::EntityDeclaration {
                name, definition, ..
            } => {
                if let EntityDefinition::EntityValue(val) = definition {
                    self.entity_definitions
                        .insert(name.to_string(), val.to_string());
                }
                // external entity definitions cannot be resolved here; a
                // reference to one will be reported at its point of use
            }
            Token::Declaration { .. }
            | Token::DtdStart { .. }
            | Token::DtdEnd { .. }
            | Token::EmptyDtd { .. }
            | Token::Comment { .. }
            | Token::ProcessingInstruction { .. } => {}
        }
        Ok(())
    }

    fn current_element_event(
        &self,
    ) -> Result<(Name, Vec<(Name, String, std::ops::Range<usize>)>), ValidatorError<'a>> {
        let qname = self.stack.current_element()?;
        let name = Name::new(
            qname.namespace_uri.map(|s| s.as_str()).unwrap_or(""),
            qname.local_name.as_str(),
        );
        let attrs = self
            .stack
            .current_attributes()?
            .into_iter()
            .map(|a| {
                (
                    Name::new(
                        a.name.namespace_uri.map(|s| s.as_str()).unwrap_or(""),
                        a.name.local_name.as_str(),
                    ),
                    a.value.as_str().to_string(),
                    a.span.start()..a.span.end(),
                )
            })
            .collect();
        Ok((name, attrs))
    }

    fn decode_entities(&self, text: StrSpan<'a>) -> Result<String, ValidatorError<'a>> {
        let mut buffer = String::new();
        for val in parse_entities(text.start(), text.as_str()) {
            match val? {
                Txt::Text(_pos, val) => buffer.push_str(val),
                Txt::Entity(pos, name) => {
                    if let Some(txt) = self.entity_definitions.get(name) {
                        buffer.push_str(txt);
                    } else {
                        return Err(ValidatorError::UndefinedEntity {
                            name,
                            span: pos..pos + name.len(),
                        });
                    }
                }
                Txt::Char(_pos, val) => buffer.push(val),
            }
        }
        Ok(buffer)
    }

    /// Renders the accumulated validation diagnostics for display
    pub fn render_diagnostics(
        &self,
        name: String,
        source: String,
    ) -> (codemap::CodeMap, Vec<codemap_diagnostic::Diagnostic>) {
        let mut map = codemap::CodeMap::new();
        let file = map.add_file(name, source);
        let rendered = self
            .session
            .diagnostics()
            .iter()
            .map(|d| {
                let label = codemap_diagnostic::SpanLabel {
                    span: file
                        .span
                        .subspan(d.span.start as u64, d.span.end.max(d.span.start) as u64),
                    label: Some(describe(&d.kind)),
                    style: codemap_diagnostic::SpanStyle::Primary,
                };
                codemap_diagnostic::Diagnostic {
                    level: codemap_diagnostic::Level::Error,
                    message: format!("{}: {}", d.kind.message_key(), d.kind.args().join(" ")),
                    code: None,
                    spans: vec![label],
                }
            })
            .collect();
        (map, rendered)
    }

    /// Renders a malformed-input error for display
    pub fn render_error(
        &self,
        name: String,
        source: String,
        err: &ValidatorError,
    ) -> (codemap::CodeMap, Vec<codemap_diagnostic::Diagnostic>) {
        let mut map = codemap::CodeMap::new();
        let file = map.add_file(name, source);
        let mut diagnostics = vec![];
        match err {
            ValidatorError::Xml(err) => {
                diagnostics.push(codemap_diagnostic::Diagnostic {
                    level: codemap_diagnostic::Level::Error,
                    message: format!("{}", err),
                    code: None,
                    spans: vec![],
                });
            }
            ValidatorError::UndefinedNamespacePrefix { prefix } => {
                let label = codemap_diagnostic::SpanLabel {
                    span: file.span.subspan(prefix.start() as _, prefix.end() as _),
                    label: Some(format!(
                        "add an xmlns:{}=\"..\" attribute to define this prefix",
                        prefix.as_str()
                    )),
                    style: codemap_diagnostic::SpanStyle::Primary,
                };
                diagnostics.push(codemap_diagnostic::Diagnostic {
                    level: codemap_diagnostic::Level::Error,
                    message: format!("the prefix {:?} is not defined", prefix.as_str()),
                    code: None,
                    spans: vec![label],
                });
            }
            ValidatorError::UndefinedEntity { name, span } => {
                let label = codemap_diagnostic::SpanLabel {
                    span: file.span.subspan(span.start as _, span.end as _),
                    label: Some("undefined".to_string()),
                    style: codemap_diagnostic::SpanStyle::Primary,
                };
                diagnostics.push(codemap_diagnostic::Diagnostic {
                    level: codemap_diagnostic::Level::Error,
                    message: format!("the entity &{};  is not defined", name),
                    code: None,
                    spans: vec![label],
                });
            }
            ValidatorError::InvalidOrUnclosedEntity { span } => {
                let label = codemap_diagnostic::SpanLabel {
                    span: file.span.subspan(span.start as _, span.end as _),
                    label: None,
                    style: codemap_diagnostic::SpanStyle::Primary,
                };
                diagnostics.push(codemap_diagnostic::Diagnostic {
                    level: codemap_diagnostic::Level::Error,
                    message: "invalid or unclosed entity reference".to_string(),
                    code: None,
                    spans: vec![label],
                });
            }
        }
        (map, diagnostics)
    }

    /// A hint about what the validator expected at the current position
    pub fn explain(&self) -> String {
        self.session.describe_expected()
    }
}

fn describe(kind: &DiagnosticKind) -> String {
    match kind {
        DiagnosticKind::ImpossibleElement { name } => {
            format!("element {:?} not allowed here", name)
        }
        DiagnosticKind::UnfinishedElement => "element is missing required content".to_string(),
        DiagnosticKind::BadAttributeValue { name } => {
            format!("bad value for attribute {:?}", name)
        }
        DiagnosticKind::ImpossibleAttribute { name } => {
            format!("attribute {:?} not allowed here", name)
        }
        DiagnosticKind::RequiredAttributesMissing => "required attributes missing".to_string(),
        DiagnosticKind::TextNotAllowed => "text not allowed here".to_string(),
        DiagnosticKind::StringNotAllowed => "character data does not match".to_string(),
        DiagnosticKind::DocumentIncomplete => "document incomplete".to_string(),
        DiagnosticKind::DuplicateKey { key, value } => {
            format!("key {:?} already has a definition for {:?}", key, value)
        }
        DiagnosticKind::UndefinedKeyRef { key, value } => {
            format!("no definition of key {:?} for {:?}", key, value)
        }
        DiagnosticKind::InternalError => "internal validator error".to_string(),
    }
}

#[derive(Debug)]
enum Txt<'a> {
    Text(usize, &'a str),
    Entity(usize, &'a str),
    Char(usize, char),
}

fn parse_entities(pos: usize, text: &str) -> impl Iterator<Item = Result<Txt, ValidatorError>> {
    struct Entities<'a> {
        text: &'a str,
        pos: usize,
        offset: usize,
        in_entity: bool,
    }
    impl<'a> Iterator for Entities<'a> {
        type Item = Result<Txt<'a>, ValidatorError<'a>>;

        fn next(&mut self) -> Option<Self::Item> {
            if self.offset == self.text.len() {
                return None;
            }
            for (i, c) in self.text[self.offset..].char_indices() {
                if self.in_entity {
                    if c == ';' {
                        self.in_entity = false;
                        let text = &self.text[self.offset..self.offset + i];
                        let result = if let Some(text) = text.strip_prefix('#') {
                            numeric_entity(self.offset, text)
                        } else {
                            Ok(Txt::Entity(self.offset + self.pos, text))
                        };
                        self.offset += i + 1;
                        return Some(result);
                    }
                } else if c == '&' {
                    self.in_entity = true;
                    let result = Txt::Text(
                        self.offset + self.pos,
                        &self.text[self.offset..self.offset + i],
                    );
                    self.offset += i + 1;
                    return Some(Ok(result));
                }
            }
            if self.in_entity {
                Some(Err(ValidatorError::InvalidOrUnclosedEntity {
                    span: self.pos + self.offset - 1..self.pos + self.offset,
                }))
            } else {
                let result = Txt::Text(self.offset + self.pos, &self.text[self.offset..]);
                self.offset = self.text.len();
                Some(Ok(result))
            }
        }
    }
    fn numeric_entity(pos: usize, text: &str) -> Result<Txt, ValidatorError> {
        if text.is_empty() {
            return Err(ValidatorError::InvalidOrUnclosedEntity { span: pos..pos });
        }
        let c = if let Some(text) = text.strip_prefix('x') {
            let pos = pos + 1;
            if text.is_empty() {
                return Err(ValidatorError::InvalidOrUnclosedEntity { span: pos..pos });
            }
            u32::from_str_radix(text, 16)
                .map_err(|_e| ValidatorError::InvalidOrUnclosedEntity { span: pos..pos })?
        } else {
            text.parse()
                .map_err(|_e| ValidatorError::InvalidOrUnclosedEntity { span: pos..pos })?
        };
        Ok(Txt::Char(
            pos,
            std::char::from_u32(c)
                .ok_or(ValidatorError::InvalidOrUnclosedEntity { span: pos..pos })?,
        ))
    }
    Entities {
        text,
        pos,
        offset: 0,
        in_entity: false,
    }
}

#[derive(Copy, Clone, Debug)]
struct QualifiedName<'a> {
    namespace_uri: Option<StrSpan<'a>>,
    local_name: StrSpan<'a>,
}

#[derive(Copy, Clone, Debug)]
struct Attr<'a> {
    name: QualifiedName<'a>,
    value: StrSpan<'a>,
    span: StrSpan<'a>,
}

/// Open-element stack holding the namespace bindings and buffered attributes
/// of each element until its start tag closes
#[derive(Default)]
struct ElementStack<'a> {
    elements: Vec<ElementState<'a>>,
}

impl<'a> ElementStack<'a> {
    fn lookup_namespace_uri(&self, prefix: &str) -> Option<StrSpan<'a>> {
        self.elements
            .iter()
            .rev()
            .find_map(|elem| elem.lookup_namespace_uri(prefix))
    }

    fn try_lookup_namespace_uri(
        &self,
        prefix: StrSpan<'a>,
    ) -> Result<Option<StrSpan<'a>>, ValidatorError<'a>> {
        if prefix.as_str() == "xml" {
            return Ok(Some(StrSpan::from(XML_URI)));
        }
        if prefix.as_str() == "" {
            // the default namespace declaration, if any
            Ok(self.lookup_namespace_uri(""))
        } else {
            Ok(Some(self.lookup_namespace_uri(&prefix).ok_or(
                ValidatorError::UndefinedNamespacePrefix { prefix },
            )?))
        }
    }

    fn push(&mut self, prefix: StrSpan<'a>, local: StrSpan<'a>) {
        self.elements.push(ElementState {
            prefix,
            local,
            namespaces: vec![],
            attributes: vec![],
        })
    }

    fn pop(&mut self) {
        self.elements.pop();
    }

    fn add_attr(
        &mut self,
        prefix: StrSpan<'a>,
        local: StrSpan<'a>,
        value: StrSpan<'a>,
        span: StrSpan<'a>,
    ) {
        if prefix.as_str() == "xmlns" {
            self.elements.last_mut().unwrap().namespaces.push(Ns {
                prefix: local,
                namespace_uri: value,
            })
        } else if prefix.as_str() == "" && local.as_str() == "xmlns" {
            self.elements.last_mut().unwrap().namespaces.push(Ns {
                prefix,
                namespace_uri: value,
            })
        } else {
            self.elements
                .last_mut()
                .unwrap()
                .attributes
                .push(UnresolvedAttr {
                    prefix,
                    local,
                    value,
                    span,
                })
        }
    }

    fn current_element(&self) -> Result<QualifiedName<'a>, ValidatorError<'a>> {
        let curr = self.elements.last().unwrap();
        let namespace_uri = self.try_lookup_namespace_uri(curr.prefix)?;
        Ok(QualifiedName {
            namespace_uri,
            local_name: curr.local,
        })
    }

    fn current_attributes(&self) -> Result<Vec<Attr<'a>>, ValidatorError<'a>> {
        self.elements
            .last()
            .unwrap()
            .attributes
            .iter()
            .map(move |unresolved| {
                // unprefixed attributes are in no namespace, not the default one
                let namespace_uri = if unresolved.prefix.as_str() == "" {
                    None
                } else {
                    self.try_lookup_namespace_uri(unresolved.prefix)?
                };
                Ok(Attr {
                    name: QualifiedName {
                        namespace_uri,
                        local_name: unresolved.local,
                    },
                    value: unresolved.value,
                    span: unresolved.span,
                })
            })
            .collect()
    }
}

struct UnresolvedAttr<'a> {
    prefix: StrSpan<'a>,
    local: StrSpan<'a>,
    value: StrSpan<'a>,
    span: StrSpan<'a>,
}

struct ElementState<'a> {
    prefix: StrSpan<'a>,
    local: StrSpan<'a>,
    namespaces: Vec<Ns<'a>>,
    attributes: Vec<UnresolvedAttr<'a>>,
}

impl<'a> ElementState<'a> {
    fn lookup_namespace_uri(&self, prefix: &str) -> Option<StrSpan<'a>> {
        self.namespaces
            .iter()
            .find(|ns| ns.prefix.as_str() == prefix)
            .map(|ns| ns.namespace_uri)
    }
}

struct Ns<'a> {
    prefix: StrSpan<'a>,
    namespace_uri: StrSpan<'a>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::DiagnosticKind;
    use assert_matches::assert_matches;
    use rngcheck_model::{Compiler, Files, SchemaError};
    use std::io;
    use std::path::{Path, PathBuf};

    struct FS(String);
    impl Files for FS {
        fn load(&self, name: &Path) -> Result<String, SchemaError> {
            match name.to_str().unwrap() {
                "main.rng" => Ok(self.0.clone()),
                other => Err(SchemaError::Io(
                    PathBuf::from(other),
                    io::Error::from(io::ErrorKind::NotFound),
                )),
            }
        }
    }

    struct Fixture {
        schema: Rc<RefCell<Option<DefineRule>>>,
    }

    impl Fixture {
        fn correct(schema: &str) -> Fixture {
            let mut c = Compiler::new(FS(schema.to_string()));
            let compiled = match c.compile(Path::new("main.rng")) {
                Ok(g) => g,
                Err(e) => {
                    c.dump_diagnostic(&e);
                    panic!("{:?}", e);
                }
            };
            for e in &compiled.errors {
                c.dump_diagnostic(e);
            }
            assert!(compiled.errors.is_empty(), "schema has errors");
            Fixture {
                schema: compiled.start,
            }
        }

        fn validate(&self, xml: &str) -> Vec<Diagnostic> {
            let reader = Tokenizer::from(xml);
            let mut v = Validator::new(self.schema.clone(), reader);
            if let Err(err) = v.run() {
                panic!("malformed input: {:?}", err);
            }
            v.diagnostics().to_vec()
        }

        fn valid(&self, xml: &str) {
            let diagnostics = self.validate(xml);
            assert!(diagnostics.is_empty(), "unexpected: {:?}", diagnostics);
        }

        fn invalid(&self, xml: &str) -> Vec<Diagnostic> {
            let diagnostics = self.validate(xml);
            assert!(!diagnostics.is_empty(), "invalid input was accepted");
            diagnostics
        }
    }

    fn element(name: &str, content: &str) -> String {
        format!(
            r#"<element name="{}" xmlns="http://relaxng.org/ns/structure/1.0">{}</element>"#,
            name, content
        )
    }

    #[test]
    fn recur() {
        Fixture::correct(
            r#"<grammar xmlns="http://relaxng.org/ns/structure/1.0">
                 <start><ref name="b"/></start>
                 <define name="b"><element name="a"><optional><ref name="b"/></optional></element></define>
               </grammar>"#,
        )
        .valid("<?xml version=\"1.0\"?><a><a></a></a>");
    }

    #[test]
    fn attr() {
        Fixture::correct(&element("a", r#"<attribute name="b"/>"#))
            .valid("<?xml version=\"1.0\"?><a b=\"\"/>");
    }

    #[test]
    fn attr_group_incomplete() {
        // schema requires both attributes, but the document only has the first
        let d = Fixture::correct(&element(
            "e",
            r#"<group><attribute name="a"/><attribute name="b"/></group>"#,
        ))
        .invalid("<?xml version=\"1.0\"?><e a=\"\"/>");
        assert_matches!(d[0].kind, DiagnosticKind::RequiredAttributesMissing);
        assert_eq!(d.len(), 1);
    }

    #[test]
    fn attr_choice() {
        let f = Fixture::correct(&element(
            "a",
            r#"<choice><attribute name="a"/><attribute name="b"/></choice>"#,
        ));
        f.valid("<?xml version=\"1.0\"?><a a=\"\"/>");
        f.valid("<?xml version=\"1.0\"?><a b=\"\"/>");
    }

    #[test]
    fn attr_unexpected() {
        let d = Fixture::correct(&element("a", r#"<attribute name="a"/>"#))
            .invalid("<?xml version=\"1.0\"?><a a=\"\" b=\"\"/>");
        assert_matches!(&d[0].kind, DiagnosticKind::ImpossibleAttribute { name } => {
            assert_eq!(name, "b");
        });
    }

    #[test]
    fn attr_bad_value_distinguished() {
        let d = Fixture::correct(&element(
            "a",
            r#"<attribute name="n"><data type="integer"
                 datatypeLibrary="http://www.w3.org/2001/XMLSchema-datatypes"/></attribute>"#,
        ))
        .invalid("<?xml version=\"1.0\"?><a n=\"notanumber\"/>");
        assert_matches!(&d[0].kind, DiagnosticKind::BadAttributeValue { name } => {
            assert_eq!(name, "n");
        });
    }

    #[test]
    fn elem_text_empty() {
        // whitespace-only content still matches 'empty'
        Fixture::correct(&element("e", "<empty/>")).valid("<?xml version=\"1.0\"?><e> </e>");
    }

    #[test]
    fn elem_only_children_whitespace() {
        Fixture::correct(&element("e1", &element("e2", "<empty/>")))
            .valid("<?xml version=\"1.0\"?><e1> <e2/> </e1>");
    }

    #[test]
    fn text_element_group() {
        Fixture::correct(&element(
            "a",
            r#"<group><text/><element name="b"><empty/></element></group>"#,
        ))
        .valid("<a>foo <b/></a>");
    }

    #[test]
    fn element_whitespace_one_or_more() {
        Fixture::correct(&element(
            "a",
            r#"<oneOrMore><element name="b"><empty/></element></oneOrMore>"#,
        ))
        .valid("<a> <b/><b/><b/></a>");
    }

    #[test]
    fn text_not_allowed_reported_and_continues() {
        let d = Fixture::correct(&element(
            "a",
            r#"<group><element name="b"><empty/></element><element name="c"><empty/></element></group>"#,
        ))
        .invalid("<a>bogus<b/><c/></a>");
        // the stray text is reported, and the rest still validates cleanly
        assert_eq!(d.len(), 1);
        assert_matches!(d[0].kind, DiagnosticKind::TextNotAllowed);
    }

    #[test]
    fn impossible_element_recovers() {
        let d = Fixture::correct(&element(
            "a",
            r#"<group><element name="b"><empty/></element><element name="c"><empty/></element></group>"#,
        ))
        .invalid("<a><zzz/><b/><c/></a>");
        assert_eq!(d.len(), 1);
        assert_matches!(&d[0].kind, DiagnosticKind::ImpossibleElement { name } => {
            assert_eq!(name, "zzz");
        });
    }

    #[test]
    fn unfinished_element() {
        let d = Fixture::correct(&element(
            "a",
            r#"<element name="b"><empty/></element>"#,
        ))
        .invalid("<a></a>");
        assert_matches!(d[0].kind, DiagnosticKind::UnfinishedElement);
    }

    #[test]
    fn document_incomplete_when_empty() {
        let d = Fixture::correct(&element("a", "<empty/>")).invalid("<!-- no content -->");
        assert_matches!(d[0].kind, DiagnosticKind::DocumentIncomplete);
    }

    #[test]
    fn data_content_buffers_and_checks() {
        let f = Fixture::correct(&element(
            "n",
            r#"<data type="integer" datatypeLibrary="http://www.w3.org/2001/XMLSchema-datatypes"/>"#,
        ));
        f.valid("<n>42</n>");
        let d = f.invalid("<n>forty-two</n>");
        assert_matches!(d[0].kind, DiagnosticKind::StringNotAllowed);
    }

    #[test]
    fn data_value_delivered_in_pieces() {
        // the entity reference splits the text into several tokenizer events;
        // the buffered string must still match as one atom
        Fixture::correct(&element(
            "a",
            r#"<data type="string" datatypeLibrary="http://www.w3.org/2001/XMLSchema-datatypes"/>"#,
        ))
        .valid("<a>foo &amp; bar</a>");
    }

    #[test]
    fn list_of_tokens() {
        let f = Fixture::correct(&element(
            "e1",
            r#"<list><group><value>one</value><value>two</value></group></list>"#,
        ));
        f.valid("<?xml version=\"1.0\"?><e1>one two</e1>");
        f.invalid("<?xml version=\"1.0\"?><e1>one three</e1>");
    }

    #[test]
    fn mixed_content() {
        Fixture::correct(&element(
            "p",
            r#"<mixed><zeroOrMore><element name="em"><text/></element></zeroOrMore></mixed>"#,
        ))
        .valid("<p>some <em>emphasised</em> text</p>");
    }

    #[test]
    fn namespaced_elements() {
        let f = Fixture::correct(
            r#"<element name="doc" ns="urn:x" xmlns="http://relaxng.org/ns/structure/1.0"><empty/></element>"#,
        );
        f.valid("<doc xmlns=\"urn:x\"/>");
        f.invalid("<doc/>");
    }

    #[test]
    fn any_name_except() {
        let f = Fixture::correct(
            r#"<element xmlns="http://relaxng.org/ns/structure/1.0">
                 <anyName><except><name>forbidden</name></except></anyName>
                 <empty/>
               </element>"#,
        );
        f.valid("<anything/>");
        f.invalid("<forbidden/>");
    }

    #[test]
    fn top_level_grammar() {
        Fixture::correct(
            r#"<grammar xmlns="http://relaxng.org/ns/structure/1.0">
                 <start><element name="a"><empty/></element></start>
               </grammar>"#,
        )
        .valid("<a/>");
    }

    #[test]
    fn parse_entities_splits() {
        let mut iter = super::parse_entities(0, "foo &bar; blat");
        assert_matches!(iter.next(), Some(Ok(super::Txt::Text(0, "foo "))));
        assert_matches!(iter.next(), Some(Ok(super::Txt::Entity(5, "bar"))));
        assert_matches!(iter.next(), Some(Ok(super::Txt::Text(9, " blat"))));
    }
}

//! Parser for the RELAX NG XML syntax, producing the AST in [`crate::types`].
//!
//! Namespace prefixes and the inherited `ns` / `datatypeLibrary` attributes
//! are resolved during parsing, so the AST carries namespace URIs rather than
//! prefixes.  Recoverable structural problems (misplaced or unknown elements,
//! bad URIs) are recorded in an error sink and the offending subtree is
//! skipped, so that one malformed construct does not suppress every other
//! diagnostic; only XML malformedness and a non-RELAX-NG root are fatal.

use crate::types::*;
use roxmltree::Node;

pub const RELAXNG_URI_PREFIX: &str = "http://relaxng.org/ns/structure/";
pub const RELAXNG_1_0_URI: &str = "http://relaxng.org/ns/structure/1.0";

#[derive(Debug)]
pub enum Error {
    /// The document is not well-formed XML
    Xml(Span, String),
    /// The root element is not in a RELAX NG structure namespace
    BadRootNamespace(Span),
    /// Expected value was not present in the input
    Expected(Span, &'static str),
    /// An unexpected value was present in the input
    Unexpected(Span, &'static str),
    UndefinedPrefix(Span, String),
    InvalidUri(Span, &'static str),
    IllegalAttribute(Span, &'static str),
}

impl Error {
    pub fn span(&self) -> Span {
        match self {
            Error::Xml(s, _)
            | Error::BadRootNamespace(s)
            | Error::Expected(s, _)
            | Error::Unexpected(s, _)
            | Error::UndefinedPrefix(s, _)
            | Error::InvalidUri(s, _)
            | Error::IllegalAttribute(s, _) => s.clone(),
        }
    }
}

#[derive(Debug)]
pub enum Warning {
    /// The root namespace is a RELAX NG structure namespace, but not version 1.0
    WrongUriVersion { span: Span, found: String },
}

/// Outcome of parsing one schema document.  `errors` holds the recoverable
/// structural errors encountered; the schema is still usable (offending
/// constructs were replaced by `notAllowed`), but a non-empty error list
/// means the schema is not valid.
#[derive(Debug)]
pub struct Parsed {
    pub schema: Schema,
    pub errors: Vec<Error>,
    pub warnings: Vec<Warning>,
}

pub fn parse(text: &str) -> Result<Parsed, Error> {
    let doc = roxmltree::Document::parse(text).map_err(|e| {
        // The interface we want to expose is in terms of byte-offset pairs,
        // but the errors from roxmltree give us row + column
        let off = text
            .lines()
            .take(e.pos().row.saturating_sub(1) as usize)
            .fold(0, |acc, line| acc + line.len() + 1);
        let start = (off + e.pos().col.saturating_sub(1) as usize).min(text.len());
        Error::Xml(start..start, e.to_string())
    })?;
    let root = doc.root_element();
    let rng_ns = match root.tag_name().namespace() {
        Some(ns) if ns.starts_with(RELAXNG_URI_PREFIX) => ns.to_string(),
        _ => return Err(Error::BadRootNamespace(root.range())),
    };
    let mut parser = Parser {
        rng_ns,
        errors: Vec::new(),
        warnings: Vec::new(),
    };
    if parser.rng_ns != RELAXNG_1_0_URI {
        parser.warnings.push(Warning::WrongUriVersion {
            span: root.range(),
            found: parser.rng_ns[RELAXNG_URI_PREFIX.len()..].to_string(),
        });
    }
    let inherit = Inherit {
        ns: String::new(),
        datatype_library: String::new(),
    };
    let inherit = parser.descend(root, &inherit);
    let pattern_or_grammar = if root.tag_name().name() == "grammar" {
        PatternOrGrammar::Grammar(parser.grammar(root, &inherit))
    } else {
        PatternOrGrammar::Pattern(parser.pattern(root, &inherit))
    };
    Ok(Parsed {
        schema: Schema { pattern_or_grammar },
        errors: parser.errors,
        warnings: parser.warnings,
    })
}

/// Attribute inheritance state, extended (not mutated) when descending into
/// an element that carries `ns` or `datatypeLibrary`.
#[derive(Clone)]
struct Inherit {
    ns: String,
    datatype_library: String,
}

/// Nesting context for name-class exception checks
#[derive(Clone, Copy, PartialEq)]
enum NameClassContext {
    Pattern,
    AnyName,
    NsName,
}

struct Parser {
    rng_ns: String,
    errors: Vec<Error>,
    warnings: Vec<Warning>,
}

impl Parser {
    fn error(&mut self, e: Error) {
        self.errors.push(e);
    }

    fn is_rng(&self, node: Node) -> bool {
        node.is_element() && node.tag_name().namespace() == Some(&self.rng_ns[..])
    }

    /// Element children in the RELAX NG namespace; foreign-namespace elements
    /// are annotation content and skipped wholesale.
    fn rng_children<'a, 'input: 'a>(&self, node: Node<'a, 'input>) -> Vec<Node<'a, 'input>> {
        node.children().filter(|n| self.is_rng(*n)).collect()
    }

    fn descend(&mut self, node: Node, inherit: &Inherit) -> Inherit {
        let mut out = inherit.clone();
        if let Some(ns) = node.attribute("ns") {
            out.ns = ns.to_string();
        }
        if let Some(lib) = node.attribute_node("datatypeLibrary") {
            let val = lib.value();
            if !val.is_empty() {
                if !rfc2396::validate(val) {
                    self.error(Error::InvalidUri(
                        lib.value_range(),
                        "datatype library URI is invalid",
                    ));
                } else {
                    match url::Url::parse(val) {
                        Ok(u) if u.fragment().is_some() => self.error(Error::InvalidUri(
                            lib.value_range(),
                            "datatype library URI must not include a fragment identifier",
                        )),
                        Ok(_) => {}
                        Err(_) => self.error(Error::InvalidUri(
                            lib.value_range(),
                            "datatype library URI must be absolute",
                        )),
                    }
                }
            }
            out.datatype_library = val.to_string();
        }
        out
    }

    fn pattern(&mut self, node: Node, inherit: &Inherit) -> Pattern {
        let inherit = self.descend(node, inherit);
        match node.tag_name().name() {
            "element" => self.element(node, &inherit),
            "attribute" => self.attribute(node, &inherit),
            "group" => self.particles(node, &inherit, Pattern::Group),
            "interleave" => self.particles(node, &inherit, Pattern::Interleave),
            "choice" => self.particles(node, &inherit, Pattern::Choice),
            "optional" => Pattern::Optional(Box::new(self.group_contents(node, &inherit))),
            "zeroOrMore" => Pattern::ZeroOrMore(Box::new(self.group_contents(node, &inherit))),
            "oneOrMore" => Pattern::OneOrMore(Box::new(self.group_contents(node, &inherit))),
            "list" => Pattern::List(
                node.range(),
                Box::new(self.group_contents(node, &inherit)),
            ),
            "mixed" => Pattern::Mixed(Box::new(self.group_contents(node, &inherit))),
            "ref" => match self.name_attribute(node) {
                Some(id) => Pattern::Ref(id),
                None => Pattern::NotAllowed,
            },
            "parentRef" => match self.name_attribute(node) {
                Some(id) => Pattern::ParentRef(id),
                None => Pattern::NotAllowed,
            },
            "empty" => self.empty_content(node, Pattern::Empty),
            "text" => self.empty_content(node, Pattern::Text),
            "notAllowed" => self.empty_content(node, Pattern::NotAllowed),
            "externalRef" => match self.href_attribute(node) {
                Some(href) => Pattern::ExternalRef(ExternalPattern {
                    span: node.range(),
                    href,
                }),
                None => Pattern::NotAllowed,
            },
            "grammar" => Pattern::Grammar(self.grammar(node, &inherit)),
            "data" => self.data(node, &inherit),
            "value" => self.value(node, &inherit),
            _ => {
                self.error(Error::Expected(node.range(), "pattern"));
                Pattern::NotAllowed
            }
        }
    }

    /// `group`, `interleave` and `choice` with explicit elements; a single
    /// child collapses to that child
    fn particles(
        &mut self,
        node: Node,
        inherit: &Inherit,
        wrap: fn(Span, Vec<Pattern>) -> Pattern,
    ) -> Pattern {
        let mut patterns = Vec::new();
        for child in self.rng_children(node) {
            patterns.push(self.pattern(child, inherit));
        }
        match patterns.len() {
            0 => {
                self.error(Error::Expected(node.range(), "at least one child pattern"));
                Pattern::NotAllowed
            }
            1 => patterns.remove(0),
            _ => wrap(node.range(), patterns),
        }
    }

    /// Multiple child patterns of a container combine as an implicit group
    fn group_contents(&mut self, node: Node, inherit: &Inherit) -> Pattern {
        self.particles(node, inherit, Pattern::Group)
    }

    fn empty_content(&mut self, node: Node, result: Pattern) -> Pattern {
        for child in self.rng_children(node) {
            self.error(Error::Unexpected(child.range(), "child of an empty element"));
        }
        result
    }

    fn element(&mut self, node: Node, inherit: &Inherit) -> Pattern {
        let (name_class, content) = self.name_class_then_children(node, inherit, &inherit.ns);
        let pattern = match content.len() {
            0 => {
                self.error(Error::Expected(node.range(), "content pattern"));
                Pattern::NotAllowed
            }
            _ => self.combine_group(node, content, inherit),
        };
        Pattern::Element(ElementPattern {
            span: node.range(),
            name_class,
            pattern: Box::new(pattern),
        })
    }

    fn attribute(&mut self, node: Node, inherit: &Inherit) -> Pattern {
        // the name attribute of an attribute pattern defaults to no-namespace,
        // not the inherited ns
        let default_ns = node.attribute("ns").unwrap_or("").to_string();
        let (name_class, mut content) = self.name_class_then_children(node, inherit, &default_ns);
        let pattern = match content.len() {
            0 => Pattern::Text,
            1 => self.pattern(content.remove(0), inherit),
            _ => {
                self.error(Error::Unexpected(
                    node.range(),
                    "more than one pattern in attribute",
                ));
                self.pattern(content.remove(0), inherit)
            }
        };
        Pattern::Attribute(AttributePattern {
            span: node.range(),
            name_class,
            pattern: Box::new(pattern),
        })
    }

    /// Shared element/attribute head handling: either a `name` attribute, or
    /// the first child element is a name class.  Returns the name class and
    /// the remaining (pattern) children.
    fn name_class_then_children<'a, 'input: 'a>(
        &mut self,
        node: Node<'a, 'input>,
        inherit: &Inherit,
        name_ns: &str,
    ) -> (NameClass, Vec<Node<'a, 'input>>) {
        let mut children = self.rng_children(node);
        let name_class = if let Some(name) = node.attribute("name") {
            self.expand_name(node, name.trim(), name_ns)
        } else if children.is_empty() {
            self.error(Error::Expected(node.range(), "name class"));
            NameClass::AnyName {
                span: node.range(),
                except: None,
            }
        } else {
            let nc_node = children.remove(0);
            self.name_class(nc_node, inherit, NameClassContext::Pattern)
        };
        (name_class, children)
    }

    fn combine_group(&mut self, node: Node, children: Vec<Node>, inherit: &Inherit) -> Pattern {
        let mut patterns = Vec::new();
        for child in children {
            patterns.push(self.pattern(child, inherit));
        }
        if patterns.len() == 1 {
            patterns.remove(0)
        } else {
            Pattern::Group(node.range(), patterns)
        }
    }

    fn name_class(&mut self, node: Node, inherit: &Inherit, ctx: NameClassContext) -> NameClass {
        let inherit = self.descend(node, inherit);
        if !self.is_rng(node) {
            self.error(Error::Expected(node.range(), "name class"));
            return NameClass::AnyName {
                span: node.range(),
                except: None,
            };
        }
        match node.tag_name().name() {
            "name" => {
                let text = text_content(node);
                self.expand_name(node, text.trim(), &inherit.ns)
            }
            "anyName" => {
                if ctx != NameClassContext::Pattern {
                    self.error(Error::Unexpected(
                        node.range(),
                        "anyName inside an except name class",
                    ));
                }
                let except = self.except_name_class(node, &inherit, NameClassContext::AnyName);
                NameClass::AnyName {
                    span: node.range(),
                    except,
                }
            }
            "nsName" => {
                if ctx == NameClassContext::NsName {
                    self.error(Error::Unexpected(
                        node.range(),
                        "nsName inside an nsName except",
                    ));
                }
                let except = self.except_name_class(node, &inherit, NameClassContext::NsName);
                NameClass::NsName {
                    span: node.range(),
                    namespace_uri: inherit.ns.clone(),
                    except,
                }
            }
            "choice" => {
                let mut parts = Vec::new();
                for child in self.rng_children(node) {
                    parts.push(self.name_class(child, &inherit, ctx));
                }
                match parts.len() {
                    0 => {
                        self.error(Error::Expected(node.range(), "name class"));
                        NameClass::AnyName {
                            span: node.range(),
                            except: None,
                        }
                    }
                    _ => {
                        let mut iter = parts.into_iter();
                        let mut nc = iter.next().unwrap();
                        for next in iter {
                            nc = NameClass::Choice(Box::new(nc), Box::new(next));
                        }
                        nc
                    }
                }
            }
            _ => {
                self.error(Error::Expected(node.range(), "name class"));
                NameClass::AnyName {
                    span: node.range(),
                    except: None,
                }
            }
        }
    }

    /// Optional single `except` child of anyName/nsName, containing one or
    /// more name classes combined as a choice
    fn except_name_class(
        &mut self,
        node: Node,
        inherit: &Inherit,
        ctx: NameClassContext,
    ) -> Option<Box<NameClass>> {
        let mut except: Option<NameClass> = None;
        for child in self.rng_children(node) {
            if child.tag_name().name() != "except" {
                self.error(Error::Expected(child.range(), "except"));
                continue;
            }
            if except.is_some() {
                self.error(Error::Unexpected(child.range(), "multiple except elements"));
                continue;
            }
            let mut parts = Vec::new();
            for nc in self.rng_children(child) {
                parts.push(self.name_class(nc, inherit, ctx));
            }
            if parts.is_empty() {
                self.error(Error::Expected(child.range(), "name class"));
                continue;
            }
            let mut iter = parts.into_iter();
            let mut nc = iter.next().unwrap();
            for next in iter {
                nc = NameClass::Choice(Box::new(nc), Box::new(next));
            }
            except = Some(nc);
        }
        except.map(Box::new)
    }

    /// Expand a possibly prefix-qualified name against the xmlns bindings in
    /// scope at this node
    fn expand_name(&mut self, node: Node, name: &str, default_ns: &str) -> NameClass {
        let span = node.range();
        match name.find(':') {
            None => NameClass::Named {
                span,
                namespace_uri: default_ns.to_string(),
                name: name.to_string(),
            },
            Some(ic) => {
                let prefix = &name[..ic];
                let local = &name[ic + 1..];
                match node.lookup_namespace_uri(Some(prefix)) {
                    Some(uri) => NameClass::Named {
                        span,
                        namespace_uri: uri.to_string(),
                        name: local.to_string(),
                    },
                    None => {
                        self.error(Error::UndefinedPrefix(span.clone(), prefix.to_string()));
                        NameClass::Named {
                            span,
                            namespace_uri: String::new(),
                            name: local.to_string(),
                        }
                    }
                }
            }
        }
    }

    fn data(&mut self, node: Node, inherit: &Inherit) -> Pattern {
        let name = match node.attribute_node("type") {
            Some(a) => NcName(a.value_range(), a.value().trim().to_string()),
            None => {
                self.error(Error::Expected(node.range(), "type attribute"));
                NcName(node.range(), "string".to_string())
            }
        };
        let key = self.key_use(node);
        let mut params = Vec::new();
        let mut except = None;
        for child in self.rng_children(node) {
            match child.tag_name().name() {
                "param" => {
                    if except.is_some() {
                        self.error(Error::Unexpected(child.range(), "param after except"));
                        continue;
                    }
                    if let Some(name) = self.name_attribute(child) {
                        let value = text_content(child);
                        params.push(Param(child.range(), NcName(name.0, name.1), value));
                    }
                }
                "except" => {
                    if except.is_some() {
                        self.error(Error::Unexpected(child.range(), "multiple except elements"));
                        continue;
                    }
                    except = Some(Box::new(self.particles(child, inherit, Pattern::Choice)));
                }
                _ => self.error(Error::Expected(child.range(), "param or except")),
            }
        }
        Pattern::Data(DataPattern {
            span: node.range(),
            library: inherit.datatype_library.clone(),
            name,
            params,
            except,
            key,
        })
    }

    fn value(&mut self, node: Node, inherit: &Inherit) -> Pattern {
        let name = node
            .attribute_node("type")
            .map(|a| NcName(a.value_range(), a.value().trim().to_string()));
        let key = self.key_use(node);
        for child in node.children() {
            if child.is_element() {
                self.error(Error::Unexpected(
                    child.range(),
                    "element content in value pattern",
                ));
            }
        }
        let value = text_content(node);
        Pattern::Value(ValuePattern {
            span: node.range(),
            library: inherit.datatype_library.clone(),
            name,
            value,
            key,
        })
    }

    fn key_use(&mut self, node: Node) -> Option<KeyUse> {
        let key = node
            .attribute_node("key")
            .map(|a| KeyUse::Key(NcName(a.value_range(), a.value().trim().to_string())));
        let key_ref = node
            .attribute_node("keyRef")
            .map(|a| KeyUse::KeyRef(NcName(a.value_range(), a.value().trim().to_string())));
        if key.is_some() && key_ref.is_some() {
            self.error(Error::IllegalAttribute(
                node.range(),
                "both key and keyRef on one pattern",
            ));
        }
        key.or(key_ref)
    }

    fn grammar(&mut self, node: Node, inherit: &Inherit) -> GrammarPattern {
        let content = self.grammar_content(node, inherit);
        GrammarPattern {
            span: node.range(),
            content,
        }
    }

    fn grammar_content(&mut self, node: Node, inherit: &Inherit) -> Vec<GrammarContent> {
        let mut content = Vec::new();
        for child in self.rng_children(node) {
            let inherit = self.descend(child, inherit);
            match child.tag_name().name() {
                "define" => {
                    if let Some(d) = self.define(child, &inherit) {
                        content.push(GrammarContent::Define(d));
                    }
                }
                "start" => content.push(GrammarContent::Start(self.start(child, &inherit))),
                "div" => content.push(GrammarContent::Div(self.grammar_content(child, &inherit))),
                "include" => {
                    if let Some(inc) = self.include(child, &inherit) {
                        content.push(GrammarContent::Include(inc));
                    }
                }
                _ => self.error(Error::Expected(
                    child.range(),
                    "define, start, div or include",
                )),
            }
        }
        content
    }

    fn include(&mut self, node: Node, inherit: &Inherit) -> Option<Include> {
        let href = self.href_attribute(node)?;
        let content = self.include_content(node, inherit);
        Some(Include {
            span: node.range(),
            href,
            content,
        })
    }

    fn include_content(&mut self, node: Node, inherit: &Inherit) -> Vec<IncludeContent> {
        let mut content = Vec::new();
        for child in self.rng_children(node) {
            let inherit = self.descend(child, inherit);
            match child.tag_name().name() {
                "define" => {
                    if let Some(d) = self.define(child, &inherit) {
                        content.push(IncludeContent::Define(d));
                    }
                }
                "start" => content.push(IncludeContent::Start(self.start(child, &inherit))),
                "div" => {
                    content.push(IncludeContent::Div(self.include_content(child, &inherit)))
                }
                _ => self.error(Error::Expected(child.range(), "define, start or div")),
            }
        }
        content
    }

    fn define(&mut self, node: Node, inherit: &Inherit) -> Option<Define> {
        let name = self.name_attribute(node)?;
        let combine = self.combine_attribute(node);
        let pattern = self.group_contents(node, inherit);
        Some(Define {
            span: node.range(),
            name,
            combine,
            pattern,
        })
    }

    fn start(&mut self, node: Node, inherit: &Inherit) -> Start {
        let combine = self.combine_attribute(node);
        let children = self.rng_children(node);
        let pattern = match children.len() {
            0 => {
                self.error(Error::Expected(node.range(), "start pattern"));
                Pattern::NotAllowed
            }
            1 => self.pattern(children[0], inherit),
            _ => {
                self.error(Error::Unexpected(
                    node.range(),
                    "more than one pattern in start",
                ));
                self.pattern(children[0], inherit)
            }
        };
        Start {
            span: node.range(),
            combine,
            pattern,
        }
    }

    fn combine_attribute(&mut self, node: Node) -> Option<Combine> {
        match node.attribute_node("combine") {
            None => None,
            Some(a) => match a.value().trim() {
                "choice" => Some(Combine::Choice),
                "interleave" => Some(Combine::Interleave),
                _ => {
                    self.error(Error::Unexpected(
                        a.value_range(),
                        "combine must be \"choice\" or \"interleave\"",
                    ));
                    None
                }
            },
        }
    }

    fn name_attribute(&mut self, node: Node) -> Option<Identifier> {
        match node.attribute_node("name") {
            Some(a) => Some(Identifier(a.value_range(), a.value().trim().to_string())),
            None => {
                self.error(Error::Expected(node.range(), "name attribute"));
                None
            }
        }
    }

    fn href_attribute(&mut self, node: Node) -> Option<Href> {
        match node.attribute_node("href") {
            Some(a) => {
                let val = a.value();
                if val.contains('#') {
                    self.error(Error::InvalidUri(
                        a.value_range(),
                        "href must not include a fragment identifier",
                    ));
                    return None;
                }
                if !rfc2396::validate(val) {
                    self.error(Error::InvalidUri(a.value_range(), "href URI is invalid"));
                    return None;
                }
                Some(Href(a.value_range(), val.to_string()))
            }
            None => {
                self.error(Error::Expected(node.range(), "href attribute"));
                None
            }
        }
    }
}

fn text_content(node: Node) -> String {
    node.children()
        .filter(|n| n.is_text())
        .filter_map(|n| n.text())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    fn parse_ok(text: &str) -> Parsed {
        let p = parse(text).expect("well-formed schema");
        assert!(p.errors.is_empty(), "unexpected errors: {:?}", p.errors);
        p
    }

    #[test]
    fn minimal_element() {
        let p = parse_ok(
            r#"<element name="doc" xmlns="http://relaxng.org/ns/structure/1.0"><empty/></element>"#,
        );
        assert_matches!(
            p.schema.pattern_or_grammar,
            PatternOrGrammar::Pattern(Pattern::Element(ElementPattern {
                ref name_class, ..
            })) => {
                assert_matches!(name_class, NameClass::Named { name, namespace_uri, .. } => {
                    assert_eq!(name, "doc");
                    assert_eq!(namespace_uri, "");
                })
            }
        );
    }

    #[test]
    fn ns_inheritance() {
        let p = parse_ok(
            r#"<element name="doc" ns="urn:x" xmlns="http://relaxng.org/ns/structure/1.0">
                 <element name="child"><text/></element>
               </element>"#,
        );
        assert_matches!(
            p.schema.pattern_or_grammar,
            PatternOrGrammar::Pattern(Pattern::Element(ElementPattern { ref pattern, .. })) => {
                assert_matches!(**pattern, Pattern::Element(ElementPattern { ref name_class, .. }) => {
                    assert_matches!(name_class, NameClass::Named { namespace_uri, .. } => {
                        assert_eq!(namespace_uri, "urn:x");
                    })
                })
            }
        );
    }

    #[test]
    fn attribute_name_has_no_default_namespace() {
        let p = parse_ok(
            r#"<element name="doc" ns="urn:x" xmlns="http://relaxng.org/ns/structure/1.0">
                 <attribute name="id"/>
               </element>"#,
        );
        assert_matches!(
            p.schema.pattern_or_grammar,
            PatternOrGrammar::Pattern(Pattern::Element(ElementPattern { ref pattern, .. })) => {
                assert_matches!(**pattern, Pattern::Attribute(AttributePattern { ref name_class, ref pattern, .. }) => {
                    assert_matches!(name_class, NameClass::Named { namespace_uri, .. } => {
                        assert_eq!(namespace_uri, "");
                    });
                    // attribute value pattern defaults to text
                    assert_matches!(**pattern, Pattern::Text);
                })
            }
        );
    }

    #[test]
    fn grammar_with_combine() {
        let p = parse_ok(
            r#"<grammar xmlns="http://relaxng.org/ns/structure/1.0">
                 <start><ref name="a"/></start>
                 <define name="a" combine="choice"><element name="x"><empty/></element></define>
                 <define name="a" combine="choice"><element name="y"><empty/></element></define>
               </grammar>"#,
        );
        assert_matches!(p.schema.pattern_or_grammar, PatternOrGrammar::Grammar(ref g) => {
            assert_eq!(g.content.len(), 3);
            assert_matches!(g.content[1], GrammarContent::Define(Define { combine: Some(Combine::Choice), .. }));
        });
    }

    #[test]
    fn key_and_keyref() {
        let p = parse_ok(
            r#"<element name="doc" xmlns="http://relaxng.org/ns/structure/1.0">
                 <attribute name="id"><data type="token" key="id"/></attribute>
               </element>"#,
        );
        assert_matches!(
            p.schema.pattern_or_grammar,
            PatternOrGrammar::Pattern(Pattern::Element(ElementPattern { ref pattern, .. })) => {
                assert_matches!(**pattern, Pattern::Attribute(AttributePattern { ref pattern, .. }) => {
                    assert_matches!(**pattern, Pattern::Data(DataPattern { key: Some(KeyUse::Key(ref k)), .. }) => {
                        assert_eq!(k.1, "id");
                    })
                })
            }
        );
    }

    #[test]
    fn foreign_elements_skipped() {
        let p = parse_ok(
            r#"<element name="doc" xmlns="http://relaxng.org/ns/structure/1.0"
                        xmlns:a="urn:notes">
                 <a:note>annotation content is ignored</a:note>
                 <empty/>
               </element>"#,
        );
        assert_matches!(
            p.schema.pattern_or_grammar,
            PatternOrGrammar::Pattern(Pattern::Element(ElementPattern { ref pattern, .. })) => {
                assert_matches!(**pattern, Pattern::Empty);
            }
        );
    }

    #[test]
    fn misplaced_element_recovers() {
        let p = parse(
            r#"<grammar xmlns="http://relaxng.org/ns/structure/1.0">
                 <empty/>
                 <start><element name="doc"><empty/></element></start>
               </grammar>"#,
        )
        .unwrap();
        // the misplaced <empty/> is reported but the start rule still parses
        assert_eq!(p.errors.len(), 1);
        assert_matches!(p.schema.pattern_or_grammar, PatternOrGrammar::Grammar(ref g) => {
            assert_eq!(g.content.len(), 1);
        });
    }

    #[test]
    fn version_mismatch_warns() {
        let p = parse(
            r#"<element name="doc" xmlns="http://relaxng.org/ns/structure/0.9"><empty/></element>"#,
        )
        .unwrap();
        assert_eq!(p.errors.len(), 0);
        assert_matches!(p.warnings[0], Warning::WrongUriVersion { ref found, .. } => {
            assert_eq!(found, "0.9");
        });
    }

    #[test]
    fn non_rng_root_is_fatal() {
        assert_matches!(
            parse(r#"<schema xmlns="urn:other"/>"#),
            Err(Error::BadRootNamespace(_))
        );
    }

    #[test]
    fn name_class_except() {
        let p = parse_ok(
            r#"<element xmlns="http://relaxng.org/ns/structure/1.0">
                 <anyName><except><name>reserved</name></except></anyName>
                 <text/>
               </element>"#,
        );
        assert_matches!(
            p.schema.pattern_or_grammar,
            PatternOrGrammar::Pattern(Pattern::Element(ElementPattern { ref name_class, .. })) => {
                assert_matches!(name_class, NameClass::AnyName { except: Some(_), .. });
            }
        );
    }

    #[test]
    fn any_name_nested_in_except_rejected() {
        let p = parse(
            r#"<element xmlns="http://relaxng.org/ns/structure/1.0">
                 <anyName><except><anyName/></except></anyName>
                 <text/>
               </element>"#,
        )
        .unwrap();
        assert_eq!(p.errors.len(), 1);
    }
}

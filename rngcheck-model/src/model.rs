use std::cell::RefCell;
use std::fmt;
use std::rc::Rc;

/// The name of a document element or attribute, with prefixes already
/// resolved; an empty `namespace_uri` means "no namespace".
#[derive(Debug, PartialEq, Eq, Hash, Clone)]
pub struct Name {
    pub namespace_uri: String,
    pub local_name: String,
}

impl Name {
    pub fn new(namespace_uri: impl Into<String>, local_name: impl Into<String>) -> Name {
        Name {
            namespace_uri: namespace_uri.into(),
            local_name: local_name.into(),
        }
    }
}

#[derive(Debug)]
pub enum DefineRule {
    /// the name has been defined without a combine attribute, and might have also been defined
    /// with combine="choice" or combine="interleave"
    AssignCombine(codemap::Span, Option<CombineRule>, Pattern),
    /// the name has been defined with a combine attribute only
    CombineOnly(codemap::Span, CombineRule, Pattern),
}
impl DefineRule {
    pub fn pattern(&self) -> &Pattern {
        match self {
            DefineRule::AssignCombine(_, _, p) | DefineRule::CombineOnly(_, _, p) => p,
        }
    }

    pub fn span(&self) -> &codemap::Span {
        match self {
            DefineRule::AssignCombine(s, _, _) | DefineRule::CombineOnly(s, _, _) => s,
        }
    }
}

#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum CombineRule {
    Choice,
    Interleave,
}

/// Use of a definition value as a key or a key reference, carried on data and
/// value patterns
#[derive(Debug, PartialEq, Eq, Hash, Clone)]
pub enum KeyUse {
    Key(String),
    KeyRef(String),
}

impl KeyUse {
    pub fn name(&self) -> &str {
        match self {
            KeyUse::Key(n) | KeyUse::KeyRef(n) => n,
        }
    }
}

#[derive(Debug)]
pub enum Pattern {
    Choice(Vec<Pattern>),
    Interleave(Vec<Pattern>),
    /// An ordered sequence of patterns
    Group(Vec<Pattern>),
    Mixed(Box<Pattern>),
    Empty,
    Text,
    NotAllowed,
    Optional(Box<Pattern>),
    ZeroOrMore(Box<Pattern>),
    OneOrMore(Box<Pattern>),
    Attribute(NameClass, Box<Pattern>),
    Element(NameClass, Box<Pattern>),
    Ref(codemap::Span, String, PatRef),
    Value {
        datatype: crate::datatype::DatatypeValues,
        key: Option<KeyUse>,
    },
    Data {
        datatype: crate::datatype::Datatypes,
        except: Option<Box<Pattern>>,
        key: Option<KeyUse>,
    },
    List(Box<Pattern>),
}

// Factored out from Pattern primarily to avoid infinite recursion in Debug impl
#[derive(Clone)]
pub struct PatRef(pub Rc<RefCell<Option<DefineRule>>>);
impl fmt::Debug for PatRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> Result<(), fmt::Error> {
        let mut d = f.debug_tuple("PatRef");
        if self.0.borrow().is_some() {
            d.field(&"Some(...)")
        } else {
            d.field(&"None")
        }
        .finish()
    }
}

#[derive(Debug, PartialEq, Eq, Hash, Clone)]
pub enum NameClass {
    Named {
        namespace_uri: String,
        name: String,
    },
    NsName {
        namespace_uri: String,
        except: Option<Box<NameClass>>,
    },
    AnyName {
        except: Option<Box<NameClass>>,
    },
    Alt {
        a: Box<NameClass>,
        b: Box<NameClass>,
    },
}
impl NameClass {
    pub fn named(namespace_uri: String, name: String) -> NameClass {
        NameClass::Named {
            namespace_uri,
            name,
        }
    }
    pub fn ns_name(namespace_uri: String, except: Option<NameClass>) -> NameClass {
        NameClass::NsName {
            namespace_uri,
            except: except.map(Box::new),
        }
    }
    pub fn any_name(except: Option<NameClass>) -> NameClass {
        NameClass::AnyName {
            except: except.map(Box::new),
        }
    }
    pub fn alt(a: NameClass, b: NameClass) -> NameClass {
        NameClass::Alt {
            a: Box::new(a),
            b: Box::new(b),
        }
    }

    /// The single matching contract every name-class variant satisfies
    pub fn matches(&self, name: &Name) -> bool {
        match self {
            NameClass::Named {
                namespace_uri,
                name: local,
            } => namespace_uri == &name.namespace_uri && local == &name.local_name,
            NameClass::NsName {
                namespace_uri,
                except,
            } => {
                namespace_uri == &name.namespace_uri
                    && except.as_ref().map_or(true, |e| !e.matches(name))
            }
            NameClass::AnyName { except } => except.as_ref().map_or(true, |e| !e.matches(name)),
            NameClass::Alt { a, b } => a.matches(name) || b.matches(name),
        }
    }

    /// Conservative overlap test: may some name match both classes?  Exact
    /// only for Named-vs-Named; wildcard variants claim overlap unless the
    /// exception provably excludes the other side's exact name.
    pub fn overlaps(&self, other: &NameClass) -> bool {
        match (self, other) {
            (
                NameClass::Named {
                    namespace_uri: ns_a,
                    name: n_a,
                },
                NameClass::Named {
                    namespace_uri: ns_b,
                    name: n_b,
                },
            ) => ns_a == ns_b && n_a == n_b,
            (nc, NameClass::Named { namespace_uri, name })
            | (NameClass::Named { namespace_uri, name }, nc) => nc.matches(&Name {
                namespace_uri: namespace_uri.clone(),
                local_name: name.clone(),
            }),
            (NameClass::Alt { a, b }, nc) | (nc, NameClass::Alt { a, b }) => {
                a.overlaps(nc) || b.overlaps(nc)
            }
            (
                NameClass::NsName {
                    namespace_uri: ns_a,
                    ..
                },
                NameClass::NsName {
                    namespace_uri: ns_b,
                    ..
                },
            ) => ns_a == ns_b,
            _ => true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn named_matches() {
        let nc = NameClass::named("urn:x".to_string(), "a".to_string());
        assert!(nc.matches(&Name::new("urn:x", "a")));
        assert!(!nc.matches(&Name::new("urn:x", "b")));
        assert!(!nc.matches(&Name::new("", "a")));
    }

    #[test]
    fn ns_name_except() {
        let nc = NameClass::ns_name(
            "urn:x".to_string(),
            Some(NameClass::named("urn:x".to_string(), "banned".to_string())),
        );
        assert!(nc.matches(&Name::new("urn:x", "ok")));
        assert!(!nc.matches(&Name::new("urn:x", "banned")));
        assert!(!nc.matches(&Name::new("urn:y", "ok")));
    }

    #[test]
    fn any_name_except_ns() {
        let nc = NameClass::any_name(Some(NameClass::ns_name("urn:x".to_string(), None)));
        assert!(nc.matches(&Name::new("urn:y", "a")));
        assert!(!nc.matches(&Name::new("urn:x", "a")));
    }

    #[test]
    fn alt() {
        let nc = NameClass::alt(
            NameClass::named("".to_string(), "a".to_string()),
            NameClass::named("".to_string(), "b".to_string()),
        );
        assert!(nc.matches(&Name::new("", "a")));
        assert!(nc.matches(&Name::new("", "b")));
        assert!(!nc.matches(&Name::new("", "c")));
    }

    #[test]
    fn overlap_named() {
        let a = NameClass::named("".to_string(), "a".to_string());
        let b = NameClass::named("".to_string(), "b".to_string());
        assert!(a.overlaps(&a.clone()));
        assert!(!a.overlaps(&b));
    }

    #[test]
    fn overlap_wildcard_excludes_named() {
        let any_but_a = NameClass::any_name(Some(NameClass::named("".to_string(), "a".to_string())));
        let a = NameClass::named("".to_string(), "a".to_string());
        assert!(!any_but_a.overlaps(&a));
        let b = NameClass::named("".to_string(), "b".to_string());
        assert!(any_but_a.overlaps(&b));
    }

    #[test]
    fn overlap_ns_wildcards() {
        let x = NameClass::ns_name("urn:x".to_string(), None);
        let y = NameClass::ns_name("urn:y".to_string(), None);
        assert!(!x.overlaps(&y));
        assert!(x.overlaps(&x.clone()));
    }
}

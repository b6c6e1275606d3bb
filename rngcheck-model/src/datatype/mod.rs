//! The pluggable datatype-library layer.
//!
//! A library is identified by URI; the empty URI selects the RELAX NG
//! built-in library.  Lookup failures are reported to the grammar builder,
//! which degrades to the built-in `string` datatype rather than aborting, so
//! the rest of the grammar can still be checked.

use rngcheck_syntax::types::{NcName, Param, Span};

pub mod builtin;
pub mod xsd;

pub trait Datatype {
    fn is_valid(&self, value: &str) -> bool;
}

pub(crate) trait DatatypeCompiler {
    type DT: Datatype;
    type DTValue: Datatype;
    type Error;

    fn datatype_value(&self, name: &NcName, value: &str) -> Result<Self::DTValue, Self::Error>;
    fn datatype_name(&self, name: &NcName, params: &[Param]) -> Result<Self::DT, Self::Error>;
}

#[derive(PartialEq, Eq, Hash, Clone, Debug)]
pub enum DatatypeValues {
    Builtin(builtin::BuiltinDatatypeValue),
    Xsd(xsd::XsdDatatypeValues),
}
impl Datatype for DatatypeValues {
    fn is_valid(&self, value: &str) -> bool {
        match self {
            DatatypeValues::Builtin(b) => b.is_valid(value),
            DatatypeValues::Xsd(x) => x.is_valid(value),
        }
    }
}

#[derive(PartialEq, Eq, Hash, Clone, Debug)]
pub enum Datatypes {
    Builtin(builtin::BuiltinDatatype),
    Xsd(xsd::XsdDatatypes),
}
impl Datatype for Datatypes {
    fn is_valid(&self, value: &str) -> bool {
        match self {
            Datatypes::Builtin(b) => b.is_valid(value),
            Datatypes::Xsd(x) => x.is_valid(value),
        }
    }
}

#[derive(Debug)]
pub enum Errors {
    UnsupportedDatatypeLibrary { span: Span, namespace: String },
    Builtin(builtin::Error),
    Xsd(xsd::XsdDatatypeError),
}

#[derive(Default)]
pub struct Compiler {
    builtin: builtin::Compiler,
    xsd: xsd::Compiler,
}

impl Compiler {
    /// Compile a `value` pattern's datatype; a missing type name selects the
    /// built-in `token` datatype regardless of the library in scope.
    pub(crate) fn datatype_value(
        &self,
        library: &str,
        name: Option<&NcName>,
        span: &Span,
        value: &str,
    ) -> Result<DatatypeValues, Errors> {
        let name = match name {
            None => return self.builtin_value("token", span, value),
            Some(name) => name,
        };
        match library {
            "" => self
                .builtin
                .datatype_value(name, value)
                .map(DatatypeValues::Builtin)
                .map_err(Errors::Builtin),
            xsd::NAMESPACE_URI => self
                .xsd
                .datatype_value(name, value)
                .map(DatatypeValues::Xsd)
                .map_err(Errors::Xsd),
            _ => Err(Errors::UnsupportedDatatypeLibrary {
                span: span.clone(),
                namespace: library.to_string(),
            }),
        }
    }

    pub(crate) fn datatype_name(
        &self,
        library: &str,
        name: &NcName,
        params: &[Param],
    ) -> Result<Datatypes, Errors> {
        match library {
            "" => self
                .builtin
                .datatype_name(name, params)
                .map(Datatypes::Builtin)
                .map_err(Errors::Builtin),
            xsd::NAMESPACE_URI => self
                .xsd
                .datatype_name(name, params)
                .map(Datatypes::Xsd)
                .map_err(Errors::Xsd),
            _ => Err(Errors::UnsupportedDatatypeLibrary {
                span: name.0.clone(),
                namespace: library.to_string(),
            }),
        }
    }

    /// The degraded datatype used after an unrecognized library or type name
    pub(crate) fn fallback_string(&self) -> Datatypes {
        Datatypes::Builtin(builtin::BuiltinDatatype::String)
    }

    fn builtin_value(
        &self,
        name: &str,
        span: &Span,
        value: &str,
    ) -> Result<DatatypeValues, Errors> {
        self.builtin
            .datatype_value(&NcName(span.clone(), name.to_string()), value)
            .map(DatatypeValues::Builtin)
            .map_err(Errors::Builtin)
    }
}

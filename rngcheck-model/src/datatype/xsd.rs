//! A subset of the XML Schema datatype library covering the types and facets
//! the validator commonly meets.  Unknown types are reported and the caller
//! degrades to the built-in string datatype.

use super::builtin::normalize_whitespace;
use lazy_static::lazy_static;
use rngcheck_syntax::types::{NcName, Param, Span};
use std::fmt;

pub const NAMESPACE_URI: &str = "http://www.w3.org/2001/XMLSchema-datatypes";

lazy_static! {
    static ref NCNAME_RE: regex::Regex =
        regex::Regex::new(r"^[A-Za-z_][A-Za-z0-9._\-]*$").unwrap();
    static ref NAME_RE: regex::Regex =
        regex::Regex::new(r"^[A-Za-z_:][A-Za-z0-9._:\-]*$").unwrap();
    static ref NMTOKEN_RE: regex::Regex = regex::Regex::new(r"^[A-Za-z0-9._:\-]+$").unwrap();
    static ref DECIMAL_RE: regex::Regex =
        regex::Regex::new(r"^[+\-]?([0-9]+(\.[0-9]*)?|\.[0-9]+)$").unwrap();
    static ref DOUBLE_RE: regex::Regex = regex::Regex::new(
        r"^([+\-]?([0-9]+(\.[0-9]*)?|\.[0-9]+)([eE][+\-]?[0-9]+)?|INF|-INF|NaN)$"
    )
    .unwrap();
}

#[derive(PartialEq, Eq, Hash, Clone, Debug)]
pub enum XsdDatatypes {
    String(StringFacets),
    Token(StringFacets),
    NcName(StringFacets),
    Name(StringFacets),
    NmToken(StringFacets),
    Boolean,
    Integer(MinMaxFacet, Option<PatternFacet>),
    Decimal(Option<PatternFacet>),
    Double(Option<PatternFacet>),
    AnyUri,
}

impl super::Datatype for XsdDatatypes {
    fn is_valid(&self, value: &str) -> bool {
        match self {
            XsdDatatypes::String(facets) => facets.is_valid(value),
            XsdDatatypes::Token(facets) => facets.is_valid(&normalize_whitespace(value)),
            XsdDatatypes::NcName(facets) => {
                let value = value.trim();
                NCNAME_RE.is_match(value) && facets.is_valid(value)
            }
            XsdDatatypes::Name(facets) => {
                let value = value.trim();
                NAME_RE.is_match(value) && facets.is_valid(value)
            }
            XsdDatatypes::NmToken(facets) => {
                let value = value.trim();
                NMTOKEN_RE.is_match(value) && facets.is_valid(value)
            }
            XsdDatatypes::Boolean => {
                matches!(value.trim(), "true" | "false" | "1" | "0")
            }
            XsdDatatypes::Integer(min_max, pattern) => {
                let value = value.trim();
                match value.parse::<i128>() {
                    Ok(v) => {
                        min_max.is_valid(v)
                            && pattern.as_ref().map_or(true, |p| p.is_valid(value))
                    }
                    Err(_) => false,
                }
            }
            XsdDatatypes::Decimal(pattern) => {
                let value = value.trim();
                DECIMAL_RE.is_match(value)
                    && pattern.as_ref().map_or(true, |p| p.is_valid(value))
            }
            XsdDatatypes::Double(pattern) => {
                let value = value.trim();
                DOUBLE_RE.is_match(value)
                    && pattern.as_ref().map_or(true, |p| p.is_valid(value))
            }
            XsdDatatypes::AnyUri => rfc2396_like(value.trim()),
        }
    }
}

// anyURI's lexical space is almost unrestricted; reject only characters that
// can never appear in a URI reference
fn rfc2396_like(value: &str) -> bool {
    !value.chars().any(|c| c.is_ascii_whitespace() || c == '<' || c == '>' || c == '"')
}

#[derive(PartialEq, Eq, Hash, Clone, Debug)]
pub enum XsdDatatypeValues {
    String(String),
    Token(String),
    Boolean(bool),
    Integer(i128),
}

impl super::Datatype for XsdDatatypeValues {
    fn is_valid(&self, value: &str) -> bool {
        match self {
            XsdDatatypeValues::String(v) => v == value,
            XsdDatatypeValues::Token(v) => v == &normalize_whitespace(value),
            XsdDatatypeValues::Boolean(v) => {
                matches!(
                    (value.trim(), v),
                    ("true", true) | ("1", true) | ("false", false) | ("0", false)
                )
            }
            XsdDatatypeValues::Integer(v) => value.trim().parse::<i128>() == Ok(*v),
        }
    }
}

#[derive(Debug)]
pub enum XsdDatatypeError {
    Facet {
        type_name: &'static str,
        facet: FacetError,
    },
    UnsupportedDatatype {
        span: Span,
        name: String,
    },
    InvalidValueOfType {
        span: Span,
        type_name: &'static str,
    },
}

#[derive(Debug)]
pub enum FacetError {
    ConflictingFacet(&'static str),
    InvalidInt(Span, String),
    InvalidPattern(Span, regex::Error),
    InvalidFacet(Span, String),
}

#[derive(PartialEq, Eq, Hash, Clone, Debug)]
pub enum LengthFacet {
    Unbounded,
    MinLength(usize),
    MaxLength(usize),
    MinMaxLength(usize, usize),
    Length(usize),
}
impl LengthFacet {
    fn is_valid(&self, value: &str) -> bool {
        let actual = value.chars().count();
        match self {
            LengthFacet::Unbounded => true,
            LengthFacet::MinLength(min) => *min <= actual,
            LengthFacet::MaxLength(max) => actual <= *max,
            LengthFacet::MinMaxLength(min, max) => *min <= actual && actual <= *max,
            LengthFacet::Length(len) => actual == *len,
        }
    }

    fn merge(&mut self, other: LengthFacet) -> Result<(), FacetError> {
        *self = match (&*self, other) {
            (LengthFacet::Unbounded, other) => other,
            (LengthFacet::MinLength(min), LengthFacet::MaxLength(max)) => {
                if *min > max {
                    return Err(FacetError::ConflictingFacet(
                        "minLength greater than maxLength",
                    ));
                }
                LengthFacet::MinMaxLength(*min, max)
            }
            (LengthFacet::MaxLength(max), LengthFacet::MinLength(min)) => {
                if min > *max {
                    return Err(FacetError::ConflictingFacet(
                        "minLength greater than maxLength",
                    ));
                }
                LengthFacet::MinMaxLength(min, *max)
            }
            _ => return Err(FacetError::ConflictingFacet("length")),
        };
        Ok(())
    }
}

#[derive(PartialEq, Eq, Hash, Clone, Debug, Default)]
pub struct MinMaxFacet {
    min: Option<i128>,
    max: Option<i128>,
}
impl MinMaxFacet {
    fn bounded(min: i128, max: i128) -> MinMaxFacet {
        MinMaxFacet {
            min: Some(min),
            max: Some(max),
        }
    }
    fn min_at_least(min: i128) -> MinMaxFacet {
        MinMaxFacet {
            min: Some(min),
            max: None,
        }
    }
    fn max_at_most(max: i128) -> MinMaxFacet {
        MinMaxFacet {
            min: None,
            max: Some(max),
        }
    }

    // user facets may only tighten the type's intrinsic bounds
    fn tighten_min(&mut self, min: i128) {
        self.min = Some(self.min.map_or(min, |m| m.max(min)));
    }
    fn tighten_max(&mut self, max: i128) {
        self.max = Some(self.max.map_or(max, |m| m.min(max)));
    }

    fn is_valid(&self, v: i128) -> bool {
        self.min.map_or(true, |min| min <= v) && self.max.map_or(true, |max| v <= max)
    }
}

#[derive(Clone)]
pub struct PatternFacet(String, regex::Regex);
impl PartialEq for PatternFacet {
    fn eq(&self, other: &Self) -> bool {
        self.0 == other.0
    }
}
impl Eq for PatternFacet {}
impl std::hash::Hash for PatternFacet {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.0.hash(state)
    }
}
impl fmt::Debug for PatternFacet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> Result<(), fmt::Error> {
        f.debug_tuple("PatternFacet").field(&self.0).finish()
    }
}
impl PatternFacet {
    fn is_valid(&self, value: &str) -> bool {
        self.1.is_match(value)
    }
}

#[derive(Default)]
pub struct Compiler;

impl super::DatatypeCompiler for Compiler {
    type DT = XsdDatatypes;
    type DTValue = XsdDatatypeValues;
    type Error = XsdDatatypeError;

    fn datatype_value(&self, name: &NcName, value: &str) -> Result<Self::DTValue, Self::Error> {
        match &name.1[..] {
            "string" => Ok(XsdDatatypeValues::String(value.to_string())),
            "token" | "NCName" | "Name" | "NMTOKEN" | "anyURI" => {
                Ok(XsdDatatypeValues::Token(normalize_whitespace(value)))
            }
            "boolean" => match value.trim() {
                "true" | "1" => Ok(XsdDatatypeValues::Boolean(true)),
                "false" | "0" => Ok(XsdDatatypeValues::Boolean(false)),
                _ => Err(XsdDatatypeError::InvalidValueOfType {
                    span: name.0.clone(),
                    type_name: "boolean",
                }),
            },
            t if integer_bounds(t).is_some() => value.trim().parse::<i128>().ok().map_or(
                Err(XsdDatatypeError::InvalidValueOfType {
                    span: name.0.clone(),
                    type_name: "integer",
                }),
                |v| Ok(XsdDatatypeValues::Integer(v)),
            ),
            _ => Err(XsdDatatypeError::UnsupportedDatatype {
                span: name.0.clone(),
                name: name.1.clone(),
            }),
        }
    }

    fn datatype_name(&self, name: &NcName, params: &[Param]) -> Result<Self::DT, Self::Error> {
        match &name.1[..] {
            "string" => Ok(XsdDatatypes::String(self.string_facets("string", params)?)),
            "token" => Ok(XsdDatatypes::Token(self.string_facets("token", params)?)),
            "NCName" | "ID" | "IDREF" => {
                Ok(XsdDatatypes::NcName(self.string_facets("NCName", params)?))
            }
            "Name" => Ok(XsdDatatypes::Name(self.string_facets("Name", params)?)),
            "NMTOKEN" => Ok(XsdDatatypes::NmToken(self.string_facets("NMTOKEN", params)?)),
            "boolean" => {
                self.no_params("boolean", params)?;
                Ok(XsdDatatypes::Boolean)
            }
            "decimal" => Ok(XsdDatatypes::Decimal(self.pattern_only("decimal", params)?)),
            "double" | "float" => Ok(XsdDatatypes::Double(self.pattern_only("double", params)?)),
            "anyURI" => {
                self.no_params("anyURI", params)?;
                Ok(XsdDatatypes::AnyUri)
            }
            t => match integer_bounds(t) {
                Some(bounds) => {
                    let (min_max, pattern) = self.integer_facets(bounds, params)?;
                    Ok(XsdDatatypes::Integer(min_max, pattern))
                }
                None => Err(XsdDatatypeError::UnsupportedDatatype {
                    span: name.0.clone(),
                    name: name.1.clone(),
                }),
            },
        }
    }
}

/// Intrinsic bounds for the integer-derived types we support
fn integer_bounds(name: &str) -> Option<MinMaxFacet> {
    Some(match name {
        "integer" => MinMaxFacet::default(),
        "long" => MinMaxFacet::bounded(i64::MIN as i128, i64::MAX as i128),
        "int" => MinMaxFacet::bounded(i32::MIN as i128, i32::MAX as i128),
        "short" => MinMaxFacet::bounded(i16::MIN as i128, i16::MAX as i128),
        "byte" => MinMaxFacet::bounded(i8::MIN as i128, i8::MAX as i128),
        "nonNegativeInteger" => MinMaxFacet::min_at_least(0),
        "positiveInteger" => MinMaxFacet::min_at_least(1),
        "nonPositiveInteger" => MinMaxFacet::max_at_most(0),
        "negativeInteger" => MinMaxFacet::max_at_most(-1),
        "unsignedLong" => MinMaxFacet::bounded(0, u64::MAX as i128),
        "unsignedInt" => MinMaxFacet::bounded(0, u32::MAX as i128),
        "unsignedShort" => MinMaxFacet::bounded(0, u16::MAX as i128),
        "unsignedByte" => MinMaxFacet::bounded(0, u8::MAX as i128),
        _ => return None,
    })
}

impl Compiler {
    fn no_params(
        &self,
        type_name: &'static str,
        params: &[Param],
    ) -> Result<(), XsdDatatypeError> {
        match params.first() {
            None => Ok(()),
            Some(p) => Err(XsdDatatypeError::Facet {
                type_name,
                facet: FacetError::InvalidFacet(p.0.clone(), (p.1).1.clone()),
            }),
        }
    }

    fn pattern_only(
        &self,
        type_name: &'static str,
        params: &[Param],
    ) -> Result<Option<PatternFacet>, XsdDatatypeError> {
        let mut pattern = None;
        for param in params {
            match &(param.1).1[..] {
                "pattern" => pattern = Some(self.pattern(type_name, param)?),
                other => {
                    return Err(XsdDatatypeError::Facet {
                        type_name,
                        facet: FacetError::InvalidFacet(param.0.clone(), other.to_string()),
                    })
                }
            }
        }
        Ok(pattern)
    }

    fn string_facets(
        &self,
        type_name: &'static str,
        params: &[Param],
    ) -> Result<StringFacets, XsdDatatypeError> {
        let mut len = LengthFacet::Unbounded;
        let mut pattern = None;
        for param in params {
            match &(param.1).1[..] {
                "length" => self.merge_len(type_name, &mut len, param, LengthFacet::Length)?,
                "minLength" => {
                    self.merge_len(type_name, &mut len, param, LengthFacet::MinLength)?
                }
                "maxLength" => {
                    self.merge_len(type_name, &mut len, param, LengthFacet::MaxLength)?
                }
                "pattern" => pattern = Some(self.pattern(type_name, param)?),
                other => {
                    return Err(XsdDatatypeError::Facet {
                        type_name,
                        facet: FacetError::InvalidFacet(param.0.clone(), other.to_string()),
                    })
                }
            }
        }
        Ok(StringFacets { len, pattern })
    }

    fn integer_facets(
        &self,
        mut min_max: MinMaxFacet,
        params: &[Param],
    ) -> Result<(MinMaxFacet, Option<PatternFacet>), XsdDatatypeError> {
        let type_name = "integer";
        let mut pattern = None;
        for param in params {
            match &(param.1).1[..] {
                "minInclusive" => min_max.tighten_min(self.int_value(type_name, param)?),
                "maxInclusive" => min_max.tighten_max(self.int_value(type_name, param)?),
                "minExclusive" => min_max.tighten_min(self.int_value(type_name, param)? + 1),
                "maxExclusive" => min_max.tighten_max(self.int_value(type_name, param)? - 1),
                "pattern" => pattern = Some(self.pattern(type_name, param)?),
                other => {
                    return Err(XsdDatatypeError::Facet {
                        type_name,
                        facet: FacetError::InvalidFacet(param.0.clone(), other.to_string()),
                    })
                }
            }
        }
        Ok((min_max, pattern))
    }

    fn merge_len(
        &self,
        type_name: &'static str,
        len: &mut LengthFacet,
        param: &Param,
        make: fn(usize) -> LengthFacet,
    ) -> Result<(), XsdDatatypeError> {
        let val = param.2.trim().parse::<usize>().map_err(|e| XsdDatatypeError::Facet {
            type_name,
            facet: FacetError::InvalidInt(param.0.clone(), e.to_string()),
        })?;
        len.merge(make(val))
            .map_err(|facet| XsdDatatypeError::Facet { type_name, facet })
    }

    fn int_value(&self, type_name: &'static str, param: &Param) -> Result<i128, XsdDatatypeError> {
        param.2.trim().parse::<i128>().map_err(|e| XsdDatatypeError::Facet {
            type_name,
            facet: FacetError::InvalidInt(param.0.clone(), e.to_string()),
        })
    }

    fn pattern(
        &self,
        type_name: &'static str,
        param: &Param,
    ) -> Result<PatternFacet, XsdDatatypeError> {
        // XSD pattern facets are implicitly anchored
        let anchored = format!("^(?:{})$", param.2);
        match regex::Regex::new(&anchored) {
            Ok(re) => Ok(PatternFacet(param.2.clone(), re)),
            Err(e) => Err(XsdDatatypeError::Facet {
                type_name,
                facet: FacetError::InvalidPattern(param.0.clone(), e),
            }),
        }
    }
}

#[derive(PartialEq, Eq, Hash, Clone, Debug)]
pub struct StringFacets {
    len: LengthFacet,
    pattern: Option<PatternFacet>,
}
impl StringFacets {
    fn is_valid(&self, value: &str) -> bool {
        self.len.is_valid(value)
            && if let Some(ref pat) = self.pattern {
                pat.is_valid(value)
            } else {
                true
            }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::datatype::{Datatype, DatatypeCompiler};
    use rngcheck_syntax::types::{NcName, Param};

    fn name(n: &str) -> NcName {
        NcName(0..0, n.to_string())
    }
    fn param(n: &str, v: &str) -> Param {
        Param(0..0, name(n), v.to_string())
    }

    #[test]
    fn boolean() {
        let c = Compiler;
        let dt = c.datatype_name(&name("boolean"), &[]).unwrap();
        assert!(dt.is_valid("true"));
        assert!(dt.is_valid(" 1 "));
        assert!(!dt.is_valid("yes"));
    }

    #[test]
    fn integer_bounds_applied() {
        let c = Compiler;
        let dt = c.datatype_name(&name("unsignedByte"), &[]).unwrap();
        assert!(dt.is_valid("255"));
        assert!(!dt.is_valid("256"));
        assert!(!dt.is_valid("-1"));
    }

    #[test]
    fn integer_facets_tighten() {
        let c = Compiler;
        let dt = c
            .datatype_name(
                &name("integer"),
                &[param("minInclusive", "10"), param("maxInclusive", "20")],
            )
            .unwrap();
        assert!(dt.is_valid("10"));
        assert!(dt.is_valid("20"));
        assert!(!dt.is_valid("9"));
        assert!(!dt.is_valid("21"));
    }

    #[test]
    fn string_length_facets() {
        let c = Compiler;
        let dt = c
            .datatype_name(&name("string"), &[param("minLength", "2"), param("maxLength", "3")])
            .unwrap();
        assert!(!dt.is_valid("a"));
        assert!(dt.is_valid("ab"));
        assert!(dt.is_valid("abc"));
        assert!(!dt.is_valid("abcd"));
    }

    #[test]
    fn pattern_facet_is_anchored() {
        let c = Compiler;
        let dt = c
            .datatype_name(&name("token"), &[param("pattern", "[a-z]+")])
            .unwrap();
        assert!(dt.is_valid("abc"));
        assert!(!dt.is_valid("abc1"));
    }

    #[test]
    fn ncname() {
        let c = Compiler;
        let dt = c.datatype_name(&name("NCName"), &[]).unwrap();
        assert!(dt.is_valid("foo-bar"));
        assert!(!dt.is_valid("foo:bar"));
        assert!(!dt.is_valid("1foo"));
    }

    #[test]
    fn unknown_type_reported() {
        let c = Compiler;
        assert_matches::assert_matches!(
            c.datatype_name(&name("gYearMonth"), &[]),
            Err(XsdDatatypeError::UnsupportedDatatype { .. })
        );
    }

    #[test]
    fn boolean_value_canonical_forms() {
        let c = Compiler;
        let v = c.datatype_value(&name("boolean"), "1").unwrap();
        assert!(v.is_valid("true"));
        assert!(v.is_valid("1"));
        assert!(!v.is_valid("false"));
    }

    #[test]
    fn integer_value_compares_in_value_space() {
        let c = Compiler;
        let v = c.datatype_value(&name("integer"), "010").unwrap();
        assert!(v.is_valid("10"));
        assert!(v.is_valid(" 10 "));
        assert!(!v.is_valid("11"));
    }
}

//! The RELAX NG built-in datatype library

use rngcheck_syntax::types::{NcName, Param, Span};

// TODO: return Cow to optimise the case when input does not require modification
pub fn normalize_whitespace(val: &str) -> String {
    let mut last_space = false;
    let mut out = String::new();
    for c in val.chars().skip_while(|c| c.is_ascii_whitespace()) {
        if c.is_ascii_whitespace() {
            last_space = true;
        } else {
            if last_space {
                out.push(' ');
            }
            out.push(c);
            last_space = false;
        }
    }
    out
}

#[derive(PartialEq, Eq, Hash, Clone, Debug)]
pub enum BuiltinDatatypeValue {
    TokenValue(String),
    StringValue(String),
}
impl super::Datatype for BuiltinDatatypeValue {
    fn is_valid(&self, value: &str) -> bool {
        match self {
            BuiltinDatatypeValue::TokenValue(val) => val == &normalize_whitespace(value),
            BuiltinDatatypeValue::StringValue(val) => val == value,
        }
    }
}

#[derive(PartialEq, Eq, Hash, Clone, Debug)]
pub enum BuiltinDatatype {
    Token,
    String,
}
impl super::Datatype for BuiltinDatatype {
    fn is_valid(&self, _value: &str) -> bool {
        match self {
            BuiltinDatatype::Token => true,
            BuiltinDatatype::String => true,
        }
    }
}

#[derive(Debug)]
pub enum Error {
    ParamNotAllowed { span: Span, name: String },
    DatatypeNameUnknown { span: Span, name: String },
}

#[derive(Default)]
pub struct Compiler;
impl super::DatatypeCompiler for Compiler {
    type DT = BuiltinDatatype;
    type DTValue = BuiltinDatatypeValue;
    type Error = Error;

    fn datatype_value(&self, name: &NcName, value: &str) -> Result<Self::DTValue, Self::Error> {
        match &name.1[..] {
            "string" => Ok(BuiltinDatatypeValue::StringValue(value.to_string())),
            "token" => Ok(BuiltinDatatypeValue::TokenValue(normalize_whitespace(value))),
            _ => Err(Error::DatatypeNameUnknown {
                span: name.0.clone(),
                name: name.1.clone(),
            }),
        }
    }

    fn datatype_name(&self, name: &NcName, params: &[Param]) -> Result<Self::DT, Self::Error> {
        if let Some(p) = params.first() {
            return Err(Error::ParamNotAllowed {
                span: p.0.clone(),
                name: (p.1).1.clone(),
            });
        }
        match &name.1[..] {
            "string" => Ok(BuiltinDatatype::String),
            "token" => Ok(BuiltinDatatype::Token),
            _ => Err(Error::DatatypeNameUnknown {
                span: name.0.clone(),
                name: name.1.clone(),
            }),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::datatype::Datatype;

    #[test]
    fn test_normalize() {
        assert_eq!(normalize_whitespace(""), "");
        assert_eq!(normalize_whitespace(" "), "");
        assert_eq!(normalize_whitespace("  "), "");
        assert_eq!(normalize_whitespace("a "), "a");
        assert_eq!(normalize_whitespace(" a"), "a");
        assert_eq!(normalize_whitespace("a a"), "a a");
        assert_eq!(normalize_whitespace("\na\t a\r"), "a a");
    }

    #[test]
    fn token_value_normalizes() {
        let v = BuiltinDatatypeValue::TokenValue("a b".to_string());
        assert!(v.is_valid(" a\tb "));
        assert!(!v.is_valid("ab"));
    }
}

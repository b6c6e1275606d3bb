//! AST and parser for the RELAX NG XML grammar syntax, including the
//! draft-era `key`/`keyRef` attributes on data patterns.

pub mod types;
pub mod xml;

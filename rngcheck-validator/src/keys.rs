//! Cross-document key/keyRef integrity checking.
//!
//! The validator reports key declarations and references here as atoms with
//! key uses match; completeness is judged once, at end of document.  Tables
//! are created lazily per key name and live for the whole document.

use crate::session::{Diagnostic, DiagnosticKind};
use std::collections::HashMap;
use std::ops::Range;

#[derive(Default)]
pub struct KeyChecker {
    tables: HashMap<String, HashMap<String, KeyRecord>>,
}

#[derive(Default)]
struct KeyRecord {
    defined: bool,
    ref_spans: Vec<Range<usize>>,
}

impl KeyChecker {
    fn lookup(&mut self, name: &str, value: &str) -> &mut KeyRecord {
        self.tables
            .entry(name.to_string())
            .or_insert_with(HashMap::new)
            .entry(value.to_string())
            .or_insert_with(KeyRecord::default)
    }

    /// Records a key declaration; a second declaration of the same
    /// name/value is reported at the second occurrence's location
    pub fn declare_key(
        &mut self,
        name: &str,
        value: &str,
        span: Range<usize>,
    ) -> Option<Diagnostic> {
        let record = self.lookup(name, value);
        if record.defined {
            return Some(Diagnostic {
                kind: DiagnosticKind::DuplicateKey {
                    key: name.to_string(),
                    value: value.to_string(),
                },
                span,
            });
        }
        record.defined = true;
        // references seen before the declaration are now satisfied
        record.ref_spans.clear();
        None
    }

    /// Records a key reference; resolution is deferred until end of document
    /// unless the key is already defined
    pub fn declare_key_ref(&mut self, name: &str, value: &str, span: Range<usize>) {
        let record = self.lookup(name, value);
        if !record.defined {
            record.ref_spans.push(span);
        }
    }

    /// End-of-document sweep: one diagnostic per referencing occurrence of a
    /// key that was never declared
    pub fn check_complete(&self) -> Vec<Diagnostic> {
        let mut out = Vec::new();
        for (name, table) in &self.tables {
            for (value, record) in table {
                if !record.defined {
                    for span in &record.ref_spans {
                        out.push(Diagnostic {
                            kind: DiagnosticKind::UndefinedKeyRef {
                                key: name.clone(),
                                value: value.clone(),
                            },
                            span: span.clone(),
                        });
                    }
                }
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::DiagnosticKind;

    #[test]
    fn duplicate_key_reported_at_second_occurrence() {
        let mut k = KeyChecker::default();
        assert!(k.declare_key("id", "a", 0..1).is_none());
        let dup = k.declare_key("id", "a", 10..11).unwrap();
        assert_eq!(dup.span, 10..11);
        assert!(matches!(dup.kind, DiagnosticKind::DuplicateKey { .. }));
        // same value under a different key name is fine
        assert!(k.declare_key("other", "a", 20..21).is_none());
    }

    #[test]
    fn forward_reference_resolves() {
        let mut k = KeyChecker::default();
        k.declare_key_ref("id", "a", 0..1);
        assert!(k.declare_key("id", "a", 5..6).is_none());
        assert!(k.check_complete().is_empty());
    }

    #[test]
    fn undefined_keyref_one_diagnostic_per_occurrence() {
        let mut k = KeyChecker::default();
        k.declare_key_ref("id", "missing", 0..1);
        k.declare_key_ref("id", "missing", 5..6);
        k.declare_key("id", "present", 10..11);
        let out = k.check_complete();
        assert_eq!(out.len(), 2);
    }
}

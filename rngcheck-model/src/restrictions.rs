//! Static well-formedness checks on the compiled pattern graph.
//!
//! Two passes run after compilation: `check_recursion` rejects definition
//! cycles that are not broken by an intervening element pattern (such graphs
//! cannot be expanded), and `check_restrictions` reports structural
//! restrictions — the start pattern may only contain element, choice, ref and
//! notAllowed; attribute patterns are forbidden in certain contexts; and the
//! attributes of one element must not have overlapping name classes.

use crate::model::{DefineRule, NameClass, Pattern};
use crate::SchemaError;
use std::collections::HashSet;

/// Rejects recursive definitions that are not guarded by an element pattern.
/// Fatal: an unguarded cycle cannot be expanded into a usable graph.
pub fn check_recursion(rule: &DefineRule) -> Result<(), SchemaError> {
    let mut gray = Vec::new();
    let mut visiting = HashSet::new();
    let mut done = HashSet::new();
    walk_recursion(rule.pattern(), &mut gray, &mut visiting, &mut done)
}

fn walk_recursion(
    p: &Pattern,
    gray: &mut Vec<usize>,
    visiting: &mut HashSet<usize>,
    done: &mut HashSet<usize>,
) -> Result<(), SchemaError> {
    match p {
        Pattern::Choice(v) | Pattern::Interleave(v) | Pattern::Group(v) => {
            for c in v {
                walk_recursion(c, gray, visiting, done)?;
            }
            Ok(())
        }
        Pattern::Mixed(c)
        | Pattern::Optional(c)
        | Pattern::ZeroOrMore(c)
        | Pattern::OneOrMore(c)
        | Pattern::List(c)
        | Pattern::Attribute(_, c) => walk_recursion(c, gray, visiting, done),
        Pattern::Element(_, c) => {
            // the element guards its content, so references back into the
            // current path are permitted from here on
            let mut fresh = Vec::new();
            walk_recursion(c, &mut fresh, visiting, done)
        }
        Pattern::Ref(span, name, r) => {
            let ptr = r.0.as_ptr() as usize;
            if gray.contains(&ptr) {
                return Err(SchemaError::RecursiveReference {
                    name: name.clone(),
                    span: *span,
                });
            }
            if visiting.contains(&ptr) || done.contains(&ptr) {
                return Ok(());
            }
            visiting.insert(ptr);
            gray.push(ptr);
            if let Some(rule) = r.0.borrow().as_ref() {
                walk_recursion(rule.pattern(), gray, visiting, done)?;
            }
            gray.pop();
            visiting.remove(&ptr);
            done.insert(ptr);
            Ok(())
        }
        Pattern::Data {
            except: Some(e), ..
        } => walk_recursion(e, gray, visiting, done),
        Pattern::Empty
        | Pattern::Text
        | Pattern::NotAllowed
        | Pattern::Value { .. }
        | Pattern::Data { except: None, .. } => Ok(()),
    }
}

/// Reports (without aborting) the structural restrictions on the compiled
/// pattern graph
pub fn check_restrictions(rule: &DefineRule, errors: &mut Vec<SchemaError>) {
    let span = *rule.span();
    let mut seen = HashSet::new();
    check_start(rule.pattern(), span, &mut seen, errors);
    let mut seen = HashSet::new();
    check_pattern(rule.pattern(), WalkContext::default(), span, &mut seen, errors);
}

// The start pattern must only contain element, choice, ref, and notAllowed

fn check_start(
    pattern: &Pattern,
    span: codemap::Span,
    seen: &mut HashSet<usize>,
    errors: &mut Vec<SchemaError>,
) {
    let key = match pattern {
        Pattern::Element(_, _) | Pattern::NotAllowed => return,
        Pattern::Choice(alternatives) => {
            for alt in alternatives {
                check_start(alt, span, seen, errors);
            }
            return;
        }
        Pattern::Ref(ref_span, _name, r) => {
            let ptr = r.0.as_ptr() as usize;
            if !seen.insert(ptr) {
                return;
            }
            if let Some(rule) = r.0.borrow().as_ref() {
                check_start(rule.pattern(), *ref_span, seen, errors);
            }
            return;
        }
        Pattern::Text => "start_contains_text",
        Pattern::Empty => "start_contains_empty",
        Pattern::Attribute(_, _) => "start_contains_attribute",
        Pattern::Data { .. } => "start_contains_data",
        Pattern::Value { .. } => "start_contains_value",
        Pattern::List(_) => "start_contains_list",
        Pattern::Group(_) => "start_contains_group",
        Pattern::Interleave(_) | Pattern::Mixed(_) => "start_contains_interleave",
        Pattern::OneOrMore(_) | Pattern::ZeroOrMore(_) | Pattern::Optional(_) => {
            "start_contains_one_or_more"
        }
    };
    errors.push(SchemaError::RestrictionViolation { span, key });
}

/// Which restriction-relevant constructs enclose the pattern being walked
#[derive(Default, Clone, Copy)]
struct WalkContext {
    in_attribute: bool,
    in_list: bool,
    in_data_except: bool,
    in_one_or_more: bool,
    in_one_or_more_group: bool,
}

impl WalkContext {
    fn bits(&self) -> usize {
        (self.in_attribute as usize)
            | (self.in_list as usize) << 1
            | (self.in_data_except as usize) << 2
            | (self.in_one_or_more as usize) << 3
            | (self.in_one_or_more_group as usize) << 4
    }
}

fn check_pattern(
    pattern: &Pattern,
    ctx: WalkContext,
    span: codemap::Span,
    seen: &mut HashSet<(usize, usize)>,
    errors: &mut Vec<SchemaError>,
) {
    match pattern {
        Pattern::Element(_, content) => {
            let mut reported = false;
            let mut ref_seen = HashSet::new();
            collect_attributes(content, span, &mut ref_seen, &mut reported, errors);
            check_pattern(content, WalkContext::default(), span, seen, errors);
        }
        Pattern::Attribute(_, content) => {
            if ctx.in_attribute {
                errors.push(SchemaError::RestrictionViolation {
                    span,
                    key: "attribute_in_attribute",
                });
            }
            if ctx.in_list {
                errors.push(SchemaError::RestrictionViolation {
                    span,
                    key: "attribute_in_list",
                });
            }
            if ctx.in_data_except {
                errors.push(SchemaError::RestrictionViolation {
                    span,
                    key: "attribute_in_data_except",
                });
            }
            if ctx.in_one_or_more_group {
                errors.push(SchemaError::RestrictionViolation {
                    span,
                    key: "attribute_in_one_or_more_group",
                });
            }
            let mut child = ctx;
            child.in_attribute = true;
            check_pattern(content, child, span, seen, errors);
        }
        Pattern::List(content) => {
            let mut child = ctx;
            child.in_list = true;
            check_pattern(content, child, span, seen, errors);
        }
        Pattern::Data {
            except: Some(e), ..
        } => {
            let mut child = ctx;
            child.in_data_except = true;
            check_pattern(e, child, span, seen, errors);
        }
        Pattern::OneOrMore(content) | Pattern::ZeroOrMore(content) => {
            let mut child = ctx;
            child.in_one_or_more = true;
            check_pattern(content, child, span, seen, errors);
        }
        Pattern::Group(v) | Pattern::Interleave(v) => {
            let mut child = ctx;
            if ctx.in_one_or_more {
                child.in_one_or_more_group = true;
            }
            for c in v {
                check_pattern(c, child, span, seen, errors);
            }
        }
        Pattern::Choice(v) => {
            for c in v {
                check_pattern(c, ctx, span, seen, errors);
            }
        }
        Pattern::Optional(content) | Pattern::Mixed(content) => {
            check_pattern(content, ctx, span, seen, errors);
        }
        Pattern::Ref(ref_span, _name, r) => {
            let ptr = r.0.as_ptr() as usize;
            if !seen.insert((ptr, ctx.bits())) {
                return;
            }
            if let Some(rule) = r.0.borrow().as_ref() {
                check_pattern(rule.pattern(), ctx, *ref_span, seen, errors);
            }
        }
        Pattern::Empty | Pattern::Text | Pattern::NotAllowed | Pattern::Value { .. } => {}
        Pattern::Data { except: None, .. } => {}
    }
}

/// Collects the attribute name classes one element's content can require,
/// reporting an overlap between group/interleave arms at most once per element
fn collect_attributes(
    pattern: &Pattern,
    span: codemap::Span,
    seen: &mut HashSet<usize>,
    reported: &mut bool,
    errors: &mut Vec<SchemaError>,
) -> Vec<NameClass> {
    match pattern {
        Pattern::Attribute(nc, _) => vec![nc.clone()],
        Pattern::Group(v) | Pattern::Interleave(v) => {
            let groups: Vec<Vec<NameClass>> = v
                .iter()
                .map(|c| collect_attributes(c, span, seen, reported, errors))
                .collect();
            if !*reported {
                'outer: for i in 0..groups.len() {
                    for j in i + 1..groups.len() {
                        for a in &groups[i] {
                            for b in &groups[j] {
                                if a.overlaps(b) {
                                    errors.push(SchemaError::RestrictionViolation {
                                        span,
                                        key: "duplicate_attributes",
                                    });
                                    *reported = true;
                                    break 'outer;
                                }
                            }
                        }
                    }
                }
            }
            groups.into_iter().flatten().collect()
        }
        Pattern::Choice(v) => v
            .iter()
            .flat_map(|c| collect_attributes(c, span, seen, reported, errors))
            .collect(),
        Pattern::Optional(c)
        | Pattern::OneOrMore(c)
        | Pattern::ZeroOrMore(c)
        | Pattern::Mixed(c)
        | Pattern::List(c) => collect_attributes(c, span, seen, reported, errors),
        Pattern::Ref(_, _, r) => {
            let ptr = r.0.as_ptr() as usize;
            if !seen.insert(ptr) {
                return vec![];
            }
            match r.0.borrow().as_ref() {
                Some(rule) => collect_attributes(rule.pattern(), span, seen, reported, errors),
                None => vec![],
            }
        }
        // a nested element's attributes belong to that element
        Pattern::Element(_, _) => vec![],
        Pattern::Empty
        | Pattern::Text
        | Pattern::NotAllowed
        | Pattern::Data { .. }
        | Pattern::Value { .. } => vec![],
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Compiler, Files, SchemaError};
    use std::io;
    use std::path::{Path, PathBuf};

    struct FS(&'static str);
    impl Files for FS {
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

    fn restriction_keys(schema: &'static str) -> Vec<&'static str> {
        let mut c = Compiler::new(FS(schema));
        let g = c.compile(Path::new("main.rng")).expect("compile failed");
        g.errors
            .iter()
            .filter_map(|e| match e {
                SchemaError::RestrictionViolation { key, .. } => Some(*key),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn start_with_text_rejected() {
        let keys = restriction_keys(
            r#"<grammar xmlns="http://relaxng.org/ns/structure/1.0">
                 <start><text/></start>
               </grammar>"#,
        );
        assert_eq!(keys, vec!["start_contains_text"]);
    }

    #[test]
    fn start_with_data_rejected() {
        let keys = restriction_keys(
            r#"<grammar xmlns="http://relaxng.org/ns/structure/1.0">
                 <start><data type="token"/></start>
               </grammar>"#,
        );
        assert_eq!(keys, vec!["start_contains_data"]);
    }

    #[test]
    fn start_choice_of_elements_fine() {
        let keys = restriction_keys(
            r#"<grammar xmlns="http://relaxng.org/ns/structure/1.0">
                 <start><choice>
                   <element name="a"><empty/></element>
                   <element name="b"><empty/></element>
                 </choice></start>
               </grammar>"#,
        );
        assert!(keys.is_empty());
    }

    #[test]
    fn duplicate_attribute_in_group() {
        let keys = restriction_keys(
            r#"<element name="e" xmlns="http://relaxng.org/ns/structure/1.0">
                 <group>
                   <attribute name="id"/>
                   <attribute name="id"/>
                 </group>
               </element>"#,
        );
        assert_eq!(keys, vec!["duplicate_attributes"]);
    }

    #[test]
    fn same_attribute_in_both_choice_arms_fine() {
        let keys = restriction_keys(
            r#"<element name="e" xmlns="http://relaxng.org/ns/structure/1.0">
                 <choice>
                   <attribute name="id"/>
                   <attribute name="id"><data type="token"/></attribute>
                 </choice>
               </element>"#,
        );
        assert!(keys.is_empty());
    }

    #[test]
    fn choice_arm_attribute_duplicated_by_sibling() {
        // whichever arm the choice takes, "a" would repeat within one element
        let keys = restriction_keys(
            r#"<element name="e" xmlns="http://relaxng.org/ns/structure/1.0">
                 <group>
                   <choice><attribute name="a"/><attribute name="b"/></choice>
                   <attribute name="a"/>
                 </group>
               </element>"#,
        );
        assert_eq!(keys, vec!["duplicate_attributes"]);
    }

    #[test]
    fn attribute_in_list_rejected() {
        let keys = restriction_keys(
            r#"<element name="e" xmlns="http://relaxng.org/ns/structure/1.0">
                 <list><attribute name="a"/></list>
               </element>"#,
        );
        assert_eq!(keys, vec!["attribute_in_list"]);
    }
}

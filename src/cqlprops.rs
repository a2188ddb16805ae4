//! Extraction of searchable properties from CQL queries.
//!
//! Only `advanced` queries are written in CQL; the extractor walks the query
//! text and collects:
//!
//! - positional attributes and their values (`[lemma="x" & tag="N.*"]`),
//! - structures (`<s>`, `within <text ...>`),
//! - structural attributes (`<text txtypegroup="FIC: beletrie">` yields the
//!   structure `text` plus the attribute `text.txtypegroup`).
//!
//! A bare quoted token (`"party"`) is a positional constraint on the form's
//! default attribute.
//!
//! `simple` queries are not CQL; the workbench embeds a pre-parsed
//! nested-list structure in the form which
//! [`extract_simple_query_props`] decodes. Its shape is only loosely
//! guaranteed, so every violated assumption is a per-record warning, never a
//! failure.

use anyhow::{bail, Result};
use std::iter::Peekable;
use std::str::Chars;

use crate::docs::MidConc;

/// One property extracted from a CQL query.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CqlProp {
    pub structure: String,
    pub name: String,
    pub value: String,
}

impl CqlProp {
    pub fn is_struct_attr(&self) -> bool {
        !self.structure.is_empty() && !self.name.is_empty()
    }

    pub fn is_structure(&self) -> bool {
        !self.structure.is_empty() && self.name.is_empty()
    }

    pub fn is_posattr(&self) -> bool {
        self.structure.is_empty()
    }
}

/// Walks a CQL query and extracts all attribute/structure properties.
///
/// The scanner is intentionally tolerant of operators and repetition
/// syntax it does not understand; only unterminated brackets or strings are
/// errors (the query is then reported as unparseable and indexed without
/// extracted properties).
pub fn extract_props(query: &str) -> Result<Vec<CqlProp>> {
    let mut props = Vec::new();
    let mut chars = query.chars().peekable();
    while let Some(ch) = chars.next() {
        match ch {
            '[' => parse_attr_block(&mut chars, "", ']', &mut props)?,
            '<' => {
                if chars.peek() == Some(&'/') {
                    // closing tag of a structure range, no new information
                    skip_until(&mut chars, '>');
                    continue;
                }
                skip_ws(&mut chars);
                let name = read_ident(&mut chars);
                if name.is_empty() {
                    bail!("invalid structure expression in query");
                }
                props.push(CqlProp {
                    structure: name.clone(),
                    name: String::new(),
                    value: String::new(),
                });
                parse_attr_block(&mut chars, &name, '>', &mut props)?;
            }
            '"' => {
                // a bare quoted token constrains the default attribute
                let value = read_quoted(&mut chars)?;
                props.push(CqlProp {
                    structure: String::new(),
                    name: String::new(),
                    value,
                });
            }
            _ => {}
        }
    }
    Ok(props)
}

/// Parses `name="value"` pairs up to the closing delimiter, attaching them
/// to `structure` (empty for positional blocks).
fn parse_attr_block(
    chars: &mut Peekable<Chars>,
    structure: &str,
    end: char,
    props: &mut Vec<CqlProp>,
) -> Result<()> {
    loop {
        skip_ws(chars);
        let Some(&ch) = chars.peek() else {
            bail!("unterminated `{}` block in query", if end == ']' { '[' } else { '<' });
        };
        if ch == end {
            chars.next();
            return Ok(());
        }
        if ch == '"' {
            chars.next();
            let value = read_quoted(chars)?;
            props.push(CqlProp {
                structure: structure.to_owned(),
                name: String::new(),
                value,
            });
            continue;
        }
        if ch.is_alphabetic() || ch == '_' {
            let name = read_ident(chars);
            skip_ws(chars);
            if chars.peek() == Some(&'!') {
                chars.next();
            }
            if chars.peek() == Some(&'=') {
                chars.next();
                skip_ws(chars);
                if chars.peek() == Some(&'"') {
                    chars.next();
                    let value = read_quoted(chars)?;
                    props.push(CqlProp {
                        structure: structure.to_owned(),
                        name,
                        value,
                    });
                    continue;
                }
            }
            // identifier without a recognized comparison (e.g. a keyword);
            // nothing to record
            continue;
        }
        // operators, parentheses, repetition syntax
        chars.next();
    }
}

fn read_ident(chars: &mut Peekable<Chars>) -> String {
    let mut ans = String::new();
    while let Some(&ch) = chars.peek() {
        if ch.is_alphanumeric() || ch == '_' || ch == '.' {
            ans.push(ch);
            chars.next();
        } else {
            break;
        }
    }
    ans
}

/// Reads a quoted value; the opening quote is already consumed.
fn read_quoted(chars: &mut Peekable<Chars>) -> Result<String> {
    let mut ans = String::new();
    while let Some(ch) = chars.next() {
        match ch {
            '\\' => {
                if let Some(esc) = chars.next() {
                    ans.push(esc);
                }
            }
            '"' => return Ok(ans),
            _ => ans.push(ch),
        }
    }
    bail!("unterminated string in query")
}

fn skip_ws(chars: &mut Peekable<Chars>) {
    while chars.peek().map(|c| c.is_whitespace()).unwrap_or(false) {
        chars.next();
    }
}

fn skip_until(chars: &mut Peekable<Chars>, end: char) {
    for ch in chars.by_ref() {
        if ch == end {
            break;
        }
    }
}

/// Parses the advanced queries stored in `doc` and folds the used
/// attributes, structures and values into the document's properties.
/// Queries of other types are left to [`extract_simple_query_props`].
pub fn extract_query_props(doc: &mut MidConc, default_attr: &str) -> Result<()> {
    let raw_queries = doc.raw_queries.clone();
    for rq in &raw_queries {
        if rq.query_type != "advanced" {
            continue;
        }
        let props = extract_props(&rq.value)?;
        for prop in props {
            if prop.is_struct_attr() {
                let key = format!("{}.{}", prop.structure, prop.name);
                doc.add_struct_attr(&key, &prop.value);
            } else if prop.is_structure() {
                doc.add_structure(&prop.structure);
            } else if prop.is_posattr() {
                if !prop.name.is_empty() {
                    doc.add_pos_attr(&prop.name, &prop.value);
                } else {
                    doc.add_pos_attr(default_attr, &prop.value);
                }
            }
        }
    }
    Ok(())
}

/// Decodes the pre-parsed simple-query structure the workbench embeds in
/// conc forms: per corpus a list of conjunctions, each conjunction holding a
/// token list, each token a `[[attr, ...], value]` pair. Every attribute
/// listed for a token contributes a positional property.
pub fn extract_simple_query_props(parsed: &serde_json::Value, doc: &mut MidConc) {
    let Some(queries) = parsed.as_object() else {
        tracing::warn!("simple query proc warn: parsed queries are not an object");
        return;
    };
    for query_rec in queries.values() {
        let Some(conjunctions) = query_rec.as_array() else {
            tracing::warn!("simple query proc warn: failed to unpack conjunction list");
            continue;
        };
        for conj_rec in conjunctions {
            let Some(tuple) = conj_rec.as_array() else {
                tracing::warn!("simple query proc warn: failed to unpack conjunction record");
                continue;
            };
            let Some(query_tokens) = tuple.first().and_then(|v| v.as_array()) else {
                tracing::warn!(
                    "simple query proc warn: failed to unpack properties part of a conjunction record item"
                );
                continue;
            };
            //    [  [lemma sublemma word] poklad  ]
            for token in query_tokens {
                let Some(token_props) = token.as_array() else {
                    tracing::warn!("simple query proc warn: failed to parse token props");
                    continue;
                };
                let Some(attrs) = token_props.first().and_then(|v| v.as_array()) else {
                    tracing::warn!("simple query proc warn: failed to determine attribute list");
                    continue;
                };
                let Some(value) = token_props.get(1).and_then(|v| v.as_str()) else {
                    tracing::warn!("simple query proc warn: failed to determine query value");
                    continue;
                };
                for attr in attrs {
                    let Some(attr_name) = attr.as_str() else {
                        tracing::warn!(
                            ?attr,
                            "simple query proc warn: type assertion for an attribute name failed"
                        );
                        continue;
                    };
                    doc.add_pos_attr(attr_name, value);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{QuerySupertype, RawQuery};
    use std::collections::BTreeMap;

    fn empty_conc(raw_queries: Vec<RawQuery>) -> MidConc {
        MidConc {
            id: "X".to_owned(),
            name: None,
            query_supertype: QuerySupertype::Conc,
            created: chrono::DateTime::from_timestamp(0, 0).unwrap().naive_utc(),
            user_id: 1,
            corpora: vec![],
            subcorpus: String::new(),
            raw_queries,
            structures: vec![],
            struct_attrs: BTreeMap::new(),
            pos_attrs: BTreeMap::new(),
        }
    }

    fn advanced(q: &str) -> RawQuery {
        RawQuery {
            value: q.to_owned(),
            query_type: "advanced".to_owned(),
        }
    }

    #[test]
    fn extracts_pos_attrs_structures_and_struct_attrs() {
        let mut doc = empty_conc(vec![advanced(
            r#"[word="hi|hello"] [lemma="people" & tag="N.*" & word="p.*"] within <text txtypegroup="FIC: beletrie">"#,
        )]);
        extract_query_props(&mut doc, "word").unwrap();
        assert_eq!(doc.pos_attrs["word"], vec!["hi|hello", "p.*"]);
        assert_eq!(doc.pos_attrs["lemma"], vec!["people"]);
        assert_eq!(doc.pos_attrs["tag"], vec!["N.*"]);
        assert_eq!(doc.structures, vec!["text"]);
        assert_eq!(doc.struct_attrs["text.txtypegroup"], vec!["FIC: beletrie"]);
    }

    #[test]
    fn bare_quoted_token_goes_to_default_attr() {
        let mut doc = empty_conc(vec![advanced(r#""party""#)]);
        extract_query_props(&mut doc, "word").unwrap();
        assert_eq!(doc.pos_attrs["word"], vec!["party"]);
    }

    #[test]
    fn negated_comparison_still_records_the_value() {
        let mut doc = empty_conc(vec![advanced(r#"[tag!="N.*"]"#)]);
        extract_query_props(&mut doc, "word").unwrap();
        assert_eq!(doc.pos_attrs["tag"], vec!["N.*"]);
    }

    #[test]
    fn simple_queries_are_skipped() {
        let mut doc = empty_conc(vec![RawQuery {
            value: "voda".to_owned(),
            query_type: "simple".to_owned(),
        }]);
        extract_query_props(&mut doc, "word").unwrap();
        assert!(doc.pos_attrs.is_empty());
    }

    #[test]
    fn closing_tags_and_escapes_are_handled() {
        let mut doc = empty_conc(vec![advanced(r#"<s> [word="a\"b"] </s>"#)]);
        extract_query_props(&mut doc, "word").unwrap();
        assert_eq!(doc.structures, vec!["s"]);
        assert_eq!(doc.pos_attrs["word"], vec!["a\"b"]);
    }

    #[test]
    fn unterminated_query_is_an_error() {
        let mut doc = empty_conc(vec![advanced(r#"[lemma="x"#)]);
        assert!(extract_query_props(&mut doc, "word").is_err());
    }

    #[test]
    fn simple_query_structure_decodes_token_attrs() {
        let mut doc = empty_conc(vec![]);
        let parsed = serde_json::json!({
            "corpC": [
                [ [ [["lemma", "sublemma", "word"], "poklad"] ] ]
            ]
        });
        extract_simple_query_props(&parsed, &mut doc);
        assert_eq!(doc.pos_attrs["lemma"], vec!["poklad"]);
        assert_eq!(doc.pos_attrs["sublemma"], vec!["poklad"]);
        assert_eq!(doc.pos_attrs["word"], vec!["poklad"]);
    }

    #[test]
    fn malformed_simple_query_is_ignored() {
        let mut doc = empty_conc(vec![]);
        extract_simple_query_props(&serde_json::json!(["not", "an", "object"]), &mut doc);
        extract_simple_query_props(&serde_json::json!({"corpC": [[42]]}), &mut doc);
        assert!(doc.pos_attrs.is_empty());
    }
}

//! The MongoDB-style filter language and its evaluator.

use crate::document::Document;
use crate::regex_safety;
use crate::value::Value;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// A filter expression. Untagged on the wire: each variant's JSON shape is
/// distinguishable by its keys (`$and`/`$or`/... vs. a field map).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Filter {
    And(AndFilter),
    Or(OrFilter),
    Not(NotFilter),
    Nor(NorFilter),
    Fields(BTreeMap<String, FieldPredicate>),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AndFilter {
    #[serde(rename = "$and")]
    pub and: Vec<Filter>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrFilter {
    #[serde(rename = "$or")]
    pub or: Vec<Filter>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NotFilter {
    #[serde(rename = "$not")]
    pub not: Box<Filter>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NorFilter {
    #[serde(rename = "$nor")]
    pub nor: Vec<Filter>,
}

/// A field-level predicate: either a literal (implicit `$eq`) or an
/// operator map.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FieldPredicate {
    Ops(BTreeMap<String, Value>),
    Literal(Value),
}

impl Filter {
    pub fn and(filters: Vec<Filter>) -> Filter {
        Filter::And(AndFilter { and: filters })
    }

    pub fn eq(field: impl Into<String>, value: Value) -> Filter {
        let mut map = BTreeMap::new();
        map.insert(field.into(), FieldPredicate::Literal(value));
        Filter::Fields(map)
    }

    /// Returns the set of top-level fields referenced by equalities and
    /// ranges, for index selection. `$and` contributes its children's
    /// fields; `$or`/`$not`/`$nor` are ignored, matching the planner's
    /// literal extraction rule.
    pub fn indexable_fields(&self) -> Vec<String> {
        let mut out = Vec::new();
        self.collect_indexable_fields(&mut out);
        out
    }

    fn collect_indexable_fields(&self, out: &mut Vec<String>) {
        match self {
            Filter::Fields(fields) => {
                for (field, pred) in fields {
                    if is_equality_or_range(pred) {
                        out.push(field.clone());
                    }
                }
            }
            Filter::And(a) => {
                for f in &a.and {
                    f.collect_indexable_fields(out);
                }
            }
            Filter::Or(_) | Filter::Not(_) | Filter::Nor(_) => {}
        }
    }

    /// Evaluates this filter against a document's field map.
    pub fn matches(&self, doc: &Document) -> bool {
        match self {
            Filter::Fields(fields) => fields.iter().all(|(path, pred)| {
                let actual = doc.get(path);
                eval_predicate(pred, actual)
            }),
            Filter::And(a) => a.and.iter().all(|f| f.matches(doc)),
            Filter::Or(o) => o.or.iter().any(|f| f.matches(doc)),
            Filter::Not(n) => !n.not.matches(doc),
            Filter::Nor(n) => !n.nor.iter().any(|f| f.matches(doc)),
        }
    }
}

fn is_equality_or_range(pred: &FieldPredicate) -> bool {
    match pred {
        FieldPredicate::Literal(_) => true,
        FieldPredicate::Ops(ops) => ops.keys().any(|k| {
            matches!(
                k.as_str(),
                "$eq" | "$gt" | "$gte" | "$lt" | "$lte"
            )
        }),
    }
}

fn eval_predicate(pred: &FieldPredicate, actual: Option<&Value>) -> bool {
    match pred {
        FieldPredicate::Literal(expected) => match actual {
            Some(v) => v.deep_eq(expected),
            None => expected.is_null(),
        },
        FieldPredicate::Ops(ops) => ops.iter().all(|(op, operand)| eval_op(op, operand, actual)),
    }
}

fn eval_op(op: &str, operand: &Value, actual: Option<&Value>) -> bool {
    match op {
        "$eq" => match actual {
            Some(v) => v.deep_eq(operand),
            None => operand.is_null(),
        },
        "$ne" => match actual {
            Some(v) => !v.deep_eq(operand),
            None => !operand.is_null(),
        },
        "$gt" => cmp(actual, operand, |o| o == std::cmp::Ordering::Greater),
        "$gte" => cmp(actual, operand, |o| o != std::cmp::Ordering::Less),
        "$lt" => cmp(actual, operand, |o| o == std::cmp::Ordering::Less),
        "$lte" => cmp(actual, operand, |o| o != std::cmp::Ordering::Greater),
        "$in" => {
            let Some(candidates) = operand.as_array() else { return false };
            match actual {
                Some(v) => candidates.iter().any(|c| c.deep_eq(v)),
                None => candidates.iter().any(|c| c.is_null()),
            }
        }
        "$nin" => {
            let Some(candidates) = operand.as_array() else { return true };
            match actual {
                Some(v) => !candidates.iter().any(|c| c.deep_eq(v)),
                None => !candidates.iter().any(|c| c.is_null()),
            }
        }
        "$all" => {
            let (Some(required), Some(actual_arr)) = (operand.as_array(), actual.and_then(Value::as_array))
            else {
                return false;
            };
            required.iter().all(|r| actual_arr.iter().any(|a| a.deep_eq(r)))
        }
        "$size" => {
            let Some(n) = operand.as_f64() else { return false };
            actual.and_then(Value::as_array).map(|a| a.len() as f64 == n).unwrap_or(false)
        }
        "$elemMatch" => {
            // operand is itself a field-predicate map applied to each element.
            let Some(arr) = actual.and_then(Value::as_array) else { return false };
            let Some(ops) = operand.as_object() else { return false };
            arr.iter().any(|elem| {
                ops.iter().all(|(sub_op, sub_operand)| eval_op(sub_op, sub_operand, Some(elem)))
            })
        }
        "$regex" => {
            let (Some(pattern), Some(text)) = (operand.as_str(), actual.and_then(Value::as_str)) else {
                return false;
            };
            regex_safety::compile_safe(pattern).map(|re| re.is_match(text)).unwrap_or(false)
        }
        "$startsWith" => {
            let (Some(prefix), Some(text)) = (operand.as_str(), actual.and_then(Value::as_str)) else {
                return false;
            };
            text.starts_with(prefix)
        }
        "$endsWith" => {
            let (Some(suffix), Some(text)) = (operand.as_str(), actual.and_then(Value::as_str)) else {
                return false;
            };
            text.ends_with(suffix)
        }
        "$contains" => {
            let (Some(needle), Some(text)) = (operand.as_str(), actual.and_then(Value::as_str)) else {
                return false;
            };
            text.contains(needle)
        }
        "$exists" => {
            let expect_present = operand.as_bool().unwrap_or(true);
            actual.is_some() == expect_present
        }
        _ => false,
    }
}

fn cmp(actual: Option<&Value>, operand: &Value, accept: impl Fn(std::cmp::Ordering) -> bool) -> bool {
    match actual {
        Some(v) => v.partial_compare(operand).map(accept).unwrap_or(false),
        None => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap as Map;

    fn doc(fields: &[(&str, Value)]) -> Document {
        Document::new(
            "1",
            fields.iter().map(|(k, v)| (k.to_string(), v.clone())).collect(),
        )
    }

    #[test]
    fn literal_field_is_implicit_eq() {
        let f = Filter::eq("name", "Alice".into());
        assert!(f.matches(&doc(&[("name", "Alice".into())])));
        assert!(!f.matches(&doc(&[("name", "Bob".into())])));
    }

    #[test]
    fn gt_gte_lt_lte_numeric() {
        let mut ops = Map::new();
        ops.insert("$gte".to_string(), Value::Number(30.0));
        ops.insert("$lte".to_string(), Value::Number(40.0));
        let mut fields = Map::new();
        fields.insert("age".to_string(), FieldPredicate::Ops(ops));
        let f = Filter::Fields(fields);

        assert!(f.matches(&doc(&[("age", 35.0.into())])));
        assert!(!f.matches(&doc(&[("age", 29.0.into())])));
        assert!(!f.matches(&doc(&[("age", 41.0.into())])));
    }

    #[test]
    fn cross_type_comparison_is_false() {
        let mut ops = Map::new();
        ops.insert("$gt".to_string(), Value::Timestamp(5));
        let mut fields = Map::new();
        fields.insert("age".to_string(), FieldPredicate::Ops(ops));
        let f = Filter::Fields(fields);
        assert!(!f.matches(&doc(&[("age", 10.0.into())])));
    }

    #[test]
    fn and_or_not_nor_combinators() {
        let active = Filter::eq("status", "active".into());
        let young = {
            let mut ops = Map::new();
            ops.insert("$lt".to_string(), Value::Number(30.0));
            let mut fields = Map::new();
            fields.insert("age".to_string(), FieldPredicate::Ops(ops));
            Filter::Fields(fields)
        };
        let both = Filter::and(vec![active.clone(), young.clone()]);
        let d = doc(&[("status", "active".into()), ("age", 20.0.into())]);
        assert!(both.matches(&d));

        let not_active = Filter::Not(NotFilter { not: Box::new(active.clone()) });
        assert!(!not_active.matches(&d));
    }

    #[test]
    fn exists_true_and_false() {
        let mut ops_true = Map::new();
        ops_true.insert("$exists".to_string(), Value::Bool(true));
        let mut fields_true = Map::new();
        fields_true.insert("email".to_string(), FieldPredicate::Ops(ops_true));
        let f_true = Filter::Fields(fields_true);
        assert!(f_true.matches(&doc(&[("email", "a@x".into())])));
        assert!(!f_true.matches(&doc(&[])));
    }

    #[test]
    fn regex_rejects_catastrophic_pattern_and_matches_nothing() {
        let mut ops = Map::new();
        ops.insert("$regex".to_string(), Value::String("(a+)+$".to_string()));
        let mut fields = Map::new();
        fields.insert("name".to_string(), FieldPredicate::Ops(ops));
        let f = Filter::Fields(fields);
        assert!(!f.matches(&doc(&[("name", "aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaab".into())])));
    }

    #[test]
    fn path_through_missing_is_missing() {
        let f = Filter::eq("address.city", "Baku".into());
        assert!(!f.matches(&doc(&[])));
    }

    #[test]
    fn all_and_size_and_elem_match() {
        let arr = Value::Array(vec![1.0.into(), 2.0.into(), 3.0.into()]);
        let mut ops = Map::new();
        ops.insert("$all".to_string(), Value::Array(vec![1.0.into(), 2.0.into()]));
        let mut fields = Map::new();
        fields.insert("tags".to_string(), FieldPredicate::Ops(ops));
        let f = Filter::Fields(fields);
        assert!(f.matches(&doc(&[("tags", arr)])));
    }

    #[test]
    fn indexable_fields_ignores_or_and_not() {
        let f = Filter::Or(OrFilter {
            or: vec![Filter::eq("a", 1.0.into())],
        });
        assert!(f.indexable_fields().is_empty());

        let f2 = Filter::and(vec![Filter::eq("a", 1.0.into()), Filter::eq("b", 2.0.into())]);
        let mut fields = f2.indexable_fields();
        fields.sort();
        assert_eq!(fields, vec!["a".to_string(), "b".to_string()]);
    }
}

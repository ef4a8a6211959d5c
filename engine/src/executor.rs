//! Query executor: applies a plan's filter/sort/skip/limit/project pipeline
//! and computes aggregates over the filtered set.

use crate::document::Document;
use crate::filter::Filter;
use crate::index::SortDirection;
use crate::planner::{QueryPlan, SortSpec};
use crate::value::Value;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Projection {
    #[serde(default)]
    pub include: Vec<String>,
    #[serde(default)]
    pub exclude: Vec<String>,
}

impl Projection {
    fn apply(&self, doc: &Document) -> Document {
        if self.include.is_empty() && self.exclude.is_empty() {
            return doc.clone();
        }
        let mut out = doc.clone();
        if !self.include.is_empty() {
            out.fields = out
                .fields
                .into_iter()
                .filter(|(k, _)| self.include.iter().any(|p| p == k))
                .collect();
        } else {
            out.fields = out
                .fields
                .into_iter()
                .filter(|(k, _)| !self.exclude.iter().any(|p| p == k))
                .collect();
        }
        out
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Aggregate {
    Count,
    Sum(String),
    Avg(String),
    Min(String),
    Max(String),
    Distinct(String),
    GroupBy(Vec<String>),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum AggregateResult {
    Scalar(Value),
    Values(Vec<Value>),
    Groups(Vec<Group>),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Group {
    pub key: Vec<Value>,
    pub values: Vec<Value>,
    pub count: usize,
    pub documents: Vec<Document>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryResult {
    pub data: Vec<Document>,
    pub total: usize,
    pub cursor: Option<usize>,
    pub has_more: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub aggregations: Vec<AggregateResult>,
    pub execution_time_ms: f64,
}

pub struct ExecuteRequest<'a> {
    pub filter: &'a Filter,
    pub sort: &'a [SortSpec],
    pub skip: usize,
    pub limit: Option<usize>,
    pub projection: Projection,
    pub aggregates: &'a [Aggregate],
}

/// Runs a plan against a candidate set of documents (already narrowed by an
/// index scan if the plan selected one) and produces a [`QueryResult`].
pub fn execute(
    plan: &QueryPlan,
    candidates: Vec<Document>,
    req: &ExecuteRequest,
    clock_ms: impl Fn() -> f64,
) -> QueryResult {
    let start = clock_ms();

    let mut filtered: Vec<Document> = candidates
        .into_iter()
        .filter(|d| req.filter.matches(d))
        .collect();

    if !plan.sort_using_index {
        sort_documents(&mut filtered, req.sort);
    }

    let total = filtered.len();

    let aggregations: Vec<AggregateResult> = req
        .aggregates
        .iter()
        .map(|agg| compute_aggregate(agg, &filtered))
        .collect();

    let has_more = req.skip + req.limit.unwrap_or(usize::MAX) < total;

    let page: Vec<Document> = filtered
        .into_iter()
        .skip(req.skip)
        .take(req.limit.unwrap_or(usize::MAX))
        .map(|d| req.projection.apply(&d))
        .collect();

    QueryResult {
        data: page,
        total,
        cursor: if has_more { Some(req.skip + req.limit.unwrap_or(0)) } else { None },
        has_more,
        aggregations,
        execution_time_ms: (clock_ms() - start).max(0.0),
    }
}

fn sort_documents(docs: &mut [Document], sort: &[SortSpec]) {
    docs.sort_by(|a, b| {
        for spec in sort {
            let av = a.get(&spec.field).cloned().unwrap_or(Value::Null);
            let bv = b.get(&spec.field).cloned().unwrap_or(Value::Null);
            let ord = av.sort_compare(&bv);
            let ord = if av.is_null() || bv.is_null() {
                ord
            } else {
                match spec.direction {
                    SortDirection::Asc => ord,
                    SortDirection::Desc => ord.reverse(),
                }
            };
            if ord != std::cmp::Ordering::Equal {
                return ord;
            }
        }
        std::cmp::Ordering::Equal
    });
}

fn compute_aggregate(agg: &Aggregate, docs: &[Document]) -> AggregateResult {
    match agg {
        Aggregate::Count => AggregateResult::Scalar(Value::Number(docs.len() as f64)),
        Aggregate::Sum(field) => {
            let sum: f64 = docs.iter().filter_map(|d| d.get(field)).filter_map(Value::as_f64).sum();
            AggregateResult::Scalar(Value::Number(sum))
        }
        Aggregate::Avg(field) => {
            let values: Vec<f64> = docs.iter().filter_map(|d| d.get(field)).filter_map(Value::as_f64).collect();
            let avg = if values.is_empty() {
                0.0
            } else {
                values.iter().sum::<f64>() / values.len() as f64
            };
            AggregateResult::Scalar(Value::Number(avg))
        }
        Aggregate::Min(field) => {
            let min = docs
                .iter()
                .filter_map(|d| d.get(field))
                .filter_map(Value::as_f64)
                .fold(None, |acc: Option<f64>, v| Some(acc.map_or(v, |a| a.min(v))));
            AggregateResult::Scalar(min.map(Value::Number).unwrap_or(Value::Null))
        }
        Aggregate::Max(field) => {
            let max = docs
                .iter()
                .filter_map(|d| d.get(field))
                .filter_map(Value::as_f64)
                .fold(None, |acc: Option<f64>, v| Some(acc.map_or(v, |a| a.max(v))));
            AggregateResult::Scalar(max.map(Value::Number).unwrap_or(Value::Null))
        }
        Aggregate::Distinct(field) => {
            let mut seen: Vec<Value> = Vec::new();
            for doc in docs {
                if let Some(v) = doc.get(field) {
                    if !seen.iter().any(|s| s.deep_eq(v)) {
                        seen.push(v.clone());
                    }
                }
            }
            AggregateResult::Values(seen)
        }
        Aggregate::GroupBy(fields) => {
            let mut groups: Vec<Group> = Vec::new();
            for doc in docs {
                let key: Vec<Value> = fields
                    .iter()
                    .map(|f| doc.get(f).cloned().unwrap_or(Value::Null))
                    .collect();
                if let Some(group) = groups.iter_mut().find(|g| keys_equal(&g.key, &key)) {
                    group.count += 1;
                    group.documents.push(doc.clone());
                } else {
                    groups.push(Group {
                        key,
                        values: Vec::new(),
                        count: 1,
                        documents: vec![doc.clone()],
                    });
                }
            }
            AggregateResult::Groups(groups)
        }
    }
}

fn keys_equal(a: &[Value], b: &[Value]) -> bool {
    a.len() == b.len() && a.iter().zip(b).all(|(x, y)| x.deep_eq(y))
}

//! Query planner: chooses the best available index for a filter/sort pair.

use crate::filter::Filter;
use crate::index::{IndexDef, SortDirection};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SortSpec {
    pub field: String,
    pub direction: SortDirection,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepKind {
    IndexScan,
    CollectionScan,
    Filter,
    Sort,
    Skip,
    Limit,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlanStep {
    pub kind: StepKind,
    pub description: String,
    pub cost: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryPlan {
    pub index_name: Option<String>,
    pub index_covers: bool,
    pub estimated_scan: f64,
    pub sort_using_index: bool,
    pub steps: Vec<PlanStep>,
}

/// Scores `index` against the filter's indexable fields and the requested
/// sort, per the literal scoring rule: +10 per matching leading-prefix
/// field (stop at the first mismatch), +5 if every filter field is
/// covered, +3 for sort-via-index, +1 for uniqueness.
fn score_index(index: &IndexDef, filter_fields: &[String], sort: &[SortSpec]) -> (i64, usize) {
    let mut score = 0i64;
    let mut matched = 0usize;

    for field in &index.fields {
        if filter_fields.iter().any(|f| f == &field.path) {
            score += 10;
            matched += 1;
        } else {
            break;
        }
    }

    if matched == filter_fields.len() && !filter_fields.is_empty() {
        score += 5;
    }

    if let Some(first_sort) = sort.first() {
        if let Some(next_field) = index.fields.get(matched) {
            if next_field.path == first_sort.field && next_field.direction == first_sort.direction {
                score += 3;
            }
        }
    }

    if index.unique {
        score += 1;
    }

    (score, matched)
}

/// Builds a query plan choosing the best-scoring index, if any, else a full
/// collection scan.
pub fn plan_query(
    filter: &Filter,
    sort: &[SortSpec],
    skip: usize,
    limit: Option<usize>,
    indexes: &[&IndexDef],
) -> QueryPlan {
    let filter_fields = filter.indexable_fields();

    let best = indexes
        .iter()
        .map(|idx| {
            let (score, matched) = score_index(idx, &filter_fields, sort);
            (score, matched, *idx)
        })
        .filter(|(score, _, _)| *score > 0)
        .max_by_key(|(score, _, _)| *score);

    let mut steps = Vec::new();
    let (index_name, index_covers, estimated_scan, sort_using_index) = match best {
        Some((score, matched, idx)) => {
            let total = filter_fields.len().max(1);
            let estimated = (1000.0 * (1.0 - (matched as f64 / total as f64) * 0.9)).round();
            steps.push(PlanStep {
                kind: StepKind::IndexScan,
                description: format!("scan index '{}' (score {score})", idx.name),
                cost: estimated as u64,
            });
            let covers = matched == filter_fields.len() && !filter_fields.is_empty();
            let sort_via_index = sort.first().is_some_and(|s| {
                idx.fields
                    .get(matched)
                    .is_some_and(|f| f.path == s.field && f.direction == s.direction)
            });
            (Some(idx.name.clone()), covers, estimated, sort_via_index)
        }
        None => {
            steps.push(PlanStep {
                kind: StepKind::CollectionScan,
                description: "full collection scan".to_string(),
                cost: u64::MAX,
            });
            (None, false, f64::INFINITY, false)
        }
    };

    if !matches!(filter, Filter::Fields(f) if f.is_empty()) {
        steps.push(PlanStep {
            kind: StepKind::Filter,
            description: "apply remaining predicate".to_string(),
            cost: 1,
        });
    }

    if !sort_using_index && !sort.is_empty() {
        steps.push(PlanStep {
            kind: StepKind::Sort,
            description: format!("sort by {} spec(s)", sort.len()),
            cost: 1,
        });
    }

    if skip > 0 {
        steps.push(PlanStep {
            kind: StepKind::Skip,
            description: format!("skip {skip}"),
            cost: 0,
        });
    }

    if let Some(limit) = limit {
        steps.push(PlanStep {
            kind: StepKind::Limit,
            description: format!("limit {limit}"),
            cost: 0,
        });
    }

    QueryPlan {
        index_name,
        index_covers,
        estimated_scan,
        sort_using_index,
        steps,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::IndexField;

    fn idx(name: &str, fields: &[(&str, SortDirection)], unique: bool) -> IndexDef {
        let mut def = IndexDef::new(
            name,
            fields
                .iter()
                .map(|(p, d)| IndexField {
                    path: p.to_string(),
                    direction: *d,
                })
                .collect(),
        );
        def.unique = unique;
        def
    }

    #[test]
    fn prefers_unique_leading_prefix_index() {
        let filter = Filter::and(vec![
            Filter::eq("status", "active".into()),
            Filter::eq("age", 30.0.into()),
        ]);
        let by_status = idx("by_status", &[("status", SortDirection::Asc)], false);
        let by_status_age = idx(
            "by_status_age",
            &[("status", SortDirection::Asc), ("age", SortDirection::Asc)],
            true,
        );
        let plan = plan_query(&filter, &[], 0, None, &[&by_status, &by_status_age]);
        assert_eq!(plan.index_name, Some("by_status_age".to_string()));
        assert!(plan.index_covers);
    }

    #[test]
    fn no_usable_index_falls_back_to_collection_scan() {
        let filter = Filter::eq("nonindexed", "x".into());
        let plan = plan_query(&filter, &[], 0, None, &[]);
        assert!(plan.index_name.is_none());
        assert!(plan.estimated_scan.is_infinite());
        assert!(matches!(plan.steps[0].kind, StepKind::CollectionScan));
    }

    #[test]
    fn sort_via_index_detected() {
        let filter = Filter::eq("status", "active".into());
        let by_status_age = idx(
            "by_status_age",
            &[("status", SortDirection::Asc), ("age", SortDirection::Desc)],
            false,
        );
        let sort = vec![SortSpec {
            field: "age".to_string(),
            direction: SortDirection::Desc,
        }];
        let plan = plan_query(&filter, &sort, 0, None, &[&by_status_age]);
        assert!(plan.sort_using_index);
    }
}

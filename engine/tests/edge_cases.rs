//! Integration tests exercising whole-engine scenarios end to end, across
//! collection writes, queries, replication, and row-level security.

use carry_engine::storage::memory::MemoryAdapter;
use carry_engine::storage::StorageAdapter;
use carry_engine::{
    Collection, CollectionSchema, Error, FieldDef, FieldType, Filter, IndexDef, IndexField,
    Projection, SortDirection, SortSpec,
};
use std::collections::BTreeMap;

async fn users_collection() -> Collection {
    let adapter = MemoryAdapter::new();
    let store = adapter.get_store(&"users".to_string()).await.unwrap();
    let schema = CollectionSchema::new(
        "users",
        vec![
            FieldDef::required("email", FieldType::String),
            FieldDef::required("age", FieldType::Number),
        ],
    );
    Collection::new("users", schema, store)
}

fn fields(pairs: &[(&str, carry_engine::Value)]) -> BTreeMap<String, carry_engine::Value> {
    pairs.iter().map(|(k, v)| (k.to_string(), v.clone())).collect()
}

#[tokio::test]
async fn basic_insert_then_get() {
    let users = users_collection().await;
    let inserted = users
        .insert("u1", fields(&[("email", "a@x.com".into()), ("age", 30.0.into())]))
        .await
        .unwrap();
    assert_eq!(inserted.id, "u1");

    let fetched = users.get("u1").await.unwrap().unwrap();
    assert_eq!(fetched.fields.get("email"), Some(&"a@x.com".into()));
}

#[tokio::test]
async fn unique_constraint_violation_rejects_duplicate() {
    let adapter = MemoryAdapter::new();
    let store = adapter.get_store(&"users".to_string()).await.unwrap();
    store
        .create_index(
            IndexDef::new(
                "by_email",
                vec![IndexField {
                    path: "email".to_string(),
                    direction: SortDirection::Asc,
                }],
            )
            .unique(),
        )
        .await
        .unwrap();

    let schema = CollectionSchema::new(
        "users",
        vec![
            FieldDef::required("email", FieldType::String),
            FieldDef::required("age", FieldType::Number),
        ],
    );
    let users = Collection::new("users", schema, store);

    users
        .insert("u1", fields(&[("email", "dup@x.com".into()), ("age", 1.0.into())]))
        .await
        .unwrap();

    let err = users
        .insert("u2", fields(&[("email", "dup@x.com".into()), ("age", 2.0.into())]))
        .await;
    assert!(matches!(err, Err(Error::UniqueConstraint { .. })));
}

#[tokio::test]
async fn range_query_counts_matching_documents() {
    let users = users_collection().await;
    for i in 0..10 {
        users
            .insert(
                format!("u{i}"),
                fields(&[("email", format!("u{i}@x.com").as_str().into()), ("age", (i as f64).into())]),
            )
            .await
            .unwrap();
    }

    let mut ops = BTreeMap::new();
    ops.insert("$gte".to_string(), carry_engine::Value::Number(5.0));
    let mut pred = BTreeMap::new();
    pred.insert("age".to_string(), carry_engine::filter::FieldPredicate::Ops(ops));
    let filter = Filter::Fields(pred);

    let count = users.count(Some(&filter)).await.unwrap();
    assert_eq!(count, 5);
}

#[tokio::test]
async fn multi_field_sort_orders_by_each_spec_in_turn() {
    let users = users_collection().await;
    users
        .insert("u1", fields(&[("email", "b@x.com".into()), ("age", 20.0.into())]))
        .await
        .unwrap();
    users
        .insert("u2", fields(&[("email", "a@x.com".into()), ("age", 20.0.into())]))
        .await
        .unwrap();
    users
        .insert("u3", fields(&[("email", "z@x.com".into()), ("age", 10.0.into())]))
        .await
        .unwrap();

    let sort = vec![
        SortSpec {
            field: "age".to_string(),
            direction: SortDirection::Asc,
        },
        SortSpec {
            field: "email".to_string(),
            direction: SortDirection::Asc,
        },
    ];
    let result = users
        .find(&Filter::Fields(BTreeMap::new()), &sort, 0, None, Projection::default(), &[])
        .await
        .unwrap();
    let ids: Vec<&str> = result.data.iter().map(|d| d.id.as_str()).collect();
    assert_eq!(ids, vec!["u3", "u2", "u1"]);
}

mod replication_convergence {
    use carry_engine::replication::{resolve_conflict, ConflictStrategy};
    use carry_engine::Document;
    use std::collections::BTreeMap;

    fn doc(id: &str, updated_at: i64, fields: &[(&str, carry_engine::Value)]) -> Document {
        let mut d = Document::new(
            id,
            fields.iter().map(|(k, v)| (k.to_string(), v.clone())).collect::<BTreeMap<_, _>>(),
        );
        d.updated_at = updated_at;
        d.rev = "1-aaaa0000".to_string();
        d
    }

    #[test]
    fn last_write_wins_converges_regardless_of_application_order() {
        let a = doc("1", 100, &[("v", 1.0.into())]);
        let b = doc("1", 200, &[("v", 2.0.into())]);

        let resolved_ab = resolve_conflict(ConflictStrategy::LastWriteWins, &a, &b, "node-a", "node-b");
        let resolved_ba = resolve_conflict(ConflictStrategy::LastWriteWins, &b, &a, "node-b", "node-a");

        assert_eq!(resolved_ab.fields.get("v"), resolved_ba.fields.get("v"));
        assert_eq!(resolved_ab.updated_at, 200);
    }
}

mod rls_tenant_isolation {
    use carry_engine::rls::{
        Action, CollectionTarget, Condition, ConditionOperand, Context, Effect, PolicySet, Rule,
    };
    use carry_engine::Document;
    use std::collections::BTreeMap;

    fn tenant_doc(id: &str, tenant_id: &str) -> Document {
        let mut f = BTreeMap::new();
        f.insert("tenantId".to_string(), carry_engine::Value::String(tenant_id.to_string()));
        Document::new(id, f)
    }

    fn policy() -> PolicySet {
        PolicySet {
            name: "tenant".to_string(),
            default_effect: Effect::Deny,
            rules: vec![Rule {
                id: "tenant_isolation".to_string(),
                actions: vec![Action::All],
                collections: vec![CollectionTarget("*".to_string())],
                effect: Effect::Allow,
                conditions: vec![Condition {
                    field: "tenantId".to_string(),
                    operator: "$eq".to_string(),
                    operand: ConditionOperand::ContextRefPath("tenant_id".to_string()),
                }],
                roles: None,
                priority: 1,
                enabled: true,
            }],
            version: 1,
        }
    }

    #[test]
    fn cross_tenant_reads_are_denied() {
        let p = policy();
        let ctx = Context {
            tenant_id: Some("tenant-a".to_string()),
            ..Default::default()
        };
        assert_eq!(
            p.evaluate(Action::Read, "docs", &tenant_doc("1", "tenant-a"), &ctx),
            Effect::Allow
        );
        assert_eq!(
            p.evaluate(Action::Read, "docs", &tenant_doc("2", "tenant-b"), &ctx),
            Effect::Deny
        );
    }

    #[test]
    fn generated_query_filter_matches_evaluate_decision() {
        let p = policy();
        let ctx = Context {
            tenant_id: Some("tenant-a".to_string()),
            ..Default::default()
        };
        let filter = p.generate_query_filter(Action::Read, "docs", &ctx);
        for (doc, expect_allowed) in [
            (tenant_doc("1", "tenant-a"), true),
            (tenant_doc("2", "tenant-b"), false),
        ] {
            assert_eq!(filter.matches(&doc), expect_allowed);
            assert_eq!(
                p.evaluate(Action::Read, "docs", &doc, &ctx) == Effect::Allow,
                expect_allowed
            );
        }
    }
}

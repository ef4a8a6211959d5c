//! Row-level security: policy sets, rule evaluation, and query-filter
//! lowering.

use crate::document::Document;
use crate::filter::{AndFilter, Filter, FieldPredicate};
use crate::value::Value;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Effect {
    Allow,
    Deny,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Action {
    #[serde(rename = "*")]
    All,
    #[serde(rename = "read")]
    Read,
    #[serde(rename = "insert")]
    Insert,
    #[serde(rename = "update")]
    Update,
    #[serde(rename = "delete")]
    Delete,
}

impl Action {
    fn matches(&self, requested: Action) -> bool {
        matches!(self, Action::All) || *self == requested
    }
}

/// Either a target collection name or the wildcard `*`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CollectionTarget(pub String);

impl CollectionTarget {
    fn matches(&self, collection: &str) -> bool {
        self.0 == "*" || self.0 == collection
    }
}

/// A runtime context a rule's conditions are evaluated against.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Context {
    pub user_id: Option<String>,
    pub roles: Vec<String>,
    pub tenant_id: Option<String>,
    pub attributes: BTreeMap<String, Value>,
}

impl Context {
    fn resolve(&self, context_ref_path: &str) -> Option<Value> {
        match context_ref_path {
            "user_id" => self.user_id.clone().map(Value::String),
            "tenant_id" => self.tenant_id.clone().map(Value::String),
            "roles" => Some(Value::Array(self.roles.iter().cloned().map(Value::String).collect())),
            other => other
                .strip_prefix("attributes.")
                .and_then(|key| self.attributes.get(key))
                .cloned(),
        }
    }
}

/// A condition on a document field: `$eq|$ne|$gt|...|$contains|$regex|$exists`
/// compared against either a literal value or a value resolved from the
/// runtime context.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Condition {
    pub field: String,
    pub operator: String,
    #[serde(flatten)]
    pub operand: ConditionOperand,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ConditionOperand {
    #[serde(rename = "value")]
    Value(Value),
    #[serde(rename = "contextRefPath")]
    ContextRefPath(String),
}

impl Condition {
    fn resolved_value(&self, ctx: &Context) -> Option<Value> {
        match &self.operand {
            ConditionOperand::Value(v) => Some(v.clone()),
            ConditionOperand::ContextRefPath(path) => ctx.resolve(path),
        }
    }

    fn holds(&self, doc: &Document, ctx: &Context) -> bool {
        let Some(expected) = self.resolved_value(ctx) else {
            return false;
        };
        let mut ops = BTreeMap::new();
        ops.insert(self.operator.clone(), expected);
        let mut fields = BTreeMap::new();
        fields.insert(self.field.clone(), FieldPredicate::Ops(ops));
        Filter::Fields(fields).matches(doc)
    }

    /// Whether this condition can be expressed in the filter language for
    /// query-filter lowering (i.e. every operator except those the filter
    /// language does not support for denial-style lowering, per spec: regex
    /// is excluded from lowering and falls back to post-evaluation).
    fn is_lowerable(&self) -> bool {
        self.operator != "$regex"
    }
}

/// A single RLS rule.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Rule {
    pub id: String,
    pub actions: Vec<Action>,
    pub collections: Vec<CollectionTarget>,
    pub effect: Effect,
    #[serde(default)]
    pub conditions: Vec<Condition>,
    #[serde(default)]
    pub roles: Option<Vec<String>>,
    pub priority: i32,
    #[serde(default = "default_true")]
    pub enabled: bool,
}

fn default_true() -> bool {
    true
}

impl Rule {
    fn matches(&self, action: Action, collection: &str, doc: &Document, ctx: &Context) -> bool {
        if !self.enabled {
            return false;
        }
        if !self.actions.iter().any(|a| a.matches(action)) {
            return false;
        }
        if !self.collections.iter().any(|c| c.matches(collection)) {
            return false;
        }
        if let Some(required_roles) = &self.roles {
            if !required_roles.iter().any(|r| ctx.roles.contains(r)) {
                return false;
            }
        }
        self.conditions.iter().all(|c| c.holds(doc, ctx))
    }
}

/// An ordered collection of [`Rule`]s plus a default effect.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PolicySet {
    pub name: String,
    pub default_effect: Effect,
    pub rules: Vec<Rule>,
    pub version: u32,
}

impl PolicySet {
    /// Evaluates rules sorted by priority descending, skipping disabled
    /// rules; the first matching rule's effect decides, falling back to
    /// `default_effect` if none match.
    pub fn evaluate(&self, action: Action, collection: &str, doc: &Document, ctx: &Context) -> Effect {
        let mut rules: Vec<&Rule> = self.rules.iter().filter(|r| r.enabled).collect();
        rules.sort_by(|a, b| b.priority.cmp(&a.priority));
        for rule in rules {
            if rule.matches(action, collection, doc, ctx) {
                return rule.effect;
            }
        }
        self.default_effect
    }

    /// Produces a filter equivalent to the conjunction of all matching
    /// allow-rule conditions (with context references resolved), to be
    /// `$and`-composed with the caller's own filter. Rules whose conditions
    /// use an operator not expressible in the filter language are skipped
    /// here and must be enforced by post-evaluation via [`Self::evaluate`].
    pub fn generate_query_filter(&self, action: Action, collection: &str, ctx: &Context) -> Filter {
        let mut allow_filters = Vec::new();

        let mut rules: Vec<&Rule> = self
            .rules
            .iter()
            .filter(|r| r.enabled && r.effect == Effect::Allow)
            .collect();
        rules.sort_by(|a, b| b.priority.cmp(&a.priority));

        for rule in rules {
            if !rule.actions.iter().any(|a| a.matches(action)) {
                continue;
            }
            if !rule.collections.iter().any(|c| c.matches(collection)) {
                continue;
            }
            if let Some(required_roles) = &rule.roles {
                if !required_roles.iter().any(|r| ctx.roles.contains(r)) {
                    continue;
                }
            }

            let mut field_conditions = BTreeMap::new();
            for condition in &rule.conditions {
                if !condition.is_lowerable() {
                    continue;
                }
                if let Some(value) = condition.resolved_value(ctx) {
                    let mut ops = BTreeMap::new();
                    ops.insert(condition.operator.clone(), value);
                    field_conditions.insert(condition.field.clone(), FieldPredicate::Ops(ops));
                }
            }
            if !field_conditions.is_empty() {
                allow_filters.push(Filter::Fields(field_conditions));
            }
        }

        if allow_filters.is_empty() {
            match self.default_effect {
                Effect::Allow => Filter::Fields(BTreeMap::new()),
                Effect::Deny => Filter::Or(crate::filter::OrFilter { or: Vec::new() }),
            }
        } else if allow_filters.len() == 1 {
            allow_filters.into_iter().next().unwrap()
        } else {
            Filter::Or(crate::filter::OrFilter { or: allow_filters })
        }
    }

    /// Composes `lowered` with the caller's own filter via `$and`, per the
    /// query-filter lowering contract.
    pub fn compose_with(lowered: Filter, callers_filter: Filter) -> Filter {
        Filter::And(AndFilter {
            and: vec![lowered, callers_filter],
        })
    }

    /// Whether a remote document should be applied locally during sync,
    /// per the `should_sync` gate.
    pub fn should_sync(&self, collection: &str, doc: &Document, ctx: &Context) -> bool {
        self.evaluate(Action::Read, collection, doc, ctx) == Effect::Allow
    }

    /// A policy set with no rules, whose `default_effect` allows everything.
    /// Callers that wire `attach_policies` without configuring a real set get
    /// current behavior back, rather than failing closed on every request.
    pub fn allow_all() -> Self {
        Self {
            name: "allow-all".to_string(),
            default_effect: Effect::Allow,
            rules: Vec::new(),
            version: 0,
        }
    }
}

/// Binds a [`PolicySet`] to the write/read surface a caller drives, mirroring
/// the `attach_policies(db, policySet)` composition: policy enforcement
/// wraps around storage calls rather than living inside the engine core.
#[derive(Debug, Clone)]
pub struct PolicyGuard {
    policies: PolicySet,
}

pub fn attach_policies(policies: PolicySet) -> PolicyGuard {
    PolicyGuard { policies }
}

impl PolicyGuard {
    pub fn policies(&self) -> &PolicySet {
        &self.policies
    }

    /// Checks a write before it is committed. Returns the deciding effect so
    /// the caller can surface a rejection distinct from a storage error.
    pub fn authorize(&self, action: Action, collection: &str, doc: &Document, ctx: &Context) -> Effect {
        self.policies.evaluate(action, collection, doc, ctx)
    }

    /// Whether an outgoing change is visible to `ctx` and should be included
    /// in a pull response or sync broadcast.
    pub fn allows_read(&self, collection: &str, doc: &Document, ctx: &Context) -> bool {
        self.policies.should_sync(collection, doc, ctx)
    }
}

//! Preconditions and deny conditions.
//!
//! Condition keys and values are arbitrary JSON at the schema level. Before comparison each is
//! resolved against a binding [`Context`]: `{{ path }}` references are replaced by the value
//! found at `path`, and the result is lifted into a tagged [`Value`].

use crate::{
    k8s::policy::{Condition, ConditionOperator},
    Mode, Resource,
};
use serde_json::{json, Value as Json};
use std::collections::BTreeMap;

/// A resolved condition operand.
#[derive(Clone, Debug, PartialEq)]
pub enum Value {
    Null,
    Bool(bool),
    Number(f64),
    String(String),
    Sequence(Vec<Value>),
    Mapping(BTreeMap<String, Value>),
}

#[derive(Debug, thiserror::Error)]
pub enum MatchError {
    #[error("variable {0:?} could not be resolved")]
    UnresolvedVariable(String),

    #[error("operator {operator:?} requires a list value, got {value:?}")]
    NotASequence {
        operator: ConditionOperator,
        value: Value,
    },
}

/// The bindings available to `{{ path }}` references.
#[derive(Clone, Debug)]
pub struct Context {
    root: Json,
}

/// Evaluates conditions against a context; all conditions must hold.
pub fn evaluate(conditions: &[Condition], ctx: &Context) -> Result<bool, MatchError> {
    for condition in conditions {
        if !evaluate_one(condition, ctx)? {
            return Ok(false);
        }
    }
    Ok(true)
}

fn evaluate_one(condition: &Condition, ctx: &Context) -> Result<bool, MatchError> {
    let key = ctx.resolve(&condition.key)?;
    let value = ctx.resolve(&condition.value)?;
    let op = condition.operator;
    match op {
        ConditionOperator::Equal | ConditionOperator::Equals => Ok(key == value),
        ConditionOperator::NotEqual | ConditionOperator::NotEquals => Ok(key != value),
        ConditionOperator::In => contains(op, &value, &key),
        ConditionOperator::NotIn => contains(op, &value, &key).map(|found| !found),
    }
}

/// True if `key` is an element of `set`; a sequence key must be entirely contained.
fn contains(operator: ConditionOperator, set: &Value, key: &Value) -> Result<bool, MatchError> {
    let Value::Sequence(items) = set else {
        return Err(MatchError::NotASequence {
            operator,
            value: set.clone(),
        });
    };
    Ok(match key {
        Value::Sequence(keys) => keys.iter().all(|k| items.contains(k)),
        key => items.contains(key),
    })
}

// === impl Context ===

impl Context {
    pub fn new(resource: &Resource, mode: Mode<'_>) -> Self {
        let mut request = json!({ "object": resource.object });
        let mut root = serde_json::Map::new();

        if let Some(info) = mode.request_info() {
            request["userInfo"] = json!(info.admission_user_info);
            request["roles"] = json!(info.roles);
            request["clusterRoles"] = json!(info.cluster_roles);

            let username = &info.admission_user_info.username;
            if let Some(sa) = username.strip_prefix("system:serviceaccount:") {
                if let Some((ns, name)) = sa.split_once(':') {
                    root.insert("serviceAccountName".to_string(), json!(name));
                    root.insert("serviceAccountNamespace".to_string(), json!(ns));
                }
            }
        }

        root.insert("request".to_string(), request);
        Self {
            root: Json::Object(root),
        }
    }

    /// Looks up a dotted path such as `request.object.metadata.name`. Numeric segments index
    /// into arrays.
    pub fn lookup(&self, path: &str) -> Option<&Json> {
        path.split('.')
            .filter(|s| !s.is_empty())
            .try_fold(&self.root, |node, segment| match node {
                Json::Object(map) => map.get(segment),
                Json::Array(items) => items.get(segment.parse::<usize>().ok()?),
                _ => None,
            })
    }

    /// Resolves all references in a raw operand.
    ///
    /// A string that consists of a single reference takes on the referenced value's structure;
    /// references embedded in a longer string are rendered into it.
    pub fn resolve(&self, raw: &Json) -> Result<Value, MatchError> {
        match raw {
            Json::String(s) => match whole_reference(s) {
                Some(path) => self
                    .lookup(path)
                    .map(Value::from)
                    .ok_or_else(|| MatchError::UnresolvedVariable(path.to_string())),
                None => self.substitute(s).map(Value::String),
            },
            Json::Array(items) => items
                .iter()
                .map(|item| self.resolve(item))
                .collect::<Result<_, _>>()
                .map(Value::Sequence),
            Json::Object(map) => map
                .iter()
                .map(|(k, v)| self.resolve(v).map(|v| (k.clone(), v)))
                .collect::<Result<_, _>>()
                .map(Value::Mapping),
            other => Ok(Value::from(other)),
        }
    }

    /// Renders every `{{ path }}` reference in `s`.
    pub fn substitute(&self, s: &str) -> Result<String, MatchError> {
        let mut out = String::with_capacity(s.len());
        let mut rest = s;
        while let Some(start) = rest.find("{{") {
            let Some(len) = rest[start..].find("}}") else {
                break;
            };
            out.push_str(&rest[..start]);
            let path = rest[start + 2..start + len].trim();
            match self.lookup(path) {
                Some(Json::String(v)) => out.push_str(v),
                Some(v) => out.push_str(&v.to_string()),
                None => return Err(MatchError::UnresolvedVariable(path.to_string())),
            }
            rest = &rest[start + len + 2..];
        }
        out.push_str(rest);
        Ok(out)
    }
}

fn whole_reference(s: &str) -> Option<&str> {
    let inner = s.trim().strip_prefix("{{")?.strip_suffix("}}")?;
    if inner.contains("{{") || inner.contains("}}") {
        return None;
    }
    Some(inner.trim())
}

// === impl Value ===

impl From<&Json> for Value {
    fn from(json: &Json) -> Self {
        match json {
            Json::Null => Self::Null,
            Json::Bool(b) => Self::Bool(*b),
            Json::Number(n) => Self::Number(n.as_f64().unwrap_or(f64::NAN)),
            Json::String(s) => Self::String(s.clone()),
            Json::Array(items) => Self::Sequence(items.iter().map(Self::from).collect()),
            Json::Object(map) => {
                Self::Mapping(map.iter().map(|(k, v)| (k.clone(), v.into())).collect())
            }
        }
    }
}

//! Validation patterns.
//!
//! A pattern mirrors the shape of the resource it constrains. Maps require each of their keys;
//! arrays apply every pattern element to every resource element; scalars are compared by
//! value, with strings supporting a small expression grammar:
//!
//! - `*` and `?` wildcards (`?*` therefore means "any non-empty value")
//! - `a | b` alternatives
//! - a leading `!` negation
//! - `>`, `>=`, `<` and `<=` numeric comparisons
//!
//! Map keys may carry anchors: a conditional anchor `(key)` makes the whole map apply only if
//! that field matches, and an equality anchor `=(key)` checks the field only when present.

use crate::{anchor::Key, wildcard};
use serde_json::Value as Json;

#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum PatternError {
    #[error("field {path} is required")]
    Missing { path: String },

    #[error("value at {path} does not match the pattern")]
    Mismatch { path: String },
}

/// Checks a resource against a pattern.
pub fn validate(resource: &Json, pattern: &Json) -> Result<(), PatternError> {
    check(Some(resource), pattern, "/")
}

/// True if the resource matches the pattern.
pub fn matches(resource: &Json, pattern: &Json) -> bool {
    validate(resource, pattern).is_ok()
}

fn check(value: Option<&Json>, pattern: &Json, path: &str) -> Result<(), PatternError> {
    match pattern {
        Json::Object(fields) => {
            let map = match value {
                Some(Json::Object(map)) => map,
                Some(_) => return Err(mismatch(path)),
                None => return Err(missing(path)),
            };

            // Conditions gate the entire map.
            for (k, p) in fields.iter() {
                if let Key::Condition(name) = Key::parse(k) {
                    let child = format!("{path}{name}/");
                    if check(map.get(name), p, &child).is_err() {
                        return Ok(());
                    }
                }
            }

            for (k, p) in fields.iter() {
                let key = Key::parse(k);
                let child = format!("{}{}/", path, key.name());
                match key {
                    Key::Condition(_) => {}
                    Key::Equality(name) | Key::AddIfAbsent(name) => {
                        if let Some(v) = map.get(name) {
                            check(Some(v), p, &child)?;
                        }
                    }
                    Key::Plain(name) => check(map.get(name), p, &child)?,
                }
            }
            Ok(())
        }

        Json::Array(patterns) => {
            let items = match value {
                Some(Json::Array(items)) => items,
                Some(_) => return Err(mismatch(path)),
                None => return Err(missing(path)),
            };
            for p in patterns {
                for (i, item) in items.iter().enumerate() {
                    check(Some(item), p, &format!("{path}{i}/"))?;
                }
            }
            Ok(())
        }

        Json::Null => match value {
            None | Some(Json::Null) => Ok(()),
            Some(_) => Err(mismatch(path)),
        },

        Json::String(expr) => {
            let value = value.ok_or_else(|| missing(path))?;
            if string_matches(value, expr) {
                Ok(())
            } else {
                Err(mismatch(path))
            }
        }

        Json::Bool(b) => match value {
            Some(Json::Bool(v)) if v == b => Ok(()),
            Some(_) => Err(mismatch(path)),
            None => Err(missing(path)),
        },

        Json::Number(n) => match value {
            Some(v) if number(v).is_some() && number(v) == n.as_f64() => Ok(()),
            Some(_) => Err(mismatch(path)),
            None => Err(missing(path)),
        },
    }
}

fn string_matches(value: &Json, expr: &str) -> bool {
    expr.split('|').any(|alt| {
        let alt = alt.trim();
        match alt.strip_prefix('!') {
            Some(negated) => !term_matches(value, negated.trim()),
            None => term_matches(value, alt),
        }
    })
}

fn term_matches(value: &Json, term: &str) -> bool {
    for (op, cmp) in COMPARISONS {
        if let Some(operand) = term.strip_prefix(op) {
            if let Ok(bound) = operand.trim().parse::<f64>() {
                return number(value).map_or(false, |v| cmp(v, bound));
            }
        }
    }

    match value {
        Json::String(s) => wildcard::matches(term, s),
        Json::Number(_) | Json::Bool(_) => wildcard::matches(term, &value.to_string()),
        Json::Null => term.is_empty(),
        Json::Array(_) | Json::Object(_) => term == "*",
    }
}

// Longer operators first so that `>=` is not read as `>`.
const COMPARISONS: [(&str, fn(f64, f64) -> bool); 4] = [
    (">=", |a: f64, b: f64| a >= b),
    ("<=", |a: f64, b: f64| a <= b),
    (">", |a: f64, b: f64| a > b),
    ("<", |a: f64, b: f64| a < b),
];

fn number(value: &Json) -> Option<f64> {
    match value {
        Json::Number(n) => n.as_f64(),
        Json::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn missing(path: &str) -> PatternError {
    PatternError::Missing {
        path: path.to_string(),
    }
}

fn mismatch(path: &str) -> PatternError {
    PatternError::Mismatch {
        path: path.to_string(),
    }
}

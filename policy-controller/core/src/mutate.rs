//! Mutations: overlays and JSON patches.
//!
//! Mutations never modify their input; a mutated copy is returned so that a failing rule leaves
//! the resource exactly as the previous rule produced it.

use crate::{
    anchor::{self, Key},
    k8s::policy::{Mutation, Patch},
    pattern,
};
use serde_json::{json, Value as Json};

#[derive(Debug, thiserror::Error)]
pub enum MutationError {
    #[error("overlay expects {expected} at {path}")]
    TypeMismatch {
        path: String,
        expected: &'static str,
    },

    #[error("invalid patch: {0}")]
    InvalidPatch(#[source] serde_json::Error),

    #[error("failed to apply patch: {0}")]
    Patch(#[from] json_patch::PatchError),
}

/// Applies a rule's overlay and then its patches.
pub fn mutate(object: &Json, mutation: &Mutation) -> Result<Json, MutationError> {
    let mut doc = match mutation.overlay.as_ref() {
        Some(overlay) => apply_overlay(object, overlay)?,
        None => object.clone(),
    };
    if !mutation.patches.is_empty() {
        doc = apply_patches(&doc, &mutation.patches)?;
    }
    Ok(doc)
}

/// Merges a patch-by-example overlay into a copy of `object`.
///
/// Every path present in the overlay is written into the object, creating intermediate maps and
/// arrays as needed. In maps, a conditional anchor `(key)` skips the map unless the field
/// matches, and `+(key)` only writes absent fields. In arrays, an element carrying conditional
/// anchors is merged into every existing element it matches and appended when none does; other
/// elements are appended unless already present.
pub fn apply_overlay(object: &Json, overlay: &Json) -> Result<Json, MutationError> {
    let mut doc = object.clone();
    merge(&mut doc, overlay, "/")?;
    Ok(doc)
}

fn merge(target: &mut Json, overlay: &Json, path: &str) -> Result<(), MutationError> {
    match overlay {
        Json::Object(fields) => {
            if target.is_null() {
                *target = json!({});
            }
            let map = target
                .as_object_mut()
                .ok_or_else(|| type_mismatch(path, "a map"))?;

            let gated = fields.iter().any(|(k, v)| match Key::parse(k) {
                Key::Condition(name) => map
                    .get(name)
                    .map_or(true, |cur| !pattern::matches(cur, v)),
                Key::Equality(name) => map
                    .get(name)
                    .map_or(false, |cur| !pattern::matches(cur, v)),
                _ => false,
            });
            if gated {
                return Ok(());
            }

            for (k, v) in fields.iter() {
                let key = Key::parse(k);
                let name = key.name();
                match key {
                    Key::Condition(_) | Key::Equality(_) => {}
                    Key::AddIfAbsent(_) => {
                        if !map.contains_key(name) {
                            map.insert(name.to_string(), anchor::strip(v));
                        }
                    }
                    Key::Plain(_) => {
                        let child = map.entry(name.to_string()).or_insert(Json::Null);
                        merge(child, v, &format!("{path}{name}/"))?;
                    }
                }
            }
            Ok(())
        }

        Json::Array(elements) => {
            if target.is_null() {
                *target = json!([]);
            }
            let items = target
                .as_array_mut()
                .ok_or_else(|| type_mismatch(path, "a list"))?;

            for element in elements {
                if anchor::has_conditions(element) {
                    let mut merged = false;
                    for (i, item) in items.iter_mut().enumerate() {
                        if conditions_match(item, element) {
                            merge(item, element, &format!("{path}{i}/"))?;
                            merged = true;
                        }
                    }
                    if !merged {
                        items.push(anchor::strip(element));
                    }
                } else {
                    let element = anchor::strip(element);
                    if !items.contains(&element) {
                        items.push(element);
                    }
                }
            }
            Ok(())
        }

        scalar => {
            if target.is_array() || target.is_object() {
                return Err(type_mismatch(path, "a scalar"));
            }
            *target = scalar.clone();
            Ok(())
        }
    }
}

/// True if every conditional anchor of an overlay element matches the item.
fn conditions_match(item: &Json, element: &Json) -> bool {
    let (Some(item), Some(fields)) = (item.as_object(), element.as_object()) else {
        return false;
    };
    fields.iter().all(|(k, v)| match Key::parse(k) {
        Key::Condition(name) => item.get(name).map_or(false, |cur| pattern::matches(cur, v)),
        _ => true,
    })
}

/// Applies RFC 6902 operations to a copy of `object`, in order.
///
/// Operation names are accepted in any case, and `delete` is an alias of `remove`.
pub fn apply_patches(object: &Json, patches: &[Patch]) -> Result<Json, MutationError> {
    let ops = patches
        .iter()
        .map(|p| {
            let op = match p.operation.to_ascii_lowercase().as_str() {
                "delete" => "remove".to_string(),
                op => op.to_string(),
            };
            let mut operation = json!({ "op": op, "path": p.path });
            if let Some(value) = p.value.as_ref() {
                operation["value"] = value.clone();
            }
            operation
        })
        .collect::<Vec<_>>();
    let patch = serde_json::from_value::<json_patch::Patch>(Json::Array(ops))
        .map_err(MutationError::InvalidPatch)?;

    let mut doc = object.clone();
    json_patch::patch(&mut doc, &patch.0)?;
    Ok(doc)
}

fn type_mismatch(path: &str, expected: &'static str) -> MutationError {
    MutationError::TypeMismatch {
        path: path.to_string(),
        expected,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn pod() -> Json {
        json!({
            "metadata": { "name": "web-0", "labels": { "app": "web" } },
            "spec": {
                "containers": [
                    { "name": "app", "image": "nginx:1.25" },
                    { "name": "sidecar", "image": "envoy:1.30" },
                ],
            },
        })
    }

    fn patch(op: &str, path: &str, value: Option<Json>) -> Patch {
        Patch {
            path: path.to_string(),
            operation: op.to_string(),
            value,
        }
    }

    #[test]
    fn overlays_create_structure() {
        let overlay = json!({
            "metadata": { "labels": { "team": "platform" }, "annotations": { "owner": "ops" } }
        });
        let out = apply_overlay(&pod(), &overlay).unwrap();
        assert_eq!(
            out["metadata"],
            json!({
                "name": "web-0",
                "labels": { "app": "web", "team": "platform" },
                "annotations": { "owner": "ops" },
            })
        );
    }

    #[test]
    fn add_if_absent() {
        let overlay = json!({ "metadata": { "labels": { "+(app)": "other", "+(tier)": "fe" } } });
        let out = apply_overlay(&pod(), &overlay).unwrap();
        assert_eq!(out["metadata"]["labels"], json!({ "app": "web", "tier": "fe" }));
    }

    #[test]
    fn anchored_array_elements_merge() {
        let overlay = json!({
            "spec": { "containers": [{ "(name)": "sidecar", "imagePullPolicy": "Always" }] }
        });
        let out = apply_overlay(&pod(), &overlay).unwrap();
        assert_eq!(
            out["spec"]["containers"],
            json!([
                { "name": "app", "image": "nginx:1.25" },
                { "name": "sidecar", "image": "envoy:1.30", "imagePullPolicy": "Always" },
            ])
        );

        let overlay = json!({
            "spec": { "containers": [{ "(name)": "proxy", "image": "envoy:1.31" }] }
        });
        let out = apply_overlay(&pod(), &overlay).unwrap();
        assert_eq!(
            out["spec"]["containers"][2],
            json!({ "name": "proxy", "image": "envoy:1.31" })
        );
    }

    #[test]
    fn conditional_anchors_skip_maps() {
        let overlay = json!({ "metadata": { "(name)": "api-*", "labels": { "tier": "api" } } });
        assert_eq!(apply_overlay(&pod(), &overlay).unwrap(), pod());
    }

    #[test]
    fn overlay_type_mismatch() {
        let overlay = json!({ "spec": { "containers": { "name": "x" } } });
        assert!(matches!(
            apply_overlay(&pod(), &overlay),
            Err(MutationError::TypeMismatch { path, .. }) if path == "/spec/containers/"
        ));
    }

    #[test]
    fn patches_apply_in_order() {
        let patches = vec![
            patch("add", "/metadata/labels/tier", Some(json!("fe"))),
            patch("Replace", "/metadata/labels/tier", Some(json!("be"))),
            patch("delete", "/metadata/labels/app", None),
        ];
        let out = apply_patches(&pod(), &patches).unwrap();
        assert_eq!(out["metadata"]["labels"], json!({ "tier": "be" }));
    }

    #[test]
    fn failed_patches_leave_input_untouched() {
        let input = pod();
        let patches = vec![
            patch("add", "/metadata/labels/tier", Some(json!("fe"))),
            patch("remove", "/metadata/annotations/missing", None),
        ];
        assert!(matches!(
            apply_patches(&input, &patches),
            Err(MutationError::Patch(_))
        ));
        assert_eq!(input, pod());

        let bogus = vec![patch("frobnicate", "/metadata", None)];
        assert!(matches!(
            apply_patches(&input, &bogus),
            Err(MutationError::InvalidPatch(_))
        ));
    }

    #[test]
    fn mutations_chain_overlay_then_patches() {
        let mutation = Mutation {
            overlay: Some(json!({ "metadata": { "labels": { "tier": "fe" } } })),
            patches: vec![patch("remove", "/metadata/labels/app", None)],
        };
        let out = mutate(&pod(), &mutation).unwrap();
        assert_eq!(out["metadata"]["labels"], json!({ "tier": "fe" }));
    }
}

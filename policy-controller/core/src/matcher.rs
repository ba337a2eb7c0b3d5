//! Decides whether a rule applies to a resource.
//!
//! A rule applies when its match block is satisfied and its exclude block is not. Each block
//! combines a resource description (kinds, name, namespaces and a label selector) with a
//! requester filter (roles, cluster roles and subjects). Every populated field must be
//! satisfied; an empty field is not a constraint.
//!
//! Requester filters only make sense for admission requests. During background scans there is
//! no requester, so user-info constraints are treated as vacuously satisfied in match blocks and
//! never cause an exclusion.

use crate::{
    k8s::{
        policy::{
            ExcludeResources, MatchResources, ResourceDescription, Rule, Subject, UserInfo,
        },
        RequestInfo,
    },
    wildcard, Mode, Resource,
};

/// True if the rule's match block applies and its exclude block does not.
pub fn applies(rule: &Rule, resource: &Resource, mode: Mode<'_>) -> bool {
    if !matches(&rule.match_resources, resource, mode) {
        return false;
    }
    match &rule.exclude_resources {
        Some(exclude) => !excluded(exclude, resource, mode),
        None => true,
    }
}

/// Evaluates a match block. An empty block matches everything.
pub fn matches(block: &MatchResources, resource: &Resource, mode: Mode<'_>) -> bool {
    block_matches(block, resource, mode).unwrap_or(true)
}

/// Evaluates an exclude block. An empty block excludes nothing.
pub fn excluded(block: &ExcludeResources, resource: &Resource, mode: Mode<'_>) -> bool {
    block_matches(block, resource, mode).unwrap_or(false)
}

/// Returns `None` when no populated field constrains the resource in this mode.
fn block_matches(block: &MatchResources, resource: &Resource, mode: Mode<'_>) -> Option<bool> {
    let mut constrained = false;

    if !block.resources.is_empty() {
        constrained = true;
        if !description_matches(&block.resources, resource) {
            return Some(false);
        }
    }

    if let Some(info) = mode.request_info() {
        if !block.user_info.is_empty() {
            constrained = true;
            if !user_info_matches(&block.user_info, info) {
                return Some(false);
            }
        }
    }

    constrained.then_some(true)
}

fn description_matches(desc: &ResourceDescription, resource: &Resource) -> bool {
    if !desc.kinds.is_empty() && !desc.kinds.iter().any(|k| *k == resource.kind) {
        return false;
    }

    if let Some(name) = desc.name.as_deref().filter(|n| !n.is_empty()) {
        if !wildcard::matches(name, &resource.name) {
            return false;
        }
    }

    if !desc.namespaces.is_empty() {
        let ns = resource.namespace().unwrap_or_default();
        if !desc.namespaces.iter().any(|p| wildcard::matches(p, ns)) {
            return false;
        }
    }

    if let Some(selector) = desc.selector.as_ref() {
        if !selector.matches(&resource.labels) {
            return false;
        }
    }

    true
}

fn user_info_matches(filter: &UserInfo, info: &RequestInfo) -> bool {
    if !filter.roles.is_empty() && !intersects(&filter.roles, &info.roles) {
        return false;
    }

    if !filter.cluster_roles.is_empty() && !intersects(&filter.cluster_roles, &info.cluster_roles)
    {
        return false;
    }

    if !filter.subjects.is_empty() && !filter.subjects.iter().any(|s| subject_matches(s, info)) {
        return false;
    }

    true
}

fn intersects(a: &[String], b: &[String]) -> bool {
    a.iter().any(|x| b.contains(x))
}

fn subject_matches(subject: &Subject, info: &RequestInfo) -> bool {
    let user = &info.admission_user_info;
    match subject.kind.as_str() {
        "User" => user.username == subject.name,
        "Group" => user.groups.iter().any(|g| *g == subject.name),
        "ServiceAccount" => {
            let ns = subject.namespace.as_deref().unwrap_or_default();
            user.username == format!("system:serviceaccount:{}:{}", ns, subject.name)
        }
        _ => false,
    }
}

use serde_json::Value as Json;

/// A map key in a pattern or overlay, with its anchor decoration parsed off.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub(crate) enum Key<'a> {
    /// `(key)`: the enclosing map only applies if this field matches.
    Condition(&'a str),

    /// `=(key)`: the field is checked only when present.
    Equality(&'a str),

    /// `+(key)`: the field is written only when absent.
    AddIfAbsent(&'a str),

    Plain(&'a str),
}

impl<'a> Key<'a> {
    pub(crate) fn parse(key: &'a str) -> Self {
        let enclosed = |s: &'a str| s.strip_prefix('(')?.strip_suffix(')');
        if let Some(k) = key.strip_prefix('=').and_then(enclosed) {
            return Self::Equality(k);
        }
        if let Some(k) = key.strip_prefix('+').and_then(enclosed) {
            return Self::AddIfAbsent(k);
        }
        if let Some(k) = enclosed(key) {
            return Self::Condition(k);
        }
        Self::Plain(key)
    }

    pub(crate) fn name(&self) -> &'a str {
        match *self {
            Self::Condition(k) | Self::Equality(k) | Self::AddIfAbsent(k) | Self::Plain(k) => k,
        }
    }

    pub(crate) fn is_condition(&self) -> bool {
        matches!(self, Self::Condition(_))
    }
}

/// True if any key of a map value carries a condition anchor.
pub(crate) fn has_conditions(value: &Json) -> bool {
    value
        .as_object()
        .map(|map| map.keys().any(|k| Key::parse(k).is_condition()))
        .unwrap_or(false)
}

/// Strips anchor decorations recursively, yielding the object an overlay would write.
pub(crate) fn strip(value: &Json) -> Json {
    match value {
        Json::Object(map) => Json::Object(
            map.iter()
                .map(|(k, v)| (Key::parse(k).name().to_string(), strip(v)))
                .collect(),
        ),
        Json::Array(items) => Json::Array(items.iter().map(strip).collect()),
        other => other.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parses_anchors() {
        assert_eq!(Key::parse("(name)"), Key::Condition("name"));
        assert_eq!(Key::parse("=(name)"), Key::Equality("name"));
        assert_eq!(Key::parse("+(name)"), Key::AddIfAbsent("name"));
        assert_eq!(Key::parse("name"), Key::Plain("name"));
        assert_eq!(Key::parse("(name"), Key::Plain("(name"));
    }

    #[test]
    fn strips_anchors() {
        let overlay = json!({ "(name)": "app", "+(image)": "nginx", "ports": [{ "=(port)": 80 }] });
        assert_eq!(
            strip(&overlay),
            json!({ "name": "app", "image": "nginx", "ports": [{ "port": 80 }] })
        );
    }
}

use ahash::AHashMap as HashMap;
use globset::{GlobBuilder, GlobMatcher};
use once_cell::sync::Lazy;
use parking_lot::RwLock;

/// Compiled matchers are kept until the cache reaches this size, at which point it is cleared.
const CACHE_CAPACITY: usize = 4096;

static MATCHERS: Lazy<RwLock<HashMap<String, Option<GlobMatcher>>>> =
    Lazy::new(|| RwLock::new(HashMap::new()));

/// Matches `value` against a glob `pattern` in which `*` matches any run of characters and `?`
/// matches exactly one. Every other character, `/` included, matches itself.
pub(crate) fn matches(pattern: &str, value: &str) -> bool {
    if !pattern.contains(['*', '?']) {
        return pattern == value;
    }

    if let Some(matcher) = MATCHERS.read().get(pattern) {
        return is_match(matcher.as_ref(), pattern, value);
    }

    let matcher = compile(pattern);
    let matched = is_match(matcher.as_ref(), pattern, value);
    let mut cache = MATCHERS.write();
    if cache.len() >= CACHE_CAPACITY {
        cache.clear();
    }
    cache.insert(pattern.to_string(), matcher);
    matched
}

fn is_match(matcher: Option<&GlobMatcher>, pattern: &str, value: &str) -> bool {
    match matcher {
        Some(matcher) => matcher.is_match(value),
        None => pattern == value,
    }
}

fn compile(pattern: &str) -> Option<GlobMatcher> {
    let glob = GlobBuilder::new(&escape(pattern))
        .literal_separator(false)
        .backslash_escape(true)
        .case_insensitive(false)
        .build();
    match glob {
        Ok(glob) => Some(glob.compile_matcher()),
        Err(error) => {
            tracing::debug!(%pattern, %error, "Invalid wildcard; matching literally");
            None
        }
    }
}

/// Rewrites a wildcard into glob syntax: class and alternate delimiters are escaped and runs of
/// `*` collapse into one.
fn escape(pattern: &str) -> String {
    let mut glob = String::with_capacity(pattern.len());
    for c in pattern.chars() {
        match c {
            '*' if glob.ends_with('*') => {}
            '[' | ']' | '{' | '}' | '\\' => {
                glob.push('\\');
                glob.push(c);
            }
            c => glob.push(c),
        }
    }
    glob
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn globs() {
        for (pattern, value, expected) in [
            ("*", "", true),
            ("*", "anything", true),
            ("?*", "", false),
            ("?*", "a", true),
            ("web-*", "web-0", true),
            ("web-*", "api-0", false),
            ("*-system", "kube-system", true),
            ("k*e-*m", "kube-system", true),
            ("web-?", "web-10", false),
            ("web-??", "web-10", true),
            ("exact", "exact", true),
            ("exact", "exactly", false),
        ] {
            assert_eq!(matches(pattern, value), expected, "{pattern} ~ {value}");
        }
    }

    #[test]
    fn separators_and_metacharacters_are_literal() {
        for (pattern, value, expected) in [
            ("*", "ghcr.io/team/app:1.0", true),
            ("ghcr.io/*", "ghcr.io/team/app:1.0", true),
            ("*/app:?.?", "ghcr.io/team/app:1.0", true),
            ("**", "a/b", true),
            ("a**b", "a/x/b", true),
            ("[ab]*", "[ab]c", true),
            ("[ab]*", "ac", false),
            ("{a,b}?", "{a,b}c", true),
            ("{a,b}?", "ac", false),
            ("a\\*", "a\\bc", true),
        ] {
            assert_eq!(matches(pattern, value), expected, "{pattern} ~ {value}");
        }
    }

    #[test]
    fn escapes_glob_syntax() {
        assert_eq!(escape("a***b"), "a*b");
        assert_eq!(escape("[x]{y}"), "\\[x\\]\\{y\\}");
        assert_eq!(escape("a\\b"), "a\\\\b");
    }
}

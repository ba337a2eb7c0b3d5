use sha2::{Digest, Sha256};

/// Hashes a sequence of fields into a short, lowercase hex string that is safe to use in object
/// names.
///
/// Fields are separated by a NUL byte, which cannot appear in any of them, so distinct sequences
/// never hash the same input.
pub(crate) fn short(fields: &[&str]) -> String {
    let mut hasher = Sha256::new();
    for (i, field) in fields.iter().enumerate() {
        if i > 0 {
            hasher.update([0u8]);
        }
        hasher.update(field.as_bytes());
    }
    hex::encode(&hasher.finalize()[..5])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn field_boundaries_are_significant() {
        assert_eq!(short(&["a", "b"]).len(), 10);
        assert_eq!(short(&["a", "b"]), short(&["a", "b"]));
        assert_ne!(short(&["a", "bc"]), short(&["ab", "c"]));
        assert_ne!(short(&["a.b"]), short(&["a/b"]));
    }
}

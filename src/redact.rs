//! Scrubbing of secret material from text headed for logs or the user.

/// Replacement written in place of a secret.
pub const MASK: &str = "********";

/// Replace every literal occurrence of `secret` in `text` with [`MASK`].
///
/// An empty secret leaves the text untouched.
pub fn scrub(text: &str, secret: &str) -> String {
    if secret.is_empty() {
        return text.to_string();
    }
    text.replace(secret, MASK)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scrub_replaces_all_occurrences() {
        let out = scrub("bad password hunter2 (hunter2)", "hunter2");
        assert_eq!(out, "bad password ******** (********)");
    }

    #[test]
    fn test_scrub_empty_secret() {
        assert_eq!(scrub("nothing to hide", ""), "nothing to hide");
    }
}

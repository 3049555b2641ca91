// SPDX-License-Identifier: MIT OR Apache-2.0
//! Secret masking for captured process output.
//!
//! Masking runs before any event is published or anything is persisted, so
//! a secret value never leaves the process boundary in clear text.

/// Replace every literal occurrence of each secret value with `***`.
///
/// Empty secrets are ignored. Longer secrets are replaced first so that a
/// secret which is a substring of another cannot split its mask.
#[must_use]
pub fn mask_secrets(text: &str, secrets: &[String]) -> String {
    if secrets.is_empty() || text.is_empty() {
        return text.to_string();
    }
    let mut ordered: Vec<&str> = secrets
        .iter()
        .map(String::as_str)
        .filter(|s| !s.is_empty())
        .collect();
    ordered.sort_by_key(|s| std::cmp::Reverse(s.len()));

    let mut masked = text.to_string();
    for secret in ordered {
        masked = masked.replace(secret, "***");
    }
    masked
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn secrets(xs: &[&str]) -> Vec<String> {
        xs.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn masks_every_occurrence() {
        let out = mask_secrets("key=abc abc tail abc", &secrets(&["abc"]));
        assert_eq!(out, "key=*** *** tail ***");
    }

    #[test]
    fn empty_secret_list_is_identity() {
        assert_eq!(mask_secrets("plain", &[]), "plain");
    }

    #[test]
    fn empty_secret_values_are_ignored() {
        assert_eq!(mask_secrets("plain", &secrets(&[""])), "plain");
    }

    #[test]
    fn longer_secrets_mask_first() {
        // "secretlong" contains "secret"; masking "secret" first would leave "long".
        let out = mask_secrets("value secretlong end", &secrets(&["secret", "secretlong"]));
        assert_eq!(out, "value *** end");
    }

    #[test]
    fn multiline_output_is_masked() {
        let out = mask_secrets("line1 tok\nline2 tok\n", &secrets(&["tok"]));
        assert!(!out.contains("tok"));
    }

    proptest! {
        // No secret value survives masking as a substring.
        #[test]
        fn masked_output_never_contains_a_secret(
            text in "[a-z ]{0,60}",
            secret in "[a-z]{3,12}",
        ) {
            let masked = mask_secrets(&text, &[secret.clone()]);
            prop_assert!(!masked.contains(&secret), "secret '{}' survived in '{}'", secret, masked);
        }
    }
}

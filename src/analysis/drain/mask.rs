//! Variable masking for log lines.
//!
//! Masking runs before tokenization so that variable fragments (addresses,
//! ids, numbers) collapse into placeholders and structurally identical lines
//! mine into the same template. Masking is idempotent: placeholders never
//! re-match any pattern.

use std::sync::LazyLock;

use regex::Regex;

pub const IP_PLACEHOLDER: &str = "<IP>";
pub const UUID_PLACEHOLDER: &str = "<UUID>";
pub const NUM_PLACEHOLDER: &str = "<NUM>";
pub const PATH_PLACEHOLDER: &str = "<PATH>";
pub const TIMESTAMP_PLACEHOLDER: &str = "<TS>";

static TIMESTAMP_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"\d{4}-\d{2}-\d{2}[t ]\d{2}:\d{2}:\d{2}(\.\d+)?(z|[+-]\d{2}:?\d{2})?",
    )
    .expect("timestamp regex")
});

static UUID_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\b[0-9a-f]{8}-[0-9a-f]{4}-[0-9a-f]{4}-[0-9a-f]{4}-[0-9a-f]{12}\b")
        .expect("uuid regex")
});

static IP_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\b\d{1,3}\.\d{1,3}\.\d{1,3}\.\d{1,3}(:\d+)?\b").expect("ip regex")
});

static PATH_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?:^|\s)((?:/[a-z0-9._-]+){2,}/?)").expect("path regex")
});

static NUM_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\b\d+(\.\d+)?\b").expect("number regex")
});

/// Punctuation padded with spaces after masking so it tokenizes separately.
const PADDED: &[char] = &['=', ',', ';', '(', ')', '[', ']', '"'];

/// Lowercasing mangles placeholders from a previous pass; restore them so
/// `mask` is idempotent.
fn restore_placeholders(line: String) -> String {
    line.replace("<ip>", IP_PLACEHOLDER)
        .replace("<uuid>", UUID_PLACEHOLDER)
        .replace("<num>", NUM_PLACEHOLDER)
        .replace("<path>", PATH_PLACEHOLDER)
        .replace("<ts>", TIMESTAMP_PLACEHOLDER)
}

/// Lowercases, masks variables, pads punctuation, and normalizes whitespace.
pub fn mask(line: &str) -> String {
    let lowered = restore_placeholders(line.to_lowercase());

    let masked = TIMESTAMP_RE.replace_all(&lowered, TIMESTAMP_PLACEHOLDER);
    let masked = UUID_RE.replace_all(&masked, UUID_PLACEHOLDER);
    let masked = IP_RE.replace_all(&masked, IP_PLACEHOLDER);
    let masked = PATH_RE.replace_all(&masked, |caps: &regex::Captures<'_>| {
        let whole = caps.get(0).map(|m| m.as_str()).unwrap_or_default();
        let path = caps.get(1).map(|m| m.as_str()).unwrap_or_default();
        whole.replace(path, PATH_PLACEHOLDER)
    });
    let masked = NUM_RE.replace_all(&masked, NUM_PLACEHOLDER);

    let mut padded = String::with_capacity(masked.len() + 8);
    for c in masked.chars() {
        if PADDED.contains(&c) {
            padded.push(' ');
            padded.push(c);
            padded.push(' ');
        } else {
            padded.push(c);
        }
    }
    padded.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Masked line split into tokens.
pub fn tokenize(line: &str) -> Vec<String> {
    mask(line).split_whitespace().map(str::to_string).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::proptest;

    #[test]
    fn masks_ip_addresses() {
        assert_eq!(mask("connected to 10.0.0.1"), "connected to <IP>");
        assert_eq!(mask("connected to 10.0.0.1:8080"), "connected to <IP>");
    }

    #[test]
    fn masks_uuids_and_numbers() {
        assert_eq!(
            mask("request 6ba7b810-9dad-11d1-80b4-00c04fd430c8 took 42 ms"),
            "request <UUID> took <NUM> ms"
        );
    }

    #[test]
    fn masks_timestamps_before_numbers() {
        assert_eq!(
            mask("at 2024-01-02T03:04:05Z level=info"),
            "at <TS> level = info"
        );
    }

    #[test]
    fn masks_paths() {
        assert_eq!(mask("read /var/log/app.log failed"), "read <PATH> failed");
    }

    #[test]
    fn masking_is_idempotent_on_samples() {
        for line in [
            "connected to 10.0.0.1",
            "request 6ba7b810-9dad-11d1-80b4-00c04fd430c8 took 42 ms",
            "at 2024-01-02T03:04:05Z level=info",
            "read /var/log/app.log failed",
            "GET /api/v1/pods returned 200 in 12.5ms",
        ] {
            let once = mask(line);
            assert_eq!(mask(&once), once, "not idempotent for {line:?}");
        }
    }

    proptest! {
        #[test]
        fn masking_is_idempotent(line in "[ -~]{0,80}") {
            let once = mask(&line);
            assert_eq!(mask(&once), once);
        }
    }
}

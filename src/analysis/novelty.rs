//! Novelty detection between mining windows.

use serde::Serialize;

use super::drain::Template;

/// A template as reported by the patterns tool: ranked by count, flagged
/// when unseen in the previous window.
#[derive(Clone, Debug, Serialize)]
pub struct PatternEntry {
    pub template_id: String,
    pub pattern: String,
    pub count: u64,
    pub novel: bool,
}

/// Compares the current window against the previous window of equal length.
/// Entries come back sorted by count descending, novel templates flagged.
pub fn compare_windows(current: &[Template], previous: &[Template]) -> Vec<PatternEntry> {
    let previous_ids: std::collections::HashSet<&str> =
        previous.iter().map(|t| t.id.as_str()).collect();

    let mut entries: Vec<PatternEntry> = current
        .iter()
        .map(|t| PatternEntry {
            template_id: t.id.clone(),
            pattern: t.pattern(),
            count: t.count,
            novel: !previous_ids.contains(t.id.as_str()),
        })
        .collect();

    entries.sort_by(|a, b| b.count.cmp(&a.count).then(a.pattern.cmp(&b.pattern)));
    entries
}

#[cfg(test)]
mod tests {
    use super::*;

    fn template(id: &str, pattern: &str, count: u64) -> Template {
        Template {
            id: id.into(),
            tokens: pattern.split(' ').map(str::to_string).collect(),
            count,
            first_seen: 0,
            last_seen: 0,
        }
    }

    #[test]
    fn unseen_template_is_novel() {
        let current = vec![
            template("a", "connected to <IP>", 10),
            template("b", "request took <NUM> ms", 5),
            template("c", "segfault in worker <*>", 1),
        ];
        let previous = vec![
            template("a", "connected to <IP>", 8),
            template("b", "request took <NUM> ms", 7),
        ];

        let entries = compare_windows(&current, &previous);
        assert_eq!(entries.len(), 3);
        // Ranked by count descending.
        assert_eq!(entries[0].template_id, "a");
        assert_eq!(entries[1].template_id, "b");
        assert_eq!(entries[2].template_id, "c");
        assert!(!entries[0].novel);
        assert!(!entries[1].novel);
        assert!(entries[2].novel);
    }

    #[test]
    fn empty_previous_window_flags_everything() {
        let current = vec![template("a", "x y", 1)];
        let entries = compare_windows(&current, &[]);
        assert!(entries[0].novel);
    }
}

//! Online log template mining (the Drain algorithm).
//!
//! The tree partitions first by token count, then by a fixed-depth token
//! prefix; leaves hold competing templates. Each line either merges into the
//! most similar template (mismatching tokens become `<*>`) or founds a new
//! one.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

pub mod mask;
pub mod store;

pub use mask::{mask, tokenize};

pub const WILDCARD: &str = "<*>";

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DrainConfig {
    /// Minimum similarity for merging into an existing template.
    pub similarity_threshold: f64,
    /// Tree depth below the token-count level.
    pub max_depth: usize,
    /// Maximum distinct children per prefix node; overflow routes through a
    /// wildcard child so high-cardinality prefixes cannot explode the tree.
    pub max_children: usize,
}

impl Default for DrainConfig {
    fn default() -> Self {
        Self {
            similarity_threshold: 0.5,
            max_depth: 4,
            max_children: 100,
        }
    }
}

/// A mined template.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Template {
    pub id: String,
    pub tokens: Vec<String>,
    pub count: u64,
    pub first_seen: i64,
    pub last_seen: i64,
}

impl Template {
    pub fn pattern(&self) -> String {
        self.tokens.join(" ")
    }
}

/// Stable hash over a template's final token sequence.
pub fn template_id(tokens: &[String]) -> String {
    let mut hasher = Sha256::new();
    for token in tokens {
        hasher.update(token.as_bytes());
        hasher.update([0x1f]);
    }
    let digest = hasher.finalize();
    hex_prefix(&digest, 8)
}

fn hex_prefix(bytes: &[u8], n: usize) -> String {
    bytes.iter().take(n).map(|b| format!("{b:02x}")).collect()
}

/// Outcome of processing one line.
#[derive(Clone, Debug, PartialEq)]
pub struct ProcessOutcome {
    pub template_id: String,
    pub created: bool,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct PrefixNode {
    children: HashMap<String, PrefixNode>,
    templates: Vec<Template>,
}

/// One Drain tree. Not itself synchronized; the store wraps trees in locks.
#[derive(Debug, Serialize, Deserialize)]
pub struct DrainTree {
    config: DrainConfig,
    /// First-level partitioning by token count.
    by_length: HashMap<usize, PrefixNode>,
    /// Total lines processed.
    lines_seen: u64,
}

impl DrainTree {
    pub fn new(config: DrainConfig) -> Self {
        Self {
            config,
            by_length: HashMap::new(),
            lines_seen: 0,
        }
    }

    pub fn lines_seen(&self) -> u64 {
        self.lines_seen
    }

    /// Processes one raw line at the given timestamp.
    pub fn process(&mut self, line: &str, now: i64) -> Option<ProcessOutcome> {
        let tokens = tokenize(line);
        if tokens.is_empty() {
            return None;
        }
        self.lines_seen += 1;

        let threshold = self.config.similarity_threshold;
        let node = self.leaf_for(&tokens);

        let mut best: Option<(usize, f64)> = None;
        for (index, template) in node.templates.iter().enumerate() {
            let sim = similarity(&template.tokens, &tokens);
            if best.map(|(_, s)| sim > s).unwrap_or(true) {
                best = Some((index, sim));
            }
        }

        match best {
            Some((index, sim)) if sim >= threshold => {
                let template = &mut node.templates[index];
                merge_into(template, &tokens);
                template.count += 1;
                template.last_seen = now;
                template.id = template_id(&template.tokens);
                Some(ProcessOutcome {
                    template_id: template.id.clone(),
                    created: false,
                })
            }
            _ => {
                let id = template_id(&tokens);
                node.templates.push(Template {
                    id: id.clone(),
                    tokens,
                    count: 1,
                    first_seen: now,
                    last_seen: now,
                });
                Some(ProcessOutcome {
                    template_id: id,
                    created: true,
                })
            }
        }
    }

    /// Descends to (creating as needed) the leaf for a token sequence.
    /// Tokens still carrying digits are variable-ish and route through the
    /// wildcard child, as does any token once a node is at its child limit.
    fn leaf_for(&mut self, tokens: &[String]) -> &mut PrefixNode {
        let depth = self.config.max_depth.min(tokens.len());
        let max_children = self.config.max_children;
        let mut node = self.by_length.entry(tokens.len()).or_default();
        for token in tokens.iter().take(depth) {
            let key = if token.chars().any(|c| c.is_ascii_digit()) {
                WILDCARD.to_string()
            } else if node.children.len() >= max_children && !node.children.contains_key(token)
            {
                WILDCARD.to_string()
            } else {
                token.clone()
            };
            node = node.children.entry(key).or_default();
        }
        node
    }

    /// Re-inserts a persisted template at its leaf without touching counts.
    pub fn insert_template(&mut self, template: Template) {
        let tokens = template.tokens.clone();
        self.leaf_for(&tokens).templates.push(template);
    }

    /// All templates, unordered.
    pub fn templates(&self) -> Vec<Template> {
        let mut out = Vec::new();
        for node in self.by_length.values() {
            collect(node, &mut out);
        }
        out
    }

    /// Merges templates within each leaf that have converged to the same
    /// wildcarded shape. Returns the number of templates merged away.
    pub fn rebalance(&mut self) -> usize {
        let mut merged = 0;
        for node in self.by_length.values_mut() {
            merged += rebalance_node(node);
        }
        merged
    }
}

fn collect(node: &PrefixNode, out: &mut Vec<Template>) {
    out.extend(node.templates.iter().cloned());
    for child in node.children.values() {
        collect(child, out);
    }
}

fn rebalance_node(node: &mut PrefixNode) -> usize {
    let mut merged = 0;

    let mut kept: Vec<Template> = Vec::with_capacity(node.templates.len());
    for template in node.templates.drain(..) {
        match kept
            .iter()
            .position(|k| converged(&k.tokens, &template.tokens))
        {
            Some(index) => {
                let existing = &mut kept[index];
                merge_into(existing, &template.tokens);
                existing.count += template.count;
                existing.first_seen = existing.first_seen.min(template.first_seen);
                existing.last_seen = existing.last_seen.max(template.last_seen);
                existing.id = template_id(&existing.tokens);
                merged += 1;
            }
            None => kept.push(template),
        }
    }
    node.templates = kept;

    for child in node.children.values_mut() {
        merged += rebalance_node(child);
    }
    merged
}

/// Whether two token sequences differ only where one of them is already a
/// wildcard.
fn converged(a: &[String], b: &[String]) -> bool {
    a.len() == b.len()
        && a.iter()
            .zip(b)
            .all(|(x, y)| x == y || x == WILDCARD || y == WILDCARD)
}

/// Fraction of positions whose tokens agree (wildcard agrees with anything).
/// Sequences of different lengths never match.
fn similarity(template: &[String], tokens: &[String]) -> f64 {
    if template.len() != tokens.len() || template.is_empty() {
        return 0.0;
    }
    let matching = template
        .iter()
        .zip(tokens)
        .filter(|(t, l)| t == l || t.as_str() == WILDCARD)
        .count();
    matching as f64 / template.len() as f64
}

/// Replaces mismatching template tokens with the wildcard.
fn merge_into(template: &mut Template, tokens: &[String]) {
    for (slot, token) in template.tokens.iter_mut().zip(tokens) {
        if slot != token && slot != WILDCARD {
            *slot = WILDCARD.to_string();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identical_masked_lines_share_a_template() {
        let mut tree = DrainTree::new(DrainConfig::default());
        let a = tree.process("connected to 10.0.0.1", 1).unwrap();
        let b = tree.process("connected to 10.0.0.2", 2).unwrap();

        assert_eq!(a.template_id, b.template_id);
        assert!(a.created);
        assert!(!b.created);

        let templates = tree.templates();
        assert_eq!(templates.len(), 1);
        assert_eq!(templates[0].count, 2);
        assert!(
            templates[0].pattern().contains("<IP>") || templates[0].pattern().contains(WILDCARD)
        );
    }

    #[test]
    fn dissimilar_lines_get_distinct_templates() {
        let mut tree = DrainTree::new(DrainConfig::default());
        tree.process("connection refused by peer gateway", 1);
        tree.process("user login succeeded for admin role", 2);
        assert_eq!(tree.templates().len(), 2);
    }

    #[test]
    fn variable_position_becomes_wildcard() {
        let mut tree = DrainTree::new(DrainConfig::default());
        tree.process("worker started on shard alpha", 1);
        tree.process("worker started on shard omega", 2);

        let templates = tree.templates();
        assert_eq!(templates.len(), 1);
        assert_eq!(templates[0].pattern(), format!("worker started on shard {WILDCARD}"));
        assert_eq!(templates[0].count, 2);
    }

    #[test]
    fn template_id_is_stable_over_tokens() {
        let tokens: Vec<String> = ["connected", "to", "<IP>"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        assert_eq!(template_id(&tokens), template_id(&tokens.clone()));
    }

    #[test]
    fn tree_output_is_stable_under_reordering() {
        let lines = [
            "connected to 10.0.0.1",
            "disconnected from 10.0.0.2",
            "connected to 10.0.0.3",
            "request took 15 ms",
        ];
        let mut forward = DrainTree::new(DrainConfig::default());
        for (i, line) in lines.iter().enumerate() {
            forward.process(line, i as i64);
        }
        let mut backward = DrainTree::new(DrainConfig::default());
        for (i, line) in lines.iter().rev().enumerate() {
            backward.process(line, i as i64);
        }

        let mut a: Vec<String> = forward.templates().iter().map(Template::pattern).collect();
        let mut b: Vec<String> = backward.templates().iter().map(Template::pattern).collect();
        a.sort();
        b.sort();
        assert_eq!(a, b);
    }

    #[test]
    fn rebalance_merges_converged_templates() {
        let mut tree = DrainTree::new(DrainConfig {
            similarity_threshold: 0.9,
            ..Default::default()
        });
        // The high threshold keeps these apart even though the second has
        // already wildcarded the differing slot.
        tree.process("cache flush started for tier hot", 1);
        tree.process("cache flush started for tier <*>", 2);
        assert_eq!(tree.templates().len(), 2);

        let merged = tree.rebalance();
        assert_eq!(merged, 1);

        let templates = tree.templates();
        assert_eq!(templates.len(), 1);
        assert_eq!(templates[0].count, 2);
        assert_eq!(
            templates[0].pattern(),
            format!("cache flush started for tier {WILDCARD}")
        );
    }
}

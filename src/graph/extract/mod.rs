//! Pluggable edge extraction.
//!
//! Each extractor declares a predicate over events, the edge types it may
//! emit, and produces evidence-bearing edge candidates. The chain runs in
//! priority order: explicit references first, heuristics last.

pub mod heuristics;
pub mod owner;
pub mod spec_refs;

use crate::event::Event;
use crate::graph::model::{EdgeCandidate, EdgeType};

pub trait Extractor: Send + Sync {
    fn name(&self) -> &'static str;

    /// Edge types this extractor may emit.
    fn edge_types(&self) -> &'static [EdgeType];

    fn matches(&self, event: &Event) -> bool;

    fn extract(&self, event: &Event) -> Vec<EdgeCandidate>;
}

/// The default chain, in priority order.
pub fn default_chain() -> Vec<Box<dyn Extractor>> {
    vec![
        Box::new(owner::OwnerReferenceExtractor),
        Box::new(spec_refs::SpecReferenceExtractor),
        Box::new(heuristics::GitOpsManagerExtractor),
        Box::new(heuristics::ObservedCreationExtractor),
    ]
}

/// Runs every matching extractor over the event.
pub fn run_chain(chain: &[Box<dyn Extractor>], event: &Event) -> Vec<EdgeCandidate> {
    let mut candidates = Vec::new();
    for extractor in chain {
        if !extractor.matches(event) {
            continue;
        }
        let mut found = extractor.extract(event);
        if !found.is_empty() {
            trace!(
                message = "extractor produced edges",
                extractor = extractor.name(),
                count = found.len(),
            );
        }
        candidates.append(&mut found);
    }
    candidates
}

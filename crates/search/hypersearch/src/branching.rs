//! Field-branching policy
//!
//! Sprint 0 searches every candidate field alone. Each later sprint extends
//! the previous sprint's winner by one more field, skipping fields whose
//! measured contribution fell under the configured minimum.

use std::collections::{BTreeMap, BTreeSet};

use crate::types::SwarmId;

/// Swarms of the first sprint: one per candidate field
pub fn initial_swarms(fields: &[String]) -> Vec<SwarmId> {
    let mut swarms: Vec<SwarmId> = fields.iter().map(|f| SwarmId::from_fields([f])).collect();
    swarms.sort();
    swarms.dedup();
    swarms
}

/// Swarms of the sprint following the one won by `winner`, best-contributing
/// field first
///
/// Fields without a measured contribution follow the measured ones, by name.
/// `max_field_branching` caps the combination size, 0 meaning unlimited.
pub fn next_swarms(
    winner: &SwarmId,
    fields: &[String],
    contributions: &BTreeMap<String, f64>,
    blacklisted: &BTreeSet<String>,
    max_field_branching: usize,
) -> Vec<SwarmId> {
    if max_field_branching > 0 && winner.len() >= max_field_branching {
        return Vec::new();
    }
    let candidates: BTreeSet<&String> = fields
        .iter()
        .filter(|f| !winner.contains(f) && !blacklisted.contains(*f))
        .collect();
    let mut ordered: Vec<&String> = ranked_fields(contributions)
        .into_iter()
        .filter(|f| candidates.contains(f))
        .collect();
    ordered.extend(candidates.iter().copied().filter(|f| !contributions.contains_key(f.as_str())));
    ordered.into_iter().map(|f| winner.with_field(f)).collect()
}

/// Fields whose contribution is below `min_contribution`
pub fn blacklist(contributions: &BTreeMap<String, f64>, min_contribution: f64) -> BTreeSet<String> {
    contributions
        .iter()
        .filter(|(_, c)| **c < min_contribution)
        .map(|(f, _)| f.clone())
        .collect()
}

/// Measured fields, highest contribution first, ties by name
fn ranked_fields(contributions: &BTreeMap<String, f64>) -> Vec<&String> {
    let mut ranked: Vec<(&String, f64)> = contributions.iter().map(|(f, c)| (f, *c)).collect();
    ranked.sort_by(|a, b| b.1.total_cmp(&a.1).then_with(|| a.0.cmp(b.0)));
    ranked.into_iter().map(|(f, _)| f).collect()
}

/// Percentage improvement of `error` over `baseline`
pub fn contribution(baseline: f64, error: f64) -> f64 {
    let scale = baseline.abs();
    if scale < f64::EPSILON {
        return if error < baseline { 100.0 } else { 0.0 };
    }
    100.0 * (baseline - error) / scale
}

/// Lowest-error candidate, ties broken by the lexicographically smallest id
pub fn pick_winner<'a, I>(candidates: I) -> Option<(SwarmId, f64)>
where
    I: IntoIterator<Item = (&'a SwarmId, f64)>,
{
    candidates
        .into_iter()
        .filter(|(_, e)| e.is_finite())
        .min_by(|a, b| a.1.total_cmp(&b.1).then_with(|| a.0.cmp(b.0)))
        .map(|(id, e)| (id.clone(), e))
}

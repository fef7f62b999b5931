//! Context budgeter: token-caps the retrieved set by role quota, schemas
//! first, then fills leftovers by priority.

use crate::models::{ContextItem, RetrievalContext};

/// Token estimator seam; the default is the whitespace heuristic.
pub trait TokenEstimator: Send + Sync {
    fn count(&self, text: &str) -> usize;
}

pub struct WhitespaceEstimator;

impl TokenEstimator for WhitespaceEstimator {
    fn count(&self, text: &str) -> usize {
        text.split_whitespace().count().max(1)
    }
}

/// How much of the schema catalog the active scope covers; drives the quota
/// profile selection.
#[derive(Debug, Clone, Copy, Default)]
pub struct ScopeProfile {
    pub scope_size: usize,
    pub total_tables: usize,
}

impl ScopeProfile {
    fn is_broad(&self) -> bool {
        self.scope_size > 0
            && self.total_tables > 0
            && (self.scope_size as f64 / self.total_tables as f64) >= 0.80
    }
}

struct Quotas {
    schemas: usize,
    examples: usize,
    glossary: usize,
    templates: usize,
}

fn quotas_for(budget: usize, scope: ScopeProfile) -> Quotas {
    let (schema_ratio, example_ratio, glossary_ratio) = if scope.is_broad() {
        // Scope is effectively "all tables": lighten schema share to reduce
        // context bias toward table dumps.
        (0.50, 0.28, 0.14)
    } else if scope.scope_size >= 8 {
        (0.62, 0.20, 0.10)
    } else if scope.scope_size > 0 {
        (0.58, 0.20, 0.10)
    } else {
        (0.55, 0.25, 0.12)
    };
    let schemas = (budget as f64 * schema_ratio) as usize;
    let examples = (budget as f64 * example_ratio) as usize;
    let glossary = (budget as f64 * glossary_ratio) as usize;
    let templates = budget.saturating_sub(schemas + examples + glossary);
    Quotas { schemas, examples, glossary, templates }
}

fn rank(items: &[ContextItem]) -> Vec<ContextItem> {
    if items.iter().all(|i| i.score.is_none()) {
        return items.to_vec();
    }
    let mut ranked = items.to_vec();
    ranked.sort_by(|a, b| {
        b.score
            .unwrap_or(0.0)
            .partial_cmp(&a.score.unwrap_or(0.0))
            .unwrap_or(std::cmp::Ordering::Equal)
    });
    ranked
}

fn trim(
    estimator: &dyn TokenEstimator,
    items: Vec<ContextItem>,
    budget: usize,
) -> (Vec<ContextItem>, usize, Vec<ContextItem>) {
    if budget == 0 {
        return (Vec::new(), 0, items);
    }
    let mut kept: Vec<ContextItem> = Vec::new();
    let mut leftover: Vec<ContextItem> = Vec::new();
    let mut used = 0usize;
    for item in items {
        let cost = estimator.count(&item.text);
        if used + cost > budget {
            leftover.push(item);
            continue;
        }
        used += cost;
        kept.push(item);
    }
    (kept, used, leftover)
}

/// Trim `context` to `budget` tokens under the role quotas.
pub fn trim_context_to_budget(
    estimator: &dyn TokenEstimator,
    context: RetrievalContext,
    budget: usize,
    scope: ScopeProfile,
) -> RetrievalContext {
    if budget == 0 {
        return RetrievalContext::default();
    }

    let quotas = quotas_for(budget, scope);
    let mut remaining = budget;

    let mut pools = [
        (rank(&context.schemas), quotas.schemas),
        (rank(&context.examples), quotas.examples),
        (rank(&context.glossary), quotas.glossary),
        (rank(&context.templates), quotas.templates),
    ];
    let mut kept: [Vec<ContextItem>; 4] = Default::default();

    // Pass 1: quota-respecting fill, critical roles first.
    for (idx, (items, quota)) in pools.iter_mut().enumerate() {
        if remaining == 0 {
            break;
        }
        let part_budget = (*quota).min(remaining);
        if part_budget == 0 {
            continue;
        }
        let (chunk, used, leftover) = trim(estimator, std::mem::take(items), part_budget);
        kept[idx].extend(chunk);
        *items = leftover;
        remaining = remaining.saturating_sub(used);
    }

    // Pass 2: fill leftovers by priority.
    for (idx, (items, _)) in pools.iter_mut().enumerate() {
        if remaining == 0 {
            break;
        }
        let (chunk, used, leftover) = trim(estimator, std::mem::take(items), remaining);
        kept[idx].extend(chunk);
        *items = leftover;
        remaining = remaining.saturating_sub(used);
    }

    let [schemas, examples, glossary, templates] = kept;
    RetrievalContext { schemas, examples, templates, glossary }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn item(text: &str, score: f64) -> ContextItem {
        ContextItem { text: text.to_string(), score: Some(score), source: "test".to_string() }
    }

    fn context_with(n_schemas: usize, n_examples: usize) -> RetrievalContext {
        RetrievalContext {
            schemas: (0..n_schemas).map(|i| item(&format!("schema doc {}", i), 1.0)).collect(),
            examples: (0..n_examples).map(|i| item(&format!("example doc {}", i), 0.5)).collect(),
            templates: Vec::new(),
            glossary: Vec::new(),
        }
    }

    #[test]
    fn zero_budget_empties_everything() {
        let estimator = WhitespaceEstimator;
        let trimmed = trim_context_to_budget(
            &estimator,
            context_with(3, 3),
            0,
            ScopeProfile::default(),
        );
        assert!(trimmed.is_empty());
    }

    #[test]
    fn schemas_win_under_tight_budget() {
        let estimator = WhitespaceEstimator;
        // Each doc costs 3 tokens; budget of 6 with 55% schema quota keeps
        // one schema doc in pass 1, leftovers fill schemas first again.
        let trimmed = trim_context_to_budget(
            &estimator,
            context_with(4, 4),
            6,
            ScopeProfile::default(),
        );
        assert!(!trimmed.schemas.is_empty());
        let total: usize = trimmed
            .schemas
            .iter()
            .chain(&trimmed.examples)
            .map(|i| i.text.split_whitespace().count())
            .sum();
        assert!(total <= 6);
    }

    #[test]
    fn ranked_by_score_within_role() {
        let estimator = WhitespaceEstimator;
        let context = RetrievalContext {
            schemas: vec![item("low score doc", 0.1), item("high score doc", 0.9)],
            examples: Vec::new(),
            templates: Vec::new(),
            glossary: Vec::new(),
        };
        let trimmed =
            trim_context_to_budget(&estimator, context, 3, ScopeProfile::default());
        assert_eq!(trimmed.schemas.len(), 1);
        assert_eq!(trimmed.schemas[0].text, "high score doc");
    }
}

use std::cmp::Reverse;
use std::collections::BTreeSet;

use crate::compare::Comparator;
use crate::model::{Confidence, ExtractedDocument, LedgerRow, MatchPass};
use crate::normalize::normalize_document_number;

/// Row indices claimed during one verification run. Only ever grows.
#[derive(Debug, Clone, Default)]
pub struct ClaimSet {
    claimed: BTreeSet<usize>,
}

impl ClaimSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_claimed(&self, row_index: usize) -> bool {
        self.claimed.contains(&row_index)
    }

    /// Returns false if the row was already claimed.
    fn claim(&mut self, row_index: usize) -> bool {
        self.claimed.insert(row_index)
    }

    pub fn len(&self) -> usize {
        self.claimed.len()
    }

    pub fn is_empty(&self) -> bool {
        self.claimed.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = usize> + '_ {
        self.claimed.iter().copied()
    }
}

/// A claim: position of the row in the ledger slice, and which pass made it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Assignment {
    pub row: usize,
    pub pass: MatchPass,
}

#[derive(Debug, Clone)]
pub struct MatchOutcome {
    /// Indexed by document position in the input slice.
    pub assignments: Vec<Option<Assignment>>,
    pub claims: ClaimSet,
}

/// Assign each document to at most one ledger row.
///
/// Pass 1 claims exact document-number matches for high and medium
/// confidence documents, high first. Pass 2 gives every remaining document
/// the unclaimed row with the fewest mismatches, best confidence first, and
/// rejects candidates at or above the mismatch ceiling.
pub fn match_documents(
    docs: &[ExtractedDocument],
    rows: &[LedgerRow],
    comparator: &Comparator,
) -> MatchOutcome {
    let mut claims = ClaimSet::new();
    let mut assignments: Vec<Option<Assignment>> = vec![None; docs.len()];

    match_exact_key(docs, rows, &mut claims, &mut assignments);
    match_best_fit(docs, rows, comparator, &mut claims, &mut assignments);

    MatchOutcome {
        assignments,
        claims,
    }
}

fn document_key(doc: &ExtractedDocument) -> Option<String> {
    doc.document_number
        .as_deref()
        .map(normalize_document_number)
        .filter(|k| !k.is_empty())
}

fn match_exact_key(
    docs: &[ExtractedDocument],
    rows: &[LedgerRow],
    claims: &mut ClaimSet,
    assignments: &mut [Option<Assignment>],
) {
    let mut order: Vec<(usize, String)> = docs
        .iter()
        .enumerate()
        .filter(|(_, d)| matches!(d.confidence, Confidence::High | Confidence::Medium))
        .filter_map(|(i, d)| document_key(d).map(|k| (i, k)))
        .collect();
    // stable: upload order survives within a confidence level
    order.sort_by_key(|(i, _)| Reverse(docs[*i].confidence));

    for (i, key) in order {
        let hit = rows.iter().position(|r| {
            !claims.is_claimed(r.row_index)
                && r.document_number
                    .as_deref()
                    .map_or(false, |n| normalize_document_number(n) == key)
        });
        if let Some(pos) = hit {
            claims.claim(rows[pos].row_index);
            assignments[i] = Some(Assignment {
                row: pos,
                pass: MatchPass::ExactKey,
            });
            tracing::debug!(
                file = %docs[i].file_name,
                row = rows[pos].row_index,
                "exact key claim"
            );
        }
    }
}

fn match_best_fit(
    docs: &[ExtractedDocument],
    rows: &[LedgerRow],
    comparator: &Comparator,
    claims: &mut ClaimSet,
    assignments: &mut [Option<Assignment>],
) {
    let ceiling = comparator.tolerances().mismatch_ceiling;
    let mut order: Vec<usize> = (0..docs.len())
        .filter(|i| assignments[*i].is_none())
        .collect();
    order.sort_by_key(|i| Reverse(docs[*i].confidence));

    for i in order {
        let doc = &docs[i];
        let mut best: Option<(usize, usize)> = None;
        for (pos, row) in rows.iter().enumerate() {
            if claims.is_claimed(row.row_index) {
                continue;
            }
            let mismatches = comparator.mismatch_count(doc, row);
            if best.map_or(true, |(_, b)| mismatches < b) {
                best = Some((pos, mismatches));
                if mismatches == 0 {
                    break;
                }
            }
        }

        match best {
            Some((pos, mismatches)) if mismatches < ceiling => {
                claims.claim(rows[pos].row_index);
                assignments[i] = Some(Assignment {
                    row: pos,
                    pass: MatchPass::BestMatch,
                });
                tracing::debug!(
                    file = %doc.file_name,
                    row = rows[pos].row_index,
                    mismatches,
                    "best-match claim"
                );
            }
            Some((pos, mismatches)) => {
                tracing::debug!(
                    file = %doc.file_name,
                    row = rows[pos].row_index,
                    mismatches,
                    ceiling,
                    "best candidate rejected"
                );
            }
            None => {}
        }
    }
}

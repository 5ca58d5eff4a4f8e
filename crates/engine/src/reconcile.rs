use chrono::NaiveDateTime;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;

use gastos_core::{
    CoreError, LedgerStore, Money, SettlementStatus, Transaction, TransactionFilter,
};

/// Flat tolerance for amounts up to [`RELATIVE_TOLERANCE_FROM`].
pub const FLAT_TOLERANCE_CLP: i64 = 1_000;
pub const RELATIVE_TOLERANCE_FROM: i64 = 100_000;

const AMOUNT_WEIGHT: f64 = 40.0;
const DATE_WEIGHT: f64 = 30.0;
const PREFERRED_NAME_BONUS: f64 = 20.0;
const NAME_OVERLAP_WEIGHT: f64 = 10.0;

const SUGGESTION_TOLERANCE_SCORE: u32 = 50;
const SUGGESTION_SIMILAR_SCORE: u32 = 25;
const SUGGESTION_SIMILAR_RATIO: f64 = 0.7;
const SUGGESTION_DAY_WINDOW: i64 = 30;

/// `|income - expected|` must not exceed 1000, or 5% of `expected` once
/// `expected` is over 100,000.
pub fn within_tolerance(income: Money, expected: Money) -> bool {
    let diff = (income.as_decimal() - expected.as_decimal()).abs();
    let tolerance = if expected.as_decimal() > Decimal::from(RELATIVE_TOLERANCE_FROM) {
        expected.as_decimal() * Decimal::new(5, 2)
    } else {
        Decimal::from(FLAT_TOLERANCE_CLP)
    };
    diff <= tolerance
}

#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
#[serde(default)]
pub struct AutoMatcher {
    pub days_window: i64,
    pub min_score: f64,
    pub suggestion_limit: usize,
}

impl Default for AutoMatcher {
    fn default() -> Self {
        Self {
            days_window: 10,
            min_score: 50.0,
            suggestion_limit: 5,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MatchSuggestion {
    pub expense: Transaction,
    pub score: u32,
    pub reasons: Vec<String>,
}

impl AutoMatcher {
    /// Best unsettled candidate scoring at least `min_score`. Equal scores
    /// resolve to the smallest id so the result does not depend on the
    /// order candidates were listed in.
    pub fn try_auto_match<'a>(
        &self,
        income: &Transaction,
        candidates: &'a [Transaction],
        preferred_name: Option<&str>,
    ) -> Option<&'a Transaction> {
        if income.monto_clp.is_zero() {
            tracing::warn!(income = %income.id, "Income has no amount, skipping auto-match");
            return None;
        }

        let best = candidates
            .iter()
            .filter(|c| !c.is_settled())
            .filter_map(|c| {
                let score = self.score_candidate(income, c, preferred_name)?;
                tracing::debug!(expense = %c.id, score, "Auto-match candidate");
                (score >= self.min_score).then_some((c, score))
            })
            .max_by(|(a, sa), (b, sb)| {
                sa.partial_cmp(sb)
                    .unwrap_or(Ordering::Equal)
                    .then_with(|| b.id.cmp(&a.id))
            });

        match best {
            Some((expense, score)) => {
                tracing::info!(income = %income.id, expense = %expense.id, score, "Auto-match found");
                Some(expense)
            }
            None => {
                tracing::info!(income = %income.id, "No suitable auto-match");
                None
            }
        }
    }

    /// `None` when the candidate is outside the amount tolerance.
    fn score_candidate(
        &self,
        income: &Transaction,
        candidate: &Transaction,
        preferred_name: Option<&str>,
    ) -> Option<f64> {
        if !within_tolerance(income.monto_clp, candidate.monto_tercero) {
            return None;
        }
        let mut score = 0.0;

        let expected = candidate.monto_tercero.to_f64();
        if expected > 0.0 {
            let diff = (income.monto_clp.to_f64() - expected).abs();
            score += (1.0 - diff / expected).max(0.0) * AMOUNT_WEIGHT;
        }

        let days = days_apart(income.fecha, candidate.fecha);
        if self.days_window > 0 && days <= self.days_window {
            score += (1.0 - days as f64 / self.days_window as f64).max(0.0) * DATE_WEIGHT;
        }

        let counterpart = candidate.compartido_con.trim().to_lowercase();
        if let Some(preferred) = preferred_name {
            let preferred = preferred.trim().to_lowercase();
            if !preferred.is_empty()
                && !counterpart.is_empty()
                && (counterpart.contains(&preferred) || preferred.contains(&counterpart))
            {
                score += PREFERRED_NAME_BONUS;
            }
        }

        score += name_overlap(&income.contraparte.to_lowercase(), &counterpart) * NAME_OVERLAP_WEIGHT;
        Some(score)
    }

    /// Ranked, unsettled shared expenses with a positive score.
    pub fn suggest_manual_matches(
        &self,
        income: &Transaction,
        expenses: &[Transaction],
    ) -> Vec<MatchSuggestion> {
        let mut suggestions: Vec<MatchSuggestion> = expenses
            .iter()
            .filter(|e| e.is_shared() && !e.is_settled() && !e.tipo.is_income() && !e.tipo.is_template())
            .filter_map(|e| suggestion_for(income, e))
            .collect();

        suggestions.sort_by(|a, b| {
            b.score
                .cmp(&a.score)
                .then_with(|| a.expense.id.cmp(&b.expense.id))
        });
        suggestions.truncate(self.suggestion_limit);
        suggestions
    }
}

fn suggestion_for(income: &Transaction, expense: &Transaction) -> Option<MatchSuggestion> {
    let mut score = 0;
    let mut reasons = Vec::new();

    let expected = expense.monto_tercero;
    if expected.as_decimal() > Decimal::ZERO {
        if within_tolerance(income.monto_clp, expected) {
            score += SUGGESTION_TOLERANCE_SCORE;
            reasons.push("Amount matches".to_string());
        } else {
            let (a, b) = (income.monto_clp.to_f64(), expected.to_f64());
            let ratio = a.min(b) / a.max(b);
            if ratio > SUGGESTION_SIMILAR_RATIO {
                score += SUGGESTION_SIMILAR_SCORE;
                reasons.push("Similar amount".to_string());
            }
        }
    }

    let days = days_apart(income.fecha, expense.fecha);
    if days <= SUGGESTION_DAY_WINDOW {
        score += (SUGGESTION_DAY_WINDOW - days) as u32;
        reasons.push(format!("{days} days apart"));
    }

    (score > 0).then(|| MatchSuggestion {
        expense: expense.clone(),
        score,
        reasons,
    })
}

/// Pairs of words longer than two characters where one contains the other,
/// over the larger word count, capped at 1.
fn name_overlap(a: &str, b: &str) -> f64 {
    let a_words: Vec<&str> = a.split_whitespace().collect();
    let b_words: Vec<&str> = b.split_whitespace().collect();
    if a_words.is_empty() || b_words.is_empty() {
        return 0.0;
    }
    let hits = a_words
        .iter()
        .filter(|w| w.chars().count() > 2)
        .flat_map(|w1| {
            b_words
                .iter()
                .filter(move |w2| w2.chars().count() > 2 && (w1.contains(**w2) || w2.contains(*w1)))
        })
        .count();
    (hits as f64 / a_words.len().max(b_words.len()) as f64).min(1.0)
}

/// Whole days between the two dates, floored before taking the magnitude:
/// an expense a few hours after the income counts as one day apart, one a
/// few hours before it as zero.
fn days_apart(income: NaiveDateTime, expense: NaiveDateTime) -> i64 {
    (income - expense).num_seconds().div_euclid(86_400).abs()
}

pub fn try_auto_match<'a>(
    income: &Transaction,
    candidates: &'a [Transaction],
    preferred_name: Option<&str>,
    days_window: i64,
) -> Option<&'a Transaction> {
    AutoMatcher {
        days_window,
        ..AutoMatcher::default()
    }
    .try_auto_match(income, candidates, preferred_name)
}

pub fn suggest_manual_matches(
    income: &Transaction,
    expenses: &[Transaction],
    limit: usize,
) -> Vec<MatchSuggestion> {
    AutoMatcher {
        suggestion_limit: limit,
        ..AutoMatcher::default()
    }
    .suggest_manual_matches(income, expenses)
}

// ── Settlement ────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Settlement {
    pub expense: Transaction,
    pub income: Transaction,
}

/// Links an expense and the income that paid it off. Both rows are looked
/// up before anything is written. The two upserts are not atomic: if the
/// second one fails the expense is already marked and the caller gets a
/// single error to retry on.
pub async fn mark_as_settled<S: LedgerStore + ?Sized>(
    store: &S,
    expense_id: &str,
    income_id: &str,
    now: NaiveDateTime,
) -> Result<Settlement, CoreError> {
    let mut expense = store.require(expense_id).await?;
    let mut income = store.require(income_id).await?;

    if !income.tipo.is_income() {
        return Err(CoreError::validation(
            "income_id",
            format!("{income_id} is a {}, not an income", income.tipo),
        ));
    }
    if let Some(other) = expense.settled_with.as_deref() {
        if expense.is_settled() && other != income_id {
            return Err(CoreError::validation(
                "expense_id",
                format!("{expense_id} is already settled with {other}"),
            ));
        }
    }

    expense.settlement_status = SettlementStatus::Settled;
    expense.settled_with = Some(income.id.clone());
    expense.settled_date = Some(now);
    let expense = store.upsert(expense).await?;

    income.settlement_status = SettlementStatus::Matched;
    income.matched_expense = Some(expense.id.clone());
    let income = store.upsert(income).await.map_err(|e| {
        tracing::error!(expense = %expense_id, income = %income_id, "Settlement half-applied: {e}");
        CoreError::Storage(format!(
            "expense {expense_id} settled but income {income_id} not linked: {e}"
        ))
    })?;

    tracing::info!(expense = %expense.id, income = %income.id, "Marked expense as settled");
    Ok(Settlement { expense, income })
}

// ── Statistics ────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ReconciliationStats {
    pub total_shared_expenses: usize,
    pub pending_settlement: usize,
    pub settled_expenses: usize,
    pub pending_amount: Money,
    pub settled_amount: Money,
    pub total_incomes: usize,
    pub matched_incomes: usize,
    pub unmatched_incomes: usize,
    pub unmatched_amount: Money,
}

pub fn reconciliation_stats_for(transactions: &[Transaction]) -> ReconciliationStats {
    let mut stats = ReconciliationStats::default();
    for tx in transactions {
        if tx.tipo.is_income() {
            stats.total_incomes += 1;
            match tx.settlement_status {
                SettlementStatus::Matched => stats.matched_incomes += 1,
                SettlementStatus::Open => {
                    stats.unmatched_incomes += 1;
                    stats.unmatched_amount = stats.unmatched_amount + tx.monto_clp;
                }
                _ => {}
            }
        } else if tx.is_shared() && !tx.tipo.is_template() {
            stats.total_shared_expenses += 1;
            match tx.settlement_status {
                SettlementStatus::Open | SettlementStatus::Pending => {
                    stats.pending_settlement += 1;
                    stats.pending_amount = stats.pending_amount + tx.monto_tercero;
                }
                SettlementStatus::Settled => {
                    stats.settled_expenses += 1;
                    stats.settled_amount = stats.settled_amount + tx.monto_tercero;
                }
                SettlementStatus::Matched => {}
            }
        }
    }
    stats
}

pub async fn reconciliation_stats<S: LedgerStore + ?Sized>(
    store: &S,
) -> Result<ReconciliationStats, CoreError> {
    let all = store.list(&TransactionFilter::All).await?;
    Ok(reconciliation_stats_for(&all))
}

use async_trait::async_trait;

use super::error::CoreError;
use super::transaction::{Estado, Transaction, TransactionKind};

/// Row selections the engine needs from a ledger.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransactionFilter {
    All,
    /// Not yet categorized with sufficient confidence.
    Pendientes,
    /// Shared expenses whose third-party share is still owed.
    Receivables,
    Incomes,
    Kind(TransactionKind),
    Children(String),
}

impl TransactionFilter {
    pub fn matches(&self, tx: &Transaction) -> bool {
        match self {
            TransactionFilter::All => true,
            TransactionFilter::Pendientes => tx.estado == Estado::Pendiente,
            TransactionFilter::Receivables => tx.is_receivable(),
            TransactionFilter::Incomes => tx.tipo.is_income(),
            TransactionFilter::Kind(kind) => tx.tipo == *kind,
            TransactionFilter::Children(parent) => tx.parent_id.as_deref() == Some(parent.as_str()),
        }
    }
}

/// Persistence boundary for transactions. Implementations must run
/// [`Transaction::normalized`] on every upsert and return the stored row.
#[async_trait]
pub trait LedgerStore: Send + Sync {
    async fn get(&self, id: &str) -> Result<Option<Transaction>, CoreError>;

    async fn upsert(&self, tx: Transaction) -> Result<Transaction, CoreError>;

    /// Rows in insertion order.
    async fn list(&self, filter: &TransactionFilter) -> Result<Vec<Transaction>, CoreError>;

    /// Returns `false` when no row had that id.
    async fn delete(&self, id: &str) -> Result<bool, CoreError>;

    async fn require(&self, id: &str) -> Result<Transaction, CoreError> {
        self.get(id)
            .await?
            .ok_or_else(|| CoreError::NotFound(id.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::money::Money;
    use crate::transaction::SettlementStatus;
    use rust_decimal::Decimal;

    fn shared(pct: i64, status: SettlementStatus) -> Transaction {
        let mut tx = Transaction::new(
            TransactionKind::Expense,
            "x",
            Money::from_clp(1000),
            Default::default(),
        );
        tx.porcentaje_compartido = Decimal::from(pct);
        tx.settlement_status = status;
        tx
    }

    #[test]
    fn receivables_filter_requires_shared_and_open() {
        let f = TransactionFilter::Receivables;
        assert!(f.matches(&shared(50, SettlementStatus::Pending)));
        assert!(f.matches(&shared(50, SettlementStatus::Open)));
        assert!(!f.matches(&shared(50, SettlementStatus::Settled)));
        assert!(!f.matches(&shared(0, SettlementStatus::Open)));
    }

    #[test]
    fn receivables_filter_skips_templates() {
        let mut tx = shared(50, SettlementStatus::Pending);
        tx.tipo = TransactionKind::RecurringTemplate;
        assert!(!TransactionFilter::Receivables.matches(&tx));
    }

    #[test]
    fn children_filter_matches_parent_id() {
        let mut tx = shared(0, SettlementStatus::Open);
        tx.parent_id = Some("p1".to_string());
        assert!(TransactionFilter::Children("p1".to_string()).matches(&tx));
        assert!(!TransactionFilter::Children("p2".to_string()).matches(&tx));
    }
}

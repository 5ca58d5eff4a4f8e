use async_trait::async_trait;
use gastos_core::{CoreError, LedgerStore, Transaction, TransactionFilter};
use tokio::sync::RwLock;

/// Ledger kept in process memory. Used by tests and when no database path
/// is configured.
#[derive(Debug, Default)]
pub struct MemoryLedger {
    rows: RwLock<Vec<Transaction>>,
}

impl MemoryLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.rows.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.rows.read().await.is_empty()
    }
}

#[async_trait]
impl LedgerStore for MemoryLedger {
    async fn get(&self, id: &str) -> Result<Option<Transaction>, CoreError> {
        Ok(self.rows.read().await.iter().find(|t| t.id == id).cloned())
    }

    async fn upsert(&self, tx: Transaction) -> Result<Transaction, CoreError> {
        let tx = tx.normalized()?;
        let mut rows = self.rows.write().await;
        match rows.iter_mut().find(|t| t.id == tx.id) {
            Some(existing) => *existing = tx.clone(),
            None => rows.push(tx.clone()),
        }
        Ok(tx)
    }

    async fn list(&self, filter: &TransactionFilter) -> Result<Vec<Transaction>, CoreError> {
        Ok(self
            .rows
            .read()
            .await
            .iter()
            .filter(|t| filter.matches(t))
            .cloned()
            .collect())
    }

    async fn delete(&self, id: &str) -> Result<bool, CoreError> {
        let mut rows = self.rows.write().await;
        let before = rows.len();
        rows.retain(|t| t.id != id);
        Ok(rows.len() != before)
    }
}

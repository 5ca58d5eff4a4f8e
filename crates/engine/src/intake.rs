//! End-to-end handling of incoming expenses and incomes, and the operator
//! follow-ups that complete them. Everything here works against any
//! [`LedgerStore`], so the HTTP layer and the chat bot share one code path.

use chrono::NaiveDateTime;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use gastos_core::{
    CoreError, Estado, Frequency, LedgerStore, Money, SettlementStatus, Transaction,
    TransactionFilter, TransactionKind,
};

use crate::categorizer::{Categorization, Categorizer};
use crate::reconcile::{mark_as_settled, AutoMatcher, MatchSuggestion};

/// Auto-categorized expenses below this confidence are sent to the operator
/// for confirmation before the sharing prompt.
pub const CONFIRMATION_THRESHOLD: f64 = 0.8;

pub const INCOME_CATEGORY: &str = "ingreso";

#[derive(Debug, Clone, Default, Deserialize)]
pub struct NewExpense {
    pub descripcion: String,
    pub monto_clp: Money,
    #[serde(default)]
    pub fecha: Option<NaiveDateTime>,
    #[serde(default)]
    pub moneda: Option<String>,
    #[serde(default)]
    pub medio: Option<String>,
    #[serde(default)]
    pub mcc: Option<String>,
    #[serde(default)]
    pub fuente: Option<String>,
    #[serde(default)]
    pub tipo: Option<TransactionKind>,
    /// Operator-supplied category; skips automatic categorization.
    #[serde(default)]
    pub categoria: Option<String>,
    #[serde(default)]
    pub subcategoria: Option<String>,
}

/// What the operator still has to decide about a freshly stored expense.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum FollowUp {
    Categorize { hint: String },
    Confirm { confidence: f64 },
    Share,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ExpenseOutcome {
    pub transaction: Transaction,
    pub categorization: Categorization,
    pub follow_up: FollowUp,
}

impl ExpenseOutcome {
    pub fn auto_categorized(&self) -> bool {
        self.transaction.estado == Estado::Categorizado
    }
}

pub async fn ingest_expense<S: LedgerStore + ?Sized>(
    store: &S,
    categorizer: &Categorizer,
    new: NewExpense,
    now: NaiveDateTime,
) -> Result<ExpenseOutcome, CoreError> {
    if new.descripcion.trim().is_empty() {
        return Err(CoreError::validation("descripcion", "must not be empty"));
    }

    let categorization = match new.categoria.as_deref().map(str::trim) {
        Some(categoria) if !categoria.is_empty() => {
            Categorization::manual(categoria, new.subcategoria.as_deref().unwrap_or(""))
        }
        _ => categorizer.categorize_one(&new.descripcion),
    };

    let mut tx = Transaction::new(
        new.tipo.unwrap_or(TransactionKind::Expense),
        &new.descripcion,
        new.monto_clp,
        new.fecha.unwrap_or(now),
    );
    if let Some(moneda) = new.moneda.filter(|m| !m.trim().is_empty()) {
        tx.moneda = moneda;
    }
    tx.medio = new.medio.unwrap_or_else(|| "TC".to_string());
    tx.mcc = new.mcc.unwrap_or_default();
    tx.fuente = new.fuente.unwrap_or_else(|| "macrodroid".to_string());
    categorization.apply_to(&mut tx);

    let transaction = store.upsert(tx).await?;

    let follow_up = if transaction.estado == Estado::Pendiente {
        FollowUp::Categorize {
            hint: categorization.categoria.clone(),
        }
    } else if categorization.confidence < CONFIRMATION_THRESHOLD {
        FollowUp::Confirm {
            confidence: categorization.confidence,
        }
    } else {
        FollowUp::Share
    };

    tracing::info!(
        id = %transaction.id,
        categoria = %transaction.categoria,
        confidence = transaction.ml_confidence,
        "Expense stored"
    );
    Ok(ExpenseOutcome {
        transaction,
        categorization,
        follow_up,
    })
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct NewIncome {
    pub descripcion: String,
    pub monto_clp: Money,
    #[serde(default)]
    pub fecha: Option<NaiveDateTime>,
    /// Who paid. Enables automatic matching against receivables.
    #[serde(default)]
    pub contraparte: Option<String>,
    #[serde(default)]
    pub medio: Option<String>,
    #[serde(default)]
    pub fuente: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct IncomeOutcome {
    pub income: Transaction,
    pub matched_expense: Option<Transaction>,
    pub suggestions: Vec<MatchSuggestion>,
}

impl IncomeOutcome {
    pub fn auto_matched(&self) -> bool {
        self.matched_expense.is_some()
    }
}

/// Stores the income and, when a counterpart is known, settles the best
/// receivable or returns manual suggestions.
pub async fn ingest_income<S: LedgerStore + ?Sized>(
    store: &S,
    matcher: &AutoMatcher,
    new: NewIncome,
    now: NaiveDateTime,
) -> Result<IncomeOutcome, CoreError> {
    if new.monto_clp.is_zero() {
        return Err(CoreError::validation("monto_clp", "income must be greater than 0"));
    }

    let mut tx = Transaction::new(
        TransactionKind::TransferIn,
        &new.descripcion,
        new.monto_clp,
        new.fecha.unwrap_or(now),
    );
    tx.categoria = INCOME_CATEGORY.to_string();
    tx.estado = Estado::Procesado;
    tx.ml_confidence = 1.0;
    tx.medio = new.medio.unwrap_or_else(|| "transferencia".to_string());
    tx.fuente = new.fuente.unwrap_or_else(|| "manual".to_string());
    let contraparte = new
        .contraparte
        .map(|c| c.trim().to_string())
        .filter(|c| !c.is_empty());
    tx.contraparte = contraparte.clone().unwrap_or_default();

    let income = store.upsert(tx).await?;
    tracing::info!(id = %income.id, monto = %income.monto_clp, "Income stored");

    let Some(contraparte) = contraparte else {
        return Ok(IncomeOutcome {
            income,
            matched_expense: None,
            suggestions: Vec::new(),
        });
    };

    let receivables = store.list(&TransactionFilter::Receivables).await?;
    let matched_id = matcher
        .try_auto_match(&income, &receivables, Some(&contraparte))
        .map(|e| e.id.clone());

    match matched_id {
        Some(expense_id) => {
            let settlement = mark_as_settled(store, &expense_id, &income.id, now).await?;
            Ok(IncomeOutcome {
                income: settlement.income,
                matched_expense: Some(settlement.expense),
                suggestions: Vec::new(),
            })
        }
        None => {
            let suggestions = matcher.suggest_manual_matches(&income, &receivables);
            Ok(IncomeOutcome {
                income,
                matched_expense: None,
                suggestions,
            })
        }
    }
}

/// Manual category override. Always final.
pub async fn update_category<S: LedgerStore + ?Sized>(
    store: &S,
    id: &str,
    categoria: &str,
    subcategoria: &str,
) -> Result<Transaction, CoreError> {
    if categoria.trim().is_empty() {
        return Err(CoreError::validation("categoria", "must not be empty"));
    }
    let mut tx = store.require(id).await?;
    Categorization::manual(categoria, subcategoria).apply_to(&mut tx);
    store.upsert(tx).await
}

/// Operator picked a category from the prompt. The subcategory comes from
/// automatic categorization when it agrees on the category.
pub async fn select_category<S: LedgerStore + ?Sized>(
    store: &S,
    categorizer: &Categorizer,
    id: &str,
    categoria: &str,
) -> Result<Transaction, CoreError> {
    let tx = store.require(id).await?;
    let auto = categorizer.categorize_one(&tx.descripcion);
    let subcategoria = if auto.categoria == categoria.trim() {
        auto.subcategoria
    } else {
        String::new()
    };
    update_category(store, id, categoria, &subcategoria).await
}

/// Sets or clears the third-party share. `porcentaje` of zero makes the
/// expense unshared again.
pub async fn update_sharing<S: LedgerStore + ?Sized>(
    store: &S,
    id: &str,
    compartido_con: &str,
    porcentaje: Decimal,
) -> Result<Transaction, CoreError> {
    if porcentaje < Decimal::ZERO || porcentaje > Decimal::ONE_HUNDRED {
        return Err(CoreError::validation(
            "porcentaje_compartido",
            format!("must be between 0 and 100, got {porcentaje}"),
        ));
    }
    let mut tx = store.require(id).await?;
    if tx.tipo.is_income() {
        return Err(CoreError::validation("gasto_id", "incomes cannot be shared"));
    }
    if tx.is_settled() {
        return Err(CoreError::validation("gasto_id", "expense is already settled"));
    }

    if porcentaje > Decimal::ZERO {
        tx.compartido_con = compartido_con.trim().to_string();
        tx.settlement_status = SettlementStatus::Pending;
    } else {
        tx.compartido_con.clear();
        tx.settlement_status = SettlementStatus::Open;
    }
    tx.porcentaje_compartido = porcentaje;
    store.upsert(tx).await
}

/// Operator rejected an automatic category.
pub async fn revert_to_pending<S: LedgerStore + ?Sized>(
    store: &S,
    id: &str,
) -> Result<Transaction, CoreError> {
    let mut tx = store.require(id).await?;
    tx.estado = Estado::Pendiente;
    store.upsert(tx).await
}

pub async fn list_pendientes<S: LedgerStore + ?Sized>(
    store: &S,
) -> Result<Vec<Transaction>, CoreError> {
    store.list(&TransactionFilter::Pendientes).await
}

/// Receivables and the total still owed on them.
pub async fn list_receivables<S: LedgerStore + ?Sized>(
    store: &S,
) -> Result<(Vec<Transaction>, Money), CoreError> {
    let receivables = store.list(&TransactionFilter::Receivables).await?;
    let total = receivables.iter().map(|r| r.monto_tercero).sum();
    Ok((receivables, total))
}

pub async fn delete_transaction<S: LedgerStore + ?Sized>(
    store: &S,
    id: &str,
) -> Result<(), CoreError> {
    if store.delete(id).await? {
        tracing::info!(id, "Transaction deleted");
        Ok(())
    } else {
        Err(CoreError::NotFound(id.to_string()))
    }
}

// ── Templates ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Deserialize)]
pub struct NewRecurring {
    pub descripcion: String,
    pub monto_clp: Money,
    pub frecuencia: Frequency,
    /// First due date; the generator materializes it once it has passed.
    pub primera_fecha: NaiveDateTime,
    #[serde(default)]
    pub categoria: String,
    #[serde(default)]
    pub subcategoria: String,
    #[serde(default)]
    pub medio: Option<String>,
    #[serde(default)]
    pub compartido_con: String,
    #[serde(default)]
    pub porcentaje_compartido: Decimal,
}

pub async fn create_recurring_template<S: LedgerStore + ?Sized>(
    store: &S,
    new: NewRecurring,
) -> Result<Transaction, CoreError> {
    let mut tx = Transaction::new(
        TransactionKind::RecurringTemplate,
        &new.descripcion,
        new.monto_clp,
        new.primera_fecha,
    );
    apply_template_category(&mut tx, &new.categoria, &new.subcategoria);
    tx.medio = new.medio.unwrap_or_else(|| "TC".to_string());
    tx.fuente = "recurring".to_string();
    tx.compartido_con = new.compartido_con;
    tx.porcentaje_compartido = new.porcentaje_compartido;
    tx.frecuencia = Some(new.frecuencia);
    tx.proxima_fecha = Some(new.primera_fecha);
    store.upsert(tx).await
}

#[derive(Debug, Clone, Deserialize)]
pub struct NewInstallmentPurchase {
    pub descripcion: String,
    /// Full purchase amount, split evenly across `cuotas`.
    pub monto_clp: Money,
    pub cuotas: u32,
    pub fecha: NaiveDateTime,
    /// Due date of the first installment; later ones follow monthly.
    pub primera_cuota: NaiveDateTime,
    #[serde(default)]
    pub categoria: String,
    #[serde(default)]
    pub subcategoria: String,
    #[serde(default)]
    pub medio: Option<String>,
}

pub async fn create_installment_purchase<S: LedgerStore + ?Sized>(
    store: &S,
    new: NewInstallmentPurchase,
) -> Result<Transaction, CoreError> {
    if new.cuotas == 0 {
        return Err(CoreError::validation("cuotas", "must be at least 1"));
    }
    let mut tx = Transaction::new(
        TransactionKind::InstallmentPurchase,
        &new.descripcion,
        new.monto_clp,
        new.fecha,
    );
    apply_template_category(&mut tx, &new.categoria, &new.subcategoria);
    tx.medio = new.medio.unwrap_or_else(|| "TC".to_string());
    tx.fuente = "installments".to_string();
    tx.frecuencia = Some(Frequency::Monthly);
    tx.proxima_fecha = Some(new.primera_cuota);
    tx.cuotas_total = new.cuotas;
    store.upsert(tx).await
}

fn apply_template_category(tx: &mut Transaction, categoria: &str, subcategoria: &str) {
    if categoria.trim().is_empty() {
        return;
    }
    Categorization::manual(categoria, subcategoria).apply_to(tx);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::merchants::{MerchantCategory, MerchantMap};
    use crate::rules::KeywordRuleSet;
    use chrono::NaiveDate;
    use gastos_storage::MemoryLedger;

    fn at(y: i32, m: u32, d: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(y, m, d)
            .unwrap()
            .and_hms_opt(9, 30, 0)
            .unwrap()
    }

    fn categorizer(threshold: f64) -> Categorizer {
        let mut merchants = MerchantMap::new();
        merchants.insert(
            "jumbo",
            MerchantCategory {
                categoria: "supermercado".into(),
                subcategoria: "grandes".into(),
            },
        );
        Categorizer::new(merchants, KeywordRuleSet::defaults(), threshold)
    }

    fn expense(desc: &str, amount: i64) -> NewExpense {
        NewExpense {
            descripcion: desc.to_string(),
            monto_clp: Money::from_clp(amount),
            fecha: Some(at(2024, 5, 3)),
            ..NewExpense::default()
        }
    }

    #[tokio::test]
    async fn unknown_expense_asks_for_category() {
        let store = MemoryLedger::new();
        let out = ingest_expense(&store, &categorizer(0.8), expense("Ferreteria", 5_000), at(2024, 5, 3))
            .await
            .unwrap();
        assert_eq!(out.follow_up, FollowUp::Categorize { hint: String::new() });
        assert_eq!(out.transaction.estado, Estado::Pendiente);
        assert_eq!(out.transaction.fuente, "macrodroid");
        assert_eq!(list_pendientes(&store).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn confident_expense_goes_to_sharing() {
        let store = MemoryLedger::new();
        let out = ingest_expense(&store, &categorizer(0.8), expense("JUMBO", 30_000), at(2024, 5, 3))
            .await
            .unwrap();
        assert_eq!(out.follow_up, FollowUp::Share);
        assert_eq!(out.transaction.categoria, "supermercado");
        assert!(out.auto_categorized());
    }

    #[tokio::test]
    async fn low_threshold_rule_match_needs_confirmation() {
        let store = MemoryLedger::new();
        let mut c = categorizer(0.5);
        c = c.with_classifier(Box::new(crate::classifier::MockClassifier::new("salud", 0.6)));
        let out = ingest_expense(&store, &c, expense("Cruz Verde", 8_000), at(2024, 5, 3))
            .await
            .unwrap();
        assert_eq!(out.follow_up, FollowUp::Confirm { confidence: 0.6 });
        assert_eq!(out.transaction.estado, Estado::Categorizado);
    }

    #[tokio::test]
    async fn manual_category_short_circuits() {
        let store = MemoryLedger::new();
        let mut new = expense("JUMBO", 30_000);
        new.categoria = Some("hogar".into());
        let out = ingest_expense(&store, &categorizer(0.8), new, at(2024, 5, 3))
            .await
            .unwrap();
        assert_eq!(out.transaction.categoria, "hogar");
        assert_eq!(out.transaction.ml_confidence, 1.0);
        assert_eq!(out.follow_up, FollowUp::Share);
    }

    #[tokio::test]
    async fn blank_description_is_rejected() {
        let store = MemoryLedger::new();
        let err = ingest_expense(&store, &categorizer(0.8), expense("  ", 1_000), at(2024, 5, 3))
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::Validation { field: "descripcion", .. }));
    }

    #[tokio::test]
    async fn sharing_then_income_settles_receivable() {
        let store = MemoryLedger::new();
        let out = ingest_expense(&store, &categorizer(0.8), expense("Cena sushi", 40_000), at(2024, 5, 3))
            .await
            .unwrap();
        let shared = update_sharing(&store, &out.transaction.id, "Ana", Decimal::from(50))
            .await
            .unwrap();
        assert_eq!(shared.monto_tercero, Money::from_clp(20_000));
        assert_eq!(shared.settlement_status, SettlementStatus::Pending);

        let (receivables, total) = list_receivables(&store).await.unwrap();
        assert_eq!(receivables.len(), 1);
        assert_eq!(total, Money::from_clp(20_000));

        let income = NewIncome {
            descripcion: "Reembolso cena".into(),
            monto_clp: Money::from_clp(20_000),
            fecha: Some(at(2024, 5, 4)),
            contraparte: Some("Ana".into()),
            ..NewIncome::default()
        };
        let result = ingest_income(&store, &AutoMatcher::default(), income, at(2024, 5, 4))
            .await
            .unwrap();
        assert!(result.auto_matched());
        assert_eq!(result.income.settlement_status, SettlementStatus::Matched);
        assert_eq!(result.income.categoria, INCOME_CATEGORY);
        assert!(list_receivables(&store).await.unwrap().0.is_empty());
    }

    #[tokio::test]
    async fn unmatched_income_returns_suggestions() {
        let store = MemoryLedger::new();
        let out = ingest_expense(&store, &categorizer(0.8), expense("Cena", 40_000), at(2024, 5, 3))
            .await
            .unwrap();
        update_sharing(&store, &out.transaction.id, "Ana", Decimal::from(50))
            .await
            .unwrap();

        let income = NewIncome {
            descripcion: "Transferencia".into(),
            monto_clp: Money::from_clp(16_000),
            fecha: Some(at(2024, 5, 4)),
            contraparte: Some("Pedro".into()),
            ..NewIncome::default()
        };
        let result = ingest_income(&store, &AutoMatcher::default(), income, at(2024, 5, 4))
            .await
            .unwrap();
        assert!(!result.auto_matched());
        assert_eq!(result.suggestions.len(), 1);
        assert_eq!(result.suggestions[0].score, 25 + 29);
    }

    #[tokio::test]
    async fn income_without_counterpart_is_only_stored() {
        let store = MemoryLedger::new();
        let income = NewIncome {
            descripcion: "Sueldo".into(),
            monto_clp: Money::from_clp(1_500_000),
            ..NewIncome::default()
        };
        let result = ingest_income(&store, &AutoMatcher::default(), income, at(2024, 5, 25))
            .await
            .unwrap();
        assert!(!result.auto_matched());
        assert!(result.suggestions.is_empty());
        assert_eq!(result.income.fecha, at(2024, 5, 25));
        assert_eq!(result.income.estado, Estado::Procesado);
    }

    #[tokio::test]
    async fn unsharing_clears_counterpart() {
        let store = MemoryLedger::new();
        let out = ingest_expense(&store, &categorizer(0.8), expense("Cena", 40_000), at(2024, 5, 3))
            .await
            .unwrap();
        let id = out.transaction.id;
        update_sharing(&store, &id, "Ana", Decimal::from(30)).await.unwrap();
        let tx = update_sharing(&store, &id, "", Decimal::ZERO).await.unwrap();
        assert_eq!(tx.compartido_con, "");
        assert_eq!(tx.monto_tu_parte, Money::from_clp(40_000));
        assert_eq!(tx.settlement_status, SettlementStatus::Open);
    }

    #[tokio::test]
    async fn sharing_rejects_bad_percentage_and_missing_id() {
        let store = MemoryLedger::new();
        assert!(matches!(
            update_sharing(&store, "x", "Ana", Decimal::from(150)).await,
            Err(CoreError::Validation { .. })
        ));
        assert_eq!(
            update_sharing(&store, "x", "Ana", Decimal::from(50)).await,
            Err(CoreError::NotFound("x".into()))
        );
    }

    #[tokio::test]
    async fn select_category_keeps_matching_subcategory() {
        let store = MemoryLedger::new();
        let c = categorizer(0.8);
        let out = ingest_expense(&store, &c, expense("Uber trip", 6_000), at(2024, 5, 3))
            .await
            .unwrap();
        let tx = select_category(&store, &c, &out.transaction.id, "transporte").await.unwrap();
        assert_eq!(tx.subcategoria, "transporte_publico");
        let tx = select_category(&store, &c, &out.transaction.id, "viajes").await.unwrap();
        assert_eq!(tx.subcategoria, "");
        assert_eq!(tx.estado, Estado::Categorizado);
    }

    #[tokio::test]
    async fn revert_and_delete() {
        let store = MemoryLedger::new();
        let out = ingest_expense(&store, &categorizer(0.8), expense("JUMBO", 30_000), at(2024, 5, 3))
            .await
            .unwrap();
        let id = out.transaction.id;
        let tx = revert_to_pending(&store, &id).await.unwrap();
        assert_eq!(tx.estado, Estado::Pendiente);

        delete_transaction(&store, &id).await.unwrap();
        assert_eq!(
            delete_transaction(&store, &id).await,
            Err(CoreError::NotFound(id.clone()))
        );
    }

    #[tokio::test]
    async fn templates_are_not_receivables() {
        let store = MemoryLedger::new();
        let template = create_recurring_template(
            &store,
            NewRecurring {
                descripcion: "Arriendo".into(),
                monto_clp: Money::from_clp(400_000),
                frecuencia: Frequency::Monthly,
                primera_fecha: at(2024, 6, 1),
                categoria: "hogar".into(),
                subcategoria: "arriendo".into(),
                medio: None,
                compartido_con: "Ana".into(),
                porcentaje_compartido: Decimal::from(50),
            },
        )
        .await
        .unwrap();
        assert_eq!(template.tipo, TransactionKind::RecurringTemplate);
        assert_eq!(template.estado, Estado::Categorizado);
        assert!(list_receivables(&store).await.unwrap().0.is_empty());

        let purchase = create_installment_purchase(
            &store,
            NewInstallmentPurchase {
                descripcion: "Notebook".into(),
                monto_clp: Money::from_clp(900_000),
                cuotas: 0,
                fecha: at(2024, 5, 3),
                primera_cuota: at(2024, 6, 5),
                categoria: String::new(),
                subcategoria: String::new(),
                medio: None,
            },
        )
        .await;
        assert!(purchase.is_err());
    }
}

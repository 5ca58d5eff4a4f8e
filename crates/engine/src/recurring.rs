use chrono::NaiveDateTime;
use serde::Serialize;
use std::collections::HashSet;

use gastos_core::{
    CoreError, Frequency, LedgerStore, Transaction, TransactionFilter, TransactionKind,
};

/// Upper bound on periods materialized for one template in a single run,
/// so a template with a far-past due date cannot loop unbounded.
pub const MAX_CATCH_UP: usize = 120;

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct GenerationReport {
    pub templates_checked: usize,
    pub created: Vec<String>,
    pub already_present: usize,
}

impl GenerationReport {
    pub fn created_count(&self) -> usize {
        self.created.len()
    }
}

/// Materializes every due recurring expense and installment payment.
///
/// Each child is keyed by `(parent_id, periodo)` and gets the id
/// `<parent_id>:<periodo>`, so repeated or overlapping runs never create a
/// second record for the same period.
pub async fn generate_due<S: LedgerStore + ?Sized>(
    store: &S,
    now: NaiveDateTime,
) -> Result<GenerationReport, CoreError> {
    let mut report = GenerationReport::default();

    for template in store
        .list(&TransactionFilter::Kind(TransactionKind::RecurringTemplate))
        .await?
    {
        report.templates_checked += 1;
        generate_recurring(store, template, now, &mut report).await?;
    }

    for purchase in store
        .list(&TransactionFilter::Kind(TransactionKind::InstallmentPurchase))
        .await?
    {
        report.templates_checked += 1;
        generate_installments(store, purchase, now, &mut report).await?;
    }

    if report.created.is_empty() {
        tracing::debug!(checked = report.templates_checked, "Nothing due");
    } else {
        tracing::info!(
            created = report.created.len(),
            checked = report.templates_checked,
            "Generated due transactions"
        );
    }
    Ok(report)
}

/// Occurrences are counted from the template's `fecha` (its first due date)
/// rather than from the previous due date, so a day-31 template returns to
/// the 31st after a short month.
async fn generate_recurring<S: LedgerStore + ?Sized>(
    store: &S,
    mut template: Transaction,
    now: NaiveDateTime,
    report: &mut GenerationReport,
) -> Result<(), CoreError> {
    let (Some(frequency), Some(next_due)) = (template.frecuencia, template.proxima_fecha) else {
        return Ok(());
    };
    if next_due > now {
        return Ok(());
    }

    let anchor = template.fecha.min(next_due);
    let Some((mut n, mut due)) = first_occurrence_from(frequency, anchor, next_due) else {
        return Ok(());
    };

    let mut existing = existing_periods(store, &template.id).await?;
    for _ in 0..MAX_CATCH_UP {
        if due > now {
            break;
        }
        let periodo = frequency.period_key(due);
        if existing.insert(periodo.clone()) {
            let child = spawn_child(&template, TransactionKind::Expense, due, &periodo);
            let child = store.upsert(child).await?;
            report.created.push(child.id);
        } else {
            report.already_present += 1;
        }
        n += 1;
        match frequency.nth(anchor, n) {
            Some(next) => due = next,
            None => break,
        }
    }

    template.proxima_fecha = Some(due);
    store.upsert(template).await?;
    Ok(())
}

/// Index and date of the first occurrence on or after `from`.
fn first_occurrence_from(
    frequency: Frequency,
    anchor: NaiveDateTime,
    from: NaiveDateTime,
) -> Option<(u32, NaiveDateTime)> {
    let mut n = 0;
    let mut due = anchor;
    while due < from {
        n += 1;
        due = frequency.nth(anchor, n)?;
    }
    Some((n, due))
}

/// Installment `k` falls `k - 1` months after the first one. The first
/// installment's date is read back from its `cuota-1` record once it exists.
async fn generate_installments<S: LedgerStore + ?Sized>(
    store: &S,
    mut purchase: Transaction,
    now: NaiveDateTime,
    report: &mut GenerationReport,
) -> Result<(), CoreError> {
    let Some(next_due) = purchase.proxima_fecha else {
        return Ok(());
    };
    if next_due > now || purchase.cuotas_pagadas >= purchase.cuotas_total {
        return Ok(());
    }

    let children = store
        .list(&TransactionFilter::Children(purchase.id.clone()))
        .await?;
    let first = children
        .iter()
        .find(|c| c.periodo.as_deref() == Some("cuota-1"))
        .map(|c| c.fecha);
    let (anchor, offset) = match first {
        Some(fecha) => (fecha, 0),
        None => (next_due, purchase.cuotas_pagadas),
    };
    let mut existing: HashSet<String> = children.into_iter().filter_map(|c| c.periodo).collect();

    while purchase.cuotas_pagadas < purchase.cuotas_total {
        let number = purchase.cuotas_pagadas + 1;
        let Some(due) = Frequency::Monthly.nth(anchor, number - 1 - offset) else {
            break;
        };
        if due > now {
            break;
        }
        let periodo = format!("cuota-{number}");
        if existing.insert(periodo.clone()) {
            let mut child = spawn_child(&purchase, TransactionKind::InstallmentPayment, due, &periodo);
            child.monto_clp = purchase.monto_clp.installment(purchase.cuotas_total, number);
            child.descripcion = format!(
                "{} (cuota {number}/{})",
                purchase.descripcion, purchase.cuotas_total
            );
            child.compartido_con.clear();
            child.porcentaje_compartido = Default::default();
            let child = store.upsert(child).await?;
            report.created.push(child.id);
        } else {
            report.already_present += 1;
        }
        purchase.cuotas_pagadas = number;
    }

    purchase.proxima_fecha = if purchase.cuotas_pagadas >= purchase.cuotas_total {
        None
    } else {
        Frequency::Monthly.nth(anchor, purchase.cuotas_pagadas - offset)
    };
    store.upsert(purchase).await?;
    Ok(())
}

async fn existing_periods<S: LedgerStore + ?Sized>(
    store: &S,
    parent_id: &str,
) -> Result<HashSet<String>, CoreError> {
    Ok(store
        .list(&TransactionFilter::Children(parent_id.to_string()))
        .await?
        .into_iter()
        .filter_map(|child| child.periodo)
        .collect())
}

fn spawn_child(
    parent: &Transaction,
    tipo: TransactionKind,
    due: NaiveDateTime,
    periodo: &str,
) -> Transaction {
    let mut child = Transaction::new(tipo, &parent.descripcion, parent.monto_clp, due);
    child.id = format!("{}:{periodo}", parent.id);
    child.moneda = parent.moneda.clone();
    child.medio = parent.medio.clone();
    child.fuente = parent.fuente.clone();
    child.categoria = parent.categoria.clone();
    child.subcategoria = parent.subcategoria.clone();
    child.estado = parent.estado;
    child.ml_confidence = parent.ml_confidence;
    child.compartido_con = parent.compartido_con.clone();
    child.porcentaje_compartido = parent.porcentaje_compartido;
    child.parent_id = Some(parent.id.clone());
    child.periodo = Some(periodo.to_string());
    child
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::intake::{
        create_installment_purchase, create_recurring_template, NewInstallmentPurchase,
        NewRecurring,
    };
    use chrono::NaiveDate;
    use gastos_core::{Money, SettlementStatus};
    use gastos_storage::MemoryLedger;
    use rust_decimal::Decimal;

    fn at(y: i32, m: u32, d: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(y, m, d)
            .unwrap()
            .and_hms_opt(8, 0, 0)
            .unwrap()
    }

    async fn rent(store: &MemoryLedger, first: NaiveDateTime) -> Transaction {
        create_recurring_template(
            store,
            NewRecurring {
                descripcion: "Arriendo".into(),
                monto_clp: Money::from_clp(400_000),
                frecuencia: Frequency::Monthly,
                primera_fecha: first,
                categoria: "hogar".into(),
                subcategoria: "arriendo".into(),
                medio: None,
                compartido_con: "Ana".into(),
                porcentaje_compartido: Decimal::from(50),
            },
        )
        .await
        .unwrap()
    }

    #[tokio::test]
    async fn nothing_due_before_first_date() {
        let store = MemoryLedger::new();
        rent(&store, at(2024, 6, 1)).await;
        let report = generate_due(&store, at(2024, 5, 31)).await.unwrap();
        assert_eq!(report.templates_checked, 1);
        assert!(report.created.is_empty());
    }

    #[tokio::test]
    async fn catches_up_missed_months_once() {
        let store = MemoryLedger::new();
        let template = rent(&store, at(2024, 3, 1)).await;

        let report = generate_due(&store, at(2024, 5, 15)).await.unwrap();
        assert_eq!(report.created_count(), 3);

        let children = store
            .list(&TransactionFilter::Children(template.id.clone()))
            .await
            .unwrap();
        let periods: Vec<_> = children.iter().filter_map(|c| c.periodo.clone()).collect();
        assert_eq!(periods, vec!["2024-03", "2024-04", "2024-05"]);
        assert!(children.iter().all(|c| c.tipo == TransactionKind::Expense));
        assert!(children.iter().all(|c| c.settlement_status == SettlementStatus::Pending));
        assert_eq!(children[0].monto_tercero, Money::from_clp(200_000));

        let updated = store.require(&template.id).await.unwrap();
        assert_eq!(updated.proxima_fecha, Some(at(2024, 6, 1)));
    }

    #[tokio::test]
    async fn repeated_runs_are_idempotent() {
        let store = MemoryLedger::new();
        rent(&store, at(2024, 3, 1)).await;
        generate_due(&store, at(2024, 5, 15)).await.unwrap();
        let second = generate_due(&store, at(2024, 5, 15)).await.unwrap();
        assert!(second.created.is_empty());

        let expenses = store
            .list(&TransactionFilter::Kind(TransactionKind::Expense))
            .await
            .unwrap();
        assert_eq!(expenses.len(), 3);
    }

    #[tokio::test]
    async fn existing_period_is_not_regenerated_after_reset() {
        let store = MemoryLedger::new();
        let template = rent(&store, at(2024, 3, 1)).await;
        generate_due(&store, at(2024, 3, 2)).await.unwrap();

        // A stale copy of the template written back resets the due date.
        store.upsert(template).await.unwrap();
        let report = generate_due(&store, at(2024, 3, 2)).await.unwrap();
        assert!(report.created.is_empty());
        assert_eq!(report.already_present, 1);
    }

    fn dates(children: &[Transaction]) -> Vec<NaiveDate> {
        let mut dates: Vec<_> = children.iter().map(|c| c.fecha.date()).collect();
        dates.sort();
        dates
    }

    fn day(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    #[tokio::test]
    async fn month_end_template_does_not_drift() {
        let store = MemoryLedger::new();
        let template = rent(&store, at(2024, 1, 31)).await;

        // Two runs, so the stored next date after February is used too.
        generate_due(&store, at(2024, 3, 1)).await.unwrap();
        generate_due(&store, at(2024, 5, 1)).await.unwrap();

        let children = store
            .list(&TransactionFilter::Children(template.id.clone()))
            .await
            .unwrap();
        assert_eq!(
            dates(&children),
            vec![day(2024, 1, 31), day(2024, 2, 29), day(2024, 3, 31), day(2024, 4, 30)]
        );
        let updated = store.require(&template.id).await.unwrap();
        assert_eq!(updated.proxima_fecha, Some(at(2024, 5, 31)));
    }

    #[tokio::test]
    async fn month_end_installments_do_not_drift() {
        let store = MemoryLedger::new();
        let purchase = create_installment_purchase(
            &store,
            NewInstallmentPurchase {
                descripcion: "Bicicleta".into(),
                monto_clp: Money::from_clp(90_000),
                cuotas: 3,
                fecha: at(2024, 1, 20),
                primera_cuota: at(2024, 1, 31),
                categoria: "deporte".into(),
                subcategoria: String::new(),
                medio: None,
            },
        )
        .await
        .unwrap();

        generate_due(&store, at(2024, 3, 1)).await.unwrap();
        let halfway = store.require(&purchase.id).await.unwrap();
        assert_eq!(halfway.proxima_fecha, Some(at(2024, 3, 31)));

        generate_due(&store, at(2024, 4, 1)).await.unwrap();
        let payments = store
            .list(&TransactionFilter::Children(purchase.id.clone()))
            .await
            .unwrap();
        assert_eq!(
            dates(&payments),
            vec![day(2024, 1, 31), day(2024, 2, 29), day(2024, 3, 31)]
        );
    }

    #[tokio::test]
    async fn installments_split_amount_and_finish() {
        let store = MemoryLedger::new();
        let purchase = create_installment_purchase(
            &store,
            NewInstallmentPurchase {
                descripcion: "Notebook".into(),
                monto_clp: Money::from_clp(100_000),
                cuotas: 3,
                fecha: at(2024, 1, 10),
                primera_cuota: at(2024, 2, 5),
                categoria: "tecnologia".into(),
                subcategoria: String::new(),
                medio: None,
            },
        )
        .await
        .unwrap();

        let report = generate_due(&store, at(2024, 3, 6)).await.unwrap();
        assert_eq!(report.created_count(), 2);

        generate_due(&store, at(2024, 12, 1)).await.unwrap();
        let payments = store
            .list(&TransactionFilter::Children(purchase.id.clone()))
            .await
            .unwrap();
        assert_eq!(payments.len(), 3);
        let total: Money = payments.iter().map(|p| p.monto_clp).sum();
        assert_eq!(total, Money::from_clp(100_000));
        assert_eq!(payments[2].descripcion, "Notebook (cuota 3/3)");
        assert_eq!(payments[2].periodo.as_deref(), Some("cuota-3"));

        let done = store.require(&purchase.id).await.unwrap();
        assert_eq!(done.cuotas_pagadas, 3);
        assert_eq!(done.proxima_fecha, None);

        let again = generate_due(&store, at(2025, 1, 1)).await.unwrap();
        assert!(again.created.is_empty());
    }
}

use chrono::{Datelike, Months, NaiveDateTime};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use super::error::CoreError;
use super::money::Money;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Estado {
    #[default]
    Pendiente,
    Categorizado,
    Procesado,
}

impl Estado {
    pub fn as_str(self) -> &'static str {
        match self {
            Estado::Pendiente => "pendiente",
            Estado::Categorizado => "categorizado",
            Estado::Procesado => "procesado",
        }
    }
}

impl fmt::Display for Estado {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Estado {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "" | "pendiente" => Ok(Estado::Pendiente),
            "categorizado" => Ok(Estado::Categorizado),
            "procesado" => Ok(Estado::Procesado),
            other => Err(format!("Unknown estado: '{other}'")),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransactionKind {
    #[default]
    Expense,
    TransferIn,
    RecurringTemplate,
    InstallmentPurchase,
    InstallmentPayment,
    InstallmentExpense,
}

impl TransactionKind {
    pub fn as_str(self) -> &'static str {
        match self {
            TransactionKind::Expense => "expense",
            TransactionKind::TransferIn => "transfer_in",
            TransactionKind::RecurringTemplate => "recurring_template",
            TransactionKind::InstallmentPurchase => "installment_purchase",
            TransactionKind::InstallmentPayment => "installment_payment",
            TransactionKind::InstallmentExpense => "installment_expense",
        }
    }

    pub fn is_income(self) -> bool {
        self == TransactionKind::TransferIn
    }

    /// Meta-records that spawn ordinary expenses instead of being spent themselves.
    pub fn is_template(self) -> bool {
        matches!(
            self,
            TransactionKind::RecurringTemplate | TransactionKind::InstallmentPurchase
        )
    }
}

impl fmt::Display for TransactionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TransactionKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "" | "expense" => Ok(TransactionKind::Expense),
            "transfer_in" => Ok(TransactionKind::TransferIn),
            "recurring_template" => Ok(TransactionKind::RecurringTemplate),
            "installment_purchase" => Ok(TransactionKind::InstallmentPurchase),
            "installment_payment" => Ok(TransactionKind::InstallmentPayment),
            "installment_expense" => Ok(TransactionKind::InstallmentExpense),
            other => Err(format!("Unknown tipo: '{other}'")),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SettlementStatus {
    #[default]
    #[serde(rename = "")]
    Open,
    #[serde(rename = "pending")]
    Pending,
    #[serde(rename = "settled")]
    Settled,
    #[serde(rename = "matched")]
    Matched,
}

impl SettlementStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            SettlementStatus::Open => "",
            SettlementStatus::Pending => "pending",
            SettlementStatus::Settled => "settled",
            SettlementStatus::Matched => "matched",
        }
    }
}

impl fmt::Display for SettlementStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SettlementStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "" | "unmatched" => Ok(SettlementStatus::Open),
            "pending" => Ok(SettlementStatus::Pending),
            "settled" => Ok(SettlementStatus::Settled),
            "matched" => Ok(SettlementStatus::Matched),
            other => Err(format!("Unknown settlement_status: '{other}'")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Frequency {
    Weekly,
    Monthly,
    Yearly,
}

impl Frequency {
    pub fn as_str(self) -> &'static str {
        match self {
            Frequency::Weekly => "weekly",
            Frequency::Monthly => "monthly",
            Frequency::Yearly => "yearly",
        }
    }

    /// The `n`-th due timestamp counted from `anchor`. Month arithmetic
    /// clamps to the last day of the month, and since every occurrence is
    /// derived from the anchor a clamped date never shifts later ones.
    pub fn nth(self, anchor: NaiveDateTime, n: u32) -> Option<NaiveDateTime> {
        match self {
            Frequency::Weekly => anchor.checked_add_signed(chrono::Duration::weeks(i64::from(n))),
            Frequency::Monthly => anchor.checked_add_months(Months::new(n)),
            Frequency::Yearly => n
                .checked_mul(12)
                .and_then(|months| anchor.checked_add_months(Months::new(months))),
        }
    }

    /// Key identifying the period a due date falls in, used to deduplicate
    /// generated records.
    pub fn period_key(self, due: NaiveDateTime) -> String {
        match self {
            Frequency::Weekly => {
                let week = due.date().iso_week();
                format!("{}-W{:02}", week.year(), week.week())
            }
            Frequency::Monthly => format!("{}-{:02}", due.year(), due.month()),
            Frequency::Yearly => due.year().to_string(),
        }
    }
}

impl FromStr for Frequency {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "weekly" | "semanal" => Ok(Frequency::Weekly),
            "monthly" | "mensual" => Ok(Frequency::Monthly),
            "yearly" | "anual" => Ok(Frequency::Yearly),
            other => Err(format!("Unknown frecuencia: '{other}'")),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Transaction {
    pub id: String,
    pub fecha: NaiveDateTime,
    pub descripcion: String,
    pub monto_clp: Money,
    pub moneda: String,
    pub medio: String,
    pub mcc: String,
    pub fuente: String,
    pub etiquetas: String,
    pub contraparte: String,
    pub categoria: String,
    pub subcategoria: String,
    pub estado: Estado,
    pub ml_confidence: f64,
    pub tipo: TransactionKind,
    pub compartido_con: String,
    pub porcentaje_compartido: Decimal,
    pub monto_tu_parte: Money,
    pub monto_tercero: Money,
    pub settlement_status: SettlementStatus,
    pub settled_with: Option<String>,
    pub settled_date: Option<NaiveDateTime>,
    pub matched_expense: Option<String>,
    pub parent_id: Option<String>,
    pub periodo: Option<String>,
    pub frecuencia: Option<Frequency>,
    pub proxima_fecha: Option<NaiveDateTime>,
    pub cuotas_total: u32,
    pub cuotas_pagadas: u32,
}

impl Transaction {
    pub fn new(
        tipo: TransactionKind,
        descripcion: &str,
        monto_clp: Money,
        fecha: NaiveDateTime,
    ) -> Self {
        Transaction {
            fecha,
            descripcion: descripcion.to_string(),
            monto_clp,
            moneda: "CLP".to_string(),
            tipo,
            ..Transaction::default()
        }
    }

    pub fn is_shared(&self) -> bool {
        self.porcentaje_compartido > Decimal::ZERO
    }

    pub fn is_settled(&self) -> bool {
        self.settlement_status == SettlementStatus::Settled
    }

    /// A shared expense whose third-party portion is still owed.
    pub fn is_receivable(&self) -> bool {
        self.is_shared()
            && !self.tipo.is_income()
            && !self.tipo.is_template()
            && matches!(
                self.settlement_status,
                SettlementStatus::Open | SettlementStatus::Pending
            )
    }

    /// Schema normalization applied before every write and after every load:
    /// assigns an id, validates ranges and recomputes the split amounts.
    pub fn normalized(mut self) -> Result<Self, CoreError> {
        if self.id.trim().is_empty() {
            self.id = Uuid::new_v4().to_string();
        } else {
            self.id = self.id.trim().to_string();
        }

        if self.monto_clp.is_negative() {
            return Err(CoreError::validation(
                "monto_clp",
                format!("amount must be non-negative, got {}", self.monto_clp.as_decimal()),
            ));
        }
        if self.porcentaje_compartido < Decimal::ZERO
            || self.porcentaje_compartido > Decimal::ONE_HUNDRED
        {
            return Err(CoreError::validation(
                "porcentaje_compartido",
                format!("must be between 0 and 100, got {}", self.porcentaje_compartido),
            ));
        }
        if !self.ml_confidence.is_finite() {
            self.ml_confidence = 0.0;
        }
        self.ml_confidence = self.ml_confidence.clamp(0.0, 1.0);

        for field in [
            &mut self.descripcion,
            &mut self.categoria,
            &mut self.subcategoria,
            &mut self.compartido_con,
            &mut self.contraparte,
        ] {
            let trimmed = field.trim();
            if trimmed.len() != field.len() {
                *field = trimmed.to_string();
            }
        }
        if self.moneda.trim().is_empty() {
            self.moneda = "CLP".to_string();
        }

        self.monto_clp = Money::from_decimal(self.monto_clp.as_decimal());
        let (tu_parte, tercero) = split_amounts(self.monto_clp, self.porcentaje_compartido);
        self.monto_tu_parte = tu_parte;
        self.monto_tercero = tercero;

        if !self.tipo.is_income() {
            match self.settlement_status {
                SettlementStatus::Open if self.is_shared() => {
                    self.settlement_status = SettlementStatus::Pending;
                }
                SettlementStatus::Pending if !self.is_shared() => {
                    self.settlement_status = SettlementStatus::Open;
                }
                _ => {}
            }
        }

        Ok(self)
    }
}

/// Returns `(monto_tu_parte, monto_tercero)` for an amount shared at `pct` percent.
pub fn split_amounts(monto: Money, pct: Decimal) -> (Money, Money) {
    if pct <= Decimal::ZERO {
        return (monto, Money::zero());
    }
    let tercero = monto.percent(pct.min(Decimal::ONE_HUNDRED));
    (monto - tercero, tercero)
}

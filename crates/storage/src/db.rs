use async_trait::async_trait;
use gastos_core::{
    CoreError, LedgerStore, Money, Transaction, TransactionFilter, TransactionKind,
};
use rust_decimal::Decimal;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions, SqliteRow};
use sqlx::{Pool, Row, Sqlite};
use std::path::Path;
use std::str::FromStr;

use crate::error::StoreError;

pub type DbPool = Pool<Sqlite>;

pub async fn create_db(path: &Path) -> Result<DbPool, sqlx::Error> {
    let options = SqliteConnectOptions::new()
        .filename(path)
        .create_if_missing(true);
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect_with(options)
        .await?;

    sqlx::query("PRAGMA journal_mode = WAL")
        .execute(&pool)
        .await?;
    sqlx::query("PRAGMA synchronous = NORMAL")
        .execute(&pool)
        .await?;
    sqlx::query("PRAGMA busy_timeout = 5000")
        .execute(&pool)
        .await?;
    sqlx::query("PRAGMA cache_size = -16000")
        .execute(&pool)
        .await?;

    run_migrations(&pool).await?;

    Ok(pool)
}

async fn run_migrations(pool: &DbPool) -> Result<(), sqlx::Error> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS transactions (
            id TEXT PRIMARY KEY,
            fecha TEXT NOT NULL,
            descripcion TEXT NOT NULL DEFAULT '',
            monto_clp TEXT NOT NULL DEFAULT '0',
            moneda TEXT NOT NULL DEFAULT 'CLP',
            medio TEXT NOT NULL DEFAULT '',
            mcc TEXT NOT NULL DEFAULT '',
            fuente TEXT NOT NULL DEFAULT '',
            etiquetas TEXT NOT NULL DEFAULT '',
            contraparte TEXT NOT NULL DEFAULT '',
            categoria TEXT NOT NULL DEFAULT '',
            subcategoria TEXT NOT NULL DEFAULT '',
            estado TEXT NOT NULL DEFAULT 'pendiente',
            ml_confidence REAL NOT NULL DEFAULT 0,
            tipo TEXT NOT NULL DEFAULT 'expense',
            compartido_con TEXT NOT NULL DEFAULT '',
            porcentaje_compartido TEXT NOT NULL DEFAULT '0',
            monto_tu_parte TEXT NOT NULL DEFAULT '0',
            monto_tercero TEXT NOT NULL DEFAULT '0',
            settlement_status TEXT NOT NULL DEFAULT '',
            settled_with TEXT,
            settled_date TEXT,
            matched_expense TEXT,
            parent_id TEXT,
            periodo TEXT,
            frecuencia TEXT,
            proxima_fecha TEXT,
            cuotas_total INTEGER NOT NULL DEFAULT 0,
            cuotas_pagadas INTEGER NOT NULL DEFAULT 0,
            created_at TEXT NOT NULL DEFAULT (datetime('now'))
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query("CREATE INDEX IF NOT EXISTS idx_transactions_estado ON transactions(estado)")
        .execute(pool)
        .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_transactions_tipo ON transactions(tipo)")
        .execute(pool)
        .await?;
    sqlx::query(
        "CREATE UNIQUE INDEX IF NOT EXISTS idx_transactions_parent_period \
         ON transactions(parent_id, periodo) WHERE parent_id IS NOT NULL",
    )
    .execute(pool)
    .await?;

    Ok(())
}

const COLUMNS: &str = "id, fecha, descripcion, monto_clp, moneda, medio, mcc, fuente, etiquetas, \
    contraparte, categoria, subcategoria, estado, ml_confidence, tipo, compartido_con, \
    porcentaje_compartido, monto_tu_parte, monto_tercero, settlement_status, settled_with, \
    settled_date, matched_expense, parent_id, periodo, frecuencia, proxima_fecha, \
    cuotas_total, cuotas_pagadas";

/// SQLite-backed ledger. Row order follows first insertion (`rowid`);
/// updates keep a row's position.
#[derive(Clone)]
pub struct SqliteLedger {
    pool: DbPool,
}

impl SqliteLedger {
    pub async fn open(path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }
        let pool = create_db(path).await?;
        tracing::info!("Ledger database opened: {}", path.display());
        Ok(Self { pool })
    }

    pub async fn count(&self) -> Result<i64, StoreError> {
        let (count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM transactions")
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }

    /// Consistent copy of the whole database at `dest`, which must not exist.
    pub async fn snapshot_to(&self, dest: &Path) -> Result<(), StoreError> {
        sqlx::query("VACUUM INTO ?")
            .bind(dest.to_string_lossy().into_owned())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }

    async fn fetch_one(&self, id: &str) -> Result<Option<Transaction>, StoreError> {
        let row = sqlx::query(&format!("SELECT {COLUMNS} FROM transactions WHERE id = ?"))
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(|r| row_to_transaction(&r)).transpose()
    }

    async fn write(&self, tx: &Transaction) -> Result<(), StoreError> {
        sqlx::query(&format!(
            "INSERT INTO transactions ({COLUMNS}) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?) \
             ON CONFLICT(id) DO UPDATE SET \
                fecha = excluded.fecha, descripcion = excluded.descripcion, \
                monto_clp = excluded.monto_clp, moneda = excluded.moneda, medio = excluded.medio, \
                mcc = excluded.mcc, fuente = excluded.fuente, etiquetas = excluded.etiquetas, \
                contraparte = excluded.contraparte, categoria = excluded.categoria, \
                subcategoria = excluded.subcategoria, estado = excluded.estado, \
                ml_confidence = excluded.ml_confidence, tipo = excluded.tipo, \
                compartido_con = excluded.compartido_con, \
                porcentaje_compartido = excluded.porcentaje_compartido, \
                monto_tu_parte = excluded.monto_tu_parte, monto_tercero = excluded.monto_tercero, \
                settlement_status = excluded.settlement_status, settled_with = excluded.settled_with, \
                settled_date = excluded.settled_date, matched_expense = excluded.matched_expense, \
                parent_id = excluded.parent_id, periodo = excluded.periodo, \
                frecuencia = excluded.frecuencia, proxima_fecha = excluded.proxima_fecha, \
                cuotas_total = excluded.cuotas_total, cuotas_pagadas = excluded.cuotas_pagadas"
        ))
        .bind(&tx.id)
        .bind(tx.fecha)
        .bind(&tx.descripcion)
        .bind(tx.monto_clp.as_decimal().to_string())
        .bind(&tx.moneda)
        .bind(&tx.medio)
        .bind(&tx.mcc)
        .bind(&tx.fuente)
        .bind(&tx.etiquetas)
        .bind(&tx.contraparte)
        .bind(&tx.categoria)
        .bind(&tx.subcategoria)
        .bind(tx.estado.as_str())
        .bind(tx.ml_confidence)
        .bind(tx.tipo.as_str())
        .bind(&tx.compartido_con)
        .bind(tx.porcentaje_compartido.to_string())
        .bind(tx.monto_tu_parte.as_decimal().to_string())
        .bind(tx.monto_tercero.as_decimal().to_string())
        .bind(tx.settlement_status.as_str())
        .bind(&tx.settled_with)
        .bind(tx.settled_date)
        .bind(&tx.matched_expense)
        .bind(&tx.parent_id)
        .bind(&tx.periodo)
        .bind(tx.frecuencia.map(|f| f.as_str()))
        .bind(tx.proxima_fecha)
        .bind(i64::from(tx.cuotas_total))
        .bind(i64::from(tx.cuotas_pagadas))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn fetch_filtered(&self, filter: &TransactionFilter) -> Result<Vec<Transaction>, StoreError> {
        let condition = match filter {
            TransactionFilter::All => String::new(),
            TransactionFilter::Pendientes => "WHERE estado = 'pendiente'".to_string(),
            TransactionFilter::Receivables => "WHERE settlement_status IN ('', 'pending') \
                 AND tipo NOT IN ('transfer_in', 'recurring_template', 'installment_purchase')"
                .to_string(),
            TransactionFilter::Incomes => {
                format!("WHERE tipo = '{}'", TransactionKind::TransferIn.as_str())
            }
            TransactionFilter::Kind(kind) => format!("WHERE tipo = '{}'", kind.as_str()),
            TransactionFilter::Children(_) => "WHERE parent_id = ?".to_string(),
        };
        let query = format!("SELECT {COLUMNS} FROM transactions {condition} ORDER BY rowid");

        let mut q = sqlx::query(&query);
        if let TransactionFilter::Children(parent) = filter {
            q = q.bind(parent);
        }
        let rows = q.fetch_all(&self.pool).await?;

        let mut out = Vec::with_capacity(rows.len());
        for row in &rows {
            let tx = row_to_transaction(row)?;
            if filter.matches(&tx) {
                out.push(tx);
            }
        }
        Ok(out)
    }

    async fn remove(&self, id: &str) -> Result<bool, StoreError> {
        let result = sqlx::query("DELETE FROM transactions WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }
}

#[async_trait]
impl LedgerStore for SqliteLedger {
    async fn get(&self, id: &str) -> Result<Option<Transaction>, CoreError> {
        Ok(self.fetch_one(id).await?)
    }

    async fn upsert(&self, tx: Transaction) -> Result<Transaction, CoreError> {
        let tx = tx.normalized()?;
        self.write(&tx).await?;
        Ok(tx)
    }

    async fn list(&self, filter: &TransactionFilter) -> Result<Vec<Transaction>, CoreError> {
        Ok(self.fetch_filtered(filter).await?)
    }

    async fn delete(&self, id: &str) -> Result<bool, CoreError> {
        Ok(self.remove(id).await?)
    }
}

fn row_to_transaction(row: &SqliteRow) -> Result<Transaction, StoreError> {
    let id: String = row.try_get("id")?;
    let corrupt = |reason: String| StoreError::Corrupt {
        id: id.clone(),
        reason,
    };

    let money = |col: &str| -> Result<Money, StoreError> {
        let raw: String = row.try_get(col)?;
        Decimal::from_str(raw.trim())
            .map(Money::from_decimal)
            .map_err(|e| corrupt(format!("{col}: {e}")))
    };
    let count = |col: &str| -> Result<u32, StoreError> {
        let raw: i64 = row.try_get(col)?;
        u32::try_from(raw).map_err(|e| corrupt(format!("{col}: {e}")))
    };

    let porcentaje: String = row.try_get("porcentaje_compartido")?;
    let estado: String = row.try_get("estado")?;
    let tipo: String = row.try_get("tipo")?;
    let settlement: String = row.try_get("settlement_status")?;
    let frecuencia: Option<String> = row.try_get("frecuencia")?;

    let tx = Transaction {
        fecha: row.try_get("fecha")?,
        descripcion: row.try_get("descripcion")?,
        monto_clp: money("monto_clp")?,
        moneda: row.try_get("moneda")?,
        medio: row.try_get("medio")?,
        mcc: row.try_get("mcc")?,
        fuente: row.try_get("fuente")?,
        etiquetas: row.try_get("etiquetas")?,
        contraparte: row.try_get("contraparte")?,
        categoria: row.try_get("categoria")?,
        subcategoria: row.try_get("subcategoria")?,
        estado: estado.parse().map_err(corrupt)?,
        ml_confidence: row.try_get("ml_confidence")?,
        tipo: tipo.parse().map_err(corrupt)?,
        compartido_con: row.try_get("compartido_con")?,
        porcentaje_compartido: Decimal::from_str(porcentaje.trim())
            .map_err(|e| corrupt(format!("porcentaje_compartido: {e}")))?,
        monto_tu_parte: money("monto_tu_parte")?,
        monto_tercero: money("monto_tercero")?,
        settlement_status: settlement.parse().map_err(corrupt)?,
        settled_with: row.try_get("settled_with")?,
        settled_date: row.try_get("settled_date")?,
        matched_expense: row.try_get("matched_expense")?,
        parent_id: row.try_get("parent_id")?,
        periodo: row.try_get("periodo")?,
        frecuencia: frecuencia.map(|f| f.parse()).transpose().map_err(corrupt)?,
        proxima_fecha: row.try_get("proxima_fecha")?,
        cuotas_total: count("cuotas_total")?,
        cuotas_pagadas: count("cuotas_pagadas")?,
        id: id.clone(),
    };

    // Rows written by older versions may predate the split columns.
    tx.normalized().map_err(|e| corrupt(e.to_string()))
}

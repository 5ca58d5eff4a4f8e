//! Chat-bot webhook: turns Telegram updates into operator commands and runs
//! them against the ledger.

use gastos_core::{CoreError, Transaction};
use gastos_engine::intake::{
    ingest_income, revert_to_pending, select_category, update_sharing, NewIncome,
};
use gastos_engine::{OperatorCommand, ShareChoice};
use rust_decimal::Decimal;
use serde::Deserialize;
use tokio::task::JoinHandle;

use crate::main_lib::{now, AppState};
use crate::notifier::{escape_markdown, spawn_delivery};

pub const SECRET_HEADER: &str = "x-telegram-bot-api-secret-token";
const SUGGESTION_LIMIT: usize = 8;

#[derive(Debug, Clone, Deserialize)]
pub struct Update {
    pub update_id: i64,
    #[serde(default)]
    pub message: Option<Message>,
    #[serde(default)]
    pub callback_query: Option<CallbackQuery>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Message {
    pub message_id: i64,
    #[serde(default)]
    pub text: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CallbackQuery {
    pub id: String,
    #[serde(default)]
    pub data: Option<String>,
}

/// True when no secret is configured or the header carries it.
pub fn secret_matches(expected: Option<&str>, provided: Option<&str>) -> bool {
    match expected {
        None => true,
        Some(expected) => provided.is_some_and(|p| {
            p.len() == expected.len()
                && p.bytes()
                    .zip(expected.bytes())
                    .fold(0u8, |acc, (a, b)| acc | (a ^ b))
                    == 0
        }),
    }
}

/// Replies and prompts spawned while handling one update. Dropping it
/// leaves them running in the background.
#[derive(Default)]
#[must_use = "dropping detaches the deliveries, call `finished` to wait for them"]
pub struct Deliveries(Vec<JoinHandle<()>>);

impl Deliveries {
    fn reply(&mut self, state: &AppState, text: String) {
        let notifier = state.notifier.clone();
        self.0.push(spawn_delivery("chat reply", async move {
            notifier.send_message(&text).await
        }));
    }

    fn sharing_prompt(&mut self, state: &AppState, tx: Transaction) {
        let notifier = state.notifier.clone();
        self.0.push(spawn_delivery("sharing prompt", async move {
            notifier.notify_sharing_prompt(&tx).await
        }));
    }

    pub async fn finished(self) {
        for handle in self.0 {
            if let Err(e) = handle.await {
                tracing::warn!("Delivery task failed: {e}");
            }
        }
    }
}

/// Never fails and never waits on the notifier: problems are reported back
/// to the chat and logged, and the webhook answers at once so Telegram does
/// not redeliver the update.
pub async fn handle_update(state: &AppState, update: Update) -> Deliveries {
    let mut out = Deliveries::default();
    let command = if let Some(callback) = update.callback_query {
        let notifier = state.notifier.clone();
        let callback_id = callback.id;
        out.0.push(spawn_delivery("callback answer", async move {
            notifier.answer_callback(&callback_id).await
        }));
        let data = callback.data.unwrap_or_default();
        tracing::info!(update = update.update_id, callback = %data, "Callback received");
        match OperatorCommand::parse_callback(&data) {
            Some(command) => command,
            None => {
                tracing::warn!(callback = %data, "Unknown callback payload");
                return out;
            }
        }
    } else if let Some(text) = update.message.and_then(|m| m.text) {
        match OperatorCommand::parse_text(&text) {
            Ok(Some(command)) => command,
            Ok(None) => return out,
            Err(e) => {
                out.reply(state, format!("❌ {e}"));
                return out;
            }
        }
    } else {
        return out;
    };

    if let Err(e) = execute(state, command, &mut out).await {
        tracing::warn!("Operator command failed: {e}");
        let text = match &e {
            CoreError::NotFound(id) => format!("❌ No se encontró el gasto con ID: {id}"),
            other => format!("❌ Error procesando comando: {}", escape_markdown(&other.to_string())),
        };
        out.reply(state, text);
    }
    out
}

pub async fn execute(
    state: &AppState,
    command: OperatorCommand,
    out: &mut Deliveries,
) -> Result<(), CoreError> {
    let store = &*state.store;
    match command {
        OperatorCommand::Categorize { id, categoria } => {
            let tx = select_category(store, &state.categorizer, &id, &categoria).await?;
            out.sharing_prompt(state, tx);
        }
        OperatorCommand::Share { id, choice } => match choice {
            ShareChoice::No => {
                let tx = update_sharing(store, &id, "", Decimal::ZERO).await?;
                out.reply(state, processed_message(&tx));
            }
            ShareChoice::Half => {
                store.require(&id).await?;
                out.reply(
                    state,
                    format!(
                        "💬 *Compartido 50/50*\n\nResponde con: `id {id} con <Nombre>`\nEjemplo: `id {id} con Juan`"
                    ),
                );
            }
            ShareChoice::Custom => {
                store.require(&id).await?;
                out.reply(
                    state,
                    format!(
                        "💬 *Porcentaje personalizado*\n\nResponde con: `id {id} con <Nombre> % <porcentaje>`\nEjemplo: `id {id} con María % 30`"
                    ),
                );
            }
        },
        OperatorCommand::Confirm { id, yes: true } => {
            let tx = store.require(&id).await?;
            out.sharing_prompt(state, tx);
        }
        OperatorCommand::Confirm { id, yes: false } => {
            let tx = revert_to_pending(store, &id).await?;
            let options = state
                .categorizer
                .category_suggestions(&tx.descripcion, SUGGESTION_LIMIT);
            let notifier = state.notifier.clone();
            out.0.push(spawn_delivery("category prompt", async move {
                notifier.notify_categorization(&tx, "", &options).await
            }));
        }
        OperatorCommand::ShareWith { id, name, pct } => {
            let tx = update_sharing(store, &id, &name, pct).await?;
            out.reply(state, shared_message(&tx));
        }
        OperatorCommand::Income {
            amount,
            descripcion,
            contraparte,
        } => {
            let new = NewIncome {
                descripcion,
                monto_clp: amount,
                contraparte,
                fuente: Some("telegram_manual".to_string()),
                ..NewIncome::default()
            };
            let outcome = ingest_income(store, &state.matcher, new, now()).await?;
            let mut text = format!(
                "✅ *Ingreso registrado*\n\n💰 Monto: {} CLP\n📝 Descripción: {}\n",
                outcome.income.monto_clp,
                escape_markdown(&outcome.income.descripcion)
            );
            if !outcome.income.contraparte.is_empty() {
                text.push_str(&format!("👤 De: {}\n", escape_markdown(&outcome.income.contraparte)));
            }
            if let Some(expense) = &outcome.matched_expense {
                text.push_str(&format!(
                    "\n🔗 *Auto-emparejado con gasto:*\n💸 {}\n💰 {} CLP\n✅ Liquidado automáticamente",
                    escape_markdown(&expense.descripcion),
                    expense.monto_clp
                ));
            } else if !outcome.suggestions.is_empty() {
                text.push_str(&format!(
                    "\n💡 {} gasto(s) pendiente(s) podrían corresponder a este ingreso",
                    outcome.suggestions.len()
                ));
            }
            out.reply(state, text);
        }
        OperatorCommand::Help => out.reply(state, HELP_TEXT.to_string()),
    }
    Ok(())
}

const HELP_TEXT: &str = "🤖 *Comandos disponibles:*\n\n\
💰 *Ingresos:*\n`ingreso 50000 Sueldo septiembre`\n`ingreso 15000 Reembolso cena de Juan`\n\n\
🤝 *Gastos compartidos:*\n`id ABC123 con Juan`\n`id ABC123 con María % 30`\n\n\
ℹ️ Los ingresos \"de alguien\" intentan emparejarse automáticamente con gastos pendientes.";

fn processed_message(tx: &Transaction) -> String {
    format!(
        "✅ *Gasto procesado completamente*\n\n📊 Categoría: {}\n💰 Monto: {} CLP\n🏪 {}\n👤 No compartido",
        escape_markdown(&tx.categoria),
        tx.monto_clp,
        escape_markdown(&tx.descripcion)
    )
}

fn shared_message(tx: &Transaction) -> String {
    format!(
        "✅ *Gasto compartido configurado*\n\n📊 Categoría: {}\n💰 Monto total: {} CLP\n👤 Tu parte: {} CLP ({}%)\n👥 {}: {} CLP ({}%)\n⏳ Estado: Pendiente de cobro",
        escape_markdown(&tx.categoria),
        tx.monto_clp,
        tx.monto_tu_parte,
        (Decimal::ONE_HUNDRED - tx.porcentaje_compartido).normalize(),
        escape_markdown(&tx.compartido_con),
        tx.monto_tercero,
        tx.porcentaje_compartido.normalize()
    )
}

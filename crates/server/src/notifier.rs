//! Outbound operator notifications. Delivery is best-effort: callers log a
//! failed notification and carry on.

use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use gastos_core::Transaction;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use thiserror::Error;
use tokio::task::JoinHandle;

use crate::config::TelegramConfig;

/// Telegram rejects callback payloads longer than this.
const MAX_CALLBACK_BYTES: usize = 64;
const RETRY_BASE_DELAY: Duration = Duration::from_millis(500);
const MAX_RETRY_AFTER_SECS: u64 = 30;

#[derive(Debug, Error)]
pub enum NotifyError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("Telegram API error {code}: {description}")]
    Api { code: u16, description: String },
    #[error("Gave up after {0} attempts")]
    Exhausted(u32),
}

#[async_trait]
pub trait Notifier: Send + Sync {
    /// Expense left `pendiente`; ask the operator to pick a category.
    async fn notify_categorization(
        &self,
        tx: &Transaction,
        hint: &str,
        options: &[String],
    ) -> Result<(), NotifyError>;

    async fn notify_sharing_prompt(&self, tx: &Transaction) -> Result<(), NotifyError>;

    /// Automatic category below the confirmation threshold.
    async fn notify_confirmation(&self, tx: &Transaction, confidence: f64)
        -> Result<(), NotifyError>;

    async fn notify_match(
        &self,
        income: &Transaction,
        expense: &Transaction,
        auto: bool,
    ) -> Result<(), NotifyError>;

    async fn send_message(&self, text: &str) -> Result<(), NotifyError>;

    /// Clears the loading state on a pressed inline button.
    async fn answer_callback(&self, _callback_id: &str) -> Result<(), NotifyError> {
        Ok(())
    }
}

/// Runs a delivery off the caller's path. Retries and rate-limit waits in
/// the notifier never hold up a request.
pub fn spawn_delivery<F>(what: &'static str, delivery: F) -> JoinHandle<()>
where
    F: Future<Output = Result<(), NotifyError>> + Send + 'static,
{
    tokio::spawn(async move {
        if let Err(e) = delivery.await {
            tracing::warn!("Failed to deliver {what}: {e}");
        }
    })
}

/// Writes notifications to the log. Used when no bot is configured.
#[derive(Debug, Default)]
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn notify_categorization(
        &self,
        tx: &Transaction,
        hint: &str,
        options: &[String],
    ) -> Result<(), NotifyError> {
        tracing::info!(id = %tx.id, hint, options = ?options, "Expense needs a category");
        Ok(())
    }

    async fn notify_sharing_prompt(&self, tx: &Transaction) -> Result<(), NotifyError> {
        tracing::info!(id = %tx.id, categoria = %tx.categoria, "Expense ready for sharing decision");
        Ok(())
    }

    async fn notify_confirmation(
        &self,
        tx: &Transaction,
        confidence: f64,
    ) -> Result<(), NotifyError> {
        tracing::info!(id = %tx.id, categoria = %tx.categoria, confidence, "Expense needs confirmation");
        Ok(())
    }

    async fn notify_match(
        &self,
        income: &Transaction,
        expense: &Transaction,
        auto: bool,
    ) -> Result<(), NotifyError> {
        tracing::info!(income = %income.id, expense = %expense.id, auto, "Income matched");
        Ok(())
    }

    async fn send_message(&self, text: &str) -> Result<(), NotifyError> {
        tracing::info!("{text}");
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Button {
    pub text: String,
    pub callback_data: String,
}

impl Button {
    fn new(text: impl Into<String>, callback_data: String) -> Self {
        Button {
            text: text.into(),
            callback_data,
        }
    }
}

pub type Keyboard = Vec<Vec<Button>>;

#[derive(Debug, Deserialize)]
struct ApiReply {
    ok: bool,
    #[serde(default)]
    result: Option<Value>,
    #[serde(default)]
    error_code: Option<u16>,
    #[serde(default)]
    description: Option<String>,
    #[serde(default)]
    parameters: Option<ReplyParameters>,
}

#[derive(Debug, Deserialize)]
struct ReplyParameters {
    retry_after: Option<u64>,
}

pub struct TelegramNotifier {
    client: reqwest::Client,
    base_url: String,
    chat_id: String,
    max_retries: u32,
}

impl TelegramNotifier {
    /// `None` when the bot token or chat id is missing.
    pub fn from_config(config: &TelegramConfig) -> Result<Option<Self>, NotifyError> {
        if !config.is_configured() {
            return Ok(None);
        }
        let (Some(token), Some(chat_id)) = (&config.bot_token, &config.chat_id) else {
            return Ok(None);
        };
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;
        Ok(Some(TelegramNotifier {
            client,
            base_url: format!("{}/bot{}", config.api_base.trim_end_matches('/'), token),
            chat_id: chat_id.clone(),
            max_retries: config.max_retries.max(1),
        }))
    }

    /// Calls a Bot API method, retrying on timeouts, connection failures,
    /// 5xx responses and rate limiting. Bad requests are not retried.
    async fn call(&self, method: &str, body: &Value) -> Result<Value, NotifyError> {
        let url = format!("{}/{method}", self.base_url);
        for attempt in 0..self.max_retries {
            if attempt > 0 {
                tokio::time::sleep(RETRY_BASE_DELAY * 2u32.pow(attempt)).await;
            }

            let response = match self.client.post(&url).json(body).send().await {
                Ok(r) => r,
                Err(e) if e.is_timeout() || e.is_connect() => {
                    tracing::warn!(method, attempt = attempt + 1, "Telegram unreachable: {e}");
                    continue;
                }
                Err(e) => return Err(e.into()),
            };

            let status = response.status();
            if status.is_server_error() {
                tracing::warn!(method, attempt = attempt + 1, status = status.as_u16(), "Telegram server error");
                continue;
            }

            let reply: ApiReply = response.json().await?;
            if reply.ok {
                return Ok(reply.result.unwrap_or(Value::Null));
            }

            let code = reply.error_code.unwrap_or(status.as_u16());
            let description = reply.description.unwrap_or_default();
            if code == 429 {
                let wait = reply
                    .parameters
                    .and_then(|p| p.retry_after)
                    .unwrap_or(MAX_RETRY_AFTER_SECS)
                    .min(MAX_RETRY_AFTER_SECS);
                tracing::warn!(method, wait, "Rate limited by Telegram");
                tokio::time::sleep(Duration::from_secs(wait)).await;
                continue;
            }
            return Err(NotifyError::Api { code, description });
        }
        Err(NotifyError::Exhausted(self.max_retries))
    }

    async fn send(&self, text: String, keyboard: Option<Keyboard>) -> Result<(), NotifyError> {
        let mut body = json!({
            "chat_id": self.chat_id,
            "text": text,
            "parse_mode": "Markdown",
        });
        if let Some(keyboard) = keyboard {
            body["reply_markup"] = json!({ "inline_keyboard": keyboard });
        }
        self.call("sendMessage", &body).await.map(|_| ())
    }
}

#[async_trait]
impl Notifier for TelegramNotifier {
    async fn notify_categorization(
        &self,
        tx: &Transaction,
        hint: &str,
        options: &[String],
    ) -> Result<(), NotifyError> {
        self.send(category_prompt(tx, hint), Some(category_keyboard(&tx.id, options)))
            .await
    }

    async fn notify_sharing_prompt(&self, tx: &Transaction) -> Result<(), NotifyError> {
        self.send(share_prompt(tx), Some(share_keyboard(&tx.id))).await
    }

    async fn notify_confirmation(
        &self,
        tx: &Transaction,
        confidence: f64,
    ) -> Result<(), NotifyError> {
        self.send(confirmation_prompt(tx, confidence), Some(confirm_keyboard(&tx.id)))
            .await
    }

    async fn notify_match(
        &self,
        income: &Transaction,
        expense: &Transaction,
        auto: bool,
    ) -> Result<(), NotifyError> {
        self.send(match_message(income, expense, auto), None).await
    }

    async fn send_message(&self, text: &str) -> Result<(), NotifyError> {
        self.send(text.to_string(), None).await
    }

    async fn answer_callback(&self, callback_id: &str) -> Result<(), NotifyError> {
        self.call("answerCallbackQuery", &json!({ "callback_query_id": callback_id }))
            .await
            .map(|_| ())
    }
}

// ── Message text ──────────────────────────────────────────────────────────────

/// Escapes the characters legacy Telegram Markdown treats as markup.
pub fn escape_markdown(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        if matches!(c, '_' | '*' | '`' | '[') {
            out.push('\\');
        }
        out.push(c);
    }
    out
}

fn expense_lines(tx: &Transaction) -> String {
    format!(
        "💰 Monto: {} CLP\n📅 Fecha: {}\n🏪 Descripción: {}\n",
        tx.monto_clp,
        tx.fecha.format("%Y-%m-%d %H:%M"),
        escape_markdown(&tx.descripcion)
    )
}

pub fn category_prompt(tx: &Transaction, hint: &str) -> String {
    let mut text = format!("🧾 *Nuevo gasto por categorizar*\n\n{}", expense_lines(tx));
    if !hint.is_empty() {
        text.push_str(&format!("💡 Sugerencia: {}\n", escape_markdown(hint)));
    }
    text.push_str("\n¿En qué categoría clasificamos este gasto?");
    text
}

pub fn share_prompt(tx: &Transaction) -> String {
    format!(
        "📊 *Gasto categorizado: {}*\n\n{}\n¿Este gasto es compartido?",
        escape_markdown(&tx.categoria),
        expense_lines(tx)
    )
}

pub fn confirmation_prompt(tx: &Transaction, confidence: f64) -> String {
    format!(
        "🤖 *Auto-categorizado con {:.0}% confianza*\n\n{}📂 Categoría sugerida: *{}*\n\n¿Es correcta esta categorización?",
        confidence * 100.0,
        expense_lines(tx),
        escape_markdown(&tx.categoria)
    )
}

pub fn match_message(income: &Transaction, expense: &Transaction, auto: bool) -> String {
    let header = if auto {
        "🔗 *Reembolso emparejado automáticamente*"
    } else {
        "🔗 *Reembolso emparejado*"
    };
    format!(
        "{header}\n\n💵 Ingreso: {} ({} CLP)\n💸 Gasto: {} ({} CLP)\n👥 {}: {} CLP\n✅ Liquidado",
        escape_markdown(&income.descripcion),
        income.monto_clp,
        escape_markdown(&expense.descripcion),
        expense.monto_clp,
        escape_markdown(&expense.compartido_con),
        expense.monto_tercero,
    )
}

/// Two buttons per row. Options whose callback payload would exceed the
/// Telegram limit are left out.
pub fn category_keyboard(id: &str, options: &[String]) -> Keyboard {
    let buttons: Vec<Button> = options
        .iter()
        .filter_map(|categoria| {
            let data = format!("cat:{id}:{categoria}");
            if data.len() > MAX_CALLBACK_BYTES {
                tracing::debug!(categoria = %categoria, "Category too long for a callback button");
                return None;
            }
            Some(Button::new(capitalize(categoria), data))
        })
        .collect();
    buttons.chunks(2).map(<[Button]>::to_vec).collect()
}

pub fn share_keyboard(id: &str) -> Keyboard {
    vec![
        vec![
            Button::new("❌ No compartido", format!("share:{id}:no")),
            Button::new("👥 50/50", format!("share:{id}:50")),
        ],
        vec![Button::new("🧑‍🤝‍🧑 Otro %", format!("share:{id}:custom"))],
    ]
}

pub fn confirm_keyboard(id: &str) -> Keyboard {
    vec![vec![
        Button::new("✅ Correcto", format!("confirm:{id}:yes")),
        Button::new("❌ Cambiar", format!("confirm:{id}:no")),
    ]]
}

fn capitalize(s: &str) -> String {
    let mut chars = s.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}

use regex::Regex;
use rust_decimal::Decimal;
use std::str::FromStr;
use std::sync::OnceLock;
use thiserror::Error;

use gastos_core::Money;

/// Default third-party share when the operator names a person without a
/// percentage.
pub const DEFAULT_SHARE_PCT: i64 = 50;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShareChoice {
    No,
    Half,
    Custom,
}

#[derive(Debug, Clone, PartialEq)]
pub enum OperatorCommand {
    Categorize { id: String, categoria: String },
    Share { id: String, choice: ShareChoice },
    Confirm { id: String, yes: bool },
    ShareWith { id: String, name: String, pct: Decimal },
    Income {
        amount: Money,
        descripcion: String,
        contraparte: Option<String>,
    },
    Help,
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum CommandError {
    #[error("Formato incorrecto. Usa: `{0}`")]
    Usage(&'static str),
    #[error("El monto debe ser un número mayor a 0")]
    InvalidAmount,
    #[error("El porcentaje debe estar entre 0 y 100")]
    InvalidPercentage,
    #[error("Falta el nombre de la persona")]
    MissingName,
}

pub const SHARE_USAGE: &str = "id <ID> con <Nombre> [% <porcentaje>]";
pub const INCOME_USAGE: &str = "ingreso <monto> <descripcion> [de <persona>]";

fn share_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?i)^id\s+(\S+)\s+con\s+(.*?)(?:\s*%\s*(\S+))?\s*$").expect("invalid regex")
    })
}

fn income_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?i)^ingreso\s+(\S+)\s+(.+)$").expect("invalid regex"))
}

impl OperatorCommand {
    /// Inline-keyboard payloads: `cat:<id>:<categoria>`,
    /// `share:<id>:<no|50|custom>`, `confirm:<id>:<yes|no>`.
    pub fn parse_callback(data: &str) -> Option<OperatorCommand> {
        let mut parts = data.splitn(3, ':');
        let (kind, id, value) = (parts.next()?, parts.next()?, parts.next()?);
        if id.is_empty() || value.is_empty() {
            return None;
        }
        let id = id.to_string();
        match kind {
            "cat" => Some(OperatorCommand::Categorize {
                id,
                categoria: value.to_string(),
            }),
            "share" => {
                let choice = match value {
                    "no" => ShareChoice::No,
                    "50" => ShareChoice::Half,
                    "custom" => ShareChoice::Custom,
                    _ => return None,
                };
                Some(OperatorCommand::Share { id, choice })
            }
            "confirm" => match value {
                "yes" => Some(OperatorCommand::Confirm { id, yes: true }),
                "no" => Some(OperatorCommand::Confirm { id, yes: false }),
                _ => None,
            },
            _ => None,
        }
    }

    /// Free-text chat messages. `Ok(None)` means the text is not a command.
    pub fn parse_text(text: &str) -> Result<Option<OperatorCommand>, CommandError> {
        let text = text.trim();
        let lower = text.to_lowercase();

        if matches!(lower.as_str(), "/help" | "/ayuda" | "help" | "ayuda" | "/start") {
            return Ok(Some(OperatorCommand::Help));
        }

        if lower.starts_with("id ") {
            let caps = share_re()
                .captures(text)
                .ok_or(CommandError::Usage(SHARE_USAGE))?;
            let name = caps[2].trim();
            if name.is_empty() {
                return Err(CommandError::MissingName);
            }
            let pct = match caps.get(3) {
                Some(m) => Decimal::from_str(&m.as_str().replace(',', "."))
                    .map_err(|_| CommandError::InvalidPercentage)?,
                None => Decimal::from(DEFAULT_SHARE_PCT),
            };
            if pct <= Decimal::ZERO || pct > Decimal::ONE_HUNDRED {
                return Err(CommandError::InvalidPercentage);
            }
            return Ok(Some(OperatorCommand::ShareWith {
                id: caps[1].to_string(),
                name: name.to_string(),
                pct,
            }));
        }

        if lower == "ingreso" || lower.starts_with("ingreso ") {
            let caps = income_re()
                .captures(text)
                .ok_or(CommandError::Usage(INCOME_USAGE))?;
            let amount = parse_amount(&caps[1]).ok_or(CommandError::InvalidAmount)?;
            let rest = caps[2].trim();
            let (descripcion, contraparte) = match rest.rsplit_once(" de ") {
                Some((desc, who)) if !desc.trim().is_empty() && !who.trim().is_empty() => {
                    (desc.trim().to_string(), Some(who.trim().to_string()))
                }
                _ => (rest.to_string(), None),
            };
            return Ok(Some(OperatorCommand::Income {
                amount,
                descripcion,
                contraparte,
            }));
        }

        Ok(None)
    }
}

/// Accepts `50000`, `50.000`, `$50.000` and `1.234,5`. Dots followed by
/// exactly three digits are thousands separators.
pub fn parse_amount(raw: &str) -> Option<Money> {
    let cleaned = raw.trim().trim_start_matches('$').replace(' ', "");
    let (int_part, frac_part) = match cleaned.split_once(',') {
        Some((i, f)) => (i.to_string(), Some(f.to_string())),
        None => (cleaned.clone(), None),
    };

    let groups: Vec<&str> = int_part.split('.').collect();
    let int_digits = if groups.len() > 1 && groups[1..].iter().all(|g| g.len() == 3) {
        groups.concat()
    } else {
        int_part.clone()
    };

    let normalized = match frac_part {
        Some(f) => format!("{int_digits}.{f}"),
        None => int_digits,
    };
    let value = Decimal::from_str(&normalized).ok()?;
    (value > Decimal::ZERO).then(|| Money::from_decimal(value))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn callbacks() {
        assert_eq!(
            OperatorCommand::parse_callback("cat:abc-1:supermercado"),
            Some(OperatorCommand::Categorize {
                id: "abc-1".into(),
                categoria: "supermercado".into()
            })
        );
        assert_eq!(
            OperatorCommand::parse_callback("share:abc:custom"),
            Some(OperatorCommand::Share {
                id: "abc".into(),
                choice: ShareChoice::Custom
            })
        );
        assert_eq!(
            OperatorCommand::parse_callback("confirm:abc:no"),
            Some(OperatorCommand::Confirm { id: "abc".into(), yes: false })
        );
        assert_eq!(OperatorCommand::parse_callback("share:abc:70"), None);
        assert_eq!(OperatorCommand::parse_callback("cat::x"), None);
        assert_eq!(OperatorCommand::parse_callback("other"), None);
    }

    #[test]
    fn share_with_default_percentage() {
        assert_eq!(
            OperatorCommand::parse_text("id abc123 con Juan Pablo").unwrap(),
            Some(OperatorCommand::ShareWith {
                id: "abc123".into(),
                name: "Juan Pablo".into(),
                pct: Decimal::from(50)
            })
        );
    }

    #[test]
    fn share_with_custom_percentage() {
        assert_eq!(
            OperatorCommand::parse_text("id abc123 con María % 30").unwrap(),
            Some(OperatorCommand::ShareWith {
                id: "abc123".into(),
                name: "María".into(),
                pct: Decimal::from(30)
            })
        );
    }

    #[test]
    fn share_errors() {
        assert_eq!(
            OperatorCommand::parse_text("id abc123 Juan"),
            Err(CommandError::Usage(SHARE_USAGE))
        );
        assert_eq!(
            OperatorCommand::parse_text("id abc123 con % 30"),
            Err(CommandError::MissingName)
        );
        assert_eq!(
            OperatorCommand::parse_text("id abc123 con Ana % 130"),
            Err(CommandError::InvalidPercentage)
        );
    }

    #[test]
    fn income_with_counterpart() {
        assert_eq!(
            OperatorCommand::parse_text("ingreso 15.000 Reembolso cena de Juan").unwrap(),
            Some(OperatorCommand::Income {
                amount: Money::from_clp(15_000),
                descripcion: "Reembolso cena".into(),
                contraparte: Some("Juan".into())
            })
        );
    }

    #[test]
    fn income_without_counterpart() {
        assert_eq!(
            OperatorCommand::parse_text("ingreso $50000 Sueldo septiembre").unwrap(),
            Some(OperatorCommand::Income {
                amount: Money::from_clp(50_000),
                descripcion: "Sueldo septiembre".into(),
                contraparte: None
            })
        );
    }

    #[test]
    fn income_errors() {
        assert_eq!(
            OperatorCommand::parse_text("ingreso 5000"),
            Err(CommandError::Usage(INCOME_USAGE))
        );
        assert_eq!(
            OperatorCommand::parse_text("ingreso mil pesos"),
            Err(CommandError::InvalidAmount)
        );
        assert_eq!(
            OperatorCommand::parse_text("ingreso 0 nada"),
            Err(CommandError::InvalidAmount)
        );
    }

    #[test]
    fn help_and_plain_text() {
        assert_eq!(OperatorCommand::parse_text("/ayuda").unwrap(), Some(OperatorCommand::Help));
        assert_eq!(OperatorCommand::parse_text("hola").unwrap(), None);
    }

    #[test]
    fn amounts() {
        assert_eq!(parse_amount("1.234.567"), Some(Money::from_clp(1_234_567)));
        assert_eq!(parse_amount("12.5"), Some(Money::from_decimal(Decimal::new(125, 1))));
        assert_eq!(parse_amount("1.234,5"), Some(Money::from_decimal(Decimal::new(12345, 1))));
        assert_eq!(parse_amount("-5"), None);
        assert_eq!(parse_amount("abc"), None);
    }
}

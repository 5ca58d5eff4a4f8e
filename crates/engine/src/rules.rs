use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::normalize::normalize_text;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KeywordRule {
    pub categoria: String,
    #[serde(default)]
    pub keywords: Vec<String>,
    #[serde(default)]
    pub subcategoria: String,
}

impl KeywordRule {
    pub fn new(categoria: &str, keywords: &[&str], subcategoria: &str) -> Self {
        KeywordRule {
            categoria: categoria.to_string(),
            keywords: keywords.iter().map(|k| k.to_string()).collect(),
            subcategoria: subcategoria.to_string(),
        }
    }
}

/// Rules file layout:
///
/// ```toml
/// [[rule]]
/// categoria = "transporte"
/// keywords = ["uber", "metro"]
/// subcategoria = "transporte_publico"
/// ```
#[derive(Debug, Deserialize)]
struct RulesFile {
    #[serde(default, rename = "rule")]
    rules: Vec<KeywordRule>,
}

/// Internal pairing of a rule with its keywords already normalized.
struct CompiledRule {
    rule: KeywordRule,
    normalized_keywords: Vec<String>,
}

/// Keyword rules evaluated in definition order; the first rule with a
/// keyword contained in the description wins.
pub struct KeywordRuleSet {
    rules: Vec<CompiledRule>,
}

impl KeywordRuleSet {
    pub fn new(rules: Vec<KeywordRule>) -> Self {
        let rules = rules
            .into_iter()
            .filter(|rule| !rule.categoria.trim().is_empty())
            .map(|rule| {
                let normalized_keywords = rule
                    .keywords
                    .iter()
                    .map(|k| normalize_text(k))
                    .filter(|k| !k.is_empty())
                    .collect();
                CompiledRule {
                    rule,
                    normalized_keywords,
                }
            })
            .collect();
        Self { rules }
    }

    /// Built-in rules used when no rules file is configured.
    pub fn defaults() -> Self {
        Self::new(vec![
            KeywordRule::new(
                "transporte",
                &["uber", "taxi", "metro", "bus", "transantiago", "bip"],
                "transporte_publico",
            ),
            KeywordRule::new(
                "alimentacion",
                &["restaurant", "comida", "delivery", "rappi", "pedidos", "mcdonalds", "burger"],
                "restaurantes",
            ),
            KeywordRule::new(
                "supermercado",
                &["jumbo", "lider", "santa isabel", "tottus", "unimarc"],
                "supermercado",
            ),
            KeywordRule::new(
                "combustible",
                &["copec", "shell", "petrobras", "esso", "combustible"],
                "gasolina",
            ),
            KeywordRule::new(
                "servicios",
                &["netflix", "spotify", "internet", "telefono", "luz", "agua", "gas"],
                "suscripciones",
            ),
        ])
    }

    pub fn from_toml(toml_content: &str) -> Result<Self, ConfigError> {
        let file: RulesFile = toml::from_str(toml_content)?;
        Ok(Self::new(file.rules))
    }

    pub fn load(path: &std::path::Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml(&content)
    }

    /// Expects an already-normalized description.
    pub fn find_match(&self, normalized: &str) -> Option<&KeywordRule> {
        self.rules
            .iter()
            .find(|cr| Self::rule_matches(cr, normalized))
            .map(|cr| &cr.rule)
    }

    /// Every category with at least one keyword hit, in rule order.
    pub fn matching_categories<'a>(&'a self, normalized: &str) -> Vec<&'a str> {
        self.rules
            .iter()
            .filter(|cr| Self::rule_matches(cr, normalized))
            .map(|cr| cr.rule.categoria.as_str())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    fn rule_matches(cr: &CompiledRule, normalized: &str) -> bool {
        cr.normalized_keywords
            .iter()
            .any(|k| normalized.contains(k.as_str()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keyword_match_uses_normalized_text() {
        let rules = KeywordRuleSet::new(vec![KeywordRule::new("cafe", &["Café"], "barista")]);
        let rule = rules.find_match(&normalize_text("CAFE ALTO")).unwrap();
        assert_eq!(rule.categoria, "cafe");
        assert_eq!(rule.subcategoria, "barista");
    }

    #[test]
    fn definition_order_wins() {
        let rules = KeywordRuleSet::new(vec![
            KeywordRule::new("transporte", &["uber"], ""),
            KeywordRule::new("alimentacion", &["uber eats"], ""),
        ]);
        assert_eq!(rules.find_match("uber eats").unwrap().categoria, "transporte");
    }

    #[test]
    fn no_match_returns_none() {
        assert!(KeywordRuleSet::defaults().find_match("ferreteria sodimac").is_none());
    }

    #[test]
    fn blank_keywords_never_match() {
        let rules = KeywordRuleSet::new(vec![KeywordRule::new("x", &["", " !! "], "")]);
        assert!(rules.find_match("anything").is_none());
    }

    #[test]
    fn defaults_cover_common_merchants() {
        let rules = KeywordRuleSet::defaults();
        assert_eq!(rules.len(), 5);
        assert_eq!(rules.find_match("copec ruta 68").unwrap().categoria, "combustible");
        assert_eq!(
            rules.find_match("supermercado santa isabel").unwrap().subcategoria,
            "supermercado"
        );
    }

    #[test]
    fn parses_toml_rules_in_order() {
        let toml = r#"
            [[rule]]
            categoria = "mascotas"
            keywords = ["veterinaria", "petco"]
            subcategoria = "cuidado"

            [[rule]]
            categoria = "salud"
            keywords = ["farmacia", "cruz verde"]
        "#;
        let rules = KeywordRuleSet::from_toml(toml).unwrap();
        assert_eq!(rules.len(), 2);
        assert_eq!(rules.find_match("farmacia cruz verde").unwrap().categoria, "salud");
        assert_eq!(rules.find_match("farmacia cruz verde").unwrap().subcategoria, "");
    }

    #[test]
    fn malformed_toml_is_an_error() {
        assert!(KeywordRuleSet::from_toml("[[rule]]\ncategoria = ").is_err());
    }

    #[test]
    fn matching_categories_lists_all_hits() {
        let rules = KeywordRuleSet::defaults();
        assert_eq!(
            rules.matching_categories("uber eats delivery"),
            vec!["transporte", "alimentacion"]
        );
    }
}

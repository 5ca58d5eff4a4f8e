use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError, RwLock};

use gastos_core::{Estado, Transaction};

use crate::classifier::{Classifier, NaiveBayesModel};
use crate::error::ConfigError;
use crate::merchants::{persist_alias, MerchantCategory, MerchantMap};
use crate::normalize::normalize_text;
use crate::rules::KeywordRuleSet;

pub const DEFAULT_THRESHOLD: f64 = 0.8;
pub const EXACT_MERCHANT_CONFIDENCE: f64 = 1.0;
pub const PARTIAL_MERCHANT_CONFIDENCE: f64 = 0.9;
pub const RULE_CONFIDENCE: f64 = 0.8;

/// Offered to the operator after keyword hits when nothing matched well.
pub const COMMON_CATEGORIES: &[&str] = &[
    "alimentacion",
    "transporte",
    "supermercado",
    "combustible",
    "servicios",
    "salud",
    "entretenimiento",
    "ropa",
    "hogar",
    "educacion",
    "deportes",
    "tecnologia",
    "comercio_electronico",
    "viajes",
    "otros",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchSource {
    Manual,
    MerchantExact,
    MerchantPartial,
    KeywordRule,
    Model,
    None,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Categorization {
    pub categoria: String,
    pub subcategoria: String,
    pub estado: Estado,
    pub confidence: f64,
    pub source: MatchSource,
}

impl Categorization {
    /// Operator-supplied category. Always final.
    pub fn manual(categoria: &str, subcategoria: &str) -> Self {
        Categorization {
            categoria: categoria.trim().to_string(),
            subcategoria: subcategoria.trim().to_string(),
            estado: Estado::Categorizado,
            confidence: 1.0,
            source: MatchSource::Manual,
        }
    }

    pub fn unmatched() -> Self {
        Categorization {
            categoria: String::new(),
            subcategoria: String::new(),
            estado: Estado::Pendiente,
            confidence: 0.0,
            source: MatchSource::None,
        }
    }

    pub fn is_match(&self) -> bool {
        self.source != MatchSource::None
    }

    pub fn apply_to(&self, tx: &mut Transaction) {
        tx.categoria = self.categoria.clone();
        tx.subcategoria = self.subcategoria.clone();
        tx.estado = self.estado;
        tx.ml_confidence = self.confidence;
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CategorizerConfig {
    pub threshold: f64,
    pub merchant_map: Option<PathBuf>,
    pub rules: Option<PathBuf>,
    pub model: Option<PathBuf>,
}

impl Default for CategorizerConfig {
    fn default() -> Self {
        CategorizerConfig {
            threshold: DEFAULT_THRESHOLD,
            merchant_map: None,
            rules: None,
            model: None,
        }
    }
}

/// Merchant map, then keyword rules, then the classifier. The merchant map
/// is swapped wholesale on alias insertion so readers never see a partial
/// update.
pub struct Categorizer {
    threshold: f64,
    merchants: RwLock<Arc<MerchantMap>>,
    rules: KeywordRuleSet,
    classifier: Option<Box<dyn Classifier>>,
    merchant_path: Option<PathBuf>,
    /// Held across the in-memory swap and the CSV rewrite so the file and
    /// the map see alias insertions in the same order.
    persist: Mutex<()>,
}

impl Categorizer {
    pub fn new(merchants: MerchantMap, rules: KeywordRuleSet, threshold: f64) -> Self {
        Categorizer {
            threshold,
            merchants: RwLock::new(Arc::new(merchants)),
            rules,
            classifier: None,
            merchant_path: None,
            persist: Mutex::new(()),
        }
    }

    pub fn with_classifier(mut self, classifier: Box<dyn Classifier>) -> Self {
        self.classifier = Some(classifier);
        self
    }

    /// Where [`Categorizer::add_merchant_alias`] persists new aliases.
    pub fn with_merchant_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.merchant_path = Some(path.into());
        self
    }

    /// Never fails: unreadable sources are logged and replaced by an empty
    /// map, an empty rule set, or no classifier. The default rules apply only
    /// when no rules file is configured or present.
    pub fn from_config(config: &CategorizerConfig) -> Self {
        let merchants = match &config.merchant_map {
            Some(path) if path.exists() => load_or_warn("merchant map", path, MerchantMap::load)
                .unwrap_or_default(),
            _ => MerchantMap::new(),
        };

        let rules = match &config.rules {
            Some(path) if path.exists() => load_or_warn("rules", path, KeywordRuleSet::load)
                .unwrap_or_else(|| KeywordRuleSet::new(Vec::new())),
            _ => KeywordRuleSet::defaults(),
        };

        let classifier = config.model.as_deref().and_then(|path| {
            load_or_warn("model", path, |p| {
                NaiveBayesModel::load(p).map_err(ConfigError::from)
            })
        });

        tracing::info!(
            merchants = merchants.len(),
            rules = rules.len(),
            model = classifier.is_some(),
            "Categorizer loaded"
        );

        let mut categorizer = Categorizer::new(merchants, rules, config.threshold);
        if let Some(model) = classifier {
            categorizer = categorizer.with_classifier(Box::new(model));
        }
        if let Some(path) = &config.merchant_map {
            categorizer = categorizer.with_merchant_path(path.clone());
        }
        categorizer
    }

    pub fn threshold(&self) -> f64 {
        self.threshold
    }

    /// Current merchant map. The snapshot stays valid after later alias
    /// insertions.
    pub fn merchants(&self) -> Arc<MerchantMap> {
        self.merchants
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn categorize_one(&self, description: &str) -> Categorization {
        let normalized = normalize_text(description);
        if normalized.is_empty() {
            return Categorization::unmatched();
        }

        let merchants = self.merchants();
        if let Some(found) = merchants.get_exact(&normalized) {
            return self.matched(found, EXACT_MERCHANT_CONFIDENCE, MatchSource::MerchantExact);
        }
        if let Some((key, found)) = merchants.find_partial(&normalized) {
            tracing::debug!(merchant = key, "Partial merchant match");
            return self.matched(found, PARTIAL_MERCHANT_CONFIDENCE, MatchSource::MerchantPartial);
        }

        if let Some(rule) = self.rules.find_match(&normalized) {
            return self.finish(
                &rule.categoria,
                &rule.subcategoria,
                RULE_CONFIDENCE,
                MatchSource::KeywordRule,
            );
        }

        if let Some(classifier) = &self.classifier {
            match classifier.predict(description) {
                Ok(prediction) if prediction.confidence >= self.threshold => {
                    let (categoria, subcategoria) = prediction.split_label();
                    if !categoria.is_empty() {
                        return self.finish(
                            &categoria,
                            &subcategoria,
                            prediction.confidence,
                            MatchSource::Model,
                        );
                    }
                }
                Ok(prediction) => {
                    tracing::debug!(
                        label = %prediction.label,
                        confidence = prediction.confidence,
                        "Model prediction below threshold"
                    );
                }
                Err(e) => tracing::warn!("Model prediction failed: {e}"),
            }
        }

        Categorization::unmatched()
    }

    /// Inserts (or overwrites) a merchant alias in memory, then persists it
    /// when a merchant map path is configured. A persistence error leaves
    /// the in-memory alias in place.
    pub fn add_merchant_alias(
        &self,
        merchant: &str,
        categoria: &str,
        subcategoria: &str,
    ) -> Result<Option<String>, ConfigError> {
        let category = MerchantCategory {
            categoria: categoria.trim().to_string(),
            subcategoria: subcategoria.trim().to_string(),
        };

        let _persist = self.persist.lock().unwrap_or_else(PoisonError::into_inner);
        let key = {
            let mut guard = self
                .merchants
                .write()
                .unwrap_or_else(PoisonError::into_inner);
            let mut next = MerchantMap::clone(&guard);
            let key = next.insert(merchant, category.clone());
            if key.is_some() {
                *guard = Arc::new(next);
            }
            key
        };

        let Some(key) = key else {
            return Ok(None);
        };
        tracing::info!(merchant = %key, categoria = %category.categoria, "Merchant alias added");

        if let Some(path) = &self.merchant_path {
            persist_alias(path, merchant, &category)?;
        }
        Ok(Some(key))
    }

    /// Keyword-rule hits for the description first, then the common
    /// categories, without duplicates.
    pub fn category_suggestions(&self, description: &str, limit: usize) -> Vec<String> {
        let normalized = normalize_text(description);
        let mut out: Vec<String> = Vec::with_capacity(limit);
        let hits = if normalized.is_empty() {
            Vec::new()
        } else {
            self.rules.matching_categories(&normalized)
        };
        for categoria in hits.into_iter().chain(COMMON_CATEGORIES.iter().copied()) {
            if out.len() >= limit {
                break;
            }
            if !out.iter().any(|c| c == categoria) {
                out.push(categoria.to_string());
            }
        }
        out
    }

    fn matched(&self, found: &MerchantCategory, confidence: f64, source: MatchSource) -> Categorization {
        self.finish(&found.categoria, &found.subcategoria, confidence, source)
    }

    fn finish(
        &self,
        categoria: &str,
        subcategoria: &str,
        confidence: f64,
        source: MatchSource,
    ) -> Categorization {
        // An exact merchant hit is final whatever the configured threshold.
        let estado = if confidence >= self.threshold || source == MatchSource::MerchantExact {
            Estado::Categorizado
        } else {
            Estado::Pendiente
        };
        Categorization {
            categoria: categoria.to_string(),
            subcategoria: subcategoria.to_string(),
            estado,
            confidence,
            source,
        }
    }
}

fn load_or_warn<T>(
    what: &str,
    path: &Path,
    load: impl FnOnce(&Path) -> Result<T, ConfigError>,
) -> Option<T> {
    match load(path) {
        Ok(value) => Some(value),
        Err(e) => {
            tracing::warn!("Failed to load {what} from {}: {e}", path.display());
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classifier::MockClassifier;
    use crate::rules::KeywordRule;

    fn merchants(entries: &[(&str, &str, &str)]) -> MerchantMap {
        let mut map = MerchantMap::new();
        for (m, c, s) in entries {
            map.insert(
                m,
                MerchantCategory {
                    categoria: c.to_string(),
                    subcategoria: s.to_string(),
                },
            );
        }
        map
    }

    fn categorizer() -> Categorizer {
        Categorizer::new(
            merchants(&[("Jumbo Costanera", "supermercado", "grandes"), ("copec", "combustible", "")]),
            KeywordRuleSet::defaults(),
            DEFAULT_THRESHOLD,
        )
    }

    #[test]
    fn empty_description_is_unmatched() {
        let c = categorizer();
        for input in ["", "   ", "\t\n", "!!!"] {
            let result = c.categorize_one(input);
            assert_eq!(result, Categorization::unmatched(), "input: {input:?}");
        }
    }

    #[test]
    fn exact_merchant_match_is_final() {
        let c = categorizer();
        let result = c.categorize_one("JUMBO costanera!");
        assert_eq!(result.categoria, "supermercado");
        assert_eq!(result.subcategoria, "grandes");
        assert_eq!(result.confidence, 1.0);
        assert_eq!(result.estado, Estado::Categorizado);
        assert_eq!(result.source, MatchSource::MerchantExact);
    }

    #[test]
    fn exact_merchant_match_ignores_high_threshold() {
        let c = Categorizer::new(
            merchants(&[("copec", "combustible", "")]),
            KeywordRuleSet::defaults(),
            1.5,
        );
        assert_eq!(c.categorize_one("Copec").estado, Estado::Categorizado);
        assert_eq!(c.categorize_one("copec ruta 5").estado, Estado::Pendiente);
    }

    #[test]
    fn partial_merchant_match_beats_rules() {
        let c = categorizer();
        // "copec" is also a keyword rule, merchant map wins.
        let result = c.categorize_one("COPEC LOS DOMINICOS");
        assert_eq!(result.confidence, 0.9);
        assert_eq!(result.source, MatchSource::MerchantPartial);
        assert_eq!(result.estado, Estado::Categorizado);
    }

    #[test]
    fn rule_match_when_no_merchant() {
        let c = categorizer();
        let result = c.categorize_one("UBER *TRIP");
        assert_eq!(result.categoria, "transporte");
        assert_eq!(result.subcategoria, "transporte_publico");
        assert_eq!(result.confidence, 0.8);
        assert_eq!(result.estado, Estado::Categorizado);
    }

    #[test]
    fn rules_are_checked_before_model() {
        let c = categorizer().with_classifier(Box::new(MockClassifier::new("salud|farmacia", 0.99)));
        assert_eq!(c.categorize_one("netflix.com").categoria, "servicios");
        let result = c.categorize_one("cruz verde");
        assert_eq!(result.categoria, "salud");
        assert_eq!(result.subcategoria, "farmacia");
        assert_eq!(result.source, MatchSource::Model);
    }

    #[test]
    fn model_below_threshold_is_no_match() {
        let c = categorizer().with_classifier(Box::new(MockClassifier::new("salud", 0.4)));
        assert_eq!(c.categorize_one("cruz verde"), Categorization::unmatched());
    }

    #[test]
    fn model_failure_is_no_match() {
        let c = categorizer().with_classifier(Box::new(MockClassifier::failing("boom")));
        assert_eq!(c.categorize_one("cruz verde"), Categorization::unmatched());
    }

    #[test]
    fn confidence_orders_by_strategy() {
        let c = Categorizer::new(
            merchants(&[("uber", "viajes", "")]),
            KeywordRuleSet::new(vec![KeywordRule::new("transporte", &["uber"], "")]),
            DEFAULT_THRESHOLD,
        )
        .with_classifier(Box::new(MockClassifier::new("otros", 0.85)));
        assert_eq!(c.categorize_one("uber").confidence, 1.0);
        assert_eq!(c.categorize_one("uber trip").confidence, 0.9);
    }

    #[test]
    fn alias_insertion_is_visible_and_snapshots_are_stable() {
        let c = categorizer();
        let before = c.merchants();
        let key = c.add_merchant_alias("Farmacia Ahumada", "salud", "farmacia").unwrap();
        assert_eq!(key.as_deref(), Some("farmacia ahumada"));
        assert_eq!(before.len(), 2);
        assert_eq!(c.merchants().len(), 3);
        assert_eq!(c.categorize_one("farmacia ahumada").confidence, 1.0);
    }

    #[test]
    fn alias_with_blank_merchant_is_ignored() {
        let c = categorizer();
        assert_eq!(c.add_merchant_alias("  ", "salud", "").unwrap(), None);
        assert_eq!(c.merchants().len(), 2);
    }

    #[test]
    fn alias_is_persisted_when_path_configured() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("merchants.csv");
        let c = categorizer().with_merchant_path(&path);
        c.add_merchant_alias("Lider Express", "supermercado", "").unwrap();
        c.add_merchant_alias("LIDER express", "hogar", "").unwrap();

        let reloaded = MerchantMap::load(&path).unwrap();
        assert_eq!(reloaded.len(), 1);
        assert_eq!(reloaded.get_exact("lider express").unwrap().categoria, "hogar");
    }

    #[test]
    fn concurrent_aliases_are_all_persisted() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("merchants.csv");
        let c = categorizer().with_merchant_path(&path);

        std::thread::scope(|scope| {
            for i in 0..32 {
                let c = &c;
                scope.spawn(move || {
                    c.add_merchant_alias(&format!("tienda{i}"), "hogar", "").unwrap();
                });
            }
        });

        assert_eq!(c.merchants().len(), 34);
        let reloaded = MerchantMap::load(&path).unwrap();
        assert_eq!(reloaded.len(), 32);
        assert!((0..32).all(|i| reloaded.get_exact(&format!("tienda{i}")).is_some()));
    }

    #[test]
    fn from_config_degrades_on_bad_sources() {
        let dir = tempfile::tempdir().unwrap();
        let rules = dir.path().join("rules.toml");
        let model = dir.path().join("model.json");
        std::fs::write(&rules, "[[rule]\nbroken").unwrap();
        std::fs::write(&model, "{}").unwrap();

        let c = Categorizer::from_config(&CategorizerConfig {
            rules: Some(rules),
            model: Some(model),
            merchant_map: Some(dir.path().join("missing.csv")),
            ..CategorizerConfig::default()
        });
        assert!(c.merchants().is_empty());
        assert_eq!(c.categorize_one("uber trip"), Categorization::unmatched());
    }

    #[test]
    fn from_config_uses_default_rules_without_a_rules_file() {
        let dir = tempfile::tempdir().unwrap();
        let c = Categorizer::from_config(&CategorizerConfig {
            rules: Some(dir.path().join("missing.toml")),
            ..CategorizerConfig::default()
        });
        assert_eq!(c.categorize_one("metro baquedano").categoria, "transporte");
    }

    #[test]
    fn suggestions_put_keyword_hits_first() {
        let c = categorizer();
        let suggestions = c.category_suggestions("gas natural", 5);
        assert_eq!(suggestions[0], "servicios");
        assert_eq!(suggestions.len(), 5);
        assert_eq!(suggestions.iter().filter(|s| *s == "servicios").count(), 1);
        assert_eq!(c.category_suggestions("", 3), vec!["alimentacion", "transporte", "supermercado"]);
    }

    #[test]
    fn manual_override_is_always_final() {
        let manual = Categorization::manual(" hogar ", "");
        assert_eq!(manual.categoria, "hogar");
        assert_eq!(manual.confidence, 1.0);
        assert_eq!(manual.estado, Estado::Categorizado);
    }
}

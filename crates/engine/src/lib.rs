pub mod categorizer;
pub mod classifier;
pub mod commands;
pub mod error;
pub mod intake;
pub mod merchants;
pub mod normalize;
pub mod recurring;
pub mod reconcile;
pub mod rules;

pub use categorizer::{Categorization, Categorizer, CategorizerConfig, MatchSource};
pub use classifier::{Classifier, ClassifierError, MockClassifier, NaiveBayesModel, Prediction};
pub use commands::{CommandError, OperatorCommand, ShareChoice};
pub use error::ConfigError;
pub use intake::{ExpenseOutcome, FollowUp, IncomeOutcome, NewExpense, NewIncome};
pub use merchants::{MerchantCategory, MerchantMap};
pub use normalize::normalize_text;
pub use recurring::{generate_due, GenerationReport};
pub use reconcile::{
    mark_as_settled, reconciliation_stats, suggest_manual_matches, try_auto_match,
    within_tolerance, AutoMatcher, MatchSuggestion, ReconciliationStats, Settlement,
};
pub use rules::{KeywordRule, KeywordRuleSet};

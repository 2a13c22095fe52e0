//! Failure classification for the retry driver.
//!
//! Maps a callback error to retryable / non-retryable. Rules are consulted
//! in insertion order, so callers register specific rules before broad ones
//! (most-specific-first). An unmatched error falls through to the default
//! rule, which is retryable.

use std::sync::Arc;

/// Whether a classified failure may be retried.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Classification {
    /// Transient; another attempt may succeed.
    Retryable,
    /// Permanent; retrying cannot help (bad arguments, auth failures, 4xx).
    NonRetryable,
}

impl Classification {
    /// True for the Retryable variant.
    pub fn is_retryable(self) -> bool {
        matches!(self, Classification::Retryable)
    }
}

struct Rule<E> {
    matches: Arc<dyn Fn(&E) -> bool + Send + Sync>,
    class: Classification,
}

impl<E> Clone for Rule<E> {
    fn clone(&self) -> Self {
        Self { matches: self.matches.clone(), class: self.class }
    }
}

/// Ordered classification table.
///
/// The default (empty) classifier treats every failure as retryable.
pub struct Classifier<E> {
    rules: Vec<Rule<E>>,
    fallback: Classification,
}

impl<E> Clone for Classifier<E> {
    fn clone(&self) -> Self {
        Self { rules: self.rules.clone(), fallback: self.fallback }
    }
}

impl<E> std::fmt::Debug for Classifier<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Classifier")
            .field("rules", &self.rules.len())
            .field("fallback", &self.fallback)
            .finish()
    }
}

impl<E> Classifier<E> {
    /// Classifier with no rules; everything is retryable.
    pub fn new() -> Self {
        Self { rules: Vec::new(), fallback: Classification::Retryable }
    }

    /// Replace the fallback classification applied when no rule matches.
    pub fn with_fallback(mut self, fallback: Classification) -> Self {
        self.fallback = fallback;
        self
    }

    /// Append a rule. Earlier rules win, so register the most specific first.
    pub fn rule<F>(mut self, matches: F, class: Classification) -> Self
    where
        F: Fn(&E) -> bool + Send + Sync + 'static,
    {
        self.rules.push(Rule { matches: Arc::new(matches), class });
        self
    }

    /// Shorthand for a non-retryable rule.
    pub fn non_retryable<F>(self, matches: F) -> Self
    where
        F: Fn(&E) -> bool + Send + Sync + 'static,
    {
        self.rule(matches, Classification::NonRetryable)
    }

    /// Shorthand for a retryable rule.
    pub fn retryable<F>(self, matches: F) -> Self
    where
        F: Fn(&E) -> bool + Send + Sync + 'static,
    {
        self.rule(matches, Classification::Retryable)
    }

    /// Classify a failure: first matching rule wins, else the fallback.
    pub fn classify(&self, error: &E) -> Classification {
        for rule in &self.rules {
            if (rule.matches)(error) {
                return rule.class;
            }
        }
        self.fallback
    }
}

impl<E> Default for Classifier<E> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Clone, PartialEq, Eq)]
    enum TestError {
        BadRequest,
        Unauthorized,
        ServerError(u16),
        ConnectionReset,
    }

    fn classifier() -> Classifier<TestError> {
        Classifier::new()
            .non_retryable(|e| matches!(e, TestError::BadRequest | TestError::Unauthorized))
            .retryable(|e| matches!(e, TestError::ServerError(code) if *code >= 500))
    }

    #[test]
    fn empty_classifier_defaults_to_retryable() {
        let c: Classifier<TestError> = Classifier::new();
        assert_eq!(c.classify(&TestError::BadRequest), Classification::Retryable);
    }

    #[test]
    fn matched_rules_override_fallback() {
        let c = classifier();
        assert_eq!(c.classify(&TestError::BadRequest), Classification::NonRetryable);
        assert_eq!(c.classify(&TestError::Unauthorized), Classification::NonRetryable);
        assert_eq!(c.classify(&TestError::ServerError(503)), Classification::Retryable);
    }

    #[test]
    fn unmatched_errors_use_fallback() {
        let c = classifier();
        assert_eq!(c.classify(&TestError::ConnectionReset), Classification::Retryable);
    }

    #[test]
    fn first_matching_rule_wins() {
        // Specific rule before a broad overlapping one: the specific wins.
        let c = Classifier::new()
            .non_retryable(|e| matches!(e, TestError::ServerError(501)))
            .retryable(|e| matches!(e, TestError::ServerError(_)));
        assert_eq!(c.classify(&TestError::ServerError(501)), Classification::NonRetryable);
        assert_eq!(c.classify(&TestError::ServerError(500)), Classification::Retryable);
    }

    #[test]
    fn fallback_can_be_flipped() {
        let c: Classifier<TestError> =
            Classifier::new().with_fallback(Classification::NonRetryable);
        assert_eq!(c.classify(&TestError::ConnectionReset), Classification::NonRetryable);
    }

    #[test]
    fn is_retryable_predicate() {
        assert!(Classification::Retryable.is_retryable());
        assert!(!Classification::NonRetryable.is_retryable());
    }
}

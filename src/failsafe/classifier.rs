//! Sorting caller errors into recorded failures and ignored errors

use std::error::Error as StdError;
use std::fmt;
use std::sync::Arc;

type Predicate = Arc<dyn Fn(&(dyn StdError + 'static)) -> bool + Send + Sync>;

/// How a caller's error affects the breaker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Classification {
    /// Counted as a failed call
    Recorded,
    /// Not counted at all; the half-open permit is handed back
    Ignored,
    /// Counted as a successful call
    Success,
}

/// Predicates deciding which errors count against a breaker.
///
/// - no predicates: every error is recorded
/// - an ignore predicate matches and no record predicate does: ignored
/// - a record predicate matches: recorded, even if an ignore predicate matches too
/// - record predicates exist but none match: the call counts as a success
#[derive(Clone, Default)]
pub struct ErrorClassifier {
    record: Vec<Predicate>,
    ignore: Vec<Predicate>,
}

impl ErrorClassifier {
    /// Classifier that records every error.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Record errors matching `predicate`.
    #[must_use]
    pub fn record_when(
        mut self,
        predicate: impl Fn(&(dyn StdError + 'static)) -> bool + Send + Sync + 'static,
    ) -> Self {
        self.record.push(Arc::new(predicate));
        self
    }

    /// Ignore errors matching `predicate`.
    #[must_use]
    pub fn ignore_when(
        mut self,
        predicate: impl Fn(&(dyn StdError + 'static)) -> bool + Send + Sync + 'static,
    ) -> Self {
        self.ignore.push(Arc::new(predicate));
        self
    }

    /// Record errors of concrete type `E`.
    #[must_use]
    pub fn record_type<E: StdError + 'static>(self) -> Self {
        self.record_when(|e| e.is::<E>())
    }

    /// Ignore errors of concrete type `E`.
    #[must_use]
    pub fn ignore_type<E: StdError + 'static>(self) -> Self {
        self.ignore_when(|e| e.is::<E>())
    }

    /// Decide how `error` counts.
    pub fn classify(&self, error: &(dyn StdError + 'static)) -> Classification {
        let recorded = self.record.iter().any(|p| p(error));
        if recorded {
            return Classification::Recorded;
        }
        if self.ignore.iter().any(|p| p(error)) {
            return Classification::Ignored;
        }
        if self.record.is_empty() {
            Classification::Recorded
        } else {
            Classification::Success
        }
    }
}

impl fmt::Debug for ErrorClassifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ErrorClassifier")
            .field("record", &self.record.len())
            .field("ignore", &self.ignore.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::io;

    use super::*;

    #[derive(Debug, thiserror::Error)]
    #[error("business rule violated")]
    struct BusinessError;

    fn not_found(e: &(dyn StdError + 'static)) -> bool {
        e.downcast_ref::<io::Error>()
            .is_some_and(|e| e.kind() == io::ErrorKind::NotFound)
    }

    #[test]
    fn everything_is_recorded_by_default() {
        let classifier = ErrorClassifier::new();
        assert_eq!(classifier.classify(&BusinessError), Classification::Recorded);
        assert_eq!(
            classifier.classify(&io::Error::other("x")),
            Classification::Recorded
        );
    }

    #[test]
    fn ignored_type_is_ignored() {
        let classifier = ErrorClassifier::new().ignore_type::<BusinessError>();
        assert_eq!(classifier.classify(&BusinessError), Classification::Ignored);
        assert_eq!(
            classifier.classify(&io::Error::other("x")),
            Classification::Recorded
        );
    }

    #[test]
    fn record_wins_over_ignore() {
        // GIVEN: both predicates match io errors
        let classifier = ErrorClassifier::new()
            .record_type::<io::Error>()
            .ignore_when(not_found);
        // THEN: the ambiguous error is recorded
        let err = io::Error::from(io::ErrorKind::NotFound);
        assert_eq!(classifier.classify(&err), Classification::Recorded);
    }

    #[test]
    fn unmatched_error_counts_as_success_with_explicit_record_list() {
        let classifier = ErrorClassifier::new().record_type::<io::Error>();
        assert_eq!(classifier.classify(&BusinessError), Classification::Success);
    }
}

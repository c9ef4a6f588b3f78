//! Conflict detection and the policies that resolve conflicts.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, RwLock};

use crate::event::{ChangeEvent, ChangeOperation, Row, TableRef};
use crate::Result;

/// What to do with an incoming change whose target row was modified
/// independently.
#[derive(Debug, Clone, PartialEq)]
pub enum Resolution {
    /// Write the source change as is.
    ApplySource,
    /// Discard the source change.
    KeepTarget,
    /// Write this row instead.
    Merge(Row),
}

/// A detected conflict handed to a resolver.
#[derive(Debug)]
pub struct Conflict<'a> {
    pub event: &'a ChangeEvent,
    /// Target table
    pub table: &'a TableRef,
    /// Key of the target row
    pub key: &'a Row,
    /// Source row mapped onto target columns; `None` for deletes
    pub source_row: Option<&'a Row>,
    /// Current target row; `None` when it does not exist
    pub target_row: Option<&'a Row>,
    pub reason: &'a str,
}

/// Custom conflict policy. Returning an error counts as an apply failure.
pub trait ConflictResolver: Send + Sync {
    fn resolve(&self, conflict: &Conflict<'_>) -> Result<Resolution>;
}

impl<F> ConflictResolver for F
where
    F: Fn(&Conflict<'_>) -> Result<Resolution> + Send + Sync,
{
    fn resolve(&self, conflict: &Conflict<'_>) -> Result<Resolution> {
        self(conflict)
    }
}

/// Named custom resolvers, looked up by subscriptions at activation.
#[derive(Default, Clone)]
pub struct ResolverRegistry {
    resolvers: Arc<RwLock<HashMap<String, Arc<dyn ConflictResolver>>>>,
}

impl ResolverRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, name: impl Into<String>, resolver: Arc<dyn ConflictResolver>) {
        self.resolvers
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(name.into(), resolver);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn ConflictResolver>> {
        self.resolvers
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(name)
            .cloned()
    }
}

impl fmt::Debug for ResolverRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let resolvers = self.resolvers.read().unwrap_or_else(|e| e.into_inner());
        f.debug_list().entries(resolvers.keys()).finish()
    }
}

/// Whether `current` holds every column of `image` with the same value.
fn matches(current: &Row, image: &Row) -> bool {
    image
        .iter()
        .all(|(column, value)| current.get(column) == Some(value))
}

/// Compares the target row with what the source expects it to be.
///
/// `before` and `after` are mapped onto target columns. Returns the reason
/// when the target was changed by someone else. A target row that already
/// equals the after-image is a replay, not a conflict.
pub(crate) fn detect(
    op: ChangeOperation,
    before: Option<&Row>,
    after: Option<&Row>,
    current: Option<&Row>,
) -> Option<String> {
    match (op, current) {
        (ChangeOperation::Insert, None) => None,
        (ChangeOperation::Insert, Some(current)) => match after {
            Some(after) if matches(current, after) => None,
            _ => Some("row already exists with different values".to_string()),
        },
        (ChangeOperation::Update, None) => Some("row no longer exists".to_string()),
        (ChangeOperation::Update, Some(current)) => {
            if after.is_some_and(|after| matches(current, after)) {
                return None;
            }
            match before {
                Some(before) if !matches(current, before) => {
                    Some("row was modified since the last replicated value".to_string())
                }
                _ => None,
            }
        }
        // Already gone: a replayed delete.
        (ChangeOperation::Delete, None) => None,
        (ChangeOperation::Delete, Some(current)) => match before {
            Some(before) if !matches(current, before) => {
                Some("row was modified since the last replicated value".to_string())
            }
            _ => None,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn row(value: serde_json::Value) -> Row {
        value.as_object().cloned().unwrap()
    }

    #[test]
    fn test_insert_conflicts_only_on_different_row() {
        let after = row(json!({"id": 1, "name": "Alice"}));
        assert!(detect(ChangeOperation::Insert, None, Some(&after), None).is_none());
        assert!(detect(ChangeOperation::Insert, None, Some(&after), Some(&after)).is_none());

        let other = row(json!({"id": 1, "name": "Mallory"}));
        assert!(detect(ChangeOperation::Insert, None, Some(&after), Some(&other)).is_some());
    }

    #[test]
    fn test_update_compares_before_image() {
        let before = row(json!({"id": 1, "name": "Alice"}));
        let after = row(json!({"id": 1, "name": "Alicia"}));

        assert!(detect(ChangeOperation::Update, Some(&before), Some(&after), Some(&before)).is_none());
        // Replay of an update that was already applied
        assert!(detect(ChangeOperation::Update, Some(&before), Some(&after), Some(&after)).is_none());

        let edited = row(json!({"id": 1, "name": "Bob"}));
        assert!(detect(ChangeOperation::Update, Some(&before), Some(&after), Some(&edited)).is_some());
        assert!(detect(ChangeOperation::Update, Some(&before), Some(&after), None).is_some());
    }

    #[test]
    fn test_key_only_before_image() {
        let key = row(json!({"id": 1}));
        let edited = row(json!({"id": 1, "name": "Bob"}));
        assert!(detect(ChangeOperation::Delete, Some(&key), None, Some(&edited)).is_none());
        assert!(detect(ChangeOperation::Delete, Some(&key), None, None).is_none());
    }

    fn keep_target(_: &Conflict<'_>) -> Result<Resolution> {
        Ok(Resolution::KeepTarget)
    }

    #[test]
    fn test_function_resolver() {
        let registry = ResolverRegistry::new();
        registry.register("keep", Arc::new(keep_target));
        assert!(registry.get("keep").is_some());
        assert!(registry.get("missing").is_none());
    }
}

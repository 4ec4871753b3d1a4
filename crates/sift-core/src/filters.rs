//! Column filter state.
//!
//! A `Filters` value maps column names to the set of accepted values for
//! that column. A column with no entry is unconstrained. The invariant that
//! no key maps to an empty set is enforced on every mutation and on decode:
//! emptying a column's set removes the key.

use std::collections::{BTreeMap, BTreeSet};

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use serde::{Deserialize, Serialize};

use crate::error::ClientError;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Filters(BTreeMap<String, BTreeSet<String>>);

impl Filters {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Number of constrained columns.
    pub fn column_count(&self) -> usize {
        self.0.len()
    }

    pub fn columns(&self) -> impl Iterator<Item = &str> {
        self.0.keys().map(|k| k.as_str())
    }

    pub fn values(&self, column: &str) -> Option<&BTreeSet<String>> {
        self.0.get(column)
    }

    /// Add the value to the column's set if absent, remove it if present.
    /// Removing the last value removes the column key entirely.
    pub fn toggle(&mut self, column: &str, value: &str) {
        let set = self.0.entry(column.to_string()).or_default();
        if !set.remove(value) {
            set.insert(value.to_string());
        }
        if set.is_empty() {
            self.0.remove(column);
        }
    }

    /// Replace the column's full value list. An empty list removes the key,
    /// leaving the column unconstrained.
    pub fn set_values<I, S>(&mut self, column: &str, values: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let set: BTreeSet<String> = values.into_iter().map(Into::into).collect();
        if set.is_empty() {
            self.0.remove(column);
        } else {
            self.0.insert(column.to_string(), set);
        }
    }

    pub fn clear(&mut self) {
        self.0.clear();
    }

    /// Compact URL-safe encoding for deep links.
    pub fn encode(&self) -> String {
        let json = serde_json::to_vec(self).unwrap_or_default();
        URL_SAFE_NO_PAD.encode(json)
    }

    /// Decode a deep-link form produced by [`Filters::encode`]. Columns that
    /// decode to empty sets are dropped to restore the non-empty invariant.
    pub fn decode(encoded: &str) -> Result<Self, ClientError> {
        let bytes = URL_SAFE_NO_PAD
            .decode(encoded)
            .map_err(|e| ClientError::Validation(format!("Invalid filter encoding: {}", e)))?;
        let mut filters: Filters = serde_json::from_slice(&bytes)
            .map_err(|e| ClientError::Validation(format!("Invalid filter payload: {}", e)))?;
        filters.0.retain(|_, set| !set.is_empty());
        Ok(filters)
    }
}

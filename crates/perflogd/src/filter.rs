//! Feature selection and sample filtering
//!
//! Turns a raw subflow feature map into the sample that gets persisted.
//! Reserved columns carry identity or connection-state metadata and are never
//! persisted, not even when an explicit selection names them.

use crate::error::{PerflogError, Result};
use crate::types::FeatureMap;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

/// Feature names that never appear in a persisted sample
pub const RESERVED_COLUMNS: [&str; 3] = ["id", "tcpi_state", "tcpi_ca_state"];

/// Keyword selecting every non-reserved feature
pub const ALL_FEATURES: &str = "all";

/// Check if a feature name is a reserved column
#[inline]
pub fn is_reserved(name: &str) -> bool {
    RESERVED_COLUMNS.contains(&name)
}

/// Which features survive filtering; fixed for the lifetime of one run
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "SelectionRepr", into = "SelectionRepr")]
pub enum FeatureSelection {
    /// Every non-reserved feature
    All,
    /// Only the named features (must be non-empty)
    Only(BTreeSet<String>),
}

impl FeatureSelection {
    /// Build an explicit selection, rejecting an empty one
    pub fn only<I, S>(names: I) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let selection = FeatureSelection::Only(names.into_iter().map(Into::into).collect());
        selection.validate()?;
        Ok(selection)
    }

    /// Parse `"all"` or a comma-separated list of feature names
    pub fn parse(s: &str) -> Result<Self> {
        let s = s.trim();
        if s == ALL_FEATURES {
            return Ok(FeatureSelection::All);
        }
        Self::only(
            s.split(',')
                .map(str::trim)
                .filter(|name| !name.is_empty()),
        )
        .map_err(|_| {
            PerflogError::invalid_config(format!(
                "features must be \"{}\" or a non-empty list, got {:?}",
                ALL_FEATURES, s
            ))
        })
    }

    /// Reject an explicit selection with no names
    pub fn validate(&self) -> Result<()> {
        match self {
            FeatureSelection::Only(names) if names.is_empty() => Err(
                PerflogError::invalid_config("feature selection must not be empty"),
            ),
            _ => Ok(()),
        }
    }

    /// Check if this is the "all" selection
    pub fn is_all(&self) -> bool {
        matches!(self, FeatureSelection::All)
    }

    /// Check if a feature survives filtering under this selection
    pub fn allows(&self, name: &str) -> bool {
        if is_reserved(name) {
            return false;
        }
        match self {
            FeatureSelection::All => true,
            FeatureSelection::Only(names) => names.contains(name),
        }
    }
}

impl Default for FeatureSelection {
    fn default() -> Self {
        FeatureSelection::All
    }
}

impl FromStr for FeatureSelection {
    type Err = PerflogError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl fmt::Display for FeatureSelection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FeatureSelection::All => f.write_str(ALL_FEATURES),
            FeatureSelection::Only(names) => {
                let joined: Vec<&str> = names.iter().map(String::as_str).collect();
                f.write_str(&joined.join(","))
            }
        }
    }
}

/// Config-file form: `features = "all"`, `features = "rtt,cwnd"` or
/// `features = ["rtt", "cwnd"]`
#[derive(Serialize, Deserialize)]
#[serde(untagged)]
enum SelectionRepr {
    Text(String),
    List(Vec<String>),
}

impl TryFrom<SelectionRepr> for FeatureSelection {
    type Error = PerflogError;

    fn try_from(repr: SelectionRepr) -> Result<Self> {
        match repr {
            SelectionRepr::Text(s) => FeatureSelection::parse(&s),
            SelectionRepr::List(names) => FeatureSelection::only(names),
        }
    }
}

impl From<FeatureSelection> for SelectionRepr {
    fn from(selection: FeatureSelection) -> Self {
        match selection {
            FeatureSelection::All => SelectionRepr::Text(ALL_FEATURES.to_string()),
            FeatureSelection::Only(names) => SelectionRepr::List(names.into_iter().collect()),
        }
    }
}

/// Build the persisted sample from a raw feature map
pub fn filter_features(raw: &FeatureMap, selection: &FeatureSelection) -> FeatureMap {
    raw.iter()
        .filter(|(name, _)| selection.allows(name))
        .map(|(name, value)| (name.clone(), value.clone()))
        .collect()
}

//! Mapping modified files to deployable units and deciding what to restart.

use serde::Serialize;
use std::collections::HashSet;
use std::fmt;

use crate::DeployConfig;

/// The directory a modified file belongs to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Unit {
    /// Directory path relative to the repository root.
    Named(String),
    /// Stand-in for a file at the repository root. Holds the file name and
    /// can never match a configured unit.
    Placeholder(String),
}

impl fmt::Display for Unit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Unit::Named(name) => f.write_str(name),
            Unit::Placeholder(leaf) => write!(f, "no-unit:{}", leaf),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClassifiedPath {
    pub unit: Unit,
    pub leaf: String,
}

/// Split a repository-relative path on its last `/`.
pub fn classify(path: &str) -> ClassifiedPath {
    match path.rsplit_once('/') {
        Some((unit, leaf)) => ClassifiedPath {
            unit: Unit::Named(unit.to_string()),
            leaf: leaf.to_string(),
        },
        None => ClassifiedPath {
            unit: Unit::Placeholder(path.to_string()),
            leaf: path.to_string(),
        },
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Decision {
    NotConfigured,
    WrongFile,
    Trigger,
}

/// Allow-list of units plus the file whose change restarts them.
#[derive(Debug, Clone)]
pub struct TriggerPolicy {
    allowed_units: HashSet<String>,
    trigger_filename: String,
}

impl TriggerPolicy {
    pub fn new(
        allowed_units: impl IntoIterator<Item = impl Into<String>>,
        trigger_filename: impl Into<String>,
    ) -> Self {
        Self {
            allowed_units: allowed_units.into_iter().map(Into::into).collect(),
            trigger_filename: trigger_filename.into(),
        }
    }

    pub fn from_config(config: &DeployConfig) -> Self {
        Self::new(
            config.folders_to_trigger_on.iter().cloned(),
            config.trigger_filename.clone(),
        )
    }

    pub fn trigger_filename(&self) -> &str {
        &self.trigger_filename
    }

    pub fn unit_count(&self) -> usize {
        self.allowed_units.len()
    }

    pub fn evaluate(&self, classified: &ClassifiedPath) -> Decision {
        let allowed = match &classified.unit {
            Unit::Named(name) => self.allowed_units.contains(name),
            Unit::Placeholder(_) => false,
        };

        if !allowed {
            Decision::NotConfigured
        } else if classified.leaf != self.trigger_filename {
            Decision::WrongFile
        } else {
            Decision::Trigger
        }
    }
}

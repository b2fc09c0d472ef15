//! Dependency edges between tasks.
//!
//! An edge `source -> target` means "source depends on target": the target
//! must complete before the source may start.

use serde::{Deserialize, Serialize};
use crate::id::TaskId;
use crate::{ParseEnumError, Time};

/// Kind of dependency relationship.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DependencyKind {
    /// Gates scheduling eligibility
    Hard,
    /// Advisory ordering
    Soft,
    /// Shares a resource
    Resource,
    /// Consumes data produced by the target
    Data,
}

impl DependencyKind {
    /// Only hard edges gate eligibility and take part in cycle checks.
    pub fn gates_scheduling(self) -> bool {
        matches!(self, DependencyKind::Hard)
    }

    /// Kinds marked satisfied when their target completes.
    pub fn satisfied_by_completion(self) -> bool {
        matches!(self, DependencyKind::Hard | DependencyKind::Soft)
    }

    /// Snake-case name.
    pub fn as_str(self) -> &'static str {
        match self {
            DependencyKind::Hard => "hard",
            DependencyKind::Soft => "soft",
            DependencyKind::Resource => "resource",
            DependencyKind::Data => "data",
        }
    }
}

impl std::fmt::Display for DependencyKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for DependencyKind {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "hard" => Ok(DependencyKind::Hard),
            "soft" => Ok(DependencyKind::Soft),
            "resource" => Ok(DependencyKind::Resource),
            "data" => Ok(DependencyKind::Data),
            _ => Err(ParseEnumError::new("dependency kind", s)),
        }
    }
}

/// Identity of an edge; unique per triple.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct EdgeKey {
    /// Dependent task
    pub source_id: TaskId,
    /// Prerequisite task
    pub target_id: TaskId,
    /// Relationship kind
    pub kind: DependencyKind,
}

impl std::fmt::Display for EdgeKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}_{}_{}", self.source_id, self.target_id, self.kind)
    }
}

/// A directed dependency between two tasks.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DependencyEdge {
    /// Dependent task
    pub source_id: TaskId,

    /// Prerequisite task
    pub target_id: TaskId,

    /// Relationship kind
    pub kind: DependencyKind,

    /// Whether the prerequisite has completed
    pub is_satisfied: bool,

    /// When the edge became satisfied
    pub satisfied_at: Option<Time>,

    /// Creation timestamp
    pub created_at: Time,
}

impl DependencyEdge {
    /// A new, unsatisfied edge.
    pub fn new(source_id: TaskId, target_id: TaskId, kind: DependencyKind, now: Time) -> Self {
        Self {
            source_id,
            target_id,
            kind,
            is_satisfied: false,
            satisfied_at: None,
            created_at: now,
        }
    }

    /// The edge's identity triple.
    pub fn key(&self) -> EdgeKey {
        EdgeKey {
            source_id: self.source_id,
            target_id: self.target_id,
            kind: self.kind,
        }
    }

    /// Mark satisfied. Returns `false` if it already was.
    pub fn satisfy(&mut self, now: Time) -> bool {
        if self.is_satisfied {
            return false;
        }
        self.is_satisfied = true;
        self.satisfied_at = Some(now);
        true
    }
}

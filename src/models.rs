use chrono::NaiveDateTime;
use clap::ValueEnum;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Uniquely identifies an index within one inspection run
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct IndexIdentity {
    pub database: String,
    pub schema: String,
    pub index: String,
}

impl IndexIdentity {
    pub fn new(
        database: impl Into<String>,
        schema: impl Into<String>,
        index: impl Into<String>,
    ) -> Self {
        Self {
            database: database.into(),
            schema: schema.into(),
            index: index.into(),
        }
    }

    /// Schema-qualified name as used in DDL statements.
    pub fn qualified_name(&self) -> String {
        format!("{}.{}", self.schema, self.index)
    }
}

impl fmt::Display for IndexIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.database, self.schema, self.index)
    }
}

/// Health categories an index can be classified into
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, ValueEnum)]
pub enum FindingCategory {
    /// Rarely or never scanned
    Unused,
    /// Catalog validity flag is false
    Invalid,
    /// Same signature as another B-tree index
    Duplicate,
    /// Estimated reclaimable space above the threshold
    Bloated,
    /// Unused or invalid
    Inefficient,
}

impl FindingCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            FindingCategory::Unused => "Unused",
            FindingCategory::Invalid => "Invalid",
            FindingCategory::Duplicate => "Duplicate",
            FindingCategory::Bloated => "Bloated",
            FindingCategory::Inefficient => "Inefficient",
        }
    }

    /// Lowercase form used in report file names and messages
    pub fn slug(&self) -> &'static str {
        match self {
            FindingCategory::Unused => "unused",
            FindingCategory::Invalid => "invalid",
            FindingCategory::Duplicate => "duplicate",
            FindingCategory::Bloated => "bloated",
            FindingCategory::Inefficient => "inefficient",
        }
    }
}

impl fmt::Display for FindingCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Facts about the inspected instance that affect how far usage counters can be trusted.
///
/// Created once per run before classification and borrowed by every finding of that run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstanceContext {
    /// A downstream streaming replica is attached
    pub replica_attached: bool,
    /// The inspected instance is itself a standby
    pub in_recovery: bool,
}

impl InstanceContext {
    pub fn new(replica_attached: bool, in_recovery: bool) -> Self {
        Self {
            replica_attached,
            in_recovery,
        }
    }

    /// Scan counters are local to one server; they only describe application-wide
    /// usage when neither side of a replication pair is involved.
    pub fn usage_stats_reliable(&self) -> bool {
        !self.replica_attached && !self.in_recovery
    }

    pub fn usage_caveat(&self) -> Option<&'static str> {
        match (self.replica_attached, self.in_recovery) {
            (false, false) => None,
            (true, false) => Some(
                "a streaming replica is attached; scans served by the replica are not counted here",
            ),
            (false, true) => Some(
                "instance is in recovery; its scan counters do not reflect queries served by the primary",
            ),
            (true, true) => Some(
                "instance is a cascading standby; its scan counters cover neither the primary nor downstream replicas",
            ),
        }
    }
}

/// The two sides of a duplicate pair as reported by the catalog
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "resolution", rename_all = "snake_case")]
pub enum DuplicatePair {
    /// The source decided which index to keep
    Ordered {
        original: IndexIdentity,
        duplicate: IndexIdentity,
    },
    /// Both sides are equally canonical (e.g. each backs a constraint)
    Unordered {
        first: IndexIdentity,
        second: IndexIdentity,
    },
}

impl DuplicatePair {
    pub fn is_self_pair(&self) -> bool {
        match self {
            DuplicatePair::Ordered {
                original,
                duplicate,
            } => original == duplicate,
            DuplicatePair::Unordered { first, second } => first == second,
        }
    }

    /// Side that would be dropped, when the pair is ordered
    pub fn duplicate(&self) -> Option<&IndexIdentity> {
        match self {
            DuplicatePair::Ordered { duplicate, .. } => Some(duplicate),
            DuplicatePair::Unordered { .. } => None,
        }
    }

    /// Side opposite the one the finding is reported against
    pub fn counterpart(&self) -> &IndexIdentity {
        match self {
            DuplicatePair::Ordered { original, .. } => original,
            DuplicatePair::Unordered { first, .. } => first,
        }
    }
}

/// Category-specific supporting data for a finding
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "metric", rename_all = "snake_case")]
pub enum FindingMetrics {
    Usage {
        scan_count: u64,
        last_scan: Option<NaiveDateTime>,
    },
    Invalidity {
        kind: String,
    },
    Duplicate(DuplicatePair),
    Bloat {
        ratio_percent: f64,
    },
}

/// One classified observation about an index
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct IndexFinding<'ctx> {
    pub identity: IndexIdentity,
    pub size_bytes: u64,
    category: FindingCategory,
    pub metrics: FindingMetrics,
    pub context: &'ctx InstanceContext,
}

impl<'ctx> IndexFinding<'ctx> {
    pub fn new(
        identity: IndexIdentity,
        size_bytes: u64,
        category: FindingCategory,
        metrics: FindingMetrics,
        context: &'ctx InstanceContext,
    ) -> Self {
        Self {
            identity,
            size_bytes,
            category,
            metrics,
            context,
        }
    }

    pub fn category(&self) -> FindingCategory {
        self.category
    }

    /// A new finding for the same index under a derived category.
    pub fn derive(&self, category: FindingCategory) -> IndexFinding<'ctx> {
        IndexFinding {
            identity: self.identity.clone(),
            size_bytes: self.size_bytes,
            category,
            metrics: self.metrics.clone(),
            context: self.context,
        }
    }

    /// Present when this finding rests on scan counters the instance context makes unreliable.
    pub fn usage_caveat(&self) -> Option<&'static str> {
        match self.metrics {
            FindingMetrics::Usage { .. } => self.context.usage_caveat(),
            _ => None,
        }
    }
}

/// Exact corrective SQL for one finding; never executed by this crate
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RemediationStatement {
    pub identity: IndexIdentity,
    pub sql: String,
}

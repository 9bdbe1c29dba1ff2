//! Derives the corrective statement for a finding.
//!
//! Statements are returned as text for an operator to review; nothing here talks to a
//! database.

use super::{AmbiguousRemediationSnafu, Result};
use crate::models::{
    FindingCategory, FindingMetrics, IndexFinding, IndexIdentity, RemediationStatement,
};

const REINDEX: &str = "REINDEX INDEX CONCURRENTLY";
const DROP: &str = "DROP INDEX CONCURRENTLY";

pub fn advise(finding: &IndexFinding<'_>) -> Result<RemediationStatement> {
    let (operation, target) = match finding.category() {
        FindingCategory::Bloated => (REINDEX, &finding.identity),
        FindingCategory::Duplicate => (DROP, duplicate_side(finding)?),
        FindingCategory::Unused | FindingCategory::Invalid | FindingCategory::Inefficient => {
            (DROP, &finding.identity)
        }
    };

    Ok(RemediationStatement {
        identity: target.clone(),
        sql: format!("{} {};", operation, target.qualified_name()),
    })
}

/// Advises every finding in order; stops at the first one that cannot be advised.
pub fn advise_all(findings: &[IndexFinding<'_>]) -> Result<Vec<RemediationStatement>> {
    findings.iter().map(advise).collect()
}

fn duplicate_side<'a>(finding: &'a IndexFinding<'_>) -> Result<&'a IndexIdentity> {
    let duplicate = match &finding.metrics {
        FindingMetrics::Duplicate(pair) => pair.duplicate(),
        _ => None,
    };

    duplicate.ok_or_else(|| {
        AmbiguousRemediationSnafu {
            identity: finding.identity.clone(),
        }
        .build()
    })
}

//! Turns raw catalog rows into typed [`IndexFinding`]s.
//!
//! Every row is validated once here; a row that breaks the contract for its category is
//! reported as [`AnalysisError::MalformedFinding`] naming the offending field rather than
//! being coerced or dropped.

use super::{MalformedFindingSnafu, Result};
use crate::catalog::{BloatedIndexRow, DuplicateIndexRow, InvalidIndexRow, UnusedIndexRow};
use crate::models::{
    DuplicatePair, FindingCategory, FindingMetrics, IndexFinding, IndexIdentity, InstanceContext,
};
use chrono::{DateTime, NaiveDateTime};
use std::collections::HashSet;
use tracing::warn;

const TIMESTAMP_FORMATS: [&str; 2] = ["%Y-%m-%d %H:%M:%S", "%Y-%m-%d %H:%M:%S%.f"];

/// A raw catalog row that can be validated into a finding
pub trait RawFinding {
    const CATEGORY: FindingCategory;

    fn normalize<'ctx>(self, context: &'ctx InstanceContext) -> Result<IndexFinding<'ctx>>;
}

/// Normalizes a whole sequence, keeping source order.
///
/// A source that reports the same index twice is collapsed to the first row.
pub fn normalize_rows<'ctx, R: RawFinding>(
    rows: impl IntoIterator<Item = R>,
    context: &'ctx InstanceContext,
) -> Result<Vec<IndexFinding<'ctx>>> {
    let mut seen = HashSet::new();
    let mut findings = Vec::new();

    for row in rows {
        let finding = row.normalize(context)?;
        if !seen.insert(finding.identity.clone()) {
            warn!(
                "Catalog reported {} index {} more than once; keeping the first row",
                R::CATEGORY.slug(),
                finding.identity
            );
            continue;
        }
        findings.push(finding);
    }

    Ok(findings)
}

impl RawFinding for UnusedIndexRow {
    const CATEGORY: FindingCategory = FindingCategory::Unused;

    fn normalize<'ctx>(self, context: &'ctx InstanceContext) -> Result<IndexFinding<'ctx>> {
        let identity = identity(
            Self::CATEGORY,
            self.database_name,
            self.schema_name,
            self.index_name,
        )?;
        let size_bytes = non_negative(Self::CATEGORY, &identity, "index_size", self.index_size)?;
        let scan_count = non_negative(Self::CATEGORY, &identity, "index_scan", self.index_scan)?;
        let last_scan = self
            .last_scan
            .as_deref()
            .map(|raw| parse_timestamp(Self::CATEGORY, &identity, "last_scan", raw))
            .transpose()?;

        Ok(IndexFinding::new(
            identity,
            size_bytes,
            Self::CATEGORY,
            FindingMetrics::Usage {
                scan_count,
                last_scan,
            },
            context,
        ))
    }
}

impl RawFinding for InvalidIndexRow {
    const CATEGORY: FindingCategory = FindingCategory::Invalid;

    fn normalize<'ctx>(self, context: &'ctx InstanceContext) -> Result<IndexFinding<'ctx>> {
        let identity = identity(
            Self::CATEGORY,
            self.database_name,
            self.schema_name,
            self.index_name,
        )?;
        let size_bytes = non_negative(Self::CATEGORY, &identity, "index_size", self.index_size)?;
        if self.invalid_kind.trim().is_empty() {
            return MalformedFindingSnafu {
                category: Self::CATEGORY,
                identity: Some(identity.to_string()),
                field: "invalid_kind",
                reason: "is empty",
            }
            .fail();
        }

        Ok(IndexFinding::new(
            identity,
            size_bytes,
            Self::CATEGORY,
            FindingMetrics::Invalidity {
                kind: self.invalid_kind,
            },
            context,
        ))
    }
}

impl RawFinding for DuplicateIndexRow {
    const CATEGORY: FindingCategory = FindingCategory::Duplicate;

    fn normalize<'ctx>(self, context: &'ctx InstanceContext) -> Result<IndexFinding<'ctx>> {
        let kept = identity(
            Self::CATEGORY,
            self.database_name.clone(),
            self.schema_name,
            self.index_name,
        )?;
        let duplicate = identity(
            Self::CATEGORY,
            self.database_name,
            self.duplicate_schema_name,
            self.duplicate_index_name,
        )?;
        let size_bytes = non_negative(Self::CATEGORY, &duplicate, "index_size", self.index_size)?;

        let pair = if self.sides_resolved {
            DuplicatePair::Ordered {
                original: kept,
                duplicate: duplicate.clone(),
            }
        } else {
            DuplicatePair::Unordered {
                first: kept,
                second: duplicate.clone(),
            }
        };

        Ok(IndexFinding::new(
            duplicate,
            size_bytes,
            Self::CATEGORY,
            FindingMetrics::Duplicate(pair),
            context,
        ))
    }
}

impl RawFinding for BloatedIndexRow {
    const CATEGORY: FindingCategory = FindingCategory::Bloated;

    fn normalize<'ctx>(self, context: &'ctx InstanceContext) -> Result<IndexFinding<'ctx>> {
        let identity = identity(
            Self::CATEGORY,
            self.database_name,
            self.schema_name,
            self.index_name,
        )?;
        let size_bytes = non_negative(Self::CATEGORY, &identity, "index_size", self.index_size)?;
        if !self.bloat_ratio.is_finite() || !(0.0..=100.0).contains(&self.bloat_ratio) {
            return MalformedFindingSnafu {
                category: Self::CATEGORY,
                identity: Some(identity.to_string()),
                field: "bloat_ratio",
                reason: format!("{} is not a percentage between 0 and 100", self.bloat_ratio),
            }
            .fail();
        }

        Ok(IndexFinding::new(
            identity,
            size_bytes,
            Self::CATEGORY,
            FindingMetrics::Bloat {
                ratio_percent: self.bloat_ratio,
            },
            context,
        ))
    }
}

fn identity(
    category: FindingCategory,
    database: String,
    schema: String,
    index: String,
) -> Result<IndexIdentity> {
    for (field, value) in [
        ("database_name", &database),
        ("schema_name", &schema),
        ("index_name", &index),
    ] {
        if value.trim().is_empty() {
            return MalformedFindingSnafu {
                category,
                identity: Some(format!("{database}.{schema}.{index}")),
                field,
                reason: "is empty",
            }
            .fail();
        }
    }

    Ok(IndexIdentity::new(database, schema, index))
}

fn non_negative(
    category: FindingCategory,
    identity: &IndexIdentity,
    field: &'static str,
    value: i64,
) -> Result<u64> {
    u64::try_from(value).map_err(|_| {
        MalformedFindingSnafu {
            category,
            identity: Some(identity.to_string()),
            field,
            reason: format!("must be non-negative, got {value}"),
        }
        .build()
    })
}

fn parse_timestamp(
    category: FindingCategory,
    identity: &IndexIdentity,
    field: &'static str,
    raw: &str,
) -> Result<NaiveDateTime> {
    let raw = raw.trim();
    if let Ok(parsed) = DateTime::parse_from_rfc3339(raw) {
        return Ok(parsed.naive_utc());
    }

    TIMESTAMP_FORMATS
        .iter()
        .find_map(|format| NaiveDateTime::parse_from_str(raw, format).ok())
        .ok_or_else(|| {
            MalformedFindingSnafu {
                category,
                identity: Some(identity.to_string()),
                field,
                reason: format!("`{raw}` is not a timestamp"),
            }
            .build()
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analysis::AnalysisError;
    use chrono::NaiveDate;
    use rstest::rstest;

    fn unused_row(index: &str, scans: i64, last_scan: Option<&str>) -> UnusedIndexRow {
        UnusedIndexRow {
            database_name: "shop".into(),
            schema_name: "public".into(),
            index_name: index.into(),
            index_size: 8 * 1024 * 1024,
            index_scan: scans,
            last_scan: last_scan.map(str::to_string),
        }
    }

    fn bloated_row(ratio: f64) -> BloatedIndexRow {
        BloatedIndexRow {
            database_name: "shop".into(),
            schema_name: "public".into(),
            index_name: "idx_orders_created".into(),
            index_size: 64 * 1024 * 1024,
            bloat_ratio: ratio,
        }
    }

    fn malformed_field(err: AnalysisError) -> &'static str {
        match err {
            AnalysisError::MalformedFinding { field, .. } => field,
            other => panic!("expected MalformedFinding, got {other:?}"),
        }
    }

    #[rstest]
    #[case("2025-11-01 01:00:00")]
    #[case("2025-11-01 01:00:00.123456")]
    #[case("2025-11-01T01:00:00Z")]
    fn unused_row_accepts_timestamp_formats(#[case] raw: &str) {
        let context = InstanceContext::default();
        let finding = unused_row("idx_a", 3, Some(raw)).normalize(&context).unwrap();

        let FindingMetrics::Usage {
            scan_count,
            last_scan,
        } = &finding.metrics
        else {
            panic!("unused rows normalize to usage metrics");
        };
        assert_eq!(*scan_count, 3);
        assert_eq!(
            last_scan.map(|ts| ts.date()),
            NaiveDate::from_ymd_opt(2025, 11, 1)
        );
        assert_eq!(finding.category(), FindingCategory::Unused);
    }

    #[test]
    fn unused_row_without_last_scan_is_valid() {
        let context = InstanceContext::default();
        let finding = unused_row("idx_a", 0, None).normalize(&context).unwrap();
        assert!(matches!(
            finding.metrics,
            FindingMetrics::Usage {
                last_scan: None,
                ..
            }
        ));
    }

    #[rstest]
    #[case(unused_row("idx_a", -1, None), "index_scan")]
    #[case(unused_row("idx_a", 0, Some("yesterday")), "last_scan")]
    #[case(unused_row("", 0, None), "index_name")]
    #[case(UnusedIndexRow { index_size: -8192, ..unused_row("idx_a", 0, None) }, "index_size")]
    fn malformed_unused_rows_name_the_field(
        #[case] row: UnusedIndexRow,
        #[case] expected: &'static str,
    ) {
        let context = InstanceContext::default();
        let err = row.normalize(&context).unwrap_err();
        assert_eq!(malformed_field(err), expected);
    }

    #[rstest]
    #[case(-0.5)]
    #[case(100.5)]
    #[case(f64::NAN)]
    fn bloat_ratio_must_be_a_percentage(#[case] ratio: f64) {
        let context = InstanceContext::default();
        let err = bloated_row(ratio).normalize(&context).unwrap_err();
        assert_eq!(malformed_field(err), "bloat_ratio");
    }

    #[test]
    fn invalid_subtype_passes_through_unchanged() {
        let context = InstanceContext::default();
        let row = InvalidIndexRow {
            database_name: "shop".into(),
            schema_name: "public".into(),
            index_name: "idx_orders_ccnew".into(),
            index_size: 0,
            invalid_kind: "not_ready".into(),
        };

        let finding = row.normalize(&context).unwrap();
        assert_eq!(
            finding.metrics,
            FindingMetrics::Invalidity {
                kind: "not_ready".into()
            }
        );
    }

    #[test]
    fn duplicate_finding_is_reported_against_the_duplicate_side() {
        let context = InstanceContext::default();
        let row = DuplicateIndexRow {
            database_name: "shop".into(),
            schema_name: "public".into(),
            index_name: "orders_customer_id_idx".into(),
            duplicate_schema_name: "public".into(),
            duplicate_index_name: "orders_customer_id_idx1".into(),
            index_size: 4096,
            sides_resolved: true,
        };

        let finding = row.normalize(&context).unwrap();
        assert_eq!(finding.identity.index, "orders_customer_id_idx1");
        let FindingMetrics::Duplicate(pair) = &finding.metrics else {
            panic!("duplicate rows normalize to duplicate metrics");
        };
        assert_eq!(pair.counterpart().index, "orders_customer_id_idx");
        assert_eq!(pair.duplicate(), Some(&finding.identity));
    }

    #[test]
    fn unresolved_duplicate_row_keeps_both_sides_unordered() {
        let context = InstanceContext::default();
        let row = DuplicateIndexRow {
            database_name: "shop".into(),
            schema_name: "public".into(),
            index_name: "orders_pkey".into(),
            duplicate_schema_name: "public".into(),
            duplicate_index_name: "orders_id_key".into(),
            index_size: 4096,
            sides_resolved: false,
        };

        let finding = row.normalize(&context).unwrap();
        let FindingMetrics::Duplicate(pair) = &finding.metrics else {
            panic!("duplicate rows normalize to duplicate metrics");
        };
        assert!(pair.duplicate().is_none());
    }

    #[test]
    fn repeated_identities_collapse_to_first_row() {
        let context = InstanceContext::default();
        let rows = vec![
            unused_row("idx_a", 1, None),
            unused_row("idx_b", 2, None),
            unused_row("idx_a", 7, None),
        ];

        let findings = normalize_rows(rows, &context).unwrap();
        assert_eq!(findings.len(), 2);
        assert!(matches!(
            findings[0].metrics,
            FindingMetrics::Usage { scan_count: 1, .. }
        ));
        assert_eq!(findings[1].identity.index, "idx_b");
    }

    #[test]
    fn one_malformed_row_fails_the_whole_sequence() {
        let context = InstanceContext::default();
        let rows = vec![unused_row("idx_a", 1, None), unused_row("idx_b", -3, None)];

        assert!(normalize_rows(rows, &context).is_err());
    }
}

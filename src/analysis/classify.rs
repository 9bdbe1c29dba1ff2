use super::normalize::normalize_rows;
use super::{DataSourceSnafu, InvalidThresholdSnafu, MalformedFindingSnafu, Result};
use crate::catalog::CatalogSource;
use crate::config::DbConfig;
use crate::models::{FindingCategory, FindingMetrics, IndexFinding, InstanceContext};
use itertools::Itertools;
use serde::Serialize;
use snafu::ResultExt;
use tracing::{debug, info, warn};

/// Minimum estimated bloat percentage for an index to be reported
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
pub struct BloatThreshold(u8);

impl BloatThreshold {
    pub const DEFAULT_PERCENT: u8 = 50;

    pub fn new(value: i64) -> Result<Self> {
        match u8::try_from(value) {
            Ok(percent) if percent <= 100 => Ok(Self(percent)),
            _ => InvalidThresholdSnafu { value }.fail(),
        }
    }

    pub fn percent(self) -> u8 {
        self.0
    }

    pub fn admits(self, ratio_percent: f64) -> bool {
        ratio_percent >= f64::from(self.0)
    }
}

impl Default for BloatThreshold {
    fn default() -> Self {
        Self(Self::DEFAULT_PERCENT)
    }
}

/// One inspection run against one instance.
///
/// The [`InstanceContext`] is read once when the run starts; every finding produced by
/// the run borrows it.
pub struct Inspector<S> {
    source: S,
    instance: DbConfig,
    context: InstanceContext,
}

impl<S: CatalogSource> Inspector<S> {
    pub async fn new(source: S, instance: DbConfig) -> Result<Self> {
        let context = source
            .instance_context(&instance)
            .await
            .context(DataSourceSnafu {
                operation: "instance_context",
            })?;

        if let Some(caveat) = context.usage_caveat() {
            warn!("{}: {}", instance.database, caveat);
        }

        Ok(Self {
            source,
            instance,
            context,
        })
    }

    pub fn instance(&self) -> &DbConfig {
        &self.instance
    }

    pub fn context(&self) -> &InstanceContext {
        &self.context
    }

    /// Classifies one category. `threshold` is validated before any query is issued and
    /// only narrows [`FindingCategory::Bloated`].
    pub async fn classify(
        &self,
        category: FindingCategory,
        threshold: Option<i64>,
    ) -> Result<Vec<IndexFinding<'_>>> {
        let threshold = threshold
            .map(BloatThreshold::new)
            .transpose()?
            .unwrap_or_default();

        info!(
            "Classifying {} indexes in {}",
            category.slug(),
            self.instance.database
        );

        let findings = match category {
            FindingCategory::Unused => self.unused().await?,
            FindingCategory::Invalid => self.invalid().await?,
            FindingCategory::Duplicate => self.duplicates().await?,
            FindingCategory::Bloated => self.bloated(threshold).await?,
            FindingCategory::Inefficient => self.classify_inefficient().await?,
        };

        debug!("{} {} findings", findings.len(), category.slug());
        Ok(findings)
    }

    /// Unused ∪ invalid for this run. Both dependencies are fetched concurrently and the
    /// union is only computed once both have succeeded.
    pub async fn classify_inefficient(&self) -> Result<Vec<IndexFinding<'_>>> {
        let (unused, invalid) = tokio::try_join!(self.unused(), self.invalid())?;
        Ok(union_inefficient(unused, invalid))
    }

    async fn unused(&self) -> Result<Vec<IndexFinding<'_>>> {
        let rows = self
            .source
            .fetch_unused(&self.instance)
            .await
            .context(DataSourceSnafu {
                operation: "fetch_unused",
            })?;
        normalize_rows(rows, &self.context)
    }

    async fn invalid(&self) -> Result<Vec<IndexFinding<'_>>> {
        let rows = self
            .source
            .fetch_invalid(&self.instance)
            .await
            .context(DataSourceSnafu {
                operation: "fetch_invalid",
            })?;
        normalize_rows(rows, &self.context)
    }

    async fn duplicates(&self) -> Result<Vec<IndexFinding<'_>>> {
        let rows = self
            .source
            .fetch_duplicates(&self.instance)
            .await
            .context(DataSourceSnafu {
                operation: "fetch_duplicates",
            })?;
        let findings = normalize_rows(rows, &self.context)?;
        reject_self_pairs(&findings)?;
        Ok(findings)
    }

    async fn bloated(&self, threshold: BloatThreshold) -> Result<Vec<IndexFinding<'_>>> {
        let rows = self
            .source
            .fetch_bloated(&self.instance, threshold)
            .await
            .context(DataSourceSnafu {
                operation: "fetch_bloated",
            })?;
        let findings = normalize_rows(rows, &self.context)?;
        Ok(apply_bloat_threshold(findings, threshold))
    }
}

/// Keeps findings whose bloat ratio reaches the threshold, in source order.
pub fn apply_bloat_threshold(
    findings: Vec<IndexFinding<'_>>,
    threshold: BloatThreshold,
) -> Vec<IndexFinding<'_>> {
    findings
        .into_iter()
        .filter(|finding| match finding.metrics {
            FindingMetrics::Bloat { ratio_percent } => threshold.admits(ratio_percent),
            _ => false,
        })
        .collect()
}

/// A pair naming the same index on both sides cannot be remediated.
pub fn reject_self_pairs(findings: &[IndexFinding<'_>]) -> Result<()> {
    for finding in findings {
        if let FindingMetrics::Duplicate(pair) = &finding.metrics {
            if pair.is_self_pair() {
                return MalformedFindingSnafu {
                    category: FindingCategory::Duplicate,
                    identity: Some(finding.identity.to_string()),
                    field: "duplicate_index_name",
                    reason: "names the same index as index_name",
                }
                .fail();
            }
        }
    }
    Ok(())
}

/// All unused findings first, then invalid ones not already present.
pub fn union_inefficient<'ctx>(
    unused: Vec<IndexFinding<'ctx>>,
    invalid: Vec<IndexFinding<'ctx>>,
) -> Vec<IndexFinding<'ctx>> {
    unused
        .into_iter()
        .chain(invalid)
        .unique_by(|finding| finding.identity.clone())
        .map(|finding| finding.derive(FindingCategory::Inefficient))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analysis::AnalysisError;
    use crate::catalog::{
        BloatedIndexRow, CatalogError, DuplicateIndexRow, InvalidIndexRow, UnusedIndexRow,
    };
    use async_trait::async_trait;
    use rstest::rstest;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct FakeCatalog {
        unused: Vec<UnusedIndexRow>,
        invalid: Vec<InvalidIndexRow>,
        duplicates: Vec<DuplicateIndexRow>,
        bloated: Vec<BloatedIndexRow>,
        context: InstanceContext,
        fail_invalid: bool,
        fetches: AtomicUsize,
    }

    fn timed_out(query: &str) -> CatalogError {
        CatalogError::QueryError {
            query: query.into(),
            source: sqlx::Error::PoolTimedOut,
        }
    }

    #[async_trait]
    impl CatalogSource for FakeCatalog {
        async fn fetch_unused(
            &self,
            _instance: &DbConfig,
        ) -> std::result::Result<Vec<UnusedIndexRow>, CatalogError> {
            self.fetches.fetch_add(1, Ordering::SeqCst);
            Ok(self.unused.clone())
        }

        async fn fetch_invalid(
            &self,
            _instance: &DbConfig,
        ) -> std::result::Result<Vec<InvalidIndexRow>, CatalogError> {
            self.fetches.fetch_add(1, Ordering::SeqCst);
            if self.fail_invalid {
                return Err(timed_out("invalid"));
            }
            Ok(self.invalid.clone())
        }

        async fn fetch_duplicates(
            &self,
            _instance: &DbConfig,
        ) -> std::result::Result<Vec<DuplicateIndexRow>, CatalogError> {
            self.fetches.fetch_add(1, Ordering::SeqCst);
            Ok(self.duplicates.clone())
        }

        async fn fetch_bloated(
            &self,
            _instance: &DbConfig,
            _threshold: BloatThreshold,
        ) -> std::result::Result<Vec<BloatedIndexRow>, CatalogError> {
            self.fetches.fetch_add(1, Ordering::SeqCst);
            Ok(self.bloated.clone())
        }

        async fn instance_context(
            &self,
            _instance: &DbConfig,
        ) -> std::result::Result<InstanceContext, CatalogError> {
            Ok(self.context)
        }
    }

    fn instance() -> DbConfig {
        DbConfig::from_connection_params(
            "localhost".into(),
            5432,
            "shop".into(),
            "auditor".into(),
            "secret".into(),
        )
    }

    fn unused(index: &str) -> UnusedIndexRow {
        UnusedIndexRow {
            database_name: "shop".into(),
            schema_name: "public".into(),
            index_name: index.into(),
            index_size: 16384,
            index_scan: 0,
            last_scan: None,
        }
    }

    fn invalid(index: &str) -> InvalidIndexRow {
        InvalidIndexRow {
            database_name: "shop".into(),
            schema_name: "public".into(),
            index_name: index.into(),
            index_size: 8192,
            invalid_kind: "not_valid".into(),
        }
    }

    fn bloated(index: &str, ratio: f64) -> BloatedIndexRow {
        BloatedIndexRow {
            database_name: "shop".into(),
            schema_name: "public".into(),
            index_name: index.into(),
            index_size: 1024 * 1024,
            bloat_ratio: ratio,
        }
    }

    fn names(findings: &[IndexFinding<'_>]) -> Vec<String> {
        findings.iter().map(|f| f.identity.index.clone()).collect()
    }

    #[rstest]
    #[case(50, 1)]
    #[case(62, 1)]
    #[case(70, 0)]
    #[tokio::test]
    async fn bloated_findings_respect_threshold(#[case] threshold: i64, #[case] expected: usize) {
        let catalog = FakeCatalog {
            bloated: vec![bloated("idx_orders_created", 62.0)],
            ..Default::default()
        };
        let inspector = Inspector::new(catalog, instance()).await.unwrap();

        let findings = inspector
            .classify(FindingCategory::Bloated, Some(threshold))
            .await
            .unwrap();
        assert_eq!(findings.len(), expected);
    }

    #[tokio::test]
    async fn raising_the_threshold_only_narrows_the_result() {
        let catalog = FakeCatalog {
            bloated: vec![
                bloated("idx_a", 12.5),
                bloated("idx_b", 50.0),
                bloated("idx_c", 87.0),
                bloated("idx_d", 64.0),
                bloated("idx_e", 100.0),
            ],
            ..Default::default()
        };
        let inspector = Inspector::new(catalog, instance()).await.unwrap();

        let mut previous: Option<Vec<String>> = None;
        for threshold in [0, 10, 50, 51, 64, 90, 100] {
            let current = names(
                &inspector
                    .classify(FindingCategory::Bloated, Some(threshold))
                    .await
                    .unwrap(),
            );
            if let Some(wider) = &previous {
                assert!(current.iter().all(|name| wider.contains(name)));
            }
            previous = Some(current);
        }
        assert_eq!(previous.unwrap(), vec!["idx_e".to_string()]);
    }

    #[tokio::test]
    async fn missing_threshold_defaults_to_fifty() {
        let catalog = FakeCatalog {
            bloated: vec![bloated("idx_a", 49.9), bloated("idx_b", 50.0)],
            ..Default::default()
        };
        let inspector = Inspector::new(catalog, instance()).await.unwrap();

        let findings = inspector
            .classify(FindingCategory::Bloated, None)
            .await
            .unwrap();
        assert_eq!(names(&findings), vec!["idx_b"]);
    }

    #[rstest]
    #[case(-1)]
    #[case(101)]
    #[case(i64::MAX)]
    #[tokio::test]
    async fn out_of_range_threshold_fails_before_any_query(#[case] threshold: i64) {
        let catalog = FakeCatalog {
            bloated: vec![bloated("idx_a", 90.0)],
            ..Default::default()
        };
        let inspector = Inspector::new(catalog, instance()).await.unwrap();

        let err = inspector
            .classify(FindingCategory::Bloated, Some(threshold))
            .await
            .unwrap_err();
        assert!(matches!(err, AnalysisError::InvalidThreshold { value } if value == threshold));
        assert_eq!(inspector.source.fetches.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn inefficient_is_ordered_union_without_repeats() {
        let catalog = FakeCatalog {
            unused: vec![unused("A"), unused("B")],
            invalid: vec![invalid("B"), invalid("C")],
            ..Default::default()
        };
        let inspector = Inspector::new(catalog, instance()).await.unwrap();

        let findings = inspector.classify_inefficient().await.unwrap();
        assert_eq!(names(&findings), vec!["A", "B", "C"]);
        assert!(findings
            .iter()
            .all(|f| f.category() == FindingCategory::Inefficient));
        // B keeps the metrics of its first occurrence
        assert!(matches!(findings[1].metrics, FindingMetrics::Usage { .. }));
        assert!(matches!(
            findings[2].metrics,
            FindingMetrics::Invalidity { .. }
        ));

        let via_classify = inspector
            .classify(FindingCategory::Inefficient, None)
            .await
            .unwrap();
        assert_eq!(names(&via_classify), names(&findings));
    }

    #[tokio::test]
    async fn inefficient_fails_when_a_dependency_fails() {
        let catalog = FakeCatalog {
            unused: vec![unused("A")],
            fail_invalid: true,
            ..Default::default()
        };
        let inspector = Inspector::new(catalog, instance()).await.unwrap();

        let err = inspector.classify_inefficient().await.unwrap_err();
        assert!(matches!(
            err,
            AnalysisError::DataSource {
                operation: "fetch_invalid",
                ..
            }
        ));
    }

    #[tokio::test]
    async fn empty_category_is_success() {
        let inspector = Inspector::new(FakeCatalog::default(), instance())
            .await
            .unwrap();

        for category in [
            FindingCategory::Unused,
            FindingCategory::Invalid,
            FindingCategory::Duplicate,
            FindingCategory::Bloated,
            FindingCategory::Inefficient,
        ] {
            assert!(inspector.classify(category, None).await.unwrap().is_empty());
        }
    }

    #[tokio::test]
    async fn unused_findings_carry_replica_caveat() {
        let catalog = FakeCatalog {
            unused: vec![unused("A")],
            context: InstanceContext::new(true, false),
            ..Default::default()
        };
        let inspector = Inspector::new(catalog, instance()).await.unwrap();

        let findings = inspector
            .classify(FindingCategory::Unused, None)
            .await
            .unwrap();
        assert_eq!(findings.len(), 1);
        assert!(findings[0].context.replica_attached);
        assert!(findings[0].usage_caveat().is_some());
        assert!(std::ptr::eq(findings[0].context, inspector.context()));
    }

    #[tokio::test]
    async fn self_paired_duplicate_is_malformed() {
        let catalog = FakeCatalog {
            duplicates: vec![DuplicateIndexRow {
                database_name: "shop".into(),
                schema_name: "public".into(),
                index_name: "orders_idx".into(),
                duplicate_schema_name: "public".into(),
                duplicate_index_name: "orders_idx".into(),
                index_size: 8192,
                sides_resolved: true,
            }],
            ..Default::default()
        };
        let inspector = Inspector::new(catalog, instance()).await.unwrap();

        let err = inspector
            .classify(FindingCategory::Duplicate, None)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            AnalysisError::MalformedFinding {
                category: FindingCategory::Duplicate,
                field: "duplicate_index_name",
                ..
            }
        ));
    }

    #[tokio::test]
    async fn source_order_is_preserved() {
        let catalog = FakeCatalog {
            unused: vec![unused("zeta"), unused("alpha"), unused("mu")],
            ..Default::default()
        };
        let inspector = Inspector::new(catalog, instance()).await.unwrap();

        let findings = inspector
            .classify(FindingCategory::Unused, None)
            .await
            .unwrap();
        assert_eq!(names(&findings), vec!["zeta", "alpha", "mu"]);
    }
}

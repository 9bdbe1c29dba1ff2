pub mod classify;
pub mod normalize;
pub mod remediation;

pub use classify::{BloatThreshold, Inspector};
pub use normalize::{normalize_rows, RawFinding};
pub use remediation::{advise, advise_all};

use crate::catalog::CatalogError;
use crate::models::{FindingCategory, IndexIdentity};
use snafu::Snafu;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum AnalysisError {
    #[snafu(display("Data source call `{}` failed: {}", operation, source))]
    DataSource {
        operation: &'static str,
        source: CatalogError,
    },

    #[snafu(display("Bloat threshold {} is outside the accepted range 0-100", value))]
    InvalidThreshold { value: i64 },

    #[snafu(display(
        "Malformed {} finding for {}: field `{}` {}",
        category.slug(),
        identity.as_deref().unwrap_or("<unknown index>"),
        field,
        reason
    ))]
    MalformedFinding {
        category: FindingCategory,
        identity: Option<String>,
        field: &'static str,
        reason: String,
    },

    #[snafu(display(
        "Duplicate pair for {} does not say which side is the duplicate; refusing to advise",
        identity
    ))]
    AmbiguousRemediation { identity: IndexIdentity },
}

pub type Result<T, E = AnalysisError> = std::result::Result<T, E>;

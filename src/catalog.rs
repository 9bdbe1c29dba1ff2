use crate::analysis::BloatThreshold;
use crate::config::DbConfig;
use crate::models::InstanceContext;
use async_trait::async_trait;
use snafu::{ResultExt, Snafu};
use sqlx::{
    postgres::{PgPoolOptions, PgRow},
    query_scalar, Decode, Pool, Postgres, Row, Type,
};
use std::time::Duration;
use tracing::{debug, info};

#[derive(Debug, Snafu)]
pub enum CatalogError {
    #[snafu(display("Failed to connect to database: {}", source))]
    ConnectionError { source: sqlx::Error },

    #[snafu(display("Failed to execute query: {}", query))]
    QueryError { query: String, source: sqlx::Error },
}

type Result<T, E = CatalogError> = std::result::Result<T, E>;

/// Row describing a rarely scanned index
#[derive(Debug, Clone, PartialEq)]
pub struct UnusedIndexRow {
    pub database_name: String,
    pub schema_name: String,
    pub index_name: String,
    pub index_size: i64,
    pub index_scan: i64,
    pub last_scan: Option<String>,
}

/// Row describing an index whose validity flag is false
#[derive(Debug, Clone, PartialEq)]
pub struct InvalidIndexRow {
    pub database_name: String,
    pub schema_name: String,
    pub index_name: String,
    pub index_size: i64,
    pub invalid_kind: String,
}

/// One duplicate pair. `index_*` names the kept side, `duplicate_*` the redundant side;
/// `sides_resolved` is false when the source could not decide which one to keep.
#[derive(Debug, Clone, PartialEq)]
pub struct DuplicateIndexRow {
    pub database_name: String,
    pub schema_name: String,
    pub index_name: String,
    pub duplicate_schema_name: String,
    pub duplicate_index_name: String,
    pub index_size: i64,
    pub sides_resolved: bool,
}

/// Row carrying an estimated bloat percentage for a B-tree index
#[derive(Debug, Clone, PartialEq)]
pub struct BloatedIndexRow {
    pub database_name: String,
    pub schema_name: String,
    pub index_name: String,
    pub index_size: i64,
    pub bloat_ratio: f64,
}

/// Supplies raw index rows and instance facts for one target instance.
#[async_trait]
pub trait CatalogSource: Send + Sync {
    async fn fetch_unused(&self, instance: &DbConfig) -> Result<Vec<UnusedIndexRow>>;

    async fn fetch_invalid(&self, instance: &DbConfig) -> Result<Vec<InvalidIndexRow>>;

    async fn fetch_duplicates(&self, instance: &DbConfig) -> Result<Vec<DuplicateIndexRow>>;

    /// `threshold` may be used to narrow the result; callers filter again regardless.
    async fn fetch_bloated(
        &self,
        instance: &DbConfig,
        threshold: BloatThreshold,
    ) -> Result<Vec<BloatedIndexRow>>;

    async fn instance_context(&self, instance: &DbConfig) -> Result<InstanceContext>;
}

/// Index-scan count under which an index is reported as unused
pub const DEFAULT_UNUSED_SCAN_LIMIT: i64 = 50;

const PG16_VERSION_NUM: i64 = 160000;

/// PostgreSQL system catalogs and statistics views
pub struct PgCatalog {
    pool: Pool<Postgres>,
    unused_scan_limit: i64,
}

impl PgCatalog {
    pub async fn connect(config: &DbConfig) -> Result<Self> {
        info!(
            "Connecting to PostgreSQL at {}:{}",
            config.host, config.port
        );

        let pool = PgPoolOptions::new()
            .max_connections(5)
            .acquire_timeout(Duration::from_secs(config.connect_timeout_secs))
            .connect(&config.connection_string())
            .await
            .context(ConnectionSnafu)?;

        info!("Successfully connected to database: {}", config.database);

        Ok(Self {
            pool,
            unused_scan_limit: DEFAULT_UNUSED_SCAN_LIMIT,
        })
    }

    pub fn with_unused_scan_limit(mut self, limit: i64) -> Self {
        self.unused_scan_limit = limit;
        self
    }

    async fn server_version(&self) -> Result<i64> {
        let query = "SELECT current_setting('server_version_num')::int8";
        query_scalar::<_, i64>(query)
            .fetch_one(&self.pool)
            .await
            .context(QuerySnafu { query })
    }
}

const UNUSED_QUERY_TEMPLATE: &str = r#"
    SELECT
        current_database() AS database_name,
        s.schemaname AS schema_name,
        s.indexrelname AS index_name,
        pg_relation_size(s.indexrelid) AS index_size,
        s.idx_scan AS index_scan,
        {last_scan} AS last_scan
    FROM pg_stat_user_indexes s
    JOIN pg_index i ON i.indexrelid = s.indexrelid
    WHERE s.idx_scan < $1
      AND NOT i.indisunique
      AND NOT i.indisprimary
      AND NOT EXISTS (
          SELECT 1 FROM pg_constraint c WHERE c.conindid = s.indexrelid
      )
    ORDER BY pg_relation_size(s.indexrelid) DESC
"#;

const INVALID_QUERY: &str = r#"
    SELECT
        current_database() AS database_name,
        n.nspname AS schema_name,
        c.relname AS index_name,
        pg_relation_size(c.oid) AS index_size,
        CASE
            WHEN NOT i.indislive THEN 'not_live'
            WHEN NOT i.indisready THEN 'not_ready'
            ELSE 'not_valid'
        END AS invalid_kind
    FROM pg_index i
    JOIN pg_class c ON c.oid = i.indexrelid
    JOIN pg_namespace n ON n.oid = c.relnamespace
    WHERE NOT i.indisvalid
      AND n.nspname NOT IN ('pg_catalog', 'information_schema')
    ORDER BY pg_relation_size(c.oid) DESC
"#;

const DUPLICATE_QUERY: &str = r#"
    WITH btree_indexes AS (
        SELECT
            i.indexrelid,
            n.nspname,
            c.relname,
            pg_relation_size(i.indexrelid) AS index_size,
            (i.indisunique OR EXISTS (
                SELECT 1 FROM pg_constraint k WHERE k.conindid = i.indexrelid
            )) AS enforces_constraint,
            concat_ws(' | ',
                i.indrelid::text,
                i.indkey::text,
                i.indclass::text,
                coalesce(pg_get_expr(i.indexprs, i.indrelid), ''),
                coalesce(pg_get_expr(i.indpred, i.indrelid), '')
            ) AS signature
        FROM pg_index i
        JOIN pg_class c ON c.oid = i.indexrelid
        JOIN pg_namespace n ON n.oid = c.relnamespace
        JOIN pg_am am ON am.oid = c.relam
        WHERE am.amname = 'btree'
          AND n.nspname NOT IN ('pg_catalog', 'information_schema')
          AND n.nspname !~ '^pg_toast'
    )
    SELECT
        current_database() AS database_name,
        kept.nspname AS schema_name,
        kept.relname AS index_name,
        dup.nspname AS duplicate_schema_name,
        dup.relname AS duplicate_index_name,
        dup.index_size AS index_size,
        NOT (kept.enforces_constraint AND dup.enforces_constraint) AS sides_resolved
    FROM btree_indexes kept
    JOIN btree_indexes dup
      ON dup.signature = kept.signature
     AND dup.indexrelid <> kept.indexrelid
     AND (kept.enforces_constraint::int, -kept.indexrelid::int8)
         > (dup.enforces_constraint::int, -dup.indexrelid::int8)
    ORDER BY dup.index_size DESC
"#;

// B-tree bloat estimate from planner statistics: compares actual pages against the
// pages the live tuples would need at the index fillfactor.
const BLOATED_QUERY: &str = r#"
    SELECT database_name, schema_name, index_name, index_size, bloat_ratio
    FROM (
        SELECT
            current_database() AS database_name,
            nspname AS schema_name,
            idxname AS index_name,
            (bs * relpages)::int8 AS index_size,
            CASE WHEN relpages > est_pages_ff
                THEN (100 * (relpages - est_pages_ff) / relpages)::float8
                ELSE 0::float8
            END AS bloat_ratio,
            is_na
        FROM (
            SELECT
                coalesce(1 + ceil(reltuples / floor(
                    (bs - pageopqdata - pagehdr) * fillfactor / (100 * (4 + nulldatahdrwidth)::float8)
                )), 0) AS est_pages_ff,
                bs, nspname, idxname, relpages, is_na
            FROM (
                SELECT
                    maxalign, bs, nspname, idxname, reltuples, relpages, fillfactor, pagehdr, pageopqdata, is_na,
                    (index_tuple_hdr_bm + maxalign
                        - CASE WHEN index_tuple_hdr_bm % maxalign = 0 THEN maxalign
                               ELSE index_tuple_hdr_bm % maxalign END
                     + nulldatawidth + maxalign
                        - CASE WHEN nulldatawidth = 0 THEN 0
                               WHEN nulldatawidth::int % maxalign = 0 THEN maxalign
                               ELSE nulldatawidth::int % maxalign END
                    )::numeric AS nulldatahdrwidth
                FROM (
                    SELECT
                        n.nspname,
                        i.idxname,
                        i.reltuples,
                        i.relpages,
                        i.idxoid,
                        i.fillfactor,
                        current_setting('block_size')::numeric AS bs,
                        CASE WHEN version() ~ 'mingw32|64-bit|x86_64|ppc64|ia64|amd64|aarch64'
                            THEN 8 ELSE 4 END AS maxalign,
                        24 AS pagehdr,
                        16 AS pageopqdata,
                        CASE WHEN max(coalesce(s.null_frac, 0)) = 0 THEN 8
                             ELSE 8 + ((32 + 8 - 1) / 8) END AS index_tuple_hdr_bm,
                        sum((1 - coalesce(s.null_frac, 0)) * coalesce(s.avg_width, 1024)) AS nulldatawidth,
                        max(CASE WHEN i.atttypid = 'pg_catalog.name'::regtype THEN 1 ELSE 0 END) > 0 AS is_na
                    FROM (
                        SELECT
                            ct.relnamespace,
                            ic.idxname,
                            ic.reltuples,
                            ic.relpages,
                            ic.idxoid,
                            ic.fillfactor,
                            coalesce(a1.attname, a2.attname) AS attname,
                            coalesce(a1.atttypid, a2.atttypid) AS atttypid,
                            CASE WHEN a1.attnum IS NULL THEN ic.idxname ELSE ct.relname END AS attrelname
                        FROM (
                            SELECT
                                idxname, reltuples, relpages, tbloid, idxoid, fillfactor, indkey,
                                generate_series(1, indnatts) AS attpos
                            FROM (
                                SELECT
                                    ci.relname AS idxname,
                                    ci.reltuples,
                                    ci.relpages,
                                    i.indrelid AS tbloid,
                                    i.indexrelid AS idxoid,
                                    coalesce(substring(array_to_string(ci.reloptions, ' ')
                                        FROM 'fillfactor=([0-9]+)')::smallint, 90) AS fillfactor,
                                    i.indnatts,
                                    string_to_array(textin(int2vectorout(i.indkey)), ' ')::int[] AS indkey
                                FROM pg_index i
                                JOIN pg_class ci ON ci.oid = i.indexrelid
                                WHERE ci.relam = (SELECT oid FROM pg_am WHERE amname = 'btree')
                                  AND ci.relpages > 0
                            ) AS idx_data
                        ) AS ic
                        JOIN pg_class ct ON ct.oid = ic.tbloid
                        LEFT JOIN pg_attribute a1
                            ON ic.indkey[ic.attpos] <> 0
                           AND a1.attrelid = ic.tbloid
                           AND a1.attnum = ic.indkey[ic.attpos]
                        LEFT JOIN pg_attribute a2
                            ON ic.indkey[ic.attpos] = 0
                           AND a2.attrelid = ic.idxoid
                           AND a2.attnum = ic.attpos
                    ) i
                    JOIN pg_namespace n ON n.oid = i.relnamespace
                    JOIN pg_stats s
                        ON s.schemaname = n.nspname
                       AND s.tablename = i.attrelname
                       AND s.attname = i.attname
                    GROUP BY 1, 2, 3, 4, 5, 6, 7, 8, 9, 10
                ) AS rows_data_stats
            ) AS rows_hdr_pdg_stats
        ) AS relation_stats
        WHERE nspname NOT IN ('pg_catalog', 'information_schema')
    ) AS estimates
    WHERE NOT is_na
      AND bloat_ratio >= $1
    ORDER BY index_size DESC
"#;

#[async_trait]
impl CatalogSource for PgCatalog {
    async fn fetch_unused(&self, _instance: &DbConfig) -> Result<Vec<UnusedIndexRow>> {
        // pg_stat_user_indexes.last_idx_scan only exists from PostgreSQL 16
        let last_scan = if self.server_version().await? >= PG16_VERSION_NUM {
            "to_char(s.last_idx_scan, 'YYYY-MM-DD HH24:MI:SS')"
        } else {
            "NULL::text"
        };
        let query = UNUSED_QUERY_TEMPLATE.replace("{last_scan}", last_scan);

        let rows = sqlx::query(&query)
            .bind(self.unused_scan_limit)
            .fetch_all(&self.pool)
            .await
            .context(QuerySnafu {
                query: query.as_str(),
            })?;

        let mut unused = Vec::with_capacity(rows.len());
        for row in rows {
            unused.push(UnusedIndexRow {
                database_name: column(&row, "database_name", &query)?,
                schema_name: column(&row, "schema_name", &query)?,
                index_name: column(&row, "index_name", &query)?,
                index_size: column(&row, "index_size", &query)?,
                index_scan: column(&row, "index_scan", &query)?,
                last_scan: column(&row, "last_scan", &query)?,
            });
        }

        debug!("Fetched {} unused index rows", unused.len());
        Ok(unused)
    }

    async fn fetch_invalid(&self, _instance: &DbConfig) -> Result<Vec<InvalidIndexRow>> {
        let rows = sqlx::query(INVALID_QUERY)
            .fetch_all(&self.pool)
            .await
            .context(QuerySnafu {
                query: INVALID_QUERY,
            })?;

        let mut invalid = Vec::with_capacity(rows.len());
        for row in rows {
            invalid.push(InvalidIndexRow {
                database_name: column(&row, "database_name", INVALID_QUERY)?,
                schema_name: column(&row, "schema_name", INVALID_QUERY)?,
                index_name: column(&row, "index_name", INVALID_QUERY)?,
                index_size: column(&row, "index_size", INVALID_QUERY)?,
                invalid_kind: column(&row, "invalid_kind", INVALID_QUERY)?,
            });
        }

        debug!("Fetched {} invalid index rows", invalid.len());
        Ok(invalid)
    }

    async fn fetch_duplicates(&self, _instance: &DbConfig) -> Result<Vec<DuplicateIndexRow>> {
        let rows = sqlx::query(DUPLICATE_QUERY)
            .fetch_all(&self.pool)
            .await
            .context(QuerySnafu {
                query: DUPLICATE_QUERY,
            })?;

        let mut duplicates = Vec::with_capacity(rows.len());
        for row in rows {
            duplicates.push(DuplicateIndexRow {
                database_name: column(&row, "database_name", DUPLICATE_QUERY)?,
                schema_name: column(&row, "schema_name", DUPLICATE_QUERY)?,
                index_name: column(&row, "index_name", DUPLICATE_QUERY)?,
                duplicate_schema_name: column(&row, "duplicate_schema_name", DUPLICATE_QUERY)?,
                duplicate_index_name: column(&row, "duplicate_index_name", DUPLICATE_QUERY)?,
                index_size: column(&row, "index_size", DUPLICATE_QUERY)?,
                sides_resolved: column(&row, "sides_resolved", DUPLICATE_QUERY)?,
            });
        }

        debug!("Fetched {} duplicate index pairs", duplicates.len());
        Ok(duplicates)
    }

    async fn fetch_bloated(
        &self,
        _instance: &DbConfig,
        threshold: BloatThreshold,
    ) -> Result<Vec<BloatedIndexRow>> {
        let rows = sqlx::query(BLOATED_QUERY)
            .bind(f64::from(threshold.percent()))
            .fetch_all(&self.pool)
            .await
            .context(QuerySnafu {
                query: BLOATED_QUERY,
            })?;

        let mut bloated = Vec::with_capacity(rows.len());
        for row in rows {
            bloated.push(BloatedIndexRow {
                database_name: column(&row, "database_name", BLOATED_QUERY)?,
                schema_name: column(&row, "schema_name", BLOATED_QUERY)?,
                index_name: column(&row, "index_name", BLOATED_QUERY)?,
                index_size: column(&row, "index_size", BLOATED_QUERY)?,
                bloat_ratio: column(&row, "bloat_ratio", BLOATED_QUERY)?,
            });
        }

        debug!("Fetched {} bloated index rows", bloated.len());
        Ok(bloated)
    }

    async fn instance_context(&self, _instance: &DbConfig) -> Result<InstanceContext> {
        let recovery_query = "SELECT pg_is_in_recovery()";
        let in_recovery = query_scalar::<_, bool>(recovery_query)
            .fetch_one(&self.pool)
            .await
            .context(QuerySnafu {
                query: recovery_query,
            })?;

        let replica_query = "SELECT EXISTS (SELECT 1 FROM pg_stat_replication)";
        let replica_attached = query_scalar::<_, bool>(replica_query)
            .fetch_one(&self.pool)
            .await
            .context(QuerySnafu {
                query: replica_query,
            })?;

        debug!(
            "Instance context: replica_attached={}, in_recovery={}",
            replica_attached, in_recovery
        );
        Ok(InstanceContext::new(replica_attached, in_recovery))
    }
}

fn column<'r, T>(row: &'r PgRow, name: &str, query: &str) -> Result<T>
where
    T: Decode<'r, Postgres> + Type<Postgres>,
{
    row.try_get(name).context(QuerySnafu { query })
}

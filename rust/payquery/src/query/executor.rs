//! Execution seam between the query engine and PostgreSQL.

use super::builder::{quote_ident, BindParam, CompiledQuery, POSITION_COLUMN};
use crate::{
    db::{PgPool, Pools},
    error::{Result, ServiceError},
};
use async_trait::async_trait;
use diesel::deserialize::QueryableByName;
use diesel::pg::Pg;
use diesel::query_builder::{BoxedSqlQuery, SqlQuery};
use diesel::sql_query;
use diesel::sql_types::{Bool, Int8, Jsonb, Text, Timestamptz};
use diesel_async::RunQueryDsl;
use serde_json::Value;
use std::{future::Future, time::Duration};
use tracing::{debug, error};

#[async_trait]
pub trait QueryExecutor: Send + Sync {
    /// Runs a compiled plan statement and returns each row as a JSON object keyed by output alias.
    async fn fetch_rows(&self, query: &CompiledQuery) -> Result<Vec<Value>>;

    /// Runs a statement that yields a single `"total"` bigint column.
    async fn count_rows(&self, query: &CompiledQuery) -> Result<i64>;

    /// Runs gate-approved freeform SQL on the read-only path.
    async fn fetch_freeform(&self, sql: &str) -> Result<Vec<Value>>;
}

#[derive(Clone)]
pub struct PgExecutor {
    pools: Pools,
    timeout: Duration,
}

impl PgExecutor {
    pub fn new(pools: Pools, timeout: Duration) -> Self {
        Self { pools, timeout }
    }

    async fn load_json(&self, pool: &PgPool, wrapped: String, params: &[BindParam]) -> Result<Vec<Value>> {
        debug!(sql = %wrapped, binds = params.len(), "executing statement");

        let mut query = sql_query(wrapped).into_boxed::<Pg>();
        for param in params {
            query = apply_bind(query, param);
        }

        let rows: Vec<JsonRow> = self
            .bounded(async {
                let mut conn = pool.get().await.map_err(|err| {
                    error!(error = ?err, "failed to acquire database connection");
                    ServiceError::Execution(format!("connection unavailable: {}", pool_error(&err)))
                })?;
                query
                    .load(&mut conn)
                    .await
                    .map_err(|err| ServiceError::Execution(err.to_string()))
            })
            .await?;

        Ok(rows.into_iter().map(|row| row.row).collect())
    }

    async fn bounded<T, F>(&self, future: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        tokio::time::timeout(self.timeout, future)
            .await
            .map_err(|_| ServiceError::Timeout(self.timeout))?
    }
}

#[async_trait]
impl QueryExecutor for PgExecutor {
    async fn fetch_rows(&self, query: &CompiledQuery) -> Result<Vec<Value>> {
        self.load_json(&self.pools.structured, wrap_ordered(&query.sql), &query.params)
            .await
    }

    async fn count_rows(&self, query: &CompiledQuery) -> Result<i64> {
        debug!(sql = %query.sql, binds = query.params.len(), "executing count");

        let mut statement = sql_query(query.sql.clone()).into_boxed::<Pg>();
        for param in &query.params {
            statement = apply_bind(statement, param);
        }

        let pool = &self.pools.structured;
        let rows: Vec<CountRow> = self
            .bounded(async {
                let mut conn = pool.get().await.map_err(|err| {
                    error!(error = ?err, "failed to acquire database connection");
                    ServiceError::Execution(format!("connection unavailable: {}", pool_error(&err)))
                })?;
                statement
                    .load(&mut conn)
                    .await
                    .map_err(|err| ServiceError::Execution(err.to_string()))
            })
            .await?;

        Ok(<[CountRow]>::first(&rows).map(|row| row.total).unwrap_or(0))
    }

    async fn fetch_freeform(&self, sql: &str) -> Result<Vec<Value>> {
        self.load_json(&self.pools.freeform, wrap_as_json(sql), &[]).await
    }
}

/// Same text as bb8's `Display` for `RunError`, which requires `E: std::error::Error`.
fn pool_error(err: &bb8::RunError<anyhow::Error>) -> String {
    match err {
        bb8::RunError::User(err) => err.to_string(),
        bb8::RunError::TimedOut => "Timed out in bb8".to_string(),
    }
}

fn wrap_as_json(sql: &str) -> String {
    format!("SELECT to_jsonb(q) AS row FROM (\n{sql}\n) AS q")
}

/// A subquery's ORDER BY does not bind the outer SELECT, so plan statements are re-sorted on the
/// position column the builder adds and that column is dropped from each row.
fn wrap_ordered(sql: &str) -> String {
    let position = quote_ident(POSITION_COLUMN);
    format!(
        "SELECT to_jsonb(q) - '{POSITION_COLUMN}' AS row FROM (\n{sql}\n) AS q\nORDER BY q.{position}"
    )
}

fn apply_bind<'a>(
    query: BoxedSqlQuery<'a, Pg, SqlQuery>,
    param: &BindParam,
) -> BoxedSqlQuery<'a, Pg, SqlQuery> {
    match param {
        BindParam::Text(value) => query.bind::<Text, _>(value.clone()),
        BindParam::Int(value) => query.bind::<Int8, _>(*value),
        BindParam::Decimal(value) => query.bind::<Text, _>(value.to_string()),
        BindParam::Bool(value) => query.bind::<Bool, _>(*value),
        BindParam::Timestamptz(value) => query.bind::<Timestamptz, _>(*value),
    }
}

#[derive(Debug, QueryableByName)]
struct JsonRow {
    #[diesel(sql_type = Jsonb)]
    row: Value,
}

#[derive(Debug, QueryableByName)]
struct CountRow {
    #[diesel(sql_type = Int8)]
    total: i64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wraps_statements_as_json_rows() {
        assert_eq!(
            wrap_as_json("SELECT 1 AS \"one\""),
            "SELECT to_jsonb(q) AS row FROM (\nSELECT 1 AS \"one\"\n) AS q"
        );
    }

    #[test]
    fn plan_statements_are_resorted_on_their_position() {
        let inner = "SELECT 1 AS \"one\", row_number() OVER () AS \"#position\"";
        assert_eq!(
            wrap_ordered(inner),
            format!(
                "SELECT to_jsonb(q) - '#position' AS row FROM (\n{inner}\n) AS q\nORDER BY q.\"#position\""
            )
        );
    }
}

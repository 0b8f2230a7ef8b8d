//! PostgreSQL adapter for the control-plane store.
//!
//! All SQL the data plane ever runs lives here. The loader and the health
//! checker read/write through the `ControlPlane` port; nothing on the
//! request path touches the pool.
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use eyre::{Result, WrapErr};
use sqlx::postgres::{PgPool, PgPoolOptions};

use crate::ports::control_plane::{
    BackendRecord, ControlPlane, ControlPlaneError, ControlPlaneResult, DomainRecord,
    IpRuleRecord, RateLimitRecord, RequestMetricsRow, TcpMetricsRow,
};

fn query_err(e: sqlx::Error) -> ControlPlaneError {
    match e {
        sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed | sqlx::Error::Io(_) => {
            ControlPlaneError::Unavailable(e.to_string())
        }
        other => ControlPlaneError::Query(other.to_string()),
    }
}

/// Control-plane adapter backed by a PostgreSQL pool.
pub struct PgControlPlane {
    pool: PgPool,
}

impl PgControlPlane {
    /// Connect to the store. The pool is sized for the three background
    /// loops, not for request traffic.
    pub async fn connect(database_url: &str) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(8)
            .acquire_timeout(std::time::Duration::from_secs(10))
            .connect(database_url)
            .await
            .wrap_err("Failed to connect to the control-plane database")?;

        Ok(Self { pool })
    }

    /// Wrap an existing pool (used by integration tests).
    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl ControlPlane for PgControlPlane {
    async fn fetch_domains(&self) -> ControlPlaneResult<Vec<DomainRecord>> {
        let rows: Vec<(i64, String, String, bool, bool, i32)> = sqlx::query_as(
            "SELECT id, name, target_url, ssl_enabled, health_check_enabled, \
             health_check_interval \
             FROM domains ORDER BY id",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(query_err)?;

        Ok(rows
            .into_iter()
            .map(
                |(id, name, target_url, ssl_enabled, health_check_enabled, health_check_interval)| {
                    DomainRecord {
                        id,
                        name,
                        target_url,
                        ssl_enabled,
                        health_check_enabled,
                        health_check_interval,
                    }
                },
            )
            .collect())
    }

    async fn fetch_backends(&self, domain_id: i64) -> ControlPlaneResult<Vec<BackendRecord>> {
        let rows: Vec<(i64, String, String, i32, i32, bool, Option<String>)> = sqlx::query_as(
            "SELECT id, scheme, ip, port, weight, is_active, health_status \
             FROM backend_servers WHERE domain_id = $1 ORDER BY id",
        )
        .bind(domain_id)
        .fetch_all(&self.pool)
        .await
        .map_err(query_err)?;

        Ok(rows
            .into_iter()
            .map(
                |(id, scheme, ip, port, weight, is_active, health_status)| BackendRecord {
                    id,
                    scheme,
                    ip,
                    port,
                    weight,
                    is_active,
                    health_status,
                },
            )
            .collect())
    }

    async fn fetch_ip_rules(&self, domain_id: i64) -> ControlPlaneResult<Vec<IpRuleRecord>> {
        let rows: Vec<(String, String, Option<String>)> = sqlx::query_as(
            "SELECT ip_range, rule_type, description \
             FROM ip_rules WHERE domain_id = $1 ORDER BY id",
        )
        .bind(domain_id)
        .fetch_all(&self.pool)
        .await
        .map_err(query_err)?;

        Ok(rows
            .into_iter()
            .map(|(ip_range, rule_type, description)| IpRuleRecord {
                ip_range,
                rule_type,
                description,
            })
            .collect())
    }

    async fn fetch_rate_limit(
        &self,
        domain_id: i64,
    ) -> ControlPlaneResult<Option<RateLimitRecord>> {
        // Most recently created row wins when several exist.
        let row: Option<(i32, i32, bool)> = sqlx::query_as(
            "SELECT requests_per_second, burst_size, per_ip \
             FROM rate_limits WHERE domain_id = $1 ORDER BY id DESC LIMIT 1",
        )
        .bind(domain_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(query_err)?;

        Ok(row.map(|(requests_per_second, burst_size, per_ip)| RateLimitRecord {
            requests_per_second,
            burst_size,
            per_ip,
        }))
    }

    async fn update_backend_health(
        &self,
        backend_id: i64,
        status: &str,
        checked_at: DateTime<Utc>,
    ) -> ControlPlaneResult<()> {
        sqlx::query(
            "UPDATE backend_servers SET health_status = $2, last_health_check = $3 WHERE id = $1",
        )
        .bind(backend_id)
        .bind(status)
        .bind(checked_at)
        .execute(&self.pool)
        .await
        .map_err(query_err)?;

        Ok(())
    }

    async fn append_request_metrics(&self, row: RequestMetricsRow) -> ControlPlaneResult<()> {
        sqlx::query(
            "INSERT INTO request_metrics \
             (domain_id, request_count, error_count, avg_response_time_ms, \
              p95_response_time_ms, p99_response_time_ms, created_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7)",
        )
        .bind(row.domain_id)
        .bind(row.request_count)
        .bind(row.error_count)
        .bind(row.avg_response_time_ms)
        .bind(row.p95_response_time_ms)
        .bind(row.p99_response_time_ms)
        .bind(row.window_end)
        .execute(&self.pool)
        .await
        .map_err(query_err)?;

        Ok(())
    }

    async fn append_tcp_metrics(&self, row: TcpMetricsRow) -> ControlPlaneResult<()> {
        sqlx::query(
            "INSERT INTO tcp_metrics \
             (domain_id, connection_count, avg_session_time_ms, \
              p95_session_time_ms, p99_session_time_ms, created_at) \
             VALUES ($1, $2, $3, $4, $5, $6)",
        )
        .bind(row.domain_id)
        .bind(row.connection_count)
        .bind(row.avg_session_time_ms)
        .bind(row.p95_session_time_ms)
        .bind(row.p99_session_time_ms)
        .bind(row.window_end)
        .execute(&self.pool)
        .await
        .map_err(query_err)?;

        Ok(())
    }
}

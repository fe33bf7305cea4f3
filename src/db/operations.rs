use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::{PgPool, Row};
use std::sync::Arc;
use std::time::Duration;

use crate::audit::{AuditEvent, AuditFilter};
use crate::auth::{OtpCheck, OtpStore};
use crate::db::models::*;
use crate::db::{AccountStore, AuditSink, FleetStore, UsageStore};
use crate::error::{AppError, DatabaseError};
use crate::fleet::SealedCredential;
use crate::Result;

/// PostgreSQL-backed storage.
#[derive(Clone)]
pub struct DbOperations {
    pool: Arc<PgPool>,
}

impl DbOperations {
    pub fn new(pool: Arc<PgPool>) -> Self {
        Self { pool }
    }

    pub async fn new_with_options(
        url: &str,
        max_connections: u32,
        acquire_timeout: Duration,
    ) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .acquire_timeout(acquire_timeout)
            .connect(url)
            .await
            .map_err(|e| AppError::DatabaseError(DatabaseError::ConnectionError(e.to_string())))?;

        Ok(Self { pool: Arc::new(pool) })
    }

    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("./migrations")
            .run(self.pool.as_ref())
            .await
            .map_err(|e| AppError::DatabaseError(DatabaseError::QueryError(e.to_string())))
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }
}

fn corrupt(column: &str, detail: String) -> sqlx::Error {
    sqlx::Error::ColumnDecode {
        index: column.to_string(),
        source: detail.into(),
    }
}

fn account_from_row(row: &PgRow) -> std::result::Result<Account, sqlx::Error> {
    let role: String = row.try_get("role")?;
    Ok(Account {
        id: row.try_get("id")?,
        phone_number: row.try_get("phone_number")?,
        password_hash: row.try_get("password_hash")?,
        role: role.parse().map_err(|e| corrupt("role", e))?,
        created_at: row.try_get("created_at")?,
        last_login: row.try_get("last_login")?,
        is_active: row.try_get("active")?,
    })
}

fn port_from_row(row: &PgRow) -> std::result::Result<u16, sqlx::Error> {
    let port: i32 = row.try_get("port")?;
    u16::try_from(port).map_err(|e| corrupt("port", e.to_string()))
}

fn node_from_row(row: &PgRow) -> std::result::Result<EndNode, sqlx::Error> {
    let credential: Option<String> = row.try_get("credential")?;
    let credential = credential
        .map(|raw| serde_json::from_str::<SealedCredential>(&raw))
        .transpose()
        .map_err(|e| corrupt("credential", e.to_string()))?;

    Ok(EndNode {
        id: row.try_get("name")?,
        host: row.try_get("host")?,
        port: port_from_row(row)?,
        status: row.try_get("status")?,
        location_id: row.try_get("location_id")?,
        credential,
        registered_at: row.try_get("created_at")?,
        last_seen: row.try_get("last_seen")?,
        last_response_ms: row.try_get("last_response_ms")?,
    })
}

fn binding_from_row(row: &PgRow) -> std::result::Result<UserBinding, sqlx::Error> {
    let protocol: String = row.try_get("protocol")?;
    Ok(UserBinding {
        username: row.try_get("username")?,
        server_id: row.try_get("server_id")?,
        port: port_from_row(row)?,
        protocol: protocol.parse().map_err(|e| corrupt("protocol", e))?,
        created_at: row.try_get("created_at")?,
    })
}

fn connection_from_row(row: &PgRow) -> std::result::Result<ConnectionEvent, sqlx::Error> {
    let status: String = row.try_get("status")?;
    Ok(ConnectionEvent {
        identity: row.try_get("username")?,
        status: status.parse().map_err(|e| corrupt("status", e))?,
        server_id: row.try_get("server_id")?,
        ip_address: row.try_get("ip_address")?,
        connected_at: row.try_get("connected_at")?,
        disconnected_at: row.try_get("disconnected_at")?,
        created_at: row.try_get("created_at")?,
    })
}

fn audit_from_row(row: &PgRow) -> std::result::Result<AuditEvent, sqlx::Error> {
    let action: String = row.try_get("action")?;
    Ok(AuditEvent {
        timestamp: row.try_get("timestamp")?,
        action: action.parse().map_err(|e| corrupt("action", e))?,
        actor: row.try_get("username")?,
        detail: row.try_get("details")?,
        origin: row.try_get("ip_address")?,
        server_id: row.try_get("server_id")?,
    })
}

const ACCOUNT_COLUMNS: &str = "id, phone_number, password_hash, role, created_at, last_login, active";
const NODE_COLUMNS: &str =
    "name, host, port, status, location_id, credential, created_at, last_seen, last_response_ms";
const BINDING_COLUMNS: &str = "username, server_id, port, protocol, created_at";

#[async_trait]
impl AccountStore for DbOperations {
    async fn find_account(&self, phone_number: &str) -> Result<Option<Account>> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM auth_users WHERE phone_number = $1",
            ACCOUNT_COLUMNS
        ))
        .bind(phone_number)
        .fetch_optional(self.pool.as_ref())
        .await?;

        Ok(row.as_ref().map(account_from_row).transpose()?)
    }

    async fn create_account(&self, account: NewAccount) -> Result<Account> {
        let now = Utc::now();
        let result = sqlx::query(&format!(
            r#"
            INSERT INTO auth_users (phone_number, password_hash, role, created_at, last_login, active)
            VALUES ($1, $2, $3, $4, $4, TRUE)
            RETURNING {}
            "#,
            ACCOUNT_COLUMNS
        ))
        .bind(&account.phone_number)
        .bind(&account.password_hash)
        .bind(account.role.as_str())
        .bind(now)
        .fetch_one(self.pool.as_ref())
        .await;

        match result {
            Ok(row) => Ok(account_from_row(&row)?),
            Err(sqlx::Error::Database(db)) if db.is_unique_violation() => Err(AppError::Conflict(
                "User with this phone number already exists".to_string(),
            )),
            Err(e) => Err(e.into()),
        }
    }

    async fn touch_last_login(&self, account_id: i64, at: DateTime<Utc>) -> Result<()> {
        sqlx::query("UPDATE auth_users SET last_login = $1 WHERE id = $2")
            .bind(at)
            .bind(account_id)
            .execute(self.pool.as_ref())
            .await?;
        Ok(())
    }

    async fn set_active(&self, phone_number: &str, active: bool) -> Result<bool> {
        let result = sqlx::query("UPDATE auth_users SET active = $1 WHERE phone_number = $2")
            .bind(active)
            .bind(phone_number)
            .execute(self.pool.as_ref())
            .await?;
        Ok(result.rows_affected() > 0)
    }
}

#[async_trait]
impl FleetStore for DbOperations {
    async fn upsert_node(&self, node: NewEndNode) -> Result<EndNode> {
        let credential = node
            .credential
            .as_ref()
            .map(serde_json::to_string)
            .transpose()
            .map_err(|e| AppError::InternalError(e.to_string()))?;
        let now = Utc::now();

        let row = sqlx::query(&format!(
            r#"
            INSERT INTO servers (name, host, port, status, location_id, credential, created_at, last_seen)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $7)
            ON CONFLICT (name) DO UPDATE SET
                host = EXCLUDED.host,
                port = EXCLUDED.port,
                status = EXCLUDED.status,
                location_id = EXCLUDED.location_id,
                credential = EXCLUDED.credential,
                last_seen = EXCLUDED.last_seen
            RETURNING {}
            "#,
            NODE_COLUMNS
        ))
        .bind(&node.id)
        .bind(&node.host)
        .bind(i32::from(node.port))
        .bind(&node.status)
        .bind(node.location_id)
        .bind(credential)
        .bind(now)
        .fetch_one(self.pool.as_ref())
        .await?;

        Ok(node_from_row(&row)?)
    }

    async fn remove_node(&self, node_id: &str) -> Result<bool> {
        // users.server_id cascades
        let result = sqlx::query("DELETE FROM servers WHERE name = $1")
            .bind(node_id)
            .execute(self.pool.as_ref())
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn get_node(&self, node_id: &str) -> Result<Option<EndNode>> {
        let row = sqlx::query(&format!("SELECT {} FROM servers WHERE name = $1", NODE_COLUMNS))
            .bind(node_id)
            .fetch_optional(self.pool.as_ref())
            .await?;
        Ok(row.as_ref().map(node_from_row).transpose()?)
    }

    async fn list_nodes(&self) -> Result<Vec<EndNode>> {
        let rows = sqlx::query(&format!("SELECT {} FROM servers ORDER BY name", NODE_COLUMNS))
            .fetch_all(self.pool.as_ref())
            .await?;
        Ok(rows.iter().map(node_from_row).collect::<std::result::Result<_, _>>()?)
    }

    async fn update_node_health(
        &self,
        node_id: &str,
        status: &str,
        response_ms: Option<i32>,
        at: DateTime<Utc>,
    ) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE servers SET status = $1, last_response_ms = $2, last_seen = $3 WHERE name = $4",
        )
        .bind(status)
        .bind(response_ms)
        .bind(at)
        .bind(node_id)
        .execute(self.pool.as_ref())
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn insert_binding(&self, binding: &UserBinding) -> Result<bool> {
        let result = sqlx::query(
            r#"
            INSERT INTO users (username, server_id, port, protocol, created_at)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (username, server_id) DO NOTHING
            "#,
        )
        .bind(&binding.username)
        .bind(&binding.server_id)
        .bind(i32::from(binding.port))
        .bind(binding.protocol.as_str())
        .bind(binding.created_at)
        .execute(self.pool.as_ref())
        .await;

        match result {
            Ok(done) => Ok(done.rows_affected() > 0),
            Err(sqlx::Error::Database(db)) if db.is_foreign_key_violation() => Err(
                AppError::NotFound(format!("End-node '{}' not found", binding.server_id)),
            ),
            Err(e) => Err(e.into()),
        }
    }

    async fn get_binding(&self, username: &str, node_id: &str) -> Result<Option<UserBinding>> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM users WHERE username = $1 AND server_id = $2",
            BINDING_COLUMNS
        ))
        .bind(username)
        .bind(node_id)
        .fetch_optional(self.pool.as_ref())
        .await?;
        Ok(row.as_ref().map(binding_from_row).transpose()?)
    }

    async fn list_bindings(&self) -> Result<Vec<UserBinding>> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM users ORDER BY created_at, username",
            BINDING_COLUMNS
        ))
        .fetch_all(self.pool.as_ref())
        .await?;
        Ok(rows.iter().map(binding_from_row).collect::<std::result::Result<_, _>>()?)
    }

    async fn bindings_for_user(&self, username: &str) -> Result<Vec<UserBinding>> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM users WHERE username = $1 ORDER BY created_at",
            BINDING_COLUMNS
        ))
        .bind(username)
        .fetch_all(self.pool.as_ref())
        .await?;
        Ok(rows.iter().map(binding_from_row).collect::<std::result::Result<_, _>>()?)
    }

    async fn delete_user_bindings(&self, username: &str) -> Result<u64> {
        let result = sqlx::query("DELETE FROM users WHERE username = $1")
            .bind(username)
            .execute(self.pool.as_ref())
            .await?;
        Ok(result.rows_affected())
    }

    async fn list_locations(&self) -> Result<Vec<Location>> {
        let rows = sqlx::query(
            r#"
            SELECT id, country, city, country_code, latitude, longitude, enabled
            FROM server_locations
            WHERE enabled = TRUE
            ORDER BY country, city
            "#,
        )
        .fetch_all(self.pool.as_ref())
        .await?;

        let mut locations = Vec::with_capacity(rows.len());
        for row in rows {
            let latitude: Option<f64> = row.try_get("latitude")?;
            let longitude: Option<f64> = row.try_get("longitude")?;
            locations.push(Location {
                id: row.try_get("id")?,
                country: row.try_get("country")?,
                city: row.try_get("city")?,
                country_code: row.try_get("country_code")?,
                latitude: latitude.unwrap_or_default(),
                longitude: longitude.unwrap_or_default(),
                enabled: row.try_get("enabled")?,
            });
        }
        Ok(locations)
    }
}

#[async_trait]
impl UsageStore for DbOperations {
    async fn record_connection(&self, event: &ConnectionEvent) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO vpn_connections
                (username, status, server_id, ip_address, connected_at, disconnected_at, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            "#,
        )
        .bind(&event.identity)
        .bind(event.status.as_str())
        .bind(&event.server_id)
        .bind(&event.ip_address)
        .bind(event.connected_at)
        .bind(event.disconnected_at)
        .bind(event.created_at)
        .execute(self.pool.as_ref())
        .await?;
        Ok(())
    }

    async fn record_usage(&self, sample: &UsageSample) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO vpn_statistics (username, server_id, bytes_in, bytes_out, duration_seconds, created_at)
            VALUES ($1, $2, $3, $4, $5, $6)
            "#,
        )
        .bind(&sample.identity)
        .bind(&sample.server_id)
        .bind(sample.bytes_in)
        .bind(sample.bytes_out)
        .bind(sample.duration_seconds)
        .bind(sample.created_at)
        .execute(self.pool.as_ref())
        .await?;
        Ok(())
    }

    async fn usage_summary(&self, identity: &str) -> Result<UsageSummary> {
        let row = sqlx::query(
            r#"
            SELECT
                COALESCE(SUM(bytes_in), 0)::BIGINT AS total_bytes_in,
                COALESCE(SUM(bytes_out), 0)::BIGINT AS total_bytes_out,
                COALESCE(SUM(duration_seconds), 0)::BIGINT AS total_duration,
                COUNT(*) AS connection_count
            FROM vpn_statistics
            WHERE username = $1
            "#,
        )
        .bind(identity)
        .fetch_one(self.pool.as_ref())
        .await?;

        let last_connection: Option<DateTime<Utc>> = sqlx::query_scalar(
            r#"
            SELECT created_at FROM vpn_connections
            WHERE username = $1 AND status = 'connected'
            ORDER BY created_at DESC
            LIMIT 1
            "#,
        )
        .bind(identity)
        .fetch_optional(self.pool.as_ref())
        .await?;

        Ok(UsageSummary {
            username: identity.to_string(),
            total_bytes_in: row.try_get("total_bytes_in")?,
            total_bytes_out: row.try_get("total_bytes_out")?,
            total_duration: row.try_get("total_duration")?,
            connection_count: row.try_get("connection_count")?,
            last_connection,
        })
    }

    async fn connection_history(&self, identity: &str, limit: i64) -> Result<Vec<ConnectionEvent>> {
        let rows = sqlx::query(
            r#"
            SELECT username, status, server_id, ip_address, connected_at, disconnected_at, created_at
            FROM vpn_connections
            WHERE username = $1
            ORDER BY created_at DESC
            LIMIT $2
            "#,
        )
        .bind(identity)
        .bind(limit)
        .fetch_all(self.pool.as_ref())
        .await?;
        Ok(rows.iter().map(connection_from_row).collect::<std::result::Result<_, _>>()?)
    }
}

#[async_trait]
impl AuditSink for DbOperations {
    async fn append(&self, event: &AuditEvent) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO audit_log (timestamp, action, username, details, ip_address, server_id)
            VALUES ($1, $2, $3, $4, $5, $6)
            "#,
        )
        .bind(event.timestamp)
        .bind(event.action.as_str())
        .bind(&event.actor)
        .bind(&event.detail)
        .bind(&event.origin)
        .bind(&event.server_id)
        .execute(self.pool.as_ref())
        .await?;
        Ok(())
    }

    async fn recent(&self, filter: &AuditFilter, limit: i64) -> Result<Vec<AuditEvent>> {
        let rows = sqlx::query(
            r#"
            SELECT timestamp, action, username, details, ip_address, server_id
            FROM audit_log
            WHERE ($1::TEXT IS NULL OR server_id = $1)
              AND ($2::TEXT IS NULL OR username = $2)
            ORDER BY timestamp DESC, id DESC
            LIMIT $3
            "#,
        )
        .bind(&filter.server_id)
        .bind(&filter.username)
        .bind(limit)
        .fetch_all(self.pool.as_ref())
        .await?;
        Ok(rows.iter().map(audit_from_row).collect::<std::result::Result<_, _>>()?)
    }
}

#[async_trait]
impl OtpStore for DbOperations {
    async fn put(&self, identifier: &str, code: &str, expires_at: DateTime<Utc>) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO otp_challenges (phone_number, code, expires_at, attempts)
            VALUES ($1, $2, $3, 0)
            ON CONFLICT (phone_number) DO UPDATE
            SET code = EXCLUDED.code, expires_at = EXCLUDED.expires_at, attempts = 0
            "#,
        )
        .bind(identifier)
        .bind(code)
        .bind(expires_at)
        .execute(self.pool.as_ref())
        .await?;
        Ok(())
    }

    async fn get(&self, identifier: &str) -> Result<Option<String>> {
        let code = sqlx::query_scalar(
            "SELECT code FROM otp_challenges WHERE phone_number = $1 AND expires_at > $2",
        )
        .bind(identifier)
        .bind(Utc::now())
        .fetch_optional(self.pool.as_ref())
        .await?;
        Ok(code)
    }

    async fn delete(&self, identifier: &str) -> Result<bool> {
        let result = sqlx::query("DELETE FROM otp_challenges WHERE phone_number = $1")
            .bind(identifier)
            .execute(self.pool.as_ref())
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn consume(&self, identifier: &str, code: &str, max_attempts: u32) -> Result<OtpCheck> {
        let now = Utc::now();
        // single statement so concurrent verifications cannot both win
        let consumed = sqlx::query(
            "DELETE FROM otp_challenges WHERE phone_number = $1 AND code = $2 AND expires_at > $3",
        )
        .bind(identifier)
        .bind(code)
        .bind(now)
        .execute(self.pool.as_ref())
        .await?;
        if consumed.rows_affected() > 0 {
            return Ok(OtpCheck::Consumed);
        }

        let attempts: Option<i32> = sqlx::query_scalar(
            r#"
            UPDATE otp_challenges SET attempts = attempts + 1
            WHERE phone_number = $1 AND expires_at > $2
            RETURNING attempts
            "#,
        )
        .bind(identifier)
        .bind(now)
        .fetch_optional(self.pool.as_ref())
        .await?;

        match attempts {
            Some(attempts) if attempts < max_attempts as i32 => Ok(OtpCheck::Mismatch),
            Some(_) => {
                self.delete(identifier).await?;
                Ok(OtpCheck::Exhausted)
            }
            None => {
                self.delete(identifier).await?;
                Ok(OtpCheck::Missing)
            }
        }
    }
}

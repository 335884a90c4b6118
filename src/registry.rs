//! Server registry: named connection profiles for source databases.
//!
//! Profiles live in the catalog `servers` table. Passwords are stored so the
//! extractor can connect, but no read path returns them; API reads go
//! through [`ServerInfo`].

use sqlx::{Row, SqlitePool};
use tracing::info;

use etl_harness_core::error::{EtlError, Result};
use etl_harness_core::models::{
    validate_server_name, ServerConfig, ServerInfo, ServerUpdate, SourceDriver,
};

use crate::db::{db_err, is_unique_violation, now_iso};

#[derive(Clone)]
pub struct ServerRegistry {
    pool: SqlitePool,
}

fn check_fields(host: &str, port: u16, user: &str) -> Result<()> {
    if host.trim().is_empty() {
        return Err(EtlError::invalid("host must not be empty"));
    }
    if port == 0 {
        return Err(EtlError::invalid("port must be between 1 and 65535"));
    }
    if user.trim().is_empty() {
        return Err(EtlError::invalid("user must not be empty"));
    }
    Ok(())
}

fn row_to_info(row: &sqlx::sqlite::SqliteRow) -> Result<ServerInfo> {
    let driver: String = row.get("driver");
    Ok(ServerInfo {
        server_name: row.get("server_name"),
        host: row.get("host"),
        port: row.get::<i64, _>("port") as u16,
        user: row.get("user"),
        driver: SourceDriver::parse(&driver)?,
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
    })
}

impl ServerRegistry {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn list(&self) -> Result<Vec<ServerInfo>> {
        let rows = sqlx::query(
            "SELECT server_name, host, port, user, driver, created_at, updated_at \
             FROM servers ORDER BY server_name",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;
        rows.iter().map(row_to_info).collect()
    }

    pub async fn create(&self, config: ServerConfig) -> Result<ServerInfo> {
        validate_server_name(&config.server_name)?;
        check_fields(&config.host, config.port, &config.user)?;

        let now = now_iso();
        sqlx::query(
            "INSERT INTO servers (server_name, host, port, user, password, driver, created_at, updated_at) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&config.server_name)
        .bind(&config.host)
        .bind(config.port as i64)
        .bind(&config.user)
        .bind(&config.password)
        .bind(config.driver.as_str())
        .bind(&now)
        .bind(&now)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            if is_unique_violation(&e) {
                EtlError::DuplicateKey(format!("server '{}'", config.server_name))
            } else {
                db_err(e)
            }
        })?;

        info!(server = %config.server_name, driver = config.driver.as_str(), "server registered");
        self.get(&config.server_name).await
    }

    pub async fn get(&self, name: &str) -> Result<ServerInfo> {
        let row = sqlx::query(
            "SELECT server_name, host, port, user, driver, created_at, updated_at \
             FROM servers WHERE server_name = ?",
        )
        .bind(name)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?
        .ok_or_else(|| EtlError::not_found(format!("server '{}'", name)))?;
        row_to_info(&row)
    }

    /// Replace the provided mutable fields. Renaming is not supported.
    pub async fn update(&self, name: &str, update: ServerUpdate) -> Result<ServerInfo> {
        if let Some(body_name) = &update.server_name {
            if body_name != name {
                return Err(EtlError::invalid(format!(
                    "server_name '{}' does not match path '{}'",
                    body_name, name
                )));
            }
        }
        let current = self.credentials(name).await?;
        let merged = ServerConfig {
            server_name: current.server_name,
            host: update.host.unwrap_or(current.host),
            port: update.port.unwrap_or(current.port),
            user: update.user.unwrap_or(current.user),
            password: update.password.unwrap_or(current.password),
            driver: update.driver.unwrap_or(current.driver),
        };
        check_fields(&merged.host, merged.port, &merged.user)?;

        let result = sqlx::query(
            "UPDATE servers SET host = ?, port = ?, user = ?, password = ?, driver = ?, updated_at = ? \
             WHERE server_name = ?",
        )
        .bind(&merged.host)
        .bind(merged.port as i64)
        .bind(&merged.user)
        .bind(&merged.password)
        .bind(merged.driver.as_str())
        .bind(now_iso())
        .bind(name)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        if result.rows_affected() == 0 {
            return Err(EtlError::not_found(format!("server '{}'", name)));
        }

        info!(server = %name, "server updated");
        self.get(name).await
    }

    pub async fn delete(&self, name: &str) -> Result<()> {
        let result = sqlx::query("DELETE FROM servers WHERE server_name = ?")
            .bind(name)
            .execute(&self.pool)
            .await
            .map_err(db_err)?;
        if result.rows_affected() == 0 {
            return Err(EtlError::not_found(format!("server '{}'", name)));
        }
        info!(server = %name, "server removed");
        Ok(())
    }

    /// Full profile including the password, for opening source connections.
    pub async fn credentials(&self, name: &str) -> Result<ServerConfig> {
        let row = sqlx::query(
            "SELECT server_name, host, port, user, password, driver FROM servers WHERE server_name = ?",
        )
        .bind(name)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?
        .ok_or_else(|| EtlError::not_found(format!("server '{}'", name)))?;
        let driver: String = row.get("driver");
        Ok(ServerConfig {
            server_name: row.get("server_name"),
            host: row.get("host"),
            port: row.get::<i64, _>("port") as u16,
            user: row.get("user"),
            password: row.get("password"),
            driver: SourceDriver::parse(&driver)?,
        })
    }
}

//! Target-store connection handling.

use std::collections::HashSet;
use std::str::FromStr;
use std::time::Duration;

use anyhow::{Context, Result};
use sqlx::postgres::{PgConnectOptions, PgPoolOptions, PgSslMode};
use sqlx::PgPool;
use tracing::{info, instrument};

use crate::util::env as env_util;

#[derive(Clone)]
pub struct Db {
    pub pool: PgPool,
}

impl Db {
    // SECURITY: never include raw DSNs in tracing spans (they may contain credentials).
    #[instrument(skip(database_url))]
    pub async fn connect(database_url: &str, max_connections: u32) -> Result<Self> {
        let mut connect_options = PgConnectOptions::from_str(database_url)?;

        // Ensure TLS is enabled when the DSN asks for it explicitly.
        if database_url.contains("sslmode=require") && !database_url.contains("sslmode=disable") {
            connect_options = connect_options.ssl_mode(PgSslMode::Require);
        }

        // PgBouncer txn mode safe
        connect_options = connect_options.statement_cache_capacity(0);

        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .acquire_timeout(Duration::from_secs(10))
            .idle_timeout(Duration::from_secs(600))
            .connect_with(connect_options)
            .await
            .context("connecting to target store")?;
        info!("connected to db");

        // Optional auto-migrate gate (default: ON for this pipeline; the
        // schema is owned by the loader, not by a separate service).
        if env_util::env_flag("AUTO_MIGRATE", true) {
            sqlx::migrate!("./migrations")
                .run(&pool)
                .await
                .context("running migrations")?;
            info!("migrations up-to-date");
        } else {
            info!("AUTO_MIGRATE disabled; skipping migrations");
        }
        Ok(Self { pool })
    }

    pub async fn connect_from_env() -> Result<Self> {
        let url = env_util::db_url()?;
        let max_conns: u32 = env_util::env_parse("DB_MAX_CONNS", 5u32);
        Self::connect(&url, max_conns).await
    }

    /// All appids currently present in the primary entity table. Used by the
    /// review loader's pre-flight check and by the gap detector.
    pub async fn existing_appids(&self) -> Result<HashSet<i64>> {
        let rows: Vec<i64> = sqlx::query_scalar("SELECT appid FROM applications")
            .persistent(false)
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.into_iter().collect())
    }

    /// Row counts for the core tables, for the post-import summary report.
    pub async fn table_counts(&self) -> Result<Vec<(&'static str, i64)>> {
        let mut counts = Vec::new();
        for table in [
            "applications",
            "developers",
            "publishers",
            "genres",
            "categories",
            "application_developers",
            "application_publishers",
            "application_genres",
            "application_categories",
            "reviews",
        ] {
            let count: i64 = sqlx::query_scalar(&format!("SELECT COUNT(*) FROM {table}"))
                .persistent(false)
                .fetch_one(&self.pool)
                .await
                .with_context(|| format!("counting rows in {table}"))?;
            counts.push((table, count));
        }
        Ok(counts)
    }
}

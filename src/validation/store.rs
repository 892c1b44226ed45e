//! Stages 4-5: checks against the target store.
//!
//! Stage 4 re-verifies what the schema's constraints should already
//! guarantee; a hit here means the schema drifted or rows arrived through a
//! side door, which is CRITICAL. Stage 5 compares the materialized columns
//! against their JSONB source fragments.

use anyhow::{Context, Result};

use super::{Severity, StageReport};
use crate::db::Db;

async fn count(db: &Db, sql: &str) -> Result<i64> {
    sqlx::query_scalar(sql)
        .persistent(false)
        .fetch_one(&db.pool)
        .await
        .with_context(|| format!("validation query failed: {sql}"))
}

/// Stage 4: referential and uniqueness constraints.
pub async fn constraints(db: &Db) -> Result<StageReport> {
    let mut report = StageReport::new(4, "store constraints");

    let orphan_reviews = count(
        db,
        "SELECT COUNT(*) FROM reviews r \
         LEFT JOIN applications a ON a.appid = r.appid \
         WHERE a.appid IS NULL",
    )
    .await?;
    if orphan_reviews > 0 {
        report.add(
            Severity::Critical,
            "reviews without a parent application",
            orphan_reviews as u64,
        );
    }

    for (junction, lookup, column) in [
        ("application_developers", "developers", "developer_id"),
        ("application_publishers", "publishers", "publisher_id"),
        ("application_genres", "genres", "genre_id"),
        ("application_categories", "categories", "category_id"),
    ] {
        let orphans = count(
            db,
            &format!(
                "SELECT COUNT(*) FROM {junction} j \
                 LEFT JOIN applications a ON a.appid = j.appid \
                 LEFT JOIN {lookup} l ON l.id = j.{column} \
                 WHERE a.appid IS NULL OR l.id IS NULL"
            ),
        )
        .await?;
        if orphans > 0 {
            report.add(
                Severity::Critical,
                format!("orphaned rows in {junction}"),
                orphans as u64,
            );
        }
    }

    for lookup in ["developers", "publishers", "genres", "categories"] {
        let dupes = count(
            db,
            &format!(
                "SELECT COUNT(*) FROM \
                 (SELECT name FROM {lookup} GROUP BY name HAVING COUNT(*) > 1) d"
            ),
        )
        .await?;
        if dupes > 0 {
            report.add(
                Severity::Critical,
                format!("duplicate names in {lookup}"),
                dupes as u64,
            );
        }
    }

    let total: i64 = count(db, "SELECT COUNT(*) FROM applications").await?;
    report.checked = total.max(0) as u64;
    Ok(report)
}

/// Stage 5: materialized columns vs their JSONB source.
pub async fn materialization(db: &Db) -> Result<StageReport> {
    let mut report = StageReport::new(5, "materialized consistency");
    let total: i64 = count(db, "SELECT COUNT(*) FROM applications").await?;
    report.checked = total.max(0) as u64;

    for (platform, column) in [
        ("windows", "supports_windows"),
        ("mac", "supports_mac"),
        ("linux", "supports_linux"),
    ] {
        let mismatches = count(
            db,
            &format!(
                "SELECT COUNT(*) FROM applications \
                 WHERE platforms IS NOT NULL \
                 AND {column} IS DISTINCT FROM \
                 COALESCE((platforms->>'{platform}')::boolean, FALSE)"
            ),
        )
        .await?;
        if mismatches > 0 {
            report.add(
                Severity::Error,
                format!("{column} disagrees with the platforms payload"),
                mismatches as u64,
            );
        }
    }

    // Price columns only materialize for non-free applications; the loader
    // nulls them when the free flag contradicts a positive price.
    let price_mismatches = count(
        db,
        "SELECT COUNT(*) FROM applications \
         WHERE price_overview IS NOT NULL AND is_free = FALSE \
         AND (final_price IS DISTINCT FROM (price_overview->>'final')::integer \
           OR initial_price IS DISTINCT FROM (price_overview->>'initial')::integer)",
    )
    .await?;
    if price_mismatches > 0 {
        report.add(
            Severity::Error,
            "price columns disagree with the price_overview payload",
            price_mismatches as u64,
        );
    }

    let priced_free = count(
        db,
        "SELECT COUNT(*) FROM applications WHERE is_free = TRUE AND final_price > 0",
    )
    .await?;
    if priced_free > 0 {
        report.add(
            Severity::Error,
            "free applications with a positive materialized price",
            priced_free as u64,
        );
    }

    let bad_discounts = count(
        db,
        "SELECT COUNT(*) FROM applications \
         WHERE discount_percent > 0 AND final_price >= initial_price",
    )
    .await?;
    if bad_discounts > 0 {
        report.add(
            Severity::Warning,
            "discounted applications whose final price is not below the initial price",
            bad_discounts as u64,
        );
    }

    let achievement_mismatches = count(
        db,
        "SELECT COUNT(*) FROM applications \
         WHERE achievements IS NOT NULL \
         AND achievement_count IS DISTINCT FROM (achievements->>'total')::integer",
    )
    .await?;
    if achievement_mismatches > 0 {
        report.add(
            Severity::Warning,
            "achievement_count disagrees with the achievements payload",
            achievement_mismatches as u64,
        );
    }

    Ok(report)
}

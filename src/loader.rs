//! Defensive bulk loader: streams raw batch collections into the target
//! store in three ordered phases.
//!
//! Phase 1 upserts the lookup dimensions (developers, publishers, genres,
//! categories) and fetches name -> id maps. Phase 2 inserts applications
//! with their junction rows, batched through `QueryBuilder::push_values`.
//! Phase 3 inserts reviews, dropping any review whose parent application is
//! absent (those appids are the gap inventory). Later phases have hard
//! foreign-key dependencies on earlier ones; the order is load-bearing.
//!
//! A malformed record is skipped, never fatal. A constraint failure or an
//! unreachable store aborts the load; everything flushed before the abort
//! stays durable.

use std::collections::{HashMap, HashSet};
use std::path::Path;

use anyhow::{Context, Result};
use chrono::{DateTime, NaiveDate, Utc};
use serde_json::{Map, Value};
use sqlx::{Postgres, QueryBuilder};
use tracing::{debug, info, instrument, warn};

use crate::db::Db;
use crate::error::PipelineError;
use crate::stream;
use crate::util::env as env_util;

const APP_TYPES: [&str; 6] = ["game", "dlc", "software", "video", "demo", "music"];

#[derive(Debug, Default, Clone, serde::Serialize)]
pub struct LoadSummary {
    pub imported: u64,
    pub skipped: u64,
    pub errors: u64,
}

impl std::fmt::Display for LoadSummary {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "imported={} skipped={} errors={}",
            self.imported, self.skipped, self.errors
        )
    }
}

/// Minimal shape contract for a raw appdetails record: an object with a
/// truthy `success` flag and an object `data` payload. Anything else is
/// skipped by the loader, never raised.
pub fn record_payload(record: &Value) -> Option<&Map<String, Value>> {
    let obj = record.as_object()?;
    if obj.get("success").and_then(Value::as_bool) != Some(true) {
        return None;
    }
    obj.get("data").and_then(Value::as_object)
}

/// Storefront release dates arrive as `"12 Nov, 2024"` or `"Nov 12, 2024"`;
/// anything unparseable (TBA, "To be announced", bare years) maps to None.
pub fn parse_release_date(raw: &str) -> Option<NaiveDate> {
    let cleaned = raw.replace(',', "");
    let cleaned = cleaned.trim();
    if cleaned.is_empty() || cleaned.contains("TBA") || cleaned.contains("announced") {
        return None;
    }
    NaiveDate::parse_from_str(cleaned, "%d %b %Y")
        .or_else(|_| NaiveDate::parse_from_str(cleaned, "%b %d %Y"))
        .ok()
}

fn sanitize_required_age(raw: Option<&Value>) -> String {
    match raw {
        Some(Value::String(s)) => s.clone(),
        Some(Value::Number(n)) => n.to_string(),
        _ => "0".to_string(),
    }
}

#[derive(Debug, Clone)]
pub struct AppRow {
    pub appid: i64,
    pub name: String,
    pub kind: Option<String>,
    pub is_free: Option<bool>,
    pub release_date: Option<NaiveDate>,
    pub required_age: String,
    pub metacritic_score: Option<i32>,
    pub recommendations_total: Option<i32>,
    pub header_image: Option<String>,
    pub background: Option<String>,
    pub short_description: Option<String>,
    pub about_the_game: Option<String>,
    pub detailed_description: Option<String>,
    pub supported_languages: Option<String>,
    pub base_app_id: Option<i64>,
    pub price_overview: Option<Value>,
    pub platforms: Option<Value>,
    pub pc_requirements: Option<Value>,
    pub mac_requirements: Option<Value>,
    pub linux_requirements: Option<Value>,
    pub achievements: Option<Value>,
    pub screenshots: Option<Value>,
    pub movies: Option<Value>,
    pub ratings: Option<Value>,
    pub package_groups: Option<Value>,
    pub content_descriptors: Option<Value>,
    pub supports_windows: bool,
    pub supports_mac: bool,
    pub supports_linux: bool,
    pub initial_price: Option<i32>,
    pub final_price: Option<i32>,
    pub discount_percent: Option<i32>,
    pub currency: Option<String>,
    pub achievement_count: Option<i32>,
    pub fetched_at: Option<DateTime<Utc>>,
}

/// One valid application record plus its lookup references.
#[derive(Debug, Clone)]
pub struct ExtractedApp {
    pub row: AppRow,
    pub developers: Vec<String>,
    pub publishers: Vec<String>,
    pub genres: Vec<String>,
    pub categories: Vec<String>,
}

fn string_of(data: &Map<String, Value>, key: &str) -> Option<String> {
    data.get(key).and_then(Value::as_str).map(str::to_string)
}

fn i32_of(v: Option<&Value>) -> Option<i32> {
    v.and_then(Value::as_i64).and_then(|n| i32::try_from(n).ok())
}

fn json_of(data: &Map<String, Value>, key: &str) -> Option<Value> {
    match data.get(key) {
        Some(Value::Null) | None => None,
        Some(v) => Some(v.clone()),
    }
}

fn names_of(data: &Map<String, Value>, key: &str) -> Vec<String> {
    data.get(key)
        .and_then(Value::as_array)
        .map(|items| {
            items
                .iter()
                .filter_map(Value::as_str)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default()
}

fn descriptions_of(data: &Map<String, Value>, key: &str) -> Vec<String> {
    data.get(key)
        .and_then(Value::as_array)
        .map(|items| {
            items
                .iter()
                .filter_map(|e| e.get("description").and_then(Value::as_str))
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default()
}

/// Extract the typed row and lookup references from one raw record.
/// A record failing the minimal contract yields `MalformedRecord`; the
/// caller counts it as skipped and moves on.
pub fn extract_app(record: &Value) -> Result<ExtractedApp, PipelineError> {
    let data = record_payload(record).ok_or_else(|| {
        PipelineError::MalformedRecord("missing success flag or data payload".into())
    })?;
    let appid = data
        .get("steam_appid")
        .and_then(Value::as_i64)
        .ok_or_else(|| PipelineError::MalformedRecord("missing integral steam_appid".into()))?;
    let name = string_of(data, "name")
        .filter(|n| !n.is_empty())
        .ok_or_else(|| PipelineError::MalformedRecord(format!("appid {appid}: missing name")))?;

    let kind = string_of(data, "type").filter(|t| APP_TYPES.contains(&t.as_str()));
    let is_free = data.get("is_free").and_then(Value::as_bool);

    let price_overview = json_of(data, "price_overview");
    let price_obj = price_overview.as_ref().and_then(Value::as_object);
    let mut initial_price = i32_of(price_obj.and_then(|p| p.get("initial")));
    let mut final_price = i32_of(price_obj.and_then(|p| p.get("final")));
    let mut discount_percent = i32_of(price_obj.and_then(|p| p.get("discount_percent")));
    let mut currency = price_obj
        .and_then(|p| p.get("currency"))
        .and_then(Value::as_str)
        .map(str::to_string);

    // Business rule: a record flagged free must not carry a positive price.
    // The raw payload keeps whatever the source said; only the materialized
    // columns are nulled.
    if is_free == Some(true) && (initial_price.unwrap_or(0) > 0 || final_price.unwrap_or(0) > 0) {
        warn!(appid, "free application with positive price; dropping materialized price");
        initial_price = None;
        final_price = None;
        discount_percent = None;
        currency = None;
    }

    let platforms = json_of(data, "platforms");
    let platform_flag = |key: &str| -> bool {
        platforms
            .as_ref()
            .and_then(|p| p.get(key))
            .and_then(Value::as_bool)
            .unwrap_or(false)
    };
    let supports_windows = platform_flag("windows");
    let supports_mac = platform_flag("mac");
    let supports_linux = platform_flag("linux");

    let achievements = json_of(data, "achievements");
    let achievement_count = i32_of(achievements.as_ref().and_then(|a| a.get("total")));

    let release_date = data
        .get("release_date")
        .and_then(|r| r.get("date"))
        .and_then(Value::as_str)
        .and_then(parse_release_date);

    let base_app_id = data.get("fullgame").and_then(|f| f.get("appid")).and_then(|v| {
        v.as_i64()
            .or_else(|| v.as_str().and_then(|s| s.parse().ok()))
    });

    let fetched_at = record
        .get("fetched_at")
        .and_then(Value::as_str)
        .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
        .map(|dt| dt.with_timezone(&Utc));

    let row = AppRow {
        appid,
        kind,
        is_free,
        release_date,
        required_age: sanitize_required_age(data.get("required_age")),
        metacritic_score: i32_of(data.get("metacritic").and_then(|m| m.get("score"))),
        recommendations_total: i32_of(data.get("recommendations").and_then(|r| r.get("total"))),
        header_image: string_of(data, "header_image"),
        background: string_of(data, "background"),
        short_description: string_of(data, "short_description"),
        about_the_game: string_of(data, "about_the_game"),
        detailed_description: string_of(data, "detailed_description"),
        supported_languages: string_of(data, "supported_languages"),
        base_app_id,
        supports_windows,
        supports_mac,
        supports_linux,
        pc_requirements: json_of(data, "pc_requirements"),
        mac_requirements: json_of(data, "mac_requirements"),
        linux_requirements: json_of(data, "linux_requirements"),
        screenshots: json_of(data, "screenshots"),
        movies: json_of(data, "movies"),
        ratings: json_of(data, "ratings"),
        package_groups: json_of(data, "package_groups"),
        content_descriptors: json_of(data, "content_descriptors"),
        price_overview,
        platforms,
        achievements,
        initial_price,
        final_price,
        discount_percent,
        currency,
        achievement_count,
        fetched_at,
        name,
    };

    Ok(ExtractedApp {
        developers: names_of(data, "developers"),
        publishers: names_of(data, "publishers"),
        genres: descriptions_of(data, "genres"),
        categories: descriptions_of(data, "categories"),
        row,
    })
}

#[derive(Debug, Clone)]
pub struct ReviewRow {
    pub recommendationid: String,
    pub appid: i64,
    pub author_steamid: Option<String>,
    pub author_num_games_owned: Option<i32>,
    pub author_num_reviews: Option<i32>,
    pub author_playtime_forever: Option<i64>,
    pub author_playtime_at_review: Option<i64>,
    pub language: Option<String>,
    pub review_text: Option<String>,
    pub timestamp_created: Option<i64>,
    pub timestamp_updated: Option<i64>,
    pub voted_up: Option<bool>,
    pub votes_up: Option<i64>,
    pub votes_funny: Option<i64>,
    pub weighted_vote_score: Option<f64>,
    pub comment_count: Option<i64>,
    pub steam_purchase: Option<bool>,
    pub received_for_free: Option<bool>,
    pub written_during_early_access: Option<bool>,
}

/// Reviews for one raw review record, keyed by the owning appid.
/// A wrapper failing the shape contract yields `MalformedRecord`.
pub fn extract_reviews(record: &Value) -> Result<(i64, Vec<ReviewRow>), PipelineError> {
    let malformed = |reason: &str| PipelineError::MalformedRecord(reason.into());
    let obj = record
        .as_object()
        .ok_or_else(|| malformed("review record is not an object"))?;
    let appid = obj
        .get("appid")
        .and_then(Value::as_i64)
        .ok_or_else(|| malformed("review record without an integral appid"))?;
    let payload = obj
        .get("reviews")
        .and_then(Value::as_object)
        .ok_or_else(|| malformed("review record without a reviews payload"))?;
    if payload.get("success").and_then(Value::as_i64) != Some(1) {
        return Err(malformed("review payload without success=1"));
    }
    let entries = payload
        .get("reviews")
        .and_then(Value::as_array)
        .ok_or_else(|| malformed("review payload without a reviews array"))?;

    let rows = entries
        .iter()
        .filter_map(|review| {
            let recommendationid = match review.get("recommendationid") {
                Some(Value::String(s)) if !s.is_empty() => s.clone(),
                Some(Value::Number(n)) => n.to_string(),
                _ => return None,
            };
            let author = review.get("author");
            let author_get = |key: &str| author.and_then(|a| a.get(key)).cloned();
            Some(ReviewRow {
                recommendationid,
                appid,
                author_steamid: author_get("steamid").as_ref().and_then(Value::as_str).map(str::to_string),
                author_num_games_owned: i32_of(author_get("num_games_owned").as_ref()),
                author_num_reviews: i32_of(author_get("num_reviews").as_ref()),
                author_playtime_forever: author_get("playtime_forever").as_ref().and_then(Value::as_i64),
                author_playtime_at_review: author_get("playtime_at_review").as_ref().and_then(Value::as_i64),
                language: review.get("language").and_then(Value::as_str).map(str::to_string),
                review_text: review.get("review").and_then(Value::as_str).map(str::to_string),
                timestamp_created: review.get("timestamp_created").and_then(Value::as_i64),
                timestamp_updated: review.get("timestamp_updated").and_then(Value::as_i64),
                voted_up: review.get("voted_up").and_then(Value::as_bool),
                votes_up: review.get("votes_up").and_then(Value::as_i64),
                votes_funny: review.get("votes_funny").and_then(Value::as_i64),
                weighted_vote_score: weighted_score(review.get("weighted_vote_score")),
                comment_count: review.get("comment_count").and_then(Value::as_i64),
                steam_purchase: review.get("steam_purchase").and_then(Value::as_bool),
                received_for_free: review.get("received_for_free").and_then(Value::as_bool),
                written_during_early_access: review
                    .get("written_during_early_access")
                    .and_then(Value::as_bool),
            })
        })
        .collect();
    Ok((appid, rows))
}

// The score arrives as either a JSON number or a decimal-in-string.
fn weighted_score(v: Option<&Value>) -> Option<f64> {
    match v {
        Some(Value::Number(n)) => n.as_f64(),
        Some(Value::String(s)) => s.parse().ok(),
        _ => None,
    }
}

#[derive(Debug, Default)]
struct LookupSets {
    developers: HashSet<String>,
    publishers: HashSet<String>,
    genres: HashSet<String>,
    categories: HashSet<String>,
}

struct LookupMaps {
    developers: HashMap<String, i64>,
    publishers: HashMap<String, i64>,
    genres: HashMap<String, i64>,
    categories: HashMap<String, i64>,
}

#[derive(Default)]
struct JunctionBatch {
    developers: Vec<(i64, i64)>,
    publishers: Vec<(i64, i64)>,
    genres: Vec<(i64, i64)>,
    categories: Vec<(i64, i64)>,
}

pub struct BulkLoader {
    db: Db,
    batch_size: usize,
}

impl BulkLoader {
    pub fn new(db: Db) -> Self {
        let batch_size = env_util::env_parse("LOADER_BATCH_SIZE", 1000usize).max(1);
        Self { db, batch_size }
    }

    pub fn with_batch_size(db: Db, batch_size: usize) -> Self {
        Self {
            db,
            batch_size: batch_size.max(1),
        }
    }

    /// Load an appdetails batch collection. Phases 1 and 2 of the load run
    /// here; reviews are a separate collection (`load_reviews`).
    #[instrument(skip(self))]
    pub async fn load_games(&self, games_dir: &Path) -> Result<LoadSummary> {
        info!(dir = %games_dir.display(), "phase 1: populating lookup tables");
        let lookups = self.collect_lookups(games_dir).await?;
        self.upsert_lookups(&lookups).await?;
        let maps = self.fetch_lookup_maps().await?;

        info!("phase 2: inserting application and relational data");
        let mut summary = LoadSummary::default();
        let mut apps: Vec<ExtractedApp> = Vec::with_capacity(self.batch_size);

        let (mut rx, reader) = stream::record_channel(games_dir.to_path_buf(), 256);
        while let Some(record) = rx.recv().await {
            match extract_app(&record) {
                Ok(extracted) => {
                    apps.push(extracted);
                    summary.imported += 1;
                    if apps.len() >= self.batch_size {
                        self.flush_apps(&mut apps, &maps).await?;
                    }
                }
                Err(err) => {
                    debug!(error = %err, "skipping record");
                    summary.skipped += 1;
                }
            }
        }
        reader.await.context("record reader panicked")??;
        self.flush_apps(&mut apps, &maps).await?;

        info!(%summary, "games load complete");
        Ok(summary)
    }

    /// Load a review batch collection (phase 3). Reviews whose parent
    /// application is absent are dropped and surface later as gaps.
    #[instrument(skip(self))]
    pub async fn load_reviews(&self, reviews_dir: &Path) -> Result<LoadSummary> {
        info!("fetching existing application ids for referential pre-check");
        let existing = self.db.existing_appids().await?;
        info!(count = existing.len(), "existing applications");

        let mut summary = LoadSummary::default();
        let mut missing_parents: HashSet<i64> = HashSet::new();
        let mut rows: Vec<ReviewRow> = Vec::with_capacity(self.batch_size);

        let (mut rx, reader) = stream::record_channel(reviews_dir.to_path_buf(), 256);
        while let Some(record) = rx.recv().await {
            let (appid, reviews) = match extract_reviews(&record) {
                Ok(parsed) => parsed,
                Err(err) => {
                    debug!(error = %err, "skipping review record");
                    summary.skipped += 1;
                    continue;
                }
            };
            if !existing.contains(&appid) {
                missing_parents.insert(appid);
                summary.skipped += 1;
                continue;
            }
            for row in reviews {
                rows.push(row);
                summary.imported += 1;
                if rows.len() >= self.batch_size {
                    self.flush_reviews(&mut rows).await?;
                }
            }
        }
        reader.await.context("record reader panicked")??;
        self.flush_reviews(&mut rows).await?;

        if !missing_parents.is_empty() {
            warn!(
                apps = missing_parents.len(),
                "dropped reviews for applications absent from the store; run find-gaps + backfill"
            );
        }
        info!(%summary, "reviews load complete");
        Ok(summary)
    }

    /// Phase 1 scan: single streaming pass collecting unique lookup names.
    async fn collect_lookups(&self, games_dir: &Path) -> Result<LookupSets> {
        let (mut rx, reader) = stream::record_channel(games_dir.to_path_buf(), 256);
        let mut sets = LookupSets::default();
        while let Some(record) = rx.recv().await {
            if let Ok(extracted) = extract_app(&record) {
                sets.developers.extend(extracted.developers);
                sets.publishers.extend(extracted.publishers);
                sets.genres.extend(extracted.genres);
                sets.categories.extend(extracted.categories);
            }
        }
        reader.await.context("record reader panicked")??;
        Ok(sets)
    }

    async fn upsert_lookups(&self, sets: &LookupSets) -> Result<()> {
        for (table, names) in [
            ("developers", &sets.developers),
            ("publishers", &sets.publishers),
            ("genres", &sets.genres),
            ("categories", &sets.categories),
        ] {
            let mut inserted = 0usize;
            let names: Vec<&String> = names.iter().collect();
            for chunk in names.chunks(self.batch_size) {
                let mut qb: QueryBuilder<'_, Postgres> =
                    QueryBuilder::new(format!("INSERT INTO {table} (name) "));
                qb.push_values(chunk, |mut b, name| {
                    b.push_bind(name.as_str());
                });
                qb.push(" ON CONFLICT (name) DO NOTHING");
                let result = qb
                    .build()
                    .persistent(false)
                    .execute(&self.db.pool)
                    .await
                    .map_err(classify_db_error)?;
                inserted += result.rows_affected() as usize;
            }
            info!(table, unique = names.len(), inserted, "lookup table populated");
        }
        Ok(())
    }

    async fn fetch_lookup_maps(&self) -> Result<LookupMaps> {
        async fn fetch(db: &Db, table: &str) -> Result<HashMap<String, i64>> {
            let rows: Vec<(String, i64)> =
                sqlx::query_as(&format!("SELECT name, id FROM {table}"))
                    .persistent(false)
                    .fetch_all(&db.pool)
                    .await
                    .map_err(classify_db_error)?;
            Ok(rows.into_iter().collect())
        }
        Ok(LookupMaps {
            developers: fetch(&self.db, "developers").await?,
            publishers: fetch(&self.db, "publishers").await?,
            genres: fetch(&self.db, "genres").await?,
            categories: fetch(&self.db, "categories").await?,
        })
    }

    /// Flush one application batch and its junction rows in a single
    /// transaction. The in-flight batch either lands whole or not at all.
    async fn flush_apps(&self, apps: &mut Vec<ExtractedApp>, maps: &LookupMaps) -> Result<()> {
        if apps.is_empty() {
            return Ok(());
        }
        let mut junctions = JunctionBatch::default();
        for app in apps.iter() {
            let appid = app.row.appid;
            let resolve = |names: &[String], map: &HashMap<String, i64>| -> Vec<(i64, i64)> {
                names
                    .iter()
                    .filter_map(|name| map.get(name).map(|id| (appid, *id)))
                    .collect()
            };
            junctions.developers.extend(resolve(&app.developers, &maps.developers));
            junctions.publishers.extend(resolve(&app.publishers, &maps.publishers));
            junctions.genres.extend(resolve(&app.genres, &maps.genres));
            junctions.categories.extend(resolve(&app.categories, &maps.categories));
        }

        let mut tx = self.db.pool.begin().await.map_err(classify_db_error)?;

        let mut qb: QueryBuilder<'_, Postgres> = QueryBuilder::new(
            "INSERT INTO applications (appid, name, type, is_free, release_date, required_age, \
             metacritic_score, recommendations_total, header_image, background, short_description, \
             about_the_game, detailed_description, supported_languages, base_app_id, price_overview, \
             platforms, pc_requirements, mac_requirements, linux_requirements, achievements, \
             screenshots, movies, ratings, package_groups, content_descriptors, supports_windows, \
             supports_mac, supports_linux, initial_price, final_price, discount_percent, currency, \
             achievement_count, fetched_at) ",
        );
        qb.push_values(apps.iter(), |mut b, app| {
            let r = &app.row;
            b.push_bind(r.appid)
                .push_bind(&r.name)
                .push_bind(&r.kind)
                .push_bind(r.is_free)
                .push_bind(r.release_date)
                .push_bind(&r.required_age)
                .push_bind(r.metacritic_score)
                .push_bind(r.recommendations_total)
                .push_bind(&r.header_image)
                .push_bind(&r.background)
                .push_bind(&r.short_description)
                .push_bind(&r.about_the_game)
                .push_bind(&r.detailed_description)
                .push_bind(&r.supported_languages)
                .push_bind(r.base_app_id)
                .push_bind(&r.price_overview)
                .push_bind(&r.platforms)
                .push_bind(&r.pc_requirements)
                .push_bind(&r.mac_requirements)
                .push_bind(&r.linux_requirements)
                .push_bind(&r.achievements)
                .push_bind(&r.screenshots)
                .push_bind(&r.movies)
                .push_bind(&r.ratings)
                .push_bind(&r.package_groups)
                .push_bind(&r.content_descriptors)
                .push_bind(r.supports_windows)
                .push_bind(r.supports_mac)
                .push_bind(r.supports_linux)
                .push_bind(r.initial_price)
                .push_bind(r.final_price)
                .push_bind(r.discount_percent)
                .push_bind(&r.currency)
                .push_bind(r.achievement_count)
                .push_bind(r.fetched_at);
        });
        qb.push(" ON CONFLICT (appid) DO NOTHING");
        qb.build()
            .persistent(false)
            .execute(&mut *tx)
            .await
            .map_err(classify_db_error)?;

        for (table, column, rows) in [
            ("application_developers", "developer_id", &junctions.developers),
            ("application_publishers", "publisher_id", &junctions.publishers),
            ("application_genres", "genre_id", &junctions.genres),
            ("application_categories", "category_id", &junctions.categories),
        ] {
            if rows.is_empty() {
                continue;
            }
            let mut qb: QueryBuilder<'_, Postgres> =
                QueryBuilder::new(format!("INSERT INTO {table} (appid, {column}) "));
            qb.push_values(rows.iter(), |mut b, (appid, id)| {
                b.push_bind(appid).push_bind(id);
            });
            qb.push(" ON CONFLICT DO NOTHING");
            qb.build()
                .persistent(false)
                .execute(&mut *tx)
                .await
                .map_err(classify_db_error)?;
        }

        tx.commit().await.map_err(classify_db_error)?;
        info!(applications = apps.len(), "flushed application batch");
        apps.clear();
        Ok(())
    }

    async fn flush_reviews(&self, rows: &mut Vec<ReviewRow>) -> Result<()> {
        if rows.is_empty() {
            return Ok(());
        }
        let mut qb: QueryBuilder<'_, Postgres> = QueryBuilder::new(
            "INSERT INTO reviews (recommendationid, appid, author_steamid, author_num_games_owned, \
             author_num_reviews, author_playtime_forever, author_playtime_at_review, language, \
             review_text, timestamp_created, timestamp_updated, voted_up, votes_up, votes_funny, \
             weighted_vote_score, comment_count, steam_purchase, received_for_free, \
             written_during_early_access) ",
        );
        qb.push_values(rows.iter(), |mut b, r| {
            b.push_bind(&r.recommendationid)
                .push_bind(r.appid)
                .push_bind(&r.author_steamid)
                .push_bind(r.author_num_games_owned)
                .push_bind(r.author_num_reviews)
                .push_bind(r.author_playtime_forever)
                .push_bind(r.author_playtime_at_review)
                .push_bind(&r.language)
                .push_bind(&r.review_text)
                .push_bind(r.timestamp_created)
                .push_bind(r.timestamp_updated)
                .push_bind(r.voted_up)
                .push_bind(r.votes_up)
                .push_bind(r.votes_funny)
                .push_bind(r.weighted_vote_score)
                .push_bind(r.comment_count)
                .push_bind(r.steam_purchase)
                .push_bind(r.received_for_free)
                .push_bind(r.written_during_early_access);
        });
        qb.push(" ON CONFLICT (recommendationid) DO NOTHING");
        qb.build()
            .persistent(false)
            .execute(&self.db.pool)
            .await
            .map_err(classify_db_error)?;
        info!(reviews = rows.len(), "flushed review batch");
        rows.clear();
        Ok(())
    }
}

// Constraint-class failures (SQLSTATE 23xxx) are integrity violations that
// abort the current phase; everything else is infrastructure.
fn classify_db_error(err: sqlx::Error) -> anyhow::Error {
    if let sqlx::Error::Database(db_err) = &err {
        if db_err.code().as_deref().is_some_and(|c| c.starts_with("23")) {
            return anyhow::Error::new(PipelineError::IntegrityViolation(db_err.to_string()));
        }
    }
    anyhow::Error::new(err)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn valid_record(appid: i64) -> Value {
        json!({
            "success": true,
            "data": {
                "steam_appid": appid,
                "name": format!("Game {appid}"),
                "type": "game",
                "is_free": false,
                "developers": ["Dev A", "Dev B"],
                "publishers": ["Pub A"],
                "genres": [{"id": "1", "description": "Action"}],
                "categories": [{"id": 2, "description": "Single-player"}],
                "platforms": {"windows": true, "mac": false, "linux": true},
                "price_overview": {"initial": 1999, "final": 999, "discount_percent": 50, "currency": "USD"},
                "achievements": {"total": 30},
                "metacritic": {"score": 85},
                "release_date": {"coming_soon": false, "date": "12 Nov, 2024"}
            },
            "fetched_at": "2025-09-01T12:00:00Z"
        })
    }

    #[test]
    fn skips_failure_and_missing_data_records() {
        // 100 records: one success=false, one missing data payload.
        let mut imported = 0;
        let mut skipped = 0;
        for i in 0..100i64 {
            let record = match i {
                7 => json!({"success": false}),
                42 => json!({"success": true}),
                _ => valid_record(i + 1000),
            };
            match extract_app(&record) {
                Ok(_) => imported += 1,
                Err(_) => skipped += 1,
            }
        }
        assert_eq!(imported, 98);
        assert_eq!(skipped, 2);
    }

    #[test]
    fn rejects_non_object_and_missing_core_fields() {
        assert!(extract_app(&json!(null)).is_err());
        assert!(extract_app(&json!([1, 2])).is_err());
        assert!(extract_app(&json!({"success": true, "data": {"name": "No AppId"}})).is_err());
        assert!(extract_app(&json!({"success": true, "data": {"steam_appid": 5}})).is_err());
        assert!(
            extract_app(&json!({"success": true, "data": {"steam_appid": 5, "name": ""}})).is_err()
        );
    }

    #[test]
    fn malformed_records_carry_the_malformed_variant() {
        let err = extract_app(&json!({"success": false})).unwrap_err();
        assert!(matches!(err, PipelineError::MalformedRecord(_)));
        assert!(!err.is_fatal());

        let err = extract_reviews(&json!({"reviews": {}})).unwrap_err();
        assert!(matches!(err, PipelineError::MalformedRecord(_)));
    }

    #[test]
    fn extracts_typed_columns_and_lookups() {
        let extracted = extract_app(&valid_record(440)).unwrap();
        let row = &extracted.row;
        assert_eq!(row.appid, 440);
        assert_eq!(row.kind.as_deref(), Some("game"));
        assert_eq!(row.release_date, NaiveDate::from_ymd_opt(2024, 11, 12));
        assert_eq!(row.metacritic_score, Some(85));
        assert!(row.supports_windows);
        assert!(!row.supports_mac);
        assert_eq!(row.final_price, Some(999));
        assert_eq!(row.currency.as_deref(), Some("USD"));
        assert_eq!(row.achievement_count, Some(30));
        assert_eq!(extracted.developers, vec!["Dev A", "Dev B"]);
        assert_eq!(extracted.genres, vec!["Action"]);
        assert_eq!(extracted.categories, vec!["Single-player"]);
        assert!(row.fetched_at.is_some());
    }

    #[test]
    fn free_app_with_positive_price_drops_materialized_price() {
        let mut record = valid_record(10);
        record["data"]["is_free"] = json!(true);
        let extracted = extract_app(&record).unwrap();
        assert_eq!(extracted.row.is_free, Some(true));
        assert_eq!(extracted.row.initial_price, None);
        assert_eq!(extracted.row.final_price, None);
        assert_eq!(extracted.row.currency, None);
        // Raw payload is retained as observed.
        assert!(extracted.row.price_overview.is_some());
    }

    #[test]
    fn unknown_type_is_stored_as_null() {
        let mut record = valid_record(10);
        record["data"]["type"] = json!("advertising");
        assert_eq!(extract_app(&record).unwrap().row.kind, None);
    }

    #[test]
    fn parses_both_release_date_forms() {
        assert_eq!(
            parse_release_date("12 Nov, 2024"),
            NaiveDate::from_ymd_opt(2024, 11, 12)
        );
        assert_eq!(
            parse_release_date("Nov 12, 2024"),
            NaiveDate::from_ymd_opt(2024, 11, 12)
        );
        assert_eq!(parse_release_date("TBA"), None);
        assert_eq!(parse_release_date("To be announced"), None);
        assert_eq!(parse_release_date(""), None);
        assert_eq!(parse_release_date("2024"), None);
    }

    #[test]
    fn review_extraction_requires_success_and_recommendationid() {
        let record = json!({
            "appid": 440,
            "reviews": {
                "success": 1,
                "reviews": [
                    {
                        "recommendationid": "123",
                        "author": {"steamid": "765", "num_reviews": 4, "playtime_forever": 100},
                        "language": "english",
                        "review": "good",
                        "voted_up": true,
                        "weighted_vote_score": "0.523"
                    },
                    {"author": {}, "language": "english"}
                ]
            }
        });
        let (appid, rows) = extract_reviews(&record).unwrap();
        assert_eq!(appid, 440);
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].recommendationid, "123");
        assert_eq!(rows[0].author_steamid.as_deref(), Some("765"));
        assert_eq!(rows[0].weighted_vote_score, Some(0.523));

        let failed = json!({"appid": 440, "reviews": {"success": 0, "reviews": []}});
        assert!(extract_reviews(&failed).is_err());
        assert!(extract_reviews(&json!({"reviews": {}})).is_err());
    }

    #[test]
    fn required_age_sanitizes_to_string() {
        assert_eq!(sanitize_required_age(None), "0");
        assert_eq!(sanitize_required_age(Some(&json!(18))), "18");
        assert_eq!(sanitize_required_age(Some(&json!("16+"))), "16+");
    }
}

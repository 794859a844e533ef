//! Database layer: migrations, cursor management, and the snapshot, user,
//! project and donation stores.

use chrono::Utc;
use sqlx::{sqlite::SqlitePoolOptions, SqlitePool};
use tracing::info;

use crate::errors::Result;
use crate::models::{
    DonationRecord, InboundEvent, Outcome, Project, SettlementCursor, SnapshotRecord, User,
};

/// Establish a SQLite connection pool and run pending migrations.
pub async fn init_pool(database_url: &str) -> Result<SqlitePool> {
    let url = if database_url.starts_with("sqlite:") {
        database_url.to_string()
    } else {
        format!("sqlite:{database_url}")
    };
    // Create the database file on first start.
    let url = if url.contains('?') || url.contains(":memory:") {
        url
    } else {
        format!("{url}?mode=rwc")
    };

    let pool = SqlitePoolOptions::new()
        .max_connections(5)
        .connect(&url)
        .await?;

    sqlx::migrate!("./migrations").run(&pool).await?;
    info!("Database migrations applied successfully");
    Ok(pool)
}

/// Single-connection in-memory pool with the schema applied.
#[cfg(test)]
pub async fn memory_pool() -> SqlitePool {
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .idle_timeout(None)
        .max_lifetime(None)
        .connect("sqlite::memory:")
        .await
        .expect("in-memory sqlite");
    sqlx::migrate!("./migrations")
        .run(&pool)
        .await
        .expect("migrations");
    pool
}

// ─────────────────────────────────────────────────────────
// Cursor helpers
// ─────────────────────────────────────────────────────────

/// Read the settlement cursor. The row is seeded by the migration, so a fresh
/// database yields an empty cursor.
pub async fn get_cursor(pool: &SqlitePool) -> Result<SettlementCursor> {
    let row = sqlx::query_as::<_, SettlementCursor>(
        "SELECT last_snapshot_id, last_observed_at, updated_at FROM settlement_cursor WHERE id = 1",
    )
    .fetch_optional(pool)
    .await?;
    Ok(row.unwrap_or_default())
}

/// Persist the id and observation time of the last fully processed event.
pub async fn save_cursor(pool: &SqlitePool, snapshot_id: &str, observed_at: i64) -> Result<()> {
    sqlx::query(
        r#"
        UPDATE settlement_cursor
        SET    last_snapshot_id = ?1, last_observed_at = ?2, updated_at = ?3
        WHERE  id = 1
        "#,
    )
    .bind(snapshot_id)
    .bind(observed_at)
    .bind(Utc::now().timestamp())
    .execute(pool)
    .await?;
    Ok(())
}

// ─────────────────────────────────────────────────────────
// Snapshots
// ─────────────────────────────────────────────────────────

pub async fn snapshot_exists(pool: &SqlitePool, snapshot_id: &str) -> Result<bool> {
    let row: Option<(i64,)> = sqlx::query_as("SELECT 1 FROM snapshots WHERE snapshot_id = ?1")
        .bind(snapshot_id)
        .fetch_optional(pool)
        .await?;
    Ok(row.is_some())
}

/// Record a processed event. A second insert for the same snapshot is
/// ignored; returns whether a row was written.
pub async fn insert_snapshot(
    pool: &SqlitePool,
    event: &InboundEvent,
    outcome: Outcome,
) -> Result<bool> {
    let rows_affected = sqlx::query(
        r#"
        INSERT OR IGNORE INTO snapshots
            (snapshot_id, request_id, opponent_id, asset_id, amount, memo, outcome, created_at, processed_at)
        VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
        "#,
    )
    .bind(&event.snapshot_id)
    .bind(&event.request_id)
    .bind(&event.opponent_id)
    .bind(&event.asset_id)
    .bind(event.amount.to_string())
    .bind(&event.memo)
    .bind(outcome.as_str())
    .bind(event.created_at.timestamp())
    .bind(Utc::now().timestamp())
    .execute(pool)
    .await?
    .rows_affected();
    Ok(rows_affected == 1)
}

pub async fn get_snapshot(pool: &SqlitePool, snapshot_id: &str) -> Result<Option<SnapshotRecord>> {
    let row = sqlx::query_as::<_, SnapshotRecord>(
        r#"
        SELECT snapshot_id, request_id, opponent_id, asset_id, amount, memo,
               outcome, created_at, processed_at
        FROM   snapshots
        WHERE  snapshot_id = ?1
        "#,
    )
    .bind(snapshot_id)
    .fetch_optional(pool)
    .await?;
    Ok(row)
}

// ─────────────────────────────────────────────────────────
// Users
// ─────────────────────────────────────────────────────────

/// Insert or refresh a user keyed by identity number.
pub async fn upsert_user(pool: &SqlitePool, user: &User) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO users
            (identity_number, user_id, full_name, avatar_url, biography,
             ledger_created_at, created_at, updated_at)
        VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
        ON CONFLICT(identity_number) DO UPDATE SET
            user_id           = excluded.user_id,
            full_name         = excluded.full_name,
            avatar_url        = excluded.avatar_url,
            biography         = excluded.biography,
            ledger_created_at = excluded.ledger_created_at,
            updated_at        = excluded.updated_at
        "#,
    )
    .bind(&user.identity_number)
    .bind(&user.user_id)
    .bind(&user.full_name)
    .bind(&user.avatar_url)
    .bind(&user.biography)
    .bind(user.ledger_created_at)
    .bind(user.created_at)
    .bind(user.updated_at)
    .execute(pool)
    .await?;
    Ok(())
}

pub async fn get_user_by_identity(pool: &SqlitePool, identity_number: &str) -> Result<Option<User>> {
    let row = sqlx::query_as::<_, User>(
        r#"
        SELECT identity_number, user_id, full_name, avatar_url, biography,
               ledger_created_at, created_at, updated_at
        FROM   users
        WHERE  identity_number = ?1
        "#,
    )
    .bind(identity_number)
    .fetch_optional(pool)
    .await?;
    Ok(row)
}

// ─────────────────────────────────────────────────────────
// Projects
// ─────────────────────────────────────────────────────────

/// Register a project. Re-registering an existing pid leaves the stored row
/// (and its donation count) untouched.
pub async fn insert_project(pool: &SqlitePool, project: &Project) -> Result<()> {
    sqlx::query(
        r#"
        INSERT OR IGNORE INTO projects
            (pid, title, description, img_url, link, identity_number, owner_id, donate_cnt, created_at)
        VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, 0, ?8)
        "#,
    )
    .bind(&project.pid)
    .bind(&project.title)
    .bind(&project.description)
    .bind(&project.img_url)
    .bind(&project.link)
    .bind(&project.identity_number)
    .bind(&project.owner_id)
    .bind(project.created_at)
    .execute(pool)
    .await?;
    Ok(())
}

pub async fn get_project(pool: &SqlitePool, pid: &str) -> Result<Option<Project>> {
    let row = sqlx::query_as::<_, Project>(
        r#"
        SELECT pid, title, description, img_url, link, identity_number,
               owner_id, donate_cnt, created_at
        FROM   projects
        WHERE  pid = ?1
        "#,
    )
    .bind(pid)
    .fetch_optional(pool)
    .await?;
    Ok(row)
}

/// Projects ordered by donation count, most donated first.
pub async fn list_projects(pool: &SqlitePool, limit: i64, offset: i64) -> Result<Vec<Project>> {
    let rows = sqlx::query_as::<_, Project>(
        r#"
        SELECT pid, title, description, img_url, link, identity_number,
               owner_id, donate_cnt, created_at
        FROM   projects
        ORDER  BY donate_cnt DESC, created_at ASC, pid ASC
        LIMIT  ?1 OFFSET ?2
        "#,
    )
    .bind(limit)
    .bind(offset)
    .fetch_all(pool)
    .await?;
    Ok(rows)
}

pub async fn incr_project_donate_cnt(pool: &SqlitePool, pid: &str) -> Result<()> {
    sqlx::query("UPDATE projects SET donate_cnt = donate_cnt + 1 WHERE pid = ?1")
        .bind(pid)
        .execute(pool)
        .await?;
    Ok(())
}

// ─────────────────────────────────────────────────────────
// Donations
// ─────────────────────────────────────────────────────────

/// Append a donation. Returns `false` when a record with the same id already
/// exists.
pub async fn insert_donation(pool: &SqlitePool, donation: &DonationRecord) -> Result<bool> {
    let rows_affected = sqlx::query(
        r#"
        INSERT OR IGNORE INTO donations
            (id, pid, identity_number, asset_id, amount, created_at)
        VALUES (?1, ?2, ?3, ?4, ?5, ?6)
        "#,
    )
    .bind(&donation.id)
    .bind(&donation.pid)
    .bind(&donation.identity_number)
    .bind(&donation.asset_id)
    .bind(&donation.amount)
    .bind(donation.created_at)
    .execute(pool)
    .await?
    .rows_affected();
    Ok(rows_affected == 1)
}

pub async fn donations_for_project(pool: &SqlitePool, pid: &str) -> Result<Vec<DonationRecord>> {
    let rows = sqlx::query_as::<_, DonationRecord>(
        r#"
        SELECT id, pid, identity_number, asset_id, amount, created_at
        FROM   donations
        WHERE  pid = ?1
        ORDER  BY created_at ASC, id ASC
        "#,
    )
    .bind(pid)
    .fetch_all(pool)
    .await?;
    Ok(rows)
}

/// Donations made by one user, newest first.
pub async fn donations_by_user(
    pool: &SqlitePool,
    identity_number: &str,
) -> Result<Vec<DonationRecord>> {
    let rows = sqlx::query_as::<_, DonationRecord>(
        r#"
        SELECT id, pid, identity_number, asset_id, amount, created_at
        FROM   donations
        WHERE  identity_number = ?1
        ORDER  BY created_at DESC, id ASC
        "#,
    )
    .bind(identity_number)
    .fetch_all(pool)
    .await?;
    Ok(rows)
}

// ─────────────────────────────────────────────────────────
// Unit tests
// ─────────────────────────────────────────────────────────

//! SQLite database store implementation.

use chrono::{DateTime, NaiveDateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Result as SqlResult, Row};
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};
use thiserror::Error;

use super::models::*;

/// Database error types.
#[derive(Error, Debug)]
pub enum DbError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("Migration error: {0}")]
    Migration(String),
    #[error("Not found")]
    NotFound,
    #[error("Conflict: {0}")]
    Conflict(String),
}

/// Filters for listing links.
#[derive(Debug, Clone, Default)]
pub struct LinkFilter {
    pub user_id: Option<i64>,
    pub organization_id: Option<i64>,
    pub health_status: Option<HealthStatus>,
    /// Substring match on short code, destination or title
    pub search: Option<String>,
    pub limit: i64,
    pub offset: i64,
}

/// Outcome of one probe, ready to be persisted.
#[derive(Debug, Clone)]
pub struct NewHealthCheck {
    pub link_id: i64,
    pub url: String,
    pub status: HealthStatus,
    pub status_code: Option<u16>,
    pub response_time: Option<i64>,
    pub error: Option<String>,
    pub checked_at: DateTime<Utc>,
}

const LINK_COLUMNS: &str = "id, short_code, original_url, title, description, is_active, expires_at, \
     max_clicks, current_clicks, password_hash, enable_tracking, health_status, last_health_check, \
     user_id, organization_id, created_at, updated_at, tags";

/// Thread-safe database store.
#[derive(Clone)]
pub struct Store {
    conn: Arc<Mutex<Connection>>,
}

impl Store {
    /// Create a new store with the given database path.
    pub fn new<P: AsRef<Path>>(path: P) -> Result<Self, DbError> {
        let conn = Connection::open(path)?;
        let store = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        store.init()?;
        Ok(store)
    }

    /// Initialize the database with migrations.
    fn init(&self) -> Result<(), DbError> {
        let conn = self.conn();
        conn.execute_batch("PRAGMA foreign_keys = ON;")?;
        conn.execute_batch(include_str!("../../migrations/000001_init.up.sql"))
            .map_err(|e| DbError::Migration(format!("Migration 1 failed: {}", e)))?;
        Ok(())
    }

    fn conn(&self) -> MutexGuard<'_, Connection> {
        // A panic while holding the lock leaves the connection itself usable.
        self.conn.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Cheap round-trip used by the readiness probe.
    pub fn ping(&self) -> Result<(), DbError> {
        let conn = self.conn();
        conn.query_row("SELECT 1", [], |r| r.get::<_, i64>(0))?;
        Ok(())
    }

    // --- Users & organizations ---

    pub fn add_user(&self, email: &str, name: &str) -> Result<User, DbError> {
        let conn = self.conn();
        conn.execute(
            "INSERT INTO users (email, name, created_at) VALUES (?1, ?2, ?3)",
            params![email, name, fmt_db_time(Utc::now())],
        )
        .map_err(|e| unique_violation(e, "email already registered"))?;
        Ok(User {
            id: conn.last_insert_rowid(),
            email: email.to_string(),
            name: name.to_string(),
        })
    }

    pub fn get_user(&self, id: i64) -> Result<User, DbError> {
        let conn = self.conn();
        conn.query_row(
            "SELECT id, email, name FROM users WHERE id = ?1",
            params![id],
            |row| {
                Ok(User {
                    id: row.get(0)?,
                    email: row.get(1)?,
                    name: row.get(2)?,
                })
            },
        )
        .optional()?
        .ok_or(DbError::NotFound)
    }

    pub fn add_organization(&self, name: &str, branding: &Branding) -> Result<Organization, DbError> {
        let conn = self.conn();
        conn.execute(
            "INSERT INTO organizations (name, primary_color, secondary_color, logo_url, redirect_title, redirect_message, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                name,
                branding.primary_color,
                branding.secondary_color,
                branding.logo_url,
                branding.redirect_title,
                branding.redirect_message,
                fmt_db_time(Utc::now()),
            ],
        )?;
        Ok(Organization {
            id: conn.last_insert_rowid(),
            name: name.to_string(),
            branding: branding.clone(),
        })
    }

    pub fn get_organization(&self, id: i64) -> Result<Organization, DbError> {
        let conn = self.conn();
        conn.query_row(
            "SELECT id, name, primary_color, secondary_color, logo_url, redirect_title, redirect_message
             FROM organizations WHERE id = ?1",
            params![id],
            |row| {
                Ok(Organization {
                    id: row.get(0)?,
                    name: row.get(1)?,
                    branding: Branding {
                        primary_color: row.get(2)?,
                        secondary_color: row.get(3)?,
                        logo_url: row.get(4)?,
                        redirect_title: row.get(5)?,
                        redirect_message: row.get(6)?,
                    },
                })
            },
        )
        .optional()?
        .ok_or(DbError::NotFound)
    }

    /// Add or replace a membership.
    pub fn add_member(
        &self,
        organization_id: i64,
        user_id: i64,
        role: MemberRole,
    ) -> Result<OrganizationMember, DbError> {
        let conn = self.conn();
        conn.execute(
            "INSERT INTO organization_members (organization_id, user_id, role, is_active) VALUES (?1, ?2, ?3, 1)
             ON CONFLICT(organization_id, user_id) DO UPDATE SET role=excluded.role, is_active=1",
            params![organization_id, user_id, role.as_str()],
        )
        .map_err(|e| match e {
            rusqlite::Error::SqliteFailure(err, _)
                if err.code == rusqlite::ErrorCode::ConstraintViolation =>
            {
                DbError::NotFound
            }
            other => DbError::Sqlite(other),
        })?;
        Ok(OrganizationMember {
            organization_id,
            user_id,
            role,
            is_active: true,
        })
    }

    pub fn deactivate_member(&self, organization_id: i64, user_id: i64) -> Result<(), DbError> {
        let conn = self.conn();
        let n = conn.execute(
            "UPDATE organization_members SET is_active = 0 WHERE organization_id = ?1 AND user_id = ?2",
            params![organization_id, user_id],
        )?;
        if n == 0 {
            return Err(DbError::NotFound);
        }
        Ok(())
    }

    /// Active members of an organization holding one of `roles`.
    pub fn get_members_with_roles(
        &self,
        organization_id: i64,
        roles: &[MemberRole],
    ) -> Result<Vec<User>, DbError> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT u.id, u.email, u.name, m.role FROM organization_members m
             JOIN users u ON u.id = m.user_id
             WHERE m.organization_id = ?1 AND m.is_active = 1
             ORDER BY u.id ASC",
        )?;

        let rows = stmt
            .query_map(params![organization_id], |row| {
                let role: String = row.get(3)?;
                Ok((
                    User {
                        id: row.get(0)?,
                        email: row.get(1)?,
                        name: row.get(2)?,
                    },
                    role,
                ))
            })?
            .collect::<SqlResult<Vec<_>>>()?;

        Ok(rows
            .into_iter()
            .filter(|(_, role)| {
                role.parse::<MemberRole>()
                    .map(|r| roles.contains(&r))
                    .unwrap_or(false)
            })
            .map(|(user, _)| user)
            .collect())
    }

    // --- Link CRUD ---

    /// Add a new link and return its ID.
    pub fn add_link(&self, link: &mut Link) -> Result<i64, DbError> {
        let now = Utc::now();
        let conn = self.conn();
        conn.execute(
            "INSERT INTO links (short_code, original_url, title, description, is_active, expires_at, max_clicks,
                current_clicks, password_hash, enable_tracking, health_status, last_health_check, user_id,
                organization_id, created_at, updated_at, tags)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, 0, ?8, ?9, ?10, NULL, ?11, ?12, ?13, ?13, ?14)",
            params![
                link.short_code,
                link.original_url,
                link.title,
                link.description,
                link.is_active,
                link.expires_at.map(fmt_db_time),
                link.max_clicks,
                link.password_hash,
                link.enable_tracking,
                HealthStatus::Unknown.as_str(),
                link.user_id,
                link.organization_id,
                fmt_db_time(now),
                tags_to_db(&link.tags),
            ],
        )
        .map_err(|e| unique_violation(e, "short code already exists"))?;

        let id = conn.last_insert_rowid();
        link.id = id;
        link.current_clicks = 0;
        link.health_status = HealthStatus::Unknown;
        link.last_health_check = None;
        link.created_at = now;
        link.updated_at = now;
        Ok(id)
    }

    /// Update the user-editable fields of a link.
    ///
    /// Click counters and health fields are owned by the resolver and the
    /// health checker and are left untouched.
    pub fn update_link(&self, link: &Link) -> Result<(), DbError> {
        let conn = self.conn();
        let n = conn
            .execute(
                "UPDATE links SET short_code=?1, original_url=?2, title=?3, description=?4, is_active=?5,
                    expires_at=?6, max_clicks=?7, password_hash=?8, enable_tracking=?9, organization_id=?10,
                    tags=?11, updated_at=?12
                 WHERE id=?13",
                params![
                    link.short_code,
                    link.original_url,
                    link.title,
                    link.description,
                    link.is_active,
                    link.expires_at.map(fmt_db_time),
                    link.max_clicks,
                    link.password_hash,
                    link.enable_tracking,
                    link.organization_id,
                    tags_to_db(&link.tags),
                    fmt_db_time(Utc::now()),
                    link.id,
                ],
            )
            .map_err(|e| unique_violation(e, "short code already exists"))?;
        if n == 0 {
            return Err(DbError::NotFound);
        }
        Ok(())
    }

    /// Get a link by ID.
    pub fn get_link(&self, id: i64) -> Result<Link, DbError> {
        let conn = self.conn();
        conn.query_row(
            &format!("SELECT {} FROM links WHERE id = ?1", LINK_COLUMNS),
            params![id],
            link_from_row,
        )
        .optional()?
        .ok_or(DbError::NotFound)
    }

    /// Get a link by its short code.
    pub fn get_link_by_code(&self, short_code: &str) -> Result<Option<Link>, DbError> {
        let conn = self.conn();
        Ok(conn
            .query_row(
                &format!("SELECT {} FROM links WHERE short_code = ?1", LINK_COLUMNS),
                params![short_code],
                link_from_row,
            )
            .optional()?)
    }

    pub fn short_code_exists(&self, short_code: &str) -> Result<bool, DbError> {
        let conn = self.conn();
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM links WHERE short_code = ?1",
            params![short_code],
            |r| r.get(0),
        )?;
        Ok(count > 0)
    }

    /// List links matching a filter, newest first. Also returns the total match count.
    pub fn get_links(&self, filter: &LinkFilter) -> Result<(Vec<Link>, i64), DbError> {
        let search = filter.search.as_ref().map(|s| format!("%{}%", s));
        let where_clause = "WHERE (?1 IS NULL OR user_id = ?1)
               AND (?2 IS NULL OR organization_id = ?2)
               AND (?3 IS NULL OR health_status = ?3)
               AND (?4 IS NULL OR short_code LIKE ?4 OR original_url LIKE ?4 OR title LIKE ?4)";
        let health = filter.health_status.map(|h| h.as_str());
        let limit = if filter.limit <= 0 { 20 } else { filter.limit };

        let conn = self.conn();
        let total: i64 = conn.query_row(
            &format!("SELECT COUNT(*) FROM links {}", where_clause),
            params![filter.user_id, filter.organization_id, health, search],
            |r| r.get(0),
        )?;

        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM links {} ORDER BY created_at DESC, id DESC LIMIT ?5 OFFSET ?6",
            LINK_COLUMNS, where_clause
        ))?;
        let links = stmt
            .query_map(
                params![
                    filter.user_id,
                    filter.organization_id,
                    health,
                    search,
                    limit,
                    filter.offset.max(0),
                ],
                link_from_row,
            )?
            .collect::<SqlResult<Vec<_>>>()?;

        Ok((links, total))
    }

    /// Delete a link and its clicks and health checks.
    pub fn delete_link(&self, id: i64) -> Result<(), DbError> {
        let conn = self.conn();
        let tx = conn.unchecked_transaction()?;
        tx.execute("DELETE FROM clicks WHERE link_id = ?1", params![id])?;
        tx.execute("DELETE FROM health_checks WHERE link_id = ?1", params![id])?;
        let n = tx.execute("DELETE FROM links WHERE id = ?1", params![id])?;
        tx.commit()?;
        if n == 0 {
            return Err(DbError::NotFound);
        }
        Ok(())
    }

    // --- Clicks ---

    /// Atomically bump the click counter.
    pub fn increment_clicks(&self, link_id: i64) -> Result<(), DbError> {
        let conn = self.conn();
        conn.execute(
            "UPDATE links SET current_clicks = current_clicks + 1 WHERE id = ?1",
            params![link_id],
        )?;
        Ok(())
    }

    pub fn add_click(&self, click: &NewClick, at: DateTime<Utc>) -> Result<i64, DbError> {
        let conn = self.conn();
        conn.execute(
            "INSERT INTO clicks (link_id, ip_address, user_agent, referer, country, city, device, browser, os, timestamp)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            params![
                click.link_id,
                click.ip_address,
                click.user_agent,
                click.referer,
                click.country,
                click.city,
                click.device,
                click.browser,
                click.os,
                fmt_db_time(at),
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    pub fn count_clicks(&self, link_id: i64) -> Result<i64, DbError> {
        let conn = self.conn();
        Ok(conn.query_row(
            "SELECT COUNT(*) FROM clicks WHERE link_id = ?1",
            params![link_id],
            |r| r.get(0),
        )?)
    }

    // --- Health checks ---

    /// Write a probe outcome: update the link's health fields and append the
    /// history row in one transaction.
    pub fn record_health_check(&self, check: &NewHealthCheck) -> Result<HealthCheck, DbError> {
        let conn = self.conn();
        let tx = conn.unchecked_transaction()?;
        let checked_at = fmt_db_time(check.checked_at);

        tx.execute(
            "UPDATE links SET health_status = ?1, last_health_check = ?2 WHERE id = ?3",
            params![check.status.as_str(), checked_at, check.link_id],
        )?;
        tx.execute(
            "INSERT INTO health_checks (link_id, url, status, status_code, response_time, error, checked_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                check.link_id,
                check.url,
                check.status.as_str(),
                check.status_code,
                check.response_time,
                check.error,
                checked_at,
            ],
        )?;
        let id = tx.last_insert_rowid();
        tx.commit()?;

        Ok(HealthCheck {
            id,
            link_id: check.link_id,
            url: check.url.clone(),
            status: check.status,
            status_code: check.status_code,
            response_time: check.response_time,
            error: check.error.clone(),
            checked_at: check.checked_at,
        })
    }

    /// Most recent health checks for a link, newest first.
    pub fn get_health_checks(&self, link_id: i64, limit: i64) -> Result<Vec<HealthCheck>, DbError> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT id, link_id, url, status, status_code, response_time, error, checked_at
             FROM health_checks WHERE link_id = ?1 ORDER BY checked_at DESC, id DESC LIMIT ?2",
        )?;

        let checks = stmt
            .query_map(params![link_id, limit], |row| {
                let status: String = row.get(3)?;
                let time_str: String = row.get(7)?;
                Ok(HealthCheck {
                    id: row.get(0)?,
                    link_id: row.get(1)?,
                    url: row.get(2)?,
                    status: status.parse().unwrap_or(HealthStatus::Unknown),
                    status_code: row.get(4)?,
                    response_time: row.get(5)?,
                    error: row.get(6)?,
                    checked_at: parse_db_time(&time_str).unwrap_or_else(Utc::now),
                })
            })?
            .collect::<SqlResult<Vec<_>>>()?;

        Ok(checks)
    }

    /// Active links never checked or last checked before `cutoff`, oldest first.
    pub fn get_links_due_for_check(
        &self,
        cutoff: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<Link>, DbError> {
        let conn = self.conn();
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM links
             WHERE is_active = 1 AND (last_health_check IS NULL OR last_health_check < ?1)
             ORDER BY last_health_check IS NOT NULL, last_health_check ASC, id ASC
             LIMIT ?2",
            LINK_COLUMNS
        ))?;

        let links = stmt
            .query_map(params![fmt_db_time(cutoff), limit as i64], link_from_row)?
            .collect::<SqlResult<Vec<_>>>()?;

        Ok(links)
    }

    // --- Notifications ---

    pub fn add_notification(
        &self,
        user_id: i64,
        kind: &str,
        title: &str,
        message: &str,
        data: &serde_json::Value,
    ) -> Result<Notification, DbError> {
        let now = Utc::now();
        let conn = self.conn();
        conn.execute(
            "INSERT INTO notifications (user_id, type, title, message, data, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![user_id, kind, title, message, data.to_string(), fmt_db_time(now)],
        )?;
        Ok(Notification {
            id: conn.last_insert_rowid(),
            user_id,
            kind: kind.to_string(),
            title: title.to_string(),
            message: message.to_string(),
            data: data.clone(),
            created_at: now,
            sent_at: None,
        })
    }

    pub fn mark_notification_sent(&self, id: i64, at: DateTime<Utc>) -> Result<(), DbError> {
        let conn = self.conn();
        conn.execute(
            "UPDATE notifications SET sent_at = ?1 WHERE id = ?2 AND sent_at IS NULL",
            params![fmt_db_time(at), id],
        )?;
        Ok(())
    }

    /// A user's notifications, newest first.
    pub fn get_notifications(&self, user_id: i64, limit: i64) -> Result<Vec<Notification>, DbError> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT id, user_id, type, title, message, data, created_at, sent_at
             FROM notifications WHERE user_id = ?1 ORDER BY created_at DESC, id DESC LIMIT ?2",
        )?;

        let notifications = stmt
            .query_map(params![user_id, limit], |row| {
                let data: String = row.get(5)?;
                let created: String = row.get(6)?;
                let sent: Option<String> = row.get(7)?;
                Ok(Notification {
                    id: row.get(0)?,
                    user_id: row.get(1)?,
                    kind: row.get(2)?,
                    title: row.get(3)?,
                    message: row.get(4)?,
                    data: serde_json::from_str(&data).unwrap_or(serde_json::Value::Null),
                    created_at: parse_db_time(&created).unwrap_or_else(Utc::now),
                    sent_at: sent.and_then(|s| parse_db_time(&s)),
                })
            })?
            .collect::<SqlResult<Vec<_>>>()?;

        Ok(notifications)
    }
}

fn link_from_row(row: &Row<'_>) -> SqlResult<Link> {
    let expires_at: Option<String> = row.get(6)?;
    let health: String = row.get(11)?;
    let last_check: Option<String> = row.get(12)?;
    let created: String = row.get(15)?;
    let updated: String = row.get(16)?;
    let tags: String = row.get(17)?;

    Ok(Link {
        id: row.get(0)?,
        short_code: row.get(1)?,
        original_url: row.get(2)?,
        title: row.get(3)?,
        description: row.get(4)?,
        is_active: row.get(5)?,
        expires_at: expires_at.and_then(|s| parse_db_time(&s)),
        max_clicks: row.get(7)?,
        current_clicks: row.get(8)?,
        password_hash: row.get(9)?,
        enable_tracking: row.get(10)?,
        tags: serde_json::from_str(&tags).unwrap_or_default(),
        health_status: health.parse().unwrap_or(HealthStatus::Unknown),
        last_health_check: last_check.and_then(|s| parse_db_time(&s)),
        user_id: row.get(13)?,
        organization_id: row.get(14)?,
        created_at: parse_db_time(&created).unwrap_or_else(Utc::now),
        updated_at: parse_db_time(&updated).unwrap_or_else(Utc::now),
    })
}

fn tags_to_db(tags: &[String]) -> String {
    serde_json::to_string(tags).unwrap_or_else(|_| "[]".to_string())
}

fn unique_violation(e: rusqlite::Error, message: &str) -> DbError {
    match e {
        rusqlite::Error::SqliteFailure(err, _)
            if err.extended_code == rusqlite::ffi::SQLITE_CONSTRAINT_UNIQUE =>
        {
            DbError::Conflict(message.to_string())
        }
        other => DbError::Sqlite(other),
    }
}

/// Format a timestamp for storage. Fixed width, so string order is time order.
fn fmt_db_time(t: DateTime<Utc>) -> String {
    t.format("%Y-%m-%d %H:%M:%S%.9f").to_string()
}

/// Parse a datetime string from the database.
fn parse_db_time(s: &str) -> Option<DateTime<Utc>> {
    let formats = [
        "%Y-%m-%d %H:%M:%S%.9f",
        "%Y-%m-%d %H:%M:%S%.f",
        "%Y-%m-%d %H:%M:%S",
    ];

    for fmt in &formats {
        if let Ok(dt) = NaiveDateTime::parse_from_str(s, fmt) {
            return Some(DateTime::from_naive_utc_and_offset(dt, Utc));
        }
    }

    DateTime::parse_from_rfc3339(s)
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}

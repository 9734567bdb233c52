use std::str::FromStr;

use anyhow::Result;
use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::types::Type;
use rusqlite::{Connection, OptionalExtension, Row, params};
use uuid::Uuid;

use sarhni_types::models::{
    ReportDetail, ReportStatus, ReportedConfession, Role, UserSummary,
};

use crate::Database;
use crate::models::{
    ConfessionRow, NewConfession, NewReport, NewUser, OwnerGuarded, PinToggle, ReportRow, UserRow,
};

const USER_COLUMNS: &str =
    "id, username, password, role, is_banned, bio, image, created_at";

const CONFESSION_SELECT: &str = "SELECT c.id, c.content, c.sender_id, c.receiver_id, c.is_anonymous,
            c.is_pinned, c.reply, c.reply_at, c.created_at, c.edited_at,
            s.id, s.username, s.image
     FROM confessions c
     LEFT JOIN users s ON s.id = c.sender_id";

impl Database {
    // -- Users --

    /// Inserts a new account. The very first account becomes OWNER, every
    /// later one USER. Returns `None` if the username is already taken.
    pub fn register_user(&self, user: &NewUser<'_>) -> Result<Option<Role>> {
        self.with_tx(|tx| {
            let taken: bool = tx.query_row(
                "SELECT EXISTS(SELECT 1 FROM users WHERE username = ?1)",
                [user.username],
                |row| row.get(0),
            )?;
            if taken {
                return Ok(None);
            }

            let existing: i64 = tx.query_row("SELECT COUNT(*) FROM users", [], |row| row.get(0))?;
            let role = if existing == 0 { Role::Owner } else { Role::User };

            tx.execute(
                "INSERT INTO users (id, username, password, role, created_at) VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    user.id.to_string(),
                    user.username,
                    user.password_hash,
                    role.as_str(),
                    ts(user.created_at)
                ],
            )?;
            Ok(Some(role))
        })
    }

    pub fn get_user_by_username(&self, username: &str) -> Result<Option<UserRow>> {
        self.with_conn(|conn| {
            query_user(conn, &format!("SELECT {USER_COLUMNS} FROM users WHERE username = ?1"), username)
        })
    }

    pub fn get_user_by_id(&self, id: Uuid) -> Result<Option<UserRow>> {
        self.with_conn(|conn| {
            query_user(
                conn,
                &format!("SELECT {USER_COLUMNS} FROM users WHERE id = ?1"),
                &id.to_string(),
            )
        })
    }

    /// Prefix search over active accounts, alphabetical.
    pub fn search_users(&self, prefix: &str, limit: u32) -> Result<Vec<UserSummary>> {
        let pattern = format!("{}%", escape_like(prefix));
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, username, image FROM users
                 WHERE username LIKE ?1 ESCAPE '\\' AND is_banned = 0
                 ORDER BY username
                 LIMIT ?2",
            )?;
            let rows = stmt
                .query_map(params![pattern, limit], |row| {
                    Ok(UserSummary {
                        id: uuid_at(row, 0)?,
                        username: row.get(1)?,
                        image: row.get(2)?,
                    })
                })?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            Ok(rows)
        })
    }

    pub fn count_owners(&self) -> Result<i64> {
        self.with_conn(|conn| count_owners(conn))
    }

    /// Returns false if the user does not exist.
    pub fn set_banned(&self, id: Uuid, banned: bool) -> Result<bool> {
        self.with_conn(|conn| {
            let changed = conn.execute(
                "UPDATE users SET is_banned = ?2 WHERE id = ?1",
                params![id.to_string(), banned],
            )?;
            Ok(changed > 0)
        })
    }

    /// Changes a user's role. Taking OWNER away from the last remaining owner
    /// is refused; the owner count is read inside the same transaction as
    /// the write.
    pub fn change_role(&self, id: Uuid, role: Role) -> Result<OwnerGuarded<Role>> {
        self.with_tx(|tx| {
            let Some(current) = query_role(tx, id)? else {
                return Ok(OwnerGuarded::Missing);
            };
            if current == Role::Owner && role != Role::Owner && count_owners(tx)? <= 1 {
                return Ok(OwnerGuarded::LastOwner);
            }
            tx.execute(
                "UPDATE users SET role = ?2 WHERE id = ?1",
                params![id.to_string(), role.as_str()],
            )?;
            Ok(OwnerGuarded::Done(current))
        })
    }

    /// Hard-deletes an account. Received confessions and filed reports go
    /// with it; sent confessions and reviewed reports lose the reference.
    /// Returns the removed account's image URL so its blob can be cleaned up.
    pub fn erase_user(&self, id: Uuid) -> Result<OwnerGuarded<Option<String>>> {
        self.with_tx(|tx| {
            let Some(current) = query_role(tx, id)? else {
                return Ok(OwnerGuarded::Missing);
            };
            if current == Role::Owner && count_owners(tx)? <= 1 {
                return Ok(OwnerGuarded::LastOwner);
            }
            let image: Option<String> = tx.query_row(
                "SELECT image FROM users WHERE id = ?1",
                [id.to_string()],
                |row| row.get(0),
            )?;
            tx.execute("DELETE FROM users WHERE id = ?1", [id.to_string()])?;
            Ok(OwnerGuarded::Done(image))
        })
    }

    /// Overwrites only the fields that are `Some`; `Some(None)` clears.
    /// Returns false if the user does not exist.
    pub fn update_profile(
        &self,
        id: Uuid,
        bio: Option<Option<&str>>,
        image: Option<Option<&str>>,
    ) -> Result<bool> {
        self.with_tx(|tx| {
            let exists: bool = tx.query_row(
                "SELECT EXISTS(SELECT 1 FROM users WHERE id = ?1)",
                [id.to_string()],
                |row| row.get(0),
            )?;
            if !exists {
                return Ok(false);
            }
            if let Some(bio) = bio {
                tx.execute(
                    "UPDATE users SET bio = ?2 WHERE id = ?1",
                    params![id.to_string(), bio],
                )?;
            }
            if let Some(image) = image {
                tx.execute(
                    "UPDATE users SET image = ?2 WHERE id = ?1",
                    params![id.to_string(), image],
                )?;
            }
            Ok(true)
        })
    }

    // -- Confessions --

    pub fn insert_confession(&self, confession: &NewConfession<'_>) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO confessions (id, content, sender_id, receiver_id, is_anonymous, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    confession.id.to_string(),
                    confession.content,
                    confession.sender_id.map(|id| id.to_string()),
                    confession.receiver_id.to_string(),
                    confession.sender_id.is_none(),
                    ts(confession.created_at),
                ],
            )?;
            Ok(())
        })
    }

    pub fn get_confession(&self, id: Uuid) -> Result<Option<ConfessionRow>> {
        self.with_conn(|conn| {
            let row = conn
                .query_row(
                    &format!("{CONFESSION_SELECT} WHERE c.id = ?1"),
                    [id.to_string()],
                    map_confession,
                )
                .optional()?;
            Ok(row)
        })
    }

    /// A receiver's feed: pinned first, then newest first.
    pub fn list_confessions(
        &self,
        receiver_id: Uuid,
        offset: u32,
        limit: u32,
    ) -> Result<Vec<ConfessionRow>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!(
                "{CONFESSION_SELECT}
                 WHERE c.receiver_id = ?1
                 ORDER BY c.is_pinned DESC, c.created_at DESC, c.id DESC
                 LIMIT ?2 OFFSET ?3"
            ))?;
            let rows = stmt
                .query_map(
                    params![receiver_id.to_string(), limit, offset],
                    map_confession,
                )?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            Ok(rows)
        })
    }

    pub fn delete_confession(&self, id: Uuid) -> Result<bool> {
        self.with_conn(|conn| {
            let changed = conn.execute("DELETE FROM confessions WHERE id = ?1", [id.to_string()])?;
            Ok(changed > 0)
        })
    }

    /// Replaces any previous reply.
    pub fn set_reply(&self, id: Uuid, reply: &str, at: DateTime<Utc>) -> Result<bool> {
        self.with_conn(|conn| {
            let changed = conn.execute(
                "UPDATE confessions SET reply = ?2, reply_at = ?3 WHERE id = ?1",
                params![id.to_string(), reply, ts(at)],
            )?;
            Ok(changed > 0)
        })
    }

    pub fn update_content(&self, id: Uuid, content: &str, at: DateTime<Utc>) -> Result<bool> {
        self.with_conn(|conn| {
            let changed = conn.execute(
                "UPDATE confessions SET content = ?2, edited_at = ?3 WHERE id = ?1",
                params![id.to_string(), content, ts(at)],
            )?;
            Ok(changed > 0)
        })
    }

    /// Flips the pin flag. Reading the current state, counting the
    /// receiver's pins and writing happen in one IMMEDIATE transaction, so
    /// concurrent pin requests cannot push a receiver past `max_pinned`.
    /// Returns `None` if the confession does not exist.
    pub fn toggle_pin(&self, id: Uuid, max_pinned: u32) -> Result<Option<PinToggle>> {
        self.with_tx(|tx| {
            let current: Option<(String, bool)> = tx
                .query_row(
                    "SELECT receiver_id, is_pinned FROM confessions WHERE id = ?1",
                    [id.to_string()],
                    |row| Ok((row.get(0)?, row.get(1)?)),
                )
                .optional()?;
            let Some((receiver_id, pinned)) = current else {
                return Ok(None);
            };

            if !pinned {
                let count: i64 = tx.query_row(
                    "SELECT COUNT(*) FROM confessions WHERE receiver_id = ?1 AND is_pinned = 1",
                    [&receiver_id],
                    |row| row.get(0),
                )?;
                if count >= i64::from(max_pinned) {
                    return Ok(Some(PinToggle::LimitReached));
                }
            }

            tx.execute(
                "UPDATE confessions SET is_pinned = ?2 WHERE id = ?1",
                params![id.to_string(), !pinned],
            )?;
            Ok(Some(if pinned {
                PinToggle::Unpinned
            } else {
                PinToggle::Pinned
            }))
        })
    }

    pub fn count_pinned(&self, receiver_id: Uuid) -> Result<i64> {
        self.with_conn(|conn| {
            let count = conn.query_row(
                "SELECT COUNT(*) FROM confessions WHERE receiver_id = ?1 AND is_pinned = 1",
                [receiver_id.to_string()],
                |row| row.get(0),
            )?;
            Ok(count)
        })
    }

    // -- Reports --

    /// Files a report unless the same reporter already has a PENDING one on
    /// the same confession. Returns false in that case.
    pub fn create_report(&self, report: &NewReport<'_>) -> Result<bool> {
        self.with_tx(|tx| {
            let pending: bool = tx.query_row(
                "SELECT EXISTS(
                    SELECT 1 FROM reports
                    WHERE confession_id = ?1 AND reporter_id = ?2 AND status = 'PENDING'
                 )",
                params![report.confession_id.to_string(), report.reporter_id.to_string()],
                |row| row.get(0),
            )?;
            if pending {
                return Ok(false);
            }

            tx.execute(
                "INSERT INTO reports (id, confession_id, reporter_id, reason, description, status, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, 'PENDING', ?6)",
                params![
                    report.id.to_string(),
                    report.confession_id.to_string(),
                    report.reporter_id.to_string(),
                    report.reason.as_str(),
                    report.description,
                    ts(report.created_at),
                ],
            )?;
            Ok(true)
        })
    }

    pub fn get_report(&self, id: Uuid) -> Result<Option<ReportRow>> {
        self.with_conn(|conn| {
            let row = conn
                .query_row(
                    "SELECT id, confession_id, reporter_id, reason, description, status,
                            reviewed_by, reviewed_at, created_at
                     FROM reports WHERE id = ?1",
                    [id.to_string()],
                    |row| {
                        Ok(ReportRow {
                            id: uuid_at(row, 0)?,
                            confession_id: uuid_at(row, 1)?,
                            reporter_id: uuid_at(row, 2)?,
                            reason: parsed_at(row, 3)?,
                            description: row.get(4)?,
                            status: parsed_at(row, 5)?,
                            reviewed_by: opt_uuid_at(row, 6)?,
                            reviewed_at: row.get(7)?,
                            created_at: row.get(8)?,
                        })
                    },
                )
                .optional()?;
            Ok(row)
        })
    }

    pub fn update_report_status(
        &self,
        id: Uuid,
        status: ReportStatus,
        reviewer: Uuid,
        at: DateTime<Utc>,
    ) -> Result<bool> {
        self.with_conn(|conn| {
            let changed = conn.execute(
                "UPDATE reports SET status = ?2, reviewed_by = ?3, reviewed_at = ?4 WHERE id = ?1",
                params![id.to_string(), status.as_str(), reviewer.to_string(), ts(at)],
            )?;
            Ok(changed > 0)
        })
    }

    /// Newest reports first, joined with everything a moderator needs.
    pub fn list_reports(&self, limit: u32) -> Result<Vec<ReportDetail>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT r.id, r.reason, r.description, r.status, r.created_at, r.reviewed_at,
                        c.id, c.content, c.is_anonymous, c.created_at,
                        s.id, s.username, s.image,
                        rc.id, rc.username, rc.image,
                        rp.id, rp.username, rp.image,
                        rv.id, rv.username, rv.image
                 FROM reports r
                 JOIN confessions c ON c.id = r.confession_id
                 JOIN users rc ON rc.id = c.receiver_id
                 JOIN users rp ON rp.id = r.reporter_id
                 LEFT JOIN users s ON s.id = c.sender_id
                 LEFT JOIN users rv ON rv.id = r.reviewed_by
                 ORDER BY r.created_at DESC
                 LIMIT ?1",
            )?;

            let rows = stmt
                .query_map([limit], |row| {
                    let receiver = summary_at(row, 13)?
                        .ok_or(rusqlite::Error::InvalidColumnType(13, "rc.id".into(), Type::Null))?;
                    let reporter = summary_at(row, 16)?
                        .ok_or(rusqlite::Error::InvalidColumnType(16, "rp.id".into(), Type::Null))?;
                    Ok(ReportDetail {
                        id: uuid_at(row, 0)?,
                        reason: parsed_at(row, 1)?,
                        description: row.get(2)?,
                        status: parsed_at(row, 3)?,
                        created_at: row.get(4)?,
                        reviewed_at: row.get(5)?,
                        confession: ReportedConfession {
                            id: uuid_at(row, 6)?,
                            content: row.get(7)?,
                            is_anonymous: row.get(8)?,
                            created_at: row.get(9)?,
                            sender: summary_at(row, 10)?,
                            receiver,
                        },
                        reporter,
                        reviewer: summary_at(row, 19)?,
                    })
                })?
                .collect::<std::result::Result<Vec<_>, _>>()?;

            Ok(rows)
        })
    }
}

/// Fixed-width UTC timestamps so that text ordering equals time ordering.
fn ts(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn escape_like(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for ch in raw.chars() {
        if matches!(ch, '\\' | '%' | '_') {
            out.push('\\');
        }
        out.push(ch);
    }
    out
}

fn count_owners(conn: &Connection) -> Result<i64> {
    let count = conn.query_row(
        "SELECT COUNT(*) FROM users WHERE role = 'OWNER'",
        [],
        |row| row.get(0),
    )?;
    Ok(count)
}

fn query_role(conn: &Connection, id: Uuid) -> Result<Option<Role>> {
    let role = conn
        .query_row(
            "SELECT role FROM users WHERE id = ?1",
            [id.to_string()],
            |row| parsed_at::<Role>(row, 0),
        )
        .optional()?;
    Ok(role)
}

fn query_user(conn: &Connection, sql: &str, key: &str) -> Result<Option<UserRow>> {
    let row = conn
        .query_row(sql, [key], |row| {
            Ok(UserRow {
                id: uuid_at(row, 0)?,
                username: row.get(1)?,
                password: row.get(2)?,
                role: parsed_at(row, 3)?,
                is_banned: row.get(4)?,
                bio: row.get(5)?,
                image: row.get(6)?,
                created_at: row.get(7)?,
            })
        })
        .optional()?;
    Ok(row)
}

fn map_confession(row: &Row<'_>) -> rusqlite::Result<ConfessionRow> {
    Ok(ConfessionRow {
        id: uuid_at(row, 0)?,
        content: row.get(1)?,
        sender_id: opt_uuid_at(row, 2)?,
        receiver_id: uuid_at(row, 3)?,
        is_anonymous: row.get(4)?,
        is_pinned: row.get(5)?,
        reply: row.get(6)?,
        reply_at: row.get(7)?,
        created_at: row.get(8)?,
        edited_at: row.get(9)?,
        sender: summary_at(row, 10)?,
    })
}

fn uuid_at(row: &Row<'_>, idx: usize) -> rusqlite::Result<Uuid> {
    let raw: String = row.get(idx)?;
    Uuid::parse_str(&raw)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

fn opt_uuid_at(row: &Row<'_>, idx: usize) -> rusqlite::Result<Option<Uuid>> {
    match row.get::<_, Option<String>>(idx)? {
        Some(raw) => Uuid::parse_str(&raw)
            .map(Some)
            .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e))),
        None => Ok(None),
    }
}

fn parsed_at<T>(row: &Row<'_>, idx: usize) -> rusqlite::Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    let raw: String = row.get(idx)?;
    raw.parse()
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

/// Reads `id, username, image` starting at `idx`; `None` when the LEFT JOIN
/// found nobody.
fn summary_at(row: &Row<'_>, idx: usize) -> rusqlite::Result<Option<UserSummary>> {
    let Some(id) = opt_uuid_at(row, idx)? else {
        return Ok(None);
    };
    Ok(Some(UserSummary {
        id,
        username: row.get(idx + 1)?,
        image: row.get(idx + 2)?,
    }))
}

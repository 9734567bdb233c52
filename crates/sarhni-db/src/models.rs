//! Database row types. Distinct from the sarhni-types wire models so the
//! password hash and raw foreign keys never leave this layer by accident.

use chrono::{DateTime, Utc};
use uuid::Uuid;

use sarhni_types::models::{Confession, ReportReason, ReportStatus, Role, User, UserSummary};

#[derive(Debug, Clone)]
pub struct UserRow {
    pub id: Uuid,
    pub username: String,
    pub password: String,
    pub role: Role,
    pub is_banned: bool,
    pub bio: Option<String>,
    pub image: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl UserRow {
    pub fn into_public(self) -> User {
        User {
            id: self.id,
            username: self.username,
            role: self.role,
            is_banned: self.is_banned,
            bio: self.bio,
            image: self.image,
            created_at: self.created_at,
        }
    }

    pub fn summary(&self) -> UserSummary {
        UserSummary {
            id: self.id,
            username: self.username.clone(),
            image: self.image.clone(),
        }
    }
}

pub struct NewUser<'a> {
    pub id: Uuid,
    pub username: &'a str,
    pub password_hash: &'a str,
    pub created_at: DateTime<Utc>,
}

/// A confession joined with its sender's public identity (if the sender
/// still exists).
#[derive(Debug, Clone)]
pub struct ConfessionRow {
    pub id: Uuid,
    pub content: String,
    pub sender_id: Option<Uuid>,
    pub receiver_id: Uuid,
    pub is_anonymous: bool,
    pub is_pinned: bool,
    pub reply: Option<String>,
    pub reply_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub edited_at: Option<DateTime<Utc>>,
    pub sender: Option<UserSummary>,
}

impl ConfessionRow {
    /// Client view. The sender is withheld for anonymous confessions.
    pub fn into_view(self) -> Confession {
        let sender = if self.is_anonymous { None } else { self.sender };
        Confession {
            id: self.id,
            content: self.content,
            receiver_id: self.receiver_id,
            sender,
            is_anonymous: self.is_anonymous,
            is_pinned: self.is_pinned,
            reply: self.reply,
            reply_at: self.reply_at,
            created_at: self.created_at,
            edited_at: self.edited_at,
        }
    }
}

pub struct NewConfession<'a> {
    pub id: Uuid,
    pub content: &'a str,
    pub sender_id: Option<Uuid>,
    pub receiver_id: Uuid,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct ReportRow {
    pub id: Uuid,
    pub confession_id: Uuid,
    pub reporter_id: Uuid,
    pub reason: ReportReason,
    pub description: Option<String>,
    pub status: ReportStatus,
    pub reviewed_by: Option<Uuid>,
    pub reviewed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

pub struct NewReport<'a> {
    pub id: Uuid,
    pub confession_id: Uuid,
    pub reporter_id: Uuid,
    pub reason: ReportReason,
    pub description: Option<&'a str>,
    pub created_at: DateTime<Utc>,
}

/// Outcome of the transactional pin toggle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PinToggle {
    Pinned,
    Unpinned,
    /// The receiver already has the maximum number of pinned confessions.
    LimitReached,
}

/// Outcome of a role change or account erase that may remove an OWNER.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OwnerGuarded<T> {
    Done(T),
    LastOwner,
    Missing,
}

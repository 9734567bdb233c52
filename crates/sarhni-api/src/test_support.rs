use std::sync::Arc;

use axum::http::HeaderName;
use chrono::Utc;
use tempfile::TempDir;
use uuid::Uuid;

use sarhni_db::Database;
use sarhni_db::models::NewUser;
use sarhni_gateway::Dispatcher;
use sarhni_media::Storage;
use sarhni_types::api::Claims;
use sarhni_types::models::Role;

use crate::authz::AuthUser;
use crate::cache::PageCache;
use crate::middleware::Session;
use crate::rate_limit::RateLimiter;
use crate::state::{AppState, AppStateInner};

pub const TEST_SECRET: &str = "test-secret-for-unit-tests-only";

pub fn test_db() -> Database {
    Database::open_in_memory().unwrap()
}

pub async fn test_state() -> (AppState, TempDir) {
    let dir = tempfile::tempdir().unwrap();
    let storage = Storage::new(dir.path().join("uploads"), "/uploads")
        .await
        .unwrap();
    let state = Arc::new(AppStateInner {
        db: test_db(),
        jwt_secret: TEST_SECRET.to_string(),
        dispatcher: Dispatcher::new(),
        storage,
        cache: PageCache::default(),
        send_limiter: RateLimiter::confession_sends(),
        search_limiter: RateLimiter::searches(),
        trusted_ip_header: HeaderName::from_static("x-real-ip"),
    });
    (state, dir)
}

#[derive(Debug, Clone)]
pub struct TestUser {
    pub id: Uuid,
    pub username: String,
    pub role: Role,
}

impl TestUser {
    /// Insert an account and force its role, bypassing registration rules.
    pub fn create(db: &Database, username: &str, role: Role) -> Self {
        let id = Uuid::new_v4();
        db.register_user(&NewUser {
            id,
            username,
            password_hash: "not-a-real-hash",
            created_at: Utc::now(),
        })
        .unwrap()
        .expect("username free");
        db.with_conn(|conn| {
            conn.execute(
                "UPDATE users SET role = ?2 WHERE id = ?1",
                (id.to_string(), role.as_str()),
            )?;
            Ok(())
        })
        .unwrap();
        Self {
            id,
            username: username.to_string(),
            role,
        }
    }

    pub fn claims(&self) -> Claims {
        Claims {
            sub: self.id,
            username: self.username.clone(),
            role: self.role,
            banned: false,
            exp: (Utc::now() + chrono::Duration::days(1)).timestamp() as usize,
        }
    }

    pub fn session(&self) -> Session {
        Session(Some(self.claims()))
    }

    pub fn auth(&self) -> AuthUser {
        AuthUser {
            id: self.id,
            username: self.username.clone(),
            role: self.role,
        }
    }
}

use std::collections::{HashMap, HashSet};
use std::sync::{Mutex, PoisonError};
use std::time::{Duration, Instant};

use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::warn;
use uuid::Uuid;

/// Passive revalidation window.
pub const DEFAULT_TTL: Duration = Duration::from_secs(60);

pub const SWEEP_INTERVAL: Duration = Duration::from_secs(60);

/// Tag carried by every cached page that renders data of this user.
pub fn user_tag(id: Uuid) -> String {
    format!("user:{id}")
}

pub fn profile_path(username: &str) -> String {
    format!("/u/{username}")
}

struct Entry {
    value: serde_json::Value,
    expires_at: Instant,
    tags: Vec<String>,
}

#[derive(Default)]
struct Pages {
    entries: HashMap<String, Entry>,
    /// tag -> paths
    tagged: HashMap<String, HashSet<String>>,
}

impl Pages {
    fn remove(&mut self, path: &str) -> bool {
        let Some(entry) = self.entries.remove(path) else {
            return false;
        };
        for tag in entry.tags {
            if let Some(paths) = self.tagged.get_mut(&tag) {
                paths.remove(path);
                if paths.is_empty() {
                    self.tagged.remove(&tag);
                }
            }
        }
        true
    }
}

/// Read-side cache of rendered page data, keyed by path and invalidated by
/// tag. It is never the source of truth: a miss always falls back to the
/// database.
pub struct PageCache {
    ttl: Duration,
    pages: Mutex<Pages>,
}

impl PageCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            pages: Mutex::new(Pages::default()),
        }
    }

    pub fn get<T: DeserializeOwned>(&self, path: &str) -> Option<T> {
        self.get_at(path, Instant::now())
    }

    fn get_at<T: DeserializeOwned>(&self, path: &str, now: Instant) -> Option<T> {
        let mut pages = self.pages.lock().unwrap_or_else(PoisonError::into_inner);
        let expired = pages.entries.get(path)?.expires_at <= now;
        if expired {
            pages.remove(path);
            return None;
        }
        let value = pages.entries.get(path)?.value.clone();
        drop(pages);

        match serde_json::from_value(value) {
            Ok(page) => Some(page),
            Err(e) => {
                warn!("Dropping undecodable cache entry {}: {}", path, e);
                self.invalidate_path(path);
                None
            }
        }
    }

    pub fn insert<T: Serialize>(&self, path: &str, tags: &[String], page: &T) {
        self.insert_at(path, tags, page, Instant::now());
    }

    fn insert_at<T: Serialize>(&self, path: &str, tags: &[String], page: &T, now: Instant) {
        let value = match serde_json::to_value(page) {
            Ok(value) => value,
            Err(e) => {
                warn!("Not caching {}: {}", path, e);
                return;
            }
        };

        let mut pages = self.pages.lock().unwrap_or_else(PoisonError::into_inner);
        pages.remove(path);
        for tag in tags {
            pages
                .tagged
                .entry(tag.clone())
                .or_default()
                .insert(path.to_string());
        }
        pages.entries.insert(
            path.to_string(),
            Entry {
                value,
                expires_at: now + self.ttl,
                tags: tags.to_vec(),
            },
        );
    }

    /// Drop every page carrying `tag`. Returns how many were dropped.
    pub fn invalidate_tag(&self, tag: &str) -> usize {
        let mut pages = self.pages.lock().unwrap_or_else(PoisonError::into_inner);
        let Some(paths) = pages.tagged.remove(tag) else {
            return 0;
        };
        paths.iter().filter(|path| pages.remove(path)).count()
    }

    pub fn invalidate_path(&self, path: &str) {
        self.pages
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(path);
    }

    /// Drop expired pages. Returns how many went.
    pub fn sweep(&self) -> usize {
        let now = Instant::now();
        let mut pages = self.pages.lock().unwrap_or_else(PoisonError::into_inner);
        let expired: Vec<String> = pages
            .entries
            .iter()
            .filter(|(_, entry)| entry.expires_at <= now)
            .map(|(path, _)| path.clone())
            .collect();
        expired.iter().filter(|path| pages.remove(path)).count()
    }
}

impl Default for PageCache {
    fn default() -> Self {
        Self::new(DEFAULT_TTL)
    }
}

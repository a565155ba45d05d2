//! Sliding-window rate limiting per identifier.
//!
//! Each identifier keeps a log of request timestamps (epoch millis). A check
//! evicts entries older than the window, then admits the request only while
//! the live count is below `max_requests`. Windows live in a
//! [`RateLimitBackend`]: in memory, or one JSON document per identifier on
//! disk. Unreadable documents count as an empty window.

use chrono::Utc;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::error::Result;

pub const CLEANUP_INTERVAL: Duration = Duration::from_secs(60);

const MINUTE_MS: u64 = 60 * 1000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitConfig {
    pub window_ms: u64,
    pub max_requests: u32,
    /// Forgive earlier attempts once the guarded operation succeeds.
    pub reset_on_success: bool,
}

impl RateLimitConfig {
    pub fn new(window_ms: u64, max_requests: u32) -> Self {
        Self {
            window_ms,
            max_requests,
            reset_on_success: false,
        }
    }

    pub fn with_reset_on_success(mut self) -> Self {
        self.reset_on_success = true;
        self
    }

    /// Authentication attempts: 5 per 15 minutes, reset on success.
    pub fn auth() -> Self {
        Self::new(15 * MINUTE_MS, 5).with_reset_on_success()
    }

    /// General API calls: 100 per minute.
    pub fn api() -> Self {
        Self::new(MINUTE_MS, 100)
    }

    /// Form submissions: 10 per minute.
    pub fn form() -> Self {
        Self::new(MINUTE_MS, 10)
    }
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self::api()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RateWindow {
    pub window_start: u64,
    pub requests: Vec<u64>,
}

impl RateWindow {
    fn starting_at(now: u64) -> Self {
        Self {
            window_start: now,
            requests: Vec::new(),
        }
    }

    /// Drop timestamps older than `now - window_ms`; the boundary itself stays live.
    fn evict(&mut self, now: u64, window_ms: u64) {
        let cutoff = now.saturating_sub(window_ms);
        self.requests.retain(|t| *t >= cutoff);
        if self.requests.is_empty() {
            self.window_start = now;
        }
    }

    fn is_expired(&self, now: u64, window_ms: u64) -> bool {
        let cutoff = now.saturating_sub(window_ms);
        self.requests.iter().all(|t| *t < cutoff)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RateLimitResult {
    pub allowed: bool,
    pub remaining: u32,
    /// Epoch millis at which the oldest live request leaves the window.
    pub reset_at: u64,
    pub total_requests: u32,
}

pub trait RateLimitBackend: Send + Sync {
    fn load(&self, id: &str) -> Option<RateWindow>;
    fn store(&self, id: &str, window: &RateWindow) -> Result<()>;
    fn remove(&self, id: &str) -> Result<()>;
    /// Remove every window matching `expired`; returns how many were dropped.
    fn purge(&self, expired: &dyn Fn(&RateWindow) -> bool) -> Result<usize>;
}

/// Windows kept in process memory; lost on restart.
#[derive(Default)]
pub struct MemoryBackend {
    windows: Mutex<HashMap<String, RateWindow>>,
}

impl RateLimitBackend for MemoryBackend {
    fn load(&self, id: &str) -> Option<RateWindow> {
        self.windows.lock().get(id).cloned()
    }

    fn store(&self, id: &str, window: &RateWindow) -> Result<()> {
        self.windows.lock().insert(id.to_string(), window.clone());
        Ok(())
    }

    fn remove(&self, id: &str) -> Result<()> {
        self.windows.lock().remove(id);
        Ok(())
    }

    fn purge(&self, expired: &dyn Fn(&RateWindow) -> bool) -> Result<usize> {
        let mut windows = self.windows.lock();
        let before = windows.len();
        windows.retain(|_, window| !expired(window));
        Ok(before - windows.len())
    }
}

/// One JSON document per identifier, named by the SHA-256 of the identifier.
pub struct FileBackend {
    dir: PathBuf,
}

impl FileBackend {
    pub fn new(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn path_for(&self, id: &str) -> PathBuf {
        let digest = Sha256::digest(id.as_bytes());
        self.dir.join(format!("{}.json", hex::encode(digest)))
    }

    fn read_window(path: &Path) -> Option<RateWindow> {
        let data = match fs::read_to_string(path) {
            Ok(data) => data,
            Err(e) if e.kind() == ErrorKind::NotFound => return None,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "unreadable rate-limit state; treating as empty");
                return None;
            }
        };
        match serde_json::from_str(&data) {
            Ok(window) => Some(window),
            Err(e) => {
                warn!(path = %path.display(), error = %e, "corrupted rate-limit state; treating as empty");
                None
            }
        }
    }
}

impl RateLimitBackend for FileBackend {
    fn load(&self, id: &str) -> Option<RateWindow> {
        Self::read_window(&self.path_for(id))
    }

    fn store(&self, id: &str, window: &RateWindow) -> Result<()> {
        let path = self.path_for(id);
        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, serde_json::to_vec(window)?)?;
        fs::rename(&tmp, &path)?;
        Ok(())
    }

    fn remove(&self, id: &str) -> Result<()> {
        match fs::remove_file(self.path_for(id)) {
            Err(e) if e.kind() != ErrorKind::NotFound => Err(e.into()),
            _ => Ok(()),
        }
    }

    fn purge(&self, expired: &dyn Fn(&RateWindow) -> bool) -> Result<usize> {
        let mut removed = 0;
        for entry in fs::read_dir(&self.dir)? {
            let path = entry?.path();
            if path.extension().and_then(|ext| ext.to_str()) != Some("json") {
                continue;
            }
            let stale = match Self::read_window(&path) {
                Some(window) => expired(&window),
                None => true,
            };
            if stale {
                fs::remove_file(&path)?;
                removed += 1;
            }
        }
        Ok(removed)
    }
}

pub fn now_ms() -> u64 {
    Utc::now().timestamp_millis().max(0) as u64
}

pub struct RateLimiter<B: RateLimitBackend = MemoryBackend> {
    config: RateLimitConfig,
    backend: B,
    // evict-then-append must not interleave between callers
    lock: Mutex<()>,
}

impl RateLimiter<MemoryBackend> {
    pub fn in_memory(config: RateLimitConfig) -> Self {
        Self::new(config, MemoryBackend::default())
    }
}

impl RateLimiter<FileBackend> {
    pub fn persisted(config: RateLimitConfig, dir: impl Into<PathBuf>) -> Result<Self> {
        Ok(Self::new(config, FileBackend::new(dir)?))
    }
}

impl<B: RateLimitBackend> RateLimiter<B> {
    pub fn new(config: RateLimitConfig, backend: B) -> Self {
        Self {
            config,
            backend,
            lock: Mutex::new(()),
        }
    }

    pub fn config(&self) -> &RateLimitConfig {
        &self.config
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    pub fn check(&self, id: &str) -> Result<RateLimitResult> {
        self.check_at(id, now_ms())
    }

    /// Admit and record one request at `now` if the window has room.
    pub fn check_at(&self, id: &str, now: u64) -> Result<RateLimitResult> {
        let _guard = self.lock.lock();
        let mut window = self
            .backend
            .load(id)
            .unwrap_or_else(|| RateWindow::starting_at(now));
        window.evict(now, self.config.window_ms);
        let allowed = (window.requests.len() as u64) < u64::from(self.config.max_requests);
        if allowed {
            window.requests.push(now);
        } else {
            debug!(id, "rate limit exceeded");
        }
        self.backend.store(id, &window)?;
        Ok(self.summarize(&window, allowed, now))
    }

    pub fn status(&self, id: &str) -> RateLimitResult {
        self.status_at(id, now_ms())
    }

    /// Same computation as [`check_at`](Self::check_at) without recording anything.
    pub fn status_at(&self, id: &str, now: u64) -> RateLimitResult {
        let _guard = self.lock.lock();
        let mut window = self
            .backend
            .load(id)
            .unwrap_or_else(|| RateWindow::starting_at(now));
        window.evict(now, self.config.window_ms);
        let allowed = (window.requests.len() as u64) < u64::from(self.config.max_requests);
        self.summarize(&window, allowed, now)
    }

    pub fn reset(&self, id: &str) -> Result<()> {
        let _guard = self.lock.lock();
        self.backend.remove(id)
    }

    /// Reset `id` if the policy forgives on success. Returns whether it did.
    pub fn record_success(&self, id: &str) -> Result<bool> {
        if !self.config.reset_on_success {
            return Ok(false);
        }
        self.reset(id)?;
        Ok(true)
    }

    /// Drop windows with no live requests at `now`.
    pub fn cleanup_at(&self, now: u64) -> Result<usize> {
        let _guard = self.lock.lock();
        let window_ms = self.config.window_ms;
        self.backend
            .purge(&|window: &RateWindow| window.is_expired(now, window_ms))
    }

    fn summarize(&self, window: &RateWindow, allowed: bool, now: u64) -> RateLimitResult {
        let count = u32::try_from(window.requests.len()).unwrap_or(u32::MAX);
        let reset_at = window
            .requests
            .iter()
            .min()
            .map_or(now, |oldest| *oldest)
            .saturating_add(self.config.window_ms);
        RateLimitResult {
            allowed,
            remaining: self.config.max_requests.saturating_sub(count),
            reset_at,
            total_requests: count,
        }
    }
}

impl<B: RateLimitBackend + 'static> RateLimiter<B> {
    /// Periodic sweep of expired windows. Abort the handle to stop it.
    pub fn spawn_cleanup(self: Arc<Self>, period: Duration) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                match self.cleanup_at(now_ms()) {
                    Ok(0) => {}
                    Ok(removed) => debug!(removed, "rate-limit cleanup"),
                    Err(e) => warn!(error = %e, "rate-limit cleanup failed"),
                }
            }
        })
    }
}

//! Admission checks run before an inbound command is decoded

use std::collections::{HashMap, HashSet};
use std::sync::Mutex;
use std::time::Duration;

use tokio::time::Instant;

use crate::config::SecurityConfig;

const WINDOW: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Allowed,
    Denied,
    RateLimited,
}

struct Window {
    started: Instant,
    requests: u32,
}

/// Deny list plus a fixed one-second request window per caller.
pub struct RequestLimits {
    deny_list: HashSet<String>,
    per_second: u32,
    windows: Mutex<HashMap<String, Window>>,
}

impl RequestLimits {
    pub fn new(config: &SecurityConfig) -> Self {
        Self {
            deny_list: config.deny_list.iter().cloned().collect(),
            per_second: config.rate_limit_per_second,
            windows: Mutex::new(HashMap::new()),
        }
    }

    pub fn admit(&self, caller: &str) -> Admission {
        if self.deny_list.contains(caller) {
            return Admission::Denied;
        }
        if self.per_second == 0 {
            return Admission::Allowed;
        }

        let now = Instant::now();
        let Ok(mut windows) = self.windows.lock() else {
            return Admission::Allowed;
        };
        // Forget callers whose window has long closed
        if windows.len() > 1024 {
            windows.retain(|_, w| now.duration_since(w.started) < WINDOW);
        }
        let window = windows.entry(caller.to_string()).or_insert(Window {
            started: now,
            requests: 0,
        });
        if now.duration_since(window.started) >= WINDOW {
            window.started = now;
            window.requests = 0;
        }
        window.requests += 1;
        if window.requests > self.per_second {
            Admission::RateLimited
        } else {
            Admission::Allowed
        }
    }
}

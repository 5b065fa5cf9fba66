//! Sliding-window rate limiter
//!
//! Keyed by `(action, identifier)`. Each action class has its own
//! [`LimitProfile`]; exceeding `max_attempts` inside `window_ms` starts a
//! cooldown of `block_duration_ms` during which every attempt for that key is
//! rejected immediately without consuming window slots.
//!
//! State is in memory only. A restart forgets all windows, which is
//! acceptable because the remote services enforce their own limits.

use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};
use thiserror::Error;

use crate::clock::Clock;

/// Action classes with independent thresholds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RateLimitAction {
    /// Coarse remote API calls (balance, phase, ownership reads)
    Api,
    /// Connection / dApp connection requests
    Connection,
    /// Signing requests
    BulkSigning,
    /// Password attempts against the vault
    Unlock,
    Activation,
    Transfer,
    /// Private-key disclosure
    Reveal,
}

impl RateLimitAction {
    pub const ALL: [RateLimitAction; 7] = [
        Self::Api,
        Self::Connection,
        Self::BulkSigning,
        Self::Unlock,
        Self::Activation,
        Self::Transfer,
        Self::Reveal,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Api => "api",
            Self::Connection => "connection",
            Self::BulkSigning => "bulk_signing",
            Self::Unlock => "unlock",
            Self::Activation => "activation",
            Self::Transfer => "transfer",
            Self::Reveal => "reveal",
        }
    }

    pub fn default_profile(self) -> LimitProfile {
        const SEC: u64 = 1_000;
        const MIN: u64 = 60 * SEC;
        match self {
            Self::Api => LimitProfile::new(100, MIN, MIN),
            Self::Connection => LimitProfile::new(10, MIN, 5 * MIN),
            Self::BulkSigning => LimitProfile::new(20, MIN, 5 * MIN),
            Self::Unlock => LimitProfile::new(5, 5 * MIN, 15 * MIN),
            Self::Activation => LimitProfile::new(3, 60 * MIN, 60 * MIN),
            Self::Transfer => LimitProfile::new(3, 60 * MIN, 60 * MIN),
            Self::Reveal => LimitProfile::new(3, 15 * MIN, 30 * MIN),
        }
    }
}

impl fmt::Display for RateLimitAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Thresholds for one action class.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LimitProfile {
    pub max_attempts: u32,
    pub window_ms: u64,
    pub block_duration_ms: u64,
}

impl LimitProfile {
    pub const fn new(max_attempts: u32, window_ms: u64, block_duration_ms: u64) -> Self {
        Self {
            max_attempts,
            window_ms,
            block_duration_ms,
        }
    }
}

/// Returned when an attempt is refused.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("rate limit exceeded for {action}, retry after {retry_after_ms} ms")]
pub struct RateLimited {
    pub action: RateLimitAction,
    pub retry_after_ms: u64,
}

#[derive(Debug, Default)]
struct Window {
    attempts: VecDeque<u64>,
    blocked_until: Option<u64>,
}

type WindowKey = (RateLimitAction, String);

/// In-memory limiter shared by every sensitive wallet operation.
pub struct RateLimiter {
    clock: Arc<dyn Clock>,
    profiles: HashMap<RateLimitAction, LimitProfile>,
    windows: Mutex<HashMap<WindowKey, Window>>,
}

impl RateLimiter {
    /// Limiter with the default profile for every action.
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        let profiles = RateLimitAction::ALL
            .iter()
            .map(|a| (*a, a.default_profile()))
            .collect();
        Self {
            clock,
            profiles,
            windows: Mutex::new(HashMap::new()),
        }
    }

    /// Override the profile of one action.
    pub fn with_profile(mut self, action: RateLimitAction, profile: LimitProfile) -> Self {
        self.profiles.insert(action, profile);
        self
    }

    pub fn profile(&self, action: RateLimitAction) -> LimitProfile {
        self.profiles
            .get(&action)
            .copied()
            .unwrap_or_else(|| action.default_profile())
    }

    fn windows(&self) -> MutexGuard<'_, HashMap<WindowKey, Window>> {
        self.windows.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Record an attempt, or refuse it.
    pub fn check(&self, action: RateLimitAction, identifier: &str) -> Result<(), RateLimited> {
        let profile = self.profile(action);
        let now = self.clock.now_ms();
        let mut windows = self.windows();
        let window = windows
            .entry((action, identifier.to_string()))
            .or_default();

        if let Some(until) = window.blocked_until {
            if now < until {
                return Err(RateLimited {
                    action,
                    retry_after_ms: until - now,
                });
            }
            window.blocked_until = None;
            window.attempts.clear();
        }

        while let Some(&oldest) = window.attempts.front() {
            if now.saturating_sub(oldest) >= profile.window_ms {
                window.attempts.pop_front();
            } else {
                break;
            }
        }

        if window.attempts.len() as u32 >= profile.max_attempts {
            window.blocked_until = Some(now + profile.block_duration_ms);
            log::warn!(
                "rate limit tripped for {} ({} attempts in {} ms)",
                action,
                window.attempts.len(),
                profile.window_ms
            );
            return Err(RateLimited {
                action,
                retry_after_ms: profile.block_duration_ms,
            });
        }

        window.attempts.push_back(now);
        Ok(())
    }

    /// Attempts left in the current window (0 while blocked).
    pub fn remaining(&self, action: RateLimitAction, identifier: &str) -> u32 {
        let profile = self.profile(action);
        let now = self.clock.now_ms();
        let windows = self.windows();
        match windows.get(&(action, identifier.to_string())) {
            None => profile.max_attempts,
            Some(w) if w.blocked_until.is_some_and(|until| now < until) => 0,
            Some(w) if w.blocked_until.is_some() => profile.max_attempts,
            Some(w) => {
                let live = w
                    .attempts
                    .iter()
                    .filter(|&&t| now.saturating_sub(t) < profile.window_ms)
                    .count() as u32;
                profile.max_attempts.saturating_sub(live)
            }
        }
    }

    /// Forget the window of one key (e.g. after a successful unlock).
    pub fn reset(&self, action: RateLimitAction, identifier: &str) {
        self.windows().remove(&(action, identifier.to_string()));
    }

    /// Drop windows with no live attempts and no active block.
    pub fn prune(&self) {
        let now = self.clock.now_ms();
        let profiles = &self.profiles;
        self.windows().retain(|(action, _), w| {
            let window_ms = profiles
                .get(action)
                .map(|p| p.window_ms)
                .unwrap_or(0);
            let blocked = w.blocked_until.is_some_and(|until| now < until);
            let live = w
                .attempts
                .back()
                .is_some_and(|&t| now.saturating_sub(t) < window_ms);
            blocked || live
        });
    }

    pub fn tracked_keys(&self) -> usize {
        self.windows().len()
    }
}

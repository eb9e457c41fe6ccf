//! Relay health tracking and reconnection scheduling
//!
//! The manager keeps one [`RelayInfo`] per configured relay, in configuration
//! order. Health only orders candidates for *new* connections and drives the
//! reconnection backoff; it never removes an open connection from a fan-out.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use crate::config::PoolConfig;

/// Consecutive failures after which a relay is considered unhealthy
const UNHEALTHY_AFTER_FAILURES: u32 = 3;

/// Acknowledgement latency above which a relay is considered degraded
const DEGRADED_LATENCY_MS: u64 = 5_000;

// ----------------------------------------------------------------------------
// Relay Health and Status
// ----------------------------------------------------------------------------

/// Health status of a relay
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum RelayHealth {
    /// Relay is responsive
    Healthy,
    /// Relay is slow but functional
    Degraded,
    /// Relay is unreachable or failing
    Unhealthy,
    /// Relay has not been tried yet
    #[default]
    Unknown,
}

impl RelayHealth {
    /// Candidate preference, lower first
    fn rank(self) -> u8 {
        match self {
            RelayHealth::Healthy => 0,
            RelayHealth::Unknown => 1,
            RelayHealth::Degraded => 2,
            RelayHealth::Unhealthy => 3,
        }
    }
}

/// Relay connection and publish statistics
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RelayStats {
    /// Total connection attempts
    pub connection_attempts: u32,
    /// Successful connections
    pub successful_connections: u32,
    /// Events the relay accepted
    pub events_accepted: u32,
    /// Events the relay explicitly refused
    pub events_rejected: u32,
    /// Publishes that timed out or failed to send
    pub events_failed: u32,
    /// Moving average of acknowledgement latency
    pub average_latency_ms: Option<u64>,
    pub last_latency_ms: Option<u64>,
}

impl RelayStats {
    /// Calculate connection success rate
    pub fn connection_success_rate(&self) -> f64 {
        if self.connection_attempts == 0 {
            0.0
        } else {
            self.successful_connections as f64 / self.connection_attempts as f64
        }
    }

    /// Calculate event success rate
    pub fn event_success_rate(&self) -> f64 {
        let total = self.events_accepted + self.events_rejected + self.events_failed;
        if total == 0 {
            0.0
        } else {
            self.events_accepted as f64 / total as f64
        }
    }
}

/// Outcome of publishing one event to one relay
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PublishOutcome {
    Accepted { latency: Duration },
    Rejected,
    Failed,
}

/// Everything the pool knows about one relay
#[derive(Debug, Clone)]
pub struct RelayInfo {
    pub url: String,
    pub read_only: bool,
    pub health: RelayHealth,
    pub stats: RelayStats,
    pub consecutive_failures: u32,
    pub is_connected: bool,
    pub last_connection_attempt: Option<Instant>,
    /// Earliest time the maintenance task may retry this relay
    pub next_retry_at: Option<Instant>,
}

impl RelayInfo {
    pub fn new<S: Into<String>>(url: S, read_only: bool) -> Self {
        Self {
            url: url.into(),
            read_only,
            health: RelayHealth::Unknown,
            stats: RelayStats::default(),
            consecutive_failures: 0,
            is_connected: false,
            last_connection_attempt: None,
            next_retry_at: None,
        }
    }
}

// ----------------------------------------------------------------------------
// Backoff
// ----------------------------------------------------------------------------

/// Exponential backoff between reconnection attempts
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BackoffPolicy {
    pub initial: Duration,
    pub max: Duration,
    pub multiplier: f64,
}

impl BackoffPolicy {
    /// Delay before the next attempt after `failures` consecutive failures
    pub fn delay_for(&self, failures: u32) -> Duration {
        if failures == 0 {
            return Duration::ZERO;
        }
        let exponent = (failures - 1).min(32) as i32;
        let secs = self.initial.as_secs_f64() * self.multiplier.max(1.0).powi(exponent);
        if !secs.is_finite() || secs >= self.max.as_secs_f64() {
            self.max
        } else {
            Duration::from_secs_f64(secs)
        }
    }
}

impl From<&PoolConfig> for BackoffPolicy {
    fn from(config: &PoolConfig) -> Self {
        Self {
            initial: config.initial_backoff,
            max: config.max_backoff,
            multiplier: config.backoff_multiplier,
        }
    }
}

// ----------------------------------------------------------------------------
// Relay Manager
// ----------------------------------------------------------------------------

/// Health bookkeeping for the pool's relays
#[derive(Debug, Clone)]
pub struct RelayManager {
    relays: Vec<RelayInfo>,
    backoff: BackoffPolicy,
}

impl RelayManager {
    pub fn new(backoff: BackoffPolicy) -> Self {
        Self {
            relays: Vec::new(),
            backoff,
        }
    }

    pub fn from_config(config: &PoolConfig) -> Self {
        let mut manager = Self::new(BackoffPolicy::from(config));
        for relay in &config.relays {
            manager.add_relay(&relay.url, relay.read_only);
        }
        manager
    }

    /// Add a relay; returns false if it is already known
    pub fn add_relay(&mut self, url: &str, read_only: bool) -> bool {
        if self.contains(url) {
            return false;
        }
        self.relays.push(RelayInfo::new(url, read_only));
        true
    }

    pub fn remove_relay(&mut self, url: &str) -> Option<RelayInfo> {
        let index = self.relays.iter().position(|relay| relay.url == url)?;
        Some(self.relays.remove(index))
    }

    pub fn contains(&self, url: &str) -> bool {
        self.get_relay(url).is_some()
    }

    pub fn get_relay(&self, url: &str) -> Option<&RelayInfo> {
        self.relays.iter().find(|relay| relay.url == url)
    }

    fn get_relay_mut(&mut self, url: &str) -> Option<&mut RelayInfo> {
        self.relays.iter_mut().find(|relay| relay.url == url)
    }

    pub fn relays(&self) -> &[RelayInfo] {
        &self.relays
    }

    pub fn is_read_only(&self, url: &str) -> bool {
        self.get_relay(url).is_some_and(|relay| relay.read_only)
    }

    pub fn record_connection_attempt(&mut self, url: &str, now: Instant) {
        if let Some(relay) = self.get_relay_mut(url) {
            relay.stats.connection_attempts += 1;
            relay.last_connection_attempt = Some(now);
        }
    }

    /// Update health after a connection attempt and schedule the next retry
    pub fn record_connection_result(&mut self, url: &str, success: bool, now: Instant) {
        let backoff = self.backoff;
        if let Some(relay) = self.get_relay_mut(url) {
            if success {
                relay.stats.successful_connections += 1;
                relay.consecutive_failures = 0;
                relay.is_connected = true;
                relay.next_retry_at = None;
                if relay.health != RelayHealth::Degraded {
                    relay.health = RelayHealth::Healthy;
                }
            } else {
                Self::record_failure(relay, backoff, now);
            }
        }
    }

    /// Mark a relay disconnected; unexpected drops are scheduled for retry
    pub fn record_disconnect(&mut self, url: &str, unexpected: bool, now: Instant) {
        let backoff = self.backoff;
        if let Some(relay) = self.get_relay_mut(url) {
            relay.is_connected = false;
            if unexpected {
                Self::record_failure(relay, backoff, now);
            }
        }
    }

    fn record_failure(relay: &mut RelayInfo, backoff: BackoffPolicy, now: Instant) {
        relay.is_connected = false;
        relay.consecutive_failures = relay.consecutive_failures.saturating_add(1);
        relay.next_retry_at = Some(now + backoff.delay_for(relay.consecutive_failures));
        if relay.consecutive_failures >= UNHEALTHY_AFTER_FAILURES {
            relay.health = RelayHealth::Unhealthy;
        }
    }

    pub fn record_publish(&mut self, url: &str, outcome: PublishOutcome) {
        if let Some(relay) = self.get_relay_mut(url) {
            match outcome {
                PublishOutcome::Accepted { latency } => {
                    let latency_ms = latency.as_millis() as u64;
                    relay.stats.events_accepted += 1;
                    relay.stats.last_latency_ms = Some(latency_ms);
                    relay.stats.average_latency_ms = Some(match relay.stats.average_latency_ms {
                        Some(average) => (average + latency_ms) / 2,
                        None => latency_ms,
                    });
                    relay.health = if latency_ms > DEGRADED_LATENCY_MS {
                        RelayHealth::Degraded
                    } else {
                        RelayHealth::Healthy
                    };
                }
                PublishOutcome::Rejected => relay.stats.events_rejected += 1,
                PublishOutcome::Failed => relay.stats.events_failed += 1,
            }
        }
    }

    /// Unconnected relays ordered by preference for a new connection.
    ///
    /// Healthier relays come first; ties keep configuration order.
    pub fn preferred_candidates(&self) -> Vec<String> {
        let mut candidates: Vec<&RelayInfo> =
            self.relays.iter().filter(|relay| !relay.is_connected).collect();
        candidates.sort_by(|a, b| {
            a.health.rank().cmp(&b.health.rank()).then_with(|| {
                b.stats
                    .connection_success_rate()
                    .partial_cmp(&a.stats.connection_success_rate())
                    .unwrap_or(core::cmp::Ordering::Equal)
            })
        });
        candidates.into_iter().map(|relay| relay.url.clone()).collect()
    }

    /// Unconnected relays whose backoff has elapsed, in preference order
    pub fn due_for_reconnect(&self, now: Instant) -> Vec<String> {
        self.preferred_candidates()
            .into_iter()
            .filter(|url| {
                self.get_relay(url)
                    .and_then(|relay| relay.next_retry_at)
                    .map_or(true, |at| at <= now)
            })
            .collect()
    }

    /// Get relay manager statistics
    pub fn get_stats(&self) -> RelayManagerStats {
        let mut stats = RelayManagerStats::default();

        for relay in &self.relays {
            stats.total_relays += 1;
            match relay.health {
                RelayHealth::Healthy => stats.healthy_relays += 1,
                RelayHealth::Degraded => stats.degraded_relays += 1,
                RelayHealth::Unhealthy => stats.unhealthy_relays += 1,
                RelayHealth::Unknown => stats.unknown_relays += 1,
            }
            if relay.is_connected {
                stats.connected_relays += 1;
            }
            stats.total_events_accepted += relay.stats.events_accepted;
            stats.total_events_rejected += relay.stats.events_rejected;
            stats.total_events_failed += relay.stats.events_failed;
        }

        stats
    }
}

/// Relay manager statistics
#[derive(Debug, Default, Clone, PartialEq, Serialize, Deserialize)]
pub struct RelayManagerStats {
    pub total_relays: usize,
    pub healthy_relays: usize,
    pub degraded_relays: usize,
    pub unhealthy_relays: usize,
    pub unknown_relays: usize,
    pub connected_relays: usize,
    pub total_events_accepted: u32,
    pub total_events_rejected: u32,
    pub total_events_failed: u32,
}

impl RelayManagerStats {
    /// Calculate overall health percentage
    pub fn health_percentage(&self) -> f64 {
        if self.total_relays == 0 {
            0.0
        } else {
            self.healthy_relays as f64 / self.total_relays as f64
        }
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

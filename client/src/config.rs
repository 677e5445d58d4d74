//! Client configuration and reconnection policy

use shared::{RECONCILE_TOLERANCE_M, TERRITORY_RADIUS_M};
use std::time::Duration;

/// Growth factor between successive reconnect delays
pub const BACKOFF_FACTOR: f64 = 1.5;

/// Bounded exponential backoff for reconnect attempts
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BackoffPolicy {
    pub base: Duration,
    pub cap: Duration,
    pub max_attempts: u32,
}

impl BackoffPolicy {
    /// Delay before reconnect attempt number `attempt` (1-based):
    /// `min(cap, base * 1.5^(attempt - 1))`
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(i32::MAX as u32) as i32;
        let scaled_ms = self.base.as_millis() as f64 * BACKOFF_FACTOR.powi(exponent);
        let cap_ms = self.cap.as_millis() as f64;
        Duration::from_millis(scaled_ms.min(cap_ms).round() as u64)
    }
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base: Duration::from_millis(1_000),
            cap: Duration::from_millis(30_000),
            max_attempts: 10,
        }
    }
}

/// Identity presented in the `authenticate` handshake
#[derive(Debug, Clone, PartialEq)]
pub struct Credentials {
    pub player_id: String,
    pub username: String,
    pub token: Option<String>,
}

impl Credentials {
    pub fn new(player_id: impl Into<String>, username: impl Into<String>) -> Self {
        Self {
            player_id: player_id.into(),
            username: username.into(),
            token: None,
        }
    }

    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.token = Some(token.into());
        self
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ClientConfig {
    /// WebSocket endpoint, e.g. `ws://127.0.0.1:8080`
    pub server_url: String,
    pub backoff: BackoffPolicy,
    pub territory_radius_m: f64,
    pub reconcile_tolerance_m: f64,
}

impl ClientConfig {
    pub fn new(server_url: impl Into<String>) -> Self {
        Self {
            server_url: server_url.into(),
            ..Self::default()
        }
    }
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            server_url: "ws://127.0.0.1:8080".to_string(),
            backoff: BackoffPolicy::default(),
            territory_radius_m: TERRITORY_RADIUS_M,
            reconcile_tolerance_m: RECONCILE_TOLERANCE_M,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_first_attempt_uses_base_delay() {
        let policy = BackoffPolicy::default();
        assert_eq!(policy.delay_for(1), Duration::from_millis(1_000));
    }

    #[test]
    fn test_delay_grows_by_factor() {
        let policy = BackoffPolicy::default();
        assert_eq!(policy.delay_for(2), Duration::from_millis(1_500));
        assert_eq!(policy.delay_for(3), Duration::from_millis(2_250));
    }

    #[test]
    fn test_delay_is_capped() {
        let policy = BackoffPolicy {
            base: Duration::from_millis(1_000),
            cap: Duration::from_millis(5_000),
            max_attempts: 50,
        };
        assert_eq!(policy.delay_for(10), Duration::from_millis(5_000));
        assert_eq!(policy.delay_for(u32::MAX), Duration::from_millis(5_000));
    }

    #[test]
    fn test_delays_are_non_decreasing() {
        let policy = BackoffPolicy::default();
        let delays: Vec<Duration> = (1..=20).map(|attempt| policy.delay_for(attempt)).collect();
        assert!(delays.windows(2).all(|pair| pair[0] <= pair[1]));
        assert_eq!(*delays.last().unwrap(), policy.cap);
    }

    #[test]
    fn test_default_config_uses_protocol_constants() {
        let config = ClientConfig::new("ws://example:9000");
        assert_eq!(config.server_url, "ws://example:9000");
        assert_eq!(config.territory_radius_m, TERRITORY_RADIUS_M);
        assert_eq!(config.reconcile_tolerance_m, RECONCILE_TOLERANCE_M);
    }
}

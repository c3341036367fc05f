use std::time::Duration;

use serde::Serialize;

/// Where an effective limit came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LimitSource {
    Param,
    Env,
    Default,
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthLimits {
    pub poll_interval_ms: u64,
    pub probe_timeout_ms: u64,
    pub startup_deadline_ms: u64,
    pub failure_threshold: u32,
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthLimitSources {
    pub poll_interval_ms: LimitSource,
    pub probe_timeout_ms: LimitSource,
    pub startup_deadline_ms: LimitSource,
    pub failure_threshold: LimitSource,
}

impl HealthLimits {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.probe_timeout_ms)
    }

    pub fn startup_deadline(&self) -> Duration {
        Duration::from_millis(self.startup_deadline_ms)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct StopLimits {
    pub graceful_timeout_ms: u64,
    pub kill_timeout_ms: u64,
    pub spawn_confirm_ms: u64,
    /// How long a restart waits for the old process to let go of its port.
    pub port_free_timeout_ms: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct StopLimitSources {
    pub graceful_timeout_ms: LimitSource,
    pub kill_timeout_ms: LimitSource,
    pub spawn_confirm_ms: LimitSource,
    pub port_free_timeout_ms: LimitSource,
}

impl StopLimits {
    pub fn graceful_timeout(&self) -> Duration {
        Duration::from_millis(self.graceful_timeout_ms)
    }

    pub fn kill_timeout(&self) -> Duration {
        Duration::from_millis(self.kill_timeout_ms)
    }

    pub fn spawn_confirm(&self) -> Duration {
        Duration::from_millis(self.spawn_confirm_ms)
    }

    pub fn port_free_timeout(&self) -> Duration {
        Duration::from_millis(self.port_free_timeout_ms)
    }
}

fn parse_env_u64(name: &str) -> Option<u64> {
    std::env::var(name).ok()?.trim().parse::<u64>().ok()
}

fn clamp(v: u64, min: u64, max: u64) -> u64 {
    if v < min {
        return min;
    }
    if v > max {
        return max;
    }
    v
}

/// param → env → default, with param and env values clamped to `[min..max]`.
pub fn resolve_u64(
    param: Option<u64>,
    env_name: &str,
    default: u64,
    min: u64,
    max: u64,
) -> (u64, LimitSource) {
    if let Some(p) = param {
        (clamp(p, min, max), LimitSource::Param)
    } else if let Some(envv) = parse_env_u64(env_name) {
        (clamp(envv, min, max), LimitSource::Env)
    } else {
        (default, LimitSource::Default)
    }
}

/// Resolve health monitor limits.
/// - poll_interval_ms: param → env(DEVFLEET_HEALTH_INTERVAL_MS) → default(5000), clamped [100..600000]
/// - probe_timeout_ms: param → env(DEVFLEET_PROBE_TIMEOUT_MS) → default(2000), clamped [50..30000]
/// - startup_deadline_ms: param → env(DEVFLEET_STARTUP_DEADLINE_MS) → default(60000), clamped [500..3600000]
/// - failure_threshold: param → env(DEVFLEET_FAILURE_THRESHOLD) → default(3), clamped [1..100]
pub fn resolve_health_limits(
    param_interval_ms: Option<u64>,
    param_probe_timeout_ms: Option<u64>,
    param_startup_deadline_ms: Option<u64>,
    param_failure_threshold: Option<u32>,
) -> (HealthLimits, HealthLimitSources) {
    let (poll_interval_ms, interval_src) = resolve_u64(
        param_interval_ms,
        "DEVFLEET_HEALTH_INTERVAL_MS",
        5_000,
        100,
        600_000,
    );
    let (probe_timeout_ms, probe_src) = resolve_u64(
        param_probe_timeout_ms,
        "DEVFLEET_PROBE_TIMEOUT_MS",
        2_000,
        50,
        30_000,
    );
    let (startup_deadline_ms, deadline_src) = resolve_u64(
        param_startup_deadline_ms,
        "DEVFLEET_STARTUP_DEADLINE_MS",
        60_000,
        500,
        3_600_000,
    );
    let (failure_threshold, threshold_src) = resolve_u64(
        param_failure_threshold.map(u64::from),
        "DEVFLEET_FAILURE_THRESHOLD",
        3,
        1,
        100,
    );

    let effective = HealthLimits {
        poll_interval_ms,
        probe_timeout_ms,
        startup_deadline_ms,
        failure_threshold: failure_threshold as u32,
    };
    let sources = HealthLimitSources {
        poll_interval_ms: interval_src,
        probe_timeout_ms: probe_src,
        startup_deadline_ms: deadline_src,
        failure_threshold: threshold_src,
    };
    (effective, sources)
}

/// Resolve stop/spawn protocol limits.
/// - graceful_timeout_ms: param → env(DEVFLEET_STOP_GRACEFUL_MS) → default(10000), clamped [100..120000]
/// - kill_timeout_ms: param → env(DEVFLEET_STOP_KILL_MS) → default(3000), clamped [100..60000]
/// - spawn_confirm_ms: param → env(DEVFLEET_SPAWN_CONFIRM_MS) → default(500), clamped [10..10000]
/// - port_free_timeout_ms: param → env(DEVFLEET_PORT_FREE_MS) → default(5000), clamped [0..60000]
pub fn resolve_stop_limits(
    param_graceful_ms: Option<u64>,
    param_kill_ms: Option<u64>,
    param_spawn_confirm_ms: Option<u64>,
    param_port_free_ms: Option<u64>,
) -> (StopLimits, StopLimitSources) {
    let (graceful_timeout_ms, graceful_src) = resolve_u64(
        param_graceful_ms,
        "DEVFLEET_STOP_GRACEFUL_MS",
        10_000,
        100,
        120_000,
    );
    let (kill_timeout_ms, kill_src) =
        resolve_u64(param_kill_ms, "DEVFLEET_STOP_KILL_MS", 3_000, 100, 60_000);
    let (spawn_confirm_ms, confirm_src) = resolve_u64(
        param_spawn_confirm_ms,
        "DEVFLEET_SPAWN_CONFIRM_MS",
        500,
        10,
        10_000,
    );
    let (port_free_timeout_ms, port_free_src) =
        resolve_u64(param_port_free_ms, "DEVFLEET_PORT_FREE_MS", 5_000, 0, 60_000);

    (
        StopLimits {
            graceful_timeout_ms,
            kill_timeout_ms,
            spawn_confirm_ms,
            port_free_timeout_ms,
        },
        StopLimitSources {
            graceful_timeout_ms: graceful_src,
            kill_timeout_ms: kill_src,
            spawn_confirm_ms: confirm_src,
            port_free_timeout_ms: port_free_src,
        },
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn param_wins_and_is_clamped() {
        let (value, source) = resolve_u64(Some(5), "DEVFLEET_TEST_UNSET_LIMIT", 100, 10, 1_000);
        assert_eq!(value, 10);
        assert_eq!(source, LimitSource::Param);

        let (value, _) = resolve_u64(Some(50_000), "DEVFLEET_TEST_UNSET_LIMIT", 100, 10, 1_000);
        assert_eq!(value, 1_000);
    }

    #[test]
    fn env_used_when_no_param() {
        std::env::set_var("DEVFLEET_TEST_LIMIT_ENV", "250");
        let (value, source) = resolve_u64(None, "DEVFLEET_TEST_LIMIT_ENV", 100, 10, 1_000);
        std::env::remove_var("DEVFLEET_TEST_LIMIT_ENV");
        assert_eq!(value, 250);
        assert_eq!(source, LimitSource::Env);
    }

    #[test]
    fn garbage_env_falls_back_to_default() {
        std::env::set_var("DEVFLEET_TEST_LIMIT_GARBAGE", "soon");
        let (value, source) = resolve_u64(None, "DEVFLEET_TEST_LIMIT_GARBAGE", 100, 10, 1_000);
        std::env::remove_var("DEVFLEET_TEST_LIMIT_GARBAGE");
        assert_eq!(value, 100);
        assert_eq!(source, LimitSource::Default);
    }

    #[test]
    fn stop_limits_defaults() {
        let (limits, sources) = resolve_stop_limits(None, Some(1_500), None, None);
        assert_eq!(limits.kill_timeout(), Duration::from_millis(1_500));
        assert_eq!(sources.kill_timeout_ms, LimitSource::Param);
        assert!(limits.spawn_confirm_ms >= 10);
    }

    #[test]
    fn port_free_wait_is_bounded() {
        let (limits, sources) = resolve_stop_limits(None, None, None, Some(600_000));
        assert_eq!(limits.port_free_timeout(), Duration::from_secs(60));
        assert_eq!(sources.port_free_timeout_ms, LimitSource::Param);

        let (limits, _) = resolve_stop_limits(None, None, None, Some(0));
        assert_eq!(limits.port_free_timeout_ms, 0);
    }

    #[test]
    fn health_threshold_never_zero() {
        let (limits, _) = resolve_health_limits(None, None, None, Some(0));
        assert_eq!(limits.failure_threshold, 1);
    }
}

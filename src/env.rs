//! Communicator tunables, read from the process environment once at
//! construction and frozen afterwards.

use crate::router::RoutingMode;

pub const BUFFER_CAPACITY_VAR: &str = "STARLING_BUFFER_CAPACITY";
pub const SEND_BUDGET_VAR: &str = "STARLING_SEND_BUDGET";
pub const IRECV_COUNT_VAR: &str = "STARLING_IRECV_COUNT";
pub const IRECV_SIZE_VAR: &str = "STARLING_IRECV_SIZE";
pub const ROUTING_VAR: &str = "STARLING_ROUTING";
pub const WELCOME_VAR: &str = "STARLING_WELCOME";

/// Indicates a rejected tunable combination.
#[derive(thiserror::Error, Debug)]
pub enum ConfigError {
    /// The per-peer flush threshold is zero.
    #[error("buffer capacity must be greater than zero")]
    BufferCapacityZero,

    /// The outstanding-bytes high-water mark is below one buffer, which
    /// would make every flush trip the backpressure path.
    #[error("send budget ({budget}) must be at least the buffer capacity ({capacity})")]
    SendBudgetBelowCapacity { budget: usize, capacity: usize },

    /// No receives would ever be drained.
    #[error("irecv count must be greater than zero")]
    IrecvCountZero,
}

/// Fixed configuration of a communicator.
///
/// Values come from the `STARLING_*` environment variables via
/// [`CommConfig::from_env`]; unparsable values fall back to the default with
/// a diagnostic on rank 0. Tests and embedding runtimes may build a value
/// directly and pass it to `Comm::with_config` instead of mutating the
/// process environment.
#[derive(Debug, Clone)]
pub struct CommConfig {
    /// Per-peer send-buffer flush threshold in bytes.
    ///
    /// The default is 16 MiB.
    pub buffer_capacity: usize,

    /// High-water mark on outstanding unacknowledged send bytes. Once
    /// exceeded, the sender runs the progress engine until the total drops
    /// below half of this value.
    ///
    /// The default is 256 MiB.
    pub total_send_budget: usize,

    /// Upper bound on receive completions drained per progress step.
    ///
    /// The default is 8.
    pub irecv_count: usize,

    /// Size hint in bytes for recycled receive buffers.
    ///
    /// The default is 16 MiB.
    pub irecv_size: usize,

    /// Next-hop selection scheme, see [`RoutingMode`].
    ///
    /// The default is [`RoutingMode::Direct`].
    pub routing: RoutingMode,

    /// Whether rank 0 logs a startup banner with the resolved configuration.
    ///
    /// The default is `false`.
    pub welcome: bool,
}

impl Default for CommConfig {
    fn default() -> Self {
        Self {
            buffer_capacity: 16 * 1024 * 1024,
            total_send_budget: 256 * 1024 * 1024,
            irecv_count: 8,
            irecv_size: 16 * 1024 * 1024,
            routing: RoutingMode::Direct,
            welcome: false,
        }
    }
}

impl CommConfig {
    /// Reads the configuration from the process environment. `rank` only
    /// controls which peer emits fallback diagnostics.
    pub fn from_env(rank: usize) -> Self {
        let defaults = Self::default();
        let rank0 = rank == 0;
        Self {
            buffer_capacity: read_var(
                BUFFER_CAPACITY_VAR,
                defaults.buffer_capacity,
                rank0,
                parse_usize,
            ),
            total_send_budget: read_var(
                SEND_BUDGET_VAR,
                defaults.total_send_budget,
                rank0,
                parse_usize,
            ),
            irecv_count: read_var(IRECV_COUNT_VAR, defaults.irecv_count, rank0, parse_usize),
            irecv_size: read_var(IRECV_SIZE_VAR, defaults.irecv_size, rank0, parse_usize),
            routing: read_var(ROUTING_VAR, defaults.routing, rank0, parse_routing),
            welcome: read_var(WELCOME_VAR, defaults.welcome, rank0, parse_bool),
        }
    }

    /// Validates the configuration, see [`ConfigError`] for details.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.buffer_capacity == 0 {
            return Err(ConfigError::BufferCapacityZero);
        }
        if self.total_send_budget < self.buffer_capacity {
            return Err(ConfigError::SendBudgetBelowCapacity {
                budget: self.total_send_budget,
                capacity: self.buffer_capacity,
            });
        }
        if self.irecv_count == 0 {
            return Err(ConfigError::IrecvCountZero);
        }
        Ok(())
    }
}

fn read_var<T>(var: &str, default: T, rank0: bool, parse: fn(&str) -> Option<T>) -> T {
    let Ok(raw) = std::env::var(var) else {
        return default;
    };
    match parse(raw.trim()) {
        Some(value) => value,
        None => {
            if rank0 {
                tracing::warn!(var, value = %raw, "unparsable tunable, using default");
            }
            default
        }
    }
}

fn parse_usize(s: &str) -> Option<usize> {
    s.parse().ok()
}

fn parse_bool(s: &str) -> Option<bool> {
    match s {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

fn parse_routing(s: &str) -> Option<RoutingMode> {
    match s {
        "direct" => Some(RoutingMode::Direct),
        "node-group" => Some(RoutingMode::NodeGroup),
        _ => None,
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn parses_routing_modes() {
        assert_eq!(parse_routing("direct"), Some(RoutingMode::Direct));
        assert_eq!(parse_routing("node-group"), Some(RoutingMode::NodeGroup));
        assert_eq!(parse_routing("ring"), None);
    }

    #[test]
    fn parses_bools() {
        assert_eq!(parse_bool("1"), Some(true));
        assert_eq!(parse_bool("off"), Some(false));
        assert_eq!(parse_bool("maybe"), None);
    }

    #[test]
    fn rejects_budget_below_capacity() {
        let config = CommConfig {
            buffer_capacity: 1024,
            total_send_budget: 512,
            ..CommConfig::default()
        };
        assert!(matches!(
            config.validate(),
            Err(ConfigError::SendBudgetBelowCapacity { .. })
        ));
    }

    #[test]
    fn defaults_validate() {
        CommConfig::default().validate().unwrap();
    }
}

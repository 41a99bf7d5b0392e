//! Configuration for the command and event buses.
//!
//! [`DispatchConfig`] is an explicit value built once at process entry and
//! handed to the bus constructors. [`DispatchArgs`] is the `clap` front-end
//! that reads the same settings from flags or environment variables.

use std::num::NonZeroUsize;
use std::time::Duration;

use clap::{Parser, ValueEnum};

use crate::logging::LogFormat;
use crate::wrapper::FaultPolicy;

/// How the handlers registered for one message are invoked.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InvocationMode {
    /// Every handler runs in its own task; siblings never wait on each other.
    Concurrent,
    /// Handlers run one after another in registration order.
    Sequential,
}

/// Per-bus settings.
#[derive(Debug, Clone)]
pub struct BusConfig {
    /// Bounded queue capacity. 0 means "use the host's available parallelism".
    pub queue_capacity: usize,
    /// Number of dispatch workers draining the queue. Values below 1 are
    /// treated as 1.
    pub workers: usize,
    /// Deadline budget for a single handler invocation.
    pub handler_timeout: Duration,
    /// Time allowed to drain queued messages once shutdown begins.
    pub shutdown_grace: Duration,
    pub invocation_mode: InvocationMode,
    pub fault_policy: FaultPolicy,
}

impl BusConfig {
    /// Defaults for the command bus: short, interactive deadline.
    #[must_use]
    pub fn command_defaults() -> Self {
        Self {
            queue_capacity: 0,
            workers: 1,
            handler_timeout: Duration::from_secs(5),
            shutdown_grace: Duration::from_secs(5),
            invocation_mode: InvocationMode::Sequential,
            fault_policy: FaultPolicy::Contain,
        }
    }

    /// Defaults for the event bus: long, background deadline.
    #[must_use]
    pub fn event_defaults() -> Self {
        Self {
            queue_capacity: 0,
            workers: 1,
            handler_timeout: Duration::from_secs(120),
            shutdown_grace: Duration::from_secs(5),
            invocation_mode: InvocationMode::Concurrent,
            fault_policy: FaultPolicy::Contain,
        }
    }

    /// Queue capacity after resolving 0 to the host's parallelism degree.
    #[must_use]
    pub fn effective_queue_capacity(&self) -> usize {
        if self.queue_capacity > 0 {
            return self.queue_capacity;
        }
        std::thread::available_parallelism().map_or(1, NonZeroUsize::get)
    }

    #[must_use]
    pub fn effective_workers(&self) -> usize {
        self.workers.max(1)
    }
}

/// Settings for both buses of a service.
#[derive(Debug, Clone)]
pub struct DispatchConfig {
    pub command_bus: BusConfig,
    pub event_bus: BusConfig,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            command_bus: BusConfig::command_defaults(),
            event_bus: BusConfig::event_defaults(),
        }
    }
}

// ---------------------------------------------------------------------------
// DispatchArgs
// ---------------------------------------------------------------------------

/// Deployment environment; selects the log output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum Environment {
    Development,
    Production,
}

impl Environment {
    #[must_use]
    pub fn log_format(self) -> LogFormat {
        match self {
            Self::Development => LogFormat::Pretty,
            Self::Production => LogFormat::Json,
        }
    }
}

/// Command-line and environment configuration for the dispatch core.
#[derive(Debug, Clone, Parser)]
#[command(name = "conveyor", about = "In-process command and event dispatch")]
pub struct DispatchArgs {
    #[arg(long, env = "APP_ENV", value_enum, default_value_t = Environment::Development)]
    pub environment: Environment,

    /// Command bus queue capacity (0 = available parallelism).
    #[arg(long, env = "COMMAND_BUS_BUFFER", default_value_t = 0)]
    pub command_bus_buffer: usize,

    /// Event bus queue capacity (0 = available parallelism).
    #[arg(long, env = "EVENT_BUS_BUFFER", default_value_t = 0)]
    pub event_bus_buffer: usize,

    #[arg(long, env = "COMMAND_BUS_WORKERS", default_value_t = 1)]
    pub command_bus_workers: usize,

    #[arg(long, env = "EVENT_BUS_WORKERS", default_value_t = 1)]
    pub event_bus_workers: usize,

    #[arg(long, env = "APP_COMMAND_HANDLER_TIMEOUT_MS", default_value_t = 5_000)]
    pub command_handler_timeout_ms: u64,

    #[arg(long, env = "APP_EVENT_HANDLER_TIMEOUT_MS", default_value_t = 120_000)]
    pub event_handler_timeout_ms: u64,

    /// Grace period for draining queued messages on shutdown.
    #[arg(long, env = "APP_SHUTDOWN_TIMEOUT_MS", default_value_t = 5_000)]
    pub shutdown_timeout_ms: u64,
}

impl DispatchArgs {
    /// Builds the explicit configuration value handed to the buses.
    #[must_use]
    pub fn dispatch_config(&self) -> DispatchConfig {
        let grace = Duration::from_millis(self.shutdown_timeout_ms);
        DispatchConfig {
            command_bus: BusConfig {
                queue_capacity: self.command_bus_buffer,
                workers: self.command_bus_workers,
                handler_timeout: Duration::from_millis(self.command_handler_timeout_ms),
                shutdown_grace: grace,
                ..BusConfig::command_defaults()
            },
            event_bus: BusConfig {
                queue_capacity: self.event_bus_buffer,
                workers: self.event_bus_workers,
                handler_timeout: Duration::from_millis(self.event_handler_timeout_ms),
                shutdown_grace: grace,
                ..BusConfig::event_defaults()
            },
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

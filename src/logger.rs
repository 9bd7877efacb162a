//! Leveled, structured logging — a thin, fail-open wrapper over `tracing`.
//!
//! `tracing` macros already never panic and are no-ops with no subscriber
//! installed, so "fail-open" (spec §4.2) falls out of the stack rather
//! than needing its own catch-all.

use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Level {
    Error,
    Warn,
    Info,
    Debug,
}

/// Categories used to tag structured log fields. Sugar over a plain
/// `category` field rather than separate sinks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Category {
    Trade,
    Performance,
    Balance,
    Rpc,
    Rotation,
    Arbitrage,
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Category::Trade => "trade",
            Category::Performance => "performance",
            Category::Balance => "balance",
            Category::Rpc => "rpc",
            Category::Rotation => "rotation",
            Category::Arbitrage => "arbitrage",
        };
        write!(f, "{s}")
    }
}

/// Holds the process id once and dispatches category-tagged events to
/// `tracing`. Cloning is cheap; share one instance across components.
#[derive(Debug, Clone)]
pub struct Logger {
    process_id: u32,
}

impl Default for Logger {
    fn default() -> Self {
        Self::new()
    }
}

impl Logger {
    pub fn new() -> Self {
        Self {
            process_id: std::process::id(),
        }
    }

    pub fn event(&self, level: Level, message: &str) {
        let pid = self.process_id;
        match level {
            Level::Error => tracing::error!(process_id = pid, "{}", message),
            Level::Warn => tracing::warn!(process_id = pid, "{}", message),
            Level::Info => tracing::info!(process_id = pid, "{}", message),
            Level::Debug => tracing::debug!(process_id = pid, "{}", message),
        }
    }

    fn categorized(&self, level: Level, category: Category, message: &str) {
        let pid = self.process_id;
        let cat = category.to_string();
        match level {
            Level::Error => tracing::error!(process_id = pid, category = %cat, "{}", message),
            Level::Warn => tracing::warn!(process_id = pid, category = %cat, "{}", message),
            Level::Info => tracing::info!(process_id = pid, category = %cat, "{}", message),
            Level::Debug => tracing::debug!(process_id = pid, category = %cat, "{}", message),
        }
    }

    pub fn trade(&self, level: Level, message: &str) {
        self.categorized(level, Category::Trade, message);
    }

    pub fn performance(&self, level: Level, message: &str) {
        self.categorized(level, Category::Performance, message);
    }

    pub fn balance(&self, level: Level, message: &str) {
        self.categorized(level, Category::Balance, message);
    }

    pub fn rpc(&self, level: Level, message: &str) {
        self.categorized(level, Category::Rpc, message);
    }

    pub fn rotation(&self, level: Level, message: &str) {
        self.categorized(level, Category::Rotation, message);
    }

    pub fn arbitrage(&self, level: Level, message: &str) {
        self.categorized(level, Category::Arbitrage, message);
    }

    /// Installs a global `tracing-subscriber` with env-filter + JSON
    /// formatting, matching the teacher's `main.rs` init call.
    pub fn install_global_subscriber() {
        let filter = tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(false)
            .json()
            .init();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn category_display_matches_field_names() {
        assert_eq!(Category::Trade.to_string(), "trade");
        assert_eq!(Category::Rpc.to_string(), "rpc");
    }

    #[test]
    fn logger_calls_never_panic_without_subscriber() {
        let logger = Logger::new();
        logger.event(Level::Info, "hello");
        logger.trade(Level::Warn, "trade event");
        logger.arbitrage(Level::Debug, "scan tick");
    }
}

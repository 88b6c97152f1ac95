use std::env;

use amida_core::Layout;

#[derive(Debug, Clone)]
pub struct Config {
    pub port: u16,
    pub redis_url: String,
    /// Run against the in-memory store instead of redis. Used by tests and
    /// redis-less local development.
    pub memory_store: bool,
    pub rails: usize,
    pub canvas_width: f64,
    pub canvas_height: f64,
    pub flush_interval_seconds: u64,
}

impl Config {
    pub fn from_env() -> Self {
        let defaults = Layout::default();
        Self {
            port: env::var("AMIDA_PORT")
                .ok()
                .and_then(|p| p.parse().ok())
                .unwrap_or(8080),
            redis_url: env::var("REDIS_URL")
                .unwrap_or_else(|_| "redis://localhost:6379".to_string()),
            memory_store: env::var("AMIDA_MEMORY_STORE")
                .map(|value| value == "1" || value.eq_ignore_ascii_case("true"))
                .unwrap_or(false),
            rails: env::var("AMIDA_RAILS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.rails),
            canvas_width: env::var("AMIDA_CANVAS_WIDTH")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.width),
            canvas_height: env::var("AMIDA_CANVAS_HEIGHT")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.height),
            flush_interval_seconds: env::var("AMIDA_FLUSH_INTERVAL")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(30),
        }
    }

    pub fn layout(&self) -> Layout {
        Layout {
            rails: self.rails,
            width: self.canvas_width,
            height: self.canvas_height,
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        let defaults = Layout::default();
        Self {
            port: 8080,
            redis_url: "redis://localhost:6379".to_string(),
            memory_store: false,
            rails: defaults.rails,
            canvas_width: defaults.width,
            canvas_height: defaults.height,
            flush_interval_seconds: 30,
        }
    }
}

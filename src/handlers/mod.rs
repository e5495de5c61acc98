mod health;
mod metrics;
mod stats;
mod view;
mod welcome;

pub use health::health_handler;
pub use metrics::metrics_handler;
pub use stats::stats_handler;
pub use view::view_handler;
pub use welcome::welcome_handler;

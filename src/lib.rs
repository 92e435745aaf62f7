pub mod alerting;
pub mod config;
pub mod defense;
pub mod detection;
pub mod geolocation;
pub mod input;
pub mod models;
pub mod output;
pub mod pipeline;

// Re-export commonly used types
pub use alerting::{AlertDispatcher, Notifier};
pub use config::Config;
pub use defense::{DefenseController, FirewallBackend};
pub use detection::WindowTracker;
pub use geolocation::{GeoIpCache, GeoLookup};
pub use input::{FollowOptions, LineClassifier, LogFollower, TailError};
pub use models::{AlertRecord, AlertSeverity, BlockOutcome, GeoInfo, LoginFailureEvent};
pub use pipeline::EventDispatcher;

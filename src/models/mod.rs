pub mod event;

pub use event::{AlertRecord, AlertSeverity, BlockOutcome, GeoInfo, LoginFailureEvent};

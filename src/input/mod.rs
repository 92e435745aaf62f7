pub mod classifier;
pub mod file_tailer;

pub use classifier::LineClassifier;
pub use file_tailer::{FollowOptions, LogFollower, TailError};

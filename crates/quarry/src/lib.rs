pub use quarry_filesystem as file_system;
pub use quarry_filesystem::WatchEvent;
pub use quarry_filesystem::WatchEvents;
pub use quarry_filesystem::WatcherOptions;
pub use request_tracker::*;
pub use worker_farm::*;

pub mod request_tracker;
mod worker_farm;

pub mod test_utils;

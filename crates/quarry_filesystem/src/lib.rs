mod file_system;
mod in_memory_file_system;
mod os_file_system;
mod watcher;

pub use self::file_system::*;
pub use self::in_memory_file_system::*;
pub use self::os_file_system::*;
pub use self::watcher::*;

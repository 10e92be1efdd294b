mod cache;
mod fs_cache;
mod in_memory;

pub use self::cache::*;
pub use self::fs_cache::*;
pub use self::in_memory::*;

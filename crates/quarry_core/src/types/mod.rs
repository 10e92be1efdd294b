pub use self::invalidation::*;
pub use self::quarry_options::*;

mod invalidation;
mod quarry_options;

//! Live card cache fed by the document store

pub mod card_cache;

pub use card_cache::{CacheState, CardCache};

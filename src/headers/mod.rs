pub mod case;
pub mod map;
pub mod values;

pub use map::HeaderMap;

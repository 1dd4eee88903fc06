pub mod listener;
pub mod stream;
pub mod sys;
pub mod transport;

pub use stream::Stream;

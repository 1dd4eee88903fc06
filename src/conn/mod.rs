pub mod info;
pub mod manager;
pub mod stream;

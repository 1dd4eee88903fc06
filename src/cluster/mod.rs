pub mod info;
pub mod lb;
pub mod manager;
pub mod resource;

/// which resource budget a request draws from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ResourcePriority {
    #[default]
    Default,
    High,
}

//! Command implementations

pub mod dispatch;
pub mod export;
pub mod favorites;
pub mod filter;
pub mod history;
pub mod layers;
pub mod session;
pub mod values;

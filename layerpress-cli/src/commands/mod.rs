pub mod export;
pub mod inspect;
pub mod list;
pub mod remove;

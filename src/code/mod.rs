pub mod arena;
pub mod cache;
pub mod patcher;
pub(crate) mod ptrauth;

// src/core/mod.rs
pub mod buffer;
pub mod debounce;
pub mod entity;
pub mod models;
pub mod providers;
pub mod publish;
pub mod session;
pub mod watcher;

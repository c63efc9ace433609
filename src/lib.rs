//! Client-side resource cache and mutation coordinator for a
//! business-management dashboard.

pub mod api;
pub mod cache;
pub mod config;
pub mod logging;
pub mod query;
pub mod resources;

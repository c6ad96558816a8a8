pub mod api;
pub mod document;
pub mod events;
pub mod models;
pub mod query;

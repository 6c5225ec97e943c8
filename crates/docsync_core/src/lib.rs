pub mod config;
pub mod extract;
pub mod github;
pub mod import;
pub mod manifest;
pub mod markdown;
pub mod pipeline;
pub mod present;
pub mod refresh;
pub mod render;
pub mod runtime;
pub mod store;

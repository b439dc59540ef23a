pub mod accounts;
pub mod app;
pub mod auth;
pub mod credentials;
pub mod error;
pub mod forwarder;
pub mod gateway;
pub mod handlers;
pub mod mappings;
pub mod pool;
pub mod quota;
pub mod refresh;
pub mod settings;
pub mod tokens;
pub mod upstream;
pub mod usage;
pub mod user_handlers;

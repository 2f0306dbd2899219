pub mod auth;
pub mod bot;
pub mod conf;
pub mod data;
pub mod dispatch;
pub mod docs;
pub mod lookup;
pub mod sanitize;
pub mod server;
pub mod tracing;
pub mod types;
pub mod upi;

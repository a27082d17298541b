pub mod chat_stream;
pub mod client;
pub mod config;
pub mod frame;
pub mod message;
pub mod notice;
pub mod reconciler;
pub mod regenerate;
pub mod session;
pub mod store;

pub mod app;
pub mod artifacts;
pub mod cancel;
pub mod client;
pub mod config;
pub mod dispatch;
pub mod mailbox;
pub mod record;
pub mod remote;
pub mod runtime;
pub mod runwork;
pub mod server;
pub mod shared;
pub mod stream;
pub mod txlog;
pub mod wire;

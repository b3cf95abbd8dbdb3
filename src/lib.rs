pub mod ai;
pub mod app;
pub mod client;
pub mod prompting;
pub mod realtime;
pub mod store;
pub mod types;

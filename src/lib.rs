pub mod client;
pub mod clock;
pub mod config;
pub mod durability;
pub mod export;
pub mod protocol;
pub mod server;
pub mod store;
pub mod sweeper;

pub mod auth;
pub mod config;
pub mod cursor;
pub mod distributor;
pub mod events;
pub mod executor;
pub mod follower;
pub mod logging;
pub mod processor;
pub mod runtime;
pub mod store;
pub mod system;
pub mod wire;

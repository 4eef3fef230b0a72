pub mod codec;
pub mod connection;
pub mod engine;
pub mod ice;
pub mod state;
pub mod stats;
pub mod types;

pub mod catch_up;
pub mod chain_tree;
pub mod engine;
pub mod finality;
pub mod messages;
pub mod service;
pub mod signer;
pub mod tally;
pub mod telemetry;
pub mod types;
pub mod utils;

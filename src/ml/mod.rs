pub mod config;
pub mod data_util;
pub mod error;
pub mod functional;
pub mod network;
pub mod nn;
pub mod objective;
pub mod optimisers;
pub mod representation;
pub mod transfer;
pub mod transformers;
pub mod types;
pub mod util;

pub mod checkpoints;
pub mod config;
pub mod generate;
pub mod pull;

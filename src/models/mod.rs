pub mod config;
pub mod filter;
pub mod packet;
pub mod rule;
pub mod stats;

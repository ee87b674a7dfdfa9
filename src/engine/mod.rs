pub mod export;
pub mod facade;
pub mod filter;
pub mod hex;
pub mod intercept;
pub mod matcher;
pub mod persist;
pub mod replace;
pub mod store;

#[cfg(test)]
pub(crate) mod fixtures;

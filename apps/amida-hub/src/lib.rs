pub mod cli;
pub mod config;
pub mod handlers;
pub mod hub;
pub mod storage;

#[cfg(test)]
mod tests;

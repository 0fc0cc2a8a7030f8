pub mod cli;
pub mod config;
pub mod delivery;
pub mod health;
pub mod manager;
pub mod model;
pub mod queue;
pub mod source;

#[cfg(test)]
mod test_support;

#![forbid(unsafe_code)]

pub mod connection;
pub mod dispatcher;
pub mod health;
pub mod listener;
pub mod participants;
pub mod presence;
pub mod registry;
pub mod relay;
pub mod state;
pub mod store;

#[cfg(test)]
mod test_support;

#[cfg(test)]
mod registry_tests;

#[cfg(test)]
mod presence_tests;

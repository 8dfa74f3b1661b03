#[macro_use]
extern crate tracing;

pub mod backend;
pub mod cli;
pub mod image;
pub mod output;
pub mod shutdown;
pub mod surface;
pub mod takeover;
pub mod utils;

#[cfg(test)]
mod tests;

//! # Pickle Protocol
//!
//! The pack and unpack engines together with the process-wide tables they
//! consult.
//!
//! ## Components
//! - **Pack / Unpack**: value graph encoder and stack-machine decoder
//! - **Registry**: extension codes standing in for `(module, name)` pairs
//! - **Gate**: allow-list of globals the decoder may resolve
//! - **Compat**: protocol 2 module-name mapping

pub mod compat;
pub mod gate;
pub mod pack;
pub mod registry;
pub mod unpack;

#[cfg(test)]
mod tests;

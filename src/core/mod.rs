//! # Core Codec Components
//!
//! Low-level wire primitives, the memo table and stream framing.
//!
//! ## Components
//! - **Opcode**: msgpack type bytes and the pickle extension typecodes
//! - **Primitive**: scalar and header writers, the [`primitive::Source`] reader
//! - **Memo**: identity table shared by the pack and unpack engines
//! - **Codec**: Tokio codec for framing values over byte streams
//!
//! ## Wire Format
//! ```text
//! [d4 00 <version>] <one expression>
//! ```
//!
//! ## Security
//! - Declared lengths are checked against the available input before allocating
//! - Preallocation from declared container sizes is capped

pub mod codec;
pub mod memo;
pub mod opcode;
pub mod primitive;

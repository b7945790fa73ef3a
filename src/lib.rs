//! # pickle-codec
//!
//! Secure, reference-preserving object pickling over a msgpack-framed wire
//! format, byte-compatible with the legacy writer at protocols 2 through 5.
//!
//! ## Quick Start
//! ```rust
//! use pickle_codec::Value;
//!
//! let shared = Value::list(vec![Value::from(1), Value::from("text")]);
//! let value = Value::tuple(vec![shared.clone(), shared]);
//!
//! let bytes = pickle_codec::dumps(&value).unwrap();
//! let back = pickle_codec::loads(&bytes).unwrap();
//!
//! let items = back.as_tuple().unwrap().borrow();
//! assert!(items[0].ptr_eq(&items[1]));
//! ```
//!
//! ## Security
//! Decoding only resolves named globals the host allowed on the
//! [`SecurityGate`]. Everything else fails with [`PickleError::Security`].
//! [`loads_with`] and [`Unpickler::insecure`] switch the gate off for
//! trusted input.
//!
//! ## Modules
//! - [`value`]: the in-memory value model
//! - [`core`]: wire primitives, memo table and the Tokio codec
//! - [`protocol`]: pack/unpack engines, extension registry, security gate
//! - [`pickler`]: [`Pickler`] and [`Unpickler`]
//! - [`config`]: configuration loading and validation
//! - [`utils`]: logging and metrics

pub mod config;
pub mod core;
pub mod error;
pub mod pickler;
pub mod protocol;
pub mod utils;
pub mod value;

use bytes::Bytes;
use std::io::{Read, Write};

pub use crate::core::codec::PickleCodec;
pub use crate::error::{PickleError, Result, UnpicklingError};
pub use crate::pickler::{Pickler, Unpickler};
pub use crate::protocol::gate::{SecurityGate, TypeHandle};
pub use crate::protocol::pack::PackStats;
pub use crate::protocol::registry::ExtensionRegistry;
pub use crate::protocol::unpack::UnpackStats;
pub use crate::value::{
    Construction, Dict, Global, Object, Reduce, Reduction, Set, State, Value,
};

/// Encode with the default protocol and reference tracking.
pub fn dumps(value: &Value) -> Result<Bytes> {
    Pickler::new().dumps(value)
}

pub fn dumps_with(value: &Value, protocol: u8, track_references: bool) -> Result<Bytes> {
    Pickler::new()
        .with_protocol(protocol)
        .with_references(track_references)
        .dumps(value)
}

pub fn dump<W: Write>(value: &Value, writer: &mut W) -> Result<()> {
    Pickler::new().dump(value, writer)
}

/// Decode one value with the security gate enforced.
pub fn loads(data: &[u8]) -> Result<Value> {
    Unpickler::new().loads(data)
}

pub fn loads_with(data: &[u8], secure: bool) -> Result<Value> {
    if secure {
        Unpickler::new().loads(data)
    } else {
        Unpickler::insecure().loads(data)
    }
}

/// Read one value from `reader` with the security gate enforced.
pub fn load<R: Read>(reader: &mut R) -> Result<Value> {
    Unpickler::new().load(reader)
}

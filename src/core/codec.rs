//! # Stream Codec
//!
//! Tokio codec that frames a byte stream as a sequence of pickled values.
//!
//! The wire format carries no length prefix: a value ends where its root
//! expression ends. The decoder therefore runs the unpack engine over the
//! buffered bytes and treats `EndOfInput` as "wait for more data". Partial
//! buffers are capped by `max_frame_size`.
//!
//! [`Value`] is single-threaded, so framed streams built on this codec are
//! driven from one task (a current-thread runtime or a `LocalSet`).

use bytes::{Buf, BytesMut};
use std::sync::Arc;
use tokio_util::codec::{Decoder, Encoder};
use tracing::{debug, trace};

use crate::config::{PicklerConfig, UnpicklerConfig};
use crate::core::primitive::SliceSource;
use crate::error::{constants, PickleError, Result};
use crate::protocol::gate::SecurityGate;
use crate::protocol::registry::ExtensionRegistry;
use crate::protocol::{pack, unpack};
use crate::utils::metrics::global_metrics;
use crate::value::Value;

/// Frames pickled values over a byte stream.
#[derive(Debug, Clone)]
pub struct PickleCodec {
    pickler: PicklerConfig,
    unpickler: UnpicklerConfig,
    registry: Arc<ExtensionRegistry>,
    gate: Arc<SecurityGate>,
}

impl PickleCodec {
    /// Codec with default configuration over the process-wide registry and
    /// security gate.
    pub fn new() -> Self {
        Self::with_config(PicklerConfig::default(), UnpicklerConfig::default())
    }

    pub fn with_config(pickler: PicklerConfig, unpickler: UnpicklerConfig) -> Self {
        Self {
            pickler,
            unpickler,
            registry: ExtensionRegistry::global(),
            gate: SecurityGate::global(),
        }
    }

    /// Use a private extension registry.
    pub fn with_extensions(mut self, registry: Arc<ExtensionRegistry>) -> Self {
        self.registry = registry;
        self
    }

    /// Use a private security gate.
    pub fn with_gate(mut self, gate: Arc<SecurityGate>) -> Self {
        self.gate = gate;
        self
    }

    pub fn pickler_config(&self) -> &PicklerConfig {
        &self.pickler
    }

    pub fn unpickler_config(&self) -> &UnpicklerConfig {
        &self.unpickler
    }
}

impl Default for PickleCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl Decoder for PickleCodec {
    type Item = Value;
    type Error = PickleError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>> {
        if src.is_empty() {
            return Ok(None);
        }

        let mut source = SliceSource::new(&src[..]);
        match unpack::decode(&mut source, &self.unpickler, &self.registry, &self.gate) {
            Ok((value, stats)) => {
                src.advance(stats.bytes_consumed as usize);
                global_metrics().value_unpacked(stats.bytes_consumed);
                trace!(bytes = stats.bytes_consumed, "Decoded framed value");
                Ok(Some(value))
            }
            Err(PickleError::EndOfInput { needed }) => {
                if src.len().saturating_add(needed) > self.unpickler.max_frame_size {
                    debug!(
                        buffered = src.len(),
                        needed,
                        limit = self.unpickler.max_frame_size,
                        "Rejecting oversized frame"
                    );
                    let err = PickleError::malformed(constants::ERR_FRAME_TOO_LARGE);
                    global_metrics().unpickling_error(&err);
                    return Err(err);
                }
                src.reserve(needed);
                Ok(None)
            }
            Err(e) => {
                global_metrics().unpickling_error(&e);
                Err(e)
            }
        }
    }
}

impl Encoder<Value> for PickleCodec {
    type Error = PickleError;

    fn encode(&mut self, item: Value, dst: &mut BytesMut) -> Result<()> {
        let (bytes, stats) = pack::encode(&item, &self.pickler, &self.registry).inspect_err(|_| {
            global_metrics().pickling_error();
        })?;
        dst.reserve(bytes.len());
        dst.extend_from_slice(&bytes);
        global_metrics().value_packed(stats.bytes_written);
        Ok(())
    }
}

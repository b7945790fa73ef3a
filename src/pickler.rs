//! # Pickler and Unpickler
//!
//! Host-facing entry points. Each call runs with its own memo scope, so one
//! instance can encode or decode any number of independent values.
//!
//! ## Example
//! ```rust
//! use pickle_codec::{Dict, Pickler, Unpickler, Value};
//!
//! let mut dict = Dict::new();
//! dict.insert_str("answer", Value::from(42));
//! let value = Value::dict(dict);
//!
//! let pickler = Pickler::new();
//! let bytes = pickler.dumps(&value).unwrap();
//!
//! let unpickler = Unpickler::new();
//! assert_eq!(unpickler.loads(&bytes).unwrap(), value);
//! assert_eq!(
//!     pickler.last_stats().memo_count,
//!     unpickler.last_stats().memo_count
//! );
//! ```

use bytes::Bytes;
use std::cell::Cell;
use std::io::{Read, Write};
use std::sync::Arc;
use tracing::debug;

use crate::config::{PicklerConfig, UnpicklerConfig};
use crate::core::primitive::{ReaderSource, SliceSource, Source};
use crate::error::Result;
use crate::protocol::gate::SecurityGate;
use crate::protocol::pack::{self, PackStats};
use crate::protocol::registry::ExtensionRegistry;
use crate::protocol::unpack::{self, UnpackStats};
use crate::utils::metrics::{global_metrics, Timer};
use crate::value::Value;

/// Encodes values to the wire format.
#[derive(Debug)]
pub struct Pickler {
    config: PicklerConfig,
    registry: Arc<ExtensionRegistry>,
    last: Cell<PackStats>,
}

impl Pickler {
    /// Pickler with the default protocol and reference tracking enabled,
    /// using the process-wide extension registry.
    pub fn new() -> Self {
        Self::with_config(PicklerConfig::default())
    }

    pub fn with_config(config: PicklerConfig) -> Self {
        Self {
            config,
            registry: ExtensionRegistry::global(),
            last: Cell::new(PackStats::default()),
        }
    }

    /// Protocol written into every value. Checked when packing.
    pub fn with_protocol(mut self, protocol: u8) -> Self {
        self.config.protocol = protocol;
        self
    }

    /// Disable to write shared values repeatedly instead of as references.
    /// Cyclic values then fail with a depth error.
    pub fn with_references(mut self, track_references: bool) -> Self {
        self.config.track_references = track_references;
        self
    }

    pub fn with_extensions(mut self, registry: Arc<ExtensionRegistry>) -> Self {
        self.registry = registry;
        self
    }

    pub fn config(&self) -> &PicklerConfig {
        &self.config
    }

    /// Encode `value` into a new buffer.
    pub fn dumps(&self, value: &Value) -> Result<Bytes> {
        let _timer = Timer::start("dumps");
        match pack::encode(value, &self.config, &self.registry) {
            Ok((bytes, stats)) => {
                self.finish(stats);
                Ok(bytes)
            }
            Err(e) => {
                global_metrics().pickling_error();
                Err(e)
            }
        }
    }

    /// Encode `value` into `writer`.
    pub fn dump<W: Write>(&self, value: &Value, writer: &mut W) -> Result<()> {
        let _timer = Timer::start("dump");
        match pack::encode_to(value, &self.config, &self.registry, writer) {
            Ok(stats) => {
                self.finish(stats);
                Ok(())
            }
            Err(e) => {
                global_metrics().pickling_error();
                Err(e)
            }
        }
    }

    /// Statistics of the last successful call.
    pub fn last_stats(&self) -> PackStats {
        self.last.get()
    }

    fn finish(&self, stats: PackStats) {
        debug!(
            protocol = self.config.protocol,
            bytes = stats.bytes_written,
            memo_count = stats.memo_count,
            chunks = stats.chunks,
            "Pickled value"
        );
        global_metrics().value_packed(stats.bytes_written);
        self.last.set(stats);
    }
}

impl Default for Pickler {
    fn default() -> Self {
        Self::new()
    }
}

/// Decodes values from the wire format.
#[derive(Debug)]
pub struct Unpickler {
    config: UnpicklerConfig,
    registry: Arc<ExtensionRegistry>,
    gate: Arc<SecurityGate>,
    last: Cell<UnpackStats>,
}

impl Unpickler {
    /// Secure unpickler over the process-wide registry and gate.
    pub fn new() -> Self {
        Self::with_config(UnpicklerConfig::default())
    }

    /// Unpickler that resolves any named global without consulting the
    /// gate. Only for trusted input.
    pub fn insecure() -> Self {
        Self::with_config(UnpicklerConfig {
            secure: false,
            ..UnpicklerConfig::default()
        })
    }

    pub fn with_config(config: UnpicklerConfig) -> Self {
        let last = Cell::new(UnpackStats {
            protocol: config.default_protocol,
            ..UnpackStats::default()
        });
        Self {
            config,
            registry: ExtensionRegistry::global(),
            gate: SecurityGate::global(),
            last,
        }
    }

    pub fn with_gate(mut self, gate: Arc<SecurityGate>) -> Self {
        self.gate = gate;
        self
    }

    pub fn with_extensions(mut self, registry: Arc<ExtensionRegistry>) -> Self {
        self.registry = registry;
        self
    }

    pub fn config(&self) -> &UnpicklerConfig {
        &self.config
    }

    /// Decode one value from the front of `data`. Trailing bytes are
    /// ignored.
    pub fn loads(&self, data: &[u8]) -> Result<Value> {
        let _timer = Timer::start("loads");
        self.load_from(&mut SliceSource::new(data))
    }

    /// Read exactly one value from `reader`. Repeated calls read successive
    /// values.
    pub fn load<R: Read>(&self, reader: &mut R) -> Result<Value> {
        let _timer = Timer::start("load");
        self.load_from(&mut ReaderSource::new(reader))
    }

    /// Decode one value from any [`Source`].
    pub fn load_from<S: Source + ?Sized>(&self, source: &mut S) -> Result<Value> {
        match unpack::decode(source, &self.config, &self.registry, &self.gate) {
            Ok((value, stats)) => {
                debug!(
                    protocol = stats.protocol,
                    bytes = stats.bytes_consumed,
                    memo_count = stats.memo_count,
                    "Unpickled value"
                );
                global_metrics().value_unpacked(stats.bytes_consumed);
                self.last.set(stats);
                Ok(value)
            }
            Err(e) => {
                debug!(error = %e, "Unpickling failed");
                global_metrics().unpickling_error(&e);
                Err(e)
            }
        }
    }

    /// Statistics of the last successful call.
    pub fn last_stats(&self) -> UnpackStats {
        self.last.get()
    }

    /// Protocol declared by the last successfully decoded value.
    pub fn last_protocol(&self) -> u8 {
        self.last.get().protocol
    }
}

impl Default for Unpickler {
    fn default() -> Self {
        Self::new()
    }
}

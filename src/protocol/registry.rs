//! # Extension Registry
//!
//! Maps `(module, name)` pairs to compact integer codes so frequently
//! pickled globals do not carry their names on the wire.
//!
//! Registration happens at host setup time; the codec only reads. Both
//! directions are kept in one lock so a lookup never sees half of a
//! registration.

use once_cell::sync::Lazy;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use tracing::debug;

use crate::error::{constants, PickleError, Result};

/// Highest code accepted by [`ExtensionRegistry::register`].
pub const MAX_EXTENSION_CODE: u32 = 0x7FFF_FFFF;

type Name = (Arc<str>, Arc<str>);

#[derive(Debug, Default)]
struct Tables {
    by_name: HashMap<Name, u32>,
    by_code: HashMap<u32, Name>,
}

/// Bidirectional `(module, name) <-> code` table.
#[derive(Debug, Default)]
pub struct ExtensionRegistry {
    tables: RwLock<Tables>,
}

static GLOBAL_REGISTRY: Lazy<Arc<ExtensionRegistry>> =
    Lazy::new(|| Arc::new(ExtensionRegistry::new()));

impl ExtensionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Process-wide registry used by picklers that were not given one.
    pub fn global() -> Arc<ExtensionRegistry> {
        GLOBAL_REGISTRY.clone()
    }

    /// Register a code. Re-registering the same triple is a no-op; reusing
    /// either the name or the code for something else is rejected.
    pub fn register(&self, module: &str, name: &str, code: u32) -> Result<()> {
        if code == 0 || code > MAX_EXTENSION_CODE {
            return Err(PickleError::Registration(format!(
                "extension code {code} outside 1..={MAX_EXTENSION_CODE}"
            )));
        }

        let mut tables = self
            .tables
            .write()
            .map_err(|_| PickleError::Registration(constants::ERR_REGISTRY_WRITE_LOCK.to_string()))?;

        let key: Name = (Arc::from(module), Arc::from(name));
        if let Some(&existing) = tables.by_name.get(&key) {
            if existing == code {
                return Ok(());
            }
            return Err(PickleError::Registration(format!(
                "{module}.{name} is already registered with code {existing}"
            )));
        }
        if let Some((m, n)) = tables.by_code.get(&code) {
            return Err(PickleError::Registration(format!(
                "extension code {code} is already registered for {m}.{n}"
            )));
        }

        tables.by_name.insert(key.clone(), code);
        tables.by_code.insert(code, key);
        debug!(module, name, code, "Extension code registered");
        Ok(())
    }

    pub fn code_for(&self, module: &str, name: &str) -> Result<Option<u32>> {
        let tables = self
            .tables
            .read()
            .map_err(|_| PickleError::Registration(constants::ERR_REGISTRY_READ_LOCK.to_string()))?;
        if tables.by_name.is_empty() {
            return Ok(None);
        }
        Ok(tables
            .by_name
            .get(&(Arc::from(module), Arc::from(name)))
            .copied())
    }

    pub fn lookup(&self, code: u32) -> Result<Option<(Arc<str>, Arc<str>)>> {
        let tables = self
            .tables
            .read()
            .map_err(|_| PickleError::Registration(constants::ERR_REGISTRY_READ_LOCK.to_string()))?;
        Ok(tables.by_code.get(&code).cloned())
    }

    pub fn len(&self) -> usize {
        self.tables.read().map(|t| t.by_code.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

//! # Security Gate
//!
//! Allow-list consulted by the unpack engine before any named global is
//! returned or used as a constructor. Nothing is allowed by default.
//!
//! The host populates the gate with individual `(module, name)` pairs,
//! whole modules, or registered [`TypeHandle`]s. Type handles are checked by
//! identity: allowing one handle does not allow another handle that happens
//! to carry the same name.
//!
//! ## Example
//! ```rust
//! use pickle_codec::protocol::gate::{SecurityGate, TypeHandle};
//!
//! let gate = SecurityGate::new();
//! gate.allow("collections", "OrderedDict").unwrap();
//! let point = gate.secure_type(TypeHandle::new("geometry", "Point")).unwrap();
//!
//! assert!(gate.is_allowed("collections", "OrderedDict"));
//! assert!(gate.is_allowed_type(&point));
//! assert!(!gate.is_allowed("os", "system"));
//! ```

use once_cell::sync::Lazy;
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::{Arc, RwLock};
use tracing::{debug, warn};

use crate::error::{constants, PickleError, Result};
use crate::utils::metrics::global_metrics;
use crate::value::{Object, Value};

/// Host hook that applies a decoded state value to a freshly built object.
pub type StateSetter = dyn Fn(&mut Object, Value) -> std::result::Result<(), String> + Send + Sync;

/// A host type known to the codec by name.
pub struct TypeHandle {
    module: String,
    name: String,
    state_setter: Option<Arc<StateSetter>>,
}

impl TypeHandle {
    pub fn new(module: &str, name: &str) -> Self {
        Self {
            module: module.to_string(),
            name: name.to_string(),
            state_setter: None,
        }
    }

    /// Replace the default state application for instances of this type.
    pub fn with_state_setter<F>(mut self, setter: F) -> Self
    where
        F: Fn(&mut Object, Value) -> std::result::Result<(), String> + Send + Sync + 'static,
    {
        self.state_setter = Some(Arc::new(setter));
        self
    }

    pub fn module(&self) -> &str {
        &self.module
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state_setter(&self) -> Option<&Arc<StateSetter>> {
        self.state_setter.as_ref()
    }
}

impl fmt::Debug for TypeHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TypeHandle")
            .field("module", &self.module)
            .field("name", &self.name)
            .field("state_setter", &self.state_setter.is_some())
            .finish()
    }
}

/// Constructors the codec implements itself; they never run host code.
pub(crate) fn is_native_constructor(module: &str, name: &str) -> bool {
    module == "builtins" && matches!(name, "set" | "frozenset")
}

fn handle_key(handle: &Arc<TypeHandle>) -> usize {
    Arc::as_ptr(handle) as usize
}

#[derive(Debug, Default)]
struct GateTables {
    allowed: HashSet<(String, String)>,
    modules: HashSet<String>,
    types: HashMap<(String, String), Arc<TypeHandle>>,
    allowed_types: HashMap<usize, Arc<TypeHandle>>,
}

/// Allow-list of globals the unpickler may resolve.
#[derive(Debug, Default)]
pub struct SecurityGate {
    tables: RwLock<GateTables>,
}

static GLOBAL_GATE: Lazy<Arc<SecurityGate>> = Lazy::new(|| Arc::new(SecurityGate::new()));

impl SecurityGate {
    /// An empty gate that denies everything.
    pub fn new() -> Self {
        Self::default()
    }

    /// Process-wide gate used by unpicklers that were not given one.
    pub fn global() -> Arc<SecurityGate> {
        GLOBAL_GATE.clone()
    }

    fn write(&self) -> Result<std::sync::RwLockWriteGuard<'_, GateTables>> {
        self.tables
            .write()
            .map_err(|_| PickleError::Registration(constants::ERR_REGISTRY_WRITE_LOCK.to_string()))
    }

    fn read(&self) -> Result<std::sync::RwLockReadGuard<'_, GateTables>> {
        self.tables
            .read()
            .map_err(|_| PickleError::Registration(constants::ERR_REGISTRY_READ_LOCK.to_string()))
    }

    pub fn allow(&self, module: &str, name: &str) -> Result<()> {
        self.write()?
            .allowed
            .insert((module.to_string(), name.to_string()));
        debug!(module, name, "Global allowed");
        Ok(())
    }

    /// Allow every name in `module`.
    pub fn allow_module(&self, module: &str) -> Result<()> {
        self.write()?.modules.insert(module.to_string());
        debug!(module, "Module allowed");
        Ok(())
    }

    /// Make a host type resolvable by name without allowing it.
    pub fn register_type(&self, handle: TypeHandle) -> Result<Arc<TypeHandle>> {
        let key = (handle.module.clone(), handle.name.clone());
        let mut tables = self.write()?;
        if tables.types.contains_key(&key) {
            return Err(PickleError::Registration(format!(
                "type {}.{} is already registered",
                key.0, key.1
            )));
        }
        let handle = Arc::new(handle);
        tables.types.insert(key, handle.clone());
        Ok(handle)
    }

    pub fn allow_type(&self, handle: &Arc<TypeHandle>) -> Result<()> {
        self.write()?
            .allowed_types
            .insert(handle_key(handle), handle.clone());
        debug!(module = handle.module(), name = handle.name(), "Type allowed");
        Ok(())
    }

    /// Register and allow in one step.
    pub fn secure_type(&self, handle: TypeHandle) -> Result<Arc<TypeHandle>> {
        let handle = self.register_type(handle)?;
        self.allow_type(&handle)?;
        Ok(handle)
    }

    /// Host type registered under `(module, name)`, if any.
    pub fn resolve(&self, module: &str, name: &str) -> Result<Option<Arc<TypeHandle>>> {
        let tables = self.read()?;
        if tables.types.is_empty() {
            return Ok(None);
        }
        Ok(tables
            .types
            .get(&(module.to_string(), name.to_string()))
            .cloned())
    }

    /// True if the pair or its whole module was allowed. A poisoned gate denies.
    pub fn is_allowed(&self, module: &str, name: &str) -> bool {
        match self.tables.read() {
            Ok(tables) => {
                tables.modules.contains(module)
                    || tables
                        .allowed
                        .contains(&(module.to_string(), name.to_string()))
            }
            Err(_) => false,
        }
    }

    /// Identity check for a host type handle.
    pub fn is_allowed_type(&self, handle: &Arc<TypeHandle>) -> bool {
        match self.tables.read() {
            Ok(tables) => tables.allowed_types.contains_key(&handle_key(handle)),
            Err(_) => false,
        }
    }

    /// Enforce the gate for a resolved global.
    pub(crate) fn check(&self, module: &str, name: &str, handle: Option<&Arc<TypeHandle>>) -> Result<()> {
        let allowed = handle.is_some_and(|h| self.is_allowed_type(h)) || self.is_allowed(module, name);
        if allowed {
            return Ok(());
        }
        warn!(module, name, "Security gate denied global");
        global_metrics().security_violation();
        Err(PickleError::Security {
            module: module.to_string(),
            name: name.to_string(),
        })
    }
}

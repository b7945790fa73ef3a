//! # Value Model
//!
//! The in-memory object graph the codec packs and rebuilds.
//!
//! Containers are shared handles (`Rc<RefCell<_>>`) so a graph can alias
//! the same container from several places, or contain itself. The unpack
//! engine relies on this: it creates an empty handle, memoises it, and only
//! then fills it, so back-references inside the container resolve to the
//! handle being built.
//!
//! Equality is structural and safe on cyclic graphs; identity is available
//! through [`Value::ptr_eq`].

use bytes::Bytes;
use num_bigint::BigInt;
use num_traits::ToPrimitive;
use std::cell::RefCell;
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::rc::Rc;
use std::sync::Arc;
use thiserror::Error;

use crate::error::PickleError;
use crate::protocol::gate::TypeHandle;

/// Shared, interior-mutable handle used for every container kind.
pub type Shared<T> = Rc<RefCell<T>>;

/// Wrap a value in a fresh [`Shared`] handle.
pub fn shared<T>(value: T) -> Shared<T> {
    Rc::new(RefCell::new(value))
}

/// Tuples nested deeper than this are treated as unhashable.
const MAX_HASH_DEPTH: usize = 256;

/// A value that cannot be used as a dictionary key or set member.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("unhashable value of type {0}")]
pub struct UnhashableError(pub &'static str);

/// The universal pack/unpack unit.
#[derive(Clone)]
pub enum Value {
    None,
    Bool(bool),
    Int(i64),
    /// Integers outside the `i64` range. Use [`Value::from`] to normalise.
    BigInt(Rc<BigInt>),
    Float(f64),
    Bytes(Bytes),
    Text(Rc<str>),
    Tuple(Shared<Vec<Value>>),
    List(Shared<Vec<Value>>),
    Dict(Shared<Dict>),
    Set(Shared<Set>),
    Global(Rc<Global>),
    Object(Shared<Object>),
    Native(Rc<dyn Reduce>),
}

impl Value {
    pub fn text(s: &str) -> Self {
        Value::Text(Rc::from(s))
    }

    pub fn bytes(data: impl Into<Bytes>) -> Self {
        Value::Bytes(data.into())
    }

    pub fn tuple(items: Vec<Value>) -> Self {
        Value::Tuple(shared(items))
    }

    pub fn list(items: Vec<Value>) -> Self {
        Value::List(shared(items))
    }

    pub fn dict(dict: Dict) -> Self {
        Value::Dict(shared(dict))
    }

    pub fn set(set: Set) -> Self {
        Value::Set(shared(set))
    }

    pub fn global(module: &str, name: &str) -> Self {
        Value::Global(Rc::new(Global::new(module, name)))
    }

    pub fn object(object: Object) -> Self {
        Value::Object(shared(object))
    }

    pub fn native<T: Reduce + 'static>(value: T) -> Self {
        Value::Native(Rc::new(value))
    }

    /// Short name of the value's kind, used in error messages.
    pub fn kind(&self) -> &'static str {
        match self {
            Value::None => "NoneType",
            Value::Bool(_) => "bool",
            Value::Int(_) | Value::BigInt(_) => "int",
            Value::Float(_) => "float",
            Value::Bytes(_) => "bytes",
            Value::Text(_) => "str",
            Value::Tuple(_) => "tuple",
            Value::List(_) => "list",
            Value::Dict(_) => "dict",
            Value::Set(_) => "set",
            Value::Global(_) => "global",
            Value::Object(_) => "object",
            Value::Native(_) => "native",
        }
    }

    pub fn is_none(&self) -> bool {
        matches!(self, Value::None)
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Int(v) => Some(*v),
            Value::Bool(b) => Some(i64::from(*b)),
            _ => None,
        }
    }

    pub fn as_text(&self) -> Option<&Rc<str>> {
        match self {
            Value::Text(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_global(&self) -> Option<&Rc<Global>> {
        match self {
            Value::Global(g) => Some(g),
            _ => None,
        }
    }

    pub fn as_object(&self) -> Option<&Shared<Object>> {
        match self {
            Value::Object(o) => Some(o),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&Shared<Vec<Value>>> {
        match self {
            Value::List(l) => Some(l),
            _ => None,
        }
    }

    pub fn as_tuple(&self) -> Option<&Shared<Vec<Value>>> {
        match self {
            Value::Tuple(t) => Some(t),
            _ => None,
        }
    }

    pub fn as_dict(&self) -> Option<&Shared<Dict>> {
        match self {
            Value::Dict(d) => Some(d),
            _ => None,
        }
    }

    pub fn as_set(&self) -> Option<&Shared<Set>> {
        match self {
            Value::Set(s) => Some(s),
            _ => None,
        }
    }

    /// Address of the shared allocation behind this value, if it has one.
    pub(crate) fn address(&self) -> Option<usize> {
        match self {
            Value::BigInt(rc) => Some(Rc::as_ptr(rc) as usize),
            Value::Tuple(rc) | Value::List(rc) => Some(Rc::as_ptr(rc) as usize),
            Value::Dict(rc) => Some(Rc::as_ptr(rc) as usize),
            Value::Set(rc) => Some(Rc::as_ptr(rc) as usize),
            Value::Object(rc) => Some(Rc::as_ptr(rc) as usize),
            Value::Native(rc) => Some(Rc::as_ptr(rc) as *const u8 as usize),
            _ => None,
        }
    }

    /// Identity comparison: true when both values are the same shared object.
    pub fn ptr_eq(&self, other: &Value) -> bool {
        match (self.address(), other.address()) {
            (Some(a), Some(b)) => a == b,
            _ => false,
        }
    }

    /// Key used to hash this value inside a [`Dict`] or [`Set`].
    pub fn hash_key(&self) -> Result<HashKey, UnhashableError> {
        self.hash_key_at(0)
    }

    fn hash_key_at(&self, depth: usize) -> Result<HashKey, UnhashableError> {
        if depth > MAX_HASH_DEPTH {
            return Err(UnhashableError("tuple"));
        }
        Ok(match self {
            Value::None => HashKey::None,
            Value::Bool(b) => HashKey::Bool(*b),
            Value::Int(v) => HashKey::Int(*v),
            Value::BigInt(v) => HashKey::BigInt((**v).clone()),
            Value::Float(f) => HashKey::Float(if *f == 0.0 { 0 } else { f.to_bits() }),
            Value::Bytes(b) => HashKey::Bytes(b.clone()),
            Value::Text(s) => HashKey::Text(s.clone()),
            Value::Tuple(t) => {
                // A tuple still being filled by its own key cannot be hashed.
                let items = t.try_borrow().map_err(|_| UnhashableError("tuple"))?;
                let keys = items
                    .iter()
                    .map(|v| v.hash_key_at(depth + 1))
                    .collect::<Result<Vec<_>, _>>()?;
                HashKey::Tuple(keys)
            }
            Value::Global(g) => HashKey::Global(g.module.clone(), g.name.clone()),
            Value::Object(_) | Value::Native(_) => {
                HashKey::Identity(self.address().unwrap_or_default())
            }
            Value::List(_) | Value::Dict(_) | Value::Set(_) => {
                return Err(UnhashableError(self.kind()))
            }
        })
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Bool(v)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Int(v)
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Value::Int(i64::from(v))
    }
}

impl From<u32> for Value {
    fn from(v: u32) -> Self {
        Value::Int(i64::from(v))
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Float(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::text(v)
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::Text(Rc::from(v))
    }
}

impl From<BigInt> for Value {
    /// Normalises to [`Value::Int`] whenever the integer fits in `i64`.
    fn from(v: BigInt) -> Self {
        match v.to_i64() {
            Some(small) => Value::Int(small),
            None => Value::BigInt(Rc::new(v)),
        }
    }
}

impl From<u64> for Value {
    fn from(v: u64) -> Self {
        Value::from(BigInt::from(v))
    }
}

impl From<Dict> for Value {
    fn from(v: Dict) -> Self {
        Value::dict(v)
    }
}

impl From<Object> for Value {
    fn from(v: Object) -> Self {
        Value::object(v)
    }
}

/// Hashable projection of a [`Value`].
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum HashKey {
    None,
    Bool(bool),
    Int(i64),
    BigInt(BigInt),
    Float(u64),
    Bytes(Bytes),
    Text(Rc<str>),
    Tuple(Vec<HashKey>),
    Global(Rc<str>, Rc<str>),
    Identity(usize),
}

/// Insertion-ordered mapping of [`Value`] keys to values.
#[derive(Clone, Default)]
pub struct Dict {
    entries: Vec<(Value, Value)>,
    index: HashMap<HashKey, usize>,
}

impl Dict {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            entries: Vec::with_capacity(capacity),
            index: HashMap::with_capacity(capacity),
        }
    }

    /// Insert or replace an entry, returning the previous value.
    pub fn insert(&mut self, key: Value, value: Value) -> Result<Option<Value>, UnhashableError> {
        let hash = key.hash_key()?;
        Ok(self.insert_hashed(hash, key, value))
    }

    /// Insert an entry with a text key.
    pub fn insert_str(&mut self, key: &str, value: Value) -> Option<Value> {
        let key: Rc<str> = Rc::from(key);
        self.insert_hashed(HashKey::Text(key.clone()), Value::Text(key), value)
    }

    fn insert_hashed(&mut self, hash: HashKey, key: Value, value: Value) -> Option<Value> {
        match self.index.get(&hash) {
            Some(&pos) => Some(std::mem::replace(&mut self.entries[pos].1, value)),
            None => {
                self.index.insert(hash, self.entries.len());
                self.entries.push((key, value));
                None
            }
        }
    }

    pub fn get(&self, key: &Value) -> Option<&Value> {
        let hash = key.hash_key().ok()?;
        self.index.get(&hash).map(|&pos| &self.entries[pos].1)
    }

    pub fn get_str(&self, key: &str) -> Option<&Value> {
        self.index
            .get(&HashKey::Text(Rc::from(key)))
            .map(|&pos| &self.entries[pos].1)
    }

    pub fn contains_key(&self, key: &Value) -> bool {
        self.get(key).is_some()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &(Value, Value)> {
        self.entries.iter()
    }

    pub fn keys(&self) -> impl Iterator<Item = &Value> {
        self.entries.iter().map(|(k, _)| k)
    }

    pub(crate) fn entries(&self) -> &[(Value, Value)] {
        &self.entries
    }

    /// Insert every entry of `other`, in its insertion order.
    pub fn merge(&mut self, other: &Dict) {
        for (key, value) in &other.entries {
            // keys of a built dict always hash
            if let Ok(hash) = key.hash_key() {
                self.insert_hashed(hash, key.clone(), value.clone());
            }
        }
    }

    pub fn from_pairs<I>(pairs: I) -> Result<Self, UnhashableError>
    where
        I: IntoIterator<Item = (Value, Value)>,
    {
        let mut dict = Dict::new();
        for (k, v) in pairs {
            dict.insert(k, v)?;
        }
        Ok(dict)
    }
}

/// Unordered collection of hashable values.
#[derive(Clone, Default)]
pub struct Set {
    members: Vec<Value>,
    index: HashMap<HashKey, usize>,
}

impl Set {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a member; returns false if an equal member was already present.
    pub fn insert(&mut self, value: Value) -> Result<bool, UnhashableError> {
        let hash = value.hash_key()?;
        if self.index.contains_key(&hash) {
            return Ok(false);
        }
        self.index.insert(hash, self.members.len());
        self.members.push(value);
        Ok(true)
    }

    pub fn contains(&self, value: &Value) -> bool {
        value
            .hash_key()
            .map(|hash| self.index.contains_key(&hash))
            .unwrap_or(false)
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Value> {
        self.members.iter()
    }

    pub(crate) fn members(&self) -> &[Value] {
        &self.members
    }

    pub fn from_values<I>(values: I) -> Result<Self, UnhashableError>
    where
        I: IntoIterator<Item = Value>,
    {
        let mut set = Set::new();
        for v in values {
            set.insert(v)?;
        }
        Ok(set)
    }
}

/// A named reference to a type or callable.
///
/// Equality is by `module` and `name`; the attached [`TypeHandle`] records
/// what the name resolved to during unpickling.
#[derive(Clone)]
pub struct Global {
    module: Rc<str>,
    name: Rc<str>,
    handle: Option<Arc<TypeHandle>>,
}

impl Global {
    pub fn new(module: &str, name: &str) -> Self {
        Self {
            module: Rc::from(module),
            name: Rc::from(name),
            handle: None,
        }
    }

    pub(crate) fn from_parts(module: Rc<str>, name: Rc<str>, handle: Option<Arc<TypeHandle>>) -> Self {
        Self {
            module,
            name,
            handle,
        }
    }

    /// Reference a registered host type by its handle.
    pub fn for_type(handle: &Arc<TypeHandle>) -> Self {
        Self {
            module: Rc::from(handle.module()),
            name: Rc::from(handle.name()),
            handle: Some(handle.clone()),
        }
    }

    pub fn module(&self) -> &str {
        &self.module
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn module_rc(&self) -> &Rc<str> {
        &self.module
    }

    pub(crate) fn name_rc(&self) -> &Rc<str> {
        &self.name
    }

    pub fn handle(&self) -> Option<&Arc<TypeHandle>> {
        self.handle.as_ref()
    }

    pub fn qualified(&self) -> String {
        format!("{}.{}", self.module, self.name)
    }
}

impl PartialEq for Global {
    fn eq(&self, other: &Self) -> bool {
        self.module == other.module && self.name == other.name
    }
}

impl Eq for Global {}

impl fmt::Debug for Global {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.module, self.name)
    }
}

/// How a composite is constructed before state is applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Construction {
    /// `class(*args)`
    Call,
    /// `class.__new__(class, *args)`, no initialiser
    #[default]
    New,
}

/// State attached to a composite, as declared by the stream.
#[derive(Clone)]
pub enum State {
    /// Attribute mapping merged into the object's dict.
    Flat(Dict),
    /// Optional attribute mapping plus named slot values.
    Slots { dict: Option<Dict>, slots: Dict },
    /// Anything else; handed to the type's state setter or kept verbatim.
    Custom(Value),
}

/// Borrowed form of [`State`] used while packing.
#[derive(Clone, Copy)]
pub(crate) enum StateRef<'a> {
    Flat(&'a Dict),
    Slots {
        dict: Option<&'a Dict>,
        slots: &'a Dict,
    },
    Custom(&'a Value),
}

impl State {
    /// Classify a decoded state value. `None` means "no state".
    pub fn from_value(value: &Value) -> Option<State> {
        match value {
            Value::None => None,
            Value::Dict(d) => Some(State::Flat(d.borrow().clone())),
            Value::Tuple(t) => {
                let items = t.borrow();
                if let [first, Value::Dict(slots)] = items.as_slice() {
                    let dict = match first {
                        Value::None => Some(None),
                        Value::Dict(d) => Some(Some(d.borrow().clone())),
                        _ => None,
                    };
                    if let Some(dict) = dict {
                        return Some(State::Slots {
                            dict,
                            slots: slots.borrow().clone(),
                        });
                    }
                }
                Some(State::Custom(value.clone()))
            }
            other => Some(State::Custom(other.clone())),
        }
    }

    pub(crate) fn as_state_ref(&self) -> StateRef<'_> {
        match self {
            State::Flat(d) => StateRef::Flat(d),
            State::Slots { dict, slots } => StateRef::Slots {
                dict: dict.as_ref(),
                slots,
            },
            State::Custom(v) => StateRef::Custom(v),
        }
    }
}

/// Generic composite value: a class, its constructor arguments, and the
/// state, item stream and pair stream applied after construction.
#[derive(Clone)]
pub struct Object {
    pub class: Rc<Global>,
    pub construction: Construction,
    pub args: Vec<Value>,
    pub dict: Dict,
    pub slots: Dict,
    pub custom_state: Option<Value>,
    pub items: Vec<Value>,
    pub pairs: Vec<(Value, Value)>,
}

impl Object {
    /// An instance created through `__new__` with no arguments.
    pub fn new(class: Rc<Global>) -> Self {
        Self {
            class,
            construction: Construction::New,
            args: Vec::new(),
            dict: Dict::new(),
            slots: Dict::new(),
            custom_state: None,
            items: Vec::new(),
            pairs: Vec::new(),
        }
    }

    /// An instance created by calling `class(*args)`.
    pub fn call(class: Rc<Global>, args: Vec<Value>) -> Self {
        Self {
            construction: Construction::Call,
            args,
            ..Self::new(class)
        }
    }

    pub fn with_args(mut self, args: Vec<Value>) -> Self {
        self.args = args;
        self
    }

    pub fn set_attr(&mut self, name: &str, value: Value) -> Option<Value> {
        self.dict.insert_str(name, value)
    }

    pub fn attr(&self, name: &str) -> Option<&Value> {
        self.dict.get_str(name)
    }

    pub fn set_slot(&mut self, name: &str, value: Value) -> Option<Value> {
        self.slots.insert_str(name, value)
    }

    pub fn slot(&self, name: &str) -> Option<&Value> {
        self.slots.get_str(name)
    }

    pub fn push_item(&mut self, item: Value) {
        self.items.push(item);
    }

    pub fn push_pair(&mut self, key: Value, value: Value) {
        self.pairs.push((key, value));
    }

    /// State as it is written to the wire, `None` when there is nothing to apply.
    ///
    /// Custom state is the whole state of an object, so it cannot be written
    /// alongside attributes or slots.
    pub(crate) fn state_ref(&self) -> Result<Option<StateRef<'_>>, PickleError> {
        if let Some(custom) = &self.custom_state {
            if !self.dict.is_empty() || !self.slots.is_empty() {
                return Err(PickleError::Pickling(format!(
                    "{} has custom state as well as attributes or slots",
                    self.class.qualified()
                )));
            }
            return Ok(Some(StateRef::Custom(custom)));
        }
        if !self.slots.is_empty() {
            return Ok(Some(StateRef::Slots {
                dict: (!self.dict.is_empty()).then_some(&self.dict),
                slots: &self.slots,
            }));
        }
        Ok((!self.dict.is_empty()).then_some(StateRef::Flat(&self.dict)))
    }

    /// Default state application: attribute entries first, then slots by name.
    pub fn apply_state(&mut self, state: State) {
        match state {
            State::Flat(dict) => self.dict.merge(&dict),
            State::Slots { dict, slots } => {
                if let Some(dict) = dict {
                    self.dict.merge(&dict);
                }
                self.slots.merge(&slots);
            }
            State::Custom(value) => self.custom_state = Some(value),
        }
    }
}

/// Host values that describe how to rebuild themselves.
///
/// Returning `None` from [`Reduce::reduce`] marks the value as unpicklable
/// (open iterators, generators, live handles).
pub trait Reduce {
    fn type_name(&self) -> &str;
    fn reduce(&self) -> Option<Reduction>;
}

/// Constructor, arguments, state and streams sufficient to rebuild a value.
#[derive(Clone)]
pub struct Reduction {
    pub class: Rc<Global>,
    pub construction: Construction,
    pub args: Vec<Value>,
    pub state: Option<State>,
    pub items: Vec<Value>,
    pub pairs: Vec<(Value, Value)>,
}

impl Reduction {
    pub fn call(class: Rc<Global>, args: Vec<Value>) -> Self {
        Self {
            class,
            construction: Construction::Call,
            args,
            state: None,
            items: Vec::new(),
            pairs: Vec::new(),
        }
    }

    pub fn new_object(class: Rc<Global>, args: Vec<Value>) -> Self {
        Self {
            construction: Construction::New,
            ..Self::call(class, args)
        }
    }

    pub fn with_state(mut self, state: State) -> Self {
        self.state = Some(state);
        self
    }

    pub fn with_items(mut self, items: Vec<Value>) -> Self {
        self.items = items;
        self
    }

    pub fn with_pairs(mut self, pairs: Vec<(Value, Value)>) -> Self {
        self.pairs = pairs;
        self
    }
}

// ---------------------------------------------------------------------------
// Structural equality, safe on cycles: a pair of nodes met again while it is
// already being compared is assumed equal.
// ---------------------------------------------------------------------------

type Seen = HashSet<(usize, usize)>;

fn enter<T>(a: &Rc<T>, b: &Rc<T>, seen: &mut Seen) -> bool {
    seen.insert((Rc::as_ptr(a) as *const u8 as usize, Rc::as_ptr(b) as *const u8 as usize))
}

fn eq_slices(a: &[Value], b: &[Value], seen: &mut Seen) -> bool {
    a.len() == b.len() && a.iter().zip(b).all(|(x, y)| eq_values(x, y, seen))
}

fn eq_pairs(a: &[(Value, Value)], b: &[(Value, Value)], seen: &mut Seen) -> bool {
    a.len() == b.len()
        && a
            .iter()
            .zip(b)
            .all(|((ka, va), (kb, vb))| eq_values(ka, kb, seen) && eq_values(va, vb, seen))
}

fn eq_dicts(a: &Dict, b: &Dict, seen: &mut Seen) -> bool {
    a.len() == b.len()
        && a.index.iter().all(|(hash, &pos)| match b.index.get(hash) {
            Some(&other) => eq_values(&a.entries[pos].1, &b.entries[other].1, seen),
            None => false,
        })
}

fn eq_sets(a: &Set, b: &Set) -> bool {
    a.len() == b.len() && a.index.keys().all(|k| b.index.contains_key(k))
}

fn eq_objects(a: &Object, b: &Object, seen: &mut Seen) -> bool {
    a.class == b.class
        && a.construction == b.construction
        && eq_slices(&a.args, &b.args, seen)
        && eq_dicts(&a.dict, &b.dict, seen)
        && eq_dicts(&a.slots, &b.slots, seen)
        && match (&a.custom_state, &b.custom_state) {
            (None, None) => true,
            (Some(x), Some(y)) => eq_values(x, y, seen),
            _ => false,
        }
        && eq_slices(&a.items, &b.items, seen)
        && eq_pairs(&a.pairs, &b.pairs, seen)
}

fn eq_values(a: &Value, b: &Value, seen: &mut Seen) -> bool {
    match (a, b) {
        (Value::None, Value::None) => true,
        (Value::Bool(x), Value::Bool(y)) => x == y,
        (Value::Int(x), Value::Int(y)) => x == y,
        (Value::BigInt(x), Value::BigInt(y)) => x == y,
        (Value::Float(x), Value::Float(y)) => x == y,
        (Value::Bytes(x), Value::Bytes(y)) => x == y,
        (Value::Text(x), Value::Text(y)) => x == y,
        (Value::Tuple(x), Value::Tuple(y)) | (Value::List(x), Value::List(y)) => {
            Rc::ptr_eq(x, y) || !enter(x, y, seen) || eq_slices(&x.borrow(), &y.borrow(), seen)
        }
        (Value::Dict(x), Value::Dict(y)) => {
            Rc::ptr_eq(x, y) || !enter(x, y, seen) || eq_dicts(&x.borrow(), &y.borrow(), seen)
        }
        (Value::Set(x), Value::Set(y)) => Rc::ptr_eq(x, y) || eq_sets(&x.borrow(), &y.borrow()),
        (Value::Global(x), Value::Global(y)) => x == y,
        (Value::Object(x), Value::Object(y)) => {
            Rc::ptr_eq(x, y) || !enter(x, y, seen) || eq_objects(&x.borrow(), &y.borrow(), seen)
        }
        (Value::Native(_), Value::Native(_)) => a.ptr_eq(b),
        _ => false,
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        eq_values(self, other, &mut HashSet::new())
    }
}

impl PartialEq for Dict {
    fn eq(&self, other: &Self) -> bool {
        eq_dicts(self, other, &mut HashSet::new())
    }
}

impl PartialEq for Set {
    fn eq(&self, other: &Self) -> bool {
        eq_sets(self, other)
    }
}

impl PartialEq for Object {
    fn eq(&self, other: &Self) -> bool {
        eq_objects(self, other, &mut HashSet::new())
    }
}

// ---------------------------------------------------------------------------
// Debug output, safe on cycles: containers already on the current path are
// printed as an ellipsis.
// ---------------------------------------------------------------------------

fn fmt_seq(
    f: &mut fmt::Formatter<'_>,
    items: &[Value],
    open: &str,
    close: &str,
    path: &mut Vec<usize>,
) -> fmt::Result {
    f.write_str(open)?;
    for (i, item) in items.iter().enumerate() {
        if i > 0 {
            f.write_str(", ")?;
        }
        fmt_value(item, f, path)?;
    }
    if open == "(" && items.len() == 1 {
        f.write_str(",")?;
    }
    f.write_str(close)
}

fn fmt_dict(f: &mut fmt::Formatter<'_>, dict: &Dict, path: &mut Vec<usize>) -> fmt::Result {
    f.write_str("{")?;
    for (i, (k, v)) in dict.iter().enumerate() {
        if i > 0 {
            f.write_str(", ")?;
        }
        fmt_value(k, f, path)?;
        f.write_str(": ")?;
        fmt_value(v, f, path)?;
    }
    f.write_str("}")
}

fn fmt_value(value: &Value, f: &mut fmt::Formatter<'_>, path: &mut Vec<usize>) -> fmt::Result {
    if let Some(addr) = value.address() {
        if path.contains(&addr) {
            return f.write_str("...");
        }
        path.push(addr);
    }
    let result = match value {
        Value::None => f.write_str("None"),
        Value::Bool(true) => f.write_str("True"),
        Value::Bool(false) => f.write_str("False"),
        Value::Int(v) => write!(f, "{v}"),
        Value::BigInt(v) => write!(f, "{v}"),
        Value::Float(v) => write!(f, "{v:?}"),
        Value::Bytes(b) => write!(f, "b{b:?}"),
        Value::Text(s) => write!(f, "{s:?}"),
        Value::Tuple(t) => fmt_seq(f, &t.borrow(), "(", ")", path),
        Value::List(l) => fmt_seq(f, &l.borrow(), "[", "]", path),
        Value::Dict(d) => fmt_dict(f, &d.borrow(), path),
        Value::Set(s) => {
            let members: Vec<Value> = s.borrow().iter().cloned().collect();
            fmt_seq(f, &members, "{", "}", path)
        }
        Value::Global(g) => write!(f, "{g:?}"),
        Value::Object(o) => {
            let o = o.borrow();
            write!(f, "<{:?} ", o.class)?;
            fmt_seq(f, &o.args, "(", ")", path)?;
            if !o.dict.is_empty() {
                f.write_str(" ")?;
                fmt_dict(f, &o.dict, path)?;
            }
            if !o.slots.is_empty() {
                f.write_str(" slots=")?;
                fmt_dict(f, &o.slots, path)?;
            }
            if let Some(state) = &o.custom_state {
                f.write_str(" state=")?;
                fmt_value(state, f, path)?;
            }
            if !o.items.is_empty() {
                f.write_str(" items=")?;
                fmt_seq(f, &o.items, "[", "]", path)?;
            }
            if !o.pairs.is_empty() {
                f.write_str(" pairs=[")?;
                for (i, (k, v)) in o.pairs.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    fmt_value(k, f, path)?;
                    f.write_str(": ")?;
                    fmt_value(v, f, path)?;
                }
                f.write_str("]")?;
            }
            f.write_str(">")
        }
        Value::Native(n) => write!(f, "<native {}>", n.type_name()),
    };
    if value.address().is_some() {
        path.pop();
    }
    result
}

impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt_value(self, f, &mut Vec::new())
    }
}

impl fmt::Debug for Dict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt_dict(f, self, &mut Vec::new())
    }
}

impl fmt::Debug for Set {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt_seq(f, &self.members, "{", "}", &mut Vec::new())
    }
}

impl fmt::Debug for Object {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt_value(&Value::object(self.clone()), f, &mut Vec::new())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bigint_normalises_to_int() {
        assert!(matches!(Value::from(BigInt::from(42)), Value::Int(42)));
        let big = BigInt::from(i64::MAX) + 1;
        assert!(matches!(Value::from(big), Value::BigInt(_)));
    }

    #[test]
    fn test_dict_replaces_existing_key() {
        let mut d = Dict::new();
        assert!(d.insert(Value::from(1), Value::from("a")).unwrap().is_none());
        let old = d.insert(Value::from(1), Value::from("b")).unwrap();
        assert_eq!(old, Some(Value::from("a")));
        assert_eq!(d.len(), 1);
        assert_eq!(d.get(&Value::from(1)), Some(&Value::from("b")));
    }

    #[test]
    fn test_list_key_is_unhashable() {
        let mut d = Dict::new();
        let err = d.insert(Value::list(vec![]), Value::None).unwrap_err();
        assert_eq!(err, UnhashableError("list"));
    }

    #[test]
    fn test_tuple_key_hashes_by_members() {
        let mut d = Dict::new();
        d.insert(Value::tuple(vec![1.into(), "x".into()]), Value::from(true))
            .unwrap();
        let probe = Value::tuple(vec![1.into(), "x".into()]);
        assert_eq!(d.get(&probe), Some(&Value::Bool(true)));
    }

    #[test]
    fn test_dict_equality_ignores_order() {
        let a = Dict::from_pairs([(1.into(), "a".into()), (2.into(), "b".into())]).unwrap();
        let b = Dict::from_pairs([(2.into(), "b".into()), (1.into(), "a".into())]).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_cyclic_equality_terminates() {
        let a = shared(Vec::new());
        a.borrow_mut().push(Value::List(a.clone()));
        let b = shared(Vec::new());
        b.borrow_mut().push(Value::List(b.clone()));
        assert_eq!(Value::List(a), Value::List(b));
    }

    #[test]
    fn test_cyclic_debug_terminates() {
        let a = shared(Vec::new());
        a.borrow_mut().push(Value::List(a.clone()));
        assert_eq!(format!("{:?}", Value::List(a)), "[...]");
    }

    #[test]
    fn test_state_classification() {
        let mut slots = Dict::new();
        slots.insert_str("value", Value::from(3));
        let slot_state = Value::tuple(vec![Value::None, Value::dict(slots)]);
        assert!(matches!(
            State::from_value(&slot_state),
            Some(State::Slots { dict: None, .. })
        ));

        let custom = Value::tuple(vec![Value::from(4), Value::bytes(&b"raw"[..])]);
        assert!(matches!(State::from_value(&custom), Some(State::Custom(_))));
        assert!(State::from_value(&Value::None).is_none());
    }

    #[test]
    fn test_object_state_layout() {
        let mut obj = Object::new(Rc::new(Global::new("app", "Neg")));
        assert!(matches!(obj.state_ref(), Ok(None)));
        obj.set_attr("a", 1.into());
        assert!(matches!(obj.state_ref(), Ok(Some(StateRef::Flat(_)))));
        obj.set_slot("b", 2.into());
        assert!(matches!(
            obj.state_ref(),
            Ok(Some(StateRef::Slots { dict: Some(_), .. }))
        ));

        let mut custom = Object::new(Rc::new(Global::new("app", "Neg")));
        custom.custom_state = Some(Value::from(7));
        assert!(matches!(custom.state_ref(), Ok(Some(StateRef::Custom(_)))));
    }

    #[test]
    fn test_custom_state_with_attributes_is_rejected() {
        let mut obj = Object::new(Rc::new(Global::new("app", "Neg")));
        obj.custom_state = Some(Value::from(7));
        obj.set_attr("a", 1.into());
        assert!(matches!(obj.state_ref(), Err(PickleError::Pickling(_))));

        let mut slotted = Object::new(Rc::new(Global::new("app", "Neg")));
        slotted.custom_state = Some(Value::from(7));
        slotted.set_slot("b", 2.into());
        assert!(matches!(slotted.state_ref(), Err(PickleError::Pickling(_))));
    }

    #[test]
    fn test_merge_keeps_insertion_order() {
        let mut base = Dict::new();
        base.insert_str("z", 0.into());
        let mut other = Dict::new();
        other.insert_str("b", 1.into());
        other.insert_str("z", 2.into());
        other.insert_str("a", 3.into());

        base.merge(&other);
        let keys: Vec<&Value> = base.keys().collect();
        assert_eq!(keys, vec![&Value::from("z"), &Value::from("b"), &Value::from("a")]);
        assert_eq!(base.get_str("z"), Some(&Value::from(2)));
    }
}

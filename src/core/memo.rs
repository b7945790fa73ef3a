//! # Memo Tables
//!
//! Both sides number memoised objects identically: index 1 is the first
//! memoising instruction in the stream, index 0 is never used. The pack side
//! maps object identity to index; the unpack side is a slot table that can
//! hold a reserved placeholder while an object is under construction.
//!
//! Both tables also record the nesting depth of every finished object, so a
//! reference contributes the depth of what it names. A reference to an
//! object still open counts as depth 0.

use std::collections::HashMap;
use std::rc::Rc;

use crate::error::{constants, PickleError, Result, UnpicklingError};
use crate::value::Value;

/// Text and byte spans at or below this length are never memoised.
pub const MIN_SIZE_FOR_REF: usize = 3;

/// Text is memoised when it has more than [`MIN_SIZE_FOR_REF`] characters.
pub fn text_is_memoised(text: &str) -> bool {
    text.len() > MIN_SIZE_FOR_REF && text.chars().nth(MIN_SIZE_FOR_REF).is_some()
}

/// Byte spans are memoised when longer than [`MIN_SIZE_FOR_REF`].
pub fn bytes_are_memoised(len: usize) -> bool {
    len > MIN_SIZE_FOR_REF
}

/// Outcome of a pack-side memo lookup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lookup {
    /// Already written; emit a reference to this index.
    Seen(u32),
    /// First occurrence; the object now owns this index.
    New(u32),
}

/// Identity of a packed object: allocation address plus span length.
pub type Identity = (usize, usize);

/// Encode-side memo: identity → index.
#[derive(Debug)]
pub struct PackMemo {
    enabled: bool,
    counter: u32,
    identities: HashMap<Identity, u32>,
    texts: HashMap<Rc<str>, u32>,
    depths: Vec<usize>,
}

impl PackMemo {
    /// `enabled = false` still numbers objects but never reports a hit.
    pub fn new(enabled: bool) -> Self {
        Self {
            enabled,
            counter: 0,
            identities: HashMap::new(),
            texts: HashMap::new(),
            depths: Vec::new(),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Number of indices assigned so far.
    pub fn count(&self) -> u32 {
        self.counter
    }

    fn next(&mut self) -> Result<u32> {
        self.counter = self
            .counter
            .checked_add(1)
            .ok_or_else(|| PickleError::Pickling(constants::ERR_MEMO_OVERFLOW.into()))?;
        self.depths.push(0);
        Ok(self.counter)
    }

    /// Record the nesting depth of a finished object.
    pub fn settle(&mut self, index: u32, depth: usize) {
        if let Some(slot) = (index as usize)
            .checked_sub(1)
            .and_then(|pos| self.depths.get_mut(pos))
        {
            *slot = depth;
        }
    }

    /// Depth recorded for `index`; 0 while the object is still open.
    pub fn depth(&self, index: u32) -> usize {
        (index as usize)
            .checked_sub(1)
            .and_then(|pos| self.depths.get(pos))
            .copied()
            .unwrap_or(0)
    }

    /// Assign an index to a container the encoder synthesised itself.
    pub fn bump(&mut self) -> Result<u32> {
        self.next()
    }

    /// Look up a shared object, assigning it the next index if unseen.
    ///
    /// A uniquely owned object cannot be reached twice, so it is numbered
    /// without being recorded.
    pub fn lookup_or_assign(&mut self, identity: Identity, uniquely_owned: bool) -> Result<Lookup> {
        let track = self.enabled && !uniquely_owned;
        if track {
            if let Some(&index) = self.identities.get(&identity) {
                return Ok(Lookup::Seen(index));
            }
        }
        let index = self.next()?;
        if track {
            self.identities.insert(identity, index);
        }
        Ok(Lookup::New(index))
    }

    /// Text is deduplicated by value.
    pub fn lookup_or_assign_text(&mut self, text: &Rc<str>) -> Result<Lookup> {
        if self.enabled {
            if let Some(&index) = self.texts.get(text) {
                return Ok(Lookup::Seen(index));
            }
        }
        let index = self.next()?;
        if self.enabled {
            self.texts.insert(text.clone(), index);
        }
        Ok(Lookup::New(index))
    }
}

#[derive(Debug)]
enum Slot {
    Reserved,
    Filled { value: Value, depth: usize },
}

/// Decode-side memo: index → value.
#[derive(Debug, Default)]
pub struct UnpackMemo {
    slots: Vec<Slot>,
}

impl UnpackMemo {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    fn next_index(&self) -> Result<u32> {
        u32::try_from(self.slots.len() + 1)
            .map_err(|_| PickleError::malformed(constants::ERR_MEMO_OVERFLOW))
    }

    /// Placeholder for an object still under construction.
    pub fn reserve(&mut self) -> Result<u32> {
        let index = self.next_index()?;
        self.slots.push(Slot::Reserved);
        Ok(index)
    }

    pub fn fill(&mut self, index: u32, value: Value) {
        if let Some(slot) = (index as usize)
            .checked_sub(1)
            .and_then(|pos| self.slots.get_mut(pos))
        {
            *slot = Slot::Filled { value, depth: 0 };
        }
    }

    pub fn push(&mut self, value: Value) -> Result<u32> {
        let index = self.next_index()?;
        self.slots.push(Slot::Filled { value, depth: 0 });
        Ok(index)
    }

    /// Record the nesting depth of a finished object.
    pub fn settle(&mut self, index: u32, depth: usize) {
        if let Some(Slot::Filled { depth: slot, .. }) = (index as usize)
            .checked_sub(1)
            .and_then(|pos| self.slots.get_mut(pos))
        {
            *slot = depth;
        }
    }

    /// The value at `index` and its recorded nesting depth.
    pub fn get(&self, index: u32) -> Result<(Value, usize)> {
        let slot = (index as usize)
            .checked_sub(1)
            .and_then(|pos| self.slots.get(pos))
            .ok_or(UnpicklingError::DanglingReference(index))?;
        match slot {
            Slot::Filled { value, depth } => Ok((value.clone(), *depth)),
            Slot::Reserved => Err(UnpicklingError::ForwardReference(index).into()),
        }
    }
}

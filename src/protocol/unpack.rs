//! # Unpack Engine
//!
//! Rebuilds a [`Value`] graph from the wire format with an explicit frame
//! stack instead of native recursion, so hostile nesting is bounded by
//! `max_depth` rather than by the call stack.
//!
//! Every finished container records its nesting depth in the memo: one more
//! than its deepest member, where a reference counts as the depth of what it
//! names. A value deeper than `max_depth` is rejected however it was built,
//! so chains of back-references cannot produce a graph whose drop or
//! comparison exhausts the stack.
//!
//! ## States
//! ```text
//! Start -> [VERSION] -> Dispatch* -> Stop (root expression complete)
//!                          \-> Error (memo and frames dropped)
//! ```
//!
//! Containers are created empty and memoised when opened, then filled as
//! their members complete. Composites reserve their memo slot before the
//! constructor is read and fill it once the object exists, so references
//! from state, items or pairs resolve to the object under construction.

use num_bigint::BigInt;
use std::rc::Rc;
use tracing::{debug, trace};

use crate::config::{UnpicklerConfig, HIGHEST_PROTOCOL, LOWEST_PROTOCOL};
use crate::core::memo::{self, UnpackMemo};
use crate::core::opcode::{self, ChunkKind, ExtType};
use crate::core::primitive::{self, Source};
use crate::error::{constants, PickleError, Result, UnpicklingError};
use crate::protocol::compat;
use crate::protocol::gate::{is_native_constructor, SecurityGate};
use crate::protocol::registry::ExtensionRegistry;
use crate::value::{shared, Construction, Dict, Global, Object, Set, Shared, State, Value};

/// Per-call unpack statistics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UnpackStats {
    /// Memo slots used
    pub memo_count: u32,
    /// Protocol the value declared (or the configured default)
    pub protocol: u8,
    /// Bytes consumed from the source
    pub bytes_consumed: u64,
}

/// Decode exactly one value from `source`.
pub fn decode<S: Source + ?Sized>(
    source: &mut S,
    config: &UnpicklerConfig,
    registry: &ExtensionRegistry,
    gate: &SecurityGate,
) -> Result<(Value, UnpackStats)> {
    let start = source.consumed();
    let mut unpacker = Unpacker {
        source,
        config,
        registry,
        gate,
        memo: UnpackMemo::new(),
        frames: Vec::new(),
        protocol: config.default_protocol,
    };
    let value = unpacker.run()?;
    let stats = UnpackStats {
        memo_count: unpacker.memo.len() as u32,
        protocol: unpacker.protocol,
        bytes_consumed: (unpacker.source.consumed() - start) as u64,
    };
    Ok((value, stats))
}

/// Result of reading one instruction.
enum Step {
    /// A finished value and its nesting depth
    Value(Value, usize),
    Opened,
    End,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Stage {
    Callable,
    Args,
    State,
    Items,
    Pairs,
}

enum Built {
    Object(Shared<Object>),
    Set(Shared<Set>),
}

struct ObjectFrame {
    slot: u32,
    depth: usize,
    construction: Construction,
    stage: Stage,
    callable: Option<Rc<Global>>,
    built: Option<(Value, Built)>,
    key: Option<Value>,
}

enum Target {
    Seq(Shared<Vec<Value>>),
    Dict(Shared<Dict>),
}

enum Frame {
    Seq {
        items: Shared<Vec<Value>>,
        value: Value,
        slot: u32,
        depth: usize,
        remaining: usize,
    },
    Dict {
        dict: Shared<Dict>,
        value: Value,
        slot: u32,
        depth: usize,
        remaining: usize,
        key: Option<Value>,
    },
    Chunked {
        target: Target,
        value: Value,
        slot: u32,
        depth: usize,
        remaining: usize,
        key: Option<Value>,
    },
    Global {
        module: Option<Rc<str>>,
    },
    Object(Box<ObjectFrame>),
}

struct Unpacker<'a, S: Source + ?Sized> {
    source: &'a mut S,
    config: &'a UnpicklerConfig,
    registry: &'a ExtensionRegistry,
    gate: &'a SecurityGate,
    memo: UnpackMemo,
    frames: Vec<Frame>,
    protocol: u8,
}

fn insert_entry(dict: &Shared<Dict>, key: Value, value: Value) -> Result<()> {
    dict.borrow_mut()
        .insert(key, value)
        .map_err(|_| PickleError::malformed(constants::ERR_UNHASHABLE_KEY))?;
    Ok(())
}

fn insert_member(set: &Shared<Set>, value: Value) -> Result<()> {
    set.borrow_mut()
        .insert(value)
        .map_err(|_| PickleError::malformed(constants::ERR_UNHASHABLE_MEMBER))?;
    Ok(())
}

impl<'a, S: Source + ?Sized> Unpacker<'a, S> {
    fn run(&mut self) -> Result<Value> {
        let mut first = true;
        loop {
            let step = if self.awaiting_chunk_header() {
                self.read_chunk_header()?
            } else {
                self.read_instruction(first)?
            };
            first = false;

            let completed = match step {
                Step::Value(value, depth) => self.deliver(value, depth)?,
                Step::Opened => None,
                Step::End => match self.close()? {
                    Some((value, depth)) => self.deliver(value, depth)?,
                    None => None,
                },
            };
            if let Some(root) = completed {
                return Ok(root);
            }
        }
    }

    // -----------------------------------------------------------------------
    // Instruction decoding
    // -----------------------------------------------------------------------

    fn read_instruction(&mut self, first: bool) -> Result<Step> {
        let byte = self.source.read_u8()?;
        let value = match byte {
            0x00..=0x7f => Value::Int(i64::from(byte)),
            0xe0..=0xff => Value::Int(i64::from(byte as i8)),
            0x80..=0x8f => return self.open_dict(usize::from(byte & 0x0f)),
            0x90..=0x9f => return self.open_tuple(usize::from(byte & 0x0f)),
            0xa0..=0xbf => self.read_text(usize::from(byte & 0x1f))?,
            opcode::NIL => Value::None,
            opcode::FALSE => Value::Bool(false),
            opcode::TRUE => Value::Bool(true),
            opcode::REF => {
                let index = self.source.read_u32()?;
                let (value, depth) = self.memo.get(index)?;
                return Ok(Step::Value(value, depth));
            }
            opcode::BIN8 => {
                let len = usize::from(self.source.read_u8()?);
                self.read_text(len)?
            }
            opcode::BIN16 => {
                let len = usize::from(self.source.read_u16()?);
                self.read_text(len)?
            }
            opcode::BIN32 => {
                let len = self.source.read_u32()? as usize;
                self.read_text(len)?
            }
            opcode::EXT8 => {
                let size = usize::from(self.source.read_u8()?);
                return self.read_ext(size, first);
            }
            opcode::EXT16 => {
                let size = usize::from(self.source.read_u16()?);
                return self.read_ext(size, first);
            }
            opcode::EXT32 => {
                let size = self.source.read_u32()? as usize;
                return self.read_ext(size, first);
            }
            opcode::FLOAT32 => {
                let bits = self.source.read_u32()?;
                Value::Float(f64::from(f32::from_bits(bits)))
            }
            opcode::FLOAT64 => Value::Float(f64::from_bits(self.source.read_u64()?)),
            opcode::UINT8 => Value::Int(i64::from(self.source.read_u8()?)),
            opcode::UINT16 => Value::Int(i64::from(self.source.read_u16()?)),
            opcode::UINT32 => Value::Int(i64::from(self.source.read_u32()?)),
            opcode::UINT64 => Value::from(self.source.read_u64()?),
            opcode::INT8 => Value::Int(i64::from(self.source.read_u8()? as i8)),
            opcode::INT16 => Value::Int(i64::from(self.source.read_u16()? as i16)),
            opcode::INT32 => Value::Int(i64::from(self.source.read_u32()? as i32)),
            opcode::INT64 => Value::Int(self.source.read_u64()? as i64),
            opcode::FIXEXT1..=opcode::FIXEXT16 => {
                return self.read_ext(1 << (byte - opcode::FIXEXT1), first)
            }
            opcode::STR8 => {
                let len = usize::from(self.source.read_u8()?);
                self.read_text(len)?
            }
            opcode::STR16 => {
                let len = usize::from(self.source.read_u16()?);
                self.read_text(len)?
            }
            opcode::STR32 => {
                let len = self.source.read_u32()? as usize;
                self.read_text(len)?
            }
            opcode::ARRAY16 => {
                let len = usize::from(self.source.read_u16()?);
                return self.open_tuple(len);
            }
            opcode::ARRAY32 => {
                let len = self.source.read_u32()? as usize;
                return self.open_tuple(len);
            }
            opcode::MAP16 => {
                let len = usize::from(self.source.read_u16()?);
                return self.open_dict(len);
            }
            opcode::MAP32 => {
                let len = self.source.read_u32()? as usize;
                return self.open_dict(len);
            }
            #[allow(unreachable_patterns)]
            _ => return Err(UnpicklingError::UnknownOpcode(byte).into()),
        };
        Ok(Step::Value(value, 0))
    }

    fn read_text(&mut self, len: usize) -> Result<Value> {
        let text = primitive::decode_text(self.source.read_vec(len)?)?;
        let memoised = memo::text_is_memoised(&text);
        let value = Value::Text(text);
        if memoised {
            self.memo.push(value.clone())?;
        }
        Ok(value)
    }

    fn read_ext(&mut self, size: usize, first: bool) -> Result<Step> {
        let type_byte = self.source.read_u8()?;
        let ext = ExtType::from_byte(type_byte).ok_or(UnpicklingError::UnsupportedExtType(type_byte))?;
        if ext.is_legacy_only() {
            debug!(ext = ext.name(), type_byte, "Legacy-only instruction rejected");
            return Err(UnpicklingError::UnsupportedExtType(type_byte).into());
        }

        let value = match ext {
            ExtType::Version => {
                if !first {
                    return Err(PickleError::malformed(constants::ERR_NESTED_VERSION));
                }
                let version = self.source.read_u8()?;
                if !(LOWEST_PROTOCOL..=HIGHEST_PROTOCOL).contains(&version) {
                    return Err(PickleError::UnsupportedVersion(version));
                }
                self.protocol = version;
                return Ok(Step::Opened);
            }
            ExtType::Long => {
                let raw = self.source.read_vec(size)?;
                let value = Value::from(BigInt::from_signed_bytes_le(&raw));
                self.memo.push(value.clone())?;
                value
            }
            ExtType::List => return self.open_list(size),
            ExtType::Object => return self.open_object(Construction::Call),
            ExtType::ObjectNew => return self.open_object(Construction::New),
            ExtType::Global => {
                self.push_frame(Frame::Global { module: None })?;
                return Ok(Step::Opened);
            }
            ExtType::End => return Ok(Step::End),
            ExtType::Bytes => {
                let value = Value::bytes(self.source.read_vec(size)?);
                if memo::bytes_are_memoised(size) {
                    self.memo.push(value.clone())?;
                }
                value
            }
            ExtType::Unistr => self.read_text(size)?,
            ExtType::Extension => self.read_extension_code(size)?,
            ExtType::Chunked => return self.open_chunked(),
            _ => return Err(UnpicklingError::UnsupportedExtType(type_byte).into()),
        };
        Ok(Step::Value(value, 0))
    }

    fn read_extension_code(&mut self, size: usize) -> Result<Value> {
        let code = match size {
            1 => u32::from(self.source.read_u8()?),
            2 => u32::from(self.source.read_u16()?),
            4 => self.source.read_u32()?,
            _ => return Err(PickleError::malformed(constants::ERR_EXTENSION_WIDTH)),
        };
        let (module, name) = self
            .registry
            .lookup(code)?
            .ok_or(UnpicklingError::UnknownExtensionCode(code))?;
        self.resolve_global(&module, &name)
    }

    // -----------------------------------------------------------------------
    // Frames
    // -----------------------------------------------------------------------

    /// Containers and composites count against `max_depth`. A global's
    /// name frame is a leaf and may sit one above the limit.
    fn push_frame(&mut self, frame: Frame) -> Result<()> {
        let limit = match frame {
            Frame::Global { .. } => self.config.max_depth.saturating_add(1),
            _ => self.config.max_depth,
        };
        if self.frames.len() >= limit {
            return Err(PickleError::malformed(constants::ERR_MAX_NESTING));
        }
        self.frames.push(frame);
        Ok(())
    }

    /// Depth of a finished container whose deepest member is `deepest`.
    fn finish(&mut self, slot: u32, deepest: usize) -> Result<usize> {
        let depth = deepest + 1;
        if depth > self.config.max_depth {
            return Err(PickleError::malformed(constants::ERR_MAX_NESTING));
        }
        self.memo.settle(slot, depth);
        Ok(depth)
    }

    fn preallocation(&self, len: usize) -> usize {
        len.min(self.config.max_preallocation)
    }

    fn open_seq(&mut self, len: usize, list: bool) -> Result<Step> {
        // every member needs at least one byte
        self.source.ensure(len)?;
        let items = shared(Vec::with_capacity(self.preallocation(len)));
        let value = if list {
            Value::List(items.clone())
        } else {
            Value::Tuple(items.clone())
        };
        let slot = self.memo.push(value.clone())?;
        if len == 0 {
            let depth = self.finish(slot, 0)?;
            return Ok(Step::Value(value, depth));
        }
        self.push_frame(Frame::Seq {
            items,
            value,
            slot,
            depth: 0,
            remaining: len,
        })?;
        Ok(Step::Opened)
    }

    fn open_tuple(&mut self, len: usize) -> Result<Step> {
        self.open_seq(len, false)
    }

    fn open_list(&mut self, len: usize) -> Result<Step> {
        self.open_seq(len, true)
    }

    fn open_dict(&mut self, len: usize) -> Result<Step> {
        // every entry needs at least two bytes
        self.source.ensure(len.saturating_mul(2))?;
        let dict = shared(Dict::with_capacity(self.preallocation(len)));
        let value = Value::Dict(dict.clone());
        let slot = self.memo.push(value.clone())?;
        if len == 0 {
            let depth = self.finish(slot, 0)?;
            return Ok(Step::Value(value, depth));
        }
        self.push_frame(Frame::Dict {
            dict,
            value,
            slot,
            depth: 0,
            remaining: len,
            key: None,
        })?;
        Ok(Step::Opened)
    }

    fn open_chunked(&mut self) -> Result<Step> {
        let kind_byte = self.source.read_u8()?;
        let kind = ChunkKind::from_byte(kind_byte).ok_or_else(|| {
            PickleError::malformed(format!("unknown chunked container kind {kind_byte}"))
        })?;
        let (target, value) = match kind {
            ChunkKind::Tuple => {
                let items = shared(Vec::new());
                (Target::Seq(items.clone()), Value::Tuple(items))
            }
            ChunkKind::List => {
                let items = shared(Vec::new());
                (Target::Seq(items.clone()), Value::List(items))
            }
            ChunkKind::Dict => {
                let dict = shared(Dict::new());
                (Target::Dict(dict.clone()), Value::Dict(dict))
            }
        };
        let slot = self.memo.push(value.clone())?;
        self.push_frame(Frame::Chunked {
            target,
            value,
            slot,
            depth: 0,
            remaining: 0,
            key: None,
        })?;
        Ok(Step::Opened)
    }

    fn open_object(&mut self, construction: Construction) -> Result<Step> {
        let slot = self.memo.reserve()?;
        let stage = match construction {
            Construction::Call => Stage::Callable,
            Construction::New => Stage::Args,
        };
        self.push_frame(Frame::Object(Box::new(ObjectFrame {
            slot,
            depth: 0,
            construction,
            stage,
            callable: None,
            built: None,
            key: None,
        })))?;
        Ok(Step::Opened)
    }

    fn awaiting_chunk_header(&self) -> bool {
        matches!(
            self.frames.last(),
            Some(Frame::Chunked {
                remaining: 0,
                key: None,
                ..
            })
        )
    }

    /// Between chunks only a chunk header of the right kind or `END` may follow.
    fn read_chunk_header(&mut self) -> Result<Step> {
        let is_dict = matches!(
            self.frames.last(),
            Some(Frame::Chunked {
                target: Target::Dict(_),
                ..
            })
        );
        let byte = self.source.read_u8()?;
        let len = match (byte, is_dict) {
            (0x90..=0x9f, false) => usize::from(byte & 0x0f),
            (opcode::ARRAY16, false) | (opcode::MAP16, true) => usize::from(self.source.read_u16()?),
            (opcode::ARRAY32, false) | (opcode::MAP32, true) => self.source.read_u32()? as usize,
            (0x80..=0x8f, true) => usize::from(byte & 0x0f),
            (opcode::EXT8, _) => {
                self.source.read_u8()?;
                return self.chunk_end();
            }
            (opcode::EXT16, _) => {
                self.source.read_u16()?;
                return self.chunk_end();
            }
            (opcode::EXT32, _) => {
                self.source.read_u32()?;
                return self.chunk_end();
            }
            (opcode::FIXEXT1..=opcode::FIXEXT16, _) => return self.chunk_end(),
            _ => return Err(PickleError::malformed(constants::ERR_CHUNK_HEADER)),
        };
        self.source
            .ensure(if is_dict { len.saturating_mul(2) } else { len })?;
        trace!(len, is_dict, "Chunk header read");
        if let Some(Frame::Chunked { remaining, .. }) = self.frames.last_mut() {
            *remaining = len;
        }
        Ok(Step::Opened)
    }

    fn chunk_end(&mut self) -> Result<Step> {
        match self.source.read_u8()? {
            9 => Ok(Step::End),
            _ => Err(PickleError::malformed(constants::ERR_CHUNK_HEADER)),
        }
    }

    /// Handle `END` for the innermost frame.
    fn close(&mut self) -> Result<Option<(Value, usize)>> {
        let frame = self.frames.pop().ok_or(UnpicklingError::UnmatchedEnd)?;
        match frame {
            Frame::Object(mut object) => match object.stage {
                Stage::Items => {
                    object.stage = Stage::Pairs;
                    self.frames.push(Frame::Object(object));
                    Ok(None)
                }
                Stage::Pairs if object.key.is_none() => {
                    let (slot, deepest) = (object.slot, object.depth);
                    let (value, _) = object
                        .built
                        .ok_or_else(|| PickleError::malformed("composite completed before construction"))?;
                    let depth = self.finish(slot, deepest)?;
                    Ok(Some((value, depth)))
                }
                Stage::Pairs => Err(PickleError::malformed(constants::ERR_ODD_PAIR_STREAM)),
                _ => Err(UnpicklingError::UnmatchedEnd.into()),
            },
            Frame::Chunked {
                value,
                slot,
                depth,
                remaining: 0,
                key: None,
                ..
            } => {
                let depth = self.finish(slot, depth)?;
                Ok(Some((value, depth)))
            }
            _ => Err(UnpicklingError::UnmatchedEnd.into()),
        }
    }

    /// Hand a completed value to the innermost frame, cascading completions.
    /// Returns the root once no frame is left.
    fn deliver(&mut self, mut value: Value, mut depth: usize) -> Result<Option<Value>> {
        loop {
            let Some(mut frame) = self.frames.pop() else {
                return Ok(Some(value));
            };
            match self.accept(&mut frame, value, depth)? {
                Some((done, done_depth)) => {
                    value = done;
                    depth = done_depth;
                }
                None => {
                    self.frames.push(frame);
                    return Ok(None);
                }
            }
        }
    }

    fn accept(&mut self, frame: &mut Frame, value: Value, depth: usize) -> Result<Option<(Value, usize)>> {
        match frame {
            Frame::Seq {
                items,
                value: whole,
                slot,
                depth: deepest,
                remaining,
            } => {
                items.borrow_mut().push(value);
                *deepest = (*deepest).max(depth);
                *remaining -= 1;
                if *remaining > 0 {
                    return Ok(None);
                }
                let finished = self.finish(*slot, *deepest)?;
                Ok(Some((whole.clone(), finished)))
            }
            Frame::Dict {
                dict,
                value: whole,
                slot,
                depth: deepest,
                remaining,
                key,
            } => {
                *deepest = (*deepest).max(depth);
                match key.take() {
                    None => {
                        *key = Some(value);
                        Ok(None)
                    }
                    Some(k) => {
                        insert_entry(dict, k, value)?;
                        *remaining -= 1;
                        if *remaining > 0 {
                            return Ok(None);
                        }
                        let finished = self.finish(*slot, *deepest)?;
                        Ok(Some((whole.clone(), finished)))
                    }
                }
            }
            Frame::Chunked {
                target,
                depth: deepest,
                remaining,
                key,
                ..
            } => {
                *deepest = (*deepest).max(depth);
                match target {
                    Target::Seq(items) => {
                        items.borrow_mut().push(value);
                        *remaining -= 1;
                    }
                    Target::Dict(dict) => match key.take() {
                        None => *key = Some(value),
                        Some(k) => {
                            insert_entry(dict, k, value)?;
                            *remaining -= 1;
                        }
                    },
                }
                Ok(None)
            }
            Frame::Global { module } => {
                let text = match value {
                    Value::Text(text) => text,
                    other => return Err(PickleError::unexpected("str", other.kind())),
                };
                match module.take() {
                    None => {
                        *module = Some(text);
                        Ok(None)
                    }
                    Some(module) => Ok(Some((self.resolve_global(&module, &text)?, 0))),
                }
            }
            Frame::Object(object) => {
                object.depth = object.depth.max(depth);
                self.accept_object(object, value)
            }
        }
    }

    fn accept_object(&mut self, frame: &mut ObjectFrame, value: Value) -> Result<Option<(Value, usize)>> {
        match frame.stage {
            Stage::Callable => {
                let class = match value {
                    Value::Global(g) => g,
                    other => return Err(PickleError::unexpected("global", other.kind())),
                };
                frame.callable = Some(class);
                frame.stage = Stage::Args;
            }
            Stage::Args => {
                let mut args = match &value {
                    Value::Tuple(items) => items.borrow().clone(),
                    other => return Err(PickleError::unexpected("tuple", other.kind())),
                };
                let class = match frame.construction {
                    Construction::Call => frame.callable.take(),
                    Construction::New => {
                        if args.is_empty() {
                            return Err(PickleError::unexpected("global", "empty tuple"));
                        }
                        match args.remove(0) {
                            Value::Global(g) => Some(g),
                            other => return Err(PickleError::unexpected("global", other.kind())),
                        }
                    }
                }
                .ok_or_else(|| PickleError::malformed("composite without a constructor"))?;

                let built = self.construct(class, args, frame.construction)?;
                self.memo.fill(frame.slot, built.0.clone());
                frame.built = Some(built);
                frame.stage = Stage::State;
            }
            Stage::State => {
                if let Some((_, built)) = &frame.built {
                    apply_state(built, value)?;
                }
                frame.stage = Stage::Items;
            }
            Stage::Items => match &frame.built {
                Some((_, Built::Object(object))) => object.borrow_mut().push_item(value),
                Some((_, Built::Set(set))) => insert_member(set, value)?,
                None => {}
            },
            Stage::Pairs => match frame.key.take() {
                None => frame.key = Some(value),
                Some(key) => match &frame.built {
                    Some((_, Built::Object(object))) => object.borrow_mut().push_pair(key, value),
                    _ => return Err(PickleError::unexpected("mapping composite", "set")),
                },
            },
        }
        Ok(None)
    }

    // -----------------------------------------------------------------------
    // Names and construction
    // -----------------------------------------------------------------------

    fn secure(&self) -> bool {
        self.config.secure
    }

    fn resolve_global(&self, module: &str, name: &str) -> Result<Value> {
        let (module, name) = if compat::uses_legacy_names(self.protocol) {
            compat::to_current(module, name)
        } else {
            (module.into(), name.into())
        };
        let handle = self.gate.resolve(&module, &name)?;
        if self.secure() && !is_native_constructor(&module, &name) {
            self.gate.check(&module, &name, handle.as_ref())?;
        }
        Ok(Value::Global(Rc::new(Global::from_parts(
            Rc::from(&*module),
            Rc::from(&*name),
            handle,
        ))))
    }

    fn construct(&mut self, class: Rc<Global>, args: Vec<Value>, construction: Construction) -> Result<(Value, Built)> {
        if is_native_constructor(class.module(), class.name()) {
            let set = shared(Set::new());
            match args.as_slice() {
                [] => {}
                [iterable] => {
                    let members = match iterable {
                        Value::List(items) | Value::Tuple(items) => items.borrow().clone(),
                        Value::Set(other) => other.borrow().iter().cloned().collect(),
                        other => return Err(PickleError::unexpected("iterable", other.kind())),
                    };
                    for member in members {
                        insert_member(&set, member)?;
                    }
                }
                _ => return Err(PickleError::malformed("set constructor takes at most one argument")),
            }
            return Ok((Value::Set(set.clone()), Built::Set(set)));
        }

        if self.secure() {
            self.gate.check(class.module(), class.name(), class.handle())?;
        }
        let object = match construction {
            Construction::Call => Object::call(class, args),
            Construction::New => Object::new(class).with_args(args),
        };
        let object = shared(object);
        Ok((Value::Object(object.clone()), Built::Object(object)))
    }
}

/// Apply decoded state: the type's state setter if it has one, otherwise
/// the default attribute/slot application.
fn apply_state(built: &Built, state: Value) -> Result<()> {
    if state.is_none() {
        return Ok(());
    }
    let object = match built {
        Built::Object(object) => object,
        Built::Set(_) => return Err(PickleError::unexpected("None", state.kind())),
    };

    let setter = object
        .borrow()
        .class
        .handle()
        .and_then(|h| h.state_setter().cloned());
    if let Some(setter) = setter {
        let qualified = object.borrow().class.qualified();
        return setter(&mut object.borrow_mut(), state)
            .map_err(|msg| PickleError::malformed(format!("state setter for {qualified} failed: {msg}")));
    }

    if let Some(state) = State::from_value(&state) {
        object.borrow_mut().apply_state(state);
    }
    Ok(())
}

//! # Pack Engine
//!
//! Depth-first encoder from a [`Value`] graph to the wire format.
//!
//! Work is kept on an explicit task stack rather than the call stack, so
//! packing a value as deep as `max_depth` needs no more native stack than a
//! flat one. Depth is measured the way the unpack engine measures it: a
//! container or composite is one deeper than its deepest member, including
//! the argument tuples and state dicts the encoder synthesises, and a
//! reference counts as the depth of what it names.
//!
//! Memo indices are assigned in exactly the order the unpack engine will
//! stamp objects, including containers the encoder synthesises itself
//! (constructor argument tuples, state dicts), so every emitted reference
//! names the object the decoder built for it.
//!
//! ## Composite Layout
//! ```text
//! OBJECT      <callable> <args tuple> <state> <items...> END <pairs...> END
//! OBJECT_NEW  <(class, *args) tuple>  <state> <items...> END <pairs...> END
//! ```

use bytes::{BufMut, Bytes, BytesMut};
use num_traits::ToPrimitive;
use std::io::Write;
use std::rc::Rc;
use tracing::trace;

use crate::config::{PicklerConfig, HIGHEST_PROTOCOL, LOWEST_PROTOCOL};
use crate::core::memo::{self, Lookup, PackMemo};
use crate::core::opcode::{self, ChunkKind, ExtType};
use crate::core::primitive;
use crate::error::{constants, PickleError, Result};
use crate::protocol::compat;
use crate::protocol::registry::ExtensionRegistry;
use crate::value::{Construction, Global, Reduction, StateRef, Value};

/// Per-call pack statistics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PackStats {
    /// Memo indices assigned (equals the decoder's slot count for the value)
    pub memo_count: u32,
    /// Chunks emitted for large containers
    pub chunks: u64,
    /// Bytes produced
    pub bytes_written: u64,
}

/// Encode one value into a fresh buffer.
pub fn encode(
    value: &Value,
    config: &PicklerConfig,
    registry: &ExtensionRegistry,
) -> Result<(Bytes, PackStats)> {
    let mut packer = Packer::new(config, registry, None)?;
    packer.run(value)?;
    let stats = packer.stats();
    Ok((packer.buf.freeze(), stats))
}

/// Encode one value into `writer`, flushing after chunks once the buffer
/// passes the configured threshold.
pub fn encode_to(
    value: &Value,
    config: &PicklerConfig,
    registry: &ExtensionRegistry,
    writer: &mut dyn Write,
) -> Result<PackStats> {
    let mut packer = Packer::new(config, registry, Some(writer))?;
    packer.run(value)?;
    packer.flush()?;
    Ok(packer.stats())
}

/// Deferred packing work, run last-in first-out.
enum Task {
    Value(Value),
    /// Constructor reference; never memoised
    Global(Rc<Global>),
    Nil,
    End,
    Tag(ExtType),
    ArrayHeader(usize),
    MapHeader(usize),
    ListHeader(usize),
    Chunked(ChunkKind),
    ChunkDone(ChunkKind, usize),
    /// Enter a nesting level; `None` numbers a synthesised container
    Open(Option<u32>),
    Close,
}

/// An open container or composite.
struct Level {
    index: u32,
    deepest: usize,
}

struct Packer<'a> {
    buf: BytesMut,
    memo: PackMemo,
    config: &'a PicklerConfig,
    registry: &'a ExtensionRegistry,
    sink: Option<&'a mut dyn Write>,
    flushed: u64,
    chunks: u64,
    tasks: Vec<Task>,
    levels: Vec<Level>,
    // Reductions stay alive for the whole call so their addresses are never
    // reused by a later temporary while still recorded in the memo.
    keepalive: Vec<Reduction>,
}

impl<'a> Packer<'a> {
    fn new(
        config: &'a PicklerConfig,
        registry: &'a ExtensionRegistry,
        sink: Option<&'a mut dyn Write>,
    ) -> Result<Self> {
        if !(LOWEST_PROTOCOL..=HIGHEST_PROTOCOL).contains(&config.protocol) {
            return Err(PickleError::Pickling(format!(
                "unsupported protocol {} (supported: {LOWEST_PROTOCOL}-{HIGHEST_PROTOCOL})",
                config.protocol
            )));
        }
        Ok(Self {
            buf: BytesMut::with_capacity(256),
            memo: PackMemo::new(config.track_references),
            config,
            registry,
            sink,
            flushed: 0,
            chunks: 0,
            tasks: Vec::new(),
            levels: Vec::new(),
            keepalive: Vec::new(),
        })
    }

    fn run(&mut self, value: &Value) -> Result<()> {
        primitive::write_version(&mut self.buf, self.config.protocol);
        self.tasks.push(Task::Value(value.clone()));
        while let Some(task) = self.tasks.pop() {
            self.step(task)?;
        }
        Ok(())
    }

    fn stats(&self) -> PackStats {
        PackStats {
            memo_count: self.memo.count(),
            chunks: self.chunks,
            bytes_written: self.flushed + self.buf.len() as u64,
        }
    }

    fn flush(&mut self) -> Result<()> {
        if let Some(sink) = self.sink.as_mut() {
            sink.write_all(&self.buf)?;
            self.flushed += self.buf.len() as u64;
            self.buf.clear();
        }
        Ok(())
    }

    fn chunk_done(&mut self, kind: ChunkKind, len: usize) -> Result<()> {
        self.chunks += 1;
        trace!(kind = ?kind, len, chunk = self.chunks, "Chunk emitted");
        if self.sink.is_some() && self.buf.len() >= self.config.flush_threshold {
            self.flush()?;
        }
        Ok(())
    }

    fn chunked(&self, len: usize) -> bool {
        self.config.protocol >= 5 && self.config.chunk_size > 0 && len > self.config.chunk_size
    }

    /// Queue `plan` so its first task runs next.
    fn schedule(&mut self, plan: Vec<Task>) {
        self.tasks.extend(plan.into_iter().rev());
    }

    fn step(&mut self, task: Task) -> Result<()> {
        match task {
            Task::Value(value) => self.dump_value(&value)?,
            Task::Global(global) => self.dump_global(&global)?,
            Task::Nil => self.buf.put_u8(opcode::NIL),
            Task::End => primitive::write_end(&mut self.buf),
            Task::Tag(ext) => primitive::write_tag(&mut self.buf, ext),
            Task::ArrayHeader(len) => primitive::write_array_header(&mut self.buf, len)?,
            Task::MapHeader(len) => primitive::write_map_header(&mut self.buf, len)?,
            Task::ListHeader(len) => primitive::write_ext_header(&mut self.buf, ExtType::List, len)?,
            Task::Chunked(kind) => primitive::write_chunked(&mut self.buf, kind),
            Task::ChunkDone(kind, len) => self.chunk_done(kind, len)?,
            Task::Open(index) => {
                let index = match index {
                    Some(index) => index,
                    None => self.memo.bump()?,
                };
                self.open(index)?;
            }
            Task::Close => self.close()?,
        }
        Ok(())
    }

    fn open(&mut self, index: u32) -> Result<()> {
        if self.levels.len() >= self.config.max_depth {
            return Err(PickleError::Pickling(constants::ERR_MAX_DEPTH.into()));
        }
        self.levels.push(Level { index, deepest: 0 });
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        let Some(level) = self.levels.pop() else {
            return Ok(());
        };
        let depth = level.deepest + 1;
        if depth > self.config.max_depth {
            return Err(PickleError::Pickling(constants::ERR_MAX_DEPTH.into()));
        }
        self.memo.settle(level.index, depth);
        self.report(depth);
        Ok(())
    }

    /// Account a finished member of the innermost open level.
    fn report(&mut self, depth: usize) {
        if let Some(level) = self.levels.last_mut() {
            level.deepest = level.deepest.max(depth);
        }
    }

    fn write_ref(&mut self, index: u32) {
        primitive::write_ref(&mut self.buf, index);
        let depth = self.memo.depth(index);
        self.report(depth);
    }

    /// Memoise a shared allocation. Returns `None` when a reference was
    /// written instead of the object.
    fn enter<T: ?Sized>(&mut self, rc: &Rc<T>) -> Result<Option<u32>> {
        let identity = (Rc::as_ptr(rc) as *const u8 as usize, 0);
        // one owner in the graph plus the handle held by the running task
        let uniquely_owned = Rc::strong_count(rc) <= 2;
        match self.memo.lookup_or_assign(identity, uniquely_owned)? {
            Lookup::Seen(index) => {
                self.write_ref(index);
                Ok(None)
            }
            Lookup::New(index) => Ok(Some(index)),
        }
    }

    fn dump_value(&mut self, value: &Value) -> Result<()> {
        match value {
            Value::None => self.buf.put_u8(opcode::NIL),
            Value::Bool(b) => self.buf.put_u8(if *b { opcode::TRUE } else { opcode::FALSE }),
            Value::Int(v) => primitive::write_int(&mut self.buf, *v),
            Value::Float(v) => primitive::write_float(&mut self.buf, *v),
            Value::BigInt(rc) => {
                if let Some(small) = rc.to_i64() {
                    primitive::write_int(&mut self.buf, small);
                } else if let Some(unsigned) = rc.to_u64() {
                    primitive::write_u64(&mut self.buf, unsigned);
                } else if self.enter(rc)?.is_some() {
                    primitive::write_bigint(&mut self.buf, rc)?;
                }
            }
            Value::Text(text) => self.dump_text(text)?,
            Value::Bytes(data) => {
                if memo::bytes_are_memoised(data.len()) {
                    let identity = (data.as_ptr() as usize, data.len());
                    if let Lookup::Seen(index) = self.memo.lookup_or_assign(identity, false)? {
                        self.write_ref(index);
                        return Ok(());
                    }
                }
                primitive::write_bytes(&mut self.buf, data)?;
            }
            Value::Tuple(rc) => {
                if let Some(index) = self.enter(rc)? {
                    let mut plan = vec![Task::Open(Some(index))];
                    self.plan_sequence(ChunkKind::Tuple, &rc.borrow(), &mut plan);
                    plan.push(Task::Close);
                    self.schedule(plan);
                }
            }
            Value::List(rc) => {
                if let Some(index) = self.enter(rc)? {
                    let mut plan = vec![Task::Open(Some(index))];
                    self.plan_sequence(ChunkKind::List, &rc.borrow(), &mut plan);
                    plan.push(Task::Close);
                    self.schedule(plan);
                }
            }
            Value::Dict(rc) => {
                if let Some(index) = self.enter(rc)? {
                    let mut plan = vec![Task::Open(Some(index))];
                    self.plan_mapping(rc.borrow().entries(), &mut plan);
                    plan.push(Task::Close);
                    self.schedule(plan);
                }
            }
            Value::Set(rc) => {
                if let Some(index) = self.enter(rc)? {
                    let plan = self.plan_set(index, rc.borrow().members());
                    self.schedule(plan);
                }
            }
            Value::Global(global) => self.dump_global(global)?,
            Value::Object(rc) => {
                if let Some(index) = self.enter(rc)? {
                    let plan = {
                        let object = rc.borrow();
                        self.plan_composite(
                            index,
                            &object.class,
                            object.construction,
                            &object.args,
                            object.state_ref()?,
                            &object.items,
                            &object.pairs,
                        )
                    };
                    self.schedule(plan);
                }
            }
            Value::Native(rc) => {
                if let Some(index) = self.enter(rc)? {
                    let reduction = rc.reduce().ok_or_else(|| {
                        PickleError::Pickling(format!("cannot pickle '{}' object", rc.type_name()))
                    })?;
                    let plan = self.plan_composite(
                        index,
                        &reduction.class,
                        reduction.construction,
                        &reduction.args,
                        reduction.state.as_ref().map(|s| s.as_state_ref()),
                        &reduction.items,
                        &reduction.pairs,
                    );
                    self.keepalive.push(reduction);
                    self.schedule(plan);
                }
            }
        }
        Ok(())
    }

    fn dump_text(&mut self, text: &Rc<str>) -> Result<()> {
        if memo::text_is_memoised(text) {
            if let Lookup::Seen(index) = self.memo.lookup_or_assign_text(text)? {
                self.write_ref(index);
                return Ok(());
            }
        }
        primitive::write_text(&mut self.buf, text)
    }

    fn dump_name(&mut self, name: &str) -> Result<()> {
        if memo::text_is_memoised(name) {
            self.dump_text(&Rc::from(name))
        } else {
            primitive::write_text(&mut self.buf, name)
        }
    }

    fn dump_global(&mut self, global: &Global) -> Result<()> {
        if let Some(code) = self.registry.code_for(global.module(), global.name())? {
            primitive::write_extension_code(&mut self.buf, code);
            return Ok(());
        }

        primitive::write_tag(&mut self.buf, ExtType::Global);
        if compat::uses_legacy_names(self.config.protocol) {
            let (module, name) = compat::to_legacy(global.module(), global.name());
            self.dump_name(&module)?;
            self.dump_name(&name)
        } else {
            self.dump_text(global.module_rc())?;
            self.dump_text(global.name_rc())
        }
    }

    fn plan_sequence(&self, kind: ChunkKind, items: &[Value], plan: &mut Vec<Task>) {
        if self.chunked(items.len()) {
            plan.push(Task::Chunked(kind));
            for chunk in items.chunks(self.config.chunk_size) {
                plan.push(Task::ArrayHeader(chunk.len()));
                plan.extend(chunk.iter().cloned().map(Task::Value));
                plan.push(Task::ChunkDone(kind, chunk.len()));
            }
            plan.push(Task::End);
            return;
        }

        plan.push(match kind {
            ChunkKind::List => Task::ListHeader(items.len()),
            _ => Task::ArrayHeader(items.len()),
        });
        plan.extend(items.iter().cloned().map(Task::Value));
    }

    fn plan_mapping(&self, entries: &[(Value, Value)], plan: &mut Vec<Task>) {
        let pairs = |plan: &mut Vec<Task>, entries: &[(Value, Value)]| {
            for (key, value) in entries {
                plan.push(Task::Value(key.clone()));
                plan.push(Task::Value(value.clone()));
            }
        };

        if self.chunked(entries.len()) {
            plan.push(Task::Chunked(ChunkKind::Dict));
            for chunk in entries.chunks(self.config.chunk_size) {
                plan.push(Task::MapHeader(chunk.len()));
                pairs(plan, chunk);
                plan.push(Task::ChunkDone(ChunkKind::Dict, chunk.len()));
            }
            plan.push(Task::End);
            return;
        }

        plan.push(Task::MapHeader(entries.len()));
        pairs(plan, entries);
    }

    /// `OBJECT GLOBAL(builtins, set) ([members],) None END END`
    fn plan_set(&self, index: u32, members: &[Value]) -> Vec<Task> {
        let mut plan = vec![
            Task::Open(Some(index)),
            Task::Tag(ExtType::Object),
            Task::Global(Rc::new(Global::new("builtins", "set"))),
            Task::ArrayHeader(1),
            Task::Open(None),
            Task::Open(None),
        ];
        self.plan_sequence(ChunkKind::List, members, &mut plan);
        plan.extend([
            Task::Close,
            Task::Close,
            Task::Nil,
            Task::End,
            Task::End,
            Task::Close,
        ]);
        plan
    }

    #[allow(clippy::too_many_arguments)]
    fn plan_composite(
        &self,
        index: u32,
        class: &Rc<Global>,
        construction: Construction,
        args: &[Value],
        state: Option<StateRef<'_>>,
        items: &[Value],
        pairs: &[(Value, Value)],
    ) -> Vec<Task> {
        let mut plan = vec![Task::Open(Some(index))];
        match construction {
            Construction::Call => plan.extend([
                Task::Tag(ExtType::Object),
                Task::Global(class.clone()),
                Task::ArrayHeader(args.len()),
                Task::Open(None),
            ]),
            Construction::New => plan.extend([
                Task::Tag(ExtType::ObjectNew),
                Task::ArrayHeader(args.len() + 1),
                Task::Open(None),
                Task::Global(class.clone()),
            ]),
        }
        plan.extend(args.iter().cloned().map(Task::Value));
        plan.push(Task::Close);

        match state {
            None => plan.push(Task::Nil),
            Some(StateRef::Flat(dict)) => {
                plan.push(Task::Open(None));
                self.plan_mapping(dict.entries(), &mut plan);
                plan.push(Task::Close);
            }
            Some(StateRef::Slots { dict, slots }) => {
                plan.push(Task::ArrayHeader(2));
                plan.push(Task::Open(None));
                match dict {
                    Some(dict) => {
                        plan.push(Task::Open(None));
                        self.plan_mapping(dict.entries(), &mut plan);
                        plan.push(Task::Close);
                    }
                    None => plan.push(Task::Nil),
                }
                plan.push(Task::Open(None));
                self.plan_mapping(slots.entries(), &mut plan);
                plan.push(Task::Close);
                plan.push(Task::Close);
            }
            Some(StateRef::Custom(value)) => plan.push(Task::Value(value.clone())),
        }

        plan.extend(items.iter().cloned().map(Task::Value));
        plan.push(Task::End);
        for (key, value) in pairs {
            plan.push(Task::Value(key.clone()));
            plan.push(Task::Value(value.clone()));
        }
        plan.push(Task::End);
        plan.push(Task::Close);
        plan
    }
}

//! # Opcode Tables
//!
//! Header bytes of the msgpack framing and the extension typecodes layered
//! on top of it.
//!
//! ## Wire Layout
//! ```text
//! fixint / fixstr / fixarray / fixmap       single byte, size in low bits
//! [header] [big-endian length]  [payload]   sized forms
//! [ext header] [typecode] [payload]         pickle-level instructions
//! ```

/// Reserved byte used by the legacy format as a memo reference marker.
pub const REF: u8 = 0xc1;
pub const NIL: u8 = 0xc0;
pub const FALSE: u8 = 0xc2;
pub const TRUE: u8 = 0xc3;

pub const BIN8: u8 = 0xc4;
pub const BIN16: u8 = 0xc5;
pub const BIN32: u8 = 0xc6;

pub const EXT8: u8 = 0xc7;
pub const EXT16: u8 = 0xc8;
pub const EXT32: u8 = 0xc9;

pub const FLOAT32: u8 = 0xca;
pub const FLOAT64: u8 = 0xcb;

pub const UINT8: u8 = 0xcc;
pub const UINT16: u8 = 0xcd;
pub const UINT32: u8 = 0xce;
pub const UINT64: u8 = 0xcf;
pub const INT8: u8 = 0xd0;
pub const INT16: u8 = 0xd1;
pub const INT32: u8 = 0xd2;
pub const INT64: u8 = 0xd3;

pub const FIXEXT1: u8 = 0xd4;
pub const FIXEXT2: u8 = 0xd5;
pub const FIXEXT4: u8 = 0xd6;
pub const FIXEXT8: u8 = 0xd7;
pub const FIXEXT16: u8 = 0xd8;

pub const STR8: u8 = 0xd9;
pub const STR16: u8 = 0xda;
pub const STR32: u8 = 0xdb;

pub const ARRAY16: u8 = 0xdc;
pub const ARRAY32: u8 = 0xdd;
pub const MAP16: u8 = 0xde;
pub const MAP32: u8 = 0xdf;

pub const FIXMAP: u8 = 0x80;
pub const FIXARRAY: u8 = 0x90;
pub const FIXSTR: u8 = 0xa0;

/// Extension typecodes carried after an extension header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ExtType {
    /// Protocol version marker, payload is one byte
    Version,
    /// Arbitrary precision integer, little-endian two's complement payload
    Long,
    /// List; the size field is the element count
    List,
    /// `callable(*args)` composite
    Object,
    /// `cls.__new__(cls, *args)` composite
    ObjectNew,
    /// Named global; module and name follow as two expressions
    Global,
    Singleton,
    OldStyle,
    InitArgs,
    /// Terminates an item stream, pair stream or chunk group
    End,
    /// Raw bytes; the size field is the byte length
    Bytes,
    /// UTF-8 text written by legacy writers
    Unistr,
    ObjectNewCustom,
    GlobalObject,
    FastNew,
    /// Registered extension code in place of a global
    Extension,
    /// Container split into bounded chunks
    Chunked,
}

impl ExtType {
    /// Typecode byte on the wire.
    pub fn type_byte(self) -> u8 {
        match self {
            ExtType::Version => 0,
            ExtType::Long => 1,
            ExtType::List => 2,
            ExtType::Object => 3,
            ExtType::ObjectNew => 4,
            ExtType::Global => 5,
            ExtType::Singleton => 6,
            ExtType::OldStyle => 7,
            ExtType::InitArgs => 8,
            ExtType::End => 9,
            ExtType::Bytes => 10,
            ExtType::Unistr => 11,
            ExtType::ObjectNewCustom => 12,
            ExtType::GlobalObject => 13,
            ExtType::FastNew => 14,
            ExtType::Extension => 15,
            ExtType::Chunked => 16,
        }
    }

    pub fn from_byte(byte: u8) -> Option<Self> {
        Some(match byte {
            0 => ExtType::Version,
            1 => ExtType::Long,
            2 => ExtType::List,
            3 => ExtType::Object,
            4 => ExtType::ObjectNew,
            5 => ExtType::Global,
            6 => ExtType::Singleton,
            7 => ExtType::OldStyle,
            8 => ExtType::InitArgs,
            9 => ExtType::End,
            10 => ExtType::Bytes,
            11 => ExtType::Unistr,
            12 => ExtType::ObjectNewCustom,
            13 => ExtType::GlobalObject,
            14 => ExtType::FastNew,
            15 => ExtType::Extension,
            16 => ExtType::Chunked,
            _ => return None,
        })
    }

    pub fn name(self) -> &'static str {
        match self {
            ExtType::Version => "VERSION",
            ExtType::Long => "LONG",
            ExtType::List => "LIST",
            ExtType::Object => "OBJECT",
            ExtType::ObjectNew => "OBJECT_NEW",
            ExtType::Global => "GLOBAL",
            ExtType::Singleton => "SINGLETON",
            ExtType::OldStyle => "OLD_STYLE",
            ExtType::InitArgs => "INIT_ARGS",
            ExtType::End => "END",
            ExtType::Bytes => "BYTES",
            ExtType::Unistr => "UNISTR",
            ExtType::ObjectNewCustom => "OBJECT_NEW_CUSTOM",
            ExtType::GlobalObject => "GLOBAL_OBJECT",
            ExtType::FastNew => "FAST_NEW",
            ExtType::Extension => "EXTENSION",
            ExtType::Chunked => "CHUNKED",
        }
    }

    /// Legacy instructions this codec recognises but does not implement.
    pub fn is_legacy_only(self) -> bool {
        matches!(
            self,
            ExtType::Singleton
                | ExtType::OldStyle
                | ExtType::InitArgs
                | ExtType::ObjectNewCustom
                | ExtType::GlobalObject
                | ExtType::FastNew
        )
    }
}

/// Container kind carried in the payload of a `CHUNKED` extension.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChunkKind {
    Tuple,
    List,
    Dict,
}

impl ChunkKind {
    pub fn kind_byte(self) -> u8 {
        match self {
            ChunkKind::Tuple => 0,
            ChunkKind::List => 1,
            ChunkKind::Dict => 2,
        }
    }

    pub fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            0 => Some(ChunkKind::Tuple),
            1 => Some(ChunkKind::List),
            2 => Some(ChunkKind::Dict),
            _ => None,
        }
    }
}

// test-only module included via protocol/mod.rs
#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

use num_bigint::BigInt;
use std::rc::Rc;

use crate::config::{PicklerConfig, UnpicklerConfig};
use crate::core::primitive::SliceSource;
use crate::error::{PickleError, Result, UnpicklingError};
use crate::protocol::gate::{SecurityGate, TypeHandle};
use crate::protocol::pack::{self, PackStats};
use crate::protocol::registry::ExtensionRegistry;
use crate::protocol::unpack::{self, UnpackStats};
use crate::value::{Dict, Global, Object, Reduce, Reduction, Set, Value};

/// `{1, 2}` written by the legacy writer at protocol 2.
const LEGACY_SET: &[u8] =
    b"\xd4\x00\x02\xd4\x03\xd4\x05\xab__builtin__\xa3set\x91\xd5\x02\x01\x02\xc0\xc7\x00\t\xc7\x00\t";

/// `xrange(0, 5)` written by the legacy writer at protocol 2.
const LEGACY_RANGE: &[u8] =
    b"\xd4\x00\x02\xd4\x03\xd4\x05\xab__builtin__\xa6xrange\x93\x00\x05\x01\xc0\xc7\x00\t\xc7\x00\t";

/// A `SimpleCookie` holding one `Morsel`, written by the legacy writer at
/// protocol 2.
const LEGACY_COOKIE: &[u8] = b"\xd4\x00\x02\xd4\x04\x91\xd4\x05\xa6Cookie\xc4\x0cSimpleCookie\x80\xc7\x00\t\xc4\x03key\xd4\x04\x91\xd4\x05\xc1\x00\x00\x00\x03\xc4\x06Morsel\x83\xc4\x0bcoded_value\xc4\x05value\xc4\x05value\xc4\x05value\xc4\x03key\xc4\x03key\xc7\x00\t\xc4\x07comment\xc4\x00\xc4\x06domain\xc4\x00\xc4\x06secure\xc4\x00\xc4\x07expires\xc4\x00\xa7max-age\xc4\x00\xc4\x07version\xc4\x00\xc4\x04path\xc4\x00\xc4\x08httponly\xc4\x00\xc7\x00\t\xc7\x00\t";

fn pickler(protocol: u8) -> PicklerConfig {
    PicklerConfig {
        protocol,
        ..PicklerConfig::default()
    }
}

fn unpickler(secure: bool) -> UnpicklerConfig {
    UnpicklerConfig {
        secure,
        ..UnpicklerConfig::default()
    }
}

fn encode(value: &Value, protocol: u8) -> (Vec<u8>, PackStats) {
    encode_with(value, &pickler(protocol), &ExtensionRegistry::new())
}

fn encode_with(value: &Value, config: &PicklerConfig, registry: &ExtensionRegistry) -> (Vec<u8>, PackStats) {
    let (bytes, stats) = pack::encode(value, config, registry).expect("encode");
    (bytes.to_vec(), stats)
}

fn decode_with(
    data: &[u8],
    config: &UnpicklerConfig,
    registry: &ExtensionRegistry,
    gate: &SecurityGate,
) -> Result<(Value, UnpackStats)> {
    unpack::decode(&mut SliceSource::new(data), config, registry, gate)
}

fn decode_trusted(data: &[u8]) -> Result<Value> {
    decode_with(data, &unpickler(false), &ExtensionRegistry::new(), &SecurityGate::new()).map(|(v, _)| v)
}

fn decode_gated(data: &[u8], gate: &SecurityGate) -> Result<Value> {
    decode_with(data, &unpickler(true), &ExtensionRegistry::new(), gate).map(|(v, _)| v)
}

/// Encode, decode without the gate, and check both sides agree on the memo.
fn roundtrip(value: &Value, protocol: u8) -> Value {
    let (bytes, pack_stats) = encode(value, protocol);
    let (decoded, unpack_stats) =
        decode_with(&bytes, &unpickler(false), &ExtensionRegistry::new(), &SecurityGate::new())
            .expect("decode");
    assert_eq!(pack_stats.memo_count, unpack_stats.memo_count);
    assert_eq!(unpack_stats.protocol, protocol);
    assert_eq!(unpack_stats.bytes_consumed, bytes.len() as u64);
    decoded
}

fn malformed_kind(err: PickleError) -> UnpicklingError {
    match err {
        PickleError::Unpickling(kind) => kind,
        other => panic!("expected a malformed stream error, got {other:?}"),
    }
}

fn class(module: &str, name: &str) -> Rc<Global> {
    Rc::new(Global::new(module, name))
}

fn contains(haystack: &[u8], needle: &[u8]) -> bool {
    haystack.windows(needle.len()).any(|w| w == needle)
}

// ---------------------------------------------------------------------------
// Scalars
// ---------------------------------------------------------------------------

#[test]
fn test_integer_forms() {
    assert_eq!(encode(&Value::from(1), 5).0, vec![0xd4, 0x00, 0x05, 0x01]);
    assert_eq!(encode(&Value::from(-1), 5).0[3..], [0xff]);
    assert_eq!(encode(&Value::from(-100), 5).0[3..], [0xd0, 0x9c]);
    assert_eq!(encode(&Value::from(200), 5).0[3..], [0xcc, 0xc8]);
    assert_eq!(encode(&Value::from(300), 5).0[3..], [0xd1, 0x01, 0x2c]);
}

#[test]
fn test_scalars_roundtrip_at_every_protocol() {
    let values = vec![
        Value::None,
        Value::from(true),
        Value::from(false),
        Value::from(0),
        Value::from(-32),
        Value::from(127),
        Value::from(128),
        Value::from(-33),
        Value::from(70_000),
        Value::from(-70_000),
        Value::from(i64::MAX),
        Value::from(i64::MIN),
        Value::from(u64::MAX),
        Value::from(BigInt::from(1u8) << 100),
        Value::from(-(BigInt::from(1u8) << 100usize)),
        Value::from(1.5),
        Value::from(-0.25),
        Value::from(""),
        Value::from("abc"),
        Value::from("héllo wörld"),
        Value::bytes(&b""[..]),
        Value::bytes(&b"\x00\x01\x02\x03\x04"[..]),
    ];
    for protocol in 2..=5 {
        for value in &values {
            assert_eq!(&roundtrip(value, protocol), value, "protocol {protocol}");
        }
    }
}

#[test]
fn test_big_integers_use_long() {
    let big = Value::from(BigInt::from(1u8) << 100);
    let (bytes, stats) = encode(&big, 5);
    assert_eq!(bytes[3], 0xc7);
    assert_eq!(bytes[5], 0x01);
    assert_eq!(stats.memo_count, 1);

    let (bytes, stats) = encode(&Value::from(u64::MAX), 5);
    assert_eq!(bytes[3..], [0xcf, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff]);
    assert_eq!(stats.memo_count, 0);
}

#[test]
fn test_alternative_text_forms() {
    assert_eq!(decode_trusted(b"\xc4\x03abc").unwrap(), Value::from("abc"));
    assert_eq!(decode_trusted(b"\xc7\x03\x0babc").unwrap(), Value::from("abc"));
    assert_eq!(decode_trusted(b"\xd9\x02hi").unwrap(), Value::from("hi"));
    assert_eq!(decode_trusted(b"\xca\x3f\xc0\x00\x00").unwrap(), Value::from(1.5));
}

#[test]
fn test_invalid_utf8_rejected() {
    let err = decode_trusted(b"\xa2\xff\xfe").unwrap_err();
    assert!(err.is_malformed());
}

// ---------------------------------------------------------------------------
// Version marker
// ---------------------------------------------------------------------------

#[test]
fn test_version_marker_is_optional() {
    let (value, stats) =
        decode_with(b"\xd4\x00\x03\x01", &unpickler(true), &ExtensionRegistry::new(), &SecurityGate::new())
            .unwrap();
    assert_eq!(value, Value::from(1));
    assert_eq!(stats.protocol, 3);

    let (value, stats) =
        decode_with(b"\x01", &unpickler(true), &ExtensionRegistry::new(), &SecurityGate::new()).unwrap();
    assert_eq!(value, Value::from(1));
    assert_eq!(stats.protocol, UnpicklerConfig::default().default_protocol);
}

#[test]
fn test_version_out_of_range() {
    assert!(matches!(
        decode_trusted(b"\xd4\x00\x01\x01").unwrap_err(),
        PickleError::UnsupportedVersion(1)
    ));
    assert!(matches!(
        decode_trusted(b"\xd4\x00\x06\x01").unwrap_err(),
        PickleError::UnsupportedVersion(6)
    ));
}

#[test]
fn test_nested_version_marker_rejected() {
    assert!(decode_trusted(b"\x91\xd4\x00\x05").unwrap_err().is_malformed());
}

#[test]
fn test_trailing_bytes_left_unread() {
    let (value, stats) =
        decode_with(b"\x01\x02", &unpickler(true), &ExtensionRegistry::new(), &SecurityGate::new()).unwrap();
    assert_eq!(value, Value::from(1));
    assert_eq!(stats.bytes_consumed, 1);
}

#[test]
fn test_unsupported_protocol_rejected_when_packing() {
    let err = pack::encode(&Value::None, &pickler(1), &ExtensionRegistry::new()).unwrap_err();
    assert!(matches!(err, PickleError::Pickling(_)));
    let err = pack::encode(&Value::None, &pickler(6), &ExtensionRegistry::new()).unwrap_err();
    assert!(matches!(err, PickleError::Pickling(_)));
}

// ---------------------------------------------------------------------------
// Truncation and malformed streams
// ---------------------------------------------------------------------------

#[test]
fn test_forged_lengths_are_end_of_input() {
    assert!(decode_trusted(b"\xd4\x00\x04\xdd\xff\xff\xff\xff").unwrap_err().is_end_of_input());
    assert!(decode_trusted(b"\xc9\xff\xff\xff\xff\x00").unwrap_err().is_end_of_input());
    assert!(decode_trusted(b"").unwrap_err().is_end_of_input());
}

#[test]
fn test_every_prefix_is_end_of_input() {
    let mut dict = Dict::new();
    dict.insert_str("numbers", Value::list((0..20).map(Value::from).collect()));
    dict.insert_str("payload", Value::bytes(vec![7u8; 40]));
    let value = Value::tuple(vec![Value::dict(dict), Value::from(u64::MAX), Value::from("tail text")]);
    let (bytes, _) = encode(&value, 5);

    for len in 0..bytes.len() {
        let err = decode_trusted(&bytes[..len]).unwrap_err();
        assert!(err.is_end_of_input(), "prefix {len}: {err:?}");
    }
    assert_eq!(decode_trusted(&bytes).unwrap(), value);
}

#[test]
fn test_unmatched_end() {
    assert_eq!(
        malformed_kind(decode_trusted(b"\xc7\x00\x09").unwrap_err()),
        UnpicklingError::UnmatchedEnd
    );
    assert_eq!(
        malformed_kind(decode_trusted(b"\x91\xc7\x00\x09").unwrap_err()),
        UnpicklingError::UnmatchedEnd
    );
}

#[test]
fn test_dangling_and_forward_references() {
    assert_eq!(
        malformed_kind(decode_trusted(b"\xc1\x00\x00\x00\x07").unwrap_err()),
        UnpicklingError::DanglingReference(7)
    );
    assert_eq!(
        malformed_kind(decode_trusted(b"\xc1\x00\x00\x00\x00").unwrap_err()),
        UnpicklingError::DanglingReference(0)
    );
    assert_eq!(
        malformed_kind(decode_trusted(b"\xd4\x03\xc1\x00\x00\x00\x01").unwrap_err()),
        UnpicklingError::ForwardReference(1)
    );
}

#[test]
fn test_legacy_only_extension_types_rejected() {
    for ext in [6u8, 7, 8, 12, 13, 14, 20] {
        let data = [0xd4, ext, 0x00];
        assert_eq!(
            malformed_kind(decode_trusted(&data).unwrap_err()),
            UnpicklingError::UnsupportedExtType(ext)
        );
    }
}

#[test]
fn test_unknown_extension_code() {
    assert_eq!(
        malformed_kind(decode_trusted(b"\xd4\x0f\x05").unwrap_err()),
        UnpicklingError::UnknownExtensionCode(5)
    );
}

#[test]
fn test_unhashable_dict_key() {
    // {[]: 1}
    assert!(decode_trusted(b"\x81\xc7\x00\x02\x01").unwrap_err().is_malformed());
}

#[test]
fn test_global_with_non_text_name() {
    assert_eq!(
        malformed_kind(decode_trusted(b"\xd4\x05\x01\x02").unwrap_err()),
        UnpicklingError::UnexpectedValue {
            expected: "str",
            found: "int"
        }
    );
}

#[test]
fn test_decode_depth_limit() {
    let config = UnpicklerConfig {
        secure: false,
        max_depth: 32,
        ..UnpicklerConfig::default()
    };
    let mut data = vec![0x91u8; 40];
    data.push(0x01);
    let err = decode_with(&data, &config, &ExtensionRegistry::new(), &SecurityGate::new()).unwrap_err();
    assert!(err.is_malformed());

    let mut data = vec![0x91u8; 20];
    data.push(0x01);
    assert!(decode_with(&data, &config, &ExtensionRegistry::new(), &SecurityGate::new()).is_ok());
}

#[test]
fn test_encode_depth_limit() {
    let mut value = Value::from(1);
    for _ in 0..40 {
        value = Value::tuple(vec![value]);
    }
    let config = PicklerConfig {
        max_depth: 32,
        ..PicklerConfig::default()
    };
    let err = pack::encode(&value, &config, &ExtensionRegistry::new()).unwrap_err();
    assert!(matches!(err, PickleError::Pickling(_)));
}

/// `[(), ((),), (((),),), ...]` where every tuple after the first refers
/// back to its predecessor instead of repeating it.
fn reference_chain(links: u32) -> Vec<u8> {
    let mut data = vec![0xd4, 0x00, 0x05, 0xdd];
    data.extend_from_slice(&(links + 1).to_be_bytes());
    data.push(0x90);
    // slot 1 is the outer array, slot 2 the empty tuple
    for target in 2..links + 2 {
        data.extend_from_slice(&[0x91, 0xc1]);
        data.extend_from_slice(&target.to_be_bytes());
    }
    data
}

#[test]
fn test_reference_chain_depth_is_bounded() {
    let config = UnpicklerConfig {
        secure: false,
        max_depth: 32,
        ..UnpicklerConfig::default()
    };
    let decode = |data: &[u8]| decode_with(data, &config, &ExtensionRegistry::new(), &SecurityGate::new());

    // outer array + 30 links + the empty tuple
    let (value, _) = decode(&reference_chain(30)).unwrap();
    {
        let items = value.as_tuple().unwrap().borrow();
        assert_eq!(items.len(), 31);
        let last = items[30].as_tuple().unwrap().borrow();
        assert!(last[0].ptr_eq(&items[29]));
    }

    let err = decode(&reference_chain(31)).unwrap_err();
    assert!(err.is_malformed());
    assert!(err.to_string().contains("nesting depth"));

    let err = decode(&reference_chain(200_000)).unwrap_err();
    assert!(err.is_malformed());
}

#[test]
fn test_reference_to_open_container_adds_no_depth() {
    let config = UnpicklerConfig {
        secure: false,
        max_depth: 2,
        ..UnpicklerConfig::default()
    };
    // [[<ref to outer>]]
    let data = b"\xd4\x00\x05\xd4\x02\x01\xd4\x02\x01\xc1\x00\x00\x00\x01";
    let (value, _) = decode_with(data, &config, &ExtensionRegistry::new(), &SecurityGate::new()).unwrap();
    let outer = value.as_list().unwrap().borrow();
    let inner = outer[0].as_list().unwrap().borrow();
    assert!(inner[0].ptr_eq(&value));
}

/// One of several value shapes, `layers` levels deep.
fn layered(shape: usize, layers: usize) -> Value {
    if shape == 5 {
        let mut links = vec![Value::tuple(Vec::new())];
        for _ in 0..layers {
            let previous = links[links.len() - 1].clone();
            links.push(Value::tuple(vec![previous]));
        }
        return Value::list(links);
    }

    let mut value = Value::from(0);
    for _ in 0..layers {
        value = match shape {
            0 => Value::list(vec![value]),
            1 => Value::object(Object::call(class("app", "Node"), vec![value])),
            2 => {
                let mut node = Object::new(class("app", "Node"));
                node.set_attr("next", value);
                Value::object(node)
            }
            3 => {
                let mut node = Object::new(class("app", "Node"));
                node.set_slot("next", value);
                Value::object(node)
            }
            _ => {
                let mut dict = Dict::new();
                dict.insert_str("next", value);
                Value::dict(dict)
            }
        };
    }
    value
}

#[test]
fn test_pack_and_unpack_agree_on_depth() {
    let limit = 24;
    let packing = PicklerConfig {
        max_depth: limit,
        ..PicklerConfig::default()
    };
    let unpacking = UnpicklerConfig {
        secure: false,
        max_depth: limit,
        ..UnpicklerConfig::default()
    };
    let registry = ExtensionRegistry::new();
    let gate = SecurityGate::new();

    for shape in 0..6 {
        let mut rejected = false;
        for layers in 1..=limit + 1 {
            let value = layered(shape, layers);
            let (bytes, _) = encode_with(&value, &PicklerConfig::default(), &registry);
            let decoded = decode_with(&bytes, &unpacking, &registry, &gate);
            match pack::encode(&value, &packing, &registry) {
                Ok((limited, _)) => {
                    assert_eq!(&limited[..], &bytes[..]);
                    assert_eq!(decoded.unwrap().0, value, "shape {shape}, {layers} layers");
                }
                Err(err) => {
                    rejected = true;
                    assert!(matches!(err, PickleError::Pickling(_)));
                    assert!(
                        decoded.unwrap_err().is_malformed(),
                        "shape {shape}, {layers} layers"
                    );
                }
            }
        }
        assert!(rejected, "shape {shape} never reached the limit");
    }
}

// ---------------------------------------------------------------------------
// Legacy writer vectors
// ---------------------------------------------------------------------------

#[test]
fn test_legacy_set_vector() {
    let (value, stats) =
        decode_with(LEGACY_SET, &unpickler(true), &ExtensionRegistry::new(), &SecurityGate::new()).unwrap();
    let expected = Value::set(Set::from_values(vec![Value::from(1), Value::from(2)]).unwrap());
    assert_eq!(value, expected);
    assert_eq!(stats.protocol, 2);
    assert_eq!(stats.memo_count, 4);
}

#[test]
fn test_set_encodes_like_legacy_writer() {
    let value = Value::set(Set::from_values(vec![Value::from(1), Value::from(2)]).unwrap());
    let (bytes, stats) = encode(&value, 2);
    assert_eq!(bytes, LEGACY_SET);
    assert_eq!(stats.memo_count, 4);
}

#[test]
fn test_legacy_range_vector_requires_allow() {
    let gate = SecurityGate::new();
    match decode_gated(LEGACY_RANGE, &gate).unwrap_err() {
        PickleError::Security { module, name } => {
            assert_eq!(module, "builtins");
            assert_eq!(name, "range");
        }
        other => panic!("expected a security error, got {other:?}"),
    }

    gate.allow("builtins", "range").unwrap();
    let value = decode_gated(LEGACY_RANGE, &gate).unwrap();
    let expected = Value::object(Object::call(
        class("builtins", "range"),
        vec![Value::from(0), Value::from(5), Value::from(1)],
    ));
    assert_eq!(value, expected);
    assert_eq!(encode(&expected, 2).0, LEGACY_RANGE);
}

#[test]
fn test_legacy_cookie_vector() {
    let gate = SecurityGate::new();
    assert!(decode_gated(LEGACY_COOKIE, &gate).unwrap_err().is_security());

    gate.allow("http.cookies", "SimpleCookie").unwrap();
    gate.allow("http.cookies", "Morsel").unwrap();
    let value = decode_gated(LEGACY_COOKIE, &gate).unwrap();

    let mut morsel = Object::new(class("http.cookies", "Morsel"));
    morsel.set_attr("coded_value", Value::from("value"));
    morsel.set_attr("value", Value::from("value"));
    morsel.set_attr("key", Value::from("key"));
    for attr in ["comment", "domain", "secure", "expires", "max-age", "version", "path", "httponly"] {
        morsel.push_pair(Value::from(attr), Value::from(""));
    }
    let mut cookie = Object::new(class("http.cookies", "SimpleCookie"));
    cookie.push_pair(Value::from("key"), Value::object(morsel));

    assert_eq!(value, Value::object(cookie));
}

#[test]
fn test_protocol_2_writes_legacy_names() {
    let value = Value::global("builtins", "range");
    let (bytes, _) = encode(&value, 2);
    assert!(contains(&bytes, b"__builtin__"));
    assert!(contains(&bytes, b"xrange"));
    assert_eq!(decode_trusted(&bytes).unwrap(), value);

    let (bytes, _) = encode(&value, 3);
    assert!(contains(&bytes, b"builtins"));
    assert!(!contains(&bytes, b"xrange"));
}

// ---------------------------------------------------------------------------
// References
// ---------------------------------------------------------------------------

#[test]
fn test_shared_list_decoded_once() {
    let shared = Value::list(vec![Value::from(1), Value::from(2)]);
    let value = Value::tuple(vec![shared.clone(), shared.clone()]);
    let decoded = roundtrip(&value, 5);

    let items = decoded.as_tuple().unwrap().borrow();
    assert!(items[0].ptr_eq(&items[1]));
}

#[test]
fn test_list_containing_itself() {
    let list = Value::list(vec![Value::from(1)]);
    list.as_list().unwrap().borrow_mut().push(list.clone());

    let decoded = roundtrip(&list, 5);
    let items = decoded.as_list().unwrap().borrow();
    assert_eq!(items.len(), 2);
    assert!(items[1].ptr_eq(&decoded));
}

#[test]
fn test_dict_containing_itself() {
    let value = Value::dict(Dict::new());
    value.as_dict().unwrap().borrow_mut().insert_str("self", value.clone());

    let decoded = roundtrip(&value, 4);
    let dict = decoded.as_dict().unwrap().borrow();
    assert!(dict.get_str("self").unwrap().ptr_eq(&decoded));
}

#[test]
fn test_tuple_list_cycle() {
    let list = Value::list(Vec::new());
    let tuple = Value::tuple(vec![list.clone()]);
    list.as_list().unwrap().borrow_mut().push(tuple.clone());

    let decoded = roundtrip(&tuple, 5);
    let inner = decoded.as_tuple().unwrap().borrow()[0].clone();
    let back = inner.as_list().unwrap().borrow()[0].clone();
    assert!(back.ptr_eq(&decoded));
}

#[test]
fn test_mutually_referencing_objects() {
    let a = Value::object(Object::new(class("app", "Node")));
    let b = Value::object(Object::new(class("app", "Node")));
    a.as_object().unwrap().borrow_mut().set_attr("next", b.clone());
    b.as_object().unwrap().borrow_mut().set_attr("next", a.clone());

    let decoded = roundtrip(&a, 5);
    let next = decoded.as_object().unwrap().borrow().attr("next").unwrap().clone();
    let back = next.as_object().unwrap().borrow().attr("next").unwrap().clone();
    assert!(back.ptr_eq(&decoded));
    assert!(!next.ptr_eq(&decoded));
}

#[test]
fn test_repeated_text_written_once() {
    let text = Value::from("repeated text");
    let value = Value::list(vec![text.clone(), text.clone(), Value::from("abc"), Value::from("abc")]);
    let (bytes, stats) = encode(&value, 5);
    assert_eq!(bytes.windows(13).filter(|w| *w == b"repeated text").count(), 1);
    assert_eq!(bytes.windows(3).filter(|w| *w == b"abc").count(), 2);
    // list, text
    assert_eq!(stats.memo_count, 2);
    assert_eq!(roundtrip(&value, 5), value);
}

#[test]
fn test_reference_tracking_disabled() {
    let shared = Value::list(vec![Value::from(1)]);
    let value = Value::tuple(vec![shared.clone(), shared]);
    let config = PicklerConfig {
        track_references: false,
        ..PicklerConfig::default()
    };
    let (bytes, _) = encode_with(&value, &config, &ExtensionRegistry::new());
    let decoded = decode_trusted(&bytes).unwrap();
    let items = decoded.as_tuple().unwrap().borrow();
    assert_eq!(items[0], items[1]);
    assert!(!items[0].ptr_eq(&items[1]));

    let cyclic = Value::list(Vec::new());
    cyclic.as_list().unwrap().borrow_mut().push(cyclic.clone());
    let config = PicklerConfig {
        track_references: false,
        max_depth: 32,
        ..PicklerConfig::default()
    };
    let err = pack::encode(&cyclic, &config, &ExtensionRegistry::new()).unwrap_err();
    assert!(matches!(err, PickleError::Pickling(_)));
}

// ---------------------------------------------------------------------------
// Chunking
// ---------------------------------------------------------------------------

#[test]
fn test_large_list_is_chunked_at_protocol_5() {
    let value = Value::list((0..2500).map(Value::from).collect());
    let (bytes, stats) = encode(&value, 5);
    assert_eq!(stats.chunks, 3);
    assert_eq!(bytes[3..6], [0xd4, 0x10, 0x01]);
    assert_eq!(roundtrip(&value, 5), value);

    let (_, stats) = encode(&value, 4);
    assert_eq!(stats.chunks, 0);
    assert_eq!(roundtrip(&value, 4), value);
}

#[test]
fn test_small_containers_are_not_chunked() {
    let value = Value::list((0..10).map(Value::from).collect());
    let (_, stats) = encode(&value, 5);
    assert_eq!(stats.chunks, 0);
}

#[test]
fn test_large_tuple_and_dict_are_chunked() {
    let tuple = Value::tuple((0..2500).map(Value::from).collect());
    let (_, stats) = encode(&tuple, 5);
    assert_eq!(stats.chunks, 3);
    assert_eq!(roundtrip(&tuple, 5), tuple);

    let mut dict = Dict::new();
    for i in 0..2500i64 {
        dict.insert(Value::from(i), Value::from(i * 2)).unwrap();
    }
    let dict = Value::dict(dict);
    let (_, stats) = encode(&dict, 5);
    assert_eq!(stats.chunks, 3);
    assert_eq!(roundtrip(&dict, 5), dict);
}

#[test]
fn test_chunked_list_referencing_itself() {
    let list = Value::list((0..1500).map(Value::from).collect());
    list.as_list().unwrap().borrow_mut().push(list.clone());
    let config = PicklerConfig {
        chunk_size: 100,
        ..PicklerConfig::default()
    };
    let (bytes, stats) = encode_with(&list, &config, &ExtensionRegistry::new());
    assert_eq!(stats.chunks, 16);

    let decoded = decode_trusted(&bytes).unwrap();
    let items = decoded.as_list().unwrap().borrow();
    assert_eq!(items.len(), 1501);
    assert!(items[1500].ptr_eq(&decoded));
}

#[test]
fn test_wrong_chunk_header_rejected() {
    // chunked list followed by a map header
    assert!(decode_trusted(b"\xd4\x10\x01\x81\x01\x02").unwrap_err().is_malformed());
}

// ---------------------------------------------------------------------------
// Extension codes
// ---------------------------------------------------------------------------

#[test]
fn test_extension_code_replaces_names() {
    for code in [1u32, 0xFF, 0x100, 0xFFFF, 0x1_0000, 0x7FFF_FFFF] {
        let registry = ExtensionRegistry::new();
        registry.register("app", "Widget", code).unwrap();
        let value = Value::global("app", "Widget");

        let (bytes, _) = encode_with(&value, &pickler(5), &registry);
        assert!(!contains(&bytes, b"Widget"), "code {code:#x}");
        assert!(!contains(&bytes, b"app"), "code {code:#x}");

        let (decoded, _) = decode_with(&bytes, &unpickler(false), &registry, &SecurityGate::new()).unwrap();
        assert_eq!(decoded, value, "code {code:#x}");
    }
}

#[test]
fn test_extension_code_width() {
    let registry = ExtensionRegistry::new();
    registry.register("app", "Widget", 0x100).unwrap();
    let (bytes, _) = encode_with(&Value::global("app", "Widget"), &pickler(5), &registry);
    assert_eq!(bytes[3..], [0xd5, 0x0f, 0x01, 0x00]);
}

#[test]
fn test_extension_code_goes_through_gate() {
    let registry = ExtensionRegistry::new();
    registry.register("app", "Widget", 7).unwrap();
    let gate = SecurityGate::new();
    let data = b"\xd4\x00\x05\xd4\x0f\x07";

    let err = decode_with(data, &unpickler(true), &registry, &gate).unwrap_err();
    assert!(err.is_security());

    gate.allow("app", "Widget").unwrap();
    let (value, _) = decode_with(data, &unpickler(true), &registry, &gate).unwrap();
    assert_eq!(value, Value::global("app", "Widget"));
}

// ---------------------------------------------------------------------------
// Composites
// ---------------------------------------------------------------------------

#[test]
fn test_object_state_forms_roundtrip() {
    let mut flat = Object::new(class("app", "Flat"));
    flat.set_attr("name", Value::from("flat object"));

    let mut slotted = Object::new(class("app", "Slotted"));
    slotted.set_attr("extra", Value::from(1));
    slotted.set_slot("x", Value::from(10));
    slotted.set_slot("y", Value::from(20));

    let mut slots_only = Object::new(class("app", "SlotsOnly"));
    slots_only.set_slot("x", Value::from(3));

    let mut custom = Object::new(class("app", "Custom"));
    custom.custom_state = Some(Value::tuple(vec![Value::from(1), Value::from(2), Value::from(3)]));

    let mut called = Object::call(class("app", "Called"), vec![Value::from("argument"), Value::None]);
    called.push_item(Value::from(1));
    called.push_item(Value::from(2));
    called.push_pair(Value::from("k"), Value::from("v"));

    for object in [flat, slotted, slots_only, custom, called] {
        let value = Value::object(object);
        for protocol in 2..=5 {
            assert_eq!(roundtrip(&value, protocol), value);
        }
    }
}

#[test]
fn test_custom_state_with_attributes_fails_to_encode() {
    let mut object = Object::new(class("app", "Mixed"));
    object.custom_state = Some(Value::from(1));
    object.set_attr("lost", Value::from(2));
    let value = Value::list(vec![Value::object(object)]);

    match pack::encode(&value, &pickler(5), &ExtensionRegistry::new()).unwrap_err() {
        PickleError::Pickling(msg) => assert!(msg.contains("app.Mixed")),
        other => panic!("expected a pickling error, got {other:?}"),
    }
}

#[test]
fn test_state_setter_runs_for_registered_type() {
    let gate = SecurityGate::new();
    gate.secure_type(TypeHandle::new("app", "Point").with_state_setter(|object, state| {
        let items = match state.as_tuple() {
            Some(items) => items.borrow().clone(),
            None => return Err("expected a tuple".to_string()),
        };
        object.set_attr("x", items[0].clone());
        object.set_attr("y", items[1].clone());
        Ok(())
    }))
    .unwrap();

    let mut point = Object::new(class("app", "Point"));
    point.custom_state = Some(Value::tuple(vec![Value::from(3), Value::from(4)]));
    let (bytes, _) = encode(&Value::object(point), 5);

    let value = decode_gated(&bytes, &gate).unwrap();
    let object = value.as_object().unwrap().borrow();
    assert_eq!(object.attr("x"), Some(&Value::from(3)));
    assert_eq!(object.attr("y"), Some(&Value::from(4)));
    assert!(object.custom_state.is_none());
    assert!(object.class.handle().is_some());
}

#[test]
fn test_failing_state_setter_is_malformed() {
    let gate = SecurityGate::new();
    gate.secure_type(TypeHandle::new("app", "Strict").with_state_setter(|_, _| Err("rejected".to_string())))
        .unwrap();

    let mut object = Object::new(class("app", "Strict"));
    object.custom_state = Some(Value::from(1));
    let (bytes, _) = encode(&Value::object(object), 5);
    assert!(decode_gated(&bytes, &gate).unwrap_err().is_malformed());
}

struct Point {
    x: i64,
    y: i64,
}

impl Reduce for Point {
    fn type_name(&self) -> &str {
        "Point"
    }

    fn reduce(&self) -> Option<Reduction> {
        Some(Reduction::call(class("geometry", "Point"), vec![Value::from(self.x), Value::from(self.y)]))
    }
}

struct Generator;

impl Reduce for Generator {
    fn type_name(&self) -> &str {
        "generator"
    }

    fn reduce(&self) -> Option<Reduction> {
        None
    }
}

#[test]
fn test_native_values_reduce_to_objects() {
    let point = Value::native(Point { x: 1, y: -2 });
    let value = Value::tuple(vec![point.clone(), point]);
    let (bytes, pack_stats) = encode(&value, 5);
    let (decoded, unpack_stats) =
        decode_with(&bytes, &unpickler(false), &ExtensionRegistry::new(), &SecurityGate::new()).unwrap();
    assert_eq!(pack_stats.memo_count, unpack_stats.memo_count);

    let items = decoded.as_tuple().unwrap().borrow();
    assert!(items[0].ptr_eq(&items[1]));
    assert_eq!(
        items[0],
        Value::object(Object::call(class("geometry", "Point"), vec![Value::from(1), Value::from(-2)]))
    );
}

#[test]
fn test_unreducible_native_value() {
    let err = pack::encode(&Value::native(Generator), &pickler(5), &ExtensionRegistry::new()).unwrap_err();
    match err {
        PickleError::Pickling(msg) => assert!(msg.contains("generator")),
        other => panic!("expected a pickling error, got {other:?}"),
    }
}

#[test]
fn test_set_roundtrip_without_allow() {
    let value = Value::set(Set::from_values(vec![Value::from("alpha"), Value::from(2), Value::None]).unwrap());
    let (bytes, _) = encode(&value, 5);
    assert_eq!(decode_gated(&bytes, &SecurityGate::new()).unwrap(), value);
}

#[test]
fn test_unallowed_object_class_rejected() {
    let value = Value::object(Object::new(class("os", "system")));
    let (bytes, _) = encode(&value, 5);
    let err = decode_gated(&bytes, &SecurityGate::new()).unwrap_err();
    assert!(err.is_security());
}

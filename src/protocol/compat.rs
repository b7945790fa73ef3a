//! Module and name spellings used by protocol 2 writers.
//!
//! Streams below protocol 3 name globals the way older runtimes did
//! (`__builtin__`, `copy_reg`, `Cookie`, ...). Names are translated to the
//! current spelling when read and back to the legacy spelling when written,
//! so the gate and type table only ever see current names.

use std::borrow::Cow;

/// First protocol that uses current module names.
pub const FIRST_CURRENT_PROTOCOL: u8 = 3;

const MODULES: &[(&str, &str)] = &[
    ("__builtin__", "builtins"),
    ("copy_reg", "copyreg"),
    ("Cookie", "http.cookies"),
    ("cookielib", "http.cookiejar"),
    ("Queue", "queue"),
    ("repr", "reprlib"),
    ("ConfigParser", "configparser"),
    ("SocketServer", "socketserver"),
    ("htmlentitydefs", "html.entities"),
    ("httplib", "http.client"),
    ("urlparse", "urllib.parse"),
];

const NAMES: &[((&str, &str), (&str, &str))] = &[
    (("__builtin__", "xrange"), ("builtins", "range")),
    (("__builtin__", "unicode"), ("builtins", "str")),
];

/// Whether globals in a stream of this protocol use legacy spellings.
pub fn uses_legacy_names(protocol: u8) -> bool {
    protocol < FIRST_CURRENT_PROTOCOL
}

/// Translate a name read from a legacy stream to its current spelling.
pub fn to_current<'a>(module: &'a str, name: &'a str) -> (Cow<'a, str>, Cow<'a, str>) {
    if let Some((_, (m, n))) = NAMES.iter().find(|((m, n), _)| *m == module && *n == name) {
        return (Cow::Borrowed(*m), Cow::Borrowed(*n));
    }
    match MODULES.iter().find(|(legacy, _)| *legacy == module) {
        Some((_, current)) => (Cow::Borrowed(*current), Cow::Borrowed(name)),
        None => (Cow::Borrowed(module), Cow::Borrowed(name)),
    }
}

/// Translate a current name to the spelling a legacy reader expects.
pub fn to_legacy<'a>(module: &'a str, name: &'a str) -> (Cow<'a, str>, Cow<'a, str>) {
    if let Some(((m, n), _)) = NAMES.iter().find(|(_, (m, n))| *m == module && *n == name) {
        return (Cow::Borrowed(*m), Cow::Borrowed(*n));
    }
    match MODULES.iter().find(|(_, current)| *current == module) {
        Some((legacy, _)) => (Cow::Borrowed(*legacy), Cow::Borrowed(name)),
        None => (Cow::Borrowed(module), Cow::Borrowed(name)),
    }
}

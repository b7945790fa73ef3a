#![no_main]

use libfuzzer_sys::fuzz_target;
use pickle_codec::Unpickler;

fuzz_target!(|data: &[u8]| {
    // Decoding untrusted bytes must never panic, with or without the gate
    let _ = pickle_codec::loads(data);
    let _ = Unpickler::insecure().loads(data);
});

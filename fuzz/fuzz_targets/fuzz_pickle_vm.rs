#![no_main]
use libfuzzer_sys::fuzz_target;

use tensorfile::pickle_vm::{parse, PickleOptions, StringEncoding};

fuzz_target!(|data: &[u8]| {
    for encoding in [StringEncoding::Utf8, StringEncoding::Bytes] {
        let mut storage = tensorfile::from_memory(data.to_vec());
        let options = PickleOptions {
            string_encoding: encoding,
        };
        let _ = parse(&mut storage, &options);
    }
});

#![no_main]
use libfuzzer_sys::fuzz_target;

use tensorfile::{ReadFlags, Storage, ZipReader};

fuzz_target!(|data: &[u8]| {
    let storage = Box::new(tensorfile::from_memory(data.to_vec()));
    let mut zip = match ZipReader::new(storage) {
        Ok(z) => z,
        Err(_) => return,
    };
    // Walk every member, reading in small chunks.
    for _ in 0..64 {
        match zip.read_next_file() {
            Ok(Some(_)) => loop {
                match zip.read(17, ReadFlags::TEMPORARY | ReadFlags::ALLOW_PARTIAL) {
                    Ok(bytes) if bytes.is_empty() => break,
                    Ok(_) => {}
                    Err(_) => return,
                }
            },
            Ok(None) | Err(_) => break,
        }
    }
});

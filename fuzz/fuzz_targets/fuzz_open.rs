#![no_main]
use libfuzzer_sys::fuzz_target;

use tensorfile::{ReadFlags, TensorReader};

fuzz_target!(|data: &[u8]| {
    // First byte toggles the buffer splitter; remaining bytes are the
    // container image.
    if data.is_empty() {
        return;
    }
    let small_buffers = data[0] & 1 == 1;
    let storage = Box::new(tensorfile::from_memory(data[1..].to_vec()));

    let mut reader = match tensorfile::read_tensors(storage, small_buffers) {
        Ok(r) => r,
        Err(_) => return,
    };
    while let Ok(true) = reader.read_next_buffer() {
        let _ = reader.tensors_in_buffer();
        let buffer_size = reader.buffer_size();
        if reader.read(buffer_size, ReadFlags::ALLOW_PARTIAL).is_err() {
            break;
        }
    }
});

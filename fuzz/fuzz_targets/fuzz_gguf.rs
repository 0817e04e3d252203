#![no_main]
use libfuzzer_sys::fuzz_target;

use tensorfile::gguf_reader::GgufReader;
use tensorfile::TensorReader;

fuzz_target!(|data: &[u8]| {
    // Keep the magic fixed so the fuzzer spends its budget past it.
    let mut image = b"GGUF".to_vec();
    image.extend_from_slice(data);
    let storage = Box::new(tensorfile::from_memory(image));
    if let Ok(mut reader) = GgufReader::new(storage) {
        let _ = reader.read_all_tensor_infos();
    }
});

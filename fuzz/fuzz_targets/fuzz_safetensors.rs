#![no_main]
use libfuzzer_sys::fuzz_target;

use tensorfile::safetensors_reader::SafeTensorsReader;
use tensorfile::TensorReader;

fuzz_target!(|data: &[u8]| {
    let storage = Box::new(tensorfile::from_memory(data.to_vec()));
    if let Ok(mut reader) = SafeTensorsReader::new(storage) {
        let _ = reader.read_all_tensor_infos();
    }
});

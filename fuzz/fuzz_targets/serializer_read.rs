#![no_main]

use bitstream::{NetSerializer, ReadSerializer};
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    let mut serializer = ReadSerializer::new(data);
    let mut idx = 0usize;

    // Input bytes pick a bounded sequence of reads.
    while idx < data.len() && idx < 1024 {
        let op = data[idx] % 9;
        idx += 1;

        match op {
            0 => {
                let _ = serializer.serialize_bool(&mut false, "bool");
            }
            1 => {
                let bits = (data[idx - 1] % 64).saturating_add(1);
                let _ = serializer.serialize_bits(&mut 0, bits, "bits");
            }
            2 => {
                let _ = serializer.serialize_u8(&mut 0, "u8");
            }
            3 => {
                let _ = serializer.serialize_u16(&mut 0, "u16");
            }
            4 => {
                let _ = serializer.serialize_u32(&mut 0, "u32");
            }
            5 => {
                let _ = serializer.serialize_varu32(&mut 0, "varu32");
            }
            6 => {
                let _ = serializer.serialize_vars32(&mut 0, "vars32");
            }
            7 => {
                let _ = serializer.serialize_varu64(&mut 0, "varu64");
            }
            _ => {
                let _ = serializer.align();
            }
        }
    }

    // Once invalid, the serializer stays invalid.
    if !serializer.is_valid() {
        assert!(serializer.serialize_u8(&mut 0, "after").is_err());
    }
});

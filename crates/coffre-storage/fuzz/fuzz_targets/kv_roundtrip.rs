//! Drive the public key-value API with arbitrary operation streams.
//!
//! No tampering happens here, so no operation may reach the fault guard:
//! any panic is a real bug.

#![no_main]

use std::sync::{Mutex, OnceLock};

use coffre_flash::RamFlash;
use coffre_storage::{StdHal, Storage, PIN_EMPTY};
use libfuzzer_sys::fuzz_target;

static STORAGE: OnceLock<Mutex<Storage<RamFlash, StdHal>>> = OnceLock::new();

fuzz_target!(|data: &[u8]| {
    let shared = STORAGE.get_or_init(|| {
        Mutex::new(
            Storage::init(RamFlash::new(), StdHal, None, b"fuzz hardware secret")
                .expect("fresh storage must initialize"),
        )
    });
    let mut storage = shared.lock().expect("single-threaded fuzzer");

    if !storage.is_unlocked() {
        storage.unlock(PIN_EMPTY).expect("factory PIN must unlock");
    }

    let mut chunks = data.chunks(4);
    while let Some(chunk) = chunks.next() {
        if chunk.len() < 3 {
            break;
        }
        let key = u16::from_le_bytes([chunk[1], chunk[2]]);
        match chunk[0] % 4 {
            0 => {
                let value = chunks.next().unwrap_or(&[]);
                let _ = storage.set(key, value);
            }
            1 => {
                let _ = storage.get(key);
            }
            2 => {
                let _ = storage.delete(key);
            }
            _ => {
                let _ = storage.get_pin_rem();
            }
        }
    }
});

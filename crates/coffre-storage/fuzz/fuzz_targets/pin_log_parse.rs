//! Feed arbitrary bytes to the PIN-log decoder through the raw flash seam.
//!
//! `get_pin_rem` maps every malformed log to 0 without reaching the fault
//! guard, so any panic is a parser bug.

#![no_main]

use std::sync::{Mutex, OnceLock};

use coffre_flash::{Flash, RamFlash};
use coffre_storage::{StdHal, Storage};
use libfuzzer_sys::fuzz_target;

/// Flash key of the PIN logs entry.
const PIN_LOGS_KEY: u16 = 0x0001;

static STORAGE: OnceLock<Mutex<Storage<RamFlash, StdHal>>> = OnceLock::new();

fuzz_target!(|data: &[u8]| {
    if data.len() > 0xFFFF {
        return;
    }
    let shared = STORAGE.get_or_init(|| {
        Mutex::new(
            Storage::init(RamFlash::new(), StdHal, None, b"fuzz hardware secret")
                .expect("fresh storage must initialize"),
        )
    });
    let mut storage = shared.lock().expect("single-threaded fuzzer");

    storage
        .flash_mut()
        .set(PIN_LOGS_KEY, data)
        .expect("length-checked above");
    let _ = storage.get_pin_rem();
});

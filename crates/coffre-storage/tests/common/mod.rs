//! Shared test harness: a deterministic HAL and storage constructors.

#![allow(dead_code)]

use std::cell::RefCell;
use std::rc::Rc;

use coffre_flash::RamFlash;
use coffre_storage::{Hal, Storage};

/// Message carried by the panic that stands in for a halted device.
pub const HALT_MSG: &str = "device halted";

/// Deterministic HAL: xorshift randomness, recorded (not slept) delays,
/// panic-as-halt.
pub struct TestHal {
    rng_state: u64,
    pub delayed_ms: Rc<RefCell<u64>>,
}

impl TestHal {
    pub fn new(seed: u64) -> Self {
        Self {
            rng_state: if seed == 0 { 0x9E37_79B9_7F4A_7C15 } else { seed },
            delayed_ms: Rc::new(RefCell::new(0)),
        }
    }
}

impl Hal for TestHal {
    fn fill_random(&mut self, buf: &mut [u8]) {
        for byte in buf {
            self.rng_state ^= self.rng_state << 13;
            self.rng_state ^= self.rng_state >> 7;
            self.rng_state ^= self.rng_state << 17;
            *byte = (self.rng_state >> 32) as u8;
        }
    }

    fn delay_ms(&mut self, ms: u32) {
        *self.delayed_ms.borrow_mut() += u64::from(ms);
    }

    fn wait_random(&mut self) {}

    fn halt(&mut self) -> ! {
        panic!("{HALT_MSG}");
    }
}

/// Recorded UI progress callbacks.
pub type ProgressLog = Rc<RefCell<Vec<(u32, u32)>>>;

/// Fresh factory-state storage over empty flash.
pub fn new_storage(seed: u64) -> Storage<RamFlash, TestHal> {
    Storage::init(RamFlash::new(), TestHal::new(seed), None, b"hardware unit secret")
        .expect("fresh storage must initialize")
}

/// Fresh storage with a recording UI callback and a handle to the recorded
/// delay total.
pub fn new_storage_with_ui(seed: u64) -> (Storage<RamFlash, TestHal>, ProgressLog, Rc<RefCell<u64>>) {
    let progress: ProgressLog = Rc::new(RefCell::new(Vec::new()));
    let sink = Rc::clone(&progress);
    let hal = TestHal::new(seed);
    let delayed = Rc::clone(&hal.delayed_ms);
    let storage = Storage::init(
        RamFlash::new(),
        hal,
        Some(Box::new(move |seconds, permille| {
            sink.borrow_mut().push((seconds, permille));
        })),
        b"hardware unit secret",
    )
    .expect("fresh storage must initialize");
    (storage, progress, delayed)
}

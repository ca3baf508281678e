use dashmap::DashSet;
use rand::rngs::{OsRng, StdRng};
use rand::{RngCore, SeedableRng};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::{SystemTime, UNIX_EPOCH};
use uuid::{Builder, Uuid};

/// Hands out random 128-bit record ids (UUID v4 text).
///
/// Randomness comes from the OS. If the OS source fails, a seeded
/// `StdRng` takes over. Every id handed out is remembered so the same
/// generator never returns it twice.
pub struct IdGenerator {
    fallback: Mutex<Option<StdRng>>,
    issued: DashSet<Uuid>,
}

impl Default for IdGenerator {
    fn default() -> Self {
        Self::new()
    }
}

impl IdGenerator {
    pub fn new() -> Self {
        Self {
            fallback: Mutex::new(None),
            issued: DashSet::new(),
        }
    }

    pub fn next_id(&self) -> String {
        loop {
            let id = Builder::from_random_bytes(self.random_bytes()).into_uuid();
            if self.issued.insert(id) {
                return id.to_string();
            }
            log::warn!("Id generator produced a repeated id, drawing again");
        }
    }

    fn random_bytes(&self) -> [u8; 16] {
        let mut bytes = [0u8; 16];
        match OsRng.try_fill_bytes(&mut bytes) {
            Ok(()) => bytes,
            Err(e) => {
                log::warn!("OS randomness unavailable ({}), using fallback generator", e);
                self.fill_from_fallback(&mut bytes);
                bytes
            }
        }
    }

    fn fill_from_fallback(&self, bytes: &mut [u8; 16]) {
        let mut guard = self.fallback.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        guard
            .get_or_insert_with(|| StdRng::seed_from_u64(fallback_seed()))
            .fill_bytes(bytes);
    }
}

fn fallback_seed() -> u64 {
    static COUNTER: AtomicU64 = AtomicU64::new(0);
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as u64)
        .unwrap_or_default();
    let pid = u64::from(std::process::id());
    nanos ^ pid.rotate_left(32) ^ COUNTER.fetch_add(1, Ordering::Relaxed).wrapping_mul(0x9E37_79B9_7F4A_7C15)
}

//! Engine pseudo-random number generation.
//!
//! An RC4-style stream generator. Each context owns one instance, seeded
//! from the default driver's `randomness` at initialization and guarded by
//! the PRNG static mutex. Temp-name generation and callers needing cheap
//! repeatable randomness draw from here; drivers keep their own entropy
//! sources for lock-byte selection.

use std::cell::UnsafeCell;
use std::sync::Arc;

use crate::os::mutex::RawMutex;

// ============================================================================
// PRNG State
// ============================================================================

/// Pseudo-random generator state (RC4-based)
pub struct Prng {
    /// State array
    s: [u8; 256],
    /// Index i
    i: u8,
    /// Index j
    j: u8,
    /// Has been seeded
    is_init: bool,
}

impl Default for Prng {
    fn default() -> Self {
        Self::new()
    }
}

impl Prng {
    pub const fn new() -> Self {
        Self {
            s: [0; 256],
            i: 0,
            j: 0,
            is_init: false,
        }
    }

    /// Seed with the RC4 key-scheduling algorithm. An empty key falls back
    /// to system entropy.
    pub fn seed(&mut self, key: &[u8]) {
        if key.is_empty() {
            self.auto_seed();
            return;
        }

        for i in 0..256 {
            self.s[i] = i as u8;
        }

        let mut j: u8 = 0;
        for i in 0..256 {
            j = j.wrapping_add(self.s[i]).wrapping_add(key[i % key.len()]);
            self.s.swap(i, j as usize);
        }

        self.i = 0;
        self.j = 0;
        self.is_init = true;

        // discard the first block; early RC4 output leaks key bits
        let mut discard = [0u8; 256];
        self.fill_internal(&mut discard);
    }

    /// Seed from system entropy: /dev/urandom where available, mixed with
    /// the clock and process id.
    pub fn auto_seed(&mut self) {
        let mut key = [0u8; 256];

        #[cfg(unix)]
        {
            if let Ok(mut file) = std::fs::File::open("/dev/urandom") {
                use std::io::Read;
                let _ = file.read_exact(&mut key);
            }
        }

        let now = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default();
        let time_bytes = now.as_nanos().to_le_bytes();
        for (i, &b) in time_bytes.iter().enumerate() {
            key[i] ^= b;
        }

        let pid_bytes = std::process::id().to_le_bytes();
        for (i, &b) in pid_bytes.iter().enumerate() {
            key[128 + i] ^= b;
        }

        for i in 0..256 {
            self.s[i] = i as u8;
        }

        let mut j: u8 = 0;
        for i in 0..256 {
            j = j.wrapping_add(self.s[i]).wrapping_add(key[i]);
            self.s.swap(i, j as usize);
        }

        self.i = 0;
        self.j = 0;
        self.is_init = true;

        let mut discard = [0u8; 256];
        self.fill_internal(&mut discard);
    }

    fn fill_internal(&mut self, buf: &mut [u8]) {
        for byte in buf.iter_mut() {
            self.i = self.i.wrapping_add(1);
            self.j = self.j.wrapping_add(self.s[self.i as usize]);
            self.s.swap(self.i as usize, self.j as usize);

            *byte =
                self.s[(self.s[self.i as usize].wrapping_add(self.s[self.j as usize])) as usize];
        }
    }

    /// Generate random bytes, auto-seeding on first use.
    pub fn fill(&mut self, buf: &mut [u8]) {
        if !self.is_init {
            self.auto_seed();
        }
        self.fill_internal(buf);
    }

    pub fn next_u32(&mut self) -> u32 {
        let mut buf = [0u8; 4];
        self.fill(&mut buf);
        u32::from_le_bytes(buf)
    }

    pub fn is_initialized(&self) -> bool {
        self.is_init
    }

    /// Forget the seed; the next draw reseeds from system entropy.
    pub fn reset(&mut self) {
        self.is_init = false;
    }
}

// ============================================================================
// Context-owned PRNG
// ============================================================================

/// The context's shared generator. State lives in a plain cell; every
/// access happens between `enter` and `leave` on the PRNG static mutex.
pub struct SharedPrng {
    mutex: Arc<dyn RawMutex>,
    state: UnsafeCell<Prng>,
}

// SAFETY: state is only touched under `mutex`.
unsafe impl Send for SharedPrng {}
unsafe impl Sync for SharedPrng {}

impl SharedPrng {
    pub fn new(mutex: Arc<dyn RawMutex>) -> Self {
        SharedPrng {
            mutex,
            state: UnsafeCell::new(Prng::new()),
        }
    }

    pub fn seed(&self, key: &[u8]) {
        self.mutex.enter();
        unsafe { (*self.state.get()).seed(key) };
        self.mutex.leave();
    }

    pub fn fill(&self, buf: &mut [u8]) {
        self.mutex.enter();
        unsafe { (*self.state.get()).fill(buf) };
        self.mutex.leave();
    }

    pub fn next_u32(&self) -> u32 {
        self.mutex.enter();
        let v = unsafe { (*self.state.get()).next_u32() };
        self.mutex.leave();
        v
    }

    pub fn reset(&self) {
        self.mutex.enter();
        unsafe { (*self.state.get()).reset() };
        self.mutex.leave();
    }
}

// ============================================================================
// Tests
// ============================================================================

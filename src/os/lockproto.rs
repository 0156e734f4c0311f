//! Byte-range locking protocol.
//!
//! Every file driver enforces the same five-level locking ladder over the
//! same three reserved byte offsets, so any two processes agreeing on these
//! constants can coordinate through the file itself. The driver supplies the
//! primitive range operations through [`RangeLock`]; the functions here drive
//! the state machine: which bytes are taken, in what order, and what survives
//! a failed transition.

use std::sync::atomic::{AtomicU32, Ordering};
use std::thread;
use std::time::Duration;

use crate::error::{Error, ErrorCode, Result};
use crate::os::vfs::LockLevel;

// ============================================================================
// Protocol Constants
// ============================================================================

/// Coordination byte, one past the 1 GiB boundary so ordinary database
/// content rarely maps a page over it.
pub const PENDING_BYTE: u64 = 0x4000_0000;
/// Byte marking an intent to write.
pub const RESERVED_BYTE: u64 = PENDING_BYTE + 1;
/// First byte of the shared-reader range.
pub const SHARED_FIRST: u64 = PENDING_BYTE + 2;
/// Width of the shared-reader range.
pub const SHARED_SIZE: u64 = 510;

/// Attempts made on the pending byte; it may be held by a reader about to
/// release it.
const PENDING_LOCK_ATTEMPTS: u32 = 3;
const PENDING_RETRY_DELAY: Duration = Duration::from_millis(1);

// ============================================================================
// Driver Interface
// ============================================================================

/// Flavor of a byte-range lock request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum RangeKind {
    /// Multiple holders may overlap.
    Shared,
    /// Sole holder of the range.
    Exclusive,
}

/// Primitive range-lock operations a file driver must supply.
///
/// `acquire` never blocks: a conflicting holder means `Err(Busy)` right
/// away, and any other error code means the underlying storage failed.
pub trait RangeLock {
    fn acquire(&self, offset: u64, len: u64, kind: RangeKind) -> Result<()>;
    fn release(&self, offset: u64, len: u64) -> Result<()>;

    /// Whether the backend supports genuinely shared range locks. Backends
    /// without them get a randomized single-byte substitute for the reader
    /// range.
    fn shared_ranges(&self) -> bool {
        true
    }

    /// Entropy for picking the single-byte reader slot.
    fn entropy32(&self) -> u32;
}

/// Per-handle lock bookkeeping, owned by the driver's file struct.
#[derive(Debug, Clone, Copy, Default)]
pub struct LockState {
    /// Level this handle currently holds.
    pub level: LockLevel,
    /// Reader byte held in single-byte mode, if any.
    pub shared_byte: Option<u16>,
}

/// Counter-based entropy for drivers; distinct per call, even across
/// threads sharing the cell.
pub(crate) fn counter_entropy(cell: &AtomicU32) -> u32 {
    let raw = cell
        .fetch_add(0x9e37_79b9, Ordering::Relaxed)
        .wrapping_add(0x9e37_79b9);
    let mut z = raw;
    z = (z ^ (z >> 16)).wrapping_mul(0x85eb_ca6b);
    z = (z ^ (z >> 13)).wrapping_mul(0xc2b2_ae35);
    z ^ (z >> 16)
}

// ============================================================================
// Read-lock helpers
// ============================================================================

fn get_read_lock<R: RangeLock + ?Sized>(range: &R, state: &mut LockState) -> Result<()> {
    if range.shared_ranges() {
        range.acquire(SHARED_FIRST, SHARED_SIZE, RangeKind::Shared)
    } else {
        let slot = (range.entropy32() & 0x7fff_ffff) % (SHARED_SIZE as u32 - 1);
        range.acquire(SHARED_FIRST + slot as u64, 1, RangeKind::Exclusive)?;
        state.shared_byte = Some(slot as u16);
        Ok(())
    }
}

fn release_read_lock<R: RangeLock + ?Sized>(range: &R, state: &mut LockState) -> Result<()> {
    match state.shared_byte.take() {
        None => range.release(SHARED_FIRST, SHARED_SIZE),
        Some(slot) => range.release(SHARED_FIRST + slot as u64, 1),
    }
}

// ============================================================================
// Protocol
// ============================================================================

/// Move a handle up the locking ladder to `target`.
///
/// A request at or below the current level is a no-op. On failure the error
/// is the driver's status (`Busy` for a conflict) and `state.level` records
/// whatever intermediate level was actually reached; in particular a failed
/// EXCLUSIVE upgrade from RESERVED persists at PENDING with the pending byte
/// held, so new readers stay shut out while the caller retries.
pub fn lock<R: RangeLock + ?Sized>(
    range: &R,
    state: &mut LockState,
    target: LockLevel,
) -> Result<()> {
    if state.level >= target {
        return Ok(());
    }

    debug_assert!(state.level != LockLevel::None || target == LockLevel::Shared);
    debug_assert!(target != LockLevel::Pending);
    debug_assert!(target != LockLevel::Reserved || state.level == LockLevel::Shared);

    let mut new_level = state.level;
    let mut got_pending = false;
    let mut outcome: Result<()> = Ok(());

    // The pending byte gates every fresh SHARED acquisition, and is the
    // first step of an EXCLUSIVE upgrade out of RESERVED. For a SHARED
    // request the hold is transient.
    if state.level == LockLevel::None
        || (target == LockLevel::Exclusive && state.level == LockLevel::Reserved)
    {
        let mut attempts = PENDING_LOCK_ATTEMPTS;
        loop {
            match range.acquire(PENDING_BYTE, 1, RangeKind::Exclusive) {
                Ok(()) => {
                    got_pending = true;
                    break;
                }
                Err(err) => {
                    attempts -= 1;
                    if attempts == 0 {
                        outcome = Err(err);
                        break;
                    }
                    thread::sleep(PENDING_RETRY_DELAY);
                }
            }
        }
    }

    if target == LockLevel::Shared && outcome.is_ok() {
        debug_assert!(state.level == LockLevel::None);
        match get_read_lock(range, state) {
            Ok(()) => new_level = LockLevel::Shared,
            Err(err) => outcome = Err(err),
        }
    }

    if target == LockLevel::Reserved && outcome.is_ok() {
        debug_assert!(state.level == LockLevel::Shared);
        match range.acquire(RESERVED_BYTE, 1, RangeKind::Exclusive) {
            Ok(()) => new_level = LockLevel::Reserved,
            Err(err) => outcome = Err(err),
        }
    }

    if target == LockLevel::Exclusive && outcome.is_ok() {
        // PENDING is reached the moment the pending byte is ours; from here
        // on that byte stays held even if the range grab below fails.
        new_level = LockLevel::Pending;
        got_pending = false;

        debug_assert!(state.level >= LockLevel::Shared);
        let _ = release_read_lock(range, state);
        match range.acquire(SHARED_FIRST, SHARED_SIZE, RangeKind::Exclusive) {
            Ok(()) => new_level = LockLevel::Exclusive,
            Err(err) => {
                outcome = Err(err);
                let _ = get_read_lock(range, state);
            }
        }
    }

    // Drop a transiently held pending byte whether or not the SHARED
    // acquisition worked.
    if got_pending && target == LockLevel::Shared {
        let _ = range.release(PENDING_BYTE, 1);
    }

    state.level = new_level;
    outcome
}

/// Move a handle down the locking ladder to `target`, which must be SHARED
/// or NONE. Release failures on individual bytes are ignored except for the
/// read lock that a downgrade to SHARED must get back.
pub fn unlock<R: RangeLock + ?Sized>(
    range: &R,
    state: &mut LockState,
    target: LockLevel,
) -> Result<()> {
    debug_assert!(target <= LockLevel::Shared);

    let held = state.level;
    let mut outcome: Result<()> = Ok(());

    if held >= LockLevel::Exclusive {
        let _ = range.release(SHARED_FIRST, SHARED_SIZE);
        if target == LockLevel::Shared {
            if let Err(err) = get_read_lock(range, state) {
                // A downgrade keeps readers alive; losing the read lock here
                // leaves the handle claiming SHARED without holding it.
                log::error!("could not reacquire read lock on downgrade: {err}");
                outcome = Err(Error::with_message(
                    ErrorCode::IoErr,
                    "unlock failed to reacquire read lock",
                ));
            }
        }
    }

    if held >= LockLevel::Reserved {
        let _ = range.release(RESERVED_BYTE, 1);
    }

    if target == LockLevel::None && held >= LockLevel::Shared {
        let _ = release_read_lock(range, state);
    }

    if held >= LockLevel::Pending {
        let _ = range.release(PENDING_BYTE, 1);
    }

    state.level = target;
    outcome
}

/// Report whether any handle, this one included, holds RESERVED on the file.
///
/// Checks the local level first, then probes the reserved byte. Only a
/// `Busy` probe means somebody else holds it; other errors are real I/O
/// failures and propagate.
pub fn check_reserved<R: RangeLock + ?Sized>(range: &R, state: &LockState) -> Result<bool> {
    if state.level >= LockLevel::Reserved {
        return Ok(true);
    }
    match range.acquire(RESERVED_BYTE, 1, RangeKind::Exclusive) {
        Ok(()) => {
            range.release(RESERVED_BYTE, 1)?;
            Ok(false)
        }
        Err(err) if err.code == ErrorCode::Busy => Ok(true),
        Err(err) => Err(err),
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    #[derive(Debug, Clone, PartialEq, Eq)]
    struct HeldRange {
        owner: usize,
        offset: u64,
        len: u64,
        kind: RangeKind,
    }

    /// Shared lock table standing in for the file; one handle per owner id.
    #[derive(Default)]
    struct LockBoard {
        held: Mutex<Vec<HeldRange>>,
    }

    impl LockBoard {
        fn handle(self: &Arc<Self>, owner: usize, shared_mode: bool, entropy: u32) -> BoardHandle {
            BoardHandle {
                board: Arc::clone(self),
                owner,
                shared_mode,
                entropy,
            }
        }

        /// Bytes held by one owner, sorted for assertion.
        fn owned(&self, owner: usize) -> Vec<(u64, u64, RangeKind)> {
            let mut out: Vec<_> = self
                .held
                .lock()
                .unwrap()
                .iter()
                .filter(|h| h.owner == owner)
                .map(|h| (h.offset, h.len, h.kind))
                .collect();
            out.sort();
            out
        }
    }

    struct BoardHandle {
        board: Arc<LockBoard>,
        owner: usize,
        shared_mode: bool,
        entropy: u32,
    }

    impl RangeLock for BoardHandle {
        fn acquire(&self, offset: u64, len: u64, kind: RangeKind) -> Result<()> {
            let mut held = self.board.held.lock().unwrap();
            let end = offset + len;
            for h in held.iter() {
                if h.owner == self.owner {
                    continue;
                }
                let overlaps = offset < h.offset + h.len && h.offset < end;
                if overlaps && (kind == RangeKind::Exclusive || h.kind == RangeKind::Exclusive) {
                    return Err(Error::new(ErrorCode::Busy));
                }
            }
            held.push(HeldRange {
                owner: self.owner,
                offset,
                len,
                kind,
            });
            Ok(())
        }

        fn release(&self, offset: u64, len: u64) -> Result<()> {
            let mut held = self.board.held.lock().unwrap();
            let before = held.len();
            held.retain(|h| !(h.owner == self.owner && h.offset == offset && h.len == len));
            if held.len() == before {
                return Err(Error::new(ErrorCode::Busy));
            }
            Ok(())
        }

        fn shared_ranges(&self) -> bool {
            self.shared_mode
        }

        fn entropy32(&self) -> u32 {
            self.entropy
        }
    }

    #[test]
    fn test_ladder_shared_range_mode() {
        let board = Arc::new(LockBoard::default());
        let h = board.handle(1, true, 0);
        let mut st = LockState::default();

        lock(&h, &mut st, LockLevel::Shared).unwrap();
        assert_eq!(st.level, LockLevel::Shared);
        assert_eq!(
            board.owned(1),
            vec![(SHARED_FIRST, SHARED_SIZE, RangeKind::Shared)]
        );

        lock(&h, &mut st, LockLevel::Reserved).unwrap();
        assert_eq!(st.level, LockLevel::Reserved);
        assert_eq!(
            board.owned(1),
            vec![
                (RESERVED_BYTE, 1, RangeKind::Exclusive),
                (SHARED_FIRST, SHARED_SIZE, RangeKind::Shared),
            ]
        );

        lock(&h, &mut st, LockLevel::Exclusive).unwrap();
        assert_eq!(st.level, LockLevel::Exclusive);
        assert_eq!(
            board.owned(1),
            vec![
                (PENDING_BYTE, 1, RangeKind::Exclusive),
                (RESERVED_BYTE, 1, RangeKind::Exclusive),
                (SHARED_FIRST, SHARED_SIZE, RangeKind::Exclusive),
            ]
        );

        unlock(&h, &mut st, LockLevel::Shared).unwrap();
        assert_eq!(st.level, LockLevel::Shared);
        assert_eq!(
            board.owned(1),
            vec![(SHARED_FIRST, SHARED_SIZE, RangeKind::Shared)]
        );

        unlock(&h, &mut st, LockLevel::None).unwrap();
        assert_eq!(st.level, LockLevel::None);
        assert!(board.owned(1).is_empty());
    }

    #[test]
    fn test_ladder_single_byte_mode() {
        let board = Arc::new(LockBoard::default());
        let entropy = 0x9e37_79b9;
        let h = board.handle(1, false, entropy);
        let mut st = LockState::default();

        let slot = (entropy & 0x7fff_ffff) % (SHARED_SIZE as u32 - 1);
        let slot_byte = SHARED_FIRST + slot as u64;

        lock(&h, &mut st, LockLevel::Shared).unwrap();
        assert_eq!(st.shared_byte, Some(slot as u16));
        assert_eq!(board.owned(1), vec![(slot_byte, 1, RangeKind::Exclusive)]);

        lock(&h, &mut st, LockLevel::Reserved).unwrap();
        lock(&h, &mut st, LockLevel::Exclusive).unwrap();
        assert_eq!(st.level, LockLevel::Exclusive);
        // the single reader byte is traded for the whole range
        assert_eq!(st.shared_byte, None);
        assert_eq!(
            board.owned(1),
            vec![
                (PENDING_BYTE, 1, RangeKind::Exclusive),
                (RESERVED_BYTE, 1, RangeKind::Exclusive),
                (SHARED_FIRST, SHARED_SIZE, RangeKind::Exclusive),
            ]
        );

        unlock(&h, &mut st, LockLevel::None).unwrap();
        assert!(board.owned(1).is_empty());
        assert_eq!(st.shared_byte, None);
    }

    #[test]
    fn test_lock_at_or_below_level_is_noop() {
        let board = Arc::new(LockBoard::default());
        let h = board.handle(1, true, 0);
        let mut st = LockState::default();

        lock(&h, &mut st, LockLevel::Shared).unwrap();
        let snapshot = board.owned(1);
        lock(&h, &mut st, LockLevel::Shared).unwrap();
        assert_eq!(board.owned(1), snapshot);

        lock(&h, &mut st, LockLevel::Reserved).unwrap();
        lock(&h, &mut st, LockLevel::Shared).unwrap();
        assert_eq!(st.level, LockLevel::Reserved);
    }

    #[test]
    fn test_failed_shared_releases_transient_pending() {
        let board = Arc::new(LockBoard::default());
        let blocker = board.handle(2, true, 0);
        // another handle owns the reader range outright
        blocker
            .acquire(SHARED_FIRST, SHARED_SIZE, RangeKind::Exclusive)
            .unwrap();

        let h = board.handle(1, true, 0);
        let mut st = LockState::default();
        let err = lock(&h, &mut st, LockLevel::Shared).unwrap_err();
        assert_eq!(err.code, ErrorCode::Busy);
        assert_eq!(st.level, LockLevel::None);
        assert!(board.owned(1).is_empty());
    }

    #[test]
    fn test_pending_byte_contention_retries_then_busy() {
        let board = Arc::new(LockBoard::default());
        let blocker = board.handle(2, true, 0);
        blocker.acquire(PENDING_BYTE, 1, RangeKind::Exclusive).unwrap();

        let h = board.handle(1, true, 0);
        let mut st = LockState::default();
        let start = std::time::Instant::now();
        let err = lock(&h, &mut st, LockLevel::Shared).unwrap_err();
        assert_eq!(err.code, ErrorCode::Busy);
        // two pauses between the three attempts
        assert!(start.elapsed() >= Duration::from_millis(2));
        assert_eq!(st.level, LockLevel::None);
        assert!(board.owned(1).is_empty());
    }

    #[test]
    fn test_reserved_is_single_holder() {
        let board = Arc::new(LockBoard::default());
        let a = board.handle(1, true, 0);
        let b = board.handle(2, true, 0);
        let mut st_a = LockState::default();
        let mut st_b = LockState::default();

        lock(&a, &mut st_a, LockLevel::Shared).unwrap();
        lock(&a, &mut st_a, LockLevel::Reserved).unwrap();
        lock(&b, &mut st_b, LockLevel::Shared).unwrap();

        let before = board.owned(2);
        let err = lock(&b, &mut st_b, LockLevel::Reserved).unwrap_err();
        assert_eq!(err.code, ErrorCode::Busy);
        assert_eq!(st_b.level, LockLevel::Shared);
        assert_eq!(board.owned(2), before);

        assert!(check_reserved(&b, &st_b).unwrap());
        assert!(check_reserved(&a, &st_a).unwrap());

        unlock(&a, &mut st_a, LockLevel::Shared).unwrap();
        assert!(!check_reserved(&b, &st_b).unwrap());
        lock(&b, &mut st_b, LockLevel::Reserved).unwrap();
        assert_eq!(st_b.level, LockLevel::Reserved);
    }

    #[test]
    fn test_exclusive_blocked_by_reader_until_release() {
        let board = Arc::new(LockBoard::default());
        let a = board.handle(1, true, 0);
        let b = board.handle(2, true, 0);
        let mut st_a = LockState::default();
        let mut st_b = LockState::default();

        lock(&b, &mut st_b, LockLevel::Shared).unwrap();
        lock(&a, &mut st_a, LockLevel::Shared).unwrap();

        let err = lock(&a, &mut st_a, LockLevel::Exclusive).unwrap_err();
        assert_eq!(err.code, ErrorCode::Busy);
        // the attempt parks at PENDING and keeps its read lock
        assert_eq!(st_a.level, LockLevel::Pending);
        assert_eq!(
            board.owned(1),
            vec![(SHARED_FIRST, SHARED_SIZE, RangeKind::Shared)]
        );

        let err = lock(&a, &mut st_a, LockLevel::Exclusive).unwrap_err();
        assert_eq!(err.code, ErrorCode::Busy);

        unlock(&b, &mut st_b, LockLevel::None).unwrap();
        lock(&a, &mut st_a, LockLevel::Exclusive).unwrap();
        assert_eq!(st_a.level, LockLevel::Exclusive);

        unlock(&a, &mut st_a, LockLevel::None).unwrap();
        assert!(board.owned(1).is_empty());
    }

    #[test]
    fn test_exclusive_from_reserved_parks_at_pending_with_byte_held() {
        let board = Arc::new(LockBoard::default());
        let a = board.handle(1, true, 0);
        let b = board.handle(2, true, 0);
        let mut st_a = LockState::default();
        let mut st_b = LockState::default();

        lock(&a, &mut st_a, LockLevel::Shared).unwrap();
        lock(&a, &mut st_a, LockLevel::Reserved).unwrap();
        lock(&b, &mut st_b, LockLevel::Shared).unwrap();

        let err = lock(&a, &mut st_a, LockLevel::Exclusive).unwrap_err();
        assert_eq!(err.code, ErrorCode::Busy);
        assert_eq!(st_a.level, LockLevel::Pending);
        // pending byte held: new readers are shut out while a retries
        assert_eq!(
            board.owned(1),
            vec![
                (PENDING_BYTE, 1, RangeKind::Exclusive),
                (RESERVED_BYTE, 1, RangeKind::Exclusive),
                (SHARED_FIRST, SHARED_SIZE, RangeKind::Shared),
            ]
        );

        let c = board.handle(3, true, 0);
        let mut st_c = LockState::default();
        let err = lock(&c, &mut st_c, LockLevel::Shared).unwrap_err();
        assert_eq!(err.code, ErrorCode::Busy);

        unlock(&b, &mut st_b, LockLevel::None).unwrap();
        lock(&a, &mut st_a, LockLevel::Exclusive).unwrap();
        assert_eq!(st_a.level, LockLevel::Exclusive);

        unlock(&a, &mut st_a, LockLevel::None).unwrap();
        assert!(board.owned(1).is_empty());
    }

    #[test]
    fn test_check_reserved_probe_does_not_leak() {
        let board = Arc::new(LockBoard::default());
        let h = board.handle(1, true, 0);
        let st = LockState::default();

        assert!(!check_reserved(&h, &st).unwrap());
        assert!(board.owned(1).is_empty());
    }
}

//! Cross-thread exclusive-access coordination (`spec.md` §3
//! `ExclusiveMonitor`).
//!
//! The only object shared across façades (`spec.md` §5): implements ARM's
//! load-exclusive/store-exclusive semantics for however many emulated
//! processors share it. Guarded by a single lock held only for the duration
//! of the granule-masked bookkeeping, mirroring the spin lock the original
//! implementation uses around the same critical sections.

use parking_lot::Mutex;

use crate::error::{Error, Result};

/// Guest virtual address.
pub type VAddr = u64;

/// Exclusive-reservation granule: addresses are masked to this before
/// comparison, matching ARM's reservation-granule semantics.
const RESERVATION_GRANULE_MASK: VAddr = !0xF;

const INVALID_EXCLUSIVE_ADDRESS: VAddr = 1; // never a valid masked address's low bit pattern under the mask above, and distinct from 0.

#[derive(Clone, Copy)]
struct Reservation {
    address: VAddr,
    value: [u8; 16],
}

struct State {
    reservations: Vec<Reservation>,
}

/// Process-wide exclusive monitor shared by every emulated processor that
/// participates in the same coherency domain (`spec.md` §5).
pub struct ExclusiveMonitor {
    state: Mutex<State>,
    processor_count: usize,
}

impl ExclusiveMonitor {
    /// `processor_count` is the maximum number of processors that may use
    /// this monitor; each must have a unique id in `0..processor_count`.
    #[must_use]
    pub fn new(processor_count: usize) -> Self {
        ExclusiveMonitor {
            state: Mutex::new(State {
                reservations: vec![
                    Reservation {
                        address: INVALID_EXCLUSIVE_ADDRESS,
                        value: [0; 16],
                    };
                    processor_count
                ],
            }),
            processor_count,
        }
    }

    #[must_use]
    pub fn processor_count(&self) -> usize {
        self.processor_count
    }

    fn check_id(&self, processor_id: usize) -> Result<()> {
        if processor_id >= self.processor_count {
            return Err(Error::ProcessorIdOutOfRange {
                processor_id,
                processor_count: self.processor_count,
            });
        }
        Ok(())
    }

    /// Load-exclusive: marks `[address, address+size)` (rounded to the
    /// reservation granule) as exclusive to `processor_id`, records the
    /// loaded value, and returns it.
    ///
    /// `T` must be a plain-old-data type no larger than 16 bytes (the
    /// widest ARM exclusive access).
    pub fn read_and_mark<T: Copy>(
        &self,
        processor_id: usize,
        address: VAddr,
        load: impl FnOnce() -> T,
    ) -> Result<T> {
        self.check_id(processor_id)?;
        assert!(std::mem::size_of::<T>() <= 16);
        let masked = address & RESERVATION_GRANULE_MASK;

        let mut state = self.state.lock();
        let value = load();
        let mut bytes = [0u8; 16];
        // SAFETY: `T` is `Copy` (plain-old-data) and no larger than 16 bytes,
        // asserted above.
        unsafe {
            std::ptr::copy_nonoverlapping(
                (&value as *const T).cast::<u8>(),
                bytes.as_mut_ptr(),
                std::mem::size_of::<T>(),
            );
        }
        state.reservations[processor_id] = Reservation {
            address: masked,
            value: bytes,
        };
        Ok(value)
    }

    /// Store-exclusive: if `processor_id` still holds the reservation for
    /// `address`, clears that reservation (and any other processor's
    /// reservation over the same granule), runs `op` with the value that
    /// was recorded at load-exclusive time, and returns `op`'s result.
    /// Returns `Ok(None)` (store not performed) if the reservation had
    /// already been lost.
    pub fn do_exclusive_operation<T: Copy, R>(
        &self,
        processor_id: usize,
        address: VAddr,
        op: impl FnOnce(T) -> R,
    ) -> Result<Option<R>> {
        self.check_id(processor_id)?;
        assert!(std::mem::size_of::<T>() <= 16);
        let masked = address & RESERVATION_GRANULE_MASK;

        let mut state = self.state.lock();
        if state.reservations[processor_id].address != masked {
            return Ok(None);
        }
        for other in &mut state.reservations {
            if other.address == masked {
                other.address = INVALID_EXCLUSIVE_ADDRESS;
            }
        }
        let bytes = state.reservations[processor_id].value;
        drop(state);

        let mut value = std::mem::MaybeUninit::<T>::uninit();
        // SAFETY: `bytes` was populated from a `T` of the same size in
        // `read_and_mark`.
        unsafe {
            std::ptr::copy_nonoverlapping(
                bytes.as_ptr(),
                value.as_mut_ptr().cast::<u8>(),
                std::mem::size_of::<T>(),
            );
        }
        // SAFETY: initialized by the copy above.
        let value = unsafe { value.assume_init() };
        Ok(Some(op(value)))
    }

    /// Clear every processor's reservation (e.g. on a full cache clear or
    /// guest reset).
    pub fn clear(&self) {
        let mut state = self.state.lock();
        for r in &mut state.reservations {
            r.address = INVALID_EXCLUSIVE_ADDRESS;
        }
    }

    /// Clear a single processor's reservation (e.g. on context switch).
    pub fn clear_processor(&self, processor_id: usize) -> Result<()> {
        self.check_id(processor_id)?;
        self.state.lock().reservations[processor_id].address = INVALID_EXCLUSIVE_ADDRESS;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::{Arc, Barrier};
    use std::thread;

    #[test]
    fn uncontended_round_trip_succeeds() {
        let monitor = ExclusiveMonitor::new(2);
        let storage = AtomicU32::new(10);

        let loaded = monitor
            .read_and_mark::<u32>(0, 0x1000, || storage.load(Ordering::SeqCst))
            .unwrap();
        assert_eq!(loaded, 10);

        let result = monitor
            .do_exclusive_operation::<u32, u32>(0, 0x1000, |old| {
                storage.store(old + 1, Ordering::SeqCst);
                old + 1
            })
            .unwrap();
        assert_eq!(result, Some(11));
        assert_eq!(storage.load(Ordering::SeqCst), 11);
    }

    #[test]
    fn store_exclusive_fails_after_reservation_lost() {
        let monitor = ExclusiveMonitor::new(2);
        monitor.read_and_mark::<u32>(0, 0x2000, || 5).unwrap();
        // Processor 1 touches the same granule, clearing processor 0's
        // reservation.
        monitor.read_and_mark::<u32>(1, 0x2000, || 5).unwrap();

        let result = monitor
            .do_exclusive_operation::<u32, u32>(0, 0x2000, |old| old + 1)
            .unwrap();
        assert_eq!(result, None);
    }

    #[test]
    fn concurrent_increment_is_exactly_one_success() {
        // S3 from spec.md: two processors race LDREX/ADD/STREX on the same
        // address; exactly one STREX succeeds, and the stored value is
        // initial + 1, not + 2.
        let monitor = Arc::new(ExclusiveMonitor::new(2));
        let storage = Arc::new(AtomicU32::new(0));
        let barrier = Arc::new(Barrier::new(2));

        let run = |processor_id: usize| {
            let monitor = Arc::clone(&monitor);
            let storage = Arc::clone(&storage);
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                let old = monitor
                    .read_and_mark::<u32>(processor_id, 0x3000, || storage.load(Ordering::SeqCst))
                    .unwrap();
                barrier.wait();
                monitor
                    .do_exclusive_operation::<u32, ()>(processor_id, 0x3000, |_| {
                        storage.store(old + 1, Ordering::SeqCst);
                    })
                    .unwrap()
                    .is_some()
            })
        };

        let h0 = run(0);
        let h1 = run(1);
        let success0 = h0.join().unwrap();
        let success1 = h1.join().unwrap();

        assert_ne!(success0, success1, "exactly one STREX must succeed");
        assert_eq!(storage.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn out_of_range_processor_id_errors() {
        let monitor = ExclusiveMonitor::new(1);
        assert!(monitor.read_and_mark::<u32>(5, 0x1000, || 0).is_err());
    }
}

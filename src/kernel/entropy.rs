//! Ambient random source for handlers.
//!
//! The source is per thread, not process-wide: [`reseed`] only affects
//! draws made on the calling thread, and other threads keep their own
//! generators. Dispatch is synchronous, so a handler always draws on the
//! thread that called `dispatch` and sees the seed that call applied.
//!
//! Each thread's source starts from OS entropy and only becomes
//! deterministic through an explicit [`reseed`], which the dispatcher
//! performs when a payload carries a `seed`.

use std::cell::RefCell;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

thread_local! {
    static SOURCE: RefCell<Option<StdRng>> = const { RefCell::new(None) };
}

/// Reset the source to a deterministic state.
pub fn reseed(seed: u64) {
    SOURCE.with(|cell| {
        *cell.borrow_mut() = Some(StdRng::seed_from_u64(seed));
    });
}

/// Run `f` with the ambient generator.
pub fn with_rng<T>(f: impl FnOnce(&mut StdRng) -> T) -> T {
    SOURCE.with(|cell| {
        let mut slot = cell.borrow_mut();
        let rng = slot.get_or_insert_with(StdRng::from_entropy);
        f(rng)
    })
}

/// Next random `u64` from the ambient source.
pub fn next_u64() -> u64 {
    with_rng(|rng| rng.gen())
}

//! Sleep primitive for the RF link's bit-banging loop. A thin re-export
//! rather than a direct `std::thread::sleep` call at the site, so a future
//! bare-metal target can swap in a busy-wait timer without touching the
//! transport code.
pub use std::thread::sleep;

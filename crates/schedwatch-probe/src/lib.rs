#![doc = "Scheduling-latency probe: clock, steal-time sources, and the measurement loop."]

pub mod clock;
pub mod control;
pub mod guestlib;
pub mod probe;
pub mod realtime;
pub mod stats;
pub mod steal;

pub use clock::*;
pub use control::*;
pub use guestlib::{GuestApi, GuestLibError, GuestLibStealSource, VmGuestLib};
pub use probe::*;
pub use realtime::*;
pub use stats::*;
pub use steal::*;

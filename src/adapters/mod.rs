//! Platform adapters implementing the port traits.
//!
//! Only the host simulation lives in-tree: real transceiver and RTC
//! adapters belong to the board support package of the target platform.

pub mod sim;

pub use sim::{SimClock, SimMedium, SimRadio};

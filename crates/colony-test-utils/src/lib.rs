//! Mocks, a controllable clock, and fixture builders shared by the Colony
//! crates' tests.

mod clock;
mod fixtures;
mod invoker;

pub use clock::ManualClock;
pub use fixtures::*;
pub use invoker::{InvocationRecord, MockInvoker};

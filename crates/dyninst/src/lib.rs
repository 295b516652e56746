#![forbid(unsafe_code)]

pub mod clock;
pub mod debounce;
pub mod discovery;
pub mod domain;
pub mod error;
pub mod ratelimit;
pub mod upload;

pub use clock::{BootTimeClock, TickClock};
pub use debounce::{ConfigFragment, Debouncer, ProcessUpdate};
pub use discovery::{ProcessSource, ProcfsSource, ScanReport, Scanner};
pub use error::Error;
pub use ratelimit::{LogLimiter, TokenBucket};
pub use upload::{Batcher, Sender};

pub mod emulator;
pub mod retry;
pub mod transport;
pub mod wire;

pub use emulator::{Emulator, EmulatorOptions, Method};
pub use retry::{Backoff, Retryer};
pub use transport::{DataTransport, ResponseStream};

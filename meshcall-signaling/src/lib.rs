pub mod channel;
pub mod error;
#[cfg(feature = "test-utils")]
pub mod test_utils;
pub mod transport;

pub use meshcall_protocol as protocol;

//
// In-guest emulation of the Linux io_uring file object: shared-memory
// ring pair, guest-address-space mapping, and the submission processing
// engine, for a sandboxed user-space kernel.
//
// Reference:
// kernel.dk/io_uring.pdf
// git://git.kernel.dk/liburing
//

pub mod abi;
pub mod engine;
pub mod error;
pub mod file;
pub mod mapping;
pub mod platform;
pub mod region;
pub mod view;

mod opcodes;

pub use abi::RingParams;
pub use error::Error;
pub use file::IoUringFile;

//
// Error taxonomy for the io_uring file object (spec §7).
//
// Per-SQE failures never surface here: they are delivered as a negative
// `res` in a CQE (see `opcodes.rs`). This enum covers setup errors, mapping
// errors, and engine interruption, all of which DO propagate as the
// operation's error.
//

use std::io;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("invalid argument")]
    Invalid,
    #[error("arithmetic overflow computing ring layout")]
    Overflow,
    #[error("no memory available for ring allocation")]
    NoMemory,
    #[error("operation interrupted")]
    Interrupted,
    #[error("bad file descriptor")]
    BadFd,
    #[error("bad address")]
    Fault,
}

impl Error {
    /// Negated errno suitable for a CQE `res` field or a setup-error
    /// return path. Positive errno values are negated so they fit the
    /// signed `res`/return convention used throughout.
    pub fn to_negated_errno(&self) -> i32 {
        let errno = match self {
            Error::Invalid => libc::EINVAL,
            Error::Overflow => libc::EOVERFLOW,
            Error::NoMemory => libc::ENOMEM,
            Error::Interrupted => libc::EINTR,
            Error::BadFd => libc::EBADF,
            Error::Fault => libc::EFAULT,
        };
        -errno
    }
}

impl From<Error> for io::Error {
    fn from(e: Error) -> io::Error {
        let errno = match e {
            Error::Invalid => libc::EINVAL,
            Error::Overflow => libc::EOVERFLOW,
            Error::NoMemory => libc::ENOMEM,
            Error::Interrupted => libc::EINTR,
            Error::BadFd => libc::EBADF,
            Error::Fault => libc::EFAULT,
        };
        io::Error::from_raw_os_error(errno)
    }
}

/// Converts any positive errno returned by a host operation (e.g. a real
/// `read_at` failing with an `io::Error` carrying an OS errno) into the
/// negated form a CQE `res` expects. Errors without a raw OS errno map to
/// EIO's negative, matching how the reference kernel surfaces unexpected
/// failures from the underlying file object.
pub fn negate_io_error(e: &io::Error) -> i32 {
    match e.raw_os_error() {
        Some(errno) if errno > 0 => -errno,
        _ => -libc::EIO,
    }
}

//
// Opcode Handlers (spec §4.F): the minimal supported set. Each handler
// returns the `res` value for the CQE; negative values are already
// negated errno.
//

use crate::abi::{Sqe, IORING_OP_NOP, IORING_OP_READV, IORING_OP_WRITEV};
use crate::error::{negate_io_error, Error};
use crate::platform::{AddressSpace, FdTable, GuestFile, Task};

/// Upper bound on a single iovec's length. Guards the per-iovec read buffer
/// allocation below against a guest-controlled `iov_len`; real `preadv`
/// callers are bounded by actual memory, which this in-process emulator
/// does not otherwise enforce.
const MAX_IOV_LEN: u64 = 16 * 1024 * 1024;

/// Dispatches one SQE and returns its `res`. Never fails itself: every
/// error path is already folded into a negated-errno `res`, per spec §7
/// ("per-SQE errors are never propagated as the operation's error").
pub fn dispatch(sqe: &Sqe, task: &dyn Task) -> i32 {
    match sqe.opcode {
        IORING_OP_NOP => nop(sqe),
        IORING_OP_READV => readv(sqe, task),
        IORING_OP_WRITEV => writev(sqe),
        _ => -libc::EINVAL,
    }
}

fn nop(_sqe: &Sqe) -> i32 {
    0
}

/// Validates the parts of an SQE this core's READV/WRITEV handlers share:
/// no flags, no seeking (offset field reused as a command/splice field
/// elsewhere in the full ABI, unsupported here), no ioprio.
fn validate_rw(sqe: &Sqe) -> Result<(), Error> {
    if sqe.fd < 0 {
        return Err(Error::BadFd);
    }
    if sqe.flags != 0 {
        return Err(Error::Invalid);
    }
    if sqe.off != 0 {
        return Err(Error::Invalid);
    }
    if sqe.ioprio != 0 {
        return Err(Error::Invalid);
    }
    Ok(())
}

fn readv(sqe: &Sqe, task: &dyn Task) -> i32 {
    if let Err(e) = validate_rw(sqe) {
        return e.to_negated_errno();
    }

    let file = match task.fd_table().get(sqe.fd) {
        Some(f) => f,
        None => return -libc::EBADF,
    };

    // `addr` points at a guest iovec array of `len` entries. Entries are
    // read and concatenated in order, stopping at the first short read
    // (including EOF), matching a real positional readv.
    let iov_count = (sqe.len as usize).min(1024);
    let mut total_read = 0usize;
    let mut iov_addr = sqe.addr;
    // Offset into the file, starting at 0 (seeking is rejected above) and
    // advancing across iovecs within this single call, matching preadv2.
    let mut file_offset = 0u64;

    // Once any byte has been transferred, a later per-iovec failure reports
    // the partial count instead of the error, matching a real readv/preadv2:
    // an error only surfaces as `res` when iovec 0 itself fails.
    let partial = |total_read: usize| i32::try_from(total_read).unwrap_or(i32::MAX);

    for _ in 0..iov_count {
        let mut iov_bytes = [0u8; 16]; // { iov_base: u64, iov_len: u64 }
        if let Err(e) = task.address_space().copy_in(iov_addr, &mut iov_bytes) {
            return if total_read > 0 { partial(total_read) } else { negate_io_error(&e) };
        }
        let iov_base = u64::from_ne_bytes(iov_bytes[0..8].try_into().unwrap());
        let iov_len_raw = u64::from_ne_bytes(iov_bytes[8..16].try_into().unwrap());
        if iov_len_raw > MAX_IOV_LEN {
            return if total_read > 0 { partial(total_read) } else { Error::Invalid.to_negated_errno() };
        }
        let iov_len = iov_len_raw as usize;

        let mut buf = vec![0u8; iov_len];
        let n = match file.read_at(&mut buf, file_offset) {
            Ok(n) => n,
            Err(e) => return if total_read > 0 { partial(total_read) } else { negate_io_error(&e) },
        };
        if n > 0 {
            if let Err(e) = task.address_space().copy_out(iov_base, &buf[..n]) {
                return if total_read > 0 { partial(total_read) } else { negate_io_error(&e) };
            }
        }
        total_read += n;
        file_offset += n as u64;
        if n < iov_len {
            // Short read (including EOF): stop, matching a real readv.
            break;
        }
        iov_addr += 16;
    }

    partial(total_read)
}

/// WRITEV is out of scope (spec §9 open question: the reference source
/// only has a diagnostic stub here). Always rejected.
fn writev(_sqe: &Sqe) -> i32 {
    -libc::EINVAL
}

//
// Integration tests exercising the io_uring file object end to end
// through its public API, covering the concrete scenarios of spec §8.
//

use std::sync::atomic::Ordering;
use std::sync::{Arc, Once};

use uring_emu::abi::{
    header_offset, Cqe, Sqe, IORING_OP_NOP, IORING_OP_READV, IORING_OP_WRITEV, MAX_CQ_ENTRIES,
};
use uring_emu::platform::fake::{FakeFile, FakeMemoryFile, FakeTask};
use uring_emu::platform::MemoryFile;
use uring_emu::{Error, IoUringFile, RingParams};

const PAGE: usize = 4096;

static LOG_INIT: Once = Once::new();

/// Initializes `env_logger` once per test binary so `debug!`/`warn!`
/// output from the engine (remap, CQ overflow, interrupt paths) is
/// visible when tests are run with `RUST_LOG=debug -- --nocapture`.
fn init_logging() {
    LOG_INIT.call_once(|| {
        let _ = env_logger::builder().is_test(true).try_init();
    });
}

fn new_memfile() -> Arc<dyn MemoryFile> {
    Arc::new(FakeMemoryFile)
}

fn push_sqe(file: &IoUringFile, sqe: Sqe) {
    let rings = file.guest_rings_view();
    let sqes = file.guest_sqes_view();
    let layout = file.layout();

    let sq_tail = rings.load_u32(header_offset::SQ_TAIL as usize, Ordering::Acquire);
    let sq_mask = file.sq_entries() - 1;
    let idx = (sq_tail & sq_mask) as usize;

    let array_off = layout.sq_array_off as usize + idx * std::mem::size_of::<u32>();
    rings.store_u32(array_off, sq_tail & sq_mask, Ordering::Relaxed);
    sqes.write_struct(idx * std::mem::size_of::<Sqe>(), &sqe);
    rings.store_u32(header_offset::SQ_TAIL as usize, sq_tail.wrapping_add(1), Ordering::Release);
}

fn nop_sqe(user_data: u64) -> Sqe {
    Sqe {
        opcode: IORING_OP_NOP,
        flags: 0,
        ioprio: 0,
        fd: 0,
        off: 0,
        addr: 0,
        len: 0,
        rw_flags: 0,
        user_data,
        buf_index: 0,
        personality: 0,
        _pad: [0; 2],
    }
}

fn read_cqe(file: &IoUringFile, slot: u32) -> Cqe {
    let rings = file.guest_rings_view();
    let cq_off = file.layout().cq_off;
    let cq_mask = file.cq_entries() - 1;
    let off = cq_off.cqes as usize + (slot & cq_mask) as usize * std::mem::size_of::<Cqe>();
    rings.read_struct(off)
}

#[test]
fn scenario_1_entries_rounded_to_power_of_two() {
    init_logging();
    let memfile = new_memfile();
    let (file, params) = IoUringFile::new_ring(&memfile, 5, RingParams::default(), PAGE).unwrap();
    assert_eq!(params.sq_entries, 8);
    assert_eq!(params.cq_entries, 16);
    assert_eq!(file.sq_entries(), 8);
    assert_eq!(file.cq_entries(), 16);

    // The SQ index array sits cache-line-aligned right after the CQE array.
    let cqes_end = params.cq_off.cqes as usize + params.cq_entries as usize * std::mem::size_of::<Cqe>();
    assert!(params.sq_off.array as usize >= cqes_end);
    assert_eq!(params.sq_off.array as usize % uring_emu::abi::CACHELINE, 0);
}

#[test]
fn scenario_2_cqsize_smaller_than_sq_is_invalid() {
    init_logging();
    let memfile = new_memfile();
    let mut params = RingParams::default();
    params.flags = uring_emu::abi::SetupFlags::CQSIZE.bits();
    params.cq_entries = 4;
    let err = IoUringFile::new_ring(&memfile, 8, params, PAGE).unwrap_err();
    assert!(matches!(err, Error::Invalid));
}

#[test]
fn cqsize_above_max_is_invalid() {
    init_logging();
    let memfile = new_memfile();
    let mut params = RingParams::default();
    params.flags = uring_emu::abi::SetupFlags::CQSIZE.bits();
    params.cq_entries = MAX_CQ_ENTRIES + 1;
    let err = IoUringFile::new_ring(&memfile, 8, params, PAGE).unwrap_err();
    assert!(matches!(err, Error::Invalid));
}

#[test]
fn zero_entries_is_invalid() {
    init_logging();
    let memfile = new_memfile();
    let err = IoUringFile::new_ring(&memfile, 0, RingParams::default(), PAGE).unwrap_err();
    assert!(matches!(err, Error::Invalid));
}

#[test]
fn scenario_3_single_nop_roundtrip() {
    init_logging();
    let memfile = new_memfile();
    let (file, _params) = IoUringFile::new_ring(&memfile, 8, RingParams::default(), PAGE).unwrap();
    let task = FakeTask::new();

    push_sqe(&file, nop_sqe(0xDEAD_BEEF));
    let (submitted, err) = file.process_submissions(&task, 1, 0, 0);
    assert_eq!(submitted, 1);
    assert!(err.is_none());

    let cqe = read_cqe(&file, 0);
    assert_eq!(cqe.user_data, 0xDEAD_BEEF);
    assert_eq!(cqe.res, 0);

    let rings = file.guest_rings_view();
    assert_eq!(rings.load_u32(header_offset::CQ_TAIL as usize, Ordering::Acquire), 1);
}

#[test]
fn scenario_4_cq_overflow_drops_second_cqe() {
    init_logging();
    let memfile = new_memfile();
    let mut params = RingParams::default();
    params.flags = uring_emu::abi::SetupFlags::CQSIZE.bits();
    params.cq_entries = 1;
    let (file, params) = IoUringFile::new_ring(&memfile, 1, params, PAGE).unwrap();
    assert_eq!(params.sq_entries, 1);
    assert_eq!(params.cq_entries, 1);

    let task = FakeTask::new();

    push_sqe(&file, nop_sqe(1));
    let (submitted, _) = file.process_submissions(&task, 1, 0, 0);
    assert_eq!(submitted, 1);

    // Guest never advances cq_head, so the single CQ slot is still full.
    push_sqe(&file, nop_sqe(2));
    let (submitted, _) = file.process_submissions(&task, 1, 0, 0);
    assert_eq!(submitted, 1);

    let rings = file.guest_rings_view();
    assert_eq!(rings.load_u32(header_offset::CQ_OVERFLOW as usize, Ordering::Acquire), 1);
    assert_eq!(rings.load_u32(header_offset::CQ_TAIL as usize, Ordering::Acquire), 1);
    // The first CQE is still the one from the first submission.
    assert_eq!(read_cqe(&file, 0).user_data, 1);
}

#[test]
fn scenario_5_readv_bad_fd_leaves_file_state_unchanged() {
    init_logging();
    let memfile = new_memfile();
    let (file, _) = IoUringFile::new_ring(&memfile, 8, RingParams::default(), PAGE).unwrap();
    let mut task = FakeTask::new();
    task.fds_mut().insert(5, Arc::new(FakeFile::new(vec![9, 9, 9])));

    let mut sqe = nop_sqe(42);
    sqe.opcode = IORING_OP_READV;
    sqe.fd = -1;
    push_sqe(&file, sqe);

    let (submitted, err) = file.process_submissions(&task, 1, 0, 0);
    assert_eq!(submitted, 1);
    assert!(err.is_none());

    let cqe = read_cqe(&file, 0);
    assert_eq!(cqe.user_data, 42);
    assert_eq!(cqe.res, -libc::EBADF);
}

#[test]
fn writev_is_rejected_as_unsupported() {
    init_logging();
    let memfile = new_memfile();
    let (file, _) = IoUringFile::new_ring(&memfile, 8, RingParams::default(), PAGE).unwrap();
    let task = FakeTask::new();

    let mut sqe = nop_sqe(7);
    sqe.opcode = IORING_OP_WRITEV;
    push_sqe(&file, sqe);

    let (submitted, _) = file.process_submissions(&task, 1, 0, 0);
    assert_eq!(submitted, 1);
    assert_eq!(read_cqe(&file, 0).res, -libc::EINVAL);
}

#[test]
fn interrupted_before_any_submission_returns_sentinel() {
    init_logging();
    let memfile = new_memfile();
    let (file, _) = IoUringFile::new_ring(&memfile, 8, RingParams::default(), PAGE).unwrap();
    let task = FakeTask::new();
    task.interrupt_handle().store(true, Ordering::SeqCst);

    push_sqe(&file, nop_sqe(1));
    let (submitted, err) = file.process_submissions(&task, 1, 0, 0);
    assert_eq!(submitted, -1);
    assert!(matches!(err, Some(Error::Interrupted)));

    let rings = file.guest_rings_view();
    assert_eq!(rings.load_u32(header_offset::SQ_HEAD as usize, Ordering::Acquire), 0);
    assert_eq!(rings.load_u32(header_offset::CQ_TAIL as usize, Ordering::Acquire), 0);
}

#[test]
fn scenario_6_two_tasks_concurrent_disjoint_submissions() {
    init_logging();
    let memfile = new_memfile();
    let (file, _) = IoUringFile::new_ring(&memfile, 64, RingParams::default(), PAGE).unwrap();
    let file = Arc::new(file);

    for i in 0..32u64 {
        push_sqe(&file, nop_sqe(i));
    }
    for i in 32..64u64 {
        push_sqe(&file, nop_sqe(i));
    }

    let f1 = file.clone();
    let f2 = file.clone();
    let t1 = std::thread::spawn(move || {
        let task = FakeTask::new();
        f1.process_submissions(&task, 32, 0, 0)
    });
    let t2 = std::thread::spawn(move || {
        let task = FakeTask::new();
        f2.process_submissions(&task, 32, 0, 0)
    });

    let (s1, e1) = t1.join().unwrap();
    let (s2, e2) = t2.join().unwrap();
    assert!(e1.is_none());
    assert!(e2.is_none());
    assert_eq!(s1 + s2, 64);

    let rings = file.guest_rings_view();
    assert_eq!(rings.load_u32(header_offset::SQ_HEAD as usize, Ordering::Acquire), 64);
    assert_eq!(rings.load_u32(header_offset::CQ_TAIL as usize, Ordering::Acquire), 64);

    let mut seen: Vec<u64> = (0..64).map(|i| read_cqe(&file, i).user_data).collect();
    seen.sort();
    assert_eq!(seen, (0..64).collect::<Vec<_>>());
}

//! Storage path against real files.
//!
//! The synchronous driver runs everywhere. io_uring tests bail out early when
//! the kernel (or a seccomp profile) refuses to create a ring.

#![cfg(all(feature = "persistence", target_os = "linux"))]

use std::fs::File;
use std::os::fd::AsRawFd;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use trigstore::core::persistence::{
    AlignedBuffer, BlockWriter, EngineConfig, IoDriver, IoRequest, NoAffinity, OpKind,
    RawCompletion, SchedAffinity, StorageError, SubmissionEngine, UringDriver, WriterConfig,
};

const MIB: usize = 1 << 20;

fn writer_config(dir: &Path, block_size: usize) -> WriterConfig {
    WriterConfig {
        path: dir.join("blocks.bin"),
        block_size,
        min_offset: 4096,
        direct_io: false,
        engine: EngineConfig::default(),
    }
}

fn uring_available() -> bool {
    match UringDriver::new(8) {
        Ok(_) => true,
        Err(e) => {
            eprintln!("io_uring unavailable, skipping: {e}");
            false
        }
    }
}

#[test]
fn sequential_offsets_one_mib_blocks() {
    let dir = tempfile::tempdir().unwrap();
    let mut writer = BlockWriter::init_sync(writer_config(dir.path(), MIB)).unwrap();

    let offsets: Vec<u64> = (0..3)
        .map(|i| writer.store(&[i as u8 + 1; 100], None).unwrap())
        .collect();
    assert_eq!(offsets, vec![4096, 1_052_672, 2_101_248]);
    assert_eq!(writer.metrics().writes(), 3);
    assert_eq!(writer.metrics().bytes_written(), 3 * MIB as u64);
    assert_eq!(writer.metrics().payload_bytes(), 300);
}

#[test]
fn oversized_store_rejected_before_submission() {
    let dir = tempfile::tempdir().unwrap();
    let mut writer = BlockWriter::init_sync(writer_config(dir.path(), MIB)).unwrap();

    let payload = vec![0u8; MIB + 1];
    let err = writer.store(&payload, None).unwrap_err();
    assert!(err.is_precondition());
    assert_eq!(writer.stores(), 0);
    assert_eq!(writer.next_offset(), 4096);
}

#[test]
fn two_hundred_writes_through_128_slots() {
    let file = tempfile::tempfile().unwrap();
    let mut engine = SubmissionEngine::synchronous(EngineConfig {
        max_concurrent_ops: 128,
        preferred_block_size: 4096,
        alignment: 4096,
    })
    .unwrap();

    let fired = Arc::new(AtomicUsize::new(0));
    for i in 0..200u64 {
        let fired = Arc::clone(&fired);
        let buffer = AlignedBuffer::page_aligned(4096).unwrap();
        engine
            .submit_write(file.as_raw_fd(), i * 4096, buffer, 4096, move |done| {
                assert_eq!(done.kind, OpKind::Write);
                fired.fetch_add(1, Ordering::Relaxed);
            })
            .unwrap();
        assert!(engine.pending_count() <= 128);
    }
    engine.wait_idle().unwrap();

    assert_eq!(fired.load(Ordering::Relaxed), 200);
    assert_eq!(file.metadata().unwrap().len(), 200 * 4096);
}

#[test]
fn read_back_written_block() {
    let file = tempfile::tempfile().unwrap();
    let fd = file.as_raw_fd();
    let mut engine = SubmissionEngine::synchronous(EngineConfig::default()).unwrap();

    let mut out = AlignedBuffer::page_aligned(8192).unwrap();
    out.fill_from(b"trigger record payload").unwrap();
    engine.submit_write(fd, 4096, out, 8192, |_| {}).unwrap();
    engine.wait_idle().unwrap();

    let (tx, rx) = crossbeam_channel::bounded(1);
    engine
        .submit_read(fd, 4096, AlignedBuffer::page_aligned(8192).unwrap(), 8192, move |done| {
            let _ = tx.send(done.into_buffer());
        })
        .unwrap();
    engine.wait_idle().unwrap();

    let back = rx.try_recv().unwrap();
    assert_eq!(&back[..22], b"trigger record payload");
    assert!(back[22..].iter().all(|&b| b == 0));
}

#[test]
fn misaligned_submission_rejected() {
    let file = tempfile::tempfile().unwrap();
    let mut engine = SubmissionEngine::synchronous(EngineConfig::default()).unwrap();
    let err = engine
        .submit_write(file.as_raw_fd(), 100, AlignedBuffer::page_aligned(4096).unwrap(), 4096, |_| {})
        .unwrap_err();
    assert!(matches!(err, StorageError::Misaligned { what: "offset", .. }));
    assert_eq!(file.metadata().unwrap().len(), 0);
}

/// Fails every operation with EIO.
#[derive(Default)]
struct FailingDriver {
    queued: Vec<u64>,
}

impl IoDriver for FailingDriver {
    unsafe fn push(&mut self, req: IoRequest) -> trigstore::core::persistence::Result<()> {
        self.queued.push(req.tag);
        Ok(())
    }

    fn reap(&mut self, out: &mut Vec<RawCompletion>) -> trigstore::core::persistence::Result<()> {
        out.extend(self.queued.drain(..).map(|tag| RawCompletion {
            tag,
            result: -libc::EIO,
        }));
        Ok(())
    }

    fn wait(&mut self) -> trigstore::core::persistence::Result<()> {
        Ok(())
    }
}

#[test]
fn write_failure_halts_writer() {
    let dir = tempfile::tempdir().unwrap();
    let engine = SubmissionEngine::with_driver(FailingDriver::default(), EngineConfig::default()).unwrap();
    let mut writer =
        BlockWriter::with_engine(writer_config(dir.path(), 4096), engine, NoAffinity).unwrap();

    let err = writer.store(b"lost", None).unwrap_err();
    assert!(matches!(err, StorageError::Completion { kind: OpKind::Write, offset: 4096, .. }));
    assert!(writer.is_halted());
    assert_eq!(writer.next_offset(), 4096);

    assert!(matches!(writer.store(b"again", None), Err(StorageError::Halted)));
}

#[test]
fn write_to_read_only_descriptor_fails() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("ro.bin");
    std::fs::write(&path, b"").unwrap();
    let read_only = File::open(&path).unwrap();

    let mut engine = SubmissionEngine::synchronous(EngineConfig::default()).unwrap();
    engine
        .submit_write(read_only.as_raw_fd(), 0, AlignedBuffer::page_aligned(4096).unwrap(), 4096, |_| {})
        .unwrap();
    let err = engine.wait_idle().unwrap_err();
    assert!(matches!(err, StorageError::Completion { kind: OpKind::Write, .. }));
    assert_eq!(engine.pending_count(), 0);
}

#[test]
fn affinity_out_of_range_is_not_fatal() {
    let dir = tempfile::tempdir().unwrap();
    let mut writer = BlockWriter::init_sync(writer_config(dir.path(), 4096))
        .unwrap()
        .with_affinity(SchedAffinity);
    assert_eq!(writer.store(b"pinned?", Some(1 << 20)).unwrap(), 4096);
    assert!(!writer.is_halted());
}

#[test]
fn uring_sequential_offsets() {
    if !uring_available() {
        return;
    }
    let dir = tempfile::tempdir().unwrap();
    let cfg = writer_config(dir.path(), 64 * 1024);
    let path = cfg.path.clone();
    let mut writer = BlockWriter::init(cfg).unwrap();

    for i in 0..4u8 {
        let offset = writer.store(&[i; 1000], None).unwrap();
        assert_eq!(offset, 4096 + u64::from(i) * 64 * 1024);
    }
    writer.close().unwrap();

    let bytes = std::fs::read(path).unwrap();
    assert_eq!(bytes.len(), 4096 + 4 * 64 * 1024);
    assert_eq!(bytes[4096 + 3 * 64 * 1024], 3);
}

#[test]
fn uring_backpressure_200_over_128() {
    if !uring_available() {
        return;
    }
    let file = tempfile::tempfile().unwrap();
    let mut engine = SubmissionEngine::new(EngineConfig {
        max_concurrent_ops: 128,
        preferred_block_size: 4096,
        alignment: 4096,
    })
    .unwrap();

    let fired = Arc::new(AtomicUsize::new(0));
    for i in 0..200u64 {
        let fired = Arc::clone(&fired);
        engine
            .submit_write(
                file.as_raw_fd(),
                i * 4096,
                AlignedBuffer::page_aligned(4096).unwrap(),
                4096,
                move |_| {
                    fired.fetch_add(1, Ordering::Relaxed);
                },
            )
            .unwrap();
        assert!(engine.pending_count() <= 128);
    }
    engine.wait_idle().unwrap();
    assert_eq!(fired.load(Ordering::Relaxed), 200);
}

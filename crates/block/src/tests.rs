use super::*;
use config::StoreConfig;
use std::fs;
use std::io::{Seek, SeekFrom, Write};
use tempfile::tempdir;

// -------------------- Helpers --------------------

fn tm() -> TransactionManager {
    TransactionManager::in_memory(512, 64)
}

fn filled(tm: &TransactionManager, byte: u8) -> Vec<u8> {
    vec![byte; tm.payload_size()]
}

// -------------------- Framing --------------------

#[test]
fn frame_roundtrip_and_checks() {
    let payload = vec![7u8; 100];
    let mut raw = vec![0u8; payload.len() + FRAME_HEADER_BYTES];
    frame::encode(9, &payload, &mut raw);

    assert_eq!(frame::decode(9, &raw).unwrap(), &payload[..]);

    // Wrong location.
    assert!(matches!(
        frame::decode(10, &raw),
        Err(BlockError::Corrupt { block: 10, .. })
    ));

    // Flipped payload bit.
    raw[50] ^= 0x01;
    assert!(matches!(
        frame::decode(9, &raw),
        Err(BlockError::Corrupt { .. })
    ));
}

#[test]
fn frame_rejects_short_buffer() {
    assert!(matches!(
        frame::decode(0, &[0u8; 5]),
        Err(BlockError::Corrupt { .. })
    ));
}

// -------------------- Allocation & access --------------------

#[test]
fn new_block_is_zeroed_and_writable() -> anyhow::Result<()> {
    let tm = tm();
    assert_eq!(tm.payload_size(), 500);

    let b = tm.new_block()?;
    assert_eq!(tm.ref_count(b), 1);
    assert!(tm.read(b)?.iter().all(|&x| x == 0));

    tm.write(b, filled(&tm, 0xAB))?;
    assert!(tm.read(b)?.iter().all(|&x| x == 0xAB));
    Ok(())
}

#[test]
fn write_checks_payload_size() -> anyhow::Result<()> {
    let tm = tm();
    let b = tm.new_block()?;
    assert!(matches!(
        tm.write(b, vec![0u8; 10]),
        Err(BlockError::Size { got: 10, want: 500 })
    ));
    Ok(())
}

#[test]
fn committed_blocks_are_read_only() -> anyhow::Result<()> {
    let tm = tm();
    let b = tm.new_block()?;
    tm.write(b, filled(&tm, 1))?;
    tm.commit()?;

    assert!(matches!(
        tm.write(b, filled(&tm, 2)),
        Err(BlockError::ReadOnly(id)) if id == b
    ));
    // Survives the commit through the device.
    assert!(tm.read(b)?.iter().all(|&x| x == 1));
    Ok(())
}

#[test]
fn read_unknown_block_fails() {
    let tm = tm();
    assert!(matches!(tm.read(3), Err(BlockError::UnknownBlock(3))));
    assert!(matches!(tm.inc(3), Err(BlockError::UnknownBlock(3))));
    assert!(matches!(tm.dec(3), Err(BlockError::UnknownBlock(3))));
}

#[test]
fn block_ref_is_a_snapshot() -> anyhow::Result<()> {
    let tm = tm();
    let b = tm.new_block()?;
    let before = tm.read(b)?;
    tm.write(b, filled(&tm, 5))?;

    assert_eq!(before.id(), b);
    assert!(before.iter().all(|&x| x == 0));
    assert!(tm.read(b)?.iter().all(|&x| x == 5));
    Ok(())
}

// -------------------- Shadowing --------------------

#[test]
fn shadow_of_fresh_unshared_block_is_in_place() -> anyhow::Result<()> {
    let tm = tm();
    let b = tm.new_block()?;
    assert_eq!(tm.shadow(b)?, (b, false));
    assert_eq!(tm.ref_count(b), 1);
    Ok(())
}

#[test]
fn shadow_of_committed_block_copies() -> anyhow::Result<()> {
    let tm = tm();
    let b = tm.new_block()?;
    tm.write(b, filled(&tm, 9))?;
    tm.commit()?;

    let (copy, shared) = tm.shadow(b)?;
    assert_ne!(copy, b);
    assert!(!shared);
    assert_eq!(tm.ref_count(b), 0);
    assert_eq!(tm.ref_count(copy), 1);
    assert!(tm.read(copy)?.iter().all(|&x| x == 9));

    // The copy is writable, and a second shadow returns it unchanged.
    tm.write(copy, filled(&tm, 3))?;
    assert_eq!(tm.shadow(copy)?, (copy, false));
    Ok(())
}

#[test]
fn shadow_of_shared_block_reports_sharing() -> anyhow::Result<()> {
    let tm = tm();
    let b = tm.new_block()?;
    tm.inc(b)?;
    assert_eq!(tm.ref_count(b), 2);

    // Shared even though it was created in this transaction.
    let (copy, shared) = tm.shadow(b)?;
    assert_ne!(copy, b);
    assert!(shared);
    assert_eq!(tm.ref_count(b), 1);
    assert_eq!(tm.ref_count(copy), 1);
    Ok(())
}

// -------------------- Reference counting & recycling --------------------

#[test]
fn released_block_readable_until_commit() -> anyhow::Result<()> {
    let tm = tm();
    let b = tm.new_block()?;
    tm.write(b, filled(&tm, 4))?;
    tm.commit()?;

    tm.dec(b)?;
    assert_eq!(tm.ref_count(b), 0);
    assert!(tm.read(b)?.iter().all(|&x| x == 4));
    assert!(matches!(tm.write(b, filled(&tm, 1)), Err(BlockError::ReadOnly(_))));

    tm.commit()?;
    assert!(matches!(tm.read(b), Err(BlockError::UnknownBlock(_))));

    // Recycled on the next allocation.
    assert_eq!(tm.new_block()?, b);
    Ok(())
}

#[test]
fn released_block_not_reused_within_transaction() -> anyhow::Result<()> {
    let tm = tm();
    let a = tm.new_block()?;
    tm.dec(a)?;
    let b = tm.new_block()?;
    assert_ne!(a, b);
    Ok(())
}

#[test]
fn capacity_exhaustion_is_no_space() -> anyhow::Result<()> {
    let tm = TransactionManager::in_memory(512, 3);
    for _ in 0..3 {
        tm.new_block()?;
    }
    assert!(matches!(tm.new_block(), Err(BlockError::NoSpace(3))));
    assert_eq!(tm.allocated(), 3);
    Ok(())
}

// -------------------- Abort --------------------

#[test]
fn abort_restores_committed_state() -> anyhow::Result<()> {
    let tm = tm();
    let b = tm.new_block()?;
    tm.write(b, filled(&tm, 1))?;
    tm.commit()?;

    let (copy, _) = tm.shadow(b)?;
    tm.write(copy, filled(&tm, 2))?;
    let extra = tm.new_block()?;
    assert_eq!(tm.allocated(), 2);

    tm.abort();

    assert_eq!(tm.allocated(), 1);
    assert_eq!(tm.ref_count(b), 1);
    assert_eq!(tm.ref_count(copy), 0);
    assert_eq!(tm.ref_count(extra), 0);
    assert!(tm.read(b)?.iter().all(|&x| x == 1));
    Ok(())
}

// -------------------- Savepoints --------------------

#[test]
fn savepoint_rollback_undoes_uncommitted_changes() -> anyhow::Result<()> {
    let tm = tm();
    let a = tm.new_block()?;
    tm.write(a, filled(&tm, 1))?;
    let b = tm.new_block()?;

    let sp = tm.savepoint();
    tm.write(a, filled(&tm, 2))?;
    tm.inc(a)?;
    tm.dec(b)?;
    let c = tm.new_block()?;
    tm.write(c, filled(&tm, 3))?;
    assert_eq!(tm.allocated(), 2);
    sp.rollback();

    assert!(tm.read(a)?.iter().all(|&x| x == 1));
    assert_eq!(tm.ref_count(a), 1);
    assert_eq!(tm.ref_count(b), 1);
    assert_eq!(tm.ref_count(c), 0);
    assert_eq!(tm.allocated(), 2);

    // The rolled back id is handed out again.
    assert_eq!(tm.new_block()?, c);
    Ok(())
}

#[test]
fn savepoint_rollback_restores_shadowed_block() -> anyhow::Result<()> {
    let tm = tm();
    let a = tm.new_block()?;
    tm.write(a, filled(&tm, 1))?;
    tm.commit()?;

    {
        let _sp = tm.savepoint();
        let (copy, shared) = tm.shadow(a)?;
        assert!(!shared);
        tm.write(copy, filled(&tm, 9))?;
        assert_eq!(tm.ref_count(a), 0);
        // Dropped without release.
    }

    assert_eq!(tm.ref_count(a), 1);
    assert_eq!(tm.allocated(), 1);
    tm.commit()?;
    assert!(tm.read(a)?.iter().all(|&x| x == 1));
    Ok(())
}

#[test]
fn released_savepoint_keeps_changes() -> anyhow::Result<()> {
    let tm = tm();
    let a = tm.new_block()?;

    let outer = tm.savepoint();
    let inner = tm.savepoint();
    tm.write(a, filled(&tm, 4))?;
    let b = tm.new_block()?;
    inner.release();
    outer.release();

    assert!(tm.read(a)?.iter().all(|&x| x == 4));
    assert_eq!(tm.ref_count(b), 1);
    Ok(())
}

#[test]
fn outer_rollback_undoes_released_inner_savepoint() -> anyhow::Result<()> {
    let tm = tm();
    let a = tm.new_block()?;
    tm.write(a, filled(&tm, 1))?;

    let outer = tm.savepoint();
    tm.write(a, filled(&tm, 2))?;
    let inner = tm.savepoint();
    tm.write(a, filled(&tm, 3))?;
    let b = tm.new_block()?;
    inner.release();
    outer.rollback();

    assert!(tm.read(a)?.iter().all(|&x| x == 1));
    assert_eq!(tm.ref_count(b), 0);
    assert_eq!(tm.allocated(), 1);
    Ok(())
}

#[test]
fn failed_allocation_inside_savepoint_rolls_back_cleanly() -> anyhow::Result<()> {
    let tm = TransactionManager::in_memory(512, 3);
    let a = tm.new_block()?;
    tm.commit()?;

    let sp = tm.savepoint();
    tm.new_block()?;
    tm.new_block()?;
    assert!(matches!(tm.new_block(), Err(BlockError::NoSpace(3))));
    sp.rollback();

    tm.commit()?;
    assert_eq!(tm.allocated(), 1);
    assert_eq!(tm.ref_count(a), 1);
    tm.new_block()?;
    tm.new_block()?;
    Ok(())
}

// -------------------- Pins --------------------

#[test]
fn pins_are_released_on_drop() -> anyhow::Result<()> {
    let tm = tm();
    let b = tm.new_block()?;
    assert_eq!(tm.pinned(), 0);
    {
        let r1 = tm.read(b)?;
        let r2 = tm.read(b)?;
        assert_eq!(tm.pinned(), 2);
        drop(r1);
        assert_eq!(tm.pinned(), 1);
        drop(r2);
    }
    assert_eq!(tm.pinned(), 0);
    Ok(())
}

// -------------------- File-backed store --------------------

#[test]
fn open_rejects_bad_block_size() {
    let cfg = StoreConfig::in_memory(1000, 16);
    assert!(matches!(
        TransactionManager::open(&cfg),
        Err(BlockError::Config(_))
    ));
}

#[test]
fn file_backed_store_roundtrip() -> anyhow::Result<()> {
    let dir = tempdir()?;
    let mut cfg = StoreConfig::in_memory(512, 16);
    cfg.path = Some(dir.path().join("store.blk"));
    cfg.sync_on_commit = true;

    let tm = TransactionManager::open(&cfg)?;
    let a = tm.new_block()?;
    let b = tm.new_block()?;
    tm.write(a, filled(&tm, 0x11))?;
    tm.write(b, filled(&tm, 0x22))?;
    tm.commit()?;

    assert!(tm.read(a)?.iter().all(|&x| x == 0x11));
    assert!(tm.read(b)?.iter().all(|&x| x == 0x22));

    let len = fs::metadata(dir.path().join("store.blk"))?.len();
    assert_eq!(len, 2 * 512);
    Ok(())
}

#[test]
fn corrupted_file_block_is_detected() -> anyhow::Result<()> {
    let dir = tempdir()?;
    let path = dir.path().join("store.blk");
    let mut cfg = StoreConfig::in_memory(512, 16);
    cfg.path = Some(path.clone());

    let tm = TransactionManager::open(&cfg)?;
    let a = tm.new_block()?;
    let b = tm.new_block()?;
    tm.write(a, filled(&tm, 0x11))?;
    tm.write(b, filled(&tm, 0x22))?;
    tm.commit()?;

    {
        let mut f = fs::OpenOptions::new().write(true).open(&path)?;
        f.seek(SeekFrom::Start(b * 512 + 100))?;
        f.write_all(&[0xFF])?;
        f.sync_all()?;
    }

    assert!(tm.read(a)?.iter().all(|&x| x == 0x11));
    assert!(matches!(
        tm.read(b),
        Err(BlockError::Corrupt { block, .. }) if block == b
    ));
    Ok(())
}

#[test]
fn reopened_file_device_reads_committed_blocks() -> anyhow::Result<()> {
    let dir = tempdir()?;
    let path = dir.path().join("store.blk");
    let mut cfg = StoreConfig::in_memory(512, 16);
    cfg.path = Some(path.clone());

    let a = {
        let tm = TransactionManager::open(&cfg)?;
        let a = tm.new_block()?;
        tm.write(a, filled(&tm, 0x5A))?;
        tm.commit()?;
        a
    };

    let mut dev = FileDevice::open(&path, 512)?;
    assert_eq!(dev.block_size(), 512);
    let mut raw = vec![0u8; 512];
    dev.read_block(a, &mut raw)?;
    let payload = frame::decode(a, &raw)?;
    assert_eq!(payload.len(), 512 - FRAME_HEADER_BYTES);
    assert!(payload.iter().all(|&x| x == 0x5A));

    assert!(matches!(
        dev.read_block(a + 1, &mut raw),
        Err(BlockError::UnknownBlock(id)) if id == a + 1
    ));
    Ok(())
}

#[test]
fn mem_device_reports_unwritten_blocks() {
    let mut dev = MemDevice::new(64);
    let mut buf = vec![0u8; 64];
    assert!(dev.is_empty());
    assert!(matches!(
        dev.read_block(1, &mut buf),
        Err(BlockError::UnknownBlock(1))
    ));
    dev.write_block(1, &[3u8; 64]).unwrap();
    dev.read_block(1, &mut buf).unwrap();
    assert_eq!(buf, vec![3u8; 64]);
    assert_eq!(dev.len(), 1);
}

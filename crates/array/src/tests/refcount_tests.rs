use super::helpers::*;
use crate::*;
use anyhow::Result;
use std::sync::Arc;

// --------------------- Resize hooks ---------------------

#[test]
fn grow_increments_once_per_new_slot() -> Result<()> {
    let tm = tm(1024);
    let vt = Arc::new(CountingValue::default());
    let info = counting_info(&tm, &vt);

    let root = info.resize(info.empty()?, 0, 50, &le32(8))?;
    assert_eq!(vt.calls(), (50, 0));

    vt.reset();
    let _root = info.resize(root, 50, 50 + 333, &le32(9))?;
    assert_eq!(vt.calls(), (333, 0));
    assert_eq!(vt.net(9), 333);
    Ok(())
}

#[test]
fn shrink_decrements_removed_values() -> Result<()> {
    let tm = tm(1024);
    let vt = Arc::new(CountingValue::default());
    let info = counting_info(&tm, &vt);
    let root = identity(&info, 300)?;
    assert_eq!(vt.calls(), (0, 0));

    let _root = info.resize(root, 300, 200, &le32(0))?;
    assert_eq!(vt.calls(), (0, 100));
    for v in 0..300 {
        let want = if v >= 200 { -1 } else { 0 };
        assert_eq!(vt.net(v), want, "value {}", v);
    }
    Ok(())
}

#[test]
fn set_value_swaps_one_reference() -> Result<()> {
    let tm = tm(1024);
    let vt = Arc::new(CountingValue::default());
    let info = counting_info(&tm, &vt);
    let root = identity(&info, 300)?;
    tm.commit()?;

    let _root = info.set_value(root, 10, &le32(999))?;
    assert_eq!(vt.calls(), (1, 1));
    assert_eq!(vt.net(10), -1);
    assert_eq!(vt.net(999), 1);
    Ok(())
}

#[test]
fn equal_values_skip_hooks() -> Result<()> {
    let tm = tm(1024);
    let vt = Arc::new(CountingValue::comparing());
    let info = counting_info(&tm, &vt);
    let root = identity(&info, 10)?;

    let root = info.set_value(root, 4, &le32(4))?;
    assert_eq!(vt.calls(), (0, 0));
    let _root = info.set_value(root, 4, &le32(5))?;
    assert_eq!(vt.calls(), (1, 1));
    Ok(())
}

#[test]
fn set_values_swaps_one_reference_per_index() -> Result<()> {
    let tm = tm(1024);
    let vt = Arc::new(CountingValue::default());
    let info = counting_info(&tm, &vt);
    let root = identity(&info, 400)?;

    let a = le32(1000);
    let b = le32(2000);
    let updates: Vec<(u64, &[u8])> = vec![(7, &a[..]), (300, &a[..]), (7, &b[..])];
    let _root = info.set_values(root, &updates)?;

    assert_eq!(vt.calls(), (2, 2));
    assert_eq!(vt.net(2000), 1);
    assert_eq!(vt.net(1000), 1);
    assert_eq!(vt.net(7), -1);
    assert_eq!(vt.net(300), -1);
    Ok(())
}

// --------------------- Sharing ---------------------

#[test]
fn shared_snapshot_balances_references() -> Result<()> {
    let tm = tm(1024);
    let vt = Arc::new(CountingValue::default());
    let info = counting_info(&tm, &vt);
    let old = info.resize(info.empty()?, 0, 300, &le32(1))?;
    tm.commit()?;

    // Keep `old` alive next to the updated array.
    tm.inc(old)?;
    let new = info.set_value(old, 5, &le32(2))?;
    assert_ne!(new, old);
    assert_eq!(get_u32(&info, old, 5)?, 1);
    assert_eq!(get_u32(&info, new, 5)?, 2);

    info.del(new)?;
    assert_eq!(values(&info, old)?, vec![1; 300]);
    info.del(old)?;

    assert_eq!(tm.allocated(), 0);
    assert_eq!(vt.net(1), 0);
    assert_eq!(vt.net(2), 0);
    Ok(())
}

#[test]
fn del_decrements_every_value() -> Result<()> {
    let tm = tm(1024);
    let vt = Arc::new(CountingValue::default());
    let info = counting_info(&tm, &vt);
    let root = info.resize(info.empty()?, 0, 1000, &le32(3))?;

    info.del(root)?;
    assert_eq!(vt.calls(), (1000, 1000));
    assert_eq!(vt.net(3), 0);
    assert_eq!(tm.allocated(), 0);
    Ok(())
}

// --------------------- Failed updates ---------------------

#[test]
fn failed_grow_makes_no_hook_calls() -> Result<()> {
    let tm = tm(4);
    let vt = Arc::new(CountingValue::default());
    let info = counting_info(&tm, &vt);
    let root = info.resize(info.empty()?, 0, 10, &le32(7))?;

    vt.reset();
    assert!(info.resize(root, 10, U32_PER_BLOCK * 5, &le32(9)).is_err());
    assert_eq!(vt.calls(), (0, 0));
    Ok(())
}

#[test]
fn failed_shrink_makes_no_hook_calls() -> Result<()> {
    let tm = tm(5);
    let vt = Arc::new(CountingValue::default());
    let info = counting_info(&tm, &vt);
    let n = U32_PER_BLOCK * 3;
    let root = identity(&info, n)?;
    tm.commit()?;

    // Dropping block 2 copies the leaf; trimming block 1 finds no room.
    let res = info.resize(root, n, U32_PER_BLOCK + 50, &le32(0));
    assert!(matches!(
        res,
        Err(ArrayError::Storage(BlockError::NoSpace(5)))
    ));
    assert_eq!(vt.calls(), (0, 0));

    tm.commit()?;
    assert_eq!(tm.allocated(), 4);
    assert_eq!(values(&info, root)?.len() as u64, n);
    Ok(())
}

use sable::{Graph, GraphOptions, Result};

fn graph() -> Graph {
    Graph::open(GraphOptions::in_memory()).unwrap()
}

#[test]
fn bulk_inserts_survive_block_migrations() -> Result<()> {
    const EDGES: u64 = 10_000;

    let g = graph();
    let src;
    {
        let mut tx = g.begin_transaction()?;
        src = tx.new_vertex(false)?;
        tx.put_vertex(src, b"hub")?;
        tx.commit(true)?;
    }
    {
        let mut tx = g.begin_transaction()?;
        for i in 0..EDGES {
            // Varied payload lengths force repeated block migrations.
            let payload = vec![(i % 251) as u8; (i % 53) as usize];
            tx.put_edge(src, 0, 100_000 + i, &payload, false)?;
        }
        tx.commit(true)?;
    }

    let tx = g.begin_read_only_transaction()?;
    let mut iter = tx.get_edges(src, 0, false);
    let mut seen = 0u64;
    while iter.valid() {
        assert_eq!(iter.dst_id(), 100_000 + seen, "edge lost or reordered");
        let expected = vec![(seen % 251) as u8; (seen % 53) as usize];
        assert_eq!(iter.edge_data(), expected.as_slice());
        seen += 1;
        iter.next();
    }
    assert_eq!(seen, EDGES, "migration dropped or duplicated entries");

    let mut reverse = tx.get_edges(src, 0, true);
    assert_eq!(reverse.dst_id(), 100_000 + EDGES - 1);
    Ok(())
}

#[test]
fn compaction_preserves_observable_state() -> Result<()> {
    let g = graph();
    let (src, keep, drop_);
    {
        let mut tx = g.begin_transaction()?;
        src = tx.new_vertex(false)?;
        keep = tx.new_vertex(false)?;
        drop_ = tx.new_vertex(false)?;
        tx.put_vertex(src, b"v1")?;
        tx.put_edge(src, 0, keep, b"keep", false)?;
        tx.put_edge(src, 0, drop_, b"drop", false)?;
        tx.commit(true)?;
    }
    {
        let mut tx = g.begin_transaction()?;
        tx.put_vertex(src, b"v2")?;
        tx.del_edge(src, 0, drop_)?;
        tx.commit(true)?;
    }

    let epoch = g.compact(-1);
    assert!(epoch >= 2);

    let tx = g.begin_read_only_transaction()?;
    assert_eq!(tx.get_vertex(src), b"v2");
    assert_eq!(tx.get_edge(src, 0, keep), b"keep");
    assert_eq!(tx.get_edge(src, 0, drop_), b"");
    let mut iter = tx.get_edges(src, 0, false);
    assert_eq!(iter.dst_id(), keep);
    iter.next();
    assert!(!iter.valid());
    Ok(())
}

#[test]
fn compaction_honors_live_readers() -> Result<()> {
    let g = graph();
    let v;
    {
        let mut tx = g.begin_transaction()?;
        v = tx.new_vertex(false)?;
        tx.put_vertex(v, b"one")?;
        tx.commit(true)?;
    }
    let old_reader = g.begin_read_only_transaction()?;
    {
        let mut tx = g.begin_transaction()?;
        tx.put_vertex(v, b"two")?;
        tx.commit(true)?;
    }
    {
        let mut tx = g.begin_transaction()?;
        tx.put_vertex(v, b"three")?;
        tx.commit(true)?;
    }

    // The live reader pins the safe epoch at its snapshot.
    let safe = g.compact(-1);
    assert_eq!(safe, old_reader.get_read_epoch_id());
    assert_eq!(old_reader.get_vertex(v), b"one");

    let fresh = g.begin_read_only_transaction()?;
    assert_eq!(fresh.get_vertex(v), b"three");

    drop(old_reader);
    let safe = g.compact(-1);
    assert!(safe >= 3);
    assert_eq!(fresh.get_vertex(v), b"three");
    Ok(())
}

#[test]
fn explicit_epoch_bounds_compaction() -> Result<()> {
    let g = graph();
    let v;
    {
        let mut tx = g.begin_transaction()?;
        v = tx.new_vertex(false)?;
        tx.put_vertex(v, b"a")?;
        tx.commit(true)?;
    }
    {
        let mut tx = g.begin_transaction()?;
        tx.put_vertex(v, b"b")?;
        tx.commit(true)?;
    }
    // A bound beyond the visible epoch is clamped to it.
    assert_eq!(g.compact(100), 2);
    assert_eq!(g.compact(1), 1);
    let tx = g.begin_read_only_transaction()?;
    assert_eq!(tx.get_vertex(v), b"b");
    Ok(())
}

#[test]
fn compaction_rewrites_edge_blocks_in_place() -> Result<()> {
    const EDGES: u64 = 200;

    let g = graph();
    let src;
    {
        let mut tx = g.begin_transaction()?;
        src = tx.new_vertex(false)?;
        for i in 0..EDGES {
            tx.put_edge(src, 0, 5_000 + i, &[i as u8], false)?;
        }
        tx.commit(true)?;
    }
    {
        let mut tx = g.begin_transaction()?;
        for i in (0..EDGES).step_by(2) {
            assert!(tx.del_edge(src, 0, 5_000 + i)?);
        }
        tx.commit(true)?;
    }

    g.compact(-1);

    let tx = g.begin_read_only_transaction()?;
    let mut iter = tx.get_edges(src, 0, false);
    let mut expected = 1u64;
    while iter.valid() {
        assert_eq!(iter.dst_id(), 5_000 + expected);
        assert_eq!(iter.edge_data(), [expected as u8].as_slice());
        expected += 2;
        iter.next();
    }
    assert_eq!(expected, EDGES + 1);
    // Lookups still work against the rewritten block.
    assert_eq!(tx.get_edge(src, 0, 5_001), [1u8].as_slice());
    assert_eq!(tx.get_edge(src, 0, 5_000), b"");
    Ok(())
}

#[test]
fn repeated_update_compact_cycles_stay_consistent() -> Result<()> {
    let g = graph();
    let v;
    {
        let mut tx = g.begin_transaction()?;
        v = tx.new_vertex(false)?;
        tx.put_vertex(v, b"0")?;
        tx.commit(true)?;
    }
    for round in 1..=20u8 {
        {
            let mut tx = g.begin_transaction()?;
            tx.put_vertex(v, &[b'0' + (round % 10)])?;
            tx.put_edge(v, 1, round as u64, &[round], false)?;
            tx.commit(true)?;
        }
        g.compact(-1);
        let tx = g.begin_read_only_transaction()?;
        assert_eq!(tx.get_vertex(v), [b'0' + (round % 10)].as_slice());
        assert_eq!(tx.get_edge(v, 1, round as u64), [round].as_slice());
    }
    Ok(())
}

#[test]
fn compaction_runs_alongside_writers() -> Result<()> {
    let g = graph();
    let src;
    {
        let mut tx = g.begin_transaction()?;
        src = tx.new_vertex(false)?;
        tx.put_vertex(src, b"hub")?;
        tx.commit(true)?;
    }

    std::thread::scope(|scope| {
        let writer = {
            let g = &g;
            scope.spawn(move || {
                for i in 0..400u64 {
                    let mut tx = g.begin_transaction().unwrap();
                    tx.put_edge(src, 0, 2_000 + i, &i.to_le_bytes(), false).unwrap();
                    if i % 3 == 0 {
                        tx.del_edge(src, 0, 2_000 + i).unwrap();
                    }
                    tx.commit(true).unwrap();
                }
            })
        };
        let compactor = {
            let g = &g;
            scope.spawn(move || {
                for _ in 0..50 {
                    g.compact(-1);
                    std::thread::yield_now();
                }
            })
        };
        writer.join().unwrap();
        compactor.join().unwrap();
    });

    g.compact(-1);
    let tx = g.begin_read_only_transaction()?;
    for i in 0..400u64 {
        let bytes = i.to_le_bytes();
        let expected: &[u8] = if i % 3 == 0 { b"" } else { &bytes };
        assert_eq!(tx.get_edge(src, 0, 2_000 + i), expected, "edge {i}");
    }
    Ok(())
}

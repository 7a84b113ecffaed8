//! Transactions — overlay visibility, atomic commit, abort, and crash safety.

#[cfg(test)]
mod tests {
    use crate::engine::tests::helpers::*;
    use crate::engine::{EngineError, TTL_ABSENT, TTL_NONE};
    use crate::ttl::ManualClock;
    use std::fs;
    use tempfile::TempDir;

    // ----------------------------------------------------------------
    // State machine
    // ----------------------------------------------------------------

    #[test]
    fn nested_begin_is_rejected() {
        let dir = TempDir::new().unwrap();
        let mut engine = open(&db_path(&dir));

        engine.begin().unwrap();
        assert!(matches!(
            engine.begin(),
            Err(EngineError::TransactionActive)
        ));
        // The original transaction is still usable.
        assert!(engine.in_tx());
        engine.abort().unwrap();
    }

    #[test]
    fn commit_and_abort_require_a_transaction() {
        let dir = TempDir::new().unwrap();
        let mut engine = open(&db_path(&dir));

        assert!(matches!(engine.commit(), Err(EngineError::NoTransaction)));
        assert!(matches!(engine.abort(), Err(EngineError::NoTransaction)));
    }

    #[test]
    fn empty_transaction_commits_cleanly() {
        let dir = TempDir::new().unwrap();
        let mut engine = open(&db_path(&dir));

        engine.begin().unwrap();
        engine.commit().unwrap();
        assert!(!engine.in_tx());
    }

    // ----------------------------------------------------------------
    // Overlay visibility
    // ----------------------------------------------------------------

    #[test]
    fn pending_writes_are_visible_inside_the_transaction() {
        let dir = TempDir::new().unwrap();
        let mut engine = open(&db_path(&dir));

        engine.set(b"base".to_vec(), b"old".to_vec()).unwrap();
        engine.begin().unwrap();
        engine.set(b"base".to_vec(), b"staged".to_vec()).unwrap();
        engine.set(b"fresh".to_vec(), b"new".to_vec()).unwrap();

        assert_eq!(engine.get(b"base").unwrap(), Some(b"staged".to_vec()));
        assert_eq!(engine.get(b"fresh").unwrap(), Some(b"new".to_vec()));
        engine.abort().unwrap();
    }

    #[test]
    fn pending_delete_hides_the_base_value() {
        let dir = TempDir::new().unwrap();
        let mut engine = open(&db_path(&dir));

        engine.set(b"a".to_vec(), b"1".to_vec()).unwrap();
        engine.begin().unwrap();

        assert!(engine.del(b"a").unwrap());
        assert_eq!(engine.get(b"a").unwrap(), None);
        assert_eq!(engine.ttl(b"a").unwrap(), TTL_ABSENT);
        // A second delete sees the tombstone.
        assert!(!engine.del(b"a").unwrap());

        engine.abort().unwrap();
        assert_eq!(engine.get(b"a").unwrap(), Some(b"1".to_vec()));
    }

    #[test]
    fn coalesced_sets_commit_to_the_last_value() {
        let dir = TempDir::new().unwrap();
        let mut engine = open(&db_path(&dir));

        engine.begin().unwrap();
        engine.set(b"k".to_vec(), b"v1".to_vec()).unwrap();
        engine.set(b"k".to_vec(), b"v2".to_vec()).unwrap();
        engine.commit().unwrap();

        assert_eq!(engine.get(b"k").unwrap(), Some(b"v2".to_vec()));
    }

    // ----------------------------------------------------------------
    // Commit / abort semantics
    // ----------------------------------------------------------------

    #[test]
    fn commit_survives_restart() {
        let dir = TempDir::new().unwrap();
        let path = db_path(&dir);

        {
            let mut engine = open(&path);
            engine.begin().unwrap();
            engine.set(b"x".to_vec(), b"1".to_vec()).unwrap();
            engine.set(b"y".to_vec(), b"2".to_vec()).unwrap();
            engine.commit().unwrap();
        }

        let mut engine = open(&path);
        let values = engine.mget(&[b"x".to_vec(), b"y".to_vec()]).unwrap();
        assert_eq!(values, vec![Some(b"1".to_vec()), Some(b"2".to_vec())]);
    }

    #[test]
    fn abort_leaves_no_trace() {
        let dir = TempDir::new().unwrap();
        let path = db_path(&dir);

        {
            let mut engine = open(&path);
            engine.set(b"a".to_vec(), b"1".to_vec()).unwrap();
            let len_before = fs::metadata(&path).unwrap().len();

            engine.begin().unwrap();
            engine.set(b"a".to_vec(), b"2".to_vec()).unwrap();
            engine.abort().unwrap();

            assert_eq!(engine.get(b"a").unwrap(), Some(b"1".to_vec()));
            // Nothing reached the log.
            assert_eq!(fs::metadata(&path).unwrap().len(), len_before);
        }

        let mut engine = open(&path);
        assert_eq!(engine.get(b"a").unwrap(), Some(b"1".to_vec()));
    }

    #[test]
    fn dropping_the_engine_mid_transaction_discards_it() {
        let dir = TempDir::new().unwrap();
        let path = db_path(&dir);

        {
            let mut engine = open(&path);
            engine.begin().unwrap();
            engine.set(b"ghost".to_vec(), b"v".to_vec()).unwrap();
            // Client disconnect: no COMMIT.
        }

        let mut engine = open(&path);
        assert_eq!(engine.get(b"ghost").unwrap(), None);
    }

    #[test]
    fn torn_commit_is_undone_wholesale() {
        let dir = TempDir::new().unwrap();
        let path = db_path(&dir);

        {
            let mut engine = open(&path);
            engine.set(b"base".to_vec(), b"1".to_vec()).unwrap();
        }
        let len_before_tx = fs::metadata(&path).unwrap().len();

        {
            let mut engine = open(&path);
            engine.begin().unwrap();
            engine.set(b"x".to_vec(), b"1".to_vec()).unwrap();
            engine.set(b"y".to_vec(), b"2".to_vec()).unwrap();
            engine.commit().unwrap();
        }

        // Crash simulation: only a few bytes of the commit batch survive.
        let file = fs::OpenOptions::new().write(true).open(&path).unwrap();
        file.set_len(len_before_tx + 3).unwrap();
        drop(file);

        let mut engine = open(&path);
        assert_eq!(engine.get(b"base").unwrap(), Some(b"1".to_vec()));
        assert_eq!(engine.get(b"x").unwrap(), None);
        assert_eq!(engine.get(b"y").unwrap(), None);
    }

    // ----------------------------------------------------------------
    // TTL actions inside a transaction
    // ----------------------------------------------------------------

    #[test]
    fn staged_expire_supersedes_base_ttl() {
        let dir = TempDir::new().unwrap();
        let clock = ManualClock::new(1_000);
        let mut engine = open_with(&db_path(&dir), &clock);

        engine.set(b"k".to_vec(), b"v".to_vec()).unwrap();
        engine.begin().unwrap();
        assert!(engine.expire(b"k", 5_000).unwrap());
        assert_eq!(engine.ttl(b"k").unwrap(), 5_000);

        engine.abort().unwrap();
        assert_eq!(engine.ttl(b"k").unwrap(), TTL_NONE);
    }

    #[test]
    fn committed_expire_takes_effect() {
        let dir = TempDir::new().unwrap();
        let clock = ManualClock::new(1_000);
        let mut engine = open_with(&db_path(&dir), &clock);

        engine.set(b"k".to_vec(), b"v".to_vec()).unwrap();
        engine.begin().unwrap();
        engine.expire(b"k", 5_000).unwrap();
        engine.commit().unwrap();

        assert_eq!(engine.ttl(b"k").unwrap(), 5_000);
        clock.advance(6_000);
        assert_eq!(engine.get(b"k").unwrap(), None);
    }

    #[test]
    fn expire_on_a_transaction_created_key_commits() {
        let dir = TempDir::new().unwrap();
        let clock = ManualClock::new(1_000);
        let mut engine = open_with(&db_path(&dir), &clock);

        engine.begin().unwrap();
        engine.set(b"n".to_vec(), b"v".to_vec()).unwrap();
        assert!(engine.expire(b"n", 5_000).unwrap());
        assert_eq!(engine.ttl(b"n").unwrap(), 5_000);
        engine.commit().unwrap();

        assert_eq!(engine.ttl(b"n").unwrap(), 5_000);
    }

    #[test]
    fn staged_deadline_elapsing_hides_the_key_without_logging() {
        let dir = TempDir::new().unwrap();
        let path = db_path(&dir);
        let clock = ManualClock::new(1_000);
        let mut engine = open_with(&path, &clock);

        engine.begin().unwrap();
        engine.set(b"k".to_vec(), b"v".to_vec()).unwrap();
        engine.expire(b"k", 0).unwrap();

        let len_before = fs::metadata(&path).unwrap().len();
        assert_eq!(engine.get(b"k").unwrap(), None);
        assert_eq!(engine.ttl(b"k").unwrap(), TTL_ABSENT);
        // Nothing durable may happen for uncommitted state.
        assert_eq!(fs::metadata(&path).unwrap().len(), len_before);

        engine.abort().unwrap();
    }

    #[test]
    fn staged_persist_commits() {
        let dir = TempDir::new().unwrap();
        let clock = ManualClock::new(1_000);
        let mut engine = open_with(&db_path(&dir), &clock);

        engine.set(b"k".to_vec(), b"v".to_vec()).unwrap();
        engine.expire(b"k", 5_000).unwrap();

        engine.begin().unwrap();
        assert!(engine.persist(b"k").unwrap());
        assert_eq!(engine.ttl(b"k").unwrap(), TTL_NONE);
        engine.commit().unwrap();

        clock.advance(60_000);
        assert_eq!(engine.get(b"k").unwrap(), Some(b"v".to_vec()));
    }

    #[test]
    fn staged_set_drops_the_base_deadline() {
        let dir = TempDir::new().unwrap();
        let clock = ManualClock::new(1_000);
        let mut engine = open_with(&db_path(&dir), &clock);

        engine.set(b"k".to_vec(), b"v1".to_vec()).unwrap();
        engine.expire(b"k", 5_000).unwrap();

        engine.begin().unwrap();
        engine.set(b"k".to_vec(), b"v2".to_vec()).unwrap();
        assert_eq!(engine.ttl(b"k").unwrap(), TTL_NONE);
        engine.commit().unwrap();

        clock.advance(60_000);
        assert_eq!(engine.get(b"k").unwrap(), Some(b"v2".to_vec()));
    }

    // ----------------------------------------------------------------
    // Range scans under an overlay
    // ----------------------------------------------------------------

    #[test]
    fn range_merges_pending_puts_in_sort_order() {
        let dir = TempDir::new().unwrap();
        let mut engine = open(&db_path(&dir));

        engine
            .mset(vec![(b"b".to_vec(), b"2".to_vec()), (b"d".to_vec(), b"4".to_vec())])
            .unwrap();

        engine.begin().unwrap();
        engine.set(b"a".to_vec(), b"1".to_vec()).unwrap();
        engine.set(b"c".to_vec(), b"3".to_vec()).unwrap();
        engine.set(b"e".to_vec(), b"5".to_vec()).unwrap();

        let keys = engine.range(None, None).unwrap();
        assert_eq!(
            keys,
            vec![
                b"a".to_vec(),
                b"b".to_vec(),
                b"c".to_vec(),
                b"d".to_vec(),
                b"e".to_vec(),
            ]
        );
        engine.abort().unwrap();

        assert_eq!(
            engine.range(None, None).unwrap(),
            vec![b"b".to_vec(), b"d".to_vec()]
        );
    }

    #[test]
    fn range_suppresses_pending_tombstones() {
        let dir = TempDir::new().unwrap();
        let mut engine = open(&db_path(&dir));

        engine
            .mset(vec![
                (b"a".to_vec(), b"1".to_vec()),
                (b"b".to_vec(), b"2".to_vec()),
                (b"c".to_vec(), b"3".to_vec()),
            ])
            .unwrap();

        engine.begin().unwrap();
        engine.del(b"b").unwrap();

        assert_eq!(
            engine.range(None, None).unwrap(),
            vec![b"a".to_vec(), b"c".to_vec()]
        );

        engine.commit().unwrap();
        assert_eq!(
            engine.range(None, None).unwrap(),
            vec![b"a".to_vec(), b"c".to_vec()]
        );
    }

    #[test]
    fn range_respects_staged_ttl_overrides() {
        let dir = TempDir::new().unwrap();
        let clock = ManualClock::new(1_000);
        let mut engine = open_with(&db_path(&dir), &clock);

        engine
            .mset(vec![(b"a".to_vec(), b"1".to_vec()), (b"b".to_vec(), b"2".to_vec())])
            .unwrap();

        engine.begin().unwrap();
        engine.expire(b"a", 0).unwrap();

        // The staged immediate expiry hides `a` from the scan, but the base
        // key must not be materialized away.
        assert_eq!(engine.range(None, None).unwrap(), vec![b"b".to_vec()]);

        engine.abort().unwrap();
        assert_eq!(
            engine.range(None, None).unwrap(),
            vec![b"a".to_vec(), b"b".to_vec()]
        );
    }

    #[test]
    fn range_within_bounds_sees_only_bounded_overlay_keys() {
        let dir = TempDir::new().unwrap();
        let mut engine = open(&db_path(&dir));

        engine.set(b"m".to_vec(), b"base".to_vec()).unwrap();

        engine.begin().unwrap();
        engine.set(b"a".to_vec(), b"out".to_vec()).unwrap();
        engine.set(b"n".to_vec(), b"in".to_vec()).unwrap();
        engine.set(b"z".to_vec(), b"out".to_vec()).unwrap();

        assert_eq!(
            engine.range(Some(b"m"), Some(b"p")).unwrap(),
            vec![b"m".to_vec(), b"n".to_vec()]
        );
        engine.abort().unwrap();
    }
}

//! Integration tests for the delivery store: add, pop, remove, clear.
//!
//! Each test works in its own temporary directory and inspects the
//! on-disk layout directly, since the directory tree is the store's
//! only state.

use std::fs;
use std::path::Path;

use streamr::{make_key, DeliveryStore, Record, StoreError};
use tempfile::TempDir;

fn test_store() -> (TempDir, DeliveryStore) {
    let dir = TempDir::new().unwrap();
    let store = DeliveryStore::open(dir.path()).unwrap();
    (dir, store)
}

fn test_record(path: &str) -> Record {
    Record::new(
        format!("http://example.com/{}", path),
        format!("https://cdn.example.com/{}.mp3", path.replace('/', "-")),
    )
    .unwrap()
}

fn pending(root: &Path, record: &Record) -> std::path::PathBuf {
    root.join("pending").join(record.key().to_path())
}

fn seen(root: &Path, record: &Record) -> std::path::PathBuf {
    root.join("seen").join(record.key().to_path())
}

// ============================================================================
// Add
// ============================================================================

#[test]
fn test_add_twice_keeps_single_pending_file() {
    let (dir, store) = test_store();
    let record = test_record("shows/ep1");

    assert!(store.add(&record).unwrap());
    assert!(store.contains(&record).unwrap());

    assert!(!store.add(&record).unwrap());
    assert!(store.contains(&record).unwrap());

    assert!(pending(dir.path(), &record).is_file());
    assert_eq!(store.count().unwrap(), 1);
}

#[test]
fn test_seen_record_is_not_requeued() {
    let (dir, store) = test_store();
    let record = test_record("shows/ep1");

    store.add(&record).unwrap();
    store.remove(&record).unwrap();

    assert!(!store.add(&record).unwrap());
    assert!(!pending(dir.path(), &record).exists());
    assert!(store.contains(&record).unwrap());
}

#[test]
fn test_update_counts_only_new_records() {
    let (_dir, store) = test_store();
    let records = vec![test_record("a/1"), test_record("a/2"), test_record("a/1")];

    assert_eq!(store.update(&records).unwrap(), 2);
    assert_eq!(store.update(&records).unwrap(), 0);
}

#[test]
fn test_stored_record_reads_back_unchanged() {
    let (_dir, store) = test_store();
    let record = test_record("shows/ep1").with_meta("title", "Episode  one\n(live)");

    store.add(&record).unwrap();
    let stored = store.peek().unwrap();

    assert_eq!(stored, record);
    assert_eq!(stored.meta()["title"], "Episode one (live)");
}

#[test]
fn test_line_breaks_in_urls_cannot_inject_fields() {
    let (_dir, store) = test_store();
    let record = Record::new(
        "http://example.com/ep/1",
        "http://cdn.example.com/1.mp3\nlink http://evil.example.com/x",
    )
    .unwrap();

    store.add(&record).unwrap();
    let stored = store.peek().unwrap();

    assert_eq!(stored, record);
    assert_eq!(stored.link(), "http://example.com/ep/1");
    assert!(!stored.url().contains('\n'));
}

#[test]
fn test_prefix_keys_do_not_block_the_queue() {
    let (_dir, store) = test_store();
    store.add(&test_record("show")).unwrap();
    store.pop().unwrap();

    assert!(matches!(
        store.add(&test_record("show/ep1")),
        Err(StoreError::Conflict { .. })
    ));
    store.add(&test_record("news/1")).unwrap();

    assert_eq!(store.pop().unwrap(), test_record("news/1"));
    assert!(matches!(store.pop(), Err(StoreError::Empty)));
}

#[test]
fn test_links_on_different_hosts_share_a_key() {
    let (_dir, store) = test_store();
    let first = Record::new("http://a.example.com/ep/1", "http://cdn/a.mp3").unwrap();
    let second = Record::new("https://b.example.org/ep/1", "http://cdn/b.mp3").unwrap();
    assert_eq!(first.key(), second.key());

    assert!(store.add(&first).unwrap());
    assert!(!store.add(&second).unwrap());
    assert_eq!(store.peek().unwrap().url(), "http://cdn/a.mp3");
}

// ============================================================================
// Pop / Remove
// ============================================================================

#[test]
fn test_pop_moves_record_to_seen() {
    let (dir, store) = test_store();
    let record = test_record("shows/ep1");
    store.add(&record).unwrap();

    let popped = store.pop().unwrap();
    assert_eq!(popped, record);
    assert!(!pending(dir.path(), &record).exists());
    assert!(seen(dir.path(), &record).is_file());

    assert!(matches!(store.pop(), Err(StoreError::Empty)));
}

#[test]
fn test_pop_drains_every_record_once() {
    let (_dir, store) = test_store();
    for n in 0..5 {
        store.add(&test_record(&format!("shows/ep{n}"))).unwrap();
    }

    let mut links: Vec<String> = (0..5)
        .map(|_| store.pop().unwrap().link().to_string())
        .collect();
    links.sort();
    links.dedup();

    assert_eq!(links.len(), 5);
    assert!(matches!(store.pop(), Err(StoreError::Empty)));
}

#[test]
fn test_peek_leaves_record_pending() {
    let (dir, store) = test_store();
    let record = test_record("ep1");
    store.add(&record).unwrap();

    assert_eq!(store.peek().unwrap(), record);
    assert_eq!(store.peek().unwrap(), record);
    assert!(pending(dir.path(), &record).is_file());
}

#[test]
fn test_remove_unknown_key_is_not_found() {
    let (_dir, store) = test_store();
    let key = make_key("http://example.com/never/added").unwrap();

    match store.remove_key(&key) {
        Err(StoreError::NotFound(k)) => assert_eq!(k, key),
        other => panic!("Expected NotFound, got {:?}", other),
    }
}

#[test]
fn test_remove_key_keeps_sibling_records_pending() {
    let (_dir, store) = test_store();
    let first = test_record("shows/ep1");
    let second = test_record("shows/ep2");
    store.add(&first).unwrap();
    store.add(&second).unwrap();

    store.remove_key(first.key()).unwrap();

    assert_eq!(store.count().unwrap(), 1);
    assert_eq!(store.peek().unwrap(), second);
}

// ============================================================================
// Crash boundaries
// ============================================================================

#[test]
fn test_record_is_never_pending_and_seen() {
    let (dir, store) = test_store();
    let records: Vec<Record> = (0..4).map(|n| test_record(&format!("x/{n}"))).collect();
    store.update(&records).unwrap();
    store.pop().unwrap();
    store.remove(&records[3]).unwrap_or(());

    for record in &records {
        let in_pending = pending(dir.path(), record).exists();
        let in_seen = seen(dir.path(), record).exists();
        assert!(in_pending != in_seen, "{} in both or neither", record.key());
    }
}

#[test]
fn test_staging_leftovers_are_not_listed() {
    let (dir, store) = test_store();
    fs::write(
        dir.path().join("staging").join("1234.0.0"),
        "link http://example.com/half\nurl http://cdn/half.mp3\n",
    )
    .unwrap();

    assert_eq!(store.count().unwrap(), 0);
    assert!(matches!(store.peek(), Err(StoreError::Empty)));
}

#[test]
fn test_reopen_sees_existing_state() {
    let dir = TempDir::new().unwrap();
    let record = test_record("shows/ep1");
    DeliveryStore::open(dir.path()).unwrap().add(&record).unwrap();

    let store = DeliveryStore::open(dir.path()).unwrap();
    assert!(store.contains(&record).unwrap());
    assert_eq!(store.pop().unwrap(), record);
}

#[test]
fn test_bare_url_file_is_read_as_legacy_record() {
    let (dir, store) = test_store();
    let file = dir.path().join("pending").join("old").join("ep");
    fs::create_dir_all(file.parent().unwrap()).unwrap();
    fs::write(&file, "http://cdn.example.com/old.mp3\n").unwrap();

    let record = store.pop().unwrap();
    assert_eq!(record.key().as_str(), "old/ep");
    assert_eq!(record.url(), "http://cdn.example.com/old.mp3");
    assert!(dir.path().join("seen").join("old").join("ep").is_file());
}

// ============================================================================
// Clear
// ============================================================================

#[test]
fn test_clear_forgets_pending_and_seen() {
    let (_dir, store) = test_store();
    let first = test_record("ep1");
    let second = test_record("ep2");
    store.add(&first).unwrap();
    store.add(&second).unwrap();
    store.remove(&first).unwrap();

    store.clear().unwrap();

    assert!(!store.contains(&first).unwrap());
    assert!(!store.contains(&second).unwrap());
    assert!(store.add(&first).unwrap());
}

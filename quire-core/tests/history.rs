//! Cross-component behaviour of a history directory

use quire_core::{
    Config, History, QuireError, RetentionPolicy, SessionManager,
};
use rusqlite::Connection;
use std::fs;
use std::path::PathBuf;
use std::thread;
use std::time::Duration;
use tempfile::TempDir;

fn open_history(debounce: &str) -> (TempDir, History) {
    let dir = TempDir::new().unwrap();
    let mut config = Config::default();
    config.session.autosave_debounce = debounce.to_string();
    let history = History::open(&dir.path().join("history"), &config).unwrap();
    (dir, history)
}

fn drop_index_table(history: &History) {
    Connection::open(history.index().path())
        .unwrap()
        .execute_batch("DROP TABLE compositions")
        .unwrap();
}

fn create_many(session: &SessionManager, n: usize) -> Vec<PathBuf> {
    (0..n)
        .map(|i| session.new_composition("/tmp/proj", &format!("composition {i}")).unwrap())
        .collect()
}

#[test]
fn test_composition_round_trips_through_file_store() {
    let (_dir, history) = open_history("750ms");
    let session = history.session();

    let content = "# Title\n\nSome *markdown* with ünïcödé\n";
    let path = session.new_composition("/tmp/proj", content).unwrap();

    let reopened = history.session();
    assert_eq!(reopened.load(&path).unwrap(), content);
    assert_eq!(fs::read_to_string(&path).unwrap(), content);
    assert_eq!(reopened.working_directory().as_deref(), Some("/tmp/proj"));
}

#[test]
fn test_failed_index_insert_rolls_back_file() {
    let (_dir, history) = open_history("750ms");
    drop_index_table(&history);

    let err = history.session().new_composition("/tmp", "lost").unwrap_err();
    assert!(matches!(err, QuireError::Index(_)), "{err}");
    assert!(history.store().list().unwrap().is_empty());
}

#[test]
fn test_save_keeps_file_when_index_fails() {
    let (_dir, history) = open_history("750ms");
    let session = history.session();
    let path = session.new_composition("/tmp", "before").unwrap();

    drop_index_table(&history);
    session.save("after").unwrap();

    assert_eq!(history.store().read(&path).unwrap(), "after");
}

#[test]
fn test_verify_reports_each_kind_of_drift() {
    let (_dir, history) = open_history("750ms");
    let session = history.session();
    let paths = create_many(&session, 3);

    assert!(history.checker().verify().unwrap().is_synced());

    let stray = history.store().create("/tmp", "written behind the index").unwrap();
    fs::remove_file(&paths[0]).unwrap();

    let report = history.checker().verify().unwrap();
    assert_eq!(report.missing_entries, vec![stray]);
    assert_eq!(report.missing_files, vec![paths[0].clone()]);
    assert!(report.mismatches.is_empty());
    assert_eq!(report.total_files, 3);
    assert_eq!(report.total_entries, 3);

    let json = serde_json::to_value(&report).unwrap();
    assert_eq!(json["missing_entries"].as_array().unwrap().len(), 1);

    assert!(matches!(
        report.into_result(),
        Err(QuireError::Drift { missing_entries: 1, missing_files: 1, mismatches: 0 })
    ));
}

#[test]
fn test_rebuild_then_verify_reports_no_drift() {
    let (_dir, history) = open_history("750ms");
    let session = history.session();
    let paths = create_many(&session, 4);

    history.store().create("/tmp", "stray file").unwrap();
    fs::remove_file(&paths[1]).unwrap();
    fs::write(&paths[2], "edited outside quire ".repeat(20)).unwrap();
    assert!(!history.checker().verify().unwrap().is_synced());

    let report = history.checker().rebuild().unwrap();
    assert!(report.is_clean(), "{report:?}");

    let drift = history.checker().verify().unwrap();
    assert!(drift.is_synced(), "{drift:?}");
    assert_eq!(history.listing().count().unwrap(), 4);
    assert_eq!(history.query().search("outside").unwrap().len(), 1);
}

#[test]
fn test_rebuild_recovers_a_deleted_index() {
    let dir = TempDir::new().unwrap();
    let root = dir.path().join("history");
    let paths = {
        let history = History::open(&root, &Config::default()).unwrap();
        create_many(&history.session(), 2)
    };
    for entry in fs::read_dir(&root).unwrap() {
        let path = entry.unwrap().path();
        if path.extension().is_some_and(|ext| ext != "md") {
            fs::remove_file(path).unwrap();
        }
    }

    let history = History::open(&root, &Config::default()).unwrap();
    let before = history.checker().verify().unwrap();
    assert_eq!(before.missing_entries.len(), 2);

    history.checker().rebuild().unwrap();
    for path in &paths {
        let row = history.session().metadata(path).unwrap();
        assert_eq!(row.working_directory, "unknown");
    }
}

#[test]
fn test_retention_preview_is_idempotent() {
    let (_dir, history) = open_history("750ms");
    create_many(&history.session(), 5);

    let retention = history.retention();
    let policy = RetentionPolicy::DeleteOldest(2);
    let first = retention.evaluate(&policy).unwrap();
    let second = retention.evaluate(&policy).unwrap();

    assert_eq!(first, second);
    assert_eq!(first.count(), 2);
    assert_eq!(history.listing().count().unwrap(), 5);
}

#[test]
fn test_keep_recent_leaves_exactly_the_newest_in_both_stores() {
    let (_dir, history) = open_history("750ms");
    let paths = create_many(&history.session(), 10);

    let outcome = history.retention().apply(&RetentionPolicy::KeepRecent(3)).unwrap();
    assert_eq!(outcome.deleted, 7);
    assert_eq!(outcome.failed(), 0);

    let mut remaining_files = history.store().list().unwrap();
    remaining_files.sort();
    let mut newest: Vec<PathBuf> = paths[7..].to_vec();
    newest.sort();
    assert_eq!(remaining_files, newest);

    let mut remaining_rows: Vec<PathBuf> = history
        .session()
        .all_compositions()
        .unwrap()
        .into_iter()
        .map(|c| c.file_path)
        .collect();
    remaining_rows.sort();
    assert_eq!(remaining_rows, newest);
}

#[test]
fn test_highlight_spans_never_nest() {
    let (_dir, history) = open_history("750ms");
    history.session().new_composition("/tmp", "cat catalog").unwrap();

    let results = history.query().search("cat").unwrap();
    assert_eq!(results.len(), 1);
    let spans: Vec<(usize, usize)> = results[0].matches.iter().map(|m| (m.start, m.end)).collect();
    assert_eq!(spans, vec![(0, 3), (4, 7)]);
}

#[test]
fn test_auto_save_debounce_writes_last_content_once() {
    let (_dir, history) = open_history("60ms");
    let session = history.session();
    let path = session.new_composition("/tmp", "").unwrap();

    session.trigger_auto_save("first draft");
    thread::sleep(Duration::from_millis(10));
    session.trigger_auto_save("second draft");

    thread::sleep(Duration::from_millis(500));
    assert_eq!(session.completed_saves(), 1);
    assert_eq!(history.store().read(&path).unwrap(), "second draft");
    assert!(history.checker().verify().unwrap().is_synced());
}

#[test]
fn test_hello_world_scenario() {
    let (_dir, history) = open_history("750ms");
    let session = history.session();
    let path = session.new_composition("/tmp/proj", "hello\nworld").unwrap();

    let meta = session.metadata(&path).unwrap();
    assert_eq!(meta.character_count, 11);
    assert_eq!(meta.line_count, 2);
    assert_eq!(meta.working_directory, "/tmp/proj");

    let results = session.search("hello").unwrap();
    assert_eq!(results.len(), 1);
    assert_eq!(results[0].composition.file_path, path);
    assert_eq!((results[0].matches[0].start, results[0].matches[0].end), (0, 5));
}

#[test]
fn test_backup_is_a_usable_copy() {
    let (_dir, history) = open_history("750ms");
    create_many(&history.session(), 2);

    let backup = history.checker().backup().unwrap();
    assert!(backup.exists());

    let copy = Connection::open(&backup).unwrap();
    let rows: i64 = copy
        .query_row("SELECT COUNT(*) FROM compositions", [], |row| row.get(0))
        .unwrap();
    assert_eq!(rows, 2);
    // backups are not compositions
    assert_eq!(history.store().list().unwrap().len(), 2);
}

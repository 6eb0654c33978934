use assert_matches::assert_matches;
use camino::{Utf8Path, Utf8PathBuf};

use effectifs_etl::clean::{CleanOptions, CleanRecord, clean};
use effectifs_etl::domain::YearRange;
use effectifs_etl::error::{LoadError, StoreError};
use effectifs_etl::load::{LoadAction, LoadOptions, load};
use effectifs_etl::progress::{ProgressTracker, Stage};
use effectifs_etl::store::{EffectifsStore, LabelColumn, LoadCheckpoint, SqliteStore};

const HEADER: &str = "annee;patho_niv1;patho_niv2;patho_niv3;top;cla_age_5;sexe;region;dept;Ntop;Npop;prev;Niveau prioritaire;libelle_classe_age;libelle_sexe;tri";

fn scratch() -> (tempfile::TempDir, Utf8PathBuf) {
    let temp = tempfile::tempdir().unwrap();
    let root = Utf8PathBuf::from_path_buf(temp.path().to_path_buf()).unwrap();
    (temp, root)
}

/// Cleans `rows` synthetic rows and returns the cleaned file path.
fn cleaned_dataset(root: &Utf8Path, rows: usize) -> Utf8PathBuf {
    let mut content = format!("{HEADER}\n");
    for idx in 0..rows {
        content.push_str(&format!(
            "2023;Cancers;;;CAN;tsage;9;11;75;{idx};1000;1.5;;tous âges;tous sexes;{idx}\n"
        ));
    }
    let raw = root.join("effectifs.csv");
    std::fs::write(raw.as_std_path(), content).unwrap();

    let clean_path = root.join("csv_clean.csv");
    let tracker = ProgressTracker::new();
    tracker.advance_to(Stage::Cleaning, "cleaning");
    let options = CleanOptions {
        chunk_rows: 100,
        years: YearRange::default(),
        decode_fallback: None,
        force: false,
    };
    clean(&raw, &clean_path, &options, &tracker).unwrap();
    clean_path
}

fn loading_tracker() -> ProgressTracker {
    let tracker = ProgressTracker::new();
    tracker.advance_to(Stage::Loading, "loading store");
    tracker
}

/// Delegates to a real store but fails one chosen batch once.
struct FailingStore<'a> {
    inner: &'a mut SqliteStore,
    fail_batch: u64,
    tripped: bool,
}

impl EffectifsStore for FailingStore<'_> {
    fn table_name(&self) -> &str {
        self.inner.table_name()
    }

    fn checkpoint(&self) -> Result<Option<LoadCheckpoint>, StoreError> {
        self.inner.checkpoint()
    }

    fn row_count(&self) -> Result<u64, StoreError> {
        self.inner.row_count()
    }

    fn reset(&mut self, version: &str, batch_size: usize, total_rows: u64) -> Result<(), StoreError> {
        self.inner.reset(version, batch_size, total_rows)
    }

    fn commit_batch(&mut self, batch_index: u64, rows: &[CleanRecord]) -> Result<(), StoreError> {
        if batch_index == self.fail_batch && !self.tripped {
            self.tripped = true;
            return Err(StoreError::Filesystem("injected failure".to_string()));
        }
        self.inner.commit_batch(batch_index, rows)
    }

    fn build_indexes(&mut self) -> Result<(), StoreError> {
        self.inner.build_indexes()
    }

    fn mark_completed(&mut self) -> Result<(), StoreError> {
        self.inner.mark_completed()
    }

    fn distinct_labels(&self, column: LabelColumn) -> Result<Vec<String>, StoreError> {
        self.inner.distinct_labels(column)
    }

    fn count_label(&self, column: LabelColumn, label: &str) -> Result<u64, StoreError> {
        self.inner.count_label(column, label)
    }

    fn relabel_batch(
        &mut self,
        column: LabelColumn,
        from: &str,
        to: &str,
        limit: usize,
    ) -> Result<u64, StoreError> {
        self.inner.relabel_batch(column, from, to, limit)
    }
}

#[test]
fn load_then_cache_hit() {
    let (_temp, root) = scratch();
    let clean_path = cleaned_dataset(&root, 5);
    let mut store = SqliteStore::open(&root.join("effectifs.sqlite3"), "effectifs").unwrap();
    let options = LoadOptions {
        batch_size: 2,
        force: false,
    };

    let tracker = loading_tracker();
    let report = load(&clean_path, &mut store, options, &tracker).unwrap();
    assert_eq!(report.action, LoadAction::Loaded);
    assert_eq!(report.rows, 5);
    assert_eq!(report.batches_committed, 3);
    let snapshot = tracker.snapshot();
    assert_eq!(snapshot.percent, Some(100.0));
    assert_eq!(snapshot.sub_stage.as_deref(), Some("indexing"));

    let checkpoint = store.checkpoint().unwrap().unwrap();
    assert!(checkpoint.completed);
    assert!(checkpoint.indexed);
    assert_eq!(checkpoint.last_committed_batch, Some(2));

    let again = load(&clean_path, &mut store, options, &loading_tracker()).unwrap();
    assert_eq!(again.action, LoadAction::Cached);
    assert_eq!(store.row_count().unwrap(), 5);
}

#[test]
fn failed_batch_resumes_without_duplicates() {
    let (_temp, root) = scratch();
    let clean_path = cleaned_dataset(&root, 7);
    let mut store = SqliteStore::open(&root.join("effectifs.sqlite3"), "effectifs").unwrap();
    let options = LoadOptions {
        batch_size: 3,
        force: false,
    };

    let result = {
        let mut failing = FailingStore {
            inner: &mut store,
            fail_batch: 1,
            tripped: false,
        };
        load(&clean_path, &mut failing, options, &loading_tracker())
    };
    let err = result.unwrap_err();
    assert!(err.is_retryable());
    assert_matches!(
        err,
        LoadError::Batch {
            batch: 1,
            last_committed: Some(0),
            ..
        }
    );
    assert_eq!(store.row_count().unwrap(), 3);

    // A different batch size on retry must not shift batch boundaries.
    let retry = LoadOptions {
        batch_size: 50,
        force: false,
    };
    let report = load(&clean_path, &mut store, retry, &loading_tracker()).unwrap();
    assert_eq!(report.action, LoadAction::Resumed);
    assert_eq!(report.batch_size, 3);
    assert_eq!(report.batches_skipped, 1);
    assert_eq!(report.batches_committed, 2);
    assert_eq!(store.row_count().unwrap(), 7);

    let ntop: Vec<i64> = {
        let mut stmt = store
            .connection()
            .prepare("SELECT Ntop FROM effectifs ORDER BY id")
            .unwrap();
        stmt.query_map([], |row| row.get(0))
            .unwrap()
            .map(Result::unwrap)
            .collect()
    };
    assert_eq!(ntop, vec![0, 1, 2, 3, 4, 5, 6]);
}

#[test]
fn force_reloads_from_scratch() {
    let (_temp, root) = scratch();
    let clean_path = cleaned_dataset(&root, 4);
    let mut store = SqliteStore::open(&root.join("effectifs.sqlite3"), "effectifs").unwrap();

    let options = LoadOptions {
        batch_size: 10,
        force: false,
    };
    load(&clean_path, &mut store, options, &loading_tracker()).unwrap();
    let forced = LoadOptions {
        batch_size: 10,
        force: true,
    };
    let report = load(&clean_path, &mut store, forced, &loading_tracker()).unwrap();
    assert_eq!(report.action, LoadAction::Loaded);
    assert_eq!(store.row_count().unwrap(), 4);
}

#[test]
fn cleaned_file_without_manifest_is_refused() {
    let (_temp, root) = scratch();
    let clean_path = root.join("csv_clean.csv");
    std::fs::write(clean_path.as_std_path(), "annee;patho_niv1\n2023;Cancers\n").unwrap();
    let mut store = SqliteStore::open(&root.join("effectifs.sqlite3"), "effectifs").unwrap();

    let options = LoadOptions {
        batch_size: 10,
        force: false,
    };
    let result = load(&clean_path, &mut store, options, &loading_tracker());
    assert_matches!(result, Err(LoadError::IncompleteInput(_)));
    assert_eq!(store.row_count().unwrap(), 0);
}

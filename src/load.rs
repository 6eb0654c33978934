use camino::Utf8Path;
use csv::{ByteRecord, ReaderBuilder};
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::clean::{CLEAN_DELIMITER, CleanRecord, read_manifest};
use crate::error::{LoadError, StoreError};
use crate::progress::{ProgressTracker, Stage};
use crate::store::{EffectifsStore, LoadCheckpoint};

#[derive(Debug, Clone, Copy)]
pub struct LoadOptions {
    pub batch_size: usize,
    pub force: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LoadAction {
    Cached,
    Resumed,
    Loaded,
}

#[derive(Debug, Clone, Serialize)]
pub struct LoadReport {
    pub table: String,
    pub version: String,
    pub rows: u64,
    pub batch_size: usize,
    pub batches_skipped: u64,
    pub batches_committed: u64,
    pub action: LoadAction,
}

struct Plan {
    action: LoadAction,
    batch_size: usize,
    first_batch: u64,
}

pub fn load(
    clean_path: &Utf8Path,
    store: &mut dyn EffectifsStore,
    options: LoadOptions,
    tracker: &ProgressTracker,
) -> Result<LoadReport, LoadError> {
    let manifest = read_manifest(clean_path)
        .ok_or_else(|| LoadError::IncompleteInput(clean_path.as_std_path().to_path_buf()))?;
    let total = manifest.counters.rows_kept;
    let version = manifest.version.clone();
    let table = store.table_name().to_string();

    let checkpoint = store.checkpoint()?;
    let existing = store.row_count()?;
    let plan = plan_load(checkpoint.as_ref(), &version, total, existing, options);

    if plan.action == LoadAction::Cached {
        info!(table = %table, rows = existing, "store already loaded");
        tracker.report(
            Stage::Loading,
            Some(100.0),
            format!("store already holds {existing} rows"),
        );
        return Ok(LoadReport {
            table,
            version,
            rows: existing,
            batch_size: plan.batch_size,
            batches_skipped: 0,
            batches_committed: 0,
            action: LoadAction::Cached,
        });
    }

    if plan.action == LoadAction::Loaded {
        store
            .reset(&version, plan.batch_size, total)
            .map_err(|source| LoadError::Schema { source })?;
    } else {
        info!(table = %table, from_batch = plan.first_batch, "resuming interrupted load");
        tracker.log(format!("resuming load at batch {}", plan.first_batch));
    }

    let mut reader = ReaderBuilder::new()
        .delimiter(CLEAN_DELIMITER)
        .has_headers(true)
        .from_path(clean_path.as_std_path())
        .map_err(|err| LoadError::Read(err.to_string()))?;

    let skip_rows = plan.first_batch * plan.batch_size as u64;
    let mut skipped = ByteRecord::new();
    for _ in 0..skip_rows {
        let more = reader
            .read_byte_record(&mut skipped)
            .map_err(|err| LoadError::Read(err.to_string()))?;
        if !more {
            break;
        }
    }

    let mut loaded = skip_rows.min(total);
    let mut last_committed = plan.first_batch.checked_sub(1);
    let mut batch_index = plan.first_batch;
    let mut committed = 0u64;
    let mut rows = reader.deserialize::<CleanRecord>();

    loop {
        let mut batch = Vec::with_capacity(plan.batch_size);
        for row in rows.by_ref().take(plan.batch_size) {
            batch.push(row.map_err(|err| LoadError::Read(err.to_string()))?);
        }
        if batch.is_empty() {
            break;
        }

        store
            .commit_batch(batch_index, &batch)
            .map_err(|source| batch_error(batch_index, last_committed, source))?;
        debug!(batch = batch_index, rows = batch.len(), "committed batch");
        last_committed = Some(batch_index);
        committed += 1;
        loaded += batch.len() as u64;
        batch_index += 1;

        let percent = if total == 0 {
            100.0
        } else {
            (loaded as f64 / total as f64 * 100.0) as f32
        };
        tracker.report(
            Stage::Loading,
            Some(percent),
            format!("loaded {loaded} of {total} rows"),
        );
    }

    let found = store.row_count()?;
    if found != total {
        return Err(LoadError::CountMismatch {
            expected: total,
            found,
        });
    }

    tracker.sub_stage(Stage::Loading, "indexing");
    store.build_indexes()?;
    store.mark_completed()?;

    info!(table = %table, rows = found, batches = committed, "store loaded");
    tracker.report(Stage::Loading, Some(100.0), format!("loaded {found} rows"));
    Ok(LoadReport {
        table,
        version,
        rows: found,
        batch_size: plan.batch_size,
        batches_skipped: plan.first_batch,
        batches_committed: committed,
        action: plan.action,
    })
}

fn plan_load(
    checkpoint: Option<&LoadCheckpoint>,
    version: &str,
    total: u64,
    existing: u64,
    options: LoadOptions,
) -> Plan {
    let fresh = Plan {
        action: LoadAction::Loaded,
        batch_size: options.batch_size.max(1),
        first_batch: 0,
    };
    let Some(checkpoint) = checkpoint else {
        return fresh;
    };
    if options.force || checkpoint.version != version || checkpoint.total_rows != total {
        return fresh;
    }

    if checkpoint.completed {
        if existing > 0 && existing == total {
            return Plan {
                action: LoadAction::Cached,
                batch_size: checkpoint.batch_size,
                first_batch: 0,
            };
        }
        return fresh;
    }

    // Batches up to the checkpoint are durable; anything else means the table was touched.
    let Some(last) = checkpoint.last_committed_batch else {
        return fresh;
    };
    let first_batch = last + 1;
    let expected = (first_batch * checkpoint.batch_size as u64).min(total);
    if existing != expected {
        warn!(existing, expected, "store rows disagree with checkpoint, reloading");
        return fresh;
    }
    Plan {
        action: LoadAction::Resumed,
        batch_size: checkpoint.batch_size,
        first_batch,
    }
}

fn batch_error(batch: u64, last_committed: Option<u64>, source: StoreError) -> LoadError {
    if source.is_disk_full() {
        LoadError::DiskFull { batch }
    } else {
        LoadError::Batch {
            batch,
            last_committed,
            source,
        }
    }
}

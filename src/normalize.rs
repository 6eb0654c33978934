use serde::Serialize;
use tracing::{debug, info};

use crate::error::{NormalizeError, StoreError};
use crate::labels::{MAX_LABEL_CHARS, alias_for, is_long};
use crate::progress::{ProgressTracker, Stage};
use crate::store::{EffectifsStore, LabelColumn};

#[derive(Debug, Clone, Copy)]
pub struct NormalizeOptions {
    pub batch_size: usize,
    pub dry_run: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LabelChange {
    pub column: LabelColumn,
    pub from: String,
    pub to: String,
    pub rows: u64,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct NormalizeReport {
    pub dry_run: bool,
    pub rows_updated: u64,
    pub changes: Vec<LabelChange>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LabelAudit {
    pub label: String,
    pub chars: usize,
    pub rows: u64,
    pub overlong: bool,
    pub alias: Option<String>,
}

pub fn normalize_labels(
    store: &mut dyn EffectifsStore,
    options: NormalizeOptions,
    tracker: &ProgressTracker,
) -> Result<NormalizeReport, NormalizeError> {
    let mut pending = Vec::new();
    for column in LabelColumn::ALL {
        let labels = store
            .distinct_labels(column)
            .map_err(|source| store_error(column, source))?;
        pending.extend(
            labels
                .into_iter()
                .filter_map(|label| alias_for(&label).map(|short| (column, label, short))),
        );
    }

    let mut report = NormalizeReport {
        dry_run: options.dry_run,
        ..NormalizeReport::default()
    };
    if pending.is_empty() {
        info!("pathology labels already canonical");
        tracker.report(Stage::Normalizing, Some(100.0), "labels already canonical");
        return Ok(report);
    }

    let limit = options.batch_size.max(1);
    let total = pending.len();
    for (done, (column, from, to)) in pending.into_iter().enumerate() {
        let rows = if options.dry_run {
            store
                .count_label(column, &from)
                .map_err(|source| store_error(column, source))?
        } else {
            let mut changed = 0u64;
            loop {
                let batch = store
                    .relabel_batch(column, &from, to, limit)
                    .map_err(|source| store_error(column, source))?;
                if batch == 0 {
                    break;
                }
                changed += batch;
            }
            changed
        };
        debug!(%column, from = %from, to, rows, "relabeled");
        report.rows_updated += rows;
        report.changes.push(LabelChange {
            column,
            from,
            to: to.to_string(),
            rows,
        });
        tracker.report(
            Stage::Normalizing,
            Some(((done + 1) as f64 / total as f64 * 100.0) as f32),
            format!("normalized {} of {total} labels", done + 1),
        );
    }

    info!(
        labels = report.changes.len(),
        rows = report.rows_updated,
        dry_run = options.dry_run,
        "pathology labels normalized"
    );
    Ok(report)
}

/// Every distinct `patho_niv1` label with its length and row count.
pub fn audit_labels(store: &dyn EffectifsStore) -> Result<Vec<LabelAudit>, StoreError> {
    let column = LabelColumn::PathoNiv1;
    let mut audit = Vec::new();
    for label in store.distinct_labels(column)? {
        let rows = store.count_label(column, &label)?;
        audit.push(LabelAudit {
            chars: label.chars().count(),
            overlong: is_long(&label),
            alias: alias_for(&label).map(str::to_string),
            rows,
            label,
        });
    }
    Ok(audit)
}

pub fn overlong_count(audit: &[LabelAudit]) -> usize {
    audit.iter().filter(|entry| entry.chars > MAX_LABEL_CHARS).count()
}

fn store_error(column: LabelColumn, source: StoreError) -> NormalizeError {
    NormalizeError::Store {
        column: column.to_string(),
        source,
    }
}

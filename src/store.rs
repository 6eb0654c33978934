use std::fmt;
use std::str::FromStr;

use camino::Utf8Path;
use chrono::Utc;
use rusqlite::{Connection, OpenFlags, OptionalExtension, params};
use serde::Serialize;
use tracing::debug;

use crate::clean::CleanRecord;
use crate::error::StoreError;
use crate::layout::ensure_parent;

pub const CHECKPOINT_TABLE: &str = "etl_load_state";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LabelColumn {
    PathoNiv1,
    PathoNiv2,
    PathoNiv3,
}

impl LabelColumn {
    pub const ALL: [LabelColumn; 3] = [
        LabelColumn::PathoNiv1,
        LabelColumn::PathoNiv2,
        LabelColumn::PathoNiv3,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            LabelColumn::PathoNiv1 => "patho_niv1",
            LabelColumn::PathoNiv2 => "patho_niv2",
            LabelColumn::PathoNiv3 => "patho_niv3",
        }
    }
}

impl fmt::Display for LabelColumn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for LabelColumn {
    type Err = StoreError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        LabelColumn::ALL
            .into_iter()
            .find(|column| column.as_str().eq_ignore_ascii_case(value.trim()))
            .ok_or_else(|| StoreError::InvalidColumn(value.to_string()))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LoadCheckpoint {
    pub table_name: String,
    pub version: String,
    pub batch_size: usize,
    pub total_rows: u64,
    pub last_committed_batch: Option<u64>,
    pub indexed: bool,
    pub completed: bool,
    pub updated_at: String,
}

/// Write side of the effectifs table used by the loader and the label normalizer.
pub trait EffectifsStore {
    fn table_name(&self) -> &str;
    fn checkpoint(&self) -> Result<Option<LoadCheckpoint>, StoreError>;
    fn row_count(&self) -> Result<u64, StoreError>;
    /// Drops and recreates the table, recording a fresh checkpoint.
    fn reset(&mut self, version: &str, batch_size: usize, total_rows: u64)
    -> Result<(), StoreError>;
    /// Inserts `rows` and advances the checkpoint in one transaction.
    fn commit_batch(&mut self, batch_index: u64, rows: &[CleanRecord]) -> Result<(), StoreError>;
    fn build_indexes(&mut self) -> Result<(), StoreError>;
    fn mark_completed(&mut self) -> Result<(), StoreError>;
    fn distinct_labels(&self, column: LabelColumn) -> Result<Vec<String>, StoreError>;
    fn count_label(&self, column: LabelColumn, label: &str) -> Result<u64, StoreError>;
    /// Rewrites at most `limit` rows holding `from`; returns how many changed.
    fn relabel_batch(
        &mut self,
        column: LabelColumn,
        from: &str,
        to: &str,
        limit: usize,
    ) -> Result<u64, StoreError>;
}

pub struct SqliteStore {
    conn: Connection,
    table: String,
    quoted: String,
}

impl SqliteStore {
    pub fn open(path: &Utf8Path, table: &str) -> Result<Self, StoreError> {
        ensure_parent(path).map_err(|err| StoreError::Filesystem(err.to_string()))?;
        let conn = Connection::open(path.as_std_path())?;
        conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get::<_, String>(0))?;
        conn.pragma_update(None, "synchronous", "NORMAL")?;
        conn.pragma_update(None, "temp_store", "MEMORY")?;
        Self::with_connection(conn, table)
    }

    pub fn open_in_memory(table: &str) -> Result<Self, StoreError> {
        Self::with_connection(Connection::open_in_memory()?, table)
    }

    /// Handle for downstream consumers; every write method fails on it.
    pub fn open_read_only(path: &Utf8Path, table: &str) -> Result<Self, StoreError> {
        let conn = Connection::open_with_flags(
            path.as_std_path(),
            OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )?;
        let quoted = quote_identifier(table)?;
        Ok(Self {
            conn,
            table: table.to_string(),
            quoted,
        })
    }

    fn with_connection(conn: Connection, table: &str) -> Result<Self, StoreError> {
        let quoted = quote_identifier(table)?;
        conn.execute_batch(&format!(
            "CREATE TABLE IF NOT EXISTS {CHECKPOINT_TABLE} (
                table_name TEXT PRIMARY KEY,
                version TEXT NOT NULL,
                batch_size INTEGER NOT NULL,
                total_rows INTEGER NOT NULL,
                last_committed_batch INTEGER,
                indexed INTEGER NOT NULL DEFAULT 0,
                completed INTEGER NOT NULL DEFAULT 0,
                updated_at TEXT NOT NULL
            );"
        ))?;
        Ok(Self {
            conn,
            table: table.to_string(),
            quoted,
        })
    }

    pub fn connection(&self) -> &Connection {
        &self.conn
    }

    fn has_table(&self, name: &str) -> Result<bool, StoreError> {
        let found: Option<i64> = self
            .conn
            .query_row(
                "SELECT 1 FROM sqlite_master WHERE type = 'table' AND name = ?1",
                [name],
                |row| row.get(0),
            )
            .optional()?;
        Ok(found.is_some())
    }

    fn index_name(&self, suffix: &str) -> String {
        format!("\"idx_{}_{suffix}\"", self.table)
    }
}

impl EffectifsStore for SqliteStore {
    fn table_name(&self) -> &str {
        &self.table
    }

    fn checkpoint(&self) -> Result<Option<LoadCheckpoint>, StoreError> {
        if !self.has_table(CHECKPOINT_TABLE)? {
            return Ok(None);
        }
        let checkpoint = self
            .conn
            .query_row(
                &format!(
                    "SELECT table_name, version, batch_size, total_rows, last_committed_batch,
                            indexed, completed, updated_at
                     FROM {CHECKPOINT_TABLE} WHERE table_name = ?1"
                ),
                [&self.table],
                |row| {
                    Ok(LoadCheckpoint {
                        table_name: row.get(0)?,
                        version: row.get(1)?,
                        batch_size: row.get::<_, i64>(2)?.max(1) as usize,
                        total_rows: row.get::<_, i64>(3)?.max(0) as u64,
                        last_committed_batch: row
                            .get::<_, Option<i64>>(4)?
                            .map(|batch| batch.max(0) as u64),
                        indexed: row.get(5)?,
                        completed: row.get(6)?,
                        updated_at: row.get(7)?,
                    })
                },
            )
            .optional()?;
        Ok(checkpoint)
    }

    fn row_count(&self) -> Result<u64, StoreError> {
        if !self.has_table(&self.table)? {
            return Ok(0);
        }
        let count: i64 = self.conn.query_row(
            &format!("SELECT COUNT(*) FROM {}", self.quoted),
            [],
            |row| row.get(0),
        )?;
        Ok(count.max(0) as u64)
    }

    fn reset(
        &mut self,
        version: &str,
        batch_size: usize,
        total_rows: u64,
    ) -> Result<(), StoreError> {
        let table = &self.quoted;
        let tx = self.conn.transaction()?;
        tx.execute_batch(&format!(
            "DROP TABLE IF EXISTS {table};
             CREATE TABLE {table} (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                annee INTEGER NOT NULL,
                patho_niv1 TEXT NOT NULL,
                patho_niv2 TEXT,
                patho_niv3 TEXT,
                top TEXT,
                cla_age_5 TEXT NOT NULL,
                sexe INTEGER NOT NULL,
                region TEXT NOT NULL,
                dept TEXT NOT NULL,
                niveau_territoire TEXT NOT NULL,
                Ntop INTEGER,
                Npop INTEGER,
                prev REAL,
                niveau_prioritaire INTEGER,
                libelle_sexe TEXT,
                tri REAL
             );"
        ))?;
        tx.execute(
            &format!(
                "INSERT OR REPLACE INTO {CHECKPOINT_TABLE}
                    (table_name, version, batch_size, total_rows, last_committed_batch,
                     indexed, completed, updated_at)
                 VALUES (?1, ?2, ?3, ?4, NULL, 0, 0, ?5)"
            ),
            params![
                self.table,
                version,
                batch_size as i64,
                total_rows as i64,
                Utc::now().to_rfc3339()
            ],
        )?;
        tx.commit()?;
        debug!(table = %self.table, version, "store reset");
        Ok(())
    }

    fn commit_batch(&mut self, batch_index: u64, rows: &[CleanRecord]) -> Result<(), StoreError> {
        let tx = self.conn.transaction()?;
        {
            let mut insert = tx.prepare_cached(&format!(
                "INSERT INTO {} (annee, patho_niv1, patho_niv2, patho_niv3, top, cla_age_5, sexe,
                    region, dept, niveau_territoire, Ntop, Npop, prev, niveau_prioritaire,
                    libelle_sexe, tri)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16)",
                self.quoted
            ))?;
            for row in rows {
                insert.execute(params![
                    row.annee,
                    row.patho_niv1,
                    row.patho_niv2,
                    row.patho_niv3,
                    row.top,
                    row.cla_age_5,
                    row.sexe,
                    row.region,
                    row.dept,
                    row.niveau_territoire.as_str(),
                    row.ntop,
                    row.npop,
                    row.prev,
                    row.niveau_prioritaire,
                    row.libelle_sexe,
                    row.tri,
                ])?;
            }
        }
        tx.execute(
            &format!(
                "UPDATE {CHECKPOINT_TABLE} SET last_committed_batch = ?1, updated_at = ?2
                 WHERE table_name = ?3"
            ),
            params![batch_index as i64, Utc::now().to_rfc3339(), self.table],
        )?;
        tx.commit()?;
        Ok(())
    }

    fn build_indexes(&mut self) -> Result<(), StoreError> {
        let statements = format!(
            "CREATE INDEX IF NOT EXISTS {territory} ON {table} (niveau_territoire, region, dept);
             CREATE INDEX IF NOT EXISTS {year} ON {table} (annee);
             CREATE INDEX IF NOT EXISTS {pathology} ON {table} (patho_niv1, patho_niv2, patho_niv3);",
            table = self.quoted,
            territory = self.index_name("territory"),
            year = self.index_name("year"),
            pathology = self.index_name("pathology"),
        );
        let tx = self.conn.transaction()?;
        tx.execute_batch(&statements)?;
        tx.execute(
            &format!(
                "UPDATE {CHECKPOINT_TABLE} SET indexed = 1, updated_at = ?1 WHERE table_name = ?2"
            ),
            params![Utc::now().to_rfc3339(), self.table],
        )?;
        tx.commit()?;
        Ok(())
    }

    fn mark_completed(&mut self) -> Result<(), StoreError> {
        self.conn.execute(
            &format!(
                "UPDATE {CHECKPOINT_TABLE} SET completed = 1, updated_at = ?1 WHERE table_name = ?2"
            ),
            params![Utc::now().to_rfc3339(), self.table],
        )?;
        Ok(())
    }

    fn distinct_labels(&self, column: LabelColumn) -> Result<Vec<String>, StoreError> {
        if !self.has_table(&self.table)? {
            return Ok(Vec::new());
        }
        let mut stmt = self.conn.prepare(&format!(
            "SELECT DISTINCT {column} FROM {} WHERE {column} IS NOT NULL ORDER BY {column}",
            self.quoted
        ))?;
        let labels = stmt
            .query_map([], |row| row.get::<_, String>(0))?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(labels)
    }

    fn count_label(&self, column: LabelColumn, label: &str) -> Result<u64, StoreError> {
        let count: i64 = self.conn.query_row(
            &format!("SELECT COUNT(*) FROM {} WHERE {column} = ?1", self.quoted),
            [label],
            |row| row.get(0),
        )?;
        Ok(count.max(0) as u64)
    }

    fn relabel_batch(
        &mut self,
        column: LabelColumn,
        from: &str,
        to: &str,
        limit: usize,
    ) -> Result<u64, StoreError> {
        let table = &self.quoted;
        let tx = self.conn.transaction()?;
        let changed = tx.execute(
            &format!(
                "UPDATE {table} SET {column} = ?1
                 WHERE id IN (SELECT id FROM {table} WHERE {column} = ?2 LIMIT ?3)"
            ),
            params![to, from, limit as i64],
        )?;
        tx.execute(
            &format!("UPDATE {CHECKPOINT_TABLE} SET updated_at = ?1 WHERE table_name = ?2"),
            params![Utc::now().to_rfc3339(), self.table],
        )?;
        tx.commit()?;
        Ok(changed as u64)
    }
}

pub fn quote_identifier(name: &str) -> Result<String, StoreError> {
    let mut chars = name.chars();
    let valid = match chars.next() {
        Some(first) => {
            (first.is_ascii_alphabetic() || first == '_')
                && chars.all(|ch| ch.is_ascii_alphanumeric() || ch == '_')
        }
        None => false,
    };
    if !valid || name.eq_ignore_ascii_case(CHECKPOINT_TABLE) {
        return Err(StoreError::InvalidTable(name.to_string()));
    }
    Ok(format!("\"{name}\""))
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;
    use crate::domain::TerritoryLevel;

    fn record(label: &str) -> CleanRecord {
        CleanRecord {
            annee: 2023,
            patho_niv1: label.to_string(),
            patho_niv2: None,
            patho_niv3: None,
            top: None,
            cla_age_5: "tsage".to_string(),
            sexe: 9,
            region: "11".to_string(),
            dept: "75".to_string(),
            niveau_territoire: TerritoryLevel::Department,
            ntop: None,
            npop: Some(10_000),
            prev: Some(3.2),
            niveau_prioritaire: None,
            libelle_sexe: None,
            tri: None,
        }
    }

    #[test]
    fn quote_identifier_rejects_injection() {
        assert_eq!(quote_identifier("effectifs").unwrap(), "\"effectifs\"");
        assert_matches!(
            quote_identifier("effectifs; DROP TABLE x"),
            Err(StoreError::InvalidTable(_))
        );
        assert_matches!(quote_identifier(""), Err(StoreError::InvalidTable(_)));
        assert_matches!(
            quote_identifier(CHECKPOINT_TABLE),
            Err(StoreError::InvalidTable(_))
        );
    }

    #[test]
    fn checkpoint_follows_batches() {
        let mut store = SqliteStore::open_in_memory("effectifs").unwrap();
        assert_eq!(store.checkpoint().unwrap(), None);
        assert_eq!(store.row_count().unwrap(), 0);

        store.reset("v1", 2, 3).unwrap();
        let checkpoint = store.checkpoint().unwrap().unwrap();
        assert_eq!(checkpoint.last_committed_batch, None);
        assert!(!checkpoint.completed);

        store.commit_batch(0, &[record("Cancers"), record("Cancers")]).unwrap();
        store.commit_batch(1, &[record("Diabète")]).unwrap();
        store.build_indexes().unwrap();
        store.mark_completed().unwrap();

        let checkpoint = store.checkpoint().unwrap().unwrap();
        assert_eq!(checkpoint.last_committed_batch, Some(1));
        assert!(checkpoint.indexed);
        assert!(checkpoint.completed);
        assert_eq!(store.row_count().unwrap(), 3);
    }

    #[test]
    fn relabel_respects_limit() {
        let mut store = SqliteStore::open_in_memory("effectifs").unwrap();
        store.reset("v1", 10, 3).unwrap();
        store
            .commit_batch(0, &[record("old"), record("old"), record("old")])
            .unwrap();

        assert_eq!(
            store.relabel_batch(LabelColumn::PathoNiv1, "old", "new", 2).unwrap(),
            2
        );
        assert_eq!(store.count_label(LabelColumn::PathoNiv1, "old").unwrap(), 1);
        assert_eq!(
            store.relabel_batch(LabelColumn::PathoNiv1, "old", "new", 2).unwrap(),
            1
        );
        assert_eq!(
            store.distinct_labels(LabelColumn::PathoNiv1).unwrap(),
            vec!["new".to_string()]
        );
        assert!(store.distinct_labels(LabelColumn::PathoNiv2).unwrap().is_empty());
    }

    #[test]
    fn label_column_from_str() {
        assert_eq!("PATHO_NIV2".parse::<LabelColumn>().unwrap(), LabelColumn::PathoNiv2);
        assert_matches!("dept".parse::<LabelColumn>(), Err(StoreError::InvalidColumn(_)));
    }
}

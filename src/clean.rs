use std::borrow::Cow;
use std::fs::{self, File};
use std::io::{BufRead, BufReader};
use std::time::{SystemTime, UNIX_EPOCH};

use camino::{Utf8Path, Utf8PathBuf};
use chrono::{DateTime, Utc};
use csv::{ByteRecord, ReaderBuilder, WriterBuilder};
use encoding_rs::Encoding;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::domain::{AgeBand, Severity, Sex, Territory, TerritoryLevel, YearRange};
use crate::error::{CleanError, KeyError};
use crate::labels::shorten_label;
use crate::layout::{
    ensure_parent, manifest_path_for, modified, non_empty_file, partial_path_for, read_json,
    remove_if_exists, write_json_atomic,
};
use crate::progress::{ProgressTracker, Stage};

pub const CLEAN_DELIMITER: u8 = b';';

pub const CLEAN_COLUMNS: [&str; 16] = [
    "annee",
    "patho_niv1",
    "patho_niv2",
    "patho_niv3",
    "top",
    "cla_age_5",
    "sexe",
    "region",
    "dept",
    "niveau_territoire",
    "Ntop",
    "Npop",
    "prev",
    "Niveau prioritaire",
    "libelle_sexe",
    "tri",
];

const REQUIRED_COLUMNS: [&str; 6] = ["annee", "patho_niv1", "cla_age_5", "sexe", "region", "dept"];

/// One row of the cleaned dataset. Field order is the column order of the file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CleanRecord {
    pub annee: i32,
    pub patho_niv1: String,
    pub patho_niv2: Option<String>,
    pub patho_niv3: Option<String>,
    pub top: Option<String>,
    pub cla_age_5: String,
    pub sexe: u8,
    pub region: String,
    pub dept: String,
    pub niveau_territoire: TerritoryLevel,
    #[serde(rename = "Ntop")]
    pub ntop: Option<i64>,
    #[serde(rename = "Npop")]
    pub npop: Option<i64>,
    pub prev: Option<f64>,
    #[serde(rename = "Niveau prioritaire")]
    pub niveau_prioritaire: Option<u8>,
    pub libelle_sexe: Option<String>,
    pub tri: Option<f64>,
}

#[derive(Debug, Clone)]
pub struct CleanOptions {
    pub chunk_rows: usize,
    pub years: YearRange,
    pub decode_fallback: Option<&'static Encoding>,
    pub force: bool,
}

impl CleanOptions {
    /// Identifies the settings that decide which rows survive cleaning.
    pub fn fingerprint(&self) -> String {
        let fallback = self.decode_fallback.map_or("none", |encoding| encoding.name());
        format!("years={}-{},fallback={fallback}", self.years.min, self.years.max)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropReason {
    Undecodable,
    Malformed,
    MissingKey,
    InvalidKey,
}

impl From<&KeyError> for DropReason {
    fn from(err: &KeyError) -> Self {
        match err {
            KeyError::Missing(_) => DropReason::MissingKey,
            _ => DropReason::InvalidKey,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DroppedRows {
    pub undecodable: u64,
    pub malformed: u64,
    pub missing_key: u64,
    pub invalid_key: u64,
}

impl DroppedRows {
    pub fn total(&self) -> u64 {
        self.undecodable + self.malformed + self.missing_key + self.invalid_key
    }

    fn count(&mut self, reason: DropReason) {
        match reason {
            DropReason::Undecodable => self.undecodable += 1,
            DropReason::Malformed => self.malformed += 1,
            DropReason::MissingKey => self.missing_key += 1,
            DropReason::InvalidKey => self.invalid_key += 1,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CleanCounters {
    pub rows_read: u64,
    pub rows_kept: u64,
    pub dropped: DroppedRows,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CleanManifest {
    pub version: String,
    pub raw_bytes: u64,
    pub raw_modified_unix: i64,
    #[serde(default)]
    pub options: String,
    pub delimiter: char,
    pub counters: CleanCounters,
    pub completed_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CleanAction {
    Cached,
    Cleaned,
}

#[derive(Debug, Clone, Serialize)]
pub struct CleanedDataset {
    pub path: Utf8PathBuf,
    pub manifest: CleanManifest,
    pub action: CleanAction,
}

/// A cleaned file only counts as complete once its manifest exists and parses.
pub fn read_manifest(clean_path: &Utf8Path) -> Option<CleanManifest> {
    if !clean_path.as_std_path().is_file() {
        return None;
    }
    read_json(&manifest_path_for(clean_path)).ok()
}

pub fn clean(
    raw_path: &Utf8Path,
    clean_path: &Utf8Path,
    options: &CleanOptions,
    tracker: &ProgressTracker,
) -> Result<CleanedDataset, CleanError> {
    let raw_meta =
        fs::metadata(raw_path.as_std_path()).map_err(|err| CleanError::Io(err.to_string()))?;
    let raw_bytes = raw_meta.len();
    let raw_modified_unix = raw_meta.modified().map(unix_seconds).unwrap_or(0);

    if !options.force {
        let fingerprint = options.fingerprint();
        if let Some(manifest) = cached_manifest(raw_path, clean_path, raw_bytes, &fingerprint) {
            info!(path = %clean_path, rows = manifest.counters.rows_kept, "cleaned dataset up to date");
            tracker.report(
                Stage::Cleaning,
                Some(100.0),
                format!("cleaned dataset up to date: {clean_path}"),
            );
            return Ok(CleanedDataset {
                path: clean_path.to_owned(),
                manifest,
                action: CleanAction::Cached,
            });
        }
    }

    let manifest_path = manifest_path_for(clean_path);
    remove_if_exists(&manifest_path).map_err(|err| CleanError::Io(err.to_string()))?;
    ensure_parent(clean_path).map_err(|err| CleanError::Io(err.to_string()))?;

    let part_path = partial_path_for(clean_path);
    let result = clean_into(raw_path, &part_path, raw_bytes, options, tracker);
    let (counters, delimiter) = match result {
        Ok(done) => done,
        Err(err) => {
            if let Err(cleanup) = remove_if_exists(&part_path) {
                warn!(path = %part_path, error = %cleanup, "failed to remove partial cleaned file");
            }
            return Err(err);
        }
    };

    fs::rename(part_path.as_std_path(), clean_path.as_std_path())
        .map_err(|err| CleanError::Io(err.to_string()))?;

    let fingerprint = options.fingerprint();
    let manifest = CleanManifest {
        version: format!(
            "{raw_bytes}:{raw_modified_unix}:{}:{fingerprint}",
            counters.rows_kept
        ),
        raw_bytes,
        raw_modified_unix,
        options: fingerprint,
        delimiter: char::from(delimiter),
        counters,
        completed_at: Utc::now(),
    };
    write_json_atomic(&manifest_path, &manifest)
        .map_err(|err| CleanError::Manifest(err.to_string()))?;

    info!(
        path = %clean_path,
        rows_read = counters.rows_read,
        rows_kept = counters.rows_kept,
        dropped = counters.dropped.total(),
        "cleaned dataset written"
    );
    tracker.report(
        Stage::Cleaning,
        Some(100.0),
        format!(
            "kept {} of {} rows ({} dropped)",
            counters.rows_kept,
            counters.rows_read,
            counters.dropped.total()
        ),
    );
    Ok(CleanedDataset {
        path: clean_path.to_owned(),
        manifest,
        action: CleanAction::Cleaned,
    })
}

fn cached_manifest(
    raw_path: &Utf8Path,
    clean_path: &Utf8Path,
    raw_bytes: u64,
    fingerprint: &str,
) -> Option<CleanManifest> {
    if !non_empty_file(clean_path) {
        return None;
    }
    let manifest = read_manifest(clean_path)?;
    if manifest.raw_bytes != raw_bytes {
        debug!(recorded = manifest.raw_bytes, actual = raw_bytes, "raw size changed since clean");
        return None;
    }
    if manifest.options != fingerprint {
        debug!(recorded = %manifest.options, actual = fingerprint, "clean options changed");
        return None;
    }
    let fresh = match (modified(clean_path), modified(raw_path)) {
        (Ok(clean), Ok(raw)) => clean >= raw,
        _ => false,
    };
    fresh.then_some(manifest)
}

fn clean_into(
    raw_path: &Utf8Path,
    part_path: &Utf8Path,
    raw_bytes: u64,
    options: &CleanOptions,
    tracker: &ProgressTracker,
) -> Result<(CleanCounters, u8), CleanError> {
    let delimiter = sniff_delimiter(raw_path)?;
    let mut reader = ReaderBuilder::new()
        .delimiter(delimiter)
        .has_headers(true)
        .flexible(true)
        .from_path(raw_path.as_std_path())
        .map_err(|err| CleanError::Io(err.to_string()))?;

    let header = reader
        .byte_headers()
        .map_err(|err| CleanError::Header {
            path: raw_path.as_std_path().to_path_buf(),
            reason: err.to_string(),
        })?
        .clone();
    let columns = ColumnMap::from_header(&header, options.decode_fallback).map_err(|reason| {
        CleanError::Header {
            path: raw_path.as_std_path().to_path_buf(),
            reason,
        }
    })?;

    let part = File::create(part_path.as_std_path()).map_err(|err| CleanError::Io(err.to_string()))?;
    let mut writer = WriterBuilder::new()
        .delimiter(CLEAN_DELIMITER)
        .has_headers(false)
        .from_writer(part);
    writer
        .write_record(CLEAN_COLUMNS)
        .map_err(|err| CleanError::Csv(err.to_string()))?;

    info!(path = %raw_path, delimiter = %char::from(delimiter), "cleaning raw dataset");
    let chunk_rows = options.chunk_rows.max(1);
    let mut counters = CleanCounters::default();
    let mut record = ByteRecord::new();
    let mut chunk = Vec::with_capacity(chunk_rows.min(65_536));
    let mut chunk_index = 0u64;

    loop {
        chunk.clear();
        let mut exhausted = false;
        while chunk.len() < chunk_rows {
            let more = reader
                .read_byte_record(&mut record)
                .map_err(|err| CleanError::Csv(err.to_string()))?;
            if !more {
                exhausted = true;
                break;
            }
            counters.rows_read += 1;
            match clean_record(&record, &columns, options) {
                Ok(cleaned) => chunk.push(cleaned),
                Err(reason) => counters.dropped.count(reason),
            }
            if counters.rows_read % chunk_rows as u64 == 0 {
                break;
            }
        }

        for cleaned in &chunk {
            writer
                .serialize(cleaned)
                .map_err(|err| CleanError::Csv(err.to_string()))?;
        }
        counters.rows_kept += chunk.len() as u64;
        writer.flush().map_err(|err| CleanError::Io(err.to_string()))?;

        let consumed = reader.position().byte();
        let estimate = estimate_rows(raw_bytes, consumed, counters.rows_read);
        let percent = if exhausted {
            100.0
        } else {
            (counters.rows_read as f64 / estimate as f64 * 100.0).min(99.0) as f32
        };
        debug!(chunk = chunk_index, rows_read = counters.rows_read, estimate, "cleaned chunk");
        tracker.report(
            Stage::Cleaning,
            Some(percent),
            format!("cleaned {} of ~{} rows", counters.rows_read, estimate),
        );
        chunk_index += 1;

        if exhausted {
            break;
        }
    }

    let part = writer
        .into_inner()
        .map_err(|err| CleanError::Io(err.to_string()))?;
    part.sync_all().map_err(|err| CleanError::Io(err.to_string()))?;
    Ok((counters, delimiter))
}

/// Extrapolates the total row count from the average bytes per row seen so far.
pub fn estimate_rows(total_bytes: u64, consumed_bytes: u64, rows_read: u64) -> u64 {
    if rows_read == 0 || consumed_bytes == 0 {
        return rows_read.max(1);
    }
    let bytes_per_row = consumed_bytes as f64 / rows_read as f64;
    let estimate = (total_bytes as f64 / bytes_per_row).round() as u64;
    estimate.max(rows_read).max(1)
}

fn sniff_delimiter(raw_path: &Utf8Path) -> Result<u8, CleanError> {
    let file = File::open(raw_path.as_std_path()).map_err(|err| CleanError::Io(err.to_string()))?;
    let mut first_line = Vec::new();
    BufReader::new(file)
        .read_until(b'\n', &mut first_line)
        .map_err(|err| CleanError::Io(err.to_string()))?;
    let semicolons = first_line.iter().filter(|byte| **byte == b';').count();
    let commas = first_line.iter().filter(|byte| **byte == b',').count();
    if semicolons > 0 {
        Ok(b';')
    } else if commas > 0 {
        Ok(b',')
    } else {
        Err(CleanError::Header {
            path: raw_path.as_std_path().to_path_buf(),
            reason: "no ';' or ',' delimiter in header line".to_string(),
        })
    }
}

struct ColumnMap {
    width: usize,
    annee: usize,
    patho_niv1: usize,
    patho_niv2: Option<usize>,
    patho_niv3: Option<usize>,
    top: Option<usize>,
    cla_age_5: usize,
    sexe: usize,
    region: usize,
    dept: usize,
    ntop: Option<usize>,
    npop: Option<usize>,
    prev: Option<usize>,
    niveau_prioritaire: Option<usize>,
    libelle_sexe: Option<usize>,
    tri: Option<usize>,
}

impl ColumnMap {
    fn from_header(header: &ByteRecord, fallback: Option<&'static Encoding>) -> Result<Self, String> {
        let mut names = Vec::with_capacity(header.len());
        for (idx, raw) in header.iter().enumerate() {
            let name = decode_field(raw, fallback)
                .ok_or_else(|| format!("column {idx} is not valid text"))?;
            names.push(name.trim_start_matches('\u{feff}').trim().to_string());
        }
        let find = |name: &str| names.iter().position(|col| col.eq_ignore_ascii_case(name));

        let missing: Vec<&str> = REQUIRED_COLUMNS
            .iter()
            .copied()
            .filter(|&name| find(name).is_none())
            .collect();
        if !missing.is_empty() {
            return Err(format!("missing required columns: {}", missing.join(", ")));
        }
        let required = |name: &str| find(name).unwrap_or_default();

        Ok(Self {
            width: names.len(),
            annee: required("annee"),
            patho_niv1: required("patho_niv1"),
            patho_niv2: find("patho_niv2"),
            patho_niv3: find("patho_niv3"),
            top: find("top"),
            cla_age_5: required("cla_age_5"),
            sexe: required("sexe"),
            region: required("region"),
            dept: required("dept"),
            ntop: find("Ntop"),
            npop: find("Npop"),
            prev: find("prev"),
            niveau_prioritaire: find("Niveau prioritaire"),
            libelle_sexe: find("libelle_sexe"),
            tri: find("tri"),
        })
    }
}

fn decode_field<'a>(raw: &'a [u8], fallback: Option<&'static Encoding>) -> Option<Cow<'a, str>> {
    match std::str::from_utf8(raw) {
        Ok(text) => Some(Cow::Borrowed(text)),
        Err(_) => fallback?.decode_without_bom_handling_and_without_replacement(raw),
    }
}

fn clean_record(
    record: &ByteRecord,
    columns: &ColumnMap,
    options: &CleanOptions,
) -> Result<CleanRecord, DropReason> {
    if record.len() != columns.width {
        return Err(DropReason::Malformed);
    }
    let mut fields = Vec::with_capacity(record.len());
    for raw in record.iter() {
        fields.push(decode_field(raw, options.decode_fallback).ok_or(DropReason::Undecodable)?);
    }
    let field = |idx: usize| fields[idx].trim();
    let optional = |idx: Option<usize>| idx.map(|idx| fields[idx].trim()).filter(|v| !v.is_empty());

    let annee = options
        .years
        .parse(field(columns.annee))
        .map_err(|err| DropReason::from(&err))?;
    let territory = Territory::parse(field(columns.region), field(columns.dept))
        .map_err(|err| DropReason::from(&err))?;
    let age: AgeBand = field(columns.cla_age_5)
        .parse()
        .map_err(|err| DropReason::from(&err))?;
    let sex: Sex = field(columns.sexe)
        .parse()
        .map_err(|err| DropReason::from(&err))?;
    let patho_niv1 = field(columns.patho_niv1);
    if patho_niv1.is_empty() {
        return Err(DropReason::MissingKey);
    }

    Ok(CleanRecord {
        annee,
        patho_niv1: shorten_label(patho_niv1).into_owned(),
        patho_niv2: optional(columns.patho_niv2).map(|label| shorten_label(label).into_owned()),
        patho_niv3: optional(columns.patho_niv3).map(|label| shorten_label(label).into_owned()),
        top: optional(columns.top).map(str::to_string),
        cla_age_5: age.as_str().to_string(),
        sexe: sex.code(),
        region: territory.region().to_string(),
        dept: territory.dept().to_string(),
        niveau_territoire: territory.level(),
        ntop: optional(columns.ntop).and_then(parse_count),
        npop: optional(columns.npop).and_then(parse_count),
        prev: optional(columns.prev).and_then(parse_rate),
        niveau_prioritaire: optional(columns.niveau_prioritaire)
            .and_then(|value| value.parse::<Severity>().ok())
            .map(|severity| severity.level()),
        libelle_sexe: optional(columns.libelle_sexe).map(str::to_string),
        tri: optional(columns.tri).and_then(parse_decimal),
    })
}

/// Non-negative integer count; integral decimals such as `12.0` are accepted.
pub fn parse_count(value: &str) -> Option<i64> {
    let value = value.trim();
    let parsed = match value.parse::<i64>() {
        Ok(count) => count,
        Err(_) => {
            let decimal = parse_decimal(value)?;
            if decimal.fract() != 0.0 || decimal > i64::MAX as f64 {
                return None;
            }
            decimal as i64
        }
    };
    (parsed >= 0).then_some(parsed)
}

/// Prevalence in percent, within [0, 100].
pub fn parse_rate(value: &str) -> Option<f64> {
    parse_decimal(value).filter(|rate| (0.0..=100.0).contains(rate))
}

fn parse_decimal(value: &str) -> Option<f64> {
    let value = value.trim();
    if value.is_empty() {
        return None;
    }
    let parsed = if value.contains(',') {
        value.replace(',', ".").parse::<f64>()
    } else {
        value.parse::<f64>()
    };
    parsed.ok().filter(|number| number.is_finite())
}

fn unix_seconds(time: SystemTime) -> i64 {
    time.duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_secs() as i64)
        .unwrap_or(0)
}

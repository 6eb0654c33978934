use assert_matches::assert_matches;
use camino::{Utf8Path, Utf8PathBuf};

use effectifs_etl::clean::{
    CLEAN_COLUMNS, CleanAction, CleanOptions, CleanRecord, clean, read_manifest,
};
use effectifs_etl::domain::{TerritoryLevel, YearRange};
use effectifs_etl::error::CleanError;
use effectifs_etl::labels::MAX_LABEL_CHARS;
use effectifs_etl::layout::manifest_path_for;
use effectifs_etl::progress::{ProgressTracker, Stage};

const HEADER: &str = "annee;patho_niv1;patho_niv2;patho_niv3;top;cla_age_5;sexe;region;dept;Ntop;Npop;prev;Niveau prioritaire;libelle_classe_age;libelle_sexe;tri";

const LONG_LABEL: &str = "Traitements antalgiques ou anti-inflammatoires (hors pathologies, traitements, maternité ou hospitalisations)";

fn raw_content() -> String {
    [
        HEADER.to_string(),
        "2023;Cancers;Cancer du sein;;CAN_INC;tsage;9;11;75;1200;10000;12,0;1;tous âges;tous sexes;1".to_string(),
        format!("2023;{LONG_LABEL};;;TRT_ANT;tsage;9;11;75;;10000;3.2;;tous âges;tous sexes;2"),
        "2014;Cancers;;;CAN_INC;tsage;9;11;75;5;100;5;1;tous âges;tous sexes;3".to_string(),
        "2023;Diabète;;;DIA;tsage;;11;75;5;100;5;1;tous âges;tous sexes;4".to_string(),
        "2023;Diabète;;".to_string(),
        "2022;Diabète;;;DIA;40-44;2;84;999;30;500;6;2;de 40 à 44 ans;femmes;5".to_string(),
    ]
    .join("\n")
        + "\n"
}

fn scratch() -> (tempfile::TempDir, Utf8PathBuf) {
    let temp = tempfile::tempdir().unwrap();
    let root = Utf8PathBuf::from_path_buf(temp.path().to_path_buf()).unwrap();
    (temp, root)
}

fn write_raw(root: &Utf8Path, content: &[u8]) -> Utf8PathBuf {
    let path = root.join("raw").join("effectifs.csv");
    std::fs::create_dir_all(root.join("raw").as_std_path()).unwrap();
    std::fs::write(path.as_std_path(), content).unwrap();
    path
}

fn options() -> CleanOptions {
    CleanOptions {
        chunk_rows: 2,
        years: YearRange::default(),
        decode_fallback: Some(encoding_rs::WINDOWS_1252),
        force: false,
    }
}

fn cleaning_tracker() -> ProgressTracker {
    let tracker = ProgressTracker::new();
    tracker.advance_to(Stage::Cleaning, "cleaning raw dataset");
    tracker
}

fn read_clean(path: &Utf8Path) -> Vec<CleanRecord> {
    let mut reader = csv::ReaderBuilder::new()
        .delimiter(b';')
        .from_path(path.as_std_path())
        .unwrap();
    reader.deserialize().map(Result::unwrap).collect()
}

#[test]
fn rows_are_conserved() {
    let (_temp, root) = scratch();
    let raw = write_raw(&root, raw_content().as_bytes());
    let clean_path = root.join("clean").join("csv_clean.csv");
    let tracker = cleaning_tracker();

    let cleaned = clean(&raw, &clean_path, &options(), &tracker).unwrap();
    let counters = cleaned.manifest.counters;

    assert_eq!(cleaned.action, CleanAction::Cleaned);
    assert_eq!(counters.rows_read, 6);
    assert_eq!(counters.rows_kept, 3);
    assert_eq!(counters.dropped.invalid_key, 1);
    assert_eq!(counters.dropped.missing_key, 1);
    assert_eq!(counters.dropped.malformed, 1);
    assert_eq!(counters.rows_kept + counters.dropped.total(), counters.rows_read);
    assert_eq!(read_clean(&clean_path).len(), 3);
    assert_eq!(tracker.snapshot().percent, Some(100.0));
}

#[test]
fn empty_metrics_stay_null_and_labels_are_shortened() {
    let (_temp, root) = scratch();
    let raw = write_raw(&root, raw_content().as_bytes());
    let clean_path = root.join("csv_clean.csv");
    clean(&raw, &clean_path, &options(), &cleaning_tracker()).unwrap();

    let records = read_clean(&clean_path);
    let scenario = &records[1];
    assert_eq!(scenario.annee, 2023);
    assert_eq!(scenario.dept, "75");
    assert_eq!(scenario.patho_niv1, "Traitements antalgiques/anti-inflammatoires");
    assert_eq!(scenario.ntop, None);
    assert_eq!(scenario.npop, Some(10_000));
    assert_eq!(scenario.prev, Some(3.2));
    assert_eq!(scenario.niveau_prioritaire, None);

    let first = &records[0];
    assert_eq!(first.prev, Some(12.0));
    assert_eq!(first.niveau_prioritaire, Some(1));

    let region = &records[2];
    assert_eq!(region.niveau_territoire, TerritoryLevel::Region);
    assert_eq!(region.region, "84");
    assert_eq!(region.cla_age_5, "40-44");

    let content = std::fs::read_to_string(clean_path.as_std_path()).unwrap();
    let mut lines = content.lines();
    assert_eq!(lines.next().unwrap(), CLEAN_COLUMNS.join(";"));
    let scenario_line = lines.nth(1).unwrap();
    let fields: Vec<&str> = scenario_line.split(';').collect();
    assert_eq!(fields[10], "");
    assert_eq!(fields[11], "10000");
    assert!(!content.contains("libelle_classe_age"));
}

#[test]
fn overlong_label_is_truncated_and_row_kept() {
    let (_temp, root) = scratch();
    let content = format!(
        "{HEADER}\n2023;Diabète de type 2 et complications associées (hors insuffisance rénale);;;DIA;tsage;9;11;75;;10000;3.2;;tous âges;tous sexes;1\n"
    );
    let raw = write_raw(&root, content.as_bytes());
    let clean_path = root.join("csv_clean.csv");

    let cleaned = clean(&raw, &clean_path, &options(), &cleaning_tracker()).unwrap();
    assert_eq!(cleaned.manifest.counters.rows_kept, 1);
    assert_eq!(cleaned.manifest.counters.dropped.total(), 0);

    let records = read_clean(&clean_path);
    let row = &records[0];
    assert_eq!(row.annee, 2023);
    assert_eq!(row.dept, "75");
    assert_eq!(row.ntop, None);
    assert_eq!(row.npop, Some(10_000));
    assert_eq!(row.prev, Some(3.2));
    assert!(row.patho_niv1.starts_with("Diabète de type 2 et complications associées"));
    assert!(row.patho_niv1.ends_with('…'));
    assert!(row.patho_niv1.chars().count() <= MAX_LABEL_CHARS);
}

#[test]
fn comma_delimited_export_with_bom_is_accepted() {
    let (_temp, root) = scratch();
    let content = format!(
        "\u{feff}{}\n2021,Cancers,,,CAN,tsage,1,11,2a,10,20,\"1,5\",,,hommes,1\n",
        HEADER.replace(';', ",")
    );
    let raw = write_raw(&root, content.as_bytes());
    let clean_path = root.join("csv_clean.csv");

    let cleaned = clean(&raw, &clean_path, &options(), &cleaning_tracker()).unwrap();
    assert_eq!(cleaned.manifest.delimiter, ',');
    let records = read_clean(&clean_path);
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].dept, "2A");
    assert_eq!(records[0].prev, Some(1.5));
}

#[test]
fn legacy_encoding_is_decoded_with_fallback() {
    let (_temp, root) = scratch();
    let mut content = format!("{HEADER}\n").into_bytes();
    content.extend_from_slice(b"2023;Diab\xe8te;;;DIA;tsage;9;11;75;1;2;3;;;;\n");
    let raw = write_raw(&root, &content);
    let clean_path = root.join("csv_clean.csv");

    clean(&raw, &clean_path, &options(), &cleaning_tracker()).unwrap();
    assert_eq!(read_clean(&clean_path)[0].patho_niv1, "Diabète");

    let strict = CleanOptions {
        decode_fallback: None,
        force: true,
        ..options()
    };
    let cleaned = clean(&raw, &clean_path, &strict, &cleaning_tracker()).unwrap();
    assert_eq!(cleaned.manifest.counters.dropped.undecodable, 1);
    assert_eq!(cleaned.manifest.counters.rows_kept, 0);
}

#[test]
fn missing_required_column_is_fatal() {
    let (_temp, root) = scratch();
    let raw = write_raw(&root, b"annee;patho_niv1;region\n2023;Cancers;11\n");
    let clean_path = root.join("csv_clean.csv");

    let result = clean(&raw, &clean_path, &options(), &cleaning_tracker());
    assert_matches!(result, Err(CleanError::Header { reason, .. }) if reason.contains("cla_age_5"));
    assert!(!clean_path.as_std_path().exists());
    assert!(!root.join("csv_clean.csv.part").as_std_path().exists());
    assert!(read_manifest(&clean_path).is_none());
}

#[test]
fn second_run_uses_manifest() {
    let (_temp, root) = scratch();
    let raw = write_raw(&root, raw_content().as_bytes());
    let clean_path = root.join("csv_clean.csv");

    let first = clean(&raw, &clean_path, &options(), &cleaning_tracker()).unwrap();
    let second = clean(&raw, &clean_path, &options(), &cleaning_tracker()).unwrap();
    assert_eq!(second.action, CleanAction::Cached);
    assert_eq!(second.manifest, first.manifest);

    std::fs::remove_file(manifest_path_for(&clean_path).as_std_path()).unwrap();
    let third = clean(&raw, &clean_path, &options(), &cleaning_tracker()).unwrap();
    assert_eq!(third.action, CleanAction::Cleaned);
    assert_eq!(third.manifest.counters, first.manifest.counters);
}

#[test]
fn changed_options_invalidate_manifest() {
    let (_temp, root) = scratch();
    let raw = write_raw(&root, raw_content().as_bytes());
    let clean_path = root.join("csv_clean.csv");

    let first = clean(&raw, &clean_path, &options(), &cleaning_tracker()).unwrap();
    assert_eq!(first.manifest.counters.rows_kept, 3);

    let narrowed = CleanOptions {
        years: YearRange {
            min: 2023,
            max: 2023,
        },
        ..options()
    };
    let second = clean(&raw, &clean_path, &narrowed, &cleaning_tracker()).unwrap();
    assert_eq!(second.action, CleanAction::Cleaned);
    assert_eq!(second.manifest.counters.rows_kept, 2);
    assert_ne!(second.manifest.version, first.manifest.version);
    assert!(read_clean(&clean_path).iter().all(|row| row.annee == 2023));

    let third = clean(&raw, &clean_path, &narrowed, &cleaning_tracker()).unwrap();
    assert_eq!(third.action, CleanAction::Cached);
}

use std::fs;

use camino::{Utf8Path, Utf8PathBuf};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::domain::YearRange;
use crate::error::ConfigError;
use crate::layout::Layout;

pub const DEFAULT_CONFIG_FILE: &str = "effectifs-etl.json";
pub const SOURCE_URL_ENV: &str = "EFFECTIFS_SOURCE_URL";
pub const DEFAULT_SOURCE_URL: &str =
    "https://data.ameli.fr/api/explore/v2.1/catalog/datasets/effectifs/exports/csv?use_labels=true";
pub const DEFAULT_TABLE: &str = "effectifs";
pub const DEFAULT_BATCH_SIZE: usize = 20_000;
pub const DEFAULT_CHUNK_ROWS: usize = 50_000;
pub const DEFAULT_DECODE_FALLBACK: &str = "windows-1252";

static TABLE_NAME: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^[A-Za-z_][A-Za-z0-9_]{0,62}$").expect("table name pattern is valid")
});

#[derive(Debug, Default, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub schema_version: Option<u32>,
    #[serde(default)]
    pub data_dir: Option<String>,
    #[serde(default)]
    pub raw_path: Option<String>,
    #[serde(default)]
    pub clean_path: Option<String>,
    #[serde(default)]
    pub store_path: Option<String>,
    #[serde(default)]
    pub source_url: Option<String>,
    #[serde(default)]
    pub table_name: Option<String>,
    #[serde(default)]
    pub batch_size: Option<usize>,
    #[serde(default)]
    pub chunk_rows: Option<usize>,
    #[serde(default)]
    pub years: Option<YearRange>,
    #[serde(default = "default_decode_fallback")]
    pub decode_fallback: Option<String>,
    #[serde(default)]
    pub progress_file: Option<String>,
    #[serde(default)]
    pub http: HttpSettings,
}

fn default_decode_fallback() -> Option<String> {
    Some(DEFAULT_DECODE_FALLBACK.to_string())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
pub struct HttpSettings {
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,
    #[serde(default = "default_max_retries")]
    pub max_retries: usize,
}

impl Default for HttpSettings {
    fn default() -> Self {
        Self {
            connect_timeout_secs: default_connect_timeout(),
            max_retries: default_max_retries(),
        }
    }
}

fn default_connect_timeout() -> u64 {
    30
}

fn default_max_retries() -> usize {
    3
}

#[derive(Debug, Clone)]
pub struct ResolvedConfig {
    pub schema_version: u32,
    pub layout: Layout,
    pub source_url: String,
    pub table_name: String,
    pub batch_size: usize,
    pub chunk_rows: usize,
    pub years: YearRange,
    pub decode_fallback: Option<&'static encoding_rs::Encoding>,
    pub progress_file: Option<Utf8PathBuf>,
    pub http: HttpSettings,
}

impl ResolvedConfig {
    pub fn with_data_dir(data_dir: &Utf8Path) -> Self {
        Self {
            schema_version: 1,
            layout: Layout::under(data_dir),
            source_url: DEFAULT_SOURCE_URL.to_string(),
            table_name: DEFAULT_TABLE.to_string(),
            batch_size: DEFAULT_BATCH_SIZE,
            chunk_rows: DEFAULT_CHUNK_ROWS,
            years: YearRange::default(),
            decode_fallback: encoding_rs::Encoding::for_label(DEFAULT_DECODE_FALLBACK.as_bytes()),
            progress_file: None,
            http: HttpSettings::default(),
        }
    }
}

pub struct ConfigLoader;

impl ConfigLoader {
    pub fn resolve(path: Option<&str>) -> Result<ResolvedConfig, ConfigError> {
        let config_path = match path {
            Some(path) => Utf8PathBuf::from(path),
            None => Utf8PathBuf::from(DEFAULT_CONFIG_FILE),
        };

        let config = if path.is_none() && !config_path.as_std_path().exists() {
            Config::default_with_fallback()
        } else {
            let content = fs::read_to_string(config_path.as_std_path())
                .map_err(|_| ConfigError::Read(config_path.clone().into_std_path_buf()))?;
            serde_json::from_str(&content).map_err(|err| ConfigError::Parse(err.to_string()))?
        };

        let mut resolved = Self::resolve_config(config)?;
        if let Ok(url) = std::env::var(SOURCE_URL_ENV) {
            if !url.trim().is_empty() {
                resolved.source_url = url.trim().to_string();
            }
        }
        Ok(resolved)
    }

    pub fn resolve_config(config: Config) -> Result<ResolvedConfig, ConfigError> {
        let schema_version = config.schema_version.unwrap_or(1);
        if schema_version != 1 {
            return Err(ConfigError::Invalid(format!(
                "unsupported schema_version {schema_version}"
            )));
        }

        let data_dir = Utf8PathBuf::from(config.data_dir.as_deref().unwrap_or("data"));
        let defaults = Layout::under(&data_dir);
        let layout = Layout::new(
            config
                .raw_path
                .map(Utf8PathBuf::from)
                .unwrap_or_else(|| defaults.raw_path().to_owned()),
            config
                .clean_path
                .map(Utf8PathBuf::from)
                .unwrap_or_else(|| defaults.clean_path().to_owned()),
            config
                .store_path
                .map(Utf8PathBuf::from)
                .unwrap_or_else(|| defaults.store_path().to_owned()),
        );
        if layout.raw_path() == layout.clean_path() {
            return Err(ConfigError::Invalid(
                "raw_path and clean_path must differ".to_string(),
            ));
        }

        let table_name = config
            .table_name
            .unwrap_or_else(|| DEFAULT_TABLE.to_string());
        if !TABLE_NAME.is_match(&table_name) {
            return Err(ConfigError::Invalid(format!("table_name {table_name:?}")));
        }

        let batch_size = config.batch_size.unwrap_or(DEFAULT_BATCH_SIZE);
        let chunk_rows = config.chunk_rows.unwrap_or(DEFAULT_CHUNK_ROWS);
        if batch_size == 0 || chunk_rows == 0 {
            return Err(ConfigError::Invalid(
                "batch_size and chunk_rows must be positive".to_string(),
            ));
        }

        let years = config.years.unwrap_or_default();
        if years.min > years.max {
            return Err(ConfigError::Invalid(format!(
                "years.min {} is after years.max {}",
                years.min, years.max
            )));
        }

        let decode_fallback = match config.decode_fallback {
            Some(label) => Some(
                encoding_rs::Encoding::for_label(label.trim().as_bytes())
                    .ok_or_else(|| ConfigError::Invalid(format!("decode_fallback {label:?}")))?,
            ),
            None => None,
        };

        Ok(ResolvedConfig {
            schema_version,
            layout,
            source_url: config
                .source_url
                .unwrap_or_else(|| DEFAULT_SOURCE_URL.to_string()),
            table_name,
            batch_size,
            chunk_rows,
            years,
            decode_fallback,
            progress_file: config.progress_file.map(Utf8PathBuf::from),
            http: config.http,
        })
    }
}

impl Config {
    fn default_with_fallback() -> Self {
        Self {
            decode_fallback: default_decode_fallback(),
            ..Self::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolve_defaults() {
        let resolved = ConfigLoader::resolve_config(Config::default_with_fallback()).unwrap();
        assert_eq!(resolved.schema_version, 1);
        assert_eq!(resolved.table_name, DEFAULT_TABLE);
        assert_eq!(resolved.batch_size, DEFAULT_BATCH_SIZE);
        assert_eq!(resolved.source_url, DEFAULT_SOURCE_URL);
        assert_eq!(resolved.decode_fallback, Some(encoding_rs::WINDOWS_1252));
        assert!(resolved.layout.raw_path().starts_with("data"));
    }

    #[test]
    fn parse_partial_json() {
        let config: Config = serde_json::from_str(
            r#"{ "data_dir": "/srv/etl", "batch_size": 500, "decode_fallback": null }"#,
        )
        .unwrap();
        let resolved = ConfigLoader::resolve_config(config).unwrap();
        assert_eq!(resolved.batch_size, 500);
        assert_eq!(resolved.decode_fallback, None);
        assert_eq!(
            resolved.layout.store_path(),
            Utf8Path::new("/srv/etl/effectifs.sqlite3")
        );
        assert_eq!(resolved.http, HttpSettings::default());
    }
}

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::KeyError;

pub const AGE_BANDS: [&str; 21] = [
    "00-04", "05-09", "10-14", "15-19", "20-24", "25-29", "30-34", "35-39", "40-44", "45-49",
    "50-54", "55-59", "60-64", "65-69", "70-74", "75-79", "80-84", "85-89", "90-94", "95et+",
    "tsage",
];

pub const REGIONS: [&str; 19] = [
    "01", "02", "03", "04", "06", "11", "24", "27", "28", "32", "44", "52", "53", "75", "76",
    "84", "93", "94", "99",
];

pub const REGION_LEVEL_DEPT: &str = "999";

const OVERSEAS_DEPARTMENTS: [&str; 5] = ["971", "972", "973", "974", "976"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct YearRange {
    pub min: i32,
    pub max: i32,
}

impl Default for YearRange {
    fn default() -> Self {
        Self {
            min: 2015,
            max: 2023,
        }
    }
}

impl YearRange {
    pub fn parse(&self, value: &str) -> Result<i32, KeyError> {
        let trimmed = value.trim();
        if trimmed.is_empty() {
            return Err(KeyError::Missing("annee"));
        }
        let year: i32 = trimmed
            .parse()
            .map_err(|_| KeyError::InvalidYear(value.to_string()))?;
        if year < self.min || year > self.max {
            return Err(KeyError::YearOutOfRange {
                year,
                min: self.min,
                max: self.max,
            });
        }
        Ok(year)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TerritoryLevel {
    Region,
    Department,
}

impl TerritoryLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            TerritoryLevel::Region => "region",
            TerritoryLevel::Department => "department",
        }
    }
}

impl fmt::Display for TerritoryLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Territory {
    region: String,
    dept: String,
    level: TerritoryLevel,
}

impl Territory {
    pub fn parse(region: &str, dept: &str) -> Result<Self, KeyError> {
        let region = region.trim();
        let dept = dept.trim();
        if region.is_empty() {
            return Err(KeyError::Missing("region"));
        }
        if dept.is_empty() {
            return Err(KeyError::Missing("dept"));
        }
        let region = normalize_code(region, 2);
        if !REGIONS.contains(&region.as_str()) {
            return Err(KeyError::InvalidRegion(region));
        }

        let level = if dept == REGION_LEVEL_DEPT {
            TerritoryLevel::Region
        } else {
            TerritoryLevel::Department
        };
        let dept = match level {
            TerritoryLevel::Region => dept.to_string(),
            TerritoryLevel::Department => {
                let dept = normalize_code(&dept.to_ascii_uppercase(), 2);
                if !is_department(&dept) {
                    return Err(KeyError::InvalidDepartment(dept));
                }
                dept
            }
        };

        Ok(Self {
            region,
            dept,
            level,
        })
    }

    pub fn region(&self) -> &str {
        &self.region
    }

    pub fn dept(&self) -> &str {
        &self.dept
    }

    pub fn level(&self) -> TerritoryLevel {
        self.level
    }

    pub fn code(&self) -> &str {
        match self.level {
            TerritoryLevel::Region => &self.region,
            TerritoryLevel::Department => &self.dept,
        }
    }
}

impl fmt::Display for Territory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.level, self.code())
    }
}

// Exports sometimes strip the leading zero of single-digit codes ("1" for "01").
fn normalize_code(code: &str, width: usize) -> String {
    if code.len() < width && code.chars().all(|ch| ch.is_ascii_digit()) {
        format!("{code:0>width$}")
    } else {
        code.to_string()
    }
}

fn is_department(code: &str) -> bool {
    if code == "2A" || code == "2B" {
        return true;
    }
    if OVERSEAS_DEPARTMENTS.contains(&code) {
        return true;
    }
    code.len() == 2
        && code
            .parse::<u8>()
            .map(|value| (1..=95).contains(&value) && value != 20)
            .unwrap_or(false)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct AgeBand(&'static str);

impl AgeBand {
    pub fn as_str(&self) -> &'static str {
        self.0
    }
}

impl fmt::Display for AgeBand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.0)
    }
}

impl FromStr for AgeBand {
    type Err = KeyError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let trimmed = value.trim();
        if trimmed.is_empty() {
            return Err(KeyError::Missing("cla_age_5"));
        }
        AGE_BANDS
            .iter()
            .copied()
            .find(|band| band.eq_ignore_ascii_case(trimmed))
            .map(AgeBand)
            .ok_or_else(|| KeyError::InvalidAgeBand(value.to_string()))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Sex {
    Male,
    Female,
    All,
}

impl Sex {
    pub fn code(&self) -> u8 {
        match self {
            Sex::Male => 1,
            Sex::Female => 2,
            Sex::All => 9,
        }
    }
}

impl fmt::Display for Sex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Sex::Male => write!(f, "male"),
            Sex::Female => write!(f, "female"),
            Sex::All => write!(f, "all"),
        }
    }
}

impl FromStr for Sex {
    type Err = KeyError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim() {
            "" => Err(KeyError::Missing("sexe")),
            "1" => Ok(Sex::Male),
            "2" => Ok(Sex::Female),
            "9" => Ok(Sex::All),
            _ => Err(KeyError::InvalidSex(value.to_string())),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Severity(u8);

impl Severity {
    pub fn level(&self) -> u8 {
        self.0
    }
}

impl FromStr for Severity {
    type Err = KeyError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let level: u8 = value
            .trim()
            .parse()
            .map_err(|_| KeyError::InvalidSeverity(value.to_string()))?;
        if !(1..=3).contains(&level) {
            return Err(KeyError::InvalidSeverity(value.to_string()));
        }
        Ok(Self(level))
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;

    #[test]
    fn parse_year_in_range() {
        let range = YearRange::default();
        assert_eq!(range.parse(" 2023 ").unwrap(), 2023);
        assert_matches!(range.parse(""), Err(KeyError::Missing("annee")));
        assert_matches!(range.parse("2014"), Err(KeyError::YearOutOfRange { .. }));
        assert_matches!(range.parse("20x3"), Err(KeyError::InvalidYear(_)));
    }

    #[test]
    fn parse_department_territory() {
        let territory = Territory::parse("11", "75").unwrap();
        assert_eq!(territory.level(), TerritoryLevel::Department);
        assert_eq!(territory.code(), "75");

        let corsica = Territory::parse("94", "2a").unwrap();
        assert_eq!(corsica.dept(), "2A");

        let overseas = Territory::parse("03", "973").unwrap();
        assert_eq!(overseas.code(), "973");
    }

    #[test]
    fn parse_region_territory() {
        let territory = Territory::parse("1", "999").unwrap();
        assert_eq!(territory.level(), TerritoryLevel::Region);
        assert_eq!(territory.code(), "01");
    }

    #[test]
    fn reject_unknown_codes() {
        assert_matches!(
            Territory::parse("05", "75"),
            Err(KeyError::InvalidRegion(_))
        );
        assert_matches!(
            Territory::parse("11", "20"),
            Err(KeyError::InvalidDepartment(_))
        );
        assert_matches!(Territory::parse("11", ""), Err(KeyError::Missing("dept")));
    }

    #[test]
    fn parse_age_band_and_sex() {
        let band: AgeBand = "95ET+".parse().unwrap();
        assert_eq!(band.as_str(), "95et+");
        assert_eq!("TSAGE".parse::<AgeBand>().unwrap().as_str(), "tsage");
        assert_matches!("100+".parse::<AgeBand>(), Err(KeyError::InvalidAgeBand(_)));

        assert_eq!("9".parse::<Sex>().unwrap(), Sex::All);
        assert_eq!(Sex::Female.code(), 2);
        assert_matches!("3".parse::<Sex>(), Err(KeyError::InvalidSex(_)));
    }

    #[test]
    fn parse_severity() {
        assert_eq!("2".parse::<Severity>().unwrap().level(), 2);
        assert_matches!("4".parse::<Severity>(), Err(KeyError::InvalidSeverity(_)));
    }
}

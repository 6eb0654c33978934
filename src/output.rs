use std::io::{self, Write};

use serde::Serialize;

use crate::normalize::{LabelAudit, NormalizeReport};
use crate::pipeline::PipelineReport;
use crate::progress::ProgressSnapshot;

pub struct JsonOutput;

impl JsonOutput {
    pub fn print_report(report: &PipelineReport) -> io::Result<()> {
        Self::print_json(report)
    }

    pub fn print_snapshot(snapshot: &ProgressSnapshot) -> io::Result<()> {
        Self::print_json(snapshot)
    }

    pub fn print_labels(
        audit: &[LabelAudit],
        normalized: Option<&NormalizeReport>,
    ) -> io::Result<()> {
        #[derive(Serialize)]
        struct Labels<'a> {
            labels: &'a [LabelAudit],
            normalized: Option<&'a NormalizeReport>,
        }
        Self::print_json(&Labels {
            labels: audit,
            normalized,
        })
    }

    fn print_json<T: Serialize + ?Sized>(value: &T) -> io::Result<()> {
        let json = serde_json::to_string_pretty(value).map_err(io::Error::other)?;
        let mut stdout = io::stdout();
        stdout.write_all(json.as_bytes())?;
        stdout.write_all(b"\n")?;
        Ok(())
    }
}

/// One line per stage change for the text mode of `run`.
pub fn progress_line(snapshot: &ProgressSnapshot) -> String {
    let percent = snapshot
        .whole_percent()
        .map_or_else(|| "--".to_string(), |value| format!("{value:>3}%"));
    match &snapshot.sub_stage {
        Some(sub_stage) => format!(
            "[{}] {percent} {} ({sub_stage})",
            snapshot.stage.label(),
            snapshot.message
        ),
        None => format!("[{}] {percent} {}", snapshot.stage.label(), snapshot.message),
    }
}

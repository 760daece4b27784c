use std::io::{self, Write};

use serde::Serialize;
use serde_json::Value;

use crate::runner::RunSummary;
use crate::store::BackupEntry;

pub struct JsonOutput;

impl JsonOutput {
    pub fn print_summary(summary: &RunSummary) -> io::Result<()> {
        Self::print_json(summary)
    }

    pub fn print_list(entries: &[BackupEntry]) -> io::Result<()> {
        Self::print_json(&entries)
    }

    pub fn print_record(record: &Value) -> io::Result<()> {
        Self::print_json(record)
    }

    fn print_json<T: Serialize + ?Sized>(value: &T) -> io::Result<()> {
        let json = serde_json::to_string_pretty(value).map_err(io::Error::other)?;
        let mut stdout = io::stdout();
        stdout.write_all(json.as_bytes())?;
        stdout.write_all(b"\n")?;
        Ok(())
    }
}

use std::path::Path;

use anyhow::{Context, Result, bail};

use crate::artifact::Table;
use crate::experiment::NewSample;
use crate::hashing::compute_sha256;

/// Read a CSV export (header row = marker panel, one row per event).
pub fn read_csv_table(path: &Path) -> Result<Table> {
    let mut reader = csv::ReaderBuilder::new()
        .trim(csv::Trim::All)
        .from_path(path)
        .with_context(|| format!("Failed to open sample file: {}", path.display()))?;

    let columns: Vec<String> = reader
        .headers()
        .with_context(|| format!("Failed to read header row: {}", path.display()))?
        .iter()
        .map(str::to_string)
        .collect();
    if columns.is_empty() || columns.iter().any(String::is_empty) {
        bail!("Sample file {} has an empty marker name in its header", path.display());
    }

    let mut rows = Vec::new();
    for (idx, record) in reader.records().enumerate() {
        let record = record
            .with_context(|| format!("Failed to read event {} in {}", idx + 1, path.display()))?;
        let row = record
            .iter()
            .enumerate()
            .map(|(col, field)| {
                let value: f64 = field.parse().with_context(|| {
                    format!(
                        "Event {} marker '{}' in {} is not a number: '{}'",
                        idx + 1,
                        columns[col],
                        path.display(),
                        field
                    )
                })?;
                if !value.is_finite() {
                    bail!("Event {} in {} holds a non-finite value", idx + 1, path.display());
                }
                Ok(value)
            })
            .collect::<Result<Vec<f64>>>()?;
        rows.push(row);
    }

    Ok(Table::new(columns, rows))
}

/// Hash and parse a sample file. The id is the file stem.
pub fn load_sample(path: &Path) -> Result<NewSample> {
    let content_hash = compute_sha256(path)?;
    let table = read_csv_table(path)?;
    let id = path
        .file_stem()
        .map(|s| s.to_string_lossy().to_string())
        .filter(|s| !s.is_empty())
        .with_context(|| format!("Cannot derive a sample id from {}", path.display()))?;

    Ok(NewSample {
        id,
        content_hash,
        table,
        source: path.file_name().map(|n| n.to_string_lossy().to_string()),
        subject_id: None,
        acquired_on: None,
    })
}

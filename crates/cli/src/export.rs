//! `--labels` output: one `row_index,label` line per labelled ledger row,
//! for writing review marks back into the original export.

use std::collections::BTreeMap;
use std::path::Path;

use crate::exit_codes::EXIT_ERROR;
use crate::CliError;

fn export_err(path: &Path, e: impl std::fmt::Display) -> CliError {
    CliError {
        code: EXIT_ERROR,
        message: format!("cannot write {}: {e}", path.display()),
        hint: None,
    }
}

/// Write row labels in row order.
pub fn write_labels(path: &Path, labels: &BTreeMap<usize, String>) -> Result<(), CliError> {
    let mut writer = csv::Writer::from_path(path).map_err(|e| export_err(path, e))?;
    writer
        .write_record(["row_index", "label"])
        .map_err(|e| export_err(path, e))?;
    for (row, label) in labels {
        writer
            .write_record([row.to_string().as_str(), label.as_str()])
            .map_err(|e| export_err(path, e))?;
    }
    writer.flush().map_err(|e| export_err(path, e))?;
    Ok(())
}

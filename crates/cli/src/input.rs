//! Loading ledgers and extracted documents from disk.
//!
//! Ledgers come as JSON (an array of rows) or as CSV exports mapped through
//! `[ledger_columns]`. Cells that do not parse load as `None` and show up as
//! `missing` in comparisons.

use std::collections::HashMap;
use std::path::Path;

use tally_recon::config::LedgerColumns;
use tally_recon::model::{ExtractedDocument, LedgerAmounts, LedgerRow};
use tally_recon::normalize::parse_amount;
use tally_recon::ReconError;

use crate::exit_codes::{recon_exit_code, EXIT_INPUT};
use crate::CliError;

fn input_err(msg: impl Into<String>) -> CliError {
    CliError { code: EXIT_INPUT, message: msg.into(), hint: None }
}

fn is_json(path: &Path) -> bool {
    path.extension()
        .map_or(false, |ext| ext.eq_ignore_ascii_case("json"))
}

/// Load a ledger; `.json` files as rows, anything else as CSV.
pub fn load_ledger(
    path: &Path,
    columns: Option<&LedgerColumns>,
) -> Result<Vec<LedgerRow>, CliError> {
    let data = std::fs::read_to_string(path)
        .map_err(|e| input_err(format!("cannot read {}: {e}", path.display())))?;

    let rows = if is_json(path) {
        serde_json::from_str::<Vec<LedgerRow>>(&data)
            .map_err(|e| input_err(format!("{}: {e}", path.display())))?
    } else {
        match columns {
            Some(columns) => parse_ledger_csv(&data, columns, true)?,
            None => parse_ledger_csv(&data, &default_columns(), false)?,
        }
    };

    if rows.is_empty() {
        let err = ReconError::EmptyLedger;
        return Err(CliError {
            code: recon_exit_code(&err),
            message: format!("{}: {err}", path.display()),
            hint: Some("check [ledger_columns] against the export's header row".into()),
        });
    }
    tracing::info!(rows = rows.len(), file = %path.display(), "ledger loaded");
    Ok(rows)
}

/// Header names equal to the row field names. Used when the config has no
/// `[ledger_columns]`; absent headers then simply load as `None`.
pub fn default_columns() -> LedgerColumns {
    let some = |s: &str| Some(s.to_string());
    LedgerColumns {
        document_number: "document_number".into(),
        document_type: some("document_type"),
        document_date: some("document_date"),
        counterparty_id: some("counterparty_id"),
        counterparty_vat_id: some("counterparty_vat_id"),
        counterparty_name: some("counterparty_name"),
        vat_registered: some("vat_registered"),
        total_base: some("total_base"),
        total_vat: some("total_vat"),
        base_20: some("base_20"),
        vat_20: some("vat_20"),
        base_9: some("base_9"),
        vat_9: some("vat_9"),
        base_0: some("base_0"),
        base_no_credit: some("base_no_credit"),
    }
}

/// Parse a CSV ledger export. Row index is the 1-based data-row position,
/// so it matches the row the export step writes back to. Rows with neither
/// a document number nor any amount (subtotals, blank lines) are skipped
/// but still count toward later positions.
///
/// With `strict`, every mapped header must exist.
pub fn parse_ledger_csv(
    data: &str,
    columns: &LedgerColumns,
    strict: bool,
) -> Result<Vec<LedgerRow>, CliError> {
    let data = data.strip_prefix('\u{feff}').unwrap_or(data);
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(true)
        .flexible(true)
        .from_reader(data.as_bytes());

    let headers = reader
        .headers()
        .map_err(|e| input_err(format!("cannot read CSV headers: {e}")))?
        .clone();
    let positions: HashMap<String, usize> = headers
        .iter()
        .enumerate()
        .map(|(i, h)| (h.trim().to_string(), i))
        .collect();

    let lookup = |name: &Option<String>| -> Result<Option<usize>, CliError> {
        match name {
            None => Ok(None),
            Some(n) => match positions.get(n.trim()) {
                Some(i) => Ok(Some(*i)),
                None if strict => Err(input_err(format!(
                    "ledger column '{n}' not found in CSV headers"
                ))),
                None => Ok(None),
            },
        }
    };
    let number_col = match positions.get(columns.document_number.trim()) {
        Some(i) => Some(*i),
        None => {
            return Err(input_err(format!(
                "ledger column '{}' not found in CSV headers",
                columns.document_number
            )))
        }
    };
    let type_col = lookup(&columns.document_type)?;
    let date_col = lookup(&columns.document_date)?;
    let id_col = lookup(&columns.counterparty_id)?;
    let vat_id_col = lookup(&columns.counterparty_vat_id)?;
    let name_col = lookup(&columns.counterparty_name)?;
    let registered_col = lookup(&columns.vat_registered)?;
    let amount_cols = [
        lookup(&columns.total_base)?,
        lookup(&columns.total_vat)?,
        lookup(&columns.base_20)?,
        lookup(&columns.vat_20)?,
        lookup(&columns.base_9)?,
        lookup(&columns.vat_9)?,
        lookup(&columns.base_0)?,
        lookup(&columns.base_no_credit)?,
    ];

    let mut rows = Vec::new();
    for (i, record) in reader.records().enumerate() {
        let record = record.map_err(|e| input_err(format!("CSV row {}: {e}", i + 1)))?;
        let text = |col: Option<usize>| -> Option<String> {
            col.and_then(|c| record.get(c))
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
        };
        let amount = |col: Option<usize>| text(col).as_deref().and_then(parse_amount);

        let [total_base, total_vat, base_20, vat_20, base_9, vat_9, base_0, base_no_credit] =
            amount_cols.map(|c| amount(c));
        let amounts = LedgerAmounts {
            total_base,
            total_vat,
            base_20,
            vat_20,
            base_9,
            vat_9,
            base_0,
            base_no_credit,
        };

        let document_number = text(number_col);
        let has_amount = amount_cols.iter().any(|c| amount(*c).is_some());
        if document_number.is_none() && !has_amount {
            continue;
        }

        let mut row = LedgerRow::new(i + 1);
        row.document_type = text(type_col);
        row.document_number = document_number;
        row.document_date = text(date_col);
        row.counterparty_id = text(id_col);
        row.counterparty_vat_id = text(vat_id_col);
        row.counterparty_name = text(name_col);
        row.vat_registered = text(registered_col).map_or(true, |v| parse_flag(&v));
        row.amounts = amounts;
        rows.push(row);
    }
    Ok(rows)
}

/// Yes/no cell; anything unrecognized counts as registered.
fn parse_flag(raw: &str) -> bool {
    !matches!(
        raw.trim().to_lowercase().as_str(),
        "no" | "n" | "false" | "0" | "не" | "н"
    )
}

/// Load pre-extracted documents (a JSON array). Source indices are reset to
/// array positions.
pub fn load_documents(path: &Path) -> Result<Vec<ExtractedDocument>, CliError> {
    let data = std::fs::read_to_string(path)
        .map_err(|e| input_err(format!("cannot read {}: {e}", path.display())))?;
    let mut docs: Vec<ExtractedDocument> = serde_json::from_str(&data)
        .map_err(|e| input_err(format!("{}: {e}", path.display())))?;
    for (i, doc) in docs.iter_mut().enumerate() {
        doc.source_index = i;
    }
    Ok(docs)
}

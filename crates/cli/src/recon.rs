//! `tally verify`, `tally check-ledger`, `tally validate`.

use std::path::{Path, PathBuf};

use serde::Serialize;

use tally_recon::evidence::row_labels;
use tally_recon::ledger_check::check_ledger;
use tally_recon::model::{ExtractionStats, LedgerFinding, Severity};
use tally_recon::{verify, ExtractedDocument, ReconConfig, Reconciler, VerificationSummary};

use crate::exit_codes::{
    recon_exit_code, EXIT_DISCREPANCIES, EXIT_ERROR, EXIT_INVALID_CONFIG, EXIT_USAGE,
};
use crate::export::write_labels;
use crate::input::{load_documents, load_ledger};
use crate::replay::RecordedExtractor;
use crate::CliError;

pub struct VerifyArgs {
    pub config: PathBuf,
    pub ledger: PathBuf,
    pub documents: Option<PathBuf>,
    pub extractions: Option<PathBuf>,
    pub json: bool,
    pub output: Option<PathBuf>,
    pub labels: Option<PathBuf>,
    pub pace: bool,
}

/// `--json` / `--output` payload of `tally verify`.
#[derive(Serialize)]
struct VerifyOutput<'a> {
    summary: &'a VerificationSummary,
    findings: &'a [LedgerFinding],
    #[serde(skip_serializing_if = "Option::is_none")]
    stats: Option<&'a ExtractionStats>,
    /// Final per-source reads, only when extraction was replayed.
    #[serde(skip_serializing_if = "Option::is_none")]
    documents: Option<&'a [ExtractedDocument]>,
}

#[derive(Serialize)]
struct CheckLedgerOutput<'a> {
    config_name: &'a str,
    rows: usize,
    findings: &'a [LedgerFinding],
}

fn recon_err(code: u8, msg: impl Into<String>) -> CliError {
    CliError::new(code, msg)
}

fn load_config(path: &Path) -> Result<ReconConfig, CliError> {
    let config_str = std::fs::read_to_string(path)
        .map_err(|e| recon_err(EXIT_INVALID_CONFIG, format!("cannot read config: {e}")))?;
    ReconConfig::from_toml(&config_str).map_err(|e| recon_err(recon_exit_code(&e), e.to_string()))
}

fn error_count(findings: &[LedgerFinding]) -> usize {
    findings.iter().filter(|f| f.severity == Severity::Error).count()
}

fn emit_json<T: Serialize>(value: &T, json: bool, output: Option<&Path>) -> Result<(), CliError> {
    let json_str = serde_json::to_string_pretty(value)
        .map_err(|e| recon_err(EXIT_ERROR, format!("JSON serialization error: {e}")))?;

    if let Some(path) = output {
        std::fs::write(path, &json_str)
            .map_err(|e| recon_err(EXIT_ERROR, format!("cannot write output: {e}")))?;
        eprintln!("wrote {}", path.display());
    }
    if json {
        println!("{json_str}");
    }
    Ok(())
}

fn print_findings(findings: &[LedgerFinding]) {
    for f in findings {
        let severity = match f.severity {
            Severity::Error => "error",
            Severity::Warning => "warning",
        };
        match f.row_index {
            Some(row) => eprintln!("  {severity:<7} row {row}: {}", f.message),
            None => eprintln!("  {severity:<7} {}", f.message),
        }
    }
}

pub async fn cmd_verify(args: VerifyArgs) -> Result<(), CliError> {
    let mut config = load_config(&args.config)?;
    let rows = load_ledger(&args.ledger, config.ledger_columns.as_ref())?;

    let (summary, findings, stats, documents) = match (&args.documents, &args.extractions) {
        (_, Some(recording)) => {
            let replay = RecordedExtractor::load(recording)?;
            let sources = replay.sources();
            if !args.pace {
                config.pacing = config.pacing.without_delays();
            }
            let report = Reconciler::new(&config, &replay)
                .run_batch(&sources, &rows)
                .await
                .map_err(|e| recon_err(recon_exit_code(&e), e.to_string()))?;
            tracing::info!(served = replay.calls(), file = %recording.display(), "replay finished");
            (report.summary, report.findings, Some(report.stats), Some(report.documents))
        }
        (Some(path), None) => {
            let docs = load_documents(path)?;
            let summary = verify(&config, &docs, &rows)
                .map_err(|e| recon_err(recon_exit_code(&e), e.to_string()))?;
            (summary, check_ledger(&rows, &config), None, None)
        }
        (None, None) => {
            return Err(CliError::new(EXIT_USAGE, "no documents given")
                .with_hint("pass --documents FILE or --extractions FILE"))
        }
    };

    let out = VerifyOutput {
        summary: &summary,
        findings: &findings,
        stats: stats.as_ref(),
        documents: documents.as_deref(),
    };
    emit_json(&out, args.json, args.output.as_deref())?;

    if let Some(ref path) = args.labels {
        write_labels(path, &row_labels(&summary, &config.labels))?;
        eprintln!("wrote {}", path.display());
    }

    // Human summary to stderr
    let t = &summary.totals;
    eprintln!(
        "{} '{}': {} document(s) vs {} row(s): {} matched, {} suspicious, {} unreadable, {} not found, {} missing",
        summary.meta.flow,
        summary.meta.config_name,
        t.documents,
        t.ledger_rows,
        t.matched,
        t.suspicious,
        t.unreadable,
        t.not_found,
        t.missing_rows,
    );
    if t.foreign_rows_excluded > 0 {
        eprintln!("  {} foreign row(s) not expected to have documents", t.foreign_rows_excluded);
    }
    if !args.json {
        for r in summary.results.iter().filter(|r| r.status.is_flagged()) {
            let row = r.matched_row.map_or_else(|| "-".to_string(), |i| i.to_string());
            eprintln!(
                "  {:<11} {} (number {}, row {row}, {} mismatch(es))",
                r.status.as_str(),
                r.file_name,
                r.document_number.as_deref().unwrap_or("?"),
                r.mismatches,
            );
        }
        for row in &summary.missing_rows {
            eprintln!(
                "  {:<11} row {} (number {})",
                "missing",
                row.row_index,
                row.document_number.as_deref().unwrap_or("?"),
            );
        }
    }
    if let Some(ref s) = stats {
        eprintln!(
            "extraction: {} call(s), {} retried, {} exhausted, {} escalated, {} arbitrated, {} replaced",
            s.calls,
            s.transient_retries,
            s.exhausted,
            s.escalations,
            s.arbitrations,
            s.replacements,
        );
    }
    if !findings.is_empty() {
        eprintln!(
            "ledger: {} error(s), {} warning(s)",
            error_count(&findings),
            findings.len() - error_count(&findings),
        );
        if !args.json {
            print_findings(&findings);
        }
    }

    if summary.has_discrepancies() || error_count(&findings) > 0 {
        return Err(recon_err(EXIT_DISCREPANCIES, "discrepancies found"));
    }
    Ok(())
}

pub fn cmd_check_ledger(config_path: PathBuf, ledger: PathBuf, json: bool) -> Result<(), CliError> {
    let config = load_config(&config_path)?;
    let rows = load_ledger(&ledger, config.ledger_columns.as_ref())?;
    let findings = check_ledger(&rows, &config);

    if json {
        let out = CheckLedgerOutput {
            config_name: &config.name,
            rows: rows.len(),
            findings: &findings,
        };
        emit_json(&out, true, None)?;
    }

    let errors = error_count(&findings);
    eprintln!(
        "ledger '{}': {} row(s), {} error(s), {} warning(s)",
        config.name,
        rows.len(),
        errors,
        findings.len() - errors,
    );
    if !json {
        print_findings(&findings);
    }

    if errors > 0 {
        return Err(recon_err(EXIT_DISCREPANCIES, "ledger inconsistencies found"));
    }
    Ok(())
}

pub fn cmd_validate(config_path: PathBuf) -> Result<(), CliError> {
    let config = load_config(&config_path)?;
    let tol = config.tolerances();
    eprintln!(
        "valid: {} recon '{}' (tax base ±{}, VAT ±{}, ceiling {}, sequence checks {})",
        config.flow,
        config.name,
        tol.tax_base,
        tol.vat,
        tol.mismatch_ceiling,
        if config.sequence_checks() { "on" } else { "off" },
    );
    Ok(())
}

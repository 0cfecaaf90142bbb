//! CLI Exit Code Registry
//!
//! Single source of truth for `tally` exit codes. Scripts rely on them.
//!
//! | Code | Meaning                                                        |
//! |------|----------------------------------------------------------------|
//! | 0    | Success, nothing to review                                     |
//! | 1    | General error (unspecified)                                    |
//! | 2    | Usage error (bad args)                                         |
//! | 3    | Discrepancies found (flagged documents, missing rows, ledger errors) |
//! | 4    | Invalid config                                                 |
//! | 5    | Input could not be loaded (unreadable file, empty ledger)      |

use tally_recon::ReconError;

/// Success - command completed and nothing needs review.
pub const EXIT_SUCCESS: u8 = 0;

/// General error - unspecified failure.
pub const EXIT_ERROR: u8 = 1;

/// Usage error - bad arguments, missing required options.
pub const EXIT_USAGE: u8 = 2;

/// The run completed but found something a human has to look at.
pub const EXIT_DISCREPANCIES: u8 = 3;

/// Config failed to parse or validate.
pub const EXIT_INVALID_CONFIG: u8 = 4;

/// Ledger or extraction file unreadable, malformed, or without rows.
pub const EXIT_INPUT: u8 = 5;

/// Map an engine error to its exit code.
pub fn recon_exit_code(err: &ReconError) -> u8 {
    match err {
        ReconError::ConfigParse(_) | ReconError::ConfigValidation(_) => EXIT_INVALID_CONFIG,
        ReconError::EmptyLedger | ReconError::DuplicateRowIndex(_) => EXIT_INPUT,
    }
}

//! Turns raw process output and exit codes into operation results.

use crate::operation::{OperationResult, OutputSource};

const ERROR_MARKERS: &[&str] = &[
    "error",
    "failed",
    "exception",
    "cannot",
    "could not",
    "not found",
    "access to the path",
    "denied",
];

const ERROR_PREVIEW_LINES: usize = 3;

/// Whether a line should count against the operation. Everything on stderr
/// counts.
pub fn is_error_line(line: &str, source: OutputSource) -> bool {
    if source == OutputSource::Stderr {
        return true;
    }
    let lower = line.to_lowercase();
    ERROR_MARKERS.iter().any(|marker| lower.contains(marker)) || line.contains("Remove-Item")
}

/// Final result of a package-manager command.
pub fn summarize(title: &str, exit_ok: bool, exit_code: Option<i32>, errors: &[String]) -> OperationResult {
    if exit_ok && errors.is_empty() {
        return OperationResult::success(format!("{} completed successfully", title));
    }
    if errors.is_empty() {
        let code = exit_code.map_or_else(|| "unknown".to_string(), |c| c.to_string());
        return OperationResult::failure(format!(
            "{} failed with exit code {}. Please check the output log for details.",
            title, code
        ));
    }
    let preview = if errors.len() <= ERROR_PREVIEW_LINES {
        errors.join("\n")
    } else {
        format!(
            "{}\n... and {} more errors",
            errors[..ERROR_PREVIEW_LINES].join("\n"),
            errors.len() - ERROR_PREVIEW_LINES
        )
    };
    OperationResult::failure(format!(
        "{} failed with {} error(s):\n{}\nPlease check the output log for details.",
        title,
        errors.len(),
        preview
    ))
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScanOutcome {
    pub detections_found: bool,
    pub is_api_key_missing: bool,
    pub message: String,
}

/// Maps `scoop virustotal` exit codes.
pub fn scan_outcome(exit_code: i32) -> ScanOutcome {
    match exit_code {
        0 => ScanOutcome {
            detections_found: false,
            is_api_key_missing: false,
            message: "No threats found.".to_string(),
        },
        2 => ScanOutcome {
            detections_found: true,
            is_api_key_missing: false,
            message: "VirusTotal found one or more detections.".to_string(),
        },
        16 => ScanOutcome {
            detections_found: false,
            is_api_key_missing: true,
            message: "VirusTotal API key is not configured.".to_string(),
        },
        other => ScanOutcome {
            detections_found: true,
            is_api_key_missing: false,
            message: format!(
                "Scan failed with an unexpected error (exit code {}). Please check the output.",
                other
            ),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_lines_are_detected() {
        assert!(is_error_line("ERROR: 'git' isn't installed", OutputSource::Stdout));
        assert!(is_error_line("Access to the path 'C:\\x' is denied.", OutputSource::Stdout));
        assert!(is_error_line("anything", OutputSource::Stderr));
        assert!(!is_error_line("Installing 'git' (2.45.1) [64bit]", OutputSource::Stdout));
    }

    #[test]
    fn summary_lists_first_errors() {
        let errors: Vec<String> = (1..=5).map(|i| format!("error {}", i)).collect();
        let result = summarize("Installing git", true, Some(0), &errors);
        assert!(!result.success);
        assert_eq!(
            result.message,
            "Installing git failed with 5 error(s):\nerror 1\nerror 2\nerror 3\n... and 2 more errors\nPlease check the output log for details."
        );
    }

    #[test]
    fn summary_reports_exit_code_without_error_lines() {
        let result = summarize("Updating all packages", false, Some(1), &[]);
        assert!(result.message.contains("exit code 1"));
        assert!(summarize("Uninstalling git", true, Some(0), &[]).success);
    }

    #[test]
    fn scan_exit_codes() {
        assert!(!scan_outcome(0).detections_found);
        assert!(scan_outcome(2).detections_found);
        assert!(scan_outcome(16).is_api_key_missing);
        let other = scan_outcome(7);
        assert!(other.detections_found);
        assert!(other.message.contains("exit code 7"));
    }
}

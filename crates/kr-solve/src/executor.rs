//! The solver boundary.
//!
//! A [`SolverExecutor`] turns an input artifact into an output artifact. The
//! production executor shells out to an external solver binary; [`FnSolver`]
//! runs a closure in-process for dry runs and tests.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::process::Command;
use std::time::Duration;

use kr_types::{ArtifactRef, ExecutionError, KrResult, SimulationResults};

use crate::artifact::{ArtifactStore, SolverInput};
use crate::pool::WorkItemId;

/// Return code reported when the input artifact is missing.
pub const MISSING_INPUT_CODE: i32 = 1000;
/// Return code reported when the solver process could not be launched.
pub const LAUNCH_FAILURE_CODE: i32 = 2000;
/// Return code reported when the executor panicked.
pub const PANIC_CODE: i32 = 3000;

/// How to invoke the external solver.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SolverCommand {
    pub binary: PathBuf,
    /// Arguments placed before the input and output paths.
    #[serde(default)]
    pub extra_args: Vec<String>,
    /// Case-insensitive terms counted in the solver's output as errors.
    #[serde(default = "default_error_terms")]
    pub error_terms: Vec<String>,
}

fn default_error_terms() -> Vec<String> {
    vec!["exception".to_string()]
}

impl Default for SolverCommand {
    fn default() -> Self {
        Self {
            binary: PathBuf::from("kromatic-solver"),
            extra_args: Vec::new(),
            error_terms: default_error_terms(),
        }
    }
}

impl SolverCommand {
    pub fn new(binary: impl Into<PathBuf>) -> Self {
        Self {
            binary: binary.into(),
            ..Self::default()
        }
    }

    pub fn with_args(mut self, args: Vec<String>) -> Self {
        self.extra_args = args;
        self
    }

    pub fn with_error_terms(mut self, terms: Vec<String>) -> Self {
        self.error_terms = terms;
        self
    }
}

/// Raw outcome of one solver invocation.
#[derive(Debug, Clone, PartialEq)]
pub struct SolverRun {
    pub return_code: i32,
    /// Captured stdout and stderr.
    pub solver_output: String,
    /// Number of error terms found in `solver_output`.
    pub solver_errors: usize,
    /// Set when the run could not happen at all.
    pub exception: Option<String>,
}

impl SolverRun {
    pub(crate) fn exception(return_code: i32, message: String) -> Self {
        Self {
            return_code,
            solver_output: String::new(),
            solver_errors: 0,
            exception: Some(message),
        }
    }
}

/// A finished work item, as stored in the pool's result store.
#[derive(Debug, Clone)]
pub struct ExecutionReport {
    pub work_id: WorkItemId,
    pub output_file: PathBuf,
    pub solver_output: String,
    pub return_code: i32,
    pub solver_errors: usize,
    pub exception: Option<String>,
    pub run_time: Duration,
    pub finished_at: DateTime<Utc>,
    /// Name of the worker thread that ran the item.
    pub worker: String,
}

impl ExecutionReport {
    pub fn is_success(&self) -> bool {
        self.exception.is_none() && self.return_code == 0 && self.solver_errors == 0
    }

    /// Short human-readable failure reason, `None` on success.
    pub fn failure_reason(&self) -> Option<String> {
        if let Some(exc) = &self.exception {
            return Some(exc.clone());
        }
        if self.is_success() {
            return None;
        }
        let failure = ExecutionError::SolverFailed {
            return_code: self.return_code,
            message: format!(
                "{} error term(s): {}",
                self.solver_errors,
                self.solver_output.trim()
            ),
        };
        Some(failure.to_string())
    }
}

/// Runs the solver on one input artifact.
pub trait SolverExecutor: Send + Sync {
    fn execute(&self, artifact: &ArtifactRef) -> SolverRun;

    fn name(&self) -> &str;
}

/// Count case-insensitive occurrences of every term in `output`.
pub fn count_error_terms(output: &str, terms: &[String]) -> usize {
    let haystack = output.to_lowercase();
    terms
        .iter()
        .filter(|t| !t.is_empty())
        .map(|t| haystack.matches(&t.to_lowercase()).count())
        .sum()
}

/// Executor that launches the solver binary as a child process.
#[derive(Debug, Clone)]
pub struct ExternalSolver {
    command: SolverCommand,
    resolved: PathBuf,
}

impl ExternalSolver {
    /// Fails if the binary cannot be found.
    pub fn new(command: SolverCommand) -> KrResult<Self> {
        let resolved = find_binary(&command.binary).ok_or_else(|| ExecutionError::SolverNotFound {
            binary: command.binary.display().to_string(),
        })?;
        Ok(Self { command, resolved })
    }

    pub fn binary(&self) -> &Path {
        &self.resolved
    }
}

fn find_binary(binary: &Path) -> Option<PathBuf> {
    if binary.components().count() > 1 || binary.is_absolute() {
        return binary.is_file().then(|| binary.to_path_buf());
    }
    let paths = std::env::var_os("PATH")?;
    std::env::split_paths(&paths)
        .map(|dir| dir.join(binary))
        .find(|candidate| candidate.is_file())
}

impl SolverExecutor for ExternalSolver {
    fn execute(&self, artifact: &ArtifactRef) -> SolverRun {
        if !artifact.input.is_file() {
            return SolverRun::exception(
                MISSING_INPUT_CODE,
                format!("Input file {} not found", artifact.input.display()),
            );
        }

        let output = Command::new(&self.resolved)
            .args(&self.command.extra_args)
            .arg(&artifact.input)
            .arg(&artifact.output)
            .output();

        match output {
            Ok(out) => {
                let mut text = String::from_utf8_lossy(&out.stdout).into_owned();
                text.push_str(&String::from_utf8_lossy(&out.stderr));
                let solver_errors = count_error_terms(&text, &self.command.error_terms);
                let mut return_code = out.status.code().unwrap_or(-1);
                if return_code == 0 && !artifact.output_exists() {
                    return_code = 1;
                    text.push_str("\nno output file written");
                }
                SolverRun {
                    return_code,
                    solver_output: text,
                    solver_errors,
                    exception: None,
                }
            }
            Err(e) => SolverRun::exception(
                LAUNCH_FAILURE_CODE,
                format!("Failed to launch {}: {}", self.resolved.display(), e),
            ),
        }
    }

    fn name(&self) -> &str {
        "external"
    }
}

type SolveFn = dyn Fn(&SolverInput) -> KrResult<SimulationResults> + Send + Sync;

/// In-process executor backed by a closure.
///
/// Reads and writes the same artifact files as the external solver, so every
/// other part of the pipeline is exercised unchanged. A closure error is
/// reported as a solver-side failure.
pub struct FnSolver {
    solve: Box<SolveFn>,
}

impl FnSolver {
    pub fn new<F>(solve: F) -> Self
    where
        F: Fn(&SolverInput) -> KrResult<SimulationResults> + Send + Sync + 'static,
    {
        Self {
            solve: Box::new(solve),
        }
    }
}

impl SolverExecutor for FnSolver {
    fn execute(&self, artifact: &ArtifactRef) -> SolverRun {
        let input = match ArtifactStore::read_input(artifact) {
            Ok(input) => input,
            Err(e) => return SolverRun::exception(MISSING_INPUT_CODE, e.to_string()),
        };
        let written = (self.solve)(&input)
            .and_then(|results| ArtifactStore::write_output(artifact, &results));
        match written {
            Ok(()) => SolverRun {
                return_code: 0,
                solver_output: String::new(),
                solver_errors: 0,
                exception: None,
            },
            Err(e) => SolverRun {
                return_code: 1,
                solver_output: e.to_string(),
                solver_errors: 1,
                exception: None,
            },
        }
    }

    fn name(&self) -> &str {
        "in-process"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kr_types::KrError;
    use uuid::Uuid;

    #[test]
    fn error_terms_are_counted_case_insensitively() {
        let terms = vec!["exception".to_string(), "error".to_string()];
        let out = "Exception in thread\nnumerical ERROR at t=3\nEXCEPTION again";
        assert_eq!(count_error_terms(out, &terms), 3);
        assert_eq!(count_error_terms("all good", &terms), 0);
    }

    #[test]
    fn missing_binary_is_rejected_at_construction() {
        let err = ExternalSolver::new(SolverCommand::new("/definitely/not/a/solver")).unwrap_err();
        assert!(matches!(
            err,
            KrError::Execution(ExecutionError::SolverNotFound { .. })
        ));
    }

    #[test]
    fn fn_solver_reports_missing_input() {
        let dir = tempfile::tempdir().unwrap();
        let artifact = ArtifactRef::in_dir(dir.path(), Uuid::new_v4());
        let solver = FnSolver::new(|_| Ok(SimulationResults::default()));
        let run = solver.execute(&artifact);
        assert_eq!(run.return_code, MISSING_INPUT_CODE);
        assert!(run.exception.is_some());
    }

    /// External solver running `script` through `/bin/sh`, plus an artifact
    /// whose input file exists.
    #[cfg(unix)]
    fn shell_solver(dir: &Path, script: &str) -> (ExternalSolver, ArtifactRef) {
        let script_path = dir.join("solver.sh");
        std::fs::write(&script_path, script).unwrap();
        let command = SolverCommand::new("/bin/sh")
            .with_args(vec![script_path.display().to_string()]);
        let solver = ExternalSolver::new(command).unwrap();
        let artifact = ArtifactRef::in_dir(dir, Uuid::new_v4());
        std::fs::write(&artifact.input, "{}").unwrap();
        (solver, artifact)
    }

    #[cfg(unix)]
    #[test]
    fn external_solver_success_writes_output() {
        let dir = tempfile::tempdir().unwrap();
        let (solver, artifact) = shell_solver(dir.path(), "echo solved\ncp \"$1\" \"$2\"\n");
        let run = solver.execute(&artifact);
        assert_eq!(run.return_code, 0);
        assert_eq!(run.solver_errors, 0);
        assert!(run.exception.is_none());
        assert!(run.solver_output.contains("solved"));
        assert!(artifact.output_exists());
    }

    #[cfg(unix)]
    #[test]
    fn external_solver_nonzero_exit_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let (solver, artifact) = shell_solver(dir.path(), "echo diverged\nexit 3\n");
        let run = solver.execute(&artifact);
        assert_eq!(run.return_code, 3);
        assert!(run.exception.is_none());
        assert!(run.solver_output.contains("diverged"));
    }

    #[cfg(unix)]
    #[test]
    fn external_solver_without_output_file_fails() {
        let dir = tempfile::tempdir().unwrap();
        let (solver, artifact) = shell_solver(dir.path(), "exit 0\n");
        let run = solver.execute(&artifact);
        assert_eq!(run.return_code, 1);
        assert!(run.solver_output.contains("no output file written"));
        assert!(!artifact.output_exists());
    }

    #[cfg(unix)]
    #[test]
    fn external_solver_counts_error_terms_on_stderr() {
        let dir = tempfile::tempdir().unwrap();
        let script = "echo 'Exception: step size too small' >&2\necho 'exception again' >&2\ncp \"$1\" \"$2\"\n";
        let (solver, artifact) = shell_solver(dir.path(), script);
        let run = solver.execute(&artifact);
        assert_eq!(run.return_code, 0);
        assert_eq!(run.solver_errors, 2);
        assert!(run.solver_output.contains("step size too small"));
    }

    #[cfg(unix)]
    #[test]
    fn external_solver_reports_missing_input() {
        let dir = tempfile::tempdir().unwrap();
        let (solver, artifact) = shell_solver(dir.path(), "cp \"$1\" \"$2\"\n");
        std::fs::remove_file(&artifact.input).unwrap();
        let run = solver.execute(&artifact);
        assert_eq!(run.return_code, MISSING_INPUT_CODE);
        assert!(run.exception.unwrap().contains("not found"));
        assert!(!artifact.output_exists());
    }

    #[test]
    fn report_failure_reason_prefers_exception() {
        let mut report = ExecutionReport {
            work_id: WorkItemId(0),
            output_file: PathBuf::new(),
            solver_output: "diverged".into(),
            return_code: 1,
            solver_errors: 1,
            exception: None,
            run_time: Duration::ZERO,
            finished_at: Utc::now(),
            worker: "w".into(),
        };
        assert!(!report.is_success());
        let reason = report.failure_reason().unwrap();
        assert!(reason.contains("diverged"));
        assert!(reason.contains("return code 1"));

        report.exception = Some("launch failed".into());
        assert_eq!(report.failure_reason().as_deref(), Some("launch failed"));

        report.exception = None;
        report.return_code = 0;
        report.solver_errors = 0;
        assert!(report.failure_reason().is_none());
    }
}

//! `gsutil`-backed object store.

use std::path::Path;
use std::time::Duration;

use tracing::debug;

use super::{ObjectMeta, ObjectStore};
use crate::error::{ContractError, Result};
use crate::locator::normalize_gs_uri;
use crate::runner::{self, CommandOutput};

/// Shells out to the `gsutil` CLI for every operation
#[derive(Debug, Clone)]
pub struct GsutilStore {
    program: String,
    timeout: Duration,
}

impl GsutilStore {
    pub fn new(program: impl Into<String>, timeout: Duration) -> Self {
        Self {
            program: program.into(),
            timeout,
        }
    }

    fn run(&self, args: &[&str]) -> Result<CommandOutput> {
        runner::run_command(&self.program, args, self.timeout).map_err(|err| {
            if runner::is_missing_program(&err) {
                ContractError::unavailable(format!("{} not found on PATH", self.program))
            } else {
                ContractError::transient(format!("{:#}", err))
            }
        })
    }
}

/// Error text gsutil prints when nothing matched
fn is_no_match(stderr: &str) -> bool {
    let lower = stderr.to_ascii_lowercase();
    lower.contains("no urls matched") || lower.contains("matched no objects")
}

/// Error text for failures a retry cannot fix
fn is_permission_error(stderr: &str) -> bool {
    stderr.contains("AccessDenied") || stderr.contains("403") || stderr.contains("401")
}

fn failure(program: &str, verb: &str, out: &CommandOutput) -> ContractError {
    let msg = format!(
        "{} {} failed (exit code {}): {}",
        program,
        verb,
        out.exit_code.unwrap_or(-1),
        out.stderr_line()
    );
    if is_permission_error(&out.stderr) {
        ContractError::unavailable(msg)
    } else {
        ContractError::transient(msg)
    }
}

/// Pull `Content-Length` out of `gsutil stat` output
pub fn parse_stat_size(stdout: &str) -> Option<u64> {
    stdout.lines().find_map(|line| {
        let (key, value) = line.trim().split_once(':')?;
        if key.trim() == "Content-Length" {
            value.trim().parse().ok()
        } else {
            None
        }
    })
}

/// Parse `gsutil ls -l -r` output into objects, skipping folder headers and
/// the `TOTAL:` footer
pub fn parse_long_listing(stdout: &str) -> Vec<ObjectMeta> {
    let mut objects: Vec<ObjectMeta> = stdout
        .lines()
        .filter_map(|line| {
            let line = line.trim();
            if line.is_empty() || line.starts_with("TOTAL:") {
                return None;
            }
            let mut fields = line.split_whitespace();
            let size = fields.next()?.parse::<u64>().ok()?;
            let uri = fields.last()?;
            if !uri.starts_with("gs://") || uri.ends_with('/') || uri.ends_with(':') {
                return None;
            }
            Some(ObjectMeta {
                uri: normalize_gs_uri(uri),
                size: Some(size),
            })
        })
        .collect();
    objects.sort_by(|a, b| a.uri.cmp(&b.uri));
    objects.dedup_by(|a, b| a.uri == b.uri);
    objects
}

impl ObjectStore for GsutilStore {
    fn name(&self) -> &'static str {
        "gsutil"
    }

    fn stat(&self, uri: &str) -> Result<Option<ObjectMeta>> {
        let out = self.run(&["stat", uri])?;
        if out.success {
            let size = parse_stat_size(&out.stdout_text());
            debug!("gsutil stat {} -> size {:?}", uri, size);
            return Ok(Some(ObjectMeta {
                uri: normalize_gs_uri(uri),
                size,
            }));
        }
        if is_no_match(&out.stderr) {
            return Ok(None);
        }
        Err(failure(&self.program, "stat", &out))
    }

    fn list(&self, pattern: &str) -> Result<Vec<ObjectMeta>> {
        let out = self.run(&["ls", "-l", "-r", pattern])?;
        if out.success {
            return Ok(parse_long_listing(&out.stdout_text()));
        }
        if is_no_match(&out.stderr) {
            return Ok(Vec::new());
        }
        Err(failure(&self.program, "ls", &out))
    }

    fn read(&self, uri: &str) -> Result<Vec<u8>> {
        let out = self.run(&["cat", uri])?;
        if out.success {
            return Ok(out.stdout);
        }
        Err(failure(&self.program, "cat", &out))
    }

    fn upload(&self, local: &Path, dest: &str) -> Result<()> {
        let local = local.to_string_lossy();
        let out = self.run(&["cp", local.as_ref(), dest])?;
        if out.success {
            return Ok(());
        }
        Err(ContractError::upload(
            dest,
            format!("exit code {}: {}", out.exit_code.unwrap_or(-1), out.stderr_line()),
        ))
    }
}

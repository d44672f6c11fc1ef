//! Reads simulation progress from the job's trajectory artifact.
//!
//! The artifact is JSON Lines written by the simulation engine, one frame per
//! line, each frame carrying at least `{"step": N}`.

use crate::error::JobError;
use crate::registry::JobRecord;
use serde_json::Value;
use std::fs;
use std::path::{Path, PathBuf};

/// Step reported for a job whose artifact does not exist yet.
pub const NOT_STARTED: i64 = -1;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Progress {
    NotStarted,
    AtStep { step: u64, artifact: PathBuf },
}

impl Progress {
    pub fn current_step(&self) -> i64 {
        match self {
            Progress::NotStarted => NOT_STARTED,
            Progress::AtStep { step, .. } => i64::try_from(*step).unwrap_or(i64::MAX),
        }
    }

    pub fn reached(&self, target: u64) -> bool {
        match self {
            Progress::NotStarted => false,
            Progress::AtStep { step, .. } => *step >= target,
        }
    }
}

pub fn read_progress(path: &Path) -> Result<Progress, JobError> {
    let raw = match fs::read_to_string(path) {
        Ok(raw) => raw,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Progress::NotStarted),
        Err(e) if e.kind() == std::io::ErrorKind::InvalidData => {
            return Err(corrupt(path, "artifact is not valid UTF-8"))
        }
        Err(source) => {
            return Err(JobError::Io {
                path: path.to_path_buf(),
                source,
            })
        }
    };
    let last = raw
        .lines()
        .rev()
        .find(|l| !l.trim().is_empty())
        .ok_or_else(|| corrupt(path, "artifact has no frames"))?;
    let frame: Value = serde_json::from_str(last.trim())
        .map_err(|e| corrupt(path, &format!("last frame is not valid JSON ({})", e)))?;
    let step = frame
        .get("step")
        .and_then(|v| v.as_u64())
        .ok_or_else(|| corrupt(path, "last frame has no non-negative integer 'step'"))?;
    Ok(Progress::AtStep {
        step,
        artifact: path.to_path_buf(),
    })
}

/// Current step of `job`, or [`NOT_STARTED`] when it has no artifact yet.
pub fn current_step(job: &JobRecord, artifact: &str) -> Result<i64, JobError> {
    read_progress(&job.path(artifact)).map(|p| p.current_step())
}

fn corrupt(path: &Path, reason: &str) -> JobError {
    JobError::CorruptArtifact {
        path: path.to_path_buf(),
        reason: reason.to_string(),
    }
}

use std::path::{Path, PathBuf};

use serde::Serialize;

/// Paths of an app's captured stdout/stderr.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LogPaths {
    pub out: PathBuf,
    pub err: PathBuf,
}

impl LogPaths {
    pub fn for_app(logs_dir: &Path, name: &str) -> Self {
        Self {
            out: logs_dir.join(format!("{}.out.log", name)),
            err: logs_dir.join(format!("{}.err.log", name)),
        }
    }
}

/// Tail of both log files.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LogTail {
    pub out: String,
    pub err: String,
    pub out_path: PathBuf,
    pub err_path: PathBuf,
}

/// Last `lines` lines of `path`; empty when the file does not exist.
pub async fn tail_lines(path: &Path, lines: usize) -> std::io::Result<String> {
    let content = match tokio::fs::read(path).await {
        Ok(bytes) => String::from_utf8_lossy(&bytes).into_owned(),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(String::new()),
        Err(e) => return Err(e),
    };
    let all: Vec<&str> = content.lines().collect();
    let start = all.len().saturating_sub(lines);
    Ok(all[start..].join("\n"))
}

pub async fn read_tail(paths: &LogPaths, lines: usize) -> std::io::Result<LogTail> {
    Ok(LogTail {
        out: tail_lines(&paths.out, lines).await?,
        err: tail_lines(&paths.err, lines).await?,
        out_path: paths.out.clone(),
        err_path: paths.err.clone(),
    })
}

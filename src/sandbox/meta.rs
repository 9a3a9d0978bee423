//! Isolate meta file parser
//!
//! Parses the `key:value` meta file isolate writes after each run.

/// Raw execution status from isolate
#[derive(Debug, Clone, PartialEq)]
pub enum IsolateStatus {
    /// Program exited with code 0
    Ok,
    /// Wall or CPU time limit exceeded
    TimeOut,
    /// Killed by signal
    Signal(i32),
    /// Non-zero exit
    RuntimeError,
    /// Internal error in isolate (sandbox setup failed)
    InternalError,
}

/// Parsed isolate meta file contents
#[derive(Debug, Clone)]
pub struct IsolateMeta {
    /// CPU time used in milliseconds
    pub time_ms: u32,
    /// Wall clock time in milliseconds
    pub wall_time_ms: u32,
    /// Memory used in KB (from cg-mem or max-rss)
    pub memory_kb: u32,
    /// Exit code of the process
    pub exit_code: i32,
    /// Isolate status
    pub status: IsolateStatus,
    /// Human readable explanation isolate attaches to non-OK runs
    pub message: Option<String>,
}

impl Default for IsolateMeta {
    fn default() -> Self {
        Self {
            time_ms: 0,
            wall_time_ms: 0,
            memory_kb: 0,
            exit_code: 0,
            status: IsolateStatus::Ok,
            message: None,
        }
    }
}

/// Parse isolate meta file content
pub fn parse_meta(content: &str) -> IsolateMeta {
    let mut meta = IsolateMeta::default();
    let mut status_str = "";
    let mut exit_sig = None;

    for line in content.lines() {
        let Some((key, value)) = line.split_once(':') else {
            continue;
        };
        let value = value.trim();

        match key.trim() {
            "time" => {
                if let Ok(t) = value.parse::<f64>() {
                    meta.time_ms = (t * 1000.0) as u32;
                }
            }
            "time-wall" => {
                if let Ok(t) = value.parse::<f64>() {
                    meta.wall_time_ms = (t * 1000.0) as u32;
                }
            }
            "cg-mem" | "max-rss" => {
                if let Ok(m) = value.parse::<u32>() {
                    meta.memory_kb = meta.memory_kb.max(m);
                }
            }
            "status" => status_str = value,
            "exitcode" => meta.exit_code = value.parse().unwrap_or(0),
            "exitsig" => exit_sig = value.parse::<i32>().ok(),
            "message" => meta.message = Some(value.to_string()),
            _ => {}
        }
    }

    meta.status = match (status_str, exit_sig) {
        ("TO", _) => IsolateStatus::TimeOut,
        ("XX", _) => IsolateStatus::InternalError,
        (_, Some(sig)) => IsolateStatus::Signal(sig),
        ("SG", None) => IsolateStatus::Signal(0),
        ("", None) if meta.exit_code == 0 => IsolateStatus::Ok,
        _ => IsolateStatus::RuntimeError,
    };

    meta
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_meta_success() {
        let content = "time:0.015\ntime-wall:0.020\ncg-mem:1024\nexitcode:0\n";
        let meta = parse_meta(content);

        assert_eq!(meta.time_ms, 15);
        assert_eq!(meta.wall_time_ms, 20);
        assert_eq!(meta.memory_kb, 1024);
        assert_eq!(meta.exit_code, 0);
        assert_eq!(meta.status, IsolateStatus::Ok);
    }

    #[test]
    fn test_parse_meta_timeout_wins_over_signal() {
        let content = "time:1.000\nstatus:TO\nexitsig:9\nmessage:Time limit exceeded (wall clock)\n";
        let meta = parse_meta(content);

        assert_eq!(meta.time_ms, 1000);
        assert_eq!(meta.status, IsolateStatus::TimeOut);
        assert_eq!(meta.message.as_deref(), Some("Time limit exceeded (wall clock)"));
    }

    #[test]
    fn test_parse_meta_signal() {
        let meta = parse_meta("status:SG\nexitsig:11\n");
        assert_eq!(meta.status, IsolateStatus::Signal(11));
    }

    #[test]
    fn test_parse_meta_nonzero_exit() {
        let meta = parse_meta("status:RE\nexitcode:1\n");
        assert_eq!(meta.status, IsolateStatus::RuntimeError);
        assert_eq!(meta.exit_code, 1);
    }

    #[test]
    fn test_parse_meta_internal_error() {
        let meta = parse_meta("status:XX\nmessage:execve(\"/usr/bin/nope\"): No such file\n");
        assert_eq!(meta.status, IsolateStatus::InternalError);
        assert!(meta.message.unwrap().contains("execve"));
    }
}

//! Read-only views of a live process under `/proc`.

use crate::config::types::{BinTraceError, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcInfo {
    pub pid: i32,
    pub command: String,
    pub cmdline: String,
    pub uid: u32,
    pub state: String,
    /// utime + stime, e.g. "12 ticks"
    pub cpu_time: String,
    pub memory_kb: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FileKind {
    Socket,
    Pipe,
    File,
    Other,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OpenFile {
    pub fd: String,
    pub target: String,
    #[serde(rename = "type")]
    pub kind: FileKind,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TcpConnection {
    pub local: String,
    pub remote: String,
    pub state: String,
}

fn proc_dir(pid: i32) -> PathBuf {
    PathBuf::from(format!("/proc/{}", pid))
}

fn read_proc(path: &Path) -> Result<String> {
    fs::read_to_string(path).map_err(|e| {
        BinTraceError::Io(std::io::Error::new(
            e.kind(),
            format!("error reading {}: {}", path.display(), e),
        ))
    })
}

/// `Key:\tvalue` lines of `/proc/<pid>/status`
pub fn parse_status(input: &str) -> HashMap<String, String> {
    input
        .lines()
        .filter_map(|line| line.split_once(':'))
        .map(|(key, value)| (key.trim().to_string(), value.trim().to_string()))
        .collect()
}

// First whitespace-separated field as a number, 0 when absent.
fn leading_number(value: Option<&String>) -> u64 {
    value
        .and_then(|v| v.split_whitespace().next())
        .and_then(|v| v.parse().ok())
        .unwrap_or(0)
}

/// utime + stime from `/proc/<pid>/stat`. The command name may contain
/// spaces, so fields are counted after its closing parenthesis.
pub fn parse_cpu_ticks(stat: &str) -> Option<u64> {
    let rest = &stat[stat.rfind(')')? + 1..];
    let fields: Vec<&str> = rest.split_whitespace().collect();
    // rest starts at field 3 (state); utime and stime are fields 14 and 15
    let utime: u64 = fields.get(11)?.parse().ok()?;
    let stime: u64 = fields.get(12)?.parse().ok()?;
    Some(utime + stime)
}

pub fn proc_info(pid: i32) -> Result<ProcInfo> {
    let base = proc_dir(pid);
    let status = parse_status(&read_proc(&base.join("status"))?);

    let cmdline_bytes = fs::read(base.join("cmdline"))?;
    let cmdline = String::from_utf8_lossy(&cmdline_bytes)
        .trim_end_matches('\0')
        .replace('\0', " ");

    let ticks = parse_cpu_ticks(&read_proc(&base.join("stat"))?).unwrap_or(0);

    Ok(ProcInfo {
        pid,
        command: status.get("Name").cloned().unwrap_or_default(),
        cmdline,
        uid: leading_number(status.get("Uid")) as u32,
        state: status.get("State").cloned().unwrap_or_default(),
        cpu_time: format!("{} ticks", ticks),
        memory_kb: leading_number(status.get("VmRSS")),
    })
}

pub fn classify_target(target: &str) -> FileKind {
    if target.starts_with("socket:") {
        FileKind::Socket
    } else if target.starts_with("pipe:") {
        FileKind::Pipe
    } else if target.starts_with('/') {
        FileKind::File
    } else {
        FileKind::Other
    }
}

pub fn open_files(pid: i32) -> Result<Vec<OpenFile>> {
    let fd_dir = proc_dir(pid).join("fd");
    let entries = fs::read_dir(&fd_dir).map_err(|e| {
        BinTraceError::Io(std::io::Error::new(
            e.kind(),
            format!("error reading file descriptor directory {}: {}", fd_dir.display(), e),
        ))
    })?;

    let mut files: Vec<OpenFile> = entries
        .flatten()
        .map(|entry| {
            let target = fs::read_link(entry.path())
                .map(|t| t.to_string_lossy().into_owned())
                .unwrap_or_else(|_| "unreadable".to_string());
            OpenFile {
                fd: entry.file_name().to_string_lossy().into_owned(),
                kind: classify_target(&target),
                target,
            }
        })
        .collect();
    files.sort_by_key(|f| f.fd.parse::<i64>().unwrap_or(i64::MAX));
    Ok(files)
}

/// Render a `/proc/net/tcp` address such as `0100007F:1F90` as `127.0.0.1:8080`.
pub fn parse_ip_port(hex: &str) -> String {
    let Some((ip_hex, port_hex)) = hex.split_once(':') else {
        return "?".to_string();
    };
    let port = u16::from_str_radix(port_hex, 16).unwrap_or(0);

    let ip = match (ip_hex.len(), u32::from_str_radix(ip_hex, 16)) {
        (8, Ok(raw)) => {
            let b = raw.to_le_bytes();
            format!("{}.{}.{}.{}", b[0], b[1], b[2], b[3])
        }
        // IPv6 is left in kernel hex form.
        (32, _) => ip_hex.to_string(),
        _ => "?".to_string(),
    };
    format!("{}:{}", ip, port)
}

pub fn tcp_state(hex: &str) -> &'static str {
    match hex.to_ascii_uppercase().as_str() {
        "01" => "ESTABLISHED",
        "02" => "SYN_SENT",
        "03" => "SYN_RECV",
        "04" => "FIN_WAIT1",
        "05" => "FIN_WAIT2",
        "06" => "TIME_WAIT",
        "07" => "CLOSE",
        "08" => "CLOSE_WAIT",
        "09" => "LAST_ACK",
        "0A" => "LISTEN",
        "0B" => "CLOSING",
        _ => "",
    }
}

/// Parse the body of `/proc/<pid>/net/tcp`, skipping the header row.
pub fn parse_tcp_table(table: &str) -> Vec<TcpConnection> {
    table
        .lines()
        .skip(1)
        .filter_map(|line| {
            let fields: Vec<&str> = line.split_whitespace().collect();
            if fields.len() < 4 {
                return None;
            }
            Some(TcpConnection {
                local: parse_ip_port(fields[1]),
                remote: parse_ip_port(fields[2]),
                state: tcp_state(fields[3]).to_string(),
            })
        })
        .collect()
}

pub fn tcp_connections(pid: i32) -> Result<Vec<TcpConnection>> {
    let table = read_proc(&proc_dir(pid).join("net").join("tcp"))?;
    Ok(parse_tcp_table(&table))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_status_fields() {
        let status = parse_status("Name:\tsleep\nState:\tS (sleeping)\nUid:\t1000\t1000\t1000\t1000\nVmRSS:\t  1024 kB\n");
        assert_eq!(status["Name"], "sleep");
        assert_eq!(status["State"], "S (sleeping)");
        assert_eq!(leading_number(status.get("Uid")), 1000);
        assert_eq!(leading_number(status.get("VmRSS")), 1024);
        assert_eq!(leading_number(status.get("Missing")), 0);
    }

    #[test]
    fn test_cpu_ticks_with_spaces_in_name() {
        let stat = "42 (my prog) S 1 42 42 0 -1 4194560 100 0 0 0 7 3 0 0 20 0 1 0 100 1000 10";
        assert_eq!(parse_cpu_ticks(stat), Some(10));
        assert_eq!(parse_cpu_ticks("garbage"), None);
    }

    #[test]
    fn test_ip_port_and_state() {
        assert_eq!(parse_ip_port("0100007F:1F90"), "127.0.0.1:8080");
        assert_eq!(parse_ip_port("00000000:0016"), "0.0.0.0:22");
        assert_eq!(parse_ip_port("bogus"), "?");
        assert_eq!(tcp_state("0a"), "LISTEN");
        assert_eq!(tcp_state("FF"), "");
    }

    #[test]
    fn test_parse_tcp_table() {
        let table = "  sl  local_address rem_address   st tx_queue rx_queue\n   0: 0100007F:1F90 00000000:0000 0A 00000000:00000000\n";
        let connections = parse_tcp_table(table);
        assert_eq!(
            connections,
            vec![TcpConnection {
                local: "127.0.0.1:8080".to_string(),
                remote: "0.0.0.0:0".to_string(),
                state: "LISTEN".to_string(),
            }]
        );
    }

    #[test]
    fn test_classify_target() {
        assert_eq!(classify_target("socket:[123]"), FileKind::Socket);
        assert_eq!(classify_target("pipe:[9]"), FileKind::Pipe);
        assert_eq!(classify_target("/dev/null"), FileKind::File);
        assert_eq!(classify_target("anon_inode:[eventfd]"), FileKind::Other);
    }

    #[test]
    fn test_inspect_self() {
        let pid = std::process::id() as i32;
        let info = proc_info(pid).unwrap();
        assert_eq!(info.pid, pid);
        assert!(!info.command.is_empty());
        assert!(info.cpu_time.ends_with(" ticks"));

        let files = open_files(pid).unwrap();
        assert!(files.iter().any(|f| f.fd == "0"));
        assert!(tcp_connections(pid).is_ok());
    }

    #[test]
    fn test_missing_pid_is_error() {
        assert!(proc_info(i32::MAX).is_err());
    }
}

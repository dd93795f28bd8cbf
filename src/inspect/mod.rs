//! Live process inspection

pub mod procfs;

pub use procfs::{open_files, proc_info, tcp_connections, FileKind, OpenFile, ProcInfo, TcpConnection};

//! Line protocol between the tracing helper and the executor.
//!
//! ```text
//! Running as unit: bintrace-<id>.scope; invocation ID: <uuid>
//! 1 0x1 0x402000 0x3 0x0 0x0 0x0
//! 1 = 3
//! ```
//!
//! An entry frame is the syscall number followed by the raw argument
//! registers in hex. An exit frame is the number, `=`, and the signed
//! return value. Only the first non-blank line may be a status line.

use crate::trace::types::{EventKind, SyscallArg, SyscallEvent, ARG_REGISTERS};
use crate::trace::EventSink;
use chrono::{DateTime, Utc};
use std::io::{self, Write};

const STATUS_PREFIX: &str = "Running as unit: ";
const INVOCATION_MARKER: &str = "; invocation ID: ";

/// Correlation ids emitted by the resource-governing wrapper
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusLine {
    pub sandbox_group: String,
    pub invocation_id: String,
}

/// One decoded protocol line
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Entry { number: u64, args: Vec<SyscallArg> },
    Exit { number: u64, ret: i64 },
}

pub fn format_status_line(sandbox_group: &str, invocation_id: &str) -> String {
    format!("{STATUS_PREFIX}{sandbox_group}{INVOCATION_MARKER}{invocation_id}")
}

pub fn parse_status_line(line: &str) -> Option<StatusLine> {
    let rest = line.trim().strip_prefix(STATUS_PREFIX)?;
    let (group, invocation) = rest.split_once(INVOCATION_MARKER)?;
    let group = group.trim();
    let invocation = invocation.trim();
    if group.is_empty() || invocation.is_empty() {
        return None;
    }
    Some(StatusLine {
        sandbox_group: group.to_string(),
        invocation_id: invocation.to_string(),
    })
}

pub fn encode_entry(number: u64, registers: &[u64]) -> String {
    let mut line = number.to_string();
    for value in registers {
        line.push_str(&format!(" 0x{value:x}"));
    }
    line
}

pub fn encode_exit(number: u64, ret: i64) -> String {
    format!("{number} = {ret}")
}

/// Render an event as a frame. Decoded arguments fall back to their pointer.
pub fn encode_event(event: &SyscallEvent) -> String {
    match event.event {
        EventKind::Entry => {
            let registers: Vec<u64> = event
                .args
                .iter()
                .filter_map(SyscallArg::raw_value)
                .collect();
            encode_entry(event.number, &registers)
        }
        EventKind::Exit => encode_exit(event.number, event.ret.unwrap_or_default()),
    }
}

fn parse_token(token: &str) -> Option<u64> {
    match token.strip_prefix("0x").or_else(|| token.strip_prefix("0X")) {
        Some(hex) => u64::from_str_radix(hex, 16).ok(),
        None => token.parse().ok(),
    }
}

/// Parse one frame; `None` for blank or malformed lines.
pub fn parse_frame(line: &str) -> Option<Frame> {
    let mut tokens = line.split_whitespace();
    let number: u64 = tokens.next()?.parse().ok()?;
    let rest: Vec<&str> = tokens.collect();

    if rest.first() == Some(&"=") {
        if rest.len() != 2 {
            return None;
        }
        let ret = rest[1].parse().ok()?;
        return Some(Frame::Exit { number, ret });
    }

    let args = rest
        .iter()
        .enumerate()
        .map(|(index, token)| match (ARG_REGISTERS.get(index), parse_token(token)) {
            (Some(register), Some(value)) => SyscallArg::Raw {
                register: *register,
                value,
            },
            _ => SyscallArg::Token {
                value: (*token).to_string(),
            },
        })
        .collect();
    Some(Frame::Entry { number, args })
}

/// Everything recovered from one helper transcript
#[derive(Debug, Default, Clone, PartialEq)]
pub struct ParsedTranscript {
    pub status: Option<StatusLine>,
    pub events: Vec<SyscallEvent>,
    pub skipped_lines: usize,
}

/// Turns timestamped helper lines into events attributed to `pid`.
#[derive(Debug)]
pub struct FrameParser {
    pid: i32,
    seen_content: bool,
    transcript: ParsedTranscript,
}

impl FrameParser {
    pub fn new(pid: i32) -> Self {
        Self {
            pid,
            seen_content: false,
            transcript: ParsedTranscript::default(),
        }
    }

    pub fn feed(&mut self, line: &str, timestamp: DateTime<Utc>) {
        if line.trim().is_empty() {
            return;
        }

        let first = !self.seen_content;
        self.seen_content = true;
        if first {
            if let Some(status) = parse_status_line(line) {
                self.transcript.status = Some(status);
                return;
            }
        }

        match parse_frame(line) {
            Some(Frame::Entry { number, args }) => {
                self.transcript
                    .events
                    .push(SyscallEvent::entry(self.pid, number, args, timestamp));
            }
            Some(Frame::Exit { number, ret }) => {
                self.transcript
                    .events
                    .push(SyscallEvent::exit(self.pid, number, ret, timestamp));
            }
            None => {
                log::debug!("skipping malformed trace line: {:?}", line);
                self.transcript.skipped_lines += 1;
            }
        }
    }

    pub fn finish(self) -> ParsedTranscript {
        self.transcript
    }
}

pub fn parse_transcript<'a, I>(lines: I, pid: i32) -> ParsedTranscript
where
    I: IntoIterator<Item = &'a (String, DateTime<Utc>)>,
{
    let mut parser = FrameParser::new(pid);
    for (line, timestamp) in lines {
        parser.feed(line, *timestamp);
    }
    parser.finish()
}

/// Sink that writes each event as a protocol frame.
pub struct LineSink<W: Write> {
    writer: W,
    written: u64,
}

impl<W: Write> LineSink<W> {
    pub fn new(writer: W) -> Self {
        Self { writer, written: 0 }
    }

    pub fn written(&self) -> u64 {
        self.written
    }

    pub fn into_inner(self) -> W {
        self.writer
    }
}

impl<W: Write> EventSink for LineSink<W> {
    fn record(&mut self, event: SyscallEvent) -> io::Result<()> {
        writeln!(self.writer, "{}", encode_event(&event))?;
        // The reader timestamps on arrival.
        self.writer.flush()?;
        self.written += 1;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn stamped(lines: &[&str]) -> Vec<(String, DateTime<Utc>)> {
        lines.iter().map(|l| (l.to_string(), Utc::now())).collect()
    }

    #[test]
    fn test_status_line_round_trip() {
        let line = format_status_line("bintrace-abc.scope", "1234-5678");
        assert_eq!(
            parse_status_line(&line),
            Some(StatusLine {
                sandbox_group: "bintrace-abc.scope".to_string(),
                invocation_id: "1234-5678".to_string(),
            })
        );
        assert_eq!(parse_status_line("Running as unit: ; invocation ID: x"), None);
        assert_eq!(parse_status_line("1 0x0"), None);
    }

    #[test]
    fn test_entry_frame_tokens() {
        let frame = parse_frame("59 0x4000 0x5000 0x0 zz").unwrap();
        let Frame::Entry { number, args } = frame else {
            panic!("expected entry frame");
        };
        assert_eq!(number, 59);
        assert_eq!(args.len(), 4);
        assert_eq!(args[0].raw_value(), Some(0x4000));
        assert_eq!(
            args[3],
            SyscallArg::Token {
                value: "zz".to_string()
            }
        );
    }

    #[test]
    fn test_exit_frame() {
        assert_eq!(
            parse_frame("0 = -14"),
            Some(Frame::Exit { number: 0, ret: -14 })
        );
        assert_eq!(parse_frame("0 = "), None);
        assert_eq!(parse_frame("0 = 1 2"), None);
        assert_eq!(parse_frame("read 0x1"), None);
    }

    #[test]
    fn test_transcript_with_status_and_noise() {
        let lines = stamped(&[
            "",
            "Running as unit: bintrace-x.scope; invocation ID: inv-1",
            "1 0x1 0x402000 0x3 0x0 0x0 0x0",
            "   ",
            "garbage line",
            "1 = 3",
            "Running as unit: late.scope; invocation ID: inv-2",
        ]);
        let parsed = parse_transcript(&lines, 42);

        let status = parsed.status.unwrap();
        assert_eq!(status.sandbox_group, "bintrace-x.scope");
        assert_eq!(status.invocation_id, "inv-1");
        assert_eq!(parsed.events.len(), 2);
        assert_eq!(parsed.events[0].name, "write");
        assert!(parsed.events[0].is_entry());
        assert_eq!(parsed.events[1].ret, Some(3));
        assert!(parsed.events.iter().all(|e| e.pid == 42));
        assert_eq!(parsed.skipped_lines, 2);
    }

    #[test]
    fn test_transcript_without_status() {
        let parsed = parse_transcript(&stamped(&["60 0x7"]), 9);
        assert!(parsed.status.is_none());
        assert_eq!(parsed.events[0].name, "exit");
    }

    #[test]
    fn test_line_sink_writes_frames() {
        let mut sink = LineSink::new(Vec::new());
        let args = crate::trace::decode::decode_args(
            "write",
            [1, 0x402000, 3, 0, 0, 0],
            &crate::kernel::memory::FakeMemory::new(),
            &Default::default(),
        );
        sink.record(SyscallEvent::entry(5, 1, args, Utc::now())).unwrap();
        sink.record(SyscallEvent::exit(5, 1, 3, Utc::now())).unwrap();
        assert_eq!(sink.written(), 2);

        let text = String::from_utf8(sink.into_inner()).unwrap();
        assert_eq!(text, "1 0x1 0x402000 0x3 0x0 0x0 0x0\n1 = 3\n");
    }

    proptest! {
        #[test]
        fn parse_frame_never_panics(line in ".{0,200}") {
            let _ = parse_frame(&line);
            let _ = parse_status_line(&line);
        }

        #[test]
        fn entry_frames_parse_back(number in 0u64..500, regs in proptest::collection::vec(any::<u64>(), 6)) {
            let line = encode_entry(number, &regs);
            let Some(Frame::Entry { number: parsed, args }) = parse_frame(&line) else {
                panic!("entry frame did not parse: {line}");
            };
            prop_assert_eq!(parsed, number);
            let values: Vec<u64> = args.iter().filter_map(SyscallArg::raw_value).collect();
            prop_assert_eq!(values, regs);
        }
    }
}

//! Static structural analysis of ELF binaries.
//!
//! Parsing is pure: the same bytes always produce the same [`BinaryInfo`] and
//! the binary is never executed. Only a byte stream that cannot be read as
//! ELF at all is an error; symbols, dependencies and notes degrade to empty.

use crate::binary::names;
use crate::binary::validate::{validate_binary, ELF_MAGIC};
use crate::config::types::{BinTraceError, Result};
use goblin::elf::Elf;
use serde::{Deserialize, Serialize};

const EI_CLASS: usize = 4;
const EI_DATA: usize = 5;
const EI_VERSION: usize = 6;
const EI_OSABI: usize = 7;
const EI_ABIVERSION: usize = 8;

const ET_DYN: u16 = 3;
const PT_INTERP: u32 = 3;
const PT_GNU_STACK: u32 = 0x6474_e551;
const PT_GNU_RELRO: u32 = 0x6474_e552;
const PF_X: u32 = 0x1;
const DF_BIND_NOW: u64 = 0x8;
const DF_1_NOW: u64 = 0x1;

/// One entry of the section header table
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SectionInfo {
    pub name: String,
    #[serde(rename = "type")]
    pub section_type: String,
    pub flags: String,
    pub addr: u64,
    pub offset: u64,
    pub size: u64,
    pub entsize: u64,
    pub addralign: u64,
}

/// One entry of the program header table
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SegmentInfo {
    #[serde(rename = "type")]
    pub segment_type: String,
    pub flags: String,
    pub vaddr: u64,
    pub paddr: u64,
    pub filesz: u64,
    pub memsz: u64,
    pub align: u64,
}

/// Descriptive record of an ELF binary's structure
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BinaryInfo {
    pub format: String,
    pub class: String,
    pub data: String,
    pub version: u8,
    pub osabi: String,
    pub abi_version: u8,
    #[serde(rename = "type")]
    pub object_type: String,
    pub machine: String,
    pub entry_point: u64,
    pub sections: Vec<SectionInfo>,
    pub segments: Vec<SegmentInfo>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub symbols: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub dynamic_needed: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub security_notes: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub interpreter: Option<String>,
}

/// Validate `bytes` and analyze them.
pub fn analyze_binary(bytes: &[u8], max_size: Option<u64>) -> Result<BinaryInfo> {
    validate_binary(bytes, max_size)?;
    analyze(bytes)
}

/// Parse `bytes` into a [`BinaryInfo`] without running admission checks.
pub fn analyze(bytes: &[u8]) -> Result<BinaryInfo> {
    if bytes.len() < ELF_MAGIC.len() || bytes[..4] != ELF_MAGIC {
        return Err(BinTraceError::Parse("missing ELF magic".to_string()));
    }

    let elf = Elf::parse(bytes).map_err(|e| BinTraceError::Parse(e.to_string()))?;
    let ident = &elf.header.e_ident;

    let sections = collect_sections(&elf);
    let segments = collect_segments(&elf);
    let symbols = collect_symbols(&elf);
    let security_notes = security_notes(&elf, &sections, &symbols);

    Ok(BinaryInfo {
        format: "ELF".to_string(),
        class: names::class_name(ident[EI_CLASS]),
        data: names::data_name(ident[EI_DATA]),
        version: ident[EI_VERSION],
        osabi: names::osabi_name(ident[EI_OSABI]),
        abi_version: ident[EI_ABIVERSION],
        object_type: names::object_type_name(elf.header.e_type),
        machine: names::machine_name(elf.header.e_machine),
        entry_point: elf.header.e_entry,
        sections,
        segments,
        symbols,
        dynamic_needed: elf.libraries.iter().map(|lib| lib.to_string()).collect(),
        security_notes,
        interpreter: elf.interpreter.map(str::to_string),
    })
}

fn collect_sections(elf: &Elf<'_>) -> Vec<SectionInfo> {
    elf.section_headers
        .iter()
        .map(|sh| SectionInfo {
            name: elf
                .shdr_strtab
                .get_at(sh.sh_name)
                .unwrap_or_default()
                .to_string(),
            section_type: names::section_type_name(sh.sh_type),
            flags: names::section_flags_name(sh.sh_flags),
            addr: sh.sh_addr,
            offset: sh.sh_offset,
            size: sh.sh_size,
            entsize: sh.sh_entsize,
            addralign: sh.sh_addralign,
        })
        .collect()
}

fn collect_segments(elf: &Elf<'_>) -> Vec<SegmentInfo> {
    elf.program_headers
        .iter()
        .map(|ph| SegmentInfo {
            segment_type: names::segment_type_name(ph.p_type),
            flags: names::segment_flags_name(ph.p_flags),
            vaddr: ph.p_vaddr,
            paddr: ph.p_paddr,
            filesz: ph.p_filesz,
            memsz: ph.p_memsz,
            align: ph.p_align,
        })
        .collect()
}

// .symtab only; stripped binaries simply have none. Entry 0 is the null symbol.
fn collect_symbols(elf: &Elf<'_>) -> Vec<String> {
    elf.syms
        .iter()
        .skip(1)
        .filter_map(|sym| elf.strtab.get_at(sym.st_name))
        .filter(|name| !name.is_empty())
        .map(str::to_string)
        .collect()
}

fn security_notes(elf: &Elf<'_>, sections: &[SectionInfo], symbols: &[String]) -> Vec<String> {
    let mut notes = Vec::new();

    for section in sections {
        match section.name.as_str() {
            ".note.gnu.property" => notes.push("GNU property present".to_string()),
            ".note.gnu.build-id" => notes.push("Build ID present".to_string()),
            ".got.plt" => notes.push("GOT/PLT present (dynamic linking)".to_string()),
            _ => {}
        }
    }

    if let Some(stack) = elf.program_headers.iter().find(|ph| ph.p_type == PT_GNU_STACK) {
        if stack.p_flags & PF_X != 0 {
            notes.push("Executable stack".to_string());
        } else {
            notes.push("NX stack".to_string());
        }
    }

    if elf.program_headers.iter().any(|ph| ph.p_type == PT_GNU_RELRO) {
        let bind_now = elf
            .dynamic
            .as_ref()
            .map(|dynamic| {
                dynamic.info.flags & DF_BIND_NOW != 0 || dynamic.info.flags_1 & DF_1_NOW != 0
            })
            .unwrap_or(false);
        if bind_now {
            notes.push("Full RELRO".to_string());
        } else {
            notes.push("RELRO present".to_string());
        }
    }

    let has_interp = elf.program_headers.iter().any(|ph| ph.p_type == PT_INTERP);
    if elf.header.e_type == ET_DYN && has_interp {
        notes.push("PIE".to_string());
    }

    if symbols.iter().any(|s| s == "__stack_chk_fail") {
        notes.push("Stack canary".to_string());
    }

    notes
}

#[cfg(test)]
mod tests {
    use super::*;

    fn own_executable() -> Vec<u8> {
        std::fs::read(std::env::current_exe().unwrap()).unwrap()
    }

    #[test]
    fn test_missing_magic_is_parse_error() {
        let err = analyze(b"MZ\x90\x00not elf").unwrap_err();
        assert!(matches!(err, BinTraceError::Parse(_)));
    }

    #[test]
    fn test_analyze_binary_rejects_before_parsing() {
        let err = analyze_binary(b"ab", None).unwrap_err();
        assert!(matches!(err, BinTraceError::Validation(_)));
    }

    #[test]
    fn test_own_executable_structure() {
        let info = analyze(&own_executable()).unwrap();
        assert_eq!(info.format, "ELF");
        assert_eq!(info.class, "ELF64");
        assert_eq!(info.data, "LittleEndian");
        assert_eq!(info.machine, "EM_X86_64");
        assert_ne!(info.entry_point, 0);
        assert!(!info.sections.is_empty());
        assert!(info.sections.iter().any(|s| s.name == ".text"));
        assert!(info.segments.iter().any(|s| s.segment_type == "PT_LOAD"));
    }

    #[test]
    fn test_analysis_is_deterministic() {
        let bytes = own_executable();
        assert_eq!(analyze(&bytes).unwrap(), analyze(&bytes).unwrap());
    }

    #[test]
    fn test_json_field_names() {
        let info = analyze(&own_executable()).unwrap();
        let value = serde_json::to_value(&info).unwrap();
        assert!(value.get("type").is_some());
        assert!(value.get("entry_point").is_some());
        assert!(value["sections"][0].get("type").is_some());
    }
}

//! Symbolic names for ELF header, section and segment constants.
//!
//! Unknown values render as the prefix plus the hex value (`EM_0x1234`) so
//! that output stays stable for exotic or corrupted inputs.

const OSABI: &[(u64, &str)] = &[
    (0, "ELFOSABI_NONE"),
    (1, "ELFOSABI_HPUX"),
    (2, "ELFOSABI_NETBSD"),
    (3, "ELFOSABI_LINUX"),
    (4, "ELFOSABI_HURD"),
    (5, "ELFOSABI_86OPEN"),
    (6, "ELFOSABI_SOLARIS"),
    (7, "ELFOSABI_AIX"),
    (8, "ELFOSABI_IRIX"),
    (9, "ELFOSABI_FREEBSD"),
    (10, "ELFOSABI_TRU64"),
    (11, "ELFOSABI_MODESTO"),
    (12, "ELFOSABI_OPENBSD"),
    (13, "ELFOSABI_OPENVMS"),
    (14, "ELFOSABI_NSK"),
    (15, "ELFOSABI_AROS"),
    (16, "ELFOSABI_FENIXOS"),
    (17, "ELFOSABI_CLOUDABI"),
    (97, "ELFOSABI_ARM"),
    (255, "ELFOSABI_STANDALONE"),
];

const OBJECT_TYPES: &[(u64, &str)] = &[
    (0, "ET_NONE"),
    (1, "ET_REL"),
    (2, "ET_EXEC"),
    (3, "ET_DYN"),
    (4, "ET_CORE"),
];

const MACHINES: &[(u64, &str)] = &[
    (0, "EM_NONE"),
    (2, "EM_SPARC"),
    (3, "EM_386"),
    (4, "EM_68K"),
    (8, "EM_MIPS"),
    (20, "EM_PPC"),
    (21, "EM_PPC64"),
    (22, "EM_S390"),
    (40, "EM_ARM"),
    (43, "EM_SPARCV9"),
    (50, "EM_IA_64"),
    (62, "EM_X86_64"),
    (183, "EM_AARCH64"),
    (243, "EM_RISCV"),
    (247, "EM_BPF"),
    (258, "EM_LOONGARCH"),
];

const SECTION_TYPES: &[(u64, &str)] = &[
    (0, "SHT_NULL"),
    (1, "SHT_PROGBITS"),
    (2, "SHT_SYMTAB"),
    (3, "SHT_STRTAB"),
    (4, "SHT_RELA"),
    (5, "SHT_HASH"),
    (6, "SHT_DYNAMIC"),
    (7, "SHT_NOTE"),
    (8, "SHT_NOBITS"),
    (9, "SHT_REL"),
    (10, "SHT_SHLIB"),
    (11, "SHT_DYNSYM"),
    (14, "SHT_INIT_ARRAY"),
    (15, "SHT_FINI_ARRAY"),
    (16, "SHT_PREINIT_ARRAY"),
    (17, "SHT_GROUP"),
    (18, "SHT_SYMTAB_SHNDX"),
    (0x6fff_fff5, "SHT_GNU_ATTRIBUTES"),
    (0x6fff_fff6, "SHT_GNU_HASH"),
    (0x6fff_fff7, "SHT_GNU_LIBLIST"),
    (0x6fff_fffd, "SHT_GNU_VERDEF"),
    (0x6fff_fffe, "SHT_GNU_VERNEED"),
    (0x6fff_ffff, "SHT_GNU_VERSYM"),
];

const SECTION_FLAGS: &[(u64, &str)] = &[
    (0x1, "SHF_WRITE"),
    (0x2, "SHF_ALLOC"),
    (0x4, "SHF_EXECINSTR"),
    (0x10, "SHF_MERGE"),
    (0x20, "SHF_STRINGS"),
    (0x40, "SHF_INFO_LINK"),
    (0x80, "SHF_LINK_ORDER"),
    (0x100, "SHF_OS_NONCONFORMING"),
    (0x200, "SHF_GROUP"),
    (0x400, "SHF_TLS"),
    (0x800, "SHF_COMPRESSED"),
];

const SEGMENT_TYPES: &[(u64, &str)] = &[
    (0, "PT_NULL"),
    (1, "PT_LOAD"),
    (2, "PT_DYNAMIC"),
    (3, "PT_INTERP"),
    (4, "PT_NOTE"),
    (5, "PT_SHLIB"),
    (6, "PT_PHDR"),
    (7, "PT_TLS"),
    (0x6474_e550, "PT_GNU_EH_FRAME"),
    (0x6474_e551, "PT_GNU_STACK"),
    (0x6474_e552, "PT_GNU_RELRO"),
    (0x6474_e553, "PT_GNU_PROPERTY"),
];

const SEGMENT_FLAGS: &[(u64, &str)] = &[(0x1, "PF_X"), (0x2, "PF_W"), (0x4, "PF_R")];

fn lookup(table: &[(u64, &str)], value: u64, prefix: &str) -> String {
    table
        .iter()
        .find(|(v, _)| *v == value)
        .map(|(_, name)| (*name).to_string())
        .unwrap_or_else(|| format!("{}0x{:x}", prefix, value))
}

fn flag_names(table: &[(u64, &str)], value: u64) -> String {
    let mut names = Vec::new();
    let mut rest = value;
    for (bit, name) in table {
        if value & bit != 0 {
            names.push((*name).to_string());
            rest &= !bit;
        }
    }
    if rest != 0 || names.is_empty() {
        names.push(format!("0x{:x}", rest));
    }
    names.join("+")
}

pub fn class_name(class: u8) -> String {
    match class {
        1 => "ELF32".to_string(),
        2 => "ELF64".to_string(),
        other => format!("ELFCLASS{}", other),
    }
}

pub fn data_name(data: u8) -> String {
    match data {
        1 => "LittleEndian".to_string(),
        2 => "BigEndian".to_string(),
        other => format!("ELFDATA{}", other),
    }
}

pub fn osabi_name(osabi: u8) -> String {
    lookup(OSABI, osabi as u64, "ELFOSABI_")
}

pub fn object_type_name(e_type: u16) -> String {
    lookup(OBJECT_TYPES, e_type as u64, "ET_")
}

pub fn machine_name(machine: u16) -> String {
    lookup(MACHINES, machine as u64, "EM_")
}

pub fn section_type_name(sh_type: u32) -> String {
    lookup(SECTION_TYPES, sh_type as u64, "SHT_")
}

pub fn section_flags_name(sh_flags: u64) -> String {
    flag_names(SECTION_FLAGS, sh_flags)
}

pub fn segment_type_name(p_type: u32) -> String {
    lookup(SEGMENT_TYPES, p_type as u64, "PT_")
}

pub fn segment_flags_name(p_flags: u32) -> String {
    flag_names(SEGMENT_FLAGS, p_flags as u64)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_known_names() {
        assert_eq!(class_name(2), "ELF64");
        assert_eq!(data_name(1), "LittleEndian");
        assert_eq!(object_type_name(3), "ET_DYN");
        assert_eq!(machine_name(62), "EM_X86_64");
        assert_eq!(section_type_name(8), "SHT_NOBITS");
        assert_eq!(segment_type_name(0x6474_e551), "PT_GNU_STACK");
    }

    #[test]
    fn test_unknown_values_fall_back_to_hex() {
        assert_eq!(machine_name(0x1234), "EM_0x1234");
        assert_eq!(osabi_name(200), "ELFOSABI_0xc8");
    }

    #[test]
    fn test_flag_combinations() {
        assert_eq!(section_flags_name(0x6), "SHF_ALLOC+SHF_EXECINSTR");
        assert_eq!(segment_flags_name(0x5), "PF_X+PF_R");
        assert_eq!(segment_flags_name(0), "0x0");
        assert_eq!(section_flags_name(0x2 | 0x8000_0000), "SHF_ALLOC+0x80000000");
    }
}

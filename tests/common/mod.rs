//! Minimal static x86_64 executables assembled in memory.
//!
//! Layout: ELF header (64 bytes), one PT_LOAD program header (56 bytes),
//! then the code. The whole file is mapped R+X at `BASE`.

#![allow(dead_code)]

pub const BASE: u64 = 0x400000;
pub const CODE_OFFSET: u64 = 64 + 56;
pub const ENTRY: u64 = BASE + CODE_OFFSET;

pub fn build_elf(code: &[u8]) -> Vec<u8> {
    let total = CODE_OFFSET + code.len() as u64;
    let mut out = Vec::with_capacity(total as usize);

    // e_ident
    out.extend_from_slice(&[0x7f, b'E', b'L', b'F', 2, 1, 1, 0]);
    out.extend_from_slice(&[0; 8]);
    out.extend_from_slice(&2u16.to_le_bytes()); // ET_EXEC
    out.extend_from_slice(&62u16.to_le_bytes()); // EM_X86_64
    out.extend_from_slice(&1u32.to_le_bytes());
    out.extend_from_slice(&ENTRY.to_le_bytes());
    out.extend_from_slice(&64u64.to_le_bytes()); // e_phoff
    out.extend_from_slice(&0u64.to_le_bytes()); // e_shoff
    out.extend_from_slice(&0u32.to_le_bytes());
    out.extend_from_slice(&64u16.to_le_bytes());
    out.extend_from_slice(&56u16.to_le_bytes());
    out.extend_from_slice(&1u16.to_le_bytes());
    out.extend_from_slice(&64u16.to_le_bytes());
    out.extend_from_slice(&0u16.to_le_bytes());
    out.extend_from_slice(&0u16.to_le_bytes());

    // PT_LOAD, PF_R | PF_X
    out.extend_from_slice(&1u32.to_le_bytes());
    out.extend_from_slice(&5u32.to_le_bytes());
    out.extend_from_slice(&0u64.to_le_bytes());
    out.extend_from_slice(&BASE.to_le_bytes());
    out.extend_from_slice(&BASE.to_le_bytes());
    out.extend_from_slice(&total.to_le_bytes());
    out.extend_from_slice(&total.to_le_bytes());
    out.extend_from_slice(&0x1000u64.to_le_bytes());

    assert_eq!(out.len() as u64, CODE_OFFSET);
    out.extend_from_slice(code);
    out
}

/// write(1, "hi\n", 3); exit(0)
pub fn write_then_exit() -> Vec<u8> {
    let mut code = vec![
        0xb8, 0x01, 0x00, 0x00, 0x00, // mov eax, 1
        0xbf, 0x01, 0x00, 0x00, 0x00, // mov edi, 1
        0x48, 0x8d, 0x35, 0x10, 0x00, 0x00, 0x00, // lea rsi, [rip+0x10]
        0xba, 0x03, 0x00, 0x00, 0x00, // mov edx, 3
        0x0f, 0x05, // syscall
        0xb8, 0x3c, 0x00, 0x00, 0x00, // mov eax, 60
        0x31, 0xff, // xor edi, edi
        0x0f, 0x05, // syscall
    ];
    code.extend_from_slice(b"hi\n");
    build_elf(&code)
}

/// execve("/bin/true", ["/bin/true"], NULL); exit(1) if it returns
pub fn execve_true() -> Vec<u8> {
    let mut code = vec![
        0x48, 0x8d, 0x3d, 0x1b, 0x00, 0x00, 0x00, // lea rdi, [rip+0x1b]
        0x6a, 0x00, // push 0
        0x57, // push rdi
        0x48, 0x89, 0xe6, // mov rsi, rsp
        0x31, 0xd2, // xor edx, edx
        0xb8, 0x3b, 0x00, 0x00, 0x00, // mov eax, 59
        0x0f, 0x05, // syscall
        0xb8, 0x3c, 0x00, 0x00, 0x00, // mov eax, 60
        0xbf, 0x01, 0x00, 0x00, 0x00, // mov edi, 1
        0x0f, 0x05, // syscall
    ];
    code.extend_from_slice(b"/bin/true\0");
    build_elf(&code)
}

/// exit(code)
pub fn exit_with(status: u8) -> Vec<u8> {
    build_elf(&[
        0xb8, 0x3c, 0x00, 0x00, 0x00, // mov eax, 60
        0xbf, status, 0x00, 0x00, 0x00, // mov edi, status
        0x0f, 0x05, // syscall
    ])
}

/// fork(); exit(0) in both processes
pub fn fork_then_exit() -> Vec<u8> {
    build_elf(&[
        0xb8, 0x39, 0x00, 0x00, 0x00, // mov eax, 57
        0x0f, 0x05, // syscall
        0xb8, 0x3c, 0x00, 0x00, 0x00, // mov eax, 60
        0x31, 0xff, // xor edi, edi
        0x0f, 0x05, // syscall
    ])
}

/// nanosleep({seconds, 0}, NULL); exit(0)
pub fn sleep_for(seconds: u64) -> Vec<u8> {
    let mut code = vec![
        0x48, 0x8d, 0x3d, 0x12, 0x00, 0x00, 0x00, // lea rdi, [rip+0x12]
        0x31, 0xf6, // xor esi, esi
        0xb8, 0x23, 0x00, 0x00, 0x00, // mov eax, 35
        0x0f, 0x05, // syscall
        0xb8, 0x3c, 0x00, 0x00, 0x00, // mov eax, 60
        0x31, 0xff, // xor edi, edi
        0x0f, 0x05, // syscall
    ];
    code.extend_from_slice(&seconds.to_le_bytes());
    code.extend_from_slice(&0u64.to_le_bytes());
    build_elf(&code)
}

/// Whether this host lets us trace a child at all.
pub fn ptrace_available() -> bool {
    use bintrace::trace::{Tracer, TracerOptions};
    match Tracer::spawn(std::path::Path::new("/bin/true"), TracerOptions::default()) {
        Ok(tracer) => {
            let mut events = Vec::new();
            tracer.run(&mut events).is_ok()
        }
        Err(_) => false,
    }
}

pub fn sandbox_available() -> bool {
    bintrace::kernel::namespace::user_namespaces_available()
}

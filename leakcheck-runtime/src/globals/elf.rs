//! ELF program headers: writable `PT_LOAD` segments and static TLS size.

use crate::error::ModuleError;
use crate::frontier::AddressRange;

#[cfg(target_pointer_width = "64")]
pub(crate) type ProgramHeader = libc::Elf64_Phdr;
#[cfg(target_pointer_width = "32")]
pub(crate) type ProgramHeader = libc::Elf32_Phdr;

/// Writable loadable segments, relocated by the module's load bias.
pub(crate) fn writable_segments(
    headers: &[ProgramHeader],
    load_bias: usize,
) -> Result<impl Iterator<Item = AddressRange> + '_, ModuleError> {
    if headers.is_empty() {
        return Err(ModuleError::MissingHeader);
    }
    Ok(headers
        .iter()
        .filter(|ph| ph.p_type == libc::PT_LOAD && ph.p_flags & libc::PF_W != 0)
        .map(move |ph| {
            AddressRange::from_base_len(load_bias.wrapping_add(ph.p_vaddr as usize), ph.p_memsz as usize)
        })
        .filter(|range| !range.is_empty()))
}

/// Size of the module's `PT_TLS` block, rounded up to its alignment.
pub(crate) fn tls_block_size(headers: &[ProgramHeader]) -> usize {
    headers
        .iter()
        .filter(|ph| ph.p_type == libc::PT_TLS)
        .map(|ph| {
            let align = (ph.p_align as usize).max(1);
            (ph.p_memsz as usize).div_ceil(align) * align
        })
        .sum()
}

//! PE/COFF section table parsing for mapped images.
//!
//! Works on the in-memory image, so section addresses are RVAs from the
//! load base. Only the headers are read.

use crate::error::ModuleError;
use crate::frontier::AddressRange;

const DOS_HEADER_LEN: usize = 0x40;
const E_LFANEW_OFFSET: usize = 0x3c;
const FILE_HEADER_LEN: usize = 20;
const SECTION_HEADER_LEN: usize = 40;

const SCN_CNT_INITIALIZED_DATA: u32 = 0x0000_0040;
const SCN_CNT_UNINITIALIZED_DATA: u32 = 0x0000_0080;
const SCN_MEM_WRITE: u32 = 0x8000_0000;

/// Writable data sections of the image mapped at `base`.
///
/// A section qualifies if it is named `.data`, or if it is writable and
/// holds initialized or uninitialized data. Ranges are clipped to the
/// image.
pub(crate) fn writable_data_sections(
    image: &[u8],
    base: usize,
) -> Result<impl Iterator<Item = AddressRange> + '_, ModuleError> {
    if image.len() < DOS_HEADER_LEN {
        return Err(ModuleError::Truncated { offset: image.len() });
    }
    if &image[..2] != b"MZ" {
        return Err(ModuleError::BadSignature { what: "DOS" });
    }

    let nt = read_u32(image, E_LFANEW_OFFSET)? as usize;
    let file_header = nt + 4;
    if image.get(nt..file_header) != Some(&b"PE\0\0"[..]) {
        return match image.get(nt..file_header) {
            Some(_) => Err(ModuleError::BadSignature { what: "PE" }),
            None => Err(ModuleError::Truncated { offset: nt }),
        };
    }

    let num_sections = read_u16(image, file_header + 2)? as usize;
    let optional_len = read_u16(image, file_header + 16)? as usize;
    let table = file_header + FILE_HEADER_LEN + optional_len;
    let table_end = table + num_sections * SECTION_HEADER_LEN;
    if table_end > image.len() {
        return Err(ModuleError::Truncated { offset: image.len() });
    }

    let image_len = image.len();
    Ok(image[table..table_end]
        .chunks_exact(SECTION_HEADER_LEN)
        .filter(|section| is_writable_data(section))
        .map(move |section| {
            let size = u32_at(section, 8) as usize;
            let rva = u32_at(section, 12) as usize;
            let end = rva.saturating_add(size).min(image_len);
            AddressRange::new(base + rva.min(image_len), base + end)
        })
        .filter(|range| !range.is_empty()))
}

fn is_writable_data(section: &[u8]) -> bool {
    let name = &section[..8];
    if name.starts_with(b".data\0") {
        return true;
    }
    let flags = u32_at(section, 36);
    flags & SCN_MEM_WRITE != 0
        && flags & (SCN_CNT_INITIALIZED_DATA | SCN_CNT_UNINITIALIZED_DATA) != 0
}

fn u32_at(bytes: &[u8], offset: usize) -> u32 {
    u32::from_le_bytes([bytes[offset], bytes[offset + 1], bytes[offset + 2], bytes[offset + 3]])
}

fn read_u32(image: &[u8], offset: usize) -> Result<u32, ModuleError> {
    match image.get(offset..offset + 4) {
        Some(b) => Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]])),
        None => Err(ModuleError::Truncated { offset }),
    }
}

fn read_u16(image: &[u8], offset: usize) -> Result<u16, ModuleError> {
    match image.get(offset..offset + 2) {
        Some(b) => Ok(u16::from_le_bytes([b[0], b[1]])),
        None => Err(ModuleError::Truncated { offset }),
    }
}

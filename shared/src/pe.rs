//! Minimal PE/COFF section table reader.
//!
//! Only the DOS header, the PE (COFF file) header and the section table are read, each into a
//! bounded buffer that goblin then decodes. The input is untrusted, so all allocations are bounded
//! before they happen and nothing past the section table is loaded unless a section is requested.

use std::io::{self, Read, Seek, SeekFrom};

use goblin::pe::header::{
    CoffHeader, DOS_MAGIC, PE_MAGIC, PE_POINTER_OFFSET, SIZEOF_COFF_HEADER, SIZEOF_PE_MAGIC,
};
use goblin::pe::section_table::{SectionTable as SectionHeader, SIZEOF_SECTION_TABLE};
use log::debug;
use scroll::{Pread, LE};

/// Upper bound on the number of section headers we are willing to read.
///
/// Files declaring more sections than this are treated as if they were not PE files at all.
pub const MAX_SECTIONS: usize = 96;

/// Upper bound on the size of a section we read into memory.
pub const MAX_SECTION_SIZE: u32 = 16 * 1024;

/// Length of the fixed name field of a section header.
pub const SECTION_NAME_LEN: usize = 8;

const SIZEOF_DOS_MAGIC: usize = 2;
const SIZEOF_DOS_HEADER: usize = 64;
const SIZEOF_PE_HEADER: usize = SIZEOF_PE_MAGIC + SIZEOF_COFF_HEADER;

#[derive(Debug, thiserror::Error)]
pub enum PeError {
    #[error("File is smaller than DOS magic (got {got} of {expected} bytes)")]
    TruncatedDosMagic { got: usize, expected: usize },
    #[error("File is smaller than DOS header (got {got} of {expected} bytes)")]
    TruncatedDosHeader { got: usize, expected: usize },
    #[error("PE header read error (got {got} of {expected} bytes)")]
    TruncatedPeHeader { got: usize, expected: usize },
    #[error("PE section header read error (got {got} of {expected} bytes)")]
    TruncatedSectionTable { got: usize, expected: usize },
    #[error("PE section '{name}' too big ({size} bytes, at most {MAX_SECTION_SIZE} allowed)")]
    SectionTooBig { name: String, size: u32 },
    #[error("PE section '{name}' read error (got {got} of {expected} bytes)")]
    TruncatedSection {
        name: String,
        got: usize,
        expected: usize,
    },
    #[error("Malformed PE headers: {0}")]
    Malformed(#[from] goblin::error::Error),
    #[error("Malformed PE headers: {0}")]
    Decode(#[from] scroll::Error),
    #[error(transparent)]
    Io(#[from] io::Error),
}

/// Read at most `len` bytes. Hitting EOF early is not an error here, callers compare the length.
fn read_at_most<R: Read>(reader: &mut R, len: usize) -> io::Result<Vec<u8>> {
    let mut buf = Vec::with_capacity(len);
    reader.by_ref().take(len as u64).read_to_end(&mut buf)?;
    Ok(buf)
}

/// Pad a section name to the on-disk 8 byte representation.
///
/// Returns `None` for names that cannot fit, those never match any section.
pub fn section_name(name: &str) -> Option<[u8; SECTION_NAME_LEN]> {
    let bytes = name.as_bytes();
    if bytes.len() > SECTION_NAME_LEN {
        return None;
    }

    let mut padded = [0u8; SECTION_NAME_LEN];
    padded[..bytes.len()].copy_from_slice(bytes);
    Some(padded)
}

/// Decode one 40 byte section table record.
///
/// goblin resolves `/<offset>` long names through the COFF string table, which we never read.
/// Lookups only compare the raw name field, so that resolution is skipped.
fn parse_section_header(record: &[u8]) -> Result<SectionHeader, PeError> {
    let mut raw = [0u8; SIZEOF_SECTION_TABLE];
    raw.copy_from_slice(record);
    let first = raw[0];
    raw[0] = 0;

    let mut header = SectionHeader::parse(&raw, &mut 0, 0)?;
    header.name[0] = first;
    Ok(header)
}

/// Raw contents of a section.
///
/// The buffer always carries one extra trailing NUL byte so that it can be handed around as text
/// safely. That byte is not part of the section and is not counted by [`SectionData::len`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SectionData {
    buf: Vec<u8>,
}

impl SectionData {
    fn new(mut data: Vec<u8>) -> Self {
        data.push(0);
        Self { buf: data }
    }

    pub fn len(&self) -> usize {
        self.buf.len() - 1
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.buf[..self.len()]
    }

    pub fn as_bytes_with_nul(&self) -> &[u8] {
        &self.buf
    }

    /// Interpret the data as a C string: everything up to the first NUL byte, lossily converted
    /// to UTF-8.
    pub fn to_text(&self) -> std::borrow::Cow<'_, str> {
        let end = self
            .buf
            .iter()
            .position(|&b| b == 0)
            .unwrap_or(self.len());
        String::from_utf8_lossy(&self.buf[..end])
    }
}

/// The section table of a PE file, in on-disk order.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct SectionTable(Vec<SectionHeader>);

impl SectionTable {
    /// Parse the DOS and PE headers and read the section table.
    ///
    /// Returns `Ok(None)` when the stream does not look like a PE file: DOS or PE magic missing,
    /// or more than [`MAX_SECTIONS`] sections declared. Short reads of headers that must exist are
    /// errors.
    pub fn locate<R: Read + Seek>(reader: &mut R) -> Result<Option<Self>, PeError> {
        reader.seek(SeekFrom::Start(0))?;

        let dos = read_at_most(reader, SIZEOF_DOS_HEADER)?;
        if dos.len() < SIZEOF_DOS_MAGIC {
            return Err(PeError::TruncatedDosMagic {
                got: dos.len(),
                expected: SIZEOF_DOS_MAGIC,
            });
        }
        if dos.pread_with::<u16>(0, LE)? != DOS_MAGIC {
            debug!("No DOS magic, not a PE file.");
            return Ok(None);
        }
        if dos.len() != SIZEOF_DOS_HEADER {
            return Err(PeError::TruncatedDosHeader {
                got: dos.len(),
                expected: SIZEOF_DOS_HEADER,
            });
        }

        let pe_offset: u32 = dos.pread_with(PE_POINTER_OFFSET as usize, LE)?;
        reader.seek(SeekFrom::Start(u64::from(pe_offset)))?;

        let pe = read_at_most(reader, SIZEOF_PE_HEADER)?;
        if pe.len() != SIZEOF_PE_HEADER {
            return Err(PeError::TruncatedPeHeader {
                got: pe.len(),
                expected: SIZEOF_PE_HEADER,
            });
        }
        if pe.pread_with::<u32>(0, LE)? != PE_MAGIC {
            debug!("No PE magic at offset {pe_offset:#x}, not a PE file.");
            return Ok(None);
        }

        let mut offset = SIZEOF_PE_MAGIC;
        let coff = CoffHeader::parse(&pe, &mut offset)?;
        let section_count = usize::from(coff.number_of_sections);

        let table_offset = u64::from(pe_offset)
            + SIZEOF_PE_HEADER as u64
            + u64::from(coff.size_of_optional_header);
        reader.seek(SeekFrom::Start(table_offset))?;

        if section_count > MAX_SECTIONS {
            debug!("PE file declares {section_count} sections, more than {MAX_SECTIONS}. Ignoring its sections.");
            return Ok(None);
        }

        let expected = section_count * SIZEOF_SECTION_TABLE;
        let table = read_at_most(reader, expected)?;
        if table.len() != expected {
            return Err(PeError::TruncatedSectionTable {
                got: table.len(),
                expected,
            });
        }

        let sections = table
            .chunks_exact(SIZEOF_SECTION_TABLE)
            .map(parse_section_header)
            .collect::<Result<Vec<_>, _>>()?;

        for section in &sections {
            debug!(
                "Found section `{}` (size {}, offset {:#x})",
                section.name().unwrap_or("<non-UTF-8 name>"),
                section.virtual_size,
                section.pointer_to_raw_data
            );
        }

        Ok(Some(Self(sections)))
    }

    /// Index of the section with exactly this name.
    ///
    /// The comparison covers all 8 bytes of the name field, so `.init` does not match `.initrd`.
    pub fn find(&self, name: &str) -> Option<usize> {
        let needle = section_name(name)?;
        self.0.iter().position(|s| s.name == needle)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.find(name).is_some()
    }

    pub fn get(&self, name: &str) -> Option<&SectionHeader> {
        self.find(name).map(|index| &self.0[index])
    }

    /// Read the contents of the named section.
    ///
    /// An absent section is `Ok(None)`. Sections larger than [`MAX_SECTION_SIZE`] are refused.
    pub fn read<R: Read + Seek>(
        &self,
        reader: &mut R,
        name: &str,
    ) -> Result<Option<SectionData>, PeError> {
        let Some(section) = self.get(name) else {
            return Ok(None);
        };

        if section.virtual_size > MAX_SECTION_SIZE {
            return Err(PeError::SectionTooBig {
                name: name.to_owned(),
                size: section.virtual_size,
            });
        }

        reader.seek(SeekFrom::Start(u64::from(section.pointer_to_raw_data)))?;

        let expected = section.virtual_size as usize;
        let data = read_at_most(reader, expected)?;
        if data.len() != expected {
            return Err(PeError::TruncatedSection {
                name: name.to_owned(),
                got: data.len(),
                expected,
            });
        }

        Ok(Some(SectionData::new(data)))
    }

    pub fn iter(&self) -> std::slice::Iter<'_, SectionHeader> {
        self.0.iter()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

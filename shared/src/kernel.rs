use std::fmt;
use std::fs::File;
use std::io::{BufReader, Read, Seek};
use std::path::Path;

use anyhow::{Context, Result};
use log::warn;

use crate::os_release::{OsRelease, DEFAULT_OS_NAME};
use crate::pe::{PeError, SectionTable};

/// Sections whose joint presence makes a PE binary a unified kernel image.
pub const UKI_SECTIONS: [&str; 3] = [".osrel", ".linux", ".initrd"];

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum KernelType {
    /// Not a PE binary at all.
    Unknown,
    /// A unified kernel image.
    Uki,
    /// Some other PE binary, e.g. a kernel with an EFI stub.
    Pe,
}

impl KernelType {
    /// Classify a binary from its section table, `None` meaning it is not a PE binary.
    pub fn classify(sections: Option<&SectionTable>) -> Self {
        match sections {
            None => Self::Unknown,
            Some(table) if UKI_SECTIONS.iter().all(|name| table.contains(name)) => Self::Uki,
            Some(_) => Self::Pe,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Unknown => "unknown",
            Self::Uki => "uki",
            Self::Pe => "pe",
        }
    }
}

impl fmt::Display for KernelType {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Descriptive data embedded in a unified kernel image.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct UkiMetadata {
    /// Contents of `.cmdline`.
    pub cmdline: Option<String>,
    /// Contents of `.uname`.
    pub uname: Option<String>,
    /// Derived from `.osrel`.
    pub os_name: String,
}

/// A kernel binary opened for inspection.
pub struct KernelImage<R> {
    reader: R,
    sections: Option<SectionTable>,
}

impl KernelImage<BufReader<File>> {
    pub fn open(path: &Path) -> Result<Self> {
        let file =
            File::open(path).with_context(|| format!("Failed to open kernel file {path:?}"))?;
        Self::from_reader(BufReader::new(file))
            .with_context(|| format!("Failed to read PE headers of {path:?}"))
    }
}

impl<R: Read + Seek> KernelImage<R> {
    pub fn from_reader(mut reader: R) -> Result<Self, PeError> {
        let sections = SectionTable::locate(&mut reader)?;
        Ok(Self { reader, sections })
    }

    /// The section table, `None` if this is not a PE binary.
    pub fn sections(&self) -> Option<&SectionTable> {
        self.sections.as_ref()
    }

    pub fn kernel_type(&self) -> KernelType {
        KernelType::classify(self.sections())
    }

    fn read_text(&mut self, name: &str) -> Result<Option<String>, PeError> {
        let Some(sections) = &self.sections else {
            return Ok(None);
        };
        Ok(sections
            .read(&mut self.reader, name)?
            .map(|data| data.to_text().into_owned()))
    }

    /// The OS name from `.osrel`: `PRETTY_NAME`, then `NAME`, then a generic default.
    ///
    /// os-release data we cannot make sense of is not fatal, a section that cannot be read is.
    fn os_name(&mut self) -> Result<String, PeError> {
        let Some(sections) = &self.sections else {
            return Ok(DEFAULT_OS_NAME.to_owned());
        };
        let Some(data) = sections.read(&mut self.reader, ".osrel")? else {
            return Ok(DEFAULT_OS_NAME.to_owned());
        };

        match OsRelease::from_bytes(data.as_bytes()) {
            Ok(os_release) => Ok(os_release.pretty_name().to_owned()),
            Err(e) => {
                warn!("Failed to parse embedded os-release file, ignoring: {e:#}");
                Ok(DEFAULT_OS_NAME.to_owned())
            }
        }
    }

    /// Metadata of a unified kernel image. Other binaries have none.
    pub fn uki_metadata(&mut self) -> Result<Option<UkiMetadata>, PeError> {
        if self.kernel_type() != KernelType::Uki {
            return Ok(None);
        }

        Ok(Some(UkiMetadata {
            cmdline: self.read_text(".cmdline")?,
            uname: self.read_text(".uname")?,
            os_name: self.os_name()?,
        }))
    }
}

/// Everything `kernel-inspect` reports about a binary.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct KernelInfo {
    pub kernel_type: KernelType,
    pub metadata: Option<UkiMetadata>,
}

pub fn identify_kernel(path: &Path) -> Result<KernelType> {
    Ok(KernelImage::open(path)?.kernel_type())
}

pub fn inspect_kernel(path: &Path) -> Result<KernelInfo> {
    let mut image = KernelImage::open(path)?;
    let metadata = image
        .uki_metadata()
        .with_context(|| format!("Failed to inspect UKI {path:?}"))?;

    Ok(KernelInfo {
        kernel_type: image.kernel_type(),
        metadata,
    })
}

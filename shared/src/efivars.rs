use std::fs;
use std::io;
use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use bitflags::bitflags;

/// systemd loader's GUID
/// != systemd's GUID
/// https://github.com/systemd/systemd/blob/main/src/boot/efi/util.h#L114-L121
/// https://systemd.io/BOOT_LOADER_INTERFACE/
pub const BOOT_LOADER_VENDOR_UUID: &str = "4a67b082-0a4c-41cf-b6c7-440b29bb8c4f";

/// efivarfs prefixes the variable data with the 32 bit attribute mask.
const ATTRIBUTES_SIZE: usize = 4;

bitflags! {
    #[repr(transparent)]
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Default)]
    /// Feature flags as described in https://www.freedesktop.org/software/systemd/man/systemd-stub.html
    pub struct EfiStubFeatures: u64 {
       /// Is `LoaderDevicePartUUID` loaded in UEFI variables?
       const ReportBootPartition = 1 << 0;
       /// Are credentials picked up from the boot partition?
       const PickUpCredentials = 1 << 1;
       /// Are system extensions picked up from the boot partition?
       const PickUpSysExts = 1 << 2;
       /// Are we able to measure kernel image, parameters and sysexts?
       const ThreePcrs = 1 << 3;
       /// Can we pass a random seed to the kernel?
       const RandomSeed = 1 << 4;
    }
}

/// Read access to the loader's EFI variables through efivarfs.
#[derive(Clone, Debug)]
pub struct EfiVars {
    dir: PathBuf,
}

impl EfiVars {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn path(&self, name: &str) -> PathBuf {
        self.dir.join(format!("{name}-{BOOT_LOADER_VENDOR_UUID}"))
    }

    /// Raw variable data without the attribute header. An absent variable is `None`.
    pub fn read(&self, name: &str) -> Result<Option<Vec<u8>>> {
        let path = self.path(name);
        let raw = match fs::read(&path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(e).with_context(|| format!("Failed to read EFI variable {path:?}"))
            }
        };

        if raw.len() < ATTRIBUTES_SIZE {
            bail!("EFI variable {path:?} is shorter than its attribute header");
        }

        Ok(Some(raw[ATTRIBUTES_SIZE..].to_vec()))
    }

    /// A variable holding a UTF-16LE string, with or without a trailing NUL.
    pub fn read_string(&self, name: &str) -> Result<Option<String>> {
        let Some(data) = self.read(name)? else {
            return Ok(None);
        };

        if data.len() % 2 != 0 {
            bail!("EFI variable '{name}' has an odd size for a UTF-16 string");
        }

        let units: Vec<u16> = data
            .chunks_exact(2)
            .map(|c| u16::from_le_bytes([c[0], c[1]]))
            .take_while(|&unit| unit != 0)
            .collect();

        String::from_utf16(&units)
            .map(Some)
            .with_context(|| format!("EFI variable '{name}' is not valid UTF-16"))
    }

    /// Features advertised by the stub that booted the running kernel.
    ///
    /// A missing variable means no features. Unknown bits are kept, newer stubs define more of
    /// them.
    pub fn stub_features(&self) -> Result<EfiStubFeatures> {
        let Some(data) = self.read("StubFeatures")? else {
            return Ok(EfiStubFeatures::empty());
        };

        let bytes: [u8; 8] = data
            .as_slice()
            .try_into()
            .with_context(|| format!("StubFeatures has {} bytes, expected 8", data.len()))?;

        Ok(EfiStubFeatures::from_bits_retain(u64::from_le_bytes(bytes)))
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::path::Path;
    use tempfile::tempdir;

    pub(crate) fn write_variable(dir: &Path, name: &str, data: &[u8]) -> Result<()> {
        let mut raw = 0x7u32.to_le_bytes().to_vec();
        raw.extend_from_slice(data);
        fs::write(dir.join(format!("{name}-{BOOT_LOADER_VENDOR_UUID}")), raw)?;
        Ok(())
    }

    pub(crate) fn utf16(s: &str) -> Vec<u8> {
        s.encode_utf16()
            .chain(std::iter::once(0))
            .flat_map(|c| c.to_le_bytes())
            .collect()
    }

    #[test]
    fn reads_strings() -> Result<()> {
        let dir = tempdir()?;
        write_variable(dir.path(), "StubPcrKernelImage", &utf16("11"))?;
        write_variable(dir.path(), "NoNul", &utf16("12")[..4])?;

        let efivars = EfiVars::new(dir.path());
        assert_eq!(efivars.read_string("StubPcrKernelImage")?.as_deref(), Some("11"));
        assert_eq!(efivars.read_string("NoNul")?.as_deref(), Some("12"));
        assert_eq!(efivars.read_string("Missing")?, None);

        Ok(())
    }

    #[test]
    fn rejects_truncated_variables() -> Result<()> {
        let dir = tempdir()?;
        fs::write(
            dir.path().join(format!("Broken-{BOOT_LOADER_VENDOR_UUID}")),
            [1, 2],
        )?;
        write_variable(dir.path(), "Odd", &[b'1', 0, b'2'])?;

        let efivars = EfiVars::new(dir.path());
        assert!(efivars.read("Broken").is_err());
        assert!(efivars.read_string("Odd").is_err());

        Ok(())
    }

    #[test]
    fn reads_stub_features() -> Result<()> {
        let dir = tempdir()?;
        let efivars = EfiVars::new(dir.path());
        assert_eq!(efivars.stub_features()?, EfiStubFeatures::empty());

        let bits = (EfiStubFeatures::ThreePcrs | EfiStubFeatures::ReportBootPartition).bits();
        write_variable(dir.path(), "StubFeatures", &(bits | 1 << 40).to_le_bytes())?;
        let features = efivars.stub_features()?;
        assert!(features.contains(EfiStubFeatures::ThreePcrs));
        assert_eq!(features.bits() & (1 << 40), 1 << 40);

        write_variable(dir.path(), "StubFeatures", &[1, 2, 3])?;
        assert!(efivars.stub_features().is_err());

        Ok(())
    }
}

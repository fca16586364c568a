// Utility code in this module can become marked as dead code if it is not used in every single
// module in `tests/`. Thus we need to allow dead code here. See
// https://stackoverflow.com/a/67902444
#![allow(dead_code)]

use std::ffi::OsStr;
use std::fs;
use std::path::Path;
use std::process::Output;

use anyhow::Result;
use assert_cmd::Command;
use sha2::{Digest, Sha256};

const LOADER_GUID: &str = "4a67b082-0a4c-41cf-b6c7-440b29bb8c4f";

/// Call `ukitool-measure` with the given arguments against the platform rooted at `root`.
pub fn measure<I, S>(root: &Path, args: I) -> Result<Output>
where
    I: IntoIterator<Item = S>,
    S: AsRef<OsStr>,
{
    let output = Command::cargo_bin("ukitool-measure")?
        .env("UKITOOL_SYSFS_ROOT", root)
        .args(args)
        .output()?;

    // Print debugging output.
    // This is a weird hack to make cargo test capture the output.
    // See https://github.com/rust-lang/rust/issues/12309
    print!("{}", String::from_utf8_lossy(&output.stdout));
    print!("{}", String::from_utf8_lossy(&output.stderr));

    Ok(output)
}

/// What the stub measures into PCR 11 of the SHA256 bank for the given sections.
///
/// Sections have to be given in measurement order, empty ones are skipped like the stub does.
pub fn expected_sha256(sections: &[(&str, &[u8])]) -> String {
    let mut pcr = vec![0u8; 32];
    for (name, content) in sections {
        if content.is_empty() {
            continue;
        }

        let mut measured_name = name.as_bytes().to_vec();
        measured_name.push(0);

        for message in [Sha256::digest(&measured_name), Sha256::digest(content)] {
            let mut hasher = Sha256::new();
            hasher.update(&pcr);
            hasher.update(message);
            pcr = hasher.finalize().to_vec();
        }
    }
    hex::encode(pcr)
}

/// A fake sysfs tree of a machine booted through a stub with full TPM2 support.
pub struct FakePlatform<'a> {
    root: &'a Path,
}

impl<'a> FakePlatform<'a> {
    pub fn with_tpm2(root: &'a Path) -> Result<Self> {
        fs::create_dir_all(root.join("sys/firmware/acpi/tables"))?;
        fs::write(root.join("sys/firmware/acpi/tables/TPM2"), b"TPM2")?;
        fs::create_dir_all(root.join("sys/class/tpmrm/tpmrm0"))?;
        fs::create_dir_all(root.join("sys/firmware/efi/efivars"))?;
        Ok(Self { root })
    }

    pub fn set_pcr(&self, bank: &str, index: u32, value: &[u8]) -> Result<&Self> {
        let dir = self.root.join(format!("sys/class/tpm/tpm0/pcr-{bank}"));
        fs::create_dir_all(&dir)?;
        fs::write(dir.join(index.to_string()), format!("{}\n", hex::encode_upper(value)))?;
        Ok(self)
    }

    pub fn set_efi_variable(&self, name: &str, data: &[u8]) -> Result<&Self> {
        let mut raw = 0x6u32.to_le_bytes().to_vec();
        raw.extend_from_slice(data);
        fs::write(
            self.root
                .join(format!("sys/firmware/efi/efivars/{name}-{LOADER_GUID}")),
            raw,
        )?;
        Ok(self)
    }

    pub fn set_efi_string(&self, name: &str, value: &str) -> Result<&Self> {
        let data: Vec<u8> = value
            .encode_utf16()
            .chain(std::iter::once(0))
            .flat_map(|c| c.to_le_bytes())
            .collect();
        self.set_efi_variable(name, &data)
    }

    pub fn set_stub_features(&self, features: u64) -> Result<&Self> {
        self.set_efi_variable("StubFeatures", &features.to_le_bytes())
    }
}

/// Bit of the `ThreePcrs` stub feature.
pub const THREE_PCRS: u64 = 1 << 3;

//! Read-only view of the platform's TPM measurements, as published by the kernel in sysfs and by
//! the stub in EFI variables.

use std::fs;
use std::io::{self, Read};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use bitflags::bitflags;
use log::{debug, warn};

use crate::efivars::{EfiStubFeatures, EfiVars};
use crate::pcr::PcrBank;

/// The stub extends the unified sections of the kernel image into this PCR.
pub const TPM_PCR_INDEX_KERNEL_IMAGE: u32 = 11;
/// The stub extends the kernel command line and passed credentials into this PCR.
pub const TPM_PCR_INDEX_KERNEL_PARAMETERS: u32 = 12;
/// The stub extends initrd system extension images into this PCR.
pub const TPM_PCR_INDEX_INITRD_SYSEXTS: u32 = 13;

/// Environment variable relocating every platform path below another root directory.
pub const SYSFS_ROOT_ENV: &str = "UKITOOL_SYSFS_ROOT";

/// sysfs PCR files are short hex strings. Anything bigger is garbage.
const MAX_PCR_FILE_SIZE: u64 = 4096;

/// A PCR the stub measures into, together with the EFI variable in which it reports the index
/// it actually used.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct StubPcr {
    pub index: u32,
    pub description: &'static str,
    pub efi_variable: &'static str,
    pub category: &'static str,
}

pub const STUB_PCRS: [StubPcr; 3] = [
    StubPcr {
        index: TPM_PCR_INDEX_KERNEL_IMAGE,
        description: "Unified Kernel Image",
        efi_variable: "StubPcrKernelImage",
        category: "kernel image",
    },
    StubPcr {
        index: TPM_PCR_INDEX_KERNEL_PARAMETERS,
        description: "Kernel Parameters",
        efi_variable: "StubPcrKernelParameters",
        category: "kernel parameters",
    },
    StubPcr {
        index: TPM_PCR_INDEX_INITRD_SYSEXTS,
        description: "initrd System Extensions",
        efi_variable: "StubPcrInitRDSysExts",
        category: "initrd system extension images",
    },
];

bitflags! {
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
    pub struct Tpm2Support: u8 {
        /// The firmware found a TPM2 and published its event log or ACPI table.
        const Firmware = 1 << 0;
        /// A kernel driver exposes a TPM2 resource manager device.
        const Driver = 1 << 1;
        /// The kernel has the TPM resource manager class.
        const Subsystem = 1 << 2;

        const Full = Self::Firmware.bits() | Self::Driver.bits() | Self::Subsystem.bits();
    }
}

#[derive(Debug, thiserror::Error)]
pub enum TpmError {
    #[error("Sorry, system lacks full TPM2 support (found: {0:?}).")]
    Unsupported(Tpm2Support),
    #[error("None of the selected PCR banks appear to exist.")]
    NoBanks,
    #[error("PCR value of bank {bank} has {got} bytes, expected {expected}.")]
    UnexpectedSize {
        bank: PcrBank,
        got: usize,
        expected: usize,
    },
}

/// A stub-reported PCR index that differs from ours.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PcrIndexMismatch {
    pub pcr: StubPcr,
    pub reported: u32,
}

/// Outcome of checking the stub's self-reported state.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct StubValidation {
    pub features: EfiStubFeatures,
    pub mismatches: Vec<PcrIndexMismatch>,
}

impl StubValidation {
    /// Whether the measurements we show can be trusted to match our expectations.
    pub fn is_consistent(&self) -> bool {
        self.features.contains(EfiStubFeatures::ThreePcrs) && self.mismatches.is_empty()
    }
}

/// One PCR value read back from sysfs.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PcrReading {
    pub pcr: StubPcr,
    pub bank: PcrBank,
    pub value: Vec<u8>,
}

impl PcrReading {
    pub fn is_zero(&self) -> bool {
        self.value.iter().all(|&b| b == 0)
    }
}

/// Locations of the platform state we consume.
#[derive(Clone, Debug)]
pub struct Platform {
    root: PathBuf,
}

impl Default for Platform {
    fn default() -> Self {
        Self::new("/")
    }
}

impl Platform {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// The real platform, unless [`SYSFS_ROOT_ENV`] points somewhere else.
    pub fn from_env() -> Self {
        match std::env::var_os(SYSFS_ROOT_ENV) {
            Some(root) => {
                debug!("Using {root:?} as platform root.");
                Self::new(root)
            }
            None => Self::default(),
        }
    }

    fn tpm_dir(&self) -> PathBuf {
        self.root.join("sys/class/tpm/tpm0")
    }

    pub fn pcr_bank_dir(&self, bank: PcrBank) -> PathBuf {
        self.tpm_dir().join(format!("pcr-{}", bank.name()))
    }

    pub fn pcr_path(&self, bank: PcrBank, index: u32) -> PathBuf {
        self.pcr_bank_dir(bank).join(index.to_string())
    }

    pub fn efivars(&self) -> EfiVars {
        EfiVars::new(self.root.join("sys/firmware/efi/efivars"))
    }

    /// Current value of a PCR in one bank. A missing sysfs file is `None`.
    pub fn read_pcr(&self, bank: PcrBank, index: u32) -> Result<Option<Vec<u8>>> {
        let path = self.pcr_path(bank, index);

        let file = match fs::File::open(&path) {
            Ok(file) => file,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e).with_context(|| format!("Failed to read {path:?}")),
        };

        let mut text = String::new();
        file.take(MAX_PCR_FILE_SIZE)
            .read_to_string(&mut text)
            .with_context(|| format!("Failed to read {path:?}"))?;

        let value = hex::decode(text.trim())
            .with_context(|| format!("Failed to decode PCR value '{}'", text.trim()))?;

        Ok(Some(value))
    }

    /// Like [`Platform::read_pcr`], but the value has to exist and match the bank's digest size.
    pub fn read_pcr_required(&self, bank: PcrBank, index: u32) -> Result<Vec<u8>> {
        let value = self.read_pcr(bank, index)?.with_context(|| {
            format!(
                "Failed to read {:?}: no such file",
                self.pcr_path(bank, index)
            )
        })?;

        if value.len() != bank.digest_size() {
            return Err(TpmError::UnexpectedSize {
                bank,
                got: value.len(),
                expected: bank.digest_size(),
            }
            .into());
        }

        Ok(value)
    }

    pub fn tpm2_support(&self) -> Tpm2Support {
        let mut support = Tpm2Support::empty();

        if self.root.join("sys/firmware/acpi/tables/TPM2").exists()
            || self
                .root
                .join("sys/kernel/security/tpm0/binary_bios_measurements")
                .exists()
        {
            support |= Tpm2Support::Firmware;
        }

        let tpmrm = self.root.join("sys/class/tpmrm");
        if tpmrm.is_dir() {
            support |= Tpm2Support::Subsystem;

            if has_entries(&tpmrm) {
                support |= Tpm2Support::Driver;
            }
        }

        support
    }

    /// Make sure we are looking at a system where reading back measurements makes sense.
    ///
    /// Lacking TPM2 support or any of the requested banks is fatal. Stub quirks are only warned
    /// about and recorded in the returned [`StubValidation`].
    pub fn validate_stub(&self, banks: &[PcrBank]) -> Result<StubValidation> {
        let support = self.tpm2_support();
        if support != Tpm2Support::Full {
            return Err(TpmError::Unsupported(support).into());
        }

        let efivars = self.efivars();
        let features = efivars
            .stub_features()
            .context("Unable to get stub features")?;

        if !features.contains(EfiStubFeatures::ThreePcrs) {
            warn!("Warning: current kernel image does not support measuring itself, the command line or initrd system extension images.");
            warn!("The PCR measurements seen are unlikely to be valid.");
        }

        let mut mismatches = Vec::new();
        for pcr in &STUB_PCRS {
            if let Some(reported) = reported_pcr_index(&efivars, pcr)? {
                if reported != pcr.index {
                    warn!(
                        "PCR number reported by stub for {} ({}) different from our expectation ({}).",
                        pcr.category, reported, pcr.index
                    );
                    warn!("The measurements are likely inconsistent.");
                    mismatches.push(PcrIndexMismatch {
                        pcr: *pcr,
                        reported,
                    });
                }
            }
        }

        if !banks.iter().any(|bank| self.pcr_bank_dir(*bank).exists()) {
            return Err(TpmError::NoBanks.into());
        }

        Ok(StubValidation {
            features,
            mismatches,
        })
    }

    /// Current values of the stub's PCRs, grouped by PCR and then by bank. Banks the kernel does
    /// not expose are skipped.
    pub fn read_stub_pcrs(&self, banks: &[PcrBank]) -> Result<Vec<PcrReading>> {
        let mut readings = Vec::new();

        for pcr in &STUB_PCRS {
            for &bank in banks {
                if let Some(value) = self.read_pcr(bank, pcr.index)? {
                    readings.push(PcrReading {
                        pcr: *pcr,
                        bank,
                        value,
                    });
                }
            }
        }

        Ok(readings)
    }
}

/// Compare the PCR index the stub reports having used with the one we expect.
///
/// Stubs that do not report anything are not an error.
fn reported_pcr_index(efivars: &EfiVars, pcr: &StubPcr) -> Result<Option<u32>> {
    let Some(value) = efivars.read_string(pcr.efi_variable)? else {
        debug!("Stub did not report a PCR for the {}.", pcr.category);
        return Ok(None);
    };

    let reported = value.trim().parse::<u32>().with_context(|| {
        format!(
            "Failed to parse EFI variable '{}': {value}",
            pcr.efi_variable
        )
    })?;

    Ok(Some(reported))
}

fn has_entries(dir: &Path) -> bool {
    fs::read_dir(dir)
        .map(|mut entries| entries.next().is_some())
        .unwrap_or(false)
}

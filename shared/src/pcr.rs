//! Offline prediction of the PCR 11 value a UKI stub produces.
//!
//! The stub measures each unified section twice into PCR 11: first the section name (ASCII with
//! one trailing NUL byte), then the section contents, always following the canonical section
//! order. A PCR can only be extended, `new = H(old || H(message))`, so the order of measurements
//! is part of the result.

use std::fmt;
use std::fs::File;
use std::io::{self, Read};
use std::path::{Path, PathBuf};
use std::str::FromStr;

use anyhow::{bail, Context, Result};
use digest::DynDigest;
use log::{debug, info};

use crate::tpm::{Platform, TPM_PCR_INDEX_KERNEL_IMAGE};
use crate::unified_sections::UnifiedSection;

/// Input files are hashed in chunks of this size.
const BUFFER_SIZE: usize = 16 * 1024;

#[derive(Debug, thiserror::Error)]
#[error("Unknown bank '{0}', refusing.")]
pub struct UnknownBankError(pub String);

/// A TPM PCR bank, i.e. the digest algorithm used for one set of registers.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum PcrBank {
    Sha1,
    Sha256,
    Sha384,
    Sha512,
}

impl PcrBank {
    /// Banks used when none are selected explicitly.
    pub const ALL: [PcrBank; 4] = [Self::Sha1, Self::Sha256, Self::Sha384, Self::Sha512];

    /// Lowercase name, as used by sysfs and in our output.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Sha1 => "sha1",
            Self::Sha256 => "sha256",
            Self::Sha384 => "sha384",
            Self::Sha512 => "sha512",
        }
    }

    /// Digest output size in bytes, which is also the size of a register in this bank.
    pub fn digest_size(&self) -> usize {
        match self {
            Self::Sha1 => 20,
            Self::Sha256 => 32,
            Self::Sha384 => 48,
            Self::Sha512 => 64,
        }
    }

    pub fn hasher(&self) -> Box<dyn DynDigest> {
        match self {
            Self::Sha1 => Box::new(sha1::Sha1::default()),
            Self::Sha256 => Box::new(sha2::Sha256::default()),
            Self::Sha384 => Box::new(sha2::Sha384::default()),
            Self::Sha512 => Box::new(sha2::Sha512::default()),
        }
    }

    pub fn digest(&self, data: &[u8]) -> Vec<u8> {
        let mut hasher = self.hasher();
        hasher.update(data);
        hasher.finalize().into_vec()
    }
}

impl FromStr for PcrBank {
    type Err = UnknownBankError;

    /// Case-insensitive, also accepting the `SHA2-256` style spelling.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s.to_ascii_lowercase().as_str() {
            "sha1" => Self::Sha1,
            "sha256" | "sha2-256" => Self::Sha256,
            "sha384" | "sha2-384" => Self::Sha384,
            "sha512" | "sha2-512" => Self::Sha512,
            _ => return Err(UnknownBankError(s.to_owned())),
        })
    }
}

impl fmt::Display for PcrBank {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Resolve requested bank names into a sorted list without duplicates.
///
/// No names at all selects [`PcrBank::ALL`]. Any unknown name fails the whole selection.
pub fn resolve_banks<I, S>(names: I) -> Result<Vec<PcrBank>, UnknownBankError>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let mut banks = names
        .into_iter()
        .map(|name| name.as_ref().parse())
        .collect::<Result<Vec<PcrBank>, _>>()?;

    if banks.is_empty() {
        banks = PcrBank::ALL.to_vec();
    }

    banks.sort();
    banks.dedup();
    Ok(banks)
}

/// A simulated PCR in one bank.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PcrState {
    bank: PcrBank,
    value: Vec<u8>,
}

impl PcrState {
    /// A register right after reset: all zeroes.
    pub fn new(bank: PcrBank) -> Self {
        Self {
            bank,
            value: vec![0; bank.digest_size()],
        }
    }

    pub fn bank(&self) -> PcrBank {
        self.bank
    }

    pub fn value(&self) -> &[u8] {
        &self.value
    }

    pub fn is_zero(&self) -> bool {
        self.value.iter().all(|&b| b == 0)
    }

    /// Replace the register value, e.g. by one read back from the TPM.
    fn set_value(&mut self, value: Vec<u8>) -> Result<()> {
        if value.len() != self.bank.digest_size() {
            bail!(
                "PCR value for bank {} has {} bytes, expected {}",
                self.bank,
                value.len(),
                self.bank.digest_size()
            );
        }
        self.value = value;
        Ok(())
    }

    /// TPM2_PCR_Extend: hash the old value followed by `message` into the new value.
    pub fn extend(&mut self, message: &[u8]) {
        let mut hasher = self.bank.hasher();
        hasher.update(&self.value);
        hasher.update(message);
        self.value = hasher.finalize().into_vec();

        debug_assert_eq!(self.value.len(), self.bank.digest_size());
    }
}

/// Input file per unified section.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SectionInputs([Option<PathBuf>; UnifiedSection::COUNT]);

impl SectionInputs {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, section: UnifiedSection, path: impl Into<PathBuf>) -> Self {
        self.set(section, path);
        self
    }

    pub fn set(&mut self, section: UnifiedSection, path: impl Into<PathBuf>) {
        self.0[section.index()] = Some(path.into());
    }

    pub fn get(&self, section: UnifiedSection) -> Option<&Path> {
        self.0[section.index()].as_deref()
    }

    pub fn is_empty(&self) -> bool {
        self.0.iter().all(Option::is_none)
    }

    /// Supplied inputs in measurement order.
    pub fn iter(&self) -> impl Iterator<Item = (UnifiedSection, &Path)> {
        UnifiedSection::ALL
            .into_iter()
            .filter_map(|section| self.get(section).map(|path| (section, path)))
    }
}

/// Where the predicted PCR values come from.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PcrSource {
    /// Simulate the stub measuring these files.
    Sections(SectionInputs),
    /// Take the values the platform measured during this boot.
    Current,
}

/// Everything a calculation needs, validated once up front.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MeasureConfig {
    banks: Vec<PcrBank>,
    source: PcrSource,
}

impl MeasureConfig {
    /// `current` and section inputs exclude each other. Without `current`, a kernel image is
    /// required.
    pub fn new(banks: Vec<PcrBank>, inputs: SectionInputs, current: bool) -> Result<Self> {
        if banks.is_empty() {
            bail!("No PCR banks selected.");
        }

        let source = if current {
            if !inputs.is_empty() {
                bail!("The --current switch cannot be used in combination with --linux= and related switches.");
            }
            PcrSource::Current
        } else {
            if inputs.get(UnifiedSection::Linux).is_none() {
                bail!("Either --linux= or --current must be specified, refusing.");
            }
            PcrSource::Sections(inputs)
        };

        Ok(Self { banks, source })
    }

    pub fn banks(&self) -> &[PcrBank] {
        &self.banks
    }

    pub fn source(&self) -> &PcrSource {
        &self.source
    }
}

/// Measure one section read from `reader` into every register, like the stub does.
///
/// The input is read once and fed to one hasher per bank. Empty input is not measured at all.
/// Returns whether anything was measured.
pub fn measure_section<R: Read>(
    states: &mut [PcrState],
    section: UnifiedSection,
    mut reader: R,
) -> io::Result<bool> {
    let mut hashers: Vec<Box<dyn DynDigest>> =
        states.iter().map(|state| state.bank().hasher()).collect();

    let mut buffer = vec![0u8; BUFFER_SIZE];
    let mut size: u64 = 0;
    loop {
        let n = match reader.read(&mut buffer) {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        };

        for hasher in &mut hashers {
            hasher.update(&buffer[..n]);
        }
        size += n as u64;
    }

    // The stub skips empty sections, so we do too.
    if size == 0 {
        debug!("Section `{section}` is empty, not measuring it.");
        return Ok(false);
    }

    debug!("Measuring section `{section}` ({size} bytes).");
    for (state, hasher) in states.iter_mut().zip(hashers) {
        let name_hash = state.bank().digest(section.measured_name());
        state.extend(&name_hash);

        let content_hash = hasher.finalize();
        state.extend(&content_hash);
    }

    Ok(true)
}

/// Measure all supplied inputs in canonical section order.
pub fn measure_inputs(states: &mut [PcrState], inputs: &SectionInputs) -> Result<()> {
    for (section, path) in inputs.iter() {
        let file = File::open(path).with_context(|| format!("Failed to open {path:?}"))?;
        measure_section(states, section, file)
            .with_context(|| format!("Failed to read {path:?}"))?;
    }

    Ok(())
}

/// Compute the PCR 11 value of every configured bank.
pub fn calculate(config: &MeasureConfig, platform: &Platform) -> Result<Vec<PcrState>> {
    let mut states: Vec<PcrState> = config.banks().iter().map(|&b| PcrState::new(b)).collect();

    match config.source() {
        PcrSource::Current => {
            info!("Using current PCR {TPM_PCR_INDEX_KERNEL_IMAGE} values.");
            for state in &mut states {
                let value = platform.read_pcr_required(state.bank(), TPM_PCR_INDEX_KERNEL_IMAGE)?;
                state.set_value(value)?;
            }
        }
        PcrSource::Sections(inputs) => measure_inputs(&mut states, inputs)?,
    }

    Ok(states)
}

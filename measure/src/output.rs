use std::collections::BTreeMap;

use anyhow::{Context, Result};
use clap::ValueEnum;
use serde::Serialize;

use uki_tool::pcr::{PcrBank, PcrState};
use uki_tool::tpm::{PcrReading, TPM_PCR_INDEX_KERNEL_IMAGE};

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, ValueEnum)]
pub enum JsonMode {
    /// Plain `<pcr>:<bank>=<hex>` lines
    #[default]
    Off,
    /// Compact JSON
    Short,
    /// Indented JSON
    Pretty,
}

#[derive(Debug, PartialEq, Eq, Serialize)]
pub struct PcrEntry {
    pub pcr: u32,
    pub hash: String,
}

/// PCR values grouped by bank, the JSON shape of both `status` and `calculate`.
#[derive(Debug, Default, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct PcrReport(BTreeMap<&'static str, Vec<PcrEntry>>);

impl PcrReport {
    pub fn push(&mut self, bank: PcrBank, pcr: u32, value: &[u8]) {
        self.0.entry(bank.name()).or_default().push(PcrEntry {
            pcr,
            hash: hex::encode(value),
        });
    }

    pub fn from_states(states: &[PcrState]) -> Self {
        let mut report = Self::default();
        for state in states {
            report.push(state.bank(), TPM_PCR_INDEX_KERNEL_IMAGE, state.value());
        }
        report
    }

    pub fn from_readings(readings: &[PcrReading]) -> Self {
        let mut report = Self::default();
        for reading in readings {
            report.push(reading.bank, reading.pcr.index, &reading.value);
        }
        report
    }

    /// Serialize in the given mode. Nothing is serialized with JSON turned off.
    pub fn to_json(&self, mode: JsonMode) -> Result<Option<String>> {
        let json = match mode {
            JsonMode::Off => return Ok(None),
            JsonMode::Short => serde_json::to_string(self),
            JsonMode::Pretty => serde_json::to_string_pretty(self),
        };
        json.map(Some).context("Failed to serialize PCR values")
    }
}

pub fn plain_line(pcr: u32, bank: PcrBank, value: &[u8]) -> String {
    format!("{pcr}:{bank}={}", hex::encode(value))
}

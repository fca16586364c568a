use std::fmt;

/// List of PE sections that have a special meaning with respect to
/// UKI specification.
/// This is the canonical order in which they are measured into TPM
/// PCR 11.
/// !!! DO NOT REORDER !!!
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(u8)]
pub enum UnifiedSection {
    Linux = 0,
    OsRel = 1,
    CmdLine = 2,
    Initrd = 3,
    Splash = 4,
    Dtb = 5,
}

impl UnifiedSection {
    pub const COUNT: usize = 6;

    /// All sections, in measurement order.
    pub const ALL: [UnifiedSection; Self::COUNT] = [
        Self::Linux,
        Self::OsRel,
        Self::CmdLine,
        Self::Initrd,
        Self::Splash,
        Self::Dtb,
    ];

    /// The canonical section name.
    pub fn name(&self) -> &'static str {
        match self {
            UnifiedSection::Linux => ".linux",
            UnifiedSection::OsRel => ".osrel",
            UnifiedSection::CmdLine => ".cmdline",
            UnifiedSection::Initrd => ".initrd",
            UnifiedSection::Splash => ".splash",
            UnifiedSection::Dtb => ".dtb",
        }
    }

    /// The section name as it is measured: ASCII with one trailing NUL byte.
    pub fn measured_name(&self) -> &'static [u8] {
        match self {
            UnifiedSection::Linux => b".linux\0",
            UnifiedSection::OsRel => b".osrel\0",
            UnifiedSection::CmdLine => b".cmdline\0",
            UnifiedSection::Initrd => b".initrd\0",
            UnifiedSection::Splash => b".splash\0",
            UnifiedSection::Dtb => b".dtb\0",
        }
    }

    /// Position in the measurement order.
    pub fn index(&self) -> usize {
        *self as usize
    }
}

impl fmt::Display for UnifiedSection {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.name())
    }
}

// Utility code in this module can become marked as dead code if it is not used in every single
// module in `tests/`. Thus we need to allow dead code here. See
// https://stackoverflow.com/a/67902444
#![allow(dead_code)]

use std::fs;
use std::path::{Path, PathBuf};
use std::process::Output;

use anyhow::Result;
use assert_cmd::Command;

const PE_HEADER_OFFSET: usize = 0x80;
const OPTIONAL_HEADER_SIZE: usize = 0xf0;
const SECTION_HEADER_SIZE: usize = 40;

/// Build a minimal PE image containing the given sections.
///
/// Only the fields the inspector looks at are filled in: DOS magic, `e_lfanew`, PE magic, the
/// section count, the optional header size and per section its name, size and file offset.
pub fn pe_image(sections: &[(&str, &[u8])]) -> Vec<u8> {
    let table_offset = PE_HEADER_OFFSET + 24 + OPTIONAL_HEADER_SIZE;
    let mut data_offset = table_offset + sections.len() * SECTION_HEADER_SIZE;

    let mut image = vec![0u8; data_offset];
    image[..2].copy_from_slice(b"MZ");
    image[0x3c..0x40].copy_from_slice(&(PE_HEADER_OFFSET as u32).to_le_bytes());

    let pe = &mut image[PE_HEADER_OFFSET..];
    pe[..4].copy_from_slice(b"PE\0\0");
    pe[4..6].copy_from_slice(&0x8664u16.to_le_bytes());
    pe[6..8].copy_from_slice(&(sections.len() as u16).to_le_bytes());
    pe[20..22].copy_from_slice(&(OPTIONAL_HEADER_SIZE as u16).to_le_bytes());

    for (i, (name, content)) in sections.iter().enumerate() {
        let header = &mut image[table_offset + i * SECTION_HEADER_SIZE..];
        header[..name.len()].copy_from_slice(name.as_bytes());
        header[8..12].copy_from_slice(&(content.len() as u32).to_le_bytes());
        header[20..24].copy_from_slice(&(data_offset as u32).to_le_bytes());
        data_offset += content.len();
    }

    for (_, content) in sections {
        image.extend_from_slice(content);
    }

    image
}

/// A small but complete unified kernel image.
pub fn uki_image() -> Vec<u8> {
    pe_image(&[
        (".text", &b"stub code"[..]),
        (".osrel", &b"ID=uki\nNAME=UKI OS\nPRETTY_NAME=\"UKI OS 42 (Test)\"\n"[..]),
        (".cmdline", &b"console=ttyS0 quiet\0"[..]),
        (".uname", &b"6.6.1-uki\0"[..]),
        (".linux", &b"MZ kernel"[..]),
        (".initrd", &b"070701 initrd"[..]),
    ])
}

pub fn write_image(dir: &Path, name: &str, image: &[u8]) -> Result<PathBuf> {
    let path = dir.join(name);
    fs::write(&path, image)?;
    Ok(path)
}

/// Call `ukitool-inspect` with the given arguments.
pub fn inspect<I, S>(args: I) -> Result<Output>
where
    I: IntoIterator<Item = S>,
    S: AsRef<std::ffi::OsStr>,
{
    let output = Command::cargo_bin("ukitool-inspect")?.args(args).output()?;

    // Print debugging output.
    // This is a weird hack to make cargo test capture the output.
    // See https://github.com/rust-lang/rust/issues/12309
    print!("{}", String::from_utf8_lossy(&output.stdout));
    print!("{}", String::from_utf8_lossy(&output.stderr));

    Ok(output)
}

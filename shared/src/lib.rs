pub mod efivars;
pub mod kernel;
pub mod os_release;
pub mod pcr;
pub mod pe;
pub mod tpm;
pub mod unified_sections;

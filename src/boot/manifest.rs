//! Solo5 application manifest (MFT1).
//!
//! The manifest declares the devices a guest expects. It is stored as an ELF
//! note and copied verbatim into guest memory at boot; the monitor only
//! validates it and keeps a parsed view for lookups.
//!
//! ```text
//! header (8 bytes):  version u32, entries u32
//! entry (104 bytes): name[68] @0, type u32 @68, u[16] @72, b[8] @88,
//!                    attached u8 @96, padding to 104
//! ```

use std::collections::HashSet;

use crate::error::BootError;

pub const MFT_VERSION: u32 = 1;
pub const MFT_MAX_ENTRIES: usize = 64;
/// Name field width, including the terminating NUL.
pub const MFT_NAME_SIZE: usize = 68;
pub const MFT_HEADER_SIZE: usize = 8;
pub const MFT_ENTRY_SIZE: usize = 104;
/// Largest manifest descriptor the monitor accepts.
pub const MFT1_NOTE_MAX_SIZE: u64 = (MFT_HEADER_SIZE + MFT_MAX_ENTRIES * MFT_ENTRY_SIZE) as u64;

pub const MFT_DEV_BLOCK_BASIC: u32 = 1;
pub const MFT_DEV_NET_BASIC: u32 = 2;
/// Type of the mandatory first entry.
pub const MFT_RESERVED_FIRST: u32 = 1 << 30;

const TYPE_OFFSET: usize = 68;
const ATTACHED_OFFSET: usize = 96;

/// Device class of a manifest entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceKind {
    Block,
    Net,
    Reserved,
    Unknown(u32),
}

impl From<u32> for DeviceKind {
    fn from(value: u32) -> Self {
        match value {
            MFT_DEV_BLOCK_BASIC => DeviceKind::Block,
            MFT_DEV_NET_BASIC => DeviceKind::Net,
            MFT_RESERVED_FIRST => DeviceKind::Reserved,
            other => DeviceKind::Unknown(other),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ManifestEntry {
    pub name: String,
    pub kind: DeviceKind,
}

/// A validated manifest together with its raw descriptor bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Manifest {
    entries: Vec<ManifestEntry>,
    raw: Vec<u8>,
}

fn u32_at(data: &[u8], off: usize) -> u32 {
    let mut b = [0u8; 4];
    b.copy_from_slice(&data[off..off + 4]);
    u32::from_le_bytes(b)
}

fn invalid(msg: impl Into<String>) -> BootError {
    BootError::InvalidManifest(msg.into())
}

impl Manifest {
    /// Validate a raw MFT1 descriptor.
    pub fn parse(raw: Vec<u8>) -> Result<Self, BootError> {
        if raw.len() < MFT_HEADER_SIZE {
            return Err(invalid(format!("descriptor of {} bytes has no header", raw.len())));
        }
        let version = u32_at(&raw, 0);
        if version != MFT_VERSION {
            return Err(invalid(format!("unsupported version {version}")));
        }
        let count = u32_at(&raw, 4) as usize;
        if count == 0 || count > MFT_MAX_ENTRIES {
            return Err(invalid(format!(
                "{count} entries (must be 1..={MFT_MAX_ENTRIES})"
            )));
        }
        let needed = MFT_HEADER_SIZE + count * MFT_ENTRY_SIZE;
        if raw.len() < needed {
            return Err(invalid(format!(
                "{count} entries need {needed} bytes, descriptor has {}",
                raw.len()
            )));
        }

        let mut entries = Vec::with_capacity(count);
        let mut names = HashSet::new();
        for index in 0..count {
            let base = MFT_HEADER_SIZE + index * MFT_ENTRY_SIZE;
            let entry = &raw[base..base + MFT_ENTRY_SIZE];

            let name_field = &entry[..MFT_NAME_SIZE];
            let len = name_field
                .iter()
                .position(|&b| b == 0)
                .ok_or_else(|| invalid(format!("entry {index} name is not NUL-terminated")))?;
            let name = std::str::from_utf8(&name_field[..len])
                .map_err(|_| invalid(format!("entry {index} name is not UTF-8")))?
                .to_string();

            let kind = DeviceKind::from(u32_at(entry, TYPE_OFFSET));
            if index == 0 && kind != DeviceKind::Reserved {
                return Err(invalid("entry 0 is not the reserved entry"));
            }
            if index > 0 && kind == DeviceKind::Reserved {
                return Err(invalid(format!("entry {index} uses the reserved type")));
            }
            if entry[ATTACHED_OFFSET] != 0 {
                return Err(invalid(format!("entry {index} is already attached")));
            }
            if index > 0 && !names.insert(name.clone()) {
                return Err(invalid(format!("duplicate device name {name:?}")));
            }

            entries.push(ManifestEntry { name, kind });
        }

        Ok(Self { entries, raw })
    }

    /// All entries, the reserved one included.
    pub fn entries(&self) -> &[ManifestEntry] {
        &self.entries
    }

    /// Declared devices, without the reserved first entry.
    pub fn devices(&self) -> &[ManifestEntry] {
        &self.entries[1..]
    }

    /// Look up a device by name, returning its manifest index.
    pub fn find(&self, name: &str) -> Option<(usize, &ManifestEntry)> {
        self.entries
            .iter()
            .enumerate()
            .skip(1)
            .find(|(_, e)| e.name == name)
    }

    /// Descriptor bytes as they are copied into guest memory.
    pub fn as_bytes(&self) -> &[u8] {
        &self.raw
    }
}

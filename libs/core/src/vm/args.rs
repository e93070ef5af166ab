//! Typed parsers for `key=value,...` command line arguments.

use std::collections::BTreeMap;
use std::str::FromStr;

use thiserror::Error;

use crate::hypervisor::VolumeFormat;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ArgError {
    #[error("malformed {kind} argument {input:?}: expected key=value pairs separated by ','")]
    Malformed { kind: &'static str, input: String },

    #[error("{kind} argument is missing required key {key:?}")]
    MissingKey { kind: &'static str, key: &'static str },

    #[error("{kind} argument has unknown key {key:?}")]
    UnknownKey { kind: &'static str, key: String },

    #[error("{kind} argument has duplicate key {key:?}")]
    DuplicateKey { kind: &'static str, key: String },

    #[error("invalid value {value:?} for {key}: {reason}")]
    InvalidValue {
        key: String,
        value: String,
        reason: String,
    },

    #[error("invalid size {0:?}")]
    InvalidSize(String),
}

/// Split `a=1,b=2` into a map, rejecting keys outside `allowed`.
fn split_pairs(
    kind: &'static str,
    input: &str,
    allowed: &[&str],
) -> Result<BTreeMap<String, String>, ArgError> {
    let mut pairs = BTreeMap::new();
    for part in input.split(',').filter(|p| !p.is_empty()) {
        let (key, value) = part.split_once('=').ok_or_else(|| ArgError::Malformed {
            kind,
            input: input.to_string(),
        })?;
        let key = key.trim();
        if !allowed.contains(&key) {
            return Err(ArgError::UnknownKey {
                kind,
                key: key.to_string(),
            });
        }
        if pairs
            .insert(key.to_string(), value.trim().to_string())
            .is_some()
        {
            return Err(ArgError::DuplicateKey {
                kind,
                key: key.to_string(),
            });
        }
    }
    Ok(pairs)
}

/// Parse a size such as `10G` or `512MiB`. Fractions are rejected.
///
/// Single letter and `iB` suffixes are binary, `KB`/`MB`/`GB`/`TB` are
/// decimal. No suffix means bytes.
pub fn parse_size(input: &str) -> Result<u64, ArgError> {
    let s = input.trim();
    let split = s
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(s.len());
    let (digits, unit) = s.split_at(split);
    if digits.is_empty() {
        return Err(ArgError::InvalidSize(input.to_string()));
    }
    let value: u64 = digits
        .parse()
        .map_err(|_| ArgError::InvalidSize(input.to_string()))?;

    let factor: u64 = match unit.trim().to_ascii_uppercase().as_str() {
        "" | "B" => 1,
        "K" | "KIB" => 1 << 10,
        "M" | "MIB" => 1 << 20,
        "G" | "GIB" => 1 << 30,
        "T" | "TIB" => 1 << 40,
        "KB" => 1_000,
        "MB" => 1_000_000,
        "GB" => 1_000_000_000,
        "TB" => 1_000_000_000_000,
        _ => return Err(ArgError::InvalidSize(input.to_string())),
    };
    value
        .checked_mul(factor)
        .ok_or_else(|| ArgError::InvalidSize(input.to_string()))
}

/// An extra disk attached to a VM: `name=data,size=2G,format=raw,bus=scsi`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiskArg {
    pub name: String,
    /// Size in bytes.
    pub size: u64,
    pub format: VolumeFormat,
    pub bus: String,
}

const DISK_BUSES: &[&str] = &["virtio", "scsi", "sata", "ide"];

impl DiskArg {
    pub fn parse(input: &str) -> Result<Self, ArgError> {
        let mut pairs = split_pairs("disk", input, &["name", "size", "format", "bus"])?;

        let name = pairs.remove("name").ok_or(ArgError::MissingKey {
            kind: "disk",
            key: "name",
        })?;
        if name.is_empty() || name.contains('/') {
            return Err(ArgError::InvalidValue {
                key: "name".to_string(),
                value: name,
                reason: "must be non-empty and must not contain '/'".to_string(),
            });
        }

        let size = pairs.remove("size").ok_or(ArgError::MissingKey {
            kind: "disk",
            key: "size",
        })?;
        let size = parse_size(&size)?;

        let format = match pairs.remove("format") {
            Some(f) => f.parse::<VolumeFormat>().map_err(|reason| ArgError::InvalidValue {
                key: "format".to_string(),
                value: f.clone(),
                reason,
            })?,
            None => VolumeFormat::Qcow2,
        };

        let bus = pairs.remove("bus").unwrap_or_else(|| "virtio".to_string());
        if !DISK_BUSES.contains(&bus.as_str()) {
            return Err(ArgError::InvalidValue {
                key: "bus".to_string(),
                value: bus,
                reason: format!("expected one of {}", DISK_BUSES.join(", ")),
            });
        }

        Ok(Self {
            name,
            size,
            format,
            bus,
        })
    }
}

impl FromStr for DiskArg {
    type Err = ArgError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

/// Device name prefix of `bus`. SCSI and SATA share `sd`.
pub(crate) fn bus_prefix(bus: &str) -> &'static str {
    match bus {
        "virtio" => "vd",
        "ide" => "hd",
        _ => "sd",
    }
}

/// Guest device name for the `index`-th disk on `bus` (`vda`, `sdb`, ...).
pub(crate) fn target_dev(bus: &str, index: usize) -> String {
    let prefix = bus_prefix(bus);
    let mut suffix = String::new();
    let mut n = index;
    loop {
        suffix.insert(0, (b'a' + (n % 26) as u8) as char);
        if n < 26 {
            break;
        }
        n = n / 26 - 1;
    }
    format!("{prefix}{suffix}")
}

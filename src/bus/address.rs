use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use crate::error::Error;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Transport {
    /// Listen-only: a fresh socket is created inside this directory.
    TmpDir(PathBuf),
    Path(PathBuf),
}

/// A `unix:` bus address such as `unix:path=/tmp/dbus-x,guid=...`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BusAddress {
    pub transport: Transport,
    pub guid: Option<String>,
}

impl BusAddress {
    pub fn path(path: impl Into<PathBuf>, guid: Option<String>) -> Self {
        Self {
            transport: Transport::Path(path.into()),
            guid,
        }
    }

    pub fn socket_path(&self) -> Option<&PathBuf> {
        match &self.transport {
            Transport::Path(path) => Some(path),
            Transport::TmpDir(_) => None,
        }
    }
}

impl FromStr for BusAddress {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let rest = s
            .strip_prefix("unix:")
            .ok_or_else(|| Error::Address(format!("unsupported transport in {s:?}")))?;

        let mut transport = None;
        let mut guid = None;
        for pair in rest.split(',').filter(|pair| !pair.is_empty()) {
            let (key, value) = pair
                .split_once('=')
                .ok_or_else(|| Error::Address(format!("malformed key/value {pair:?}")))?;
            match key {
                "path" => transport = Some(Transport::Path(PathBuf::from(value))),
                "tmpdir" => transport = Some(Transport::TmpDir(PathBuf::from(value))),
                "guid" => {
                    if !is_guid(value) {
                        return Err(Error::Address(format!("invalid guid {value:?}")));
                    }
                    guid = Some(value.to_string());
                }
                other => return Err(Error::Address(format!("unknown key {other:?}"))),
            }
        }

        let transport =
            transport.ok_or_else(|| Error::Address(format!("no path or tmpdir in {s:?}")))?;
        Ok(Self { transport, guid })
    }
}

impl fmt::Display for BusAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.transport {
            Transport::TmpDir(dir) => write!(f, "unix:tmpdir={}", dir.display())?,
            Transport::Path(path) => write!(f, "unix:path={}", path.display())?,
        }
        if let Some(guid) = &self.guid {
            write!(f, ",guid={guid}")?;
        }
        Ok(())
    }
}

/// Fresh server guid: 32 lowercase hex digits.
pub fn generate_guid() -> String {
    zbus::Guid::generate().to_string()
}

fn is_guid(value: &str) -> bool {
    value.len() == 32 && value.chars().all(|c| c.is_ascii_hexdigit())
}

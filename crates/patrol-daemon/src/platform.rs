//! Host platform primitives consumed by the request handlers.
//!
//! The dispatcher talks to the machine through [`PlatformOps`] with typed
//! inputs and typed results. The portable pieces (file operations, system
//! info, power requests handed to the init system) are implemented in
//! [`HostPlatform`]; the register-level and OS-database primitives (MSR,
//! registry, CIM/WMI) are vendor integrations that plug in behind the
//! same trait and report unsupported here.

use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

/// Failures a platform primitive can report. These map onto response
/// result codes; they never abort the connection.
#[derive(Debug, thiserror::Error)]
pub enum PlatformError {
    /// The primitive is not available on this host.
    #[error("operation not supported on this host")]
    Unsupported,

    /// The named object does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// The daemon lacks access to the object.
    #[error("access denied: {0}")]
    AccessDenied(String),

    /// The request was malformed for this primitive.
    #[error("invalid parameter: {0}")]
    InvalidParam(String),

    /// The operation ran and failed.
    #[error("{0}")]
    Failed(String),
}

impl PlatformError {
    fn from_io(err: &std::io::Error, what: &str) -> Self {
        match err.kind() {
            std::io::ErrorKind::NotFound => Self::NotFound(what.to_string()),
            std::io::ErrorKind::PermissionDenied => Self::AccessDenied(what.to_string()),
            _ => Self::Failed(format!("{what}: {err}")),
        }
    }
}

/// Result alias for platform calls.
pub type PlatformResult<T> = Result<T, PlatformError>;

/// Registry value types, mirroring the native database.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RegValueType {
    /// 32-bit integer.
    Dword,
    /// 64-bit integer.
    Qword,
    /// String.
    Sz,
    /// Environment-expanded string.
    ExpandSz,
    /// Raw bytes.
    Binary,
    /// String list.
    MultiSz,
}

/// A typed registry value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum RegValue {
    /// 32-bit integer.
    Dword(u32),
    /// 64-bit integer.
    Qword(u64),
    /// String (plain or environment-expanded).
    Sz(String),
    /// Raw bytes.
    Binary(Vec<u8>),
    /// String list.
    MultiSz(Vec<String>),
}

/// One property of one WMI query row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WmiProperty {
    /// Property name.
    pub name: String,
    /// Property value, stringified.
    pub value: String,
}

/// One row of a WMI query result.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct WmiRow {
    /// The row's properties.
    pub properties: Vec<WmiProperty>,
}

/// System power transitions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PowerAction {
    /// Power the machine off.
    Shutdown,
    /// Reboot.
    Restart,
    /// Suspend to RAM.
    Sleep,
    /// Suspend to disk.
    Hibernate,
    /// End the interactive session.
    Logoff,
    /// Lock the interactive session.
    Lock,
    /// Cancel a pending shutdown.
    Cancel,
}

/// Static machine facts for the system-info family.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct SystemInfo {
    /// Host name.
    pub machine_name: String,
    /// Operating system identification.
    pub os_version: String,
    /// Total physical memory in bytes, zero when unknown.
    pub total_memory: u64,
    /// Available physical memory in bytes, zero when unknown.
    pub available_memory: u64,
    /// Logical CPU count.
    pub cpu_count: u32,
}

/// Typed host primitives the dispatcher invokes.
///
/// Enumeration-style primitives (WMI) must pair every begin with an end
/// on all paths, including failures.
pub trait PlatformOps: Send + Sync {
    /// Reads a model-specific register, returning (low, high).
    fn msr_read(&self, msr: u32) -> PlatformResult<(u32, u32)>;

    /// Writes a model-specific register.
    fn msr_write(&self, msr: u32, data_low: u32, data_high: u32) -> PlatformResult<()>;

    /// Reads a registry value.
    fn registry_read(
        &self,
        key_path: &str,
        value_name: &str,
        value_type: RegValueType,
    ) -> PlatformResult<RegValue>;

    /// Writes a registry value.
    fn registry_write(
        &self,
        key_path: &str,
        value_name: &str,
        value: &RegValue,
    ) -> PlatformResult<()>;

    /// Deletes a registry value.
    fn registry_delete(&self, key_path: &str, value_name: &str) -> PlatformResult<()>;

    /// Runs a WMI query, optionally projecting one property.
    fn wmi_query(
        &self,
        namespace_path: &str,
        query: &str,
        property: &str,
    ) -> PlatformResult<Vec<WmiRow>>;

    /// Deletes a file.
    fn file_delete(&self, path: &Path) -> PlatformResult<()>;

    /// Renames a file within a filesystem.
    fn file_rename(&self, from: &Path, to: &Path) -> PlatformResult<()>;

    /// Copies a file.
    fn file_copy(&self, from: &Path, to: &Path) -> PlatformResult<()>;

    /// Moves a file, copying across filesystems when needed.
    fn file_move(&self, from: &Path, to: &Path) -> PlatformResult<()>;

    /// Requests a power transition.
    fn power(
        &self,
        action: PowerAction,
        timeout_seconds: u32,
        force: bool,
        reason: &str,
    ) -> PlatformResult<()>;

    /// Collects static machine facts.
    fn system_info(&self) -> PlatformResult<SystemInfo>;
}

/// Default host implementation.
#[derive(Debug, Default)]
pub struct HostPlatform;

impl PlatformOps for HostPlatform {
    fn msr_read(&self, _msr: u32) -> PlatformResult<(u32, u32)> {
        Err(PlatformError::Unsupported)
    }

    fn msr_write(&self, _msr: u32, _data_low: u32, _data_high: u32) -> PlatformResult<()> {
        Err(PlatformError::Unsupported)
    }

    fn registry_read(
        &self,
        _key_path: &str,
        _value_name: &str,
        _value_type: RegValueType,
    ) -> PlatformResult<RegValue> {
        Err(PlatformError::Unsupported)
    }

    fn registry_write(
        &self,
        _key_path: &str,
        _value_name: &str,
        _value: &RegValue,
    ) -> PlatformResult<()> {
        Err(PlatformError::Unsupported)
    }

    fn registry_delete(&self, _key_path: &str, _value_name: &str) -> PlatformResult<()> {
        Err(PlatformError::Unsupported)
    }

    fn wmi_query(
        &self,
        _namespace_path: &str,
        _query: &str,
        _property: &str,
    ) -> PlatformResult<Vec<WmiRow>> {
        Err(PlatformError::Unsupported)
    }

    fn file_delete(&self, path: &Path) -> PlatformResult<()> {
        info!(path = %path.display(), "file delete");
        std::fs::remove_file(path)
            .map_err(|e| PlatformError::from_io(&e, &path.display().to_string()))
    }

    fn file_rename(&self, from: &Path, to: &Path) -> PlatformResult<()> {
        info!(from = %from.display(), to = %to.display(), "file rename");
        std::fs::rename(from, to)
            .map_err(|e| PlatformError::from_io(&e, &from.display().to_string()))
    }

    fn file_copy(&self, from: &Path, to: &Path) -> PlatformResult<()> {
        info!(from = %from.display(), to = %to.display(), "file copy");
        std::fs::copy(from, to)
            .map(|_| ())
            .map_err(|e| PlatformError::from_io(&e, &from.display().to_string()))
    }

    fn file_move(&self, from: &Path, to: &Path) -> PlatformResult<()> {
        info!(from = %from.display(), to = %to.display(), "file move");
        match std::fs::rename(from, to) {
            Ok(()) => Ok(()),
            // Rename fails across filesystems; fall back to copy+delete.
            Err(e) if e.raw_os_error() == Some(nix::libc::EXDEV) => {
                std::fs::copy(from, to)
                    .map_err(|e| PlatformError::from_io(&e, &from.display().to_string()))?;
                std::fs::remove_file(from)
                    .map_err(|e| PlatformError::from_io(&e, &from.display().to_string()))
            }
            Err(e) => Err(PlatformError::from_io(&e, &from.display().to_string())),
        }
    }

    fn power(
        &self,
        action: PowerAction,
        timeout_seconds: u32,
        force: bool,
        reason: &str,
    ) -> PlatformResult<()> {
        warn!(
            ?action,
            timeout_seconds, force, reason, "power transition requested but not wired on this host"
        );
        Err(PlatformError::Unsupported)
    }

    fn system_info(&self) -> PlatformResult<SystemInfo> {
        let machine_name = nix::unistd::gethostname()
            .ok()
            .and_then(|h| h.into_string().ok())
            .unwrap_or_default();

        let os_version = match nix::sys::utsname::uname() {
            Ok(uts) => format!(
                "{} {}",
                uts.sysname().to_string_lossy(),
                uts.release().to_string_lossy()
            ),
            Err(_) => std::env::consts::OS.to_string(),
        };

        let (total_memory, available_memory) = read_meminfo().unwrap_or((0, 0));

        #[allow(clippy::cast_possible_truncation)] // CPU counts fit easily
        let cpu_count = std::thread::available_parallelism()
            .map(|n| n.get() as u32)
            .unwrap_or(1);

        Ok(SystemInfo {
            machine_name,
            os_version,
            total_memory,
            available_memory,
            cpu_count,
        })
    }
}

/// Parses `MemTotal` and `MemAvailable` out of `/proc/meminfo`, in bytes.
fn read_meminfo() -> Option<(u64, u64)> {
    let text = std::fs::read_to_string("/proc/meminfo").ok()?;
    let field = |name: &str| -> Option<u64> {
        text.lines()
            .find(|line| line.starts_with(name))?
            .split_whitespace()
            .nth(1)?
            .parse::<u64>()
            .ok()
            .map(|kib| kib * 1024)
    };
    Some((field("MemTotal:")?, field("MemAvailable:").unwrap_or(0)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn file_lifecycle_round_trip() {
        let platform = HostPlatform;
        let dir = tempfile::tempdir().unwrap();
        let a = dir.path().join("a.txt");
        let b = dir.path().join("b.txt");
        let c = dir.path().join("c.txt");

        std::fs::write(&a, b"contents").unwrap();

        platform.file_copy(&a, &b).unwrap();
        assert_eq!(std::fs::read(&b).unwrap(), b"contents");

        platform.file_rename(&b, &c).unwrap();
        assert!(!b.exists());

        platform.file_move(&c, &b).unwrap();
        assert!(b.exists());

        platform.file_delete(&a).unwrap();
        platform.file_delete(&b).unwrap();
        assert!(!a.exists());
    }

    #[test]
    fn missing_file_is_not_found() {
        let platform = HostPlatform;
        let dir = tempfile::tempdir().unwrap();
        let err = platform
            .file_delete(&dir.path().join("absent"))
            .unwrap_err();
        assert!(matches!(err, PlatformError::NotFound(_)));
    }

    #[test]
    fn register_primitives_are_unsupported_here() {
        let platform = HostPlatform;
        assert!(matches!(
            platform.msr_read(0x1A2),
            Err(PlatformError::Unsupported)
        ));
        assert!(matches!(
            platform.registry_delete("HKLM\\Software\\Patrol", "Mode"),
            Err(PlatformError::Unsupported)
        ));
        assert!(matches!(
            platform.wmi_query("ROOT\\CIMV2", "SELECT * FROM Win32_Fan", ""),
            Err(PlatformError::Unsupported)
        ));
    }

    #[test]
    fn system_info_reports_cpus() {
        let info = HostPlatform.system_info().unwrap();
        assert!(info.cpu_count >= 1);
        assert!(!info.os_version.is_empty());
    }
}

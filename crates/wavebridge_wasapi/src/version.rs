//! Windows Version Detection
//!
//! Two runtime feature gates hang off the OS build number:
//!
//! - *Automatic stream routing* (default-endpoint streams survive device
//!   changes) needs Windows 10 build 14393.
//! - *Process loopback capture* is documented for build 20348, but works
//!   from 19041 on; the implementation relaxes to the observed minimum.
//!
//! Uses RtlGetVersion because GetVersionEx reports manifest-compatibility
//! versions rather than the running OS. Probed once and cached.

use std::sync::OnceLock;

/// Windows version triple
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowsVersion {
    pub major: u32,
    pub minor: u32,
    pub build: u32,
}

impl WindowsVersion {
    /// Windows 10 Anniversary Update (1607)
    pub const MIN_AUTO_ROUTING_BUILD: u32 = 14393;

    /// Build the process-loopback activation params are documented for
    pub const DOCUMENTED_PROCESS_LOOPBACK_BUILD: u32 = 20348;

    /// Build process loopback actually works from
    pub const MIN_PROCESS_LOOPBACK_BUILD: u32 = 19041;

    /// True OS version via RtlGetVersion
    #[cfg(target_os = "windows")]
    pub fn current() -> Option<WindowsVersion> {
        use std::mem;
        use windows::Win32::System::LibraryLoader::{GetModuleHandleW, GetProcAddress};
        use windows::Win32::System::SystemInformation::OSVERSIONINFOEXW;

        // SAFETY: RtlGetVersion fills the struct it is handed; the transmute
        // matches the documented ntdll export signature
        unsafe {
            let ntdll = GetModuleHandleW(windows::core::w!("ntdll.dll")).ok()?;
            let proc = GetProcAddress(ntdll, windows::core::s!("RtlGetVersion"))?;

            type RtlGetVersionFn = unsafe extern "system" fn(*mut OSVERSIONINFOEXW) -> i32;
            let rtl_get_version: RtlGetVersionFn = mem::transmute(proc);

            let mut info: OSVERSIONINFOEXW = mem::zeroed();
            info.dwOSVersionInfoSize = mem::size_of::<OSVERSIONINFOEXW>() as u32;

            if rtl_get_version(&mut info) != 0 {
                return None;
            }

            Some(WindowsVersion {
                major: info.dwMajorVersion,
                minor: info.dwMinorVersion,
                build: info.dwBuildNumber,
            })
        }
    }

    #[cfg(not(target_os = "windows"))]
    pub fn current() -> Option<WindowsVersion> {
        None
    }

    pub fn supports_automatic_stream_routing(&self) -> bool {
        self.major > 10 || (self.major == 10 && self.build >= Self::MIN_AUTO_ROUTING_BUILD)
    }

    pub fn supports_process_loopback(&self) -> bool {
        self.major > 10 || (self.major == 10 && self.build >= Self::MIN_PROCESS_LOOPBACK_BUILD)
    }
}

impl std::fmt::Display for WindowsVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{} (Build {})", self.major, self.minor, self.build)
    }
}

fn cached() -> Option<WindowsVersion> {
    static VERSION: OnceLock<Option<WindowsVersion>> = OnceLock::new();
    *VERSION.get_or_init(WindowsVersion::current)
}

/// Cached automatic-stream-routing gate
pub fn can_automatic_stream_routing() -> bool {
    let ret = cached().is_some_and(|v| v.supports_automatic_stream_routing());
    tracing::trace!("Automatic stream routing support: {ret}");
    ret
}

/// Cached process-loopback gate
pub fn can_process_loopback() -> bool {
    let ret = cached().is_some_and(|v| v.supports_process_loopback());
    tracing::trace!("Process loopback support: {ret}");
    ret
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_auto_routing_gate() {
        let pre = WindowsVersion {
            major: 10,
            minor: 0,
            build: 10586,
        };
        assert!(!pre.supports_automatic_stream_routing());

        let exact = WindowsVersion {
            major: 10,
            minor: 0,
            build: 14393,
        };
        assert!(exact.supports_automatic_stream_routing());

        let eleven = WindowsVersion {
            major: 11,
            minor: 0,
            build: 0,
        };
        assert!(eleven.supports_automatic_stream_routing());
    }

    #[test]
    fn test_process_loopback_gate_relaxed() {
        // 19041 is accepted even though the header documents 20348
        let relaxed = WindowsVersion {
            major: 10,
            minor: 0,
            build: WindowsVersion::MIN_PROCESS_LOOPBACK_BUILD,
        };
        assert!(relaxed.supports_process_loopback());

        let before = WindowsVersion {
            major: 10,
            minor: 0,
            build: 19040,
        };
        assert!(!before.supports_process_loopback());

        assert!(
            WindowsVersion::MIN_PROCESS_LOOPBACK_BUILD
                < WindowsVersion::DOCUMENTED_PROCESS_LOOPBACK_BUILD
        );
    }

    #[test]
    #[cfg(target_os = "windows")]
    fn test_current_version_detection() {
        let version = WindowsVersion::current().expect("should detect version");
        assert!(version.major >= 10);
        println!("Detected: {version}");
    }

    #[test]
    #[cfg(not(target_os = "windows"))]
    fn test_current_version_non_windows() {
        assert!(WindowsVersion::current().is_none());
        assert!(!can_automatic_stream_routing());
        assert!(!can_process_loopback());
    }
}

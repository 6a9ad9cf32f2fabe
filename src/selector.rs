//! One-shot choice between the GPIO character device and the sysfs interface.
//!
//! The decision is made once at startup from the running kernel release and
//! whether this build can drive the character device at all. Reloading the
//! relay configuration never revisits it.

use log::{info, warn};
use std::fs;
use std::path::Path;

use crate::config::{BackendMode, BackendPreference};

/// Oldest kernel major version on which the line-descriptor backend is used.
pub const LINE_DESCRIPTOR_MIN_KERNEL_MAJOR: u32 = 6;

const KERNEL_RELEASE_PATH: &str = "/proc/sys/kernel/osrelease";
const GPIO_DEVICE_DIR: &str = "/dev";

/// Major version from a release string such as `6.1.21-v8+`.
pub fn kernel_major(release: &str) -> Option<u32> {
    let major = release.trim().split('.').next()?;
    if major.is_empty() || !major.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    major.parse().ok()
}

pub fn kernel_release() -> Option<String> {
    fs::read_to_string(KERNEL_RELEASE_PATH)
        .ok()
        .map(|release| release.trim().to_string())
}

/// Whether this build carries libgpiod support and the host exposes a gpiochip.
pub fn line_descriptor_available() -> bool {
    cfg!(feature = "hardware-gpio") && has_gpiochip(Path::new(GPIO_DEVICE_DIR))
}

fn has_gpiochip(dev: &Path) -> bool {
    fs::read_dir(dev)
        .map(|entries| {
            entries
                .filter_map(Result::ok)
                .any(|entry| entry.file_name().to_string_lossy().starts_with("gpiochip"))
        })
        .unwrap_or(false)
}

/// Applies the selection policy to already-gathered facts.
pub fn decide(
    preference: BackendPreference,
    release: Option<&str>,
    driver_available: bool,
) -> BackendMode {
    match preference {
        BackendPreference::Path => BackendMode::Path,
        BackendPreference::LineDescriptor if driver_available => BackendMode::LineDescriptor,
        BackendPreference::LineDescriptor => {
            warn!("line-descriptor backend requested but unavailable, using path backend");
            BackendMode::Path
        }
        BackendPreference::Auto => match release.and_then(kernel_major) {
            None => {
                warn!("failed to determine kernel version ({release:?}), using path backend");
                BackendMode::Path
            }
            Some(major) if major >= LINE_DESCRIPTOR_MIN_KERNEL_MAJOR && driver_available => {
                BackendMode::LineDescriptor
            }
            Some(_) => BackendMode::Path,
        },
    }
}

/// Probes the host and fixes the backend for the lifetime of the process.
pub fn select(preference: BackendPreference) -> BackendMode {
    let release = kernel_release();
    let available = line_descriptor_available();
    let mode = decide(preference, release.as_deref(), available);
    info!(
        "kernel {}, libgpiod {}, selected {mode} backend",
        release.as_deref().unwrap_or("unknown"),
        if available { "available" } else { "unavailable" }
    );
    mode
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_kernel_major() {
        assert_eq!(kernel_major("6.1.21-v8+"), Some(6));
        assert_eq!(kernel_major("5.15.0-91-generic\n"), Some(5));
        assert_eq!(kernel_major("10.0"), Some(10));
        assert_eq!(kernel_major(""), None);
        assert_eq!(kernel_major("linux-6.1"), None);
        assert_eq!(kernel_major("v6.1"), None);
    }

    #[test]
    fn auto_requires_new_kernel_and_driver() {
        let auto = BackendPreference::Auto;
        assert_eq!(decide(auto, Some("6.1.0"), true), BackendMode::LineDescriptor);
        assert_eq!(decide(auto, Some("10.2.1"), true), BackendMode::LineDescriptor);
        assert_eq!(decide(auto, Some("5.15.0"), true), BackendMode::Path);
        assert_eq!(decide(auto, Some("6.1.0"), false), BackendMode::Path);
    }

    #[test]
    fn unparseable_release_falls_back_to_path() {
        let auto = BackendPreference::Auto;
        assert_eq!(decide(auto, Some("garbage"), true), BackendMode::Path);
        assert_eq!(decide(auto, None, true), BackendMode::Path);
    }

    #[test]
    fn explicit_preference_wins_when_possible() {
        assert_eq!(
            decide(BackendPreference::Path, Some("6.6.0"), true),
            BackendMode::Path
        );
        assert_eq!(
            decide(BackendPreference::LineDescriptor, Some("4.19.0"), true),
            BackendMode::LineDescriptor
        );
        assert_eq!(
            decide(BackendPreference::LineDescriptor, Some("6.6.0"), false),
            BackendMode::Path
        );
    }

    #[test]
    fn gpiochip_detection_scans_directory() {
        let dir = tempfile::tempdir().unwrap();
        assert!(!has_gpiochip(dir.path()));
        fs::write(dir.path().join("gpiochip0"), "").unwrap();
        assert!(has_gpiochip(dir.path()));
        assert!(!has_gpiochip(&dir.path().join("missing")));
    }
}

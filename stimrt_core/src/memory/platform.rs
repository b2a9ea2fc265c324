// Cross-platform shared memory path abstraction
//
// Linux: /dev/shm/stimrt (tmpfs - RAM-backed)
// macOS: /tmp/stimrt
// Windows: %TEMP%\stimrt

use std::path::{Path, PathBuf};

/// Get the base directory for stimrt shared memory
///
/// - Linux: `/dev/shm/stimrt` (tmpfs)
/// - macOS: `/tmp/stimrt` (no /dev/shm)
/// - Windows: `%TEMP%\stimrt`
pub fn shm_base_dir() -> PathBuf {
    #[cfg(target_os = "linux")]
    {
        PathBuf::from("/dev/shm/stimrt")
    }

    #[cfg(target_os = "macos")]
    {
        PathBuf::from("/tmp/stimrt")
    }

    #[cfg(target_os = "windows")]
    {
        std::env::temp_dir().join("stimrt")
    }

    #[cfg(not(any(target_os = "linux", target_os = "macos", target_os = "windows")))]
    {
        PathBuf::from("/tmp/stimrt")
    }
}

/// Directory holding every region of one session
pub fn shm_session_dir(root: &Path, session: &str) -> PathBuf {
    root.join("sessions").join(session)
}

/// Directory holding the attribute rings of a session
pub fn shm_attributes_dir(session_dir: &Path) -> PathBuf {
    session_dir.join("attributes")
}

/// Directory holding the participant channel queues of a session
pub fn shm_channels_dir(session_dir: &Path) -> PathBuf {
    session_dir.join("channels")
}

/// Convert a logical name into a safe file name
pub fn safe_name(name: &str) -> String {
    name.replace(['/', ':', '\\', ' '], "_")
}

/// Check if we're running on a platform with true shared memory (tmpfs)
pub fn has_native_shm() -> bool {
    cfg!(target_os = "linux")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_session_paths() {
        let base = shm_base_dir();
        assert!(!base.as_os_str().is_empty());

        let session = shm_session_dir(&base, "test-session");
        assert!(session.starts_with(&base));
        assert!(session.to_string_lossy().contains("test-session"));

        assert!(shm_attributes_dir(&session).starts_with(&session));
        assert!(shm_channels_dir(&session).starts_with(&session));
    }

    #[test]
    fn test_safe_name() {
        assert_eq!(safe_name("camera/frame:0"), "camera_frame_0");
        assert_eq!(safe_name("plain"), "plain");
    }
}

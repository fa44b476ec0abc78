//! Per-platform locations: config and data directories, mpv IPC endpoints and
//! the mpv executable.

use std::path::{Path, PathBuf};

const APP_DIR: &str = "streamradio";

#[cfg(unix)]
const MPV_BINARY: &str = "mpv";
#[cfg(windows)]
const MPV_BINARY: &str = "mpv.exe";

/// IPC endpoint name for the mpv process backing one audio resource.
/// Each resource gets its own process, so the name carries the resource id.
#[cfg(unix)]
pub fn mpv_socket_name(resource_id: u64) -> String {
    std::env::temp_dir()
        .join(format!("streamradio-mpv-{}-{}.sock", std::process::id(), resource_id))
        .display()
        .to_string()
}

#[cfg(windows)]
pub fn mpv_socket_name(resource_id: u64) -> String {
    format!("streamradio-mpv-{}-{}", std::process::id(), resource_id)
}

/// The `--input-ipc-server` argument for a socket name.  On Windows mpv
/// wants the full named-pipe path.
pub fn mpv_socket_arg(socket_name: &str) -> String {
    if cfg!(windows) {
        format!("--input-ipc-server=\\\\.\\pipe\\{}", socket_name)
    } else {
        format!("--input-ipc-server={}", socket_name)
    }
}

/// `~/.local/share/streamradio` on unix (macOS included), the local app-data
/// dir on Windows.
pub fn data_dir() -> PathBuf {
    let base = if cfg!(unix) {
        dirs::home_dir().map(|home| home.join(".local").join("share"))
    } else {
        dirs::data_local_dir()
    };
    base.unwrap_or_else(std::env::temp_dir).join(APP_DIR)
}

/// `~/.config/streamradio` on unix, the roaming config dir on Windows.
pub fn config_dir() -> PathBuf {
    let base = if cfg!(unix) {
        dirs::home_dir().map(|home| home.join(".config"))
    } else {
        dirs::config_dir()
    };
    base.unwrap_or_else(|| PathBuf::from(".")).join(APP_DIR)
}

/// Find the mpv binary used as playback hardware.
///
/// Order: `MPV_PATH`, beside the current exe, then `PATH`.
pub fn find_mpv_binary() -> Option<PathBuf> {
    if let Some(explicit) = std::env::var_os("MPV_PATH").map(PathBuf::from) {
        if explicit.exists() {
            return Some(explicit);
        }
    }

    let beside_exe = std::env::current_exe()
        .ok()
        .and_then(|exe| exe.parent().map(|dir| dir.join(MPV_BINARY)))
        .filter(|p| p.exists());

    beside_exe.or_else(|| {
        let path = std::env::var_os("PATH")?;
        std::env::split_paths(&path)
            .map(|dir| dir.join(MPV_BINARY))
            .find(|p| is_file(p))
    })
}

fn is_file(path: &Path) -> bool {
    path.metadata().map(|m| m.is_file()).unwrap_or(false)
}

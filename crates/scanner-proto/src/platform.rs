use std::path::PathBuf;

pub const DAEMON_TCP_PORT: u16 = 9877;
/// Which mpv instance a socket belongs to.  The scanner and the ambient
/// player each drive their own process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MpvRole {
    Scanner,
    Ambient,
}

impl MpvRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            MpvRole::Scanner => "scanner",
            MpvRole::Ambient => "ambient",
        }
    }
}

#[cfg(unix)]
pub fn mpv_socket_name(role: MpvRole) -> String {
    format!(
        "{}/scannerd-{}-mpv.sock",
        std::env::temp_dir().display(),
        role.as_str()
    )
}

#[cfg(windows)]
pub fn mpv_socket_name(role: MpvRole) -> String {
    format!("scannerd-{}-mpv", role.as_str())
}

#[cfg(unix)]
pub fn mpv_socket_arg(role: MpvRole) -> String {
    format!("--input-ipc-server={}", mpv_socket_name(role))
}

#[cfg(windows)]
pub fn mpv_socket_arg(role: MpvRole) -> String {
    format!("--input-ipc-server=\\\\.\\pipe\\{}", mpv_socket_name(role))
}

pub fn data_dir() -> PathBuf {
    // ~/.local/share/scanner/ on macOS too, for consistency with Linux
    #[cfg(unix)]
    {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("/tmp"))
            .join(".local")
            .join("share")
            .join("scanner")
    }
    #[cfg(windows)]
    {
        dirs::data_local_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("scanner")
    }
}

pub fn config_dir() -> PathBuf {
    #[cfg(unix)]
    {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".config")
            .join("scanner")
    }
    #[cfg(windows)]
    {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("scanner")
    }
}

#[cfg(unix)]
fn mpv_binary_names() -> &'static [&'static str] {
    &["mpv"]
}

#[cfg(windows)]
fn mpv_binary_names() -> &'static [&'static str] {
    &["mpv.exe", "mpv"]
}

fn find_beside_exe(names: &[&str]) -> Option<PathBuf> {
    let current_exe = std::env::current_exe().ok()?;
    let dir = current_exe.parent()?;
    names
        .iter()
        .flat_map(|name| [dir.join(name), dir.join("external").join(name)])
        .find(|p| p.exists())
}

fn find_on_path(names: &[&str]) -> Option<PathBuf> {
    let path = std::env::var_os("PATH")?;
    std::env::split_paths(&path)
        .flat_map(|dir| names.iter().map(move |name| dir.join(name)))
        .find(|p| p.exists())
}

/// Find the mpv binary.
///
/// Searches in order:
/// 1. MPV_PATH environment variable
/// 2. Beside the current executable (or its `external/` folder)
/// 3. PATH
pub fn find_mpv_binary() -> Option<PathBuf> {
    if let Ok(p) = std::env::var("MPV_PATH") {
        let path = PathBuf::from(p);
        if path.exists() {
            return Some(path);
        }
    }

    find_beside_exe(mpv_binary_names()).or_else(|| find_on_path(mpv_binary_names()))
}

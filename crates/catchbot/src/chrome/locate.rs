//! Browser executable discovery.

use std::path::{Path, PathBuf};

/// Binary names tried on `PATH` after the fixed install locations.
const PATH_NAMES: &[&str] = &[
    "google-chrome",
    "google-chrome-stable",
    "chromium",
    "chromium-browser",
    "chrome",
];

/// Platform-conventional install locations, in probe order.
pub fn install_candidates() -> Vec<PathBuf> {
    let home = dirs::home_dir();

    if cfg!(target_os = "windows") {
        let mut paths = vec![
            PathBuf::from(r"C:\Program Files\Google\Chrome\Application\chrome.exe"),
            PathBuf::from(r"C:\Program Files (x86)\Google\Chrome\Application\chrome.exe"),
        ];
        if let Some(home) = home {
            paths.push(
                home.join("AppData")
                    .join("Local")
                    .join("Google")
                    .join("Chrome")
                    .join("Application")
                    .join("chrome.exe"),
            );
        }
        paths
    } else if cfg!(target_os = "macos") {
        let mut paths = vec![
            PathBuf::from("/Applications/Google Chrome.app/Contents/MacOS/Google Chrome"),
            PathBuf::from("/Applications/Chromium.app/Contents/MacOS/Chromium"),
        ];
        if let Some(home) = home {
            paths.push(home.join("Applications/Google Chrome.app/Contents/MacOS/Google Chrome"));
        }
        paths
    } else {
        vec![
            PathBuf::from("/usr/bin/google-chrome"),
            PathBuf::from("/usr/bin/google-chrome-stable"),
            PathBuf::from("/usr/bin/chromium"),
            PathBuf::from("/usr/bin/chromium-browser"),
            PathBuf::from("/snap/bin/chromium"),
        ]
    }
}

/// First existing path among `candidates`.
pub fn first_existing<P: AsRef<Path>>(candidates: &[P]) -> Option<PathBuf> {
    candidates
        .iter()
        .map(AsRef::as_ref)
        .find(|p| p.is_file())
        .map(Path::to_path_buf)
}

/// Find the browser executable.
///
/// Order: explicit override, fixed install locations, then `PATH`.
pub fn locate(explicit: Option<&Path>) -> Option<PathBuf> {
    if let Some(path) = explicit {
        if path.is_file() {
            return Some(path.to_path_buf());
        }
        tracing::warn!(path = %path.display(), "configured CHROME_PATH does not exist");
    }

    if let Some(found) = first_existing(&install_candidates()) {
        return Some(found);
    }

    PATH_NAMES.iter().find_map(|name| which::which(name).ok())
}

/// Number of places `locate` looks, for error reporting.
pub fn searched_count(explicit: Option<&Path>) -> usize {
    usize::from(explicit.is_some()) + install_candidates().len() + PATH_NAMES.len()
}

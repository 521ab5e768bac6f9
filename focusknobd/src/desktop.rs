//! Hand-offs to the desktop session.

use tokio::process::Command;
use tracing::{info, warn};

#[cfg(target_os = "macos")]
const OPENER: &str = "open";
#[cfg(not(target_os = "macos"))]
const OPENER: &str = "xdg-open";

/// Open `url` in the default browser. The opener is not waited on.
pub async fn open_url(url: &str) {
    match Command::new(OPENER)
        .arg(url)
        .stdin(std::process::Stdio::null())
        .stdout(std::process::Stdio::null())
        .stderr(std::process::Stdio::null())
        .spawn()
    {
        Ok(_) => info!("Opened: {}", url),
        Err(e) => warn!("Failed to run {} for {}: {}", OPENER, url, e),
    }
}

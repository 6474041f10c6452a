//! Transport selection
//!
//! Picks the transport once at startup: the TUI environment variable, then
//! parent-process inspection, then explicit flags, and finally the local
//! stdio default. Inspection failures degrade silently to local.

pub mod stdio;
pub mod tcp;

pub use stdio::StdioTransport;
pub use tcp::TcpTransport;

/// Environment variable set by the TUI launcher.
pub const TUI_MODE_ENV: &str = "DSHIELD_TUI_MODE";

/// Environment variable forcing TCP mode.
pub const TCP_MODE_ENV: &str = "DSHIELD_MCP_TCP_MODE";

/// Process names and command-line fragments that mark a TUI parent.
const TUI_INDICATORS: [&str; 6] = ["tui", "textual", "rich", "curses", "dshield-mcp-tui", "mcp-tui"];

/// Terminal multiplexers whose presence implies a managed session.
const MULTIPLEXERS: [&str; 3] = ["tmux", "screen", "byobu"];

/// The selected transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportMode {
    Stdio,
    Tcp,
}

/// Truthiness for the transport environment variables.
pub fn is_truthy(value: &str) -> bool {
    matches!(value.to_lowercase().as_str(), "true" | "1" | "yes")
}

/// Whether a parent process name/cmdline looks like a TUI launcher.
pub fn looks_like_tui(name: &str, cmdline: &str) -> bool {
    let name = name.to_lowercase();
    let cmdline = cmdline.to_lowercase();
    TUI_INDICATORS
        .iter()
        .any(|marker| name.contains(marker) || cmdline.contains(marker))
        || MULTIPLEXERS.iter().any(|mux| cmdline.contains(mux))
}

/// Inspect the parent process via procfs.
///
/// Any failure (no procfs, permission denied, parent gone) reads as "not a
/// TUI" so selection degrades to the local transport.
fn tui_parent_detected() -> bool {
    #[cfg(target_os = "linux")]
    {
        let Ok(status) = std::fs::read_to_string("/proc/self/status") else {
            return false;
        };
        let Some(ppid) = status
            .lines()
            .find_map(|line| line.strip_prefix("PPid:"))
            .and_then(|value| value.trim().parse::<u32>().ok())
        else {
            return false;
        };

        let name = std::fs::read_to_string(format!("/proc/{}/comm", ppid)).unwrap_or_default();
        let cmdline = std::fs::read(format!("/proc/{}/cmdline", ppid))
            .map(|bytes| String::from_utf8_lossy(&bytes).replace('\0', " "))
            .unwrap_or_default();

        looks_like_tui(name.trim(), &cmdline)
    }
    #[cfg(not(target_os = "linux"))]
    {
        false
    }
}

/// Select the transport from environment, parent process, and flags.
///
/// `tcp_flag` is the disjunction of `--tcp`, `--tcp-mode`, `--network`,
/// and `--tui-managed`.
pub fn detect_transport_mode(tcp_flag: bool) -> TransportMode {
    if std::env::var(TUI_MODE_ENV).is_ok_and(|v| is_truthy(&v)) {
        tracing::info!("TUI mode environment set, selecting TCP transport");
        return TransportMode::Tcp;
    }

    if tui_parent_detected() {
        tracing::info!("TUI parent process detected, selecting TCP transport");
        return TransportMode::Tcp;
    }

    if tcp_flag || std::env::var(TCP_MODE_ENV).is_ok_and(|v| is_truthy(&v)) {
        tracing::info!("TCP mode requested, selecting TCP transport");
        return TransportMode::Tcp;
    }

    tracing::info!("selecting local stdio transport");
    TransportMode::Stdio
}

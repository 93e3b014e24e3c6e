use anyhow::Result;
use crossterm::terminal::{disable_raw_mode, enable_raw_mode};
use crossterm::tty::IsTty;

pub fn stdin_is_tty() -> bool {
    std::io::stdin().is_tty()
}

pub fn stdout_is_tty() -> bool {
    std::io::stdout().is_tty()
}

pub fn stderr_is_tty() -> bool {
    std::io::stderr().is_tty()
}

/// Current terminal geometry as (width, height).
pub fn size() -> Result<(u16, u16)> {
    Ok(crossterm::terminal::size()?)
}

/// Switches the terminal to raw mode for the lifetime of the guard. The
/// previous mode is restored on drop, on every exit path.
pub struct RawModeGuard {
    _private: (),
}

impl RawModeGuard {
    pub fn enter() -> Result<Self> {
        enable_raw_mode()?;
        Ok(Self { _private: () })
    }
}

impl Drop for RawModeGuard {
    fn drop(&mut self) {
        if let Err(err) = disable_raw_mode() {
            tracing::warn!("failed to restore terminal mode: {err}");
        }
    }
}

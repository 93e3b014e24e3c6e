use serde::{Deserialize, Serialize};

use crate::core::mux::ChannelKind;

/// Header carrying the serialized [`ClientOptions`] on the attach request
/// (`X-Pipe-Opts` on the wire; header names are case-insensitive).
pub const OPTIONS_HEADER: &str = "x-pipe-opts";

pub const STDIN_CHANNEL: usize = 0;
pub const STDOUT_CHANNEL: usize = 1;
pub const STDERR_CHANNEL: usize = 2;
pub const CONTROL_CHANNEL: usize = 3;

/// Out-of-band handshake payload. Fixed once the handshake completes.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ClientOptions {
    pub tty: bool,
    #[serde(default, skip_serializing_if = "is_zero")]
    pub width: u16,
    #[serde(default, skip_serializing_if = "is_zero")]
    pub height: u16,
}

fn is_zero(v: &u16) -> bool {
    *v == 0
}

impl ClientOptions {
    /// Options for an attach with a pseudo-terminal of the given size.
    pub fn with_terminal(width: u16, height: u16) -> Self {
        Self {
            tty: true,
            width,
            height,
        }
    }

    /// Options for a piped (non-interactive) attach.
    pub fn piped() -> Self {
        Self::default()
    }

    /// Channel layout for the session: stdin, stdout, stderr, control. In
    /// tty mode the remote side merges stderr into stdout, so the stderr
    /// channel is left disabled.
    pub fn channel_layout(&self) -> [ChannelKind; 4] {
        let stderr = if self.tty {
            ChannelKind::Ignore
        } else {
            ChannelKind::Read
        };
        [
            ChannelKind::Write,
            ChannelKind::Read,
            stderr,
            ChannelKind::ReadWrite,
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_options_serialize_with_size() {
        let opts = ClientOptions::with_terminal(80, 24);
        assert_eq!(
            serde_json::to_string(&opts).unwrap(),
            r#"{"tty":true,"width":80,"height":24}"#
        );
    }

    #[test]
    fn piped_options_omit_size() {
        let opts = ClientOptions::piped();
        assert_eq!(serde_json::to_string(&opts).unwrap(), r#"{"tty":false}"#);
    }

    #[test]
    fn tty_layout_disables_stderr() {
        let layout = ClientOptions::with_terminal(80, 24).channel_layout();
        assert_eq!(layout[STDERR_CHANNEL], ChannelKind::Ignore);
        assert_eq!(layout[CONTROL_CHANNEL], ChannelKind::ReadWrite);
    }

    #[test]
    fn piped_layout_reads_stderr() {
        let layout = ClientOptions::piped().channel_layout();
        assert_eq!(layout[STDIN_CHANNEL], ChannelKind::Write);
        assert_eq!(layout[STDOUT_CHANNEL], ChannelKind::Read);
        assert_eq!(layout[STDERR_CHANNEL], ChannelKind::Read);
    }
}

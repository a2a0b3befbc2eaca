use circular_buffer::CircularBuffer;
use log::{debug, info, warn};

use crate::midi_stream::{ChannelMessage, STATUS_CONTROL_CHANGE, STATUS_PROGRAM_CHANGE};
use crate::protocol::MAX_PATCHES;
use crate::session::{DeviceSession, Refresh, SessionError};
use crate::transport::UsbTransport;

pub const MONITOR_LOG_LENGTH: usize = 16;

// Single-character commands, shared by the debug console and the MIDI
// command space (Program Change values >= MAX_PATCHES, Control Change
// controller numbers). Matched case-insensitively.
pub const CMD_PREV_PATCH: u8 = b'P';
pub const CMD_NEXT_PATCH: u8 = b'N';
pub const CMD_TOGGLE_TUNER: u8 = b'T';
pub const CMD_TUNER_OFF: u8 = b'S';
pub const CMD_TOGGLE_BYPASS: u8 = b'B';
pub const CMD_TOGGLE_FULL: u8 = b'F';
pub const CMD_GET_DATA: u8 = b'D';
pub const CMD_GET_INDEX: u8 = b'X';
pub const CMD_GET_ID: u8 = b'I';
pub const CMD_VERSION: u8 = b'V';
pub const CMD_MONITOR: u8 = b'M';

/// Where a command came from. MIDI-driven patch steps confirm with a cheap
/// index query; console steps fetch the full dump so the operator sees the
/// patch name.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandSource {
    Midi,
    Console,
}

/// Thin dispatch from decoded MIDI messages and console characters onto
/// session operations. Keeps a short ring log of everything routed.
pub struct CommandRouter {
    /// 1-based target channel; messages on other channels pass through
    /// untouched.
    channel: u8,
    pub message_log: CircularBuffer<MONITOR_LOG_LENGTH, String>,
}

impl CommandRouter {
    pub fn new(channel: u8) -> Self {
        CommandRouter {
            channel,
            message_log: CircularBuffer::new(),
        }
    }

    pub fn handle_message<T: UsbTransport>(
        &mut self,
        session: &mut DeviceSession<T>,
        msg: &ChannelMessage,
    ) {
        self.message_log.push_back(format!("{msg:?}"));
        if msg.channel() != self.channel {
            debug!("Ignoring message on channel {}", msg.channel());
            return;
        }

        match msg.kind() {
            STATUS_PROGRAM_CHANGE => {
                let program = msg.data1;
                if (program as i8) < MAX_PATCHES {
                    // Footswitch programs are 1-based; program 0 has no
                    // patch and falls out as OutOfRange below.
                    self.report(session.send_patch(program as i8 - 1));
                } else {
                    self.dispatch(session, program, CommandSource::Midi);
                }
            }
            STATUS_CONTROL_CHANGE => {
                self.dispatch(session, msg.data1, CommandSource::Midi);
            }
            _ => {
                debug!("Unhandled message kind {:#04x}", msg.kind());
            }
        }
    }

    pub fn handle_command<T: UsbTransport>(
        &mut self,
        session: &mut DeviceSession<T>,
        cmd: u8,
        source: CommandSource,
    ) {
        self.dispatch(session, cmd, source);
    }

    fn dispatch<T: UsbTransport>(
        &mut self,
        session: &mut DeviceSession<T>,
        cmd: u8,
        source: CommandSource,
    ) {
        let refresh = match source {
            CommandSource::Midi => Refresh::Index,
            CommandSource::Console => Refresh::Data,
        };
        self.message_log
            .push_back(format!("cmd '{}'", cmd as char));

        match cmd.to_ascii_uppercase() {
            CMD_PREV_PATCH => self.report(session.inc_patch(-1, refresh)),
            CMD_NEXT_PATCH => self.report(session.inc_patch(1, refresh)),
            CMD_TOGGLE_TUNER => self.report(session.toggle_tuner()),
            CMD_TUNER_OFF => self.report(session.enable_tuner(false)),
            CMD_TOGGLE_BYPASS => self.report(session.toggle_bypass()),
            CMD_TOGGLE_FULL => self.report(session.toggle_full_bypass()),
            CMD_GET_DATA => self.report(session.request_patch_data()),
            CMD_GET_INDEX => match session.request_patch_index() {
                Ok(index) => info!("Current patch index: {index}"),
                Err(e) => warn!("Patch index query failed: {e}"),
            },
            CMD_GET_ID => match session.request_device_id() {
                Ok(profile) => info!(
                    "Device: {} (firmware {})",
                    profile.kind.name(),
                    profile.firmware
                ),
                Err(e) => warn!("Identification failed: {e}"),
            },
            CMD_VERSION => info!("zoom-ms-bridge {}", env!("CARGO_PKG_VERSION")),
            CMD_MONITOR => {
                for line in self.message_log.iter() {
                    info!("monitor: {line}");
                }
            }
            _ => warn!("Unknown command {:#04x} ('{}')", cmd, cmd as char),
        }
    }

    /// Session errors are never fatal here; log and wait for the next
    /// user action.
    fn report<V: std::fmt::Debug>(&self, result: Result<V, SessionError>) {
        match result {
            Ok(v) => debug!("ok: {v:?}"),
            Err(e) => warn!("command failed: {e}"),
        }
    }
}

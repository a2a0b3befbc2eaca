use log::trace;

pub const STATUS_NOTE_OFF: u8 = 0x80;
pub const STATUS_NOTE_ON: u8 = 0x90;
pub const STATUS_POLY_PRESSURE: u8 = 0xA0;
pub const STATUS_CONTROL_CHANGE: u8 = 0xB0;
pub const STATUS_PROGRAM_CHANGE: u8 = 0xC0;
pub const STATUS_CHANNEL_PRESSURE: u8 = 0xD0;
pub const STATUS_PITCH_BEND: u8 = 0xE0;

/// A complete MIDI channel message reconstructed from the byte stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChannelMessage {
    pub status: u8,
    pub data1: u8,
    pub data2: u8,
}

impl ChannelMessage {
    /// Message kind: the top nibble of the status byte, bottom nibble zeroed.
    pub fn kind(&self) -> u8 {
        self.status & 0xF0
    }

    /// 1-based channel number, as printed on hardware.
    pub fn channel(&self) -> u8 {
        (self.status & 0x0F) + 1
    }
}

/// How many data bytes follow a given status byte. System messages (top
/// nibble 0xF) carry no channel data we handle and report zero.
fn expected_data_len(status: u8) -> usize {
    match status & 0xF0 {
        STATUS_PROGRAM_CHANGE | STATUS_CHANNEL_PRESSURE => 1,
        STATUS_NOTE_OFF | STATUS_NOTE_ON | STATUS_POLY_PRESSURE | STATUS_CONTROL_CHANGE
        | STATUS_PITCH_BEND => 2,
        _ => 0,
    }
}

#[derive(Debug)]
struct Pending {
    status: u8,
    data: [u8; 2],
    received: usize,
    expected: usize,
}

/// Reconstructs discrete channel messages from an unbounded serial byte
/// stream, one byte at a time. Purely reactive: `feed` never blocks, so it
/// can sit inside a poll loop or a byte-ingest callback.
///
/// Running status is not supported: a data byte with no message in progress
/// is dropped, and a fresh status byte always abandons any partial message.
#[derive(Debug, Default)]
pub struct MidiStreamParser {
    pending: Option<Pending>,
}

impl MidiStreamParser {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one inbound byte; returns a message the instant its last
    /// expected data byte arrives.
    pub fn feed(&mut self, byte: u8) -> Option<ChannelMessage> {
        if byte & 0x80 != 0 {
            if let Some(dropped) = self.pending.take() {
                trace!(
                    "status {:#04x} interrupts partial message {:#04x}",
                    byte,
                    dropped.status
                );
            }
            let expected = expected_data_len(byte);
            if expected > 0 {
                self.pending = Some(Pending {
                    status: byte,
                    data: [0; 2],
                    received: 0,
                    expected,
                });
            }
            return None;
        }

        let pending = self.pending.as_mut()?;
        pending.data[pending.received] = byte;
        pending.received += 1;
        if pending.received < pending.expected {
            return None;
        }

        let done = self.pending.take().unwrap();
        Some(ChannelMessage {
            status: done.status,
            data1: done.data[0],
            data2: done.data[1],
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn program_change_emits_after_one_data_byte() {
        let mut parser = MidiStreamParser::new();
        assert_eq!(parser.feed(0xC0), None);
        let msg = parser.feed(0x05).expect("complete message");
        assert_eq!(msg.status, 0xC0);
        assert_eq!(msg.data1, 0x05);
        assert_eq!(msg.kind(), STATUS_PROGRAM_CHANGE);
        assert_eq!(msg.channel(), 1);
    }

    #[test]
    fn control_change_needs_two_data_bytes() {
        let mut parser = MidiStreamParser::new();
        assert_eq!(parser.feed(0xB3), None);
        assert_eq!(parser.feed(0x4A), None);
        let msg = parser.feed(0x41).expect("complete message");
        assert_eq!(msg.kind(), STATUS_CONTROL_CHANGE);
        assert_eq!(msg.channel(), 4);
        assert_eq!(msg.data1, 0x4A);
        assert_eq!(msg.data2, 0x41);
    }

    #[test]
    fn lone_status_byte_emits_nothing() {
        let mut parser = MidiStreamParser::new();
        assert_eq!(parser.feed(0xC0), None);
    }

    #[test]
    fn new_status_abandons_partial_message() {
        let mut parser = MidiStreamParser::new();
        assert_eq!(parser.feed(0x90), None);
        assert_eq!(parser.feed(0x40), None);
        // Note On still wants one more byte; a fresh Program Change wins.
        assert_eq!(parser.feed(0xC1), None);
        let msg = parser.feed(0x07).expect("the new message completes");
        assert_eq!(msg.status, 0xC1);
        assert_eq!(msg.data1, 0x07);
    }

    #[test]
    fn system_status_bytes_are_dropped() {
        let mut parser = MidiStreamParser::new();
        assert_eq!(parser.feed(0xF8), None);
        assert_eq!(parser.feed(0xFE), None);
        // Data bytes with nothing in progress are dropped too.
        assert_eq!(parser.feed(0x10), None);
        // And the parser still works afterwards.
        assert_eq!(parser.feed(0xC0), None);
        assert!(parser.feed(0x01).is_some());
    }

    #[test]
    fn system_byte_aborts_message_in_progress() {
        let mut parser = MidiStreamParser::new();
        assert_eq!(parser.feed(0xC0), None);
        assert_eq!(parser.feed(0xF8), None);
        // The data byte that would have completed the PC now has no home.
        assert_eq!(parser.feed(0x05), None);
    }

    #[test]
    fn consecutive_messages_on_one_stream() {
        let mut parser = MidiStreamParser::new();
        let bytes = [0xC0, 0x01, 0xC0, 0x02, 0xB0, 0x4A, 0x00];
        let msgs: Vec<_> = bytes.iter().filter_map(|&b| parser.feed(b)).collect();
        assert_eq!(msgs.len(), 3);
        assert_eq!(msgs[0].data1, 0x01);
        assert_eq!(msgs[1].data1, 0x02);
        assert_eq!(msgs[2].kind(), STATUS_CONTROL_CHANGE);
    }
}

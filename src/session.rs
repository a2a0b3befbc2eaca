use std::thread;
use std::time::{Duration, Instant};

use log::{debug, info, warn};
use thiserror::Error;

use crate::protocol::{
    patch_name, DeviceKind, DeviceProfile, PacketTemplates, FX_SLOTS, IDENTITY_DEVICE_ID_OFFSET,
    IDENTITY_MIN_LEN, IDENTITY_VERSION_LEN, IDENTITY_VERSION_OFFSET, MAX_PATCHES, MAX_SYSEX,
    PATCH_INDEX_OFFSET, READ_TIMEOUT, SYSEX_END,
};
use crate::transport::{UsbTransport, EVENT_PACKET_LEN};

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("no response within {0:?}")]
    Timeout(Duration),

    #[error("response too short: needed {needed} bytes, got {got}")]
    Truncated { needed: usize, got: usize },

    #[error("unrecognized device id {0:#04x}")]
    UnrecognizedDevice(u8),

    #[error("device not identified yet")]
    NotIdentified,

    #[error("patch index {0} out of range")]
    OutOfRange(i8),

    #[error(transparent)]
    Transport(#[from] anyhow::Error),
}

/// What to re-query after a relative patch change: the index alone is a
/// cheap confirmation, the full dump also fetches the patch name.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Refresh {
    Index,
    Data,
}

/// Synchronous protocol client for one connected pedal.
///
/// The wire protocol has no request IDs; correlation is purely "the next
/// terminated SysEx is the answer". Every operation therefore takes
/// `&mut self` and runs send/read to completion before returning, which
/// makes the one-outstanding-request rule structural.
pub struct DeviceSession<T: UsbTransport> {
    transport: T,
    templates: PacketTemplates,
    profile: Option<DeviceProfile>,
    patch_index: i8,
    patch_name: Option<String>,
    tuner_on: bool,
    bypassed: bool,
    read_timeout: Duration,
}

impl<T: UsbTransport> DeviceSession<T> {
    pub fn new(transport: T) -> Self {
        DeviceSession {
            transport,
            templates: PacketTemplates::new(),
            profile: None,
            patch_index: 0,
            patch_name: None,
            tuner_on: false,
            bypassed: false,
            read_timeout: READ_TIMEOUT,
        }
    }

    pub fn with_read_timeout(mut self, timeout: Duration) -> Self {
        self.read_timeout = timeout;
        self
    }

    #[cfg(test)]
    pub(crate) fn transport_ref(&self) -> &T {
        &self.transport
    }

    pub fn profile(&self) -> Option<&DeviceProfile> {
        self.profile.as_ref()
    }

    pub fn patch_index(&self) -> i8 {
        self.patch_index
    }

    pub fn patch_name(&self) -> Option<&str> {
        self.patch_name.as_deref()
    }

    pub fn tuner_on(&self) -> bool {
        self.tuner_on
    }

    pub fn bypassed(&self) -> bool {
        self.bypassed
    }

    /// Send the universal identity request and resolve the hardware
    /// variant. On a recognized ID the profile is stored and the ID byte is
    /// propagated into every device-addressed template; on an unrecognized
    /// one the profile stays unset and later offset-based decodes refuse to
    /// run rather than produce garbage.
    pub fn request_device_id(&mut self) -> Result<&DeviceProfile, SessionError> {
        self.transport.send(self.templates.identity())?;
        let buf = self.read_response()?;
        if buf.len() < IDENTITY_MIN_LEN {
            return Err(SessionError::Truncated {
                needed: IDENTITY_MIN_LEN,
                got: buf.len(),
            });
        }

        let id = buf[IDENTITY_DEVICE_ID_OFFSET];
        let kind = DeviceKind::from_id(id).ok_or(SessionError::UnrecognizedDevice(id))?;
        let firmware = buf[IDENTITY_VERSION_OFFSET..IDENTITY_VERSION_OFFSET + IDENTITY_VERSION_LEN]
            .iter()
            .map(|&b| b as char)
            .collect::<String>();

        self.templates.set_device_id(id);
        info!(
            "Identified {} (id {id:#04x}, firmware {firmware}, patch dump {} bytes)",
            kind.name(),
            kind.patch_len()
        );
        self.profile = Some(DeviceProfile { kind, firmware });
        Ok(self.profile.as_ref().unwrap())
    }

    /// Ask the pedal which patch is active; stores and returns the index.
    pub fn request_patch_index(&mut self) -> Result<i8, SessionError> {
        self.transport.send(self.templates.patch_index())?;
        let buf = self.read_response()?;
        if buf.len() <= PATCH_INDEX_OFFSET {
            return Err(SessionError::Truncated {
                needed: PATCH_INDEX_OFFSET + 1,
                got: buf.len(),
            });
        }
        self.patch_index = buf[PATCH_INDEX_OFFSET] as i8;
        debug!("Current patch index: {}", self.patch_index);
        Ok(self.patch_index)
    }

    /// Fetch the active patch dump and decode its name. Needs an identified
    /// profile: the name offsets hang off the variant's dump length.
    pub fn request_patch_data(&mut self) -> Result<String, SessionError> {
        let patch_len = self
            .profile
            .as_ref()
            .map(|p| p.kind.patch_len())
            .ok_or(SessionError::NotIdentified)?;

        self.transport.send(self.templates.patch_data())?;
        let buf = self.read_response()?;
        let name = patch_name(&buf, patch_len).ok_or(SessionError::Truncated {
            needed: patch_len,
            got: buf.len(),
        })?;
        info!("Patch name: {name}");
        self.patch_name = Some(name.clone());
        Ok(name)
    }

    /// Select a patch by absolute index via Program Change.
    pub fn send_patch(&mut self, index: i8) -> Result<(), SessionError> {
        if !(0..MAX_PATCHES).contains(&index) {
            return Err(SessionError::OutOfRange(index));
        }
        debug!("Sending patch {index}");
        self.transport
            .send(self.templates.program_change(index as u8))?;
        self.patch_index = index;
        Ok(())
    }

    /// Step the stored patch index by `offset` with wraparound, select the
    /// resulting patch, then re-query per `refresh`.
    pub fn inc_patch(&mut self, offset: i8, refresh: Refresh) -> Result<i8, SessionError> {
        let next = (self.patch_index as i16 + offset as i16).rem_euclid(MAX_PATCHES as i16) as i8;
        self.send_patch(next)?;
        match refresh {
            Refresh::Index => {
                self.request_patch_index()?;
            }
            Refresh::Data => {
                self.request_patch_data()?;
            }
        }
        Ok(self.patch_index)
    }

    pub fn toggle_tuner(&mut self) -> Result<bool, SessionError> {
        let on = !self.tuner_on;
        self.enable_tuner(on)?;
        Ok(on)
    }

    pub fn enable_tuner(&mut self, on: bool) -> Result<(), SessionError> {
        info!("Tuner {}", if on { "ON" } else { "OFF" });
        self.transport.send(self.templates.tuner(on))?;
        self.tuner_on = on;
        Ok(())
    }

    pub fn enable_editor_mode(&mut self, on: bool) -> Result<(), SessionError> {
        info!("Editor mode {}", if on { "ON" } else { "OFF" });
        self.transport.send(self.templates.editor_mode(on))?;
        Ok(())
    }

    /// Bypass one effect slot.
    pub fn set_bypass(&mut self, slot: u8, on: bool) -> Result<(), SessionError> {
        self.transport.send(self.templates.bypass(slot, on))?;
        Ok(())
    }

    /// Treat slot 0 as the line selector and flip it.
    pub fn toggle_bypass(&mut self) -> Result<bool, SessionError> {
        let on = !self.bypassed;
        info!("FX bypass {}", if on { "ON" } else { "OFF" });
        self.set_bypass(0, on)?;
        self.bypassed = on;
        Ok(on)
    }

    /// Flip the bypass state across every effect slot at once.
    pub fn toggle_full_bypass(&mut self) -> Result<bool, SessionError> {
        let on = !self.bypassed;
        self.enable_full_bypass(on)?;
        Ok(on)
    }

    /// Sweep the bypass state across every effect slot.
    pub fn enable_full_bypass(&mut self, on: bool) -> Result<(), SessionError> {
        info!("Full bypass {}", if on { "ON" } else { "OFF" });
        for slot in 0..FX_SLOTS {
            self.transport.send(self.templates.bypass(slot, on))?;
        }
        self.bypassed = on;
        Ok(())
    }

    /// Accumulate one response: poll the transport, strip the cable/CIN
    /// header off each 4-byte event packet, and collect payload bytes until
    /// the SysEx terminator or the deadline. The final event packet may pad
    /// past the terminator, so the buffer is truncated at 0xF7 rather than
    /// requiring it to be the last byte written.
    fn read_response(&mut self) -> Result<Vec<u8>, SessionError> {
        let deadline = Instant::now() + self.read_timeout;
        let mut raw = [0u8; 64];
        let mut partial: Vec<u8> = Vec::new();
        let mut buf: Vec<u8> = Vec::with_capacity(MAX_SYSEX);

        loop {
            self.transport.service();
            let n = self.transport.recv(&mut raw);
            if n > 0 {
                partial.extend_from_slice(&raw[..n]);
                while partial.len() >= EVENT_PACKET_LEN {
                    let unit: Vec<u8> = partial.drain(..EVENT_PACKET_LEN).collect();
                    for &b in &unit[1..] {
                        if buf.len() == MAX_SYSEX {
                            break;
                        }
                        buf.push(b);
                        if b == SYSEX_END {
                            debug!("USB <- {buf:02X?}");
                            return Ok(buf);
                        }
                    }
                }
            }
            if Instant::now() >= deadline {
                if !buf.is_empty() {
                    warn!("read timed out with {} bytes pending", buf.len());
                }
                return Err(SessionError::Timeout(self.read_timeout));
            }
            thread::sleep(Duration::from_millis(1));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::SYSEX_START;
    use crate::transport::frame_event_packets;
    use std::collections::VecDeque;

    /// Transport double: replies are queued as pre-framed packets, sends
    /// are captured for inspection.
    #[derive(Default)]
    struct MockTransport {
        sent: Vec<Vec<u8>>,
        replies: VecDeque<Vec<u8>>,
        inbox: VecDeque<u8>,
    }

    impl MockTransport {
        fn queue_reply(&mut self, msg: &[u8]) {
            self.replies.push_back(frame_event_packets(msg));
        }
    }

    impl UsbTransport for MockTransport {
        fn send(&mut self, bytes: &[u8]) -> anyhow::Result<()> {
            self.sent.push(bytes.to_vec());
            // Each send releases the next scripted reply.
            if let Some(reply) = self.replies.pop_front() {
                self.inbox.extend(reply);
            }
            Ok(())
        }

        fn recv(&mut self, buf: &mut [u8]) -> usize {
            let mut written = 0;
            while written < buf.len() {
                match self.inbox.pop_front() {
                    Some(b) => {
                        buf[written] = b;
                        written += 1;
                    }
                    None => break,
                }
            }
            written
        }

        fn service(&mut self) {}
    }

    fn session() -> DeviceSession<MockTransport> {
        DeviceSession::new(MockTransport::default())
            .with_read_timeout(Duration::from_millis(20))
    }

    fn identity_reply(device_id: u8) -> Vec<u8> {
        let mut msg = vec![
            SYSEX_START,
            0x7E,
            0x00,
            0x06,
            0x02,
            0x52,
            device_id,
            0x00,
            0x00,
            0x00,
        ];
        msg.extend_from_slice(b"2.10");
        msg.push(SYSEX_END);
        msg
    }

    fn index_reply(index: u8) -> Vec<u8> {
        vec![
            SYSEX_START,
            0x52,
            0x00,
            0x58,
            0x33,
            0x00,
            0x00,
            index,
            SYSEX_END,
        ]
    }

    #[test]
    fn identify_resolves_variant_and_propagates_id() {
        let mut session = session();
        session.transport.queue_reply(&identity_reply(0x58));
        let profile = session.request_device_id().expect("identified");
        assert_eq!(profile.kind, DeviceKind::Ms50g);
        assert_eq!(profile.firmware, "2.10");

        // Every subsequent device-addressed request carries the ID.
        session.transport.queue_reply(&index_reply(3));
        session.request_patch_index().unwrap();
        let sent = session.transport.sent.last().unwrap();
        assert_eq!(sent[3], 0x58);
    }

    #[test]
    fn identify_rejects_unknown_id() {
        let mut session = session();
        session.transport.queue_reply(&identity_reply(0x42));
        match session.request_device_id() {
            Err(SessionError::UnrecognizedDevice(0x42)) => {}
            other => panic!("expected UnrecognizedDevice, got {other:?}"),
        }
        assert!(session.profile().is_none());
        // Templates stay on the placeholder.
        session.transport.queue_reply(&index_reply(0));
        let _ = session.request_patch_index();
        assert_eq!(session.transport.sent.last().unwrap()[3], 0xFF);
    }

    #[test]
    fn patch_index_extracted_from_reply() {
        let mut session = session();
        session.transport.queue_reply(&index_reply(17));
        assert_eq!(session.request_patch_index().unwrap(), 17);
        assert_eq!(session.patch_index(), 17);
    }

    #[test]
    fn send_patch_produces_program_change() {
        let mut session = session();
        session.send_patch(4).unwrap();
        assert_eq!(session.transport.sent.last().unwrap(), &vec![0xC0, 0x04]);
    }

    #[test]
    fn send_patch_rejects_out_of_range() {
        let mut session = session();
        for index in [-1, 50, 127] {
            match session.send_patch(index) {
                Err(SessionError::OutOfRange(i)) => assert_eq!(i, index),
                other => panic!("expected OutOfRange, got {other:?}"),
            }
        }
        assert!(session.transport.sent.is_empty());
    }

    #[test]
    fn inc_patch_wraps_both_directions() {
        let mut session = session();
        session.transport.queue_reply(&index_reply(49));
        let index = session.inc_patch(-1, Refresh::Index).unwrap();
        assert_eq!(index, 49);

        session.patch_index = 49;
        session.transport.queue_reply(&index_reply(0));
        // Reply is released by the Program Change; the index query that
        // follows reads it.
        session.transport.replies.push_back(Vec::new());
        let index = session.inc_patch(1, Refresh::Index).unwrap();
        assert_eq!(index, 0);
    }

    #[test]
    fn patch_data_decodes_name_for_146_byte_variant() {
        let mut session = session();
        session.transport.queue_reply(&identity_reply(0x58));
        session.request_device_id().unwrap();

        let mut dump = vec![0x00; 146];
        dump[0] = SYSEX_START;
        dump[145] = SYSEX_END;
        let name = *b"TremoloVox";
        dump[146 - 14] = name[0];
        dump[146 - 12..146 - 5].copy_from_slice(&name[1..8]);
        dump[146 - 4] = name[8];
        dump[146 - 3] = name[9];
        // Known gaps in the vendor layout are not part of the name.
        dump[146 - 13] = 0x7F;
        dump[146 - 5] = 0x7F;

        session.transport.queue_reply(&dump);
        assert_eq!(session.request_patch_data().unwrap(), "TremoloVox");
        assert_eq!(session.patch_name(), Some("TremoloVox"));
    }

    #[test]
    fn patch_data_requires_identification() {
        let mut session = session();
        match session.request_patch_data() {
            Err(SessionError::NotIdentified) => {}
            other => panic!("expected NotIdentified, got {other:?}"),
        }
    }

    #[test]
    fn read_times_out_in_bounded_time() {
        let mut session =
            DeviceSession::new(MockTransport::default()).with_read_timeout(Duration::from_millis(50));
        let start = Instant::now();
        match session.request_patch_index() {
            Err(SessionError::Timeout(_)) => {}
            other => panic!("expected Timeout, got {other:?}"),
        }
        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_millis(50));
        assert!(elapsed < Duration::from_millis(500));
    }

    #[test]
    fn tuner_and_editor_packets() {
        let mut session = session();
        assert!(session.toggle_tuner().unwrap());
        assert!(session.tuner_on());
        assert_eq!(session.transport.sent.last().unwrap(), &vec![0xB0, 0x4A, 0x41]);
        assert!(!session.toggle_tuner().unwrap());
        assert!(!session.tuner_on());
        assert_eq!(session.transport.sent.last().unwrap(), &vec![0xB0, 0x4A, 0x00]);

        session.enable_editor_mode(false).unwrap();
        let sent = session.transport.sent.last().unwrap();
        assert_eq!(sent[4], 0x51);
    }

    #[test]
    fn full_bypass_sweeps_all_slots() {
        let mut session = session();
        session.enable_full_bypass(true).unwrap();
        let slots: Vec<u8> = session.transport.sent.iter().map(|p| p[5]).collect();
        assert_eq!(slots, vec![0, 1, 2, 3, 4]);
        assert!(session.transport.sent.iter().all(|p| p[7] == 1));
        assert!(session.bypassed());
    }

    #[test]
    fn toggle_full_bypass_flips_state_both_ways() {
        let mut session = session();
        assert!(session.toggle_full_bypass().unwrap());
        assert!(session.bypassed());
        assert!(!session.toggle_full_bypass().unwrap());
        assert!(!session.bypassed());
        // Two sweeps across the five slots.
        assert_eq!(session.transport.sent.len(), 10);
        assert!(session.transport.sent[..5].iter().all(|p| p[7] == 1));
        assert!(session.transport.sent[5..].iter().all(|p| p[7] == 0));
    }
}

//! Byte-level protocol for the Zoom MS-series pedals: outbound packet
//! templates, the device variant table, and the fixed offsets used to pull
//! fields out of SysEx replies.
//!
//! Layout knowledge here comes from observed device traffic; the pedals
//! publish no official SysEx documentation.

use std::time::Duration;

pub const SYSEX_START: u8 = 0xF0;
pub const SYSEX_END: u8 = 0xF7;

/// The pedals address 50 patches, 0-based.
pub const MAX_PATCHES: i8 = 50;

/// Largest SysEx reply we accumulate (the patch dump is 146 bytes; this
/// matches the USB host buffer the pedals were probed with).
pub const MAX_SYSEX: usize = 256;

/// How long a request/response exchange may wait for the terminator.
pub const READ_TIMEOUT: Duration = Duration::from_millis(300);

/// Granularity bound for the DIN/console poll loops.
pub const SERIAL_POLL: Duration = Duration::from_millis(20);

/// Effect slots addressable by the bypass packet.
pub const FX_SLOTS: u8 = 5;

/// Placeholder written into device-ID template fields until identification
/// resolves a real one.
pub const DEVICE_ID_PLACEHOLDER: u8 = 0xFF;

// Identity reply layout (universal identity request response).
pub const IDENTITY_DEVICE_ID_OFFSET: usize = 6;
pub const IDENTITY_VERSION_OFFSET: usize = 10;
pub const IDENTITY_VERSION_LEN: usize = 4;
/// Shortest identity reply we can decode.
pub const IDENTITY_MIN_LEN: usize = IDENTITY_VERSION_OFFSET + IDENTITY_VERSION_LEN;

/// Patch index reply: current patch number position.
pub const PATCH_INDEX_OFFSET: usize = 7;

/// Recognized hardware variants. The ID byte arrives in the identity reply
/// and selects the patch-dump length, which in turn anchors the name
/// offsets in [`patch_name`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceKind {
    Ms50g,
    Ms70cdr,
    Ms60b,
}

impl DeviceKind {
    pub fn from_id(id: u8) -> Option<Self> {
        match id {
            0x58 => Some(DeviceKind::Ms50g),
            0x61 => Some(DeviceKind::Ms70cdr),
            0x5F => Some(DeviceKind::Ms60b),
            _ => None,
        }
    }

    pub fn id(&self) -> u8 {
        match self {
            DeviceKind::Ms50g => 0x58,
            DeviceKind::Ms70cdr => 0x61,
            DeviceKind::Ms60b => 0x5F,
        }
    }

    /// Total byte length of this variant's patch-data SysEx.
    pub fn patch_len(&self) -> usize {
        match self {
            DeviceKind::Ms50g | DeviceKind::Ms70cdr => 146,
            DeviceKind::Ms60b => 105,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            DeviceKind::Ms50g => "MS-50G",
            DeviceKind::Ms70cdr => "MS-70CDR",
            DeviceKind::Ms60b => "MS-60B",
        }
    }
}

/// Identity of the connected pedal, as resolved from the identity reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceProfile {
    pub kind: DeviceKind,
    pub firmware: String,
}

/// Outbound packet templates, owned per session so device-ID propagation is
/// ordinary mutable state rather than cross-call globals. Fill methods
/// overwrite the mutable fields and hand back the bytes ready to send.
#[derive(Debug)]
pub struct PacketTemplates {
    identity: [u8; 6],
    editor_mode: [u8; 6],
    patch_index: [u8; 6],
    patch_data: [u8; 6],
    tuner: [u8; 3],
    program_change: [u8; 2],
    bypass: [u8; 11],
}

// Field positions inside the templates above.
const DEVICE_ID_POS: usize = 3;
const EDITOR_MODE_POS: usize = 4;
const TUNER_VALUE_POS: usize = 2;
const PROGRAM_POS: usize = 1;
const BYPASS_SLOT_POS: usize = 5;
const BYPASS_ONOFF_POS: usize = 7;

impl Default for PacketTemplates {
    fn default() -> Self {
        Self::new()
    }
}

impl PacketTemplates {
    pub fn new() -> Self {
        let id = DEVICE_ID_PLACEHOLDER;
        PacketTemplates {
            // Universal identity request; carries no device ID.
            identity: [0xF0, 0x7E, 0x00, 0x06, 0x01, 0xF7],
            editor_mode: [0xF0, 0x52, 0x00, id, 0x50, 0xF7],
            patch_index: [0xF0, 0x52, 0x00, id, 0x33, 0xF7],
            patch_data: [0xF0, 0x52, 0x00, id, 0x29, 0xF7],
            tuner: [0xB0, 0x4A, 0x00],
            program_change: [0xC0, 0x00],
            bypass: [0xF0, 0x52, 0x00, id, 0x31, 0x00, 0x00, 0x00, 0x00, 0x00, 0xF7],
        }
    }

    /// Propagate a resolved device ID into every template that embeds one.
    /// Must happen before those templates are first sent once the device is
    /// identified; they stay on the placeholder otherwise.
    pub fn set_device_id(&mut self, id: u8) {
        self.editor_mode[DEVICE_ID_POS] = id;
        self.patch_index[DEVICE_ID_POS] = id;
        self.patch_data[DEVICE_ID_POS] = id;
        self.bypass[DEVICE_ID_POS] = id;
    }

    pub fn device_id(&self) -> u8 {
        self.patch_index[DEVICE_ID_POS]
    }

    pub fn identity(&self) -> &[u8] {
        &self.identity
    }

    pub fn patch_index(&self) -> &[u8] {
        &self.patch_index
    }

    pub fn patch_data(&self) -> &[u8] {
        &self.patch_data
    }

    pub fn editor_mode(&mut self, on: bool) -> &[u8] {
        self.editor_mode[EDITOR_MODE_POS] = if on { 0x50 } else { 0x51 };
        &self.editor_mode
    }

    pub fn tuner(&mut self, on: bool) -> &[u8] {
        self.tuner[TUNER_VALUE_POS] = if on { 0x41 } else { 0x00 };
        &self.tuner
    }

    /// Caller guarantees `0 <= program < MAX_PATCHES`.
    pub fn program_change(&mut self, program: u8) -> &[u8] {
        self.program_change[PROGRAM_POS] = program;
        &self.program_change
    }

    pub fn bypass(&mut self, slot: u8, on: bool) -> &[u8] {
        self.bypass[BYPASS_SLOT_POS] = slot;
        self.bypass[BYPASS_ONOFF_POS] = u8::from(on);
        &self.bypass
    }
}

/// Extract the 10-character patch name from a patch-data reply.
///
/// The name bytes sit at fixed positions relative to the end of the
/// variant's dump: `len-14`, then `len-12..=len-6`, then `len-4` and
/// `len-3`. The bytes in between belong to other fields and are skipped.
/// The name is NUL-terminated on the wire; everything from the first NUL
/// on is dropped.
pub fn patch_name(buf: &[u8], patch_len: usize) -> Option<String> {
    if buf.len() < patch_len || patch_len < 14 {
        return None;
    }
    let positions = [
        patch_len - 14,
        patch_len - 12,
        patch_len - 11,
        patch_len - 10,
        patch_len - 9,
        patch_len - 8,
        patch_len - 7,
        patch_len - 6,
        patch_len - 4,
        patch_len - 3,
    ];
    let mut name = String::with_capacity(positions.len());
    for &pos in &positions {
        match buf[pos] {
            0 => break,
            b => name.push(b as char),
        }
    }
    Some(name)
}

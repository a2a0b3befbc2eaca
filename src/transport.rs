use std::collections::VecDeque;
use std::sync::mpsc::{self, Receiver, Sender, TryRecvError};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use anyhow::{anyhow, Context};
use log::{info, trace, warn};
use midir::{Ignore, MidiInput, MidiInputConnection, MidiOutput, MidiOutputConnection};

use crate::protocol::{SYSEX_END, SYSEX_START};

/// USB-MIDI event packets are fixed 4-byte units: a cable/code header byte
/// followed by up to 3 payload bytes.
pub const EVENT_PACKET_LEN: usize = 4;

/// The USB side of the bridge, as the session sees it: whole outbound byte
/// sequences go down, raw 4-byte-framed event packets come back up.
/// `service` is called on every iteration of a blocking wait so the
/// transport can make progress while the session spins on a response.
pub trait UsbTransport {
    fn send(&mut self, bytes: &[u8]) -> anyhow::Result<()>;

    /// Copy pending inbound event-packet bytes into `buf`, returning how
    /// many were written. Never blocks; 0 means nothing pending.
    fn recv(&mut self, buf: &mut [u8]) -> usize;

    fn service(&mut self);
}

/// Frame a complete MIDI message into USB-MIDI event packets (cable 0).
///
/// SysEx bodies go out as runs of 3-byte units under CIN 0x4 with a
/// 0x5/0x6/0x7 tail for the final 1/2/3 bytes; channel messages use their
/// status nibble as the CIN. Payload bytes past the end of the message are
/// zero padding.
pub fn frame_event_packets(msg: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity((msg.len() / 3 + 1) * EVENT_PACKET_LEN);
    if msg.first() == Some(&SYSEX_START) {
        let mut chunks = msg.chunks(3).peekable();
        while let Some(chunk) = chunks.next() {
            let last = chunks.peek().is_none() && msg.last() == Some(&SYSEX_END);
            let cin = if last { 0x04 + chunk.len() as u8 } else { 0x04 };
            push_unit(&mut out, cin, chunk);
        }
    } else if let Some(&status) = msg.first() {
        // Channel and system-common messages fit a single unit.
        push_unit(&mut out, status >> 4, &msg[..msg.len().min(3)]);
    }
    out
}

fn push_unit(out: &mut Vec<u8>, cin: u8, payload: &[u8]) {
    out.push(cin);
    out.extend_from_slice(payload);
    out.resize(out.len() + 3 - payload.len(), 0x00);
}

/// A pedal connection over a paired midir input/output port, found by name
/// substring. Inbound messages are re-framed into USB-MIDI event packets in
/// the input callback so the session's response reader sees the same wire
/// shape a USB host controller would hand it.
pub struct MidirUsbPort {
    _in_conn: MidiInputConnection<()>,
    out_conn: MidiOutputConnection,
    rx: Receiver<Vec<u8>>,
    pending: VecDeque<u8>,
}

impl MidirUsbPort {
    pub fn open(name: &str) -> anyhow::Result<Self> {
        let mut midi_in = MidiInput::new("zoom-ms-bridge-usb-in")?;
        midi_in.ignore(Ignore::None);
        let midi_out = MidiOutput::new("zoom-ms-bridge-usb-out")?;

        let needle = name.to_lowercase();
        let in_port = midi_in
            .ports()
            .into_iter()
            .find(|p| {
                midi_in
                    .port_name(p)
                    .map(|n| n.to_lowercase().contains(&needle))
                    .unwrap_or(false)
            })
            .with_context(|| format!("no MIDI input matching '{name}'"))?;
        let out_port = midi_out
            .ports()
            .into_iter()
            .find(|p| {
                midi_out
                    .port_name(p)
                    .map(|n| n.to_lowercase().contains(&needle))
                    .unwrap_or(false)
            })
            .with_context(|| format!("no MIDI output matching '{name}'"))?;

        let in_port_name = midi_in.port_name(&in_port)?;
        let (tx, rx) = mpsc::channel::<Vec<u8>>();
        let _in_conn = midi_in
            .connect(
                &in_port,
                "usb-in",
                move |_stamp, bytes, _| {
                    // Ignore real-time clock chatter from the pedal.
                    if bytes == [0xF8] {
                        return;
                    }
                    let framed = frame_event_packets(bytes);
                    if !framed.is_empty() && tx.send(framed).is_err() {
                        warn!("USB input dropped: receiver gone");
                    }
                },
                (),
            )
            .map_err(|e| anyhow!("failed to connect pedal input: {e}"))?;
        let out_conn = midi_out
            .connect(&out_port, "usb-out")
            .map_err(|e| anyhow!("failed to connect pedal output: {e}"))?;

        info!("Pedal connection open on '{in_port_name}'");
        Ok(MidirUsbPort {
            _in_conn,
            out_conn,
            rx,
            pending: VecDeque::new(),
        })
    }
}

impl UsbTransport for MidirUsbPort {
    fn send(&mut self, bytes: &[u8]) -> anyhow::Result<()> {
        trace!("USB -> {bytes:02X?}");
        self.out_conn
            .send(bytes)
            .map_err(|e| anyhow!("USB send failed: {e}"))
    }

    fn recv(&mut self, buf: &mut [u8]) -> usize {
        self.service();
        let mut written = 0;
        while written < buf.len() {
            match self.pending.pop_front() {
                Some(b) => {
                    buf[written] = b;
                    written += 1;
                }
                None => break,
            }
        }
        written
    }

    fn service(&mut self) {
        loop {
            match self.rx.try_recv() {
                Ok(framed) => self.pending.extend(framed),
                Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => break,
            }
        }
    }
}

/// Open the DIN-side MIDI input by port index and stream every raw byte it
/// delivers to `tx`. The connection lives on its own thread; the handle is
/// kept only so the process can hold it open.
pub fn din_listener_thread(
    port_index: usize,
    tx: Sender<u8>,
) -> anyhow::Result<(JoinHandle<()>, String)> {
    let mut midi_in = MidiInput::new("zoom-ms-bridge-din")?;
    midi_in.ignore(Ignore::None);

    let ports = midi_in.ports();
    let port = ports
        .get(port_index)
        .with_context(|| format!("no MIDI port at index {port_index}"))?
        .clone();
    let port_name = midi_in.port_name(&port)?;

    let handle = thread::spawn(move || {
        // _conn must outlive the loop or midir closes the port.
        let _conn = midi_in
            .connect(
                &port,
                "din-in",
                move |_stamp, bytes, _| {
                    for &b in bytes {
                        if tx.send(b).is_err() {
                            return;
                        }
                    }
                },
                (),
            )
            .expect("failed to connect DIN input");
        loop {
            thread::sleep(Duration::from_millis(100));
        }
    });

    Ok((handle, port_name))
}

use std::{io::BufRead, sync::mpsc, thread, time::Duration};

use clap::Parser;
use env_logger::Env;
use log::{debug, info, warn};
use midir::{Ignore, MidiInput};

use midi_stream::MidiStreamParser;
use protocol::SERIAL_POLL;
use router::{CommandRouter, CommandSource};
use session::DeviceSession;
use settings::Cli;
use transport::{din_listener_thread, MidirUsbPort};

mod midi_stream;
mod protocol;
mod router;
mod session;
mod settings;
mod transport;

/// Pause between the two identification attempts at startup; the pedal can
/// be slow to answer right after the USB link comes up.
const IDENTIFY_SETTLE: Duration = Duration::from_secs(1);

fn list_midi_ports() -> anyhow::Result<()> {
    let mut midi_input = MidiInput::new("midir reading input").expect("midir failure");
    midi_input.ignore(Ignore::None);

    for (i, p) in midi_input.ports().iter().enumerate() {
        println!("{}: {}", i, midi_input.port_name(p)?);
    }
    Ok(())
}

/// Read single-character commands from stdin, one line at a time.
fn console_listener_thread(tx: mpsc::Sender<u8>) -> thread::JoinHandle<()> {
    thread::spawn(move || {
        let stdin = std::io::stdin();
        for line in stdin.lock().lines() {
            let Ok(line) = line else { break };
            for &b in line.trim().as_bytes() {
                if tx.send(b).is_err() {
                    return;
                }
            }
        }
    })
}

fn main() {
    let cli = Cli::parse();

    env_logger::Builder::from_env(Env::default().default_filter_or(&cli.log_level)).init();

    list_midi_ports().expect("failed to list MIDI ports");
    if cli.list_only {
        return;
    }
    if !(1..=16).contains(&cli.channel) {
        panic!("MIDI channel must be 1-16, got {}", cli.channel);
    }

    // TODO: join these on shutdown for a clean exit
    let mut handles = Vec::new();

    let (din_tx, din_rx) = mpsc::channel();
    let (handle, port_name) =
        din_listener_thread(cli.din_port, din_tx).expect("failed to open DIN input");
    info!("DIN input open on '{port_name}'");
    handles.push(handle);

    let usb_port = MidirUsbPort::open(&cli.device_name).expect("failed to open pedal ports");
    let mut session = DeviceSession::new(usb_port);

    // The pedal sometimes ignores the first identity request after
    // connecting; try again after a settle delay before giving up.
    if let Some(e) = session.request_device_id().err() {
        warn!("First identification attempt failed: {e}");
        thread::sleep(IDENTIFY_SETTLE);
        if let Some(e) = session.request_device_id().err() {
            warn!("Device not identified ({e}); patch data queries will be refused");
        }
    }

    if cli.editor_mode {
        if let Err(e) = session.enable_editor_mode(true) {
            warn!("Failed to enable editor mode: {e}");
        }
    }

    let (console_tx, console_rx) = mpsc::channel();
    if cli.console {
        info!("Debug console enabled; p/n/t/s/b/f/d/x/i/v/m + Enter");
        handles.push(console_listener_thread(console_tx));
    } else {
        drop(console_tx);
    }

    let mut parser = MidiStreamParser::new();
    let mut router = CommandRouter::new(cli.channel);

    info!("Bridging; Ctrl+C to quit");
    loop {
        let mut idle = true;

        while let Ok(byte) = din_rx.try_recv() {
            idle = false;
            if let Some(msg) = parser.feed(byte) {
                debug!("DIN message: {msg:?}");
                router.handle_message(&mut session, &msg);
            }
        }

        while let Ok(cmd) = console_rx.try_recv() {
            idle = false;
            router.handle_command(&mut session, cmd, CommandSource::Console);
        }

        if idle {
            thread::sleep(SERIAL_POLL);
        }
    }
}

use clap::Parser;

#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
pub struct Cli {
    #[arg(long = "loglevel", default_value_t = String::from("info"))]
    pub log_level: String,

    /// Flag to list available MIDI ports and exit
    #[arg(long = "list")]
    pub list_only: bool,

    /// Name substring used to find the pedal's USB MIDI in/out ports
    #[arg(long = "device", default_value_t = String::from("ZOOM MS"))]
    pub device_name: String,

    /// Target MIDI channel (1-16) for Program/Control Change handling
    #[arg(long = "channel", default_value_t = 1)]
    pub channel: u8,

    /// Put the pedal in editor mode after identification
    #[arg(long = "editor")]
    pub editor_mode: bool,

    /// Enable the stdin debug console (single-character commands)
    #[arg(long = "console")]
    pub console: bool,

    /// MIDI DIN input port, by index
    #[clap()]
    pub din_port: usize,
}

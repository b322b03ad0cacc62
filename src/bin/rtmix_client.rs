use clap::Parser;
use rtmix_rust::{
    common::{
        box_error::BoxError,
        config::Config,
        settings::{self, JamSettings, DEFAULT_SETTINGS_FILE},
    },
    sound::client,
};

#[derive(Parser, Debug)]
#[command(author, version, about = "rtmix jam client", long_about = None)]
struct Args {
    /// server to connect to on startup (host or host:port)
    #[arg(short = 's', long)]
    connect: Option<String>,

    /// name the other players see on this channel
    #[arg(short, long)]
    name: Option<String>,

    /// local buffer size in frames, or "auto"
    #[arg(short, long)]
    buffer: Option<String>,

    /// "high" (16 bit) or "normal" (8 bit mu-law)
    #[arg(short, long)]
    quality: Option<String>,

    /// capture and play back one channel
    #[arg(short, long, default_value_t = false)]
    mono: bool,

    /// json settings file
    #[arg(short, long, default_value = DEFAULT_SETTINGS_FILE)]
    config: String,

    /// use the jack sound server instead of the software clock
    #[arg(short, long, default_value_t = false)]
    jack: bool,
}

fn main() -> Result<(), BoxError> {
    env_logger::init();
    let args = Args::parse();

    let mut config = Config::build(args.config, settings::defaults())?;
    if let Some(server) = args.connect {
        config.set_value("server", server)?;
    }
    match args.buffer.as_deref() {
        Some("auto") => config.set_value("auto_buffer", true)?,
        Some(n) => {
            let frames: u32 = n.parse()?;
            config.set_value("buffer_capacity", frames)?;
            config.set_value("auto_buffer", false)?;
        }
        None => (),
    }
    if let Some(name) = args.name {
        config.set_value("name", name)?;
    }
    if let Some(quality) = args.quality {
        config.set_value("quality", quality)?;
    }
    if args.mono {
        config.set_value("channels", 1)?;
    }
    let settings = JamSettings::from_config(&config)?;
    client::run(settings, args.jack)?;
    Ok(())
}

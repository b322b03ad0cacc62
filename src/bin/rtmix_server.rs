use clap::Parser;
use rtmix_rust::{
    common::{
        box_error::BoxError,
        config::Config,
        settings::{self, JamSettings, DEFAULT_SETTINGS_FILE},
    },
    server::mix_server,
};

#[derive(Parser, Debug)]
#[command(author, version, about = "rtmix personal mix server", long_about = None)]
struct Args {
    /// UDP port to listen on
    #[arg(short, long)]
    port: Option<u32>,

    /// refuse connections beyond this many clients
    #[arg(short, long)]
    max_clients: Option<u32>,

    /// run 64 sample frames instead of 128
    #[arg(short, long, default_value_t = false)]
    fast_update: bool,

    /// json settings file
    #[arg(short, long, default_value = DEFAULT_SETTINGS_FILE)]
    config: String,
}

fn main() -> Result<(), BoxError> {
    env_logger::init();
    let args = Args::parse();

    let mut config = Config::build(args.config, settings::defaults())?;
    if let Some(port) = args.port {
        config.set_value("port", port)?;
    }
    if let Some(max) = args.max_clients {
        config.set_value("max_clients", max)?;
    }
    if args.fast_update {
        config.set_value("frame_size", 64)?;
    }
    let settings = JamSettings::from_config(&config)?;
    mix_server::run(settings)?;
    Ok(())
}

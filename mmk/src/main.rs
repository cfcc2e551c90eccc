use structopt::StructOpt;

fn main() {
    let config = mmk::Config::from_args();

    let default_filter = if config.verbose { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default_filter))
        .format_timestamp(None)
        .init();

    if let Err(err) = mmk::run(config) {
        log::error!("Error: {:#}", err);
        std::process::exit(1);
    }
}

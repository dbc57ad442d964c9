use clap::Parser;

fn main() {
    let args = mzflat::cli::Args::parse();
    let level = if args.verbose { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level))
        .format_timestamp(None)
        .init();

    if let Err(err) = mzflat::run(args) {
        log::error!("{err:#}");
        std::process::exit(1);
    }
}

#[macro_use]
extern crate log;

use clap::{App, Arg};

use x0d::{Overrides, Server};

fn main() {
    let matches = App::new("x0d")
        .version(env!("CARGO_PKG_VERSION"))
        .about("HTTP/1.x application server steered by a compiled Flow configuration")
        .arg(
            Arg::with_name("config")
                .long("config")
                .value_name("FILE")
                .help("Flow configuration file")
                .default_value("x0d.conf"),
        )
        .arg(
            Arg::with_name("listen")
                .long("listen")
                .value_name("HOST:PORT")
                .help("Listen address, overriding the configuration"),
        )
        .arg(
            Arg::with_name("workers")
                .long("workers")
                .value_name("N")
                .help("Worker loop count, overriding the configuration"),
        )
        .arg(
            Arg::with_name("log-level")
                .long("log-level")
                .value_name("LEVEL")
                .default_value("info")
                .help("Log level (error, warn, info, debug, trace)"),
        )
        .arg(
            Arg::with_name("dump-program")
                .long("dump-program")
                .help("Compile the configuration, print its listing, and exit"),
        )
        .get_matches();

    env_logger::Builder::from_env(
        env_logger::Env::default().default_filter_or(matches.value_of("log-level").unwrap()),
    )
    .init();

    let config_path = matches.value_of("config").unwrap();
    let config_source = match std::fs::read_to_string(config_path) {
        Ok(source) => source,
        Err(e) => {
            error!("cannot read configuration '{}': {}", config_path, e);
            std::process::exit(1);
        }
    };

    if matches.is_present("dump-program") {
        match x0d::dump_program(&config_source, config_path) {
            Ok(listing) => {
                print!("{}", listing);
                std::process::exit(0);
            }
            Err(e) => {
                error!("{}", e);
                std::process::exit(1);
            }
        }
    }

    let mut overrides = Overrides::default();
    if let Some(listen) = matches.value_of("listen") {
        match listen.parse() {
            Ok(addr) => overrides.listen = Some(addr),
            Err(_) => {
                error!("invalid --listen address '{}'", listen);
                std::process::exit(1);
            }
        }
    }
    if let Some(workers) = matches.value_of("workers") {
        match workers.parse() {
            Ok(count) => overrides.workers = Some(count),
            Err(_) => {
                error!("invalid --workers count '{}'", workers);
                std::process::exit(1);
            }
        }
    }

    let server = match Server::start(&config_source, config_path, overrides) {
        Ok(server) => server,
        Err(e) => {
            error!("startup failed: {}", e);
            std::process::exit(1);
        }
    };

    server.run();
}

use crate::common::auth::AuthGate;
use crate::common::config::Config;
use crate::common::logger;
use crate::proxy::acl::Acl;
use crate::proxy::cache::LruResponseCache;
use crate::proxy::listener::Listener;
use clap::Parser;
use log::LevelFilter;
use tokio::net::TcpListener;

mod common;
mod net;
mod proxy;

/// Fallback logger that writes to stderr when log4rs fails to initialise.
struct SimpleLogger;

impl log::Log for SimpleLogger {
    fn enabled(&self, metadata: &log::Metadata) -> bool {
        metadata.level() <= LevelFilter::Info
    }

    fn log(&self, record: &log::Record) {
        if self.enabled(record.metadata()) {
            eprintln!("[{}] {}", record.level(), record.args());
        }
    }

    fn flush(&self) {}
}

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    #[arg(short, long, value_name = "FILE", default_value = "config.toml")]
    config: String,

    #[arg(long, value_name = "ADDRESS")]
    host: Option<String>,

    #[arg(long, value_name = "PORT")]
    port: Option<u16>,

    #[arg(long, value_name = "FILE")]
    blacklist: Option<String>,

    #[arg(long, value_name = "FILE")]
    auth_file: Option<String>,

    #[arg(long)]
    cache: bool,

    #[arg(long, value_name = "BYTES")]
    cache_bytes: Option<usize>,

    #[arg(long, value_name = "DIR")]
    log_dir: Option<String>,

    #[arg(long, value_name = "COUNT")]
    max_connections: Option<usize>,

    #[arg(short, long, value_name = "LEVEL")]
    log_level: Option<String>,

    #[arg(long, value_name = "SIZE")]
    buffer_size: Option<usize>,
}

#[tokio::main]
async fn main() {
    let args = Args::parse();

    let mut config = match Config::from_file(&args.config) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("failed to load config from {}: {}", args.config, e);
            std::process::exit(1);
        }
    };

    if let Some(host) = args.host {
        config.host = host;
    }
    if let Some(port) = args.port {
        config.port = port;
    }
    if let Some(blacklist) = args.blacklist {
        config.blacklist = Some(blacklist);
    }
    if let Some(auth_file) = args.auth_file {
        config.auth_file = Some(auth_file);
    }
    if args.cache {
        config.cache = true;
    }
    if let Some(cache_bytes) = args.cache_bytes {
        config.cache_bytes = cache_bytes;
    }
    if let Some(log_dir) = args.log_dir {
        config.log.dir = log_dir;
    }
    if let Some(max_connections) = args.max_connections {
        config.max_connections = max_connections;
    }
    if let Some(log_level) = args.log_level {
        config.log.level = log_level;
    }
    if let Some(buffer_size) = args.buffer_size {
        config.buffer_size = buffer_size;
    }

    if let Err(e) = config.validate() {
        eprintln!("invalid configuration: {}", e);
        std::process::exit(1);
    }

    if let Err(e) = logger::setup_logger(config.log.clone()) {
        eprintln!("failed to initialize logger: {}", e);
        log::set_boxed_logger(Box::new(SimpleLogger)).unwrap();
        log::set_max_level(LevelFilter::Info);
    }

    log::info!("starting with config: {:?}", config);

    let acl = match &config.blacklist {
        Some(path) => match Acl::load_from_file(path) {
            Ok(acl) => acl,
            Err(e) => {
                log::error!("failed to load blacklist {}: {}", path, e);
                std::process::exit(1);
            }
        },
        None => Acl::empty(),
    };

    let auth = match &config.auth_file {
        Some(path) => match AuthGate::load_from_file(path) {
            Ok(auth) => auth,
            Err(e) => {
                log::error!("failed to load auth file {}: {}", path, e);
                std::process::exit(1);
            }
        },
        None => AuthGate::disabled(),
    };

    let cache = if config.cache {
        Some(LruResponseCache::new(config.cache_bytes, config.max_entry_bytes))
    } else {
        None
    };

    let tcp_listener = match TcpListener::bind(config.bind_address()).await {
        Ok(tcp_listener) => tcp_listener,
        Err(e) => {
            log::error!("failed to bind to {}: {}", config.bind_address(), e);
            std::process::exit(2);
        }
    };

    let listener = Listener::new(acl, auth, cache, config.buffer_size, config.max_connections);
    listener.run(tcp_listener).await;
}

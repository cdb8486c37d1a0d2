use std::sync::Arc;

use clap::Parser;
use log::{error, info, warn};

use care_signaling::state::{MemoryDirectory, UserDirectory};
use care_signaling::{serve, AppState, Args};

async fn open_directory(args: &Args) -> Arc<dyn UserDirectory> {
    #[cfg(feature = "postgres")]
    {
        if let Some(db_url) = &args.database_url {
            match care_signaling::state::backends::PgDirectory::connect(db_url).await {
                Ok(directory) => {
                    info!("Postgres user store enabled (SIGNALING_DB_URL set).");
                    return Arc::new(directory);
                }
                Err(e) => warn!("Failed to connect to Postgres; continuing without DB: {}", e),
            }
        } else {
            info!("Postgres disabled (SIGNALING_DB_URL not set).");
        }
    }

    #[cfg(not(feature = "postgres"))]
    {
        if args.database_url.is_some() {
            warn!("SIGNALING_DB_URL set but built without the `postgres` feature; ignoring");
        }
    }

    info!("Using in-memory user directory");
    Arc::new(MemoryDirectory::new())
}

#[tokio::main]
async fn main() {
    let args = Args::parse();

    let addr = match args.listen_addr() {
        Ok(addr) => addr,
        Err(e) => {
            eprintln!("Invalid listen address {}:{}: {}", args.host, args.port, e);
            std::process::exit(2);
        }
    };

    // Healthcheck mode: exit 0 if server is running (port in use), exit 1 if not
    if args.healthcheck {
        match std::net::TcpListener::bind(("127.0.0.1", addr.port())) {
            Ok(_) => std::process::exit(1),
            Err(_) => std::process::exit(0),
        }
    }

    env_logger::init();

    let directory = open_directory(&args).await;
    let state = AppState::new(args.broker_config(), directory);

    let listener = match std::net::TcpListener::bind(addr) {
        Ok(listener) => listener,
        Err(e) => {
            error!("Failed to bind {}: {}", addr, e);
            std::process::exit(1);
        }
    };

    if let Err(e) = serve(listener, state).await {
        error!("Server error: {}", e);
        std::process::exit(1);
    }
}

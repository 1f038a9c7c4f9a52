use clap::Parser;
use dockbridge::bridge::Bridge;
use dockbridge::cli::{Cli, Commands};
use dockbridge::config::{Config, ConfigOverrides};
use dockbridge::control::{self, Request, Response};
use dockbridge::error::Error;

#[tokio::main]
async fn main() {
    let args = Cli::parse();
    let exit_code = match run(args).await {
        Ok(()) => 0,
        Err(e) => {
            tracing::error!(error = %e, "dockbridge exiting");
            e.exit_code()
        }
    };
    std::process::exit(exit_code);
}

async fn run(args: Cli) -> Result<(), Error> {
    let config_path = args.config.clone().unwrap_or_else(Config::default_path);

    match args.command {
        Commands::Start(params) => {
            let overrides = ConfigOverrides {
                socket_path: params.socket_path,
                api_token: params.api_token,
                server_type: params.server_type,
                location: params.location,
            };
            let config = Config::load(&config_path, overrides)?;
            init_tracing(&config.log_level, &config.log_format);

            let bridge = Bridge::new(config)?;
            bridge.run().await
        }
        Commands::Stop => {
            let config = Config::load(&config_path, ConfigOverrides::default())?;
            let ctl_path = config.control_socket_path();
            match control::send_request(&ctl_path, &Request::Stop).await {
                Ok(Response::Stopping) => {
                    println!("dockbridge: stop requested");
                    Ok(())
                }
                Ok(other) => Err(Error::Fatal(format!("unexpected response: {other:?}"))),
                Err(e) => {
                    println!("dockbridge: not running ({e})");
                    Ok(())
                }
            }
        }
        Commands::Status => {
            let config = Config::load(&config_path, ConfigOverrides::default())?;
            let ctl_path = config.control_socket_path();
            match control::send_request(&ctl_path, &Request::Status).await {
                Ok(Response::Status { state, shutdown_in_secs }) => {
                    println!("state: {state}");
                    println!("shutdown in: {shutdown_in_secs}s");
                    Ok(())
                }
                Ok(other) => Err(Error::Fatal(format!("unexpected response: {other:?}"))),
                Err(_) => {
                    println!("dockbridge: not running");
                    Ok(())
                }
            }
        }
    }
}

fn init_tracing(level: &str, format: &str) {
    use tracing_subscriber::EnvFilter;

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let subscriber = tracing_subscriber::fmt().with_env_filter(filter);

    if format == "json" {
        subscriber.json().init();
    } else {
        subscriber.init();
    }
}

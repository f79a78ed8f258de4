mod crypto;
mod guacd;
mod models;
mod protocol;
mod routes;
mod session;

use std::{collections::HashMap, env, str::FromStr, sync::Arc, time::Duration};

use thiserror::Error;
use tracing::{debug, error, info, instrument, trace};
use tracing_subscriber::filter::LevelFilter;

use crypto::TokenCipher;
use models::{AcceptAll, AppState, ClientOptions, CryptOptions, GuacdOptions};
use routes::create_router;

/// Tunables with their defaults; only `SECRET_KEY` is mandatory.
const ENV_DEFAULTS: &[(&str, &str)] = &[
    ("GATEWAY_HOST", "0.0.0.0"),
    ("GATEWAY_PORT", "8080"),
    ("GUACD_HOST", "127.0.0.1"),
    ("GUACD_PORT", "4822"),
    ("CRYPT_CYPHER", crypto::CIPHER_NAME),
    ("MAX_INACTIVITY_MS", "10000"),
    ("CONNECTION_TIMEOUT_MS", "10000"),
];

#[derive(Debug, Error)]
enum SetupError {
    #[error("Expected variable `{0}` not found")]
    EnvVarNotFound(&'static str),

    #[error("Variable `{name}` has invalid value `{value}`")]
    InvalidEnvVar { name: &'static str, value: String },

    #[error("SECRET_KEY must be exactly 32 bytes")]
    InvalidKeyLength,

    #[error("Unsupported cipher `{0}`")]
    UnsupportedCipher(String),
}

struct Config {
    listen_address: String,
    client: ClientOptions,
    guacd: GuacdOptions,
}

fn read_env(name: &str) -> Option<String> {
    match env::var(name) {
        Ok(value) => {
            let trimmed = value.trim().to_owned();
            if trimmed.is_empty() {
                None
            } else {
                trace!("Loaded environment variable: {name}");
                Some(trimmed)
            }
        }
        Err(_) => None,
    }
}

fn parse_var<T: FromStr>(
    vars: &HashMap<&'static str, String>,
    name: &'static str,
) -> Result<T, SetupError> {
    let value = &vars[name];
    value.parse().map_err(|_| SetupError::InvalidEnvVar {
        name,
        value: value.clone(),
    })
}

fn load_config() -> Result<Config, SetupError> {
    // A .env file is a convenience; variables from the real environment win.
    let _ = dotenv::dotenv();

    let mut vars = HashMap::new();
    for (name, default) in ENV_DEFAULTS {
        vars.insert(*name, read_env(name).unwrap_or_else(|| (*default).to_string()));
    }

    let key_text = read_env("SECRET_KEY").ok_or(SetupError::EnvVarNotFound("SECRET_KEY"))?;
    let key: [u8; 32] = key_text
        .as_bytes()
        .try_into()
        .map_err(|_| SetupError::InvalidKeyLength)?;

    let cypher = vars["CRYPT_CYPHER"].clone();
    if cypher != crypto::CIPHER_NAME {
        return Err(SetupError::UnsupportedCipher(cypher));
    }

    let listen_address = format!(
        "{}:{}",
        vars["GATEWAY_HOST"],
        parse_var::<u16>(&vars, "GATEWAY_PORT")?
    );

    Ok(Config {
        listen_address,
        client: ClientOptions {
            crypt: CryptOptions { cypher, key },
            max_inactivity: Duration::from_millis(parse_var(&vars, "MAX_INACTIVITY_MS")?),
        },
        guacd: GuacdOptions {
            host: vars["GUACD_HOST"].clone(),
            port: parse_var(&vars, "GUACD_PORT")?,
            connection_timeout: Duration::from_millis(parse_var(&vars, "CONNECTION_TIMEOUT_MS")?),
        },
    })
}

fn parse_log_level(args: &mut env::Args) -> LevelFilter {
    while let Some(arg) = args.next() {
        if arg == "--log-level" {
            return if let Some(level) = args.next() {
                match level.to_lowercase().as_str() {
                    "debug" => LevelFilter::DEBUG,
                    "info" => LevelFilter::INFO,
                    "warn" | "warning" => LevelFilter::WARN,
                    "trace" => LevelFilter::TRACE,
                    "error" => LevelFilter::ERROR,
                    _ => LevelFilter::INFO,
                }
            } else {
                LevelFilter::INFO
            };
        }
    }

    LevelFilter::INFO
}

#[tokio::main]
#[instrument]
async fn main() {
    let log_level = parse_log_level(&mut env::args());
    tracing_subscriber::fmt().with_max_level(log_level).init();

    let config = match load_config() {
        Ok(config) => config,
        Err(err) => {
            error!("{err}");
            return;
        }
    };

    let cipher = match TokenCipher::new(&config.client.crypt) {
        Ok(cipher) => cipher,
        Err(err) => {
            error!("{err}");
            return;
        }
    };

    debug!("Loaded configuration.");
    info!(
        "Relaying connections to guacd at {}:{}",
        config.guacd.host, config.guacd.port
    );

    let listener = match tokio::net::TcpListener::bind(&config.listen_address).await {
        Ok(listener) => {
            info!("Listening on {}", config.listen_address);
            listener
        }
        Err(err) => {
            error!("Failed to bind listener to {}: {err}", config.listen_address);
            return;
        }
    };

    let app = create_router(AppState {
        cipher: Arc::new(cipher),
        client: Arc::new(config.client),
        guacd: Arc::new(config.guacd),
        hook: Arc::new(AcceptAll),
    });

    if let Err(err) = axum::serve(listener, app).await {
        error!("Server error: {err}");
    }
}

//! Config subcommand handlers.

use carelink_config::{Config, KeyringCredentialStore};
use secrecy::SecretString;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::info;

use crate::cli::{ConfigArgs, ConfigCommand, GlobalOpts};
use crate::config;
use crate::error::CliError;

pub async fn handle(args: ConfigArgs, global: &GlobalOpts) -> Result<(), CliError> {
    match args.command {
        ConfigCommand::Path => {
            println!("{}", config::resolve_path(global).display());
            Ok(())
        }

        ConfigCommand::Show => {
            let cfg = config::load(global)?;
            print!("{}", toml::to_string_pretty(&cfg)?);
            Ok(())
        }

        ConfigCommand::Init {
            base_url,
            realtime_endpoint,
            user_id,
            force,
        } => {
            let path = config::resolve_path(global);
            if path.exists() && !force {
                return Err(CliError::ConfigExists {
                    path: path.display().to_string(),
                });
            }

            let mut cfg = Config::default();
            cfg.api.base_url = Some(base_url);
            cfg.api.insecure = global.insecure;
            cfg.realtime.endpoint = realtime_endpoint;
            cfg.session.user_id = user_id;

            // Reject bad URLs now rather than on first use.
            cfg.base_url()?;
            if cfg.realtime.endpoint.is_some() {
                cfg.realtime_config()?;
            }

            carelink_config::save_config_to(&cfg, &path)?;
            println!("Wrote {}", path.display());
            Ok(())
        }

        ConfigCommand::SetToken => {
            let cfg = config::load(global)?;
            let mut line = String::new();
            BufReader::new(tokio::io::stdin()).read_line(&mut line).await?;
            let token = line.trim();
            if token.is_empty() {
                return Err(CliError::Validation {
                    field: "token".into(),
                    reason: "nothing was read from stdin".into(),
                });
            }

            let store =
                KeyringCredentialStore::new(&cfg.session.profile, cfg.session.user_id.clone())?;
            store.store(SecretString::from(token.to_owned()))?;
            info!(profile = %cfg.session.profile, "session token stored");
            println!("Token stored for profile '{}'", cfg.session.profile);
            Ok(())
        }
    }
}

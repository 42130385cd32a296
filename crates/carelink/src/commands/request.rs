//! `carelink request`: one request through the coordinator.

use carelink_api::{Method, RequestCoordinator, RequestSpec};
use carelink_config::Config;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::cli::RequestArgs;
use crate::error::CliError;

pub async fn handle(args: RequestArgs, cfg: &Config) -> Result<(), CliError> {
    let method = parse_method(&args.method)?;
    let coordinator = RequestCoordinator::with_reqwest(
        cfg.base_url()?,
        &cfg.transport_config(),
        cfg.credential_store(),
        cfg.coordinator_config(),
    )?;

    // Ctrl-C aborts the in-flight request instead of killing the process mid-write.
    let cancel = CancellationToken::new();
    let _interrupt = tokio::spawn({
        let cancel = cancel.clone();
        async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("interrupted, cancelling request");
                cancel.cancel();
            }
        }
    });

    let mut spec = RequestSpec::new(method, args.path).cancel_with(cancel);
    for (key, value) in args.params {
        spec = spec.param(key, value);
    }
    if let Some(body) = args.json {
        spec = spec.json(serde_json::from_str(&body)?);
    }
    debug!(fingerprint = %spec.fingerprint(), "sending");

    let resp = coordinator.send(spec).await?;
    info!(status = resp.status.as_u16(), bytes = resp.body.len(), "response received");

    match resp.json::<serde_json::Value>() {
        Ok(value) => println!("{}", serde_json::to_string_pretty(&value)?),
        Err(_) if resp.body.is_empty() => {}
        Err(_) => println!("{}", resp.text()),
    }
    Ok(())
}

fn parse_method(raw: &str) -> Result<Method, CliError> {
    match raw.to_ascii_uppercase().as_str() {
        "GET" => Ok(Method::GET),
        "POST" => Ok(Method::POST),
        "PUT" => Ok(Method::PUT),
        "PATCH" => Ok(Method::PATCH),
        "DELETE" => Ok(Method::DELETE),
        other => Err(CliError::Validation {
            field: "method".into(),
            reason: format!("expected GET, POST, PUT, PATCH or DELETE, got '{other}'"),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn methods_are_case_insensitive() {
        assert!(matches!(parse_method("get"), Ok(m) if m == Method::GET));
        assert!(matches!(parse_method("Patch"), Ok(m) if m == Method::PATCH));
        assert!(matches!(
            parse_method("TRACE"),
            Err(CliError::Validation { .. })
        ));
    }
}

//! symcheck - command-line client for the symptom-checker service.
//!
//! Signs in, keeps the session alive across runs and runs symptom checks.
//! Run `symcheck help` for the list of commands.

use std::io::{self, Write};
use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use futures::future::join3;
use tracing::{debug, info, warn};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use symcheck_core::auth::AuthState;
use symcheck_core::config::Config;
use symcheck_core::models::{LoginRequest, OAuthProvider, Prediction, RegisterRequest};
use symcheck_core::{ApiError, AuthEvent, LogoutReason, RefreshError, SessionManager};

/// Log file name in the cache directory
const LOG_FILE: &str = "symcheck.log";

const USAGE: &str = "\
Usage: symcheck <command> [args]

Commands:
  login [email]             Sign in with email and password
  register <name> <email>   Create an account and sign in
  oauth <provider> <token>  Sign in with a Google, GitHub or Facebook token
  logout                    Forget the stored session
  whoami                    Verify the stored session and show the profile
  symptoms                  List the symptoms the model knows about
  history [--json]          Show past predictions
  predict <symptom>...      Run a symptom check
  overview                  Profile, history and symptom count in one go
";

/// Initialize the tracing subscriber for logging.
///
/// Use RUST_LOG to control the level (e.g. RUST_LOG=symcheck_core=debug).
/// When `log_dir` is given, logs are also written there without ANSI colors.
fn init_tracing(log_dir: Option<PathBuf>) -> Option<WorkerGuard> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));

    let (file_layer, guard) = match log_dir {
        Some(dir) => {
            let appender = tracing_appender::rolling::daily(dir, LOG_FILE);
            let (writer, guard) = tracing_appender::non_blocking(appender);
            (Some(fmt::layer().with_writer(writer).with_ansi(false)), Some(guard))
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(io::stderr))
        .with(file_layer)
        .with(filter)
        .init();
    guard
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file if present (silently ignore if not found)
    let _ = dotenvy::dotenv();

    let _guard = init_tracing(Config::cache_root().ok());
    info!("symcheck starting");

    let args: Vec<String> = std::env::args().skip(1).collect();
    let Some(command) = args.first().map(String::as_str) else {
        eprint!("{USAGE}");
        return Ok(());
    };
    if matches!(command, "help" | "--help" | "-h") {
        print!("{USAGE}");
        return Ok(());
    }

    let mut config = Config::load().context("Failed to load config")?;
    config.apply_env_overrides();
    let manager = SessionManager::from_config(&config)?;
    watch_events(&manager);

    let rest = &args[1..];
    let result = match command {
        "login" => login(&manager, &mut config, rest.first().cloned()).await,
        "register" => register(&manager, &mut config, rest).await,
        "oauth" => oauth(&manager, rest).await,
        "logout" => {
            manager.logout();
            println!("Signed out.");
            Ok(())
        }
        "whoami" => whoami(&manager).await,
        "symptoms" => symptoms(&manager).await,
        "history" => history(&manager, rest.iter().any(|a| a == "--json")).await,
        "predict" => predict(&manager, rest).await,
        "overview" => overview(&manager).await,
        other => {
            eprint!("{USAGE}");
            bail!("Unknown command: {other}");
        }
    };

    info!("symcheck shutting down");
    result
}

fn watch_events(manager: &SessionManager) {
    let mut events = manager.subscribe();
    tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            match event {
                AuthEvent::LoggedOut { reason } if reason != LogoutReason::UserRequested => {
                    warn!(?reason, "Session ended")
                }
                event => debug!(?event, "Auth event"),
            }
        }
    });
}

fn prompt(label: &str) -> Result<String> {
    print!("{label}: ");
    io::stdout().flush()?;
    let mut line = String::new();
    io::stdin().read_line(&mut line)?;
    Ok(line.trim().to_string())
}

fn remember_email(config: &mut Config, email: &str) {
    config.last_email = Some(email.to_string());
    if let Err(e) = config.save() {
        warn!(error = %e, "Failed to save config");
    }
}

async fn login(manager: &SessionManager, config: &mut Config, email: Option<String>) -> Result<()> {
    let email = match email.or_else(|| config.last_email.clone()) {
        Some(email) => email,
        None => prompt("Email")?,
    };
    let password = rpassword::prompt_password(format!("Password for {email}: "))?;

    let session = manager
        .login(&LoginRequest::new(email.clone(), password))
        .await
        .map_err(|e| anyhow::anyhow!(login_failure(&e)))?;
    remember_email(config, &email);

    let name = session.user.map(|u| u.display_name()).unwrap_or(email);
    println!("Signed in as {name}.");
    Ok(())
}

async fn register(manager: &SessionManager, config: &mut Config, args: &[String]) -> Result<()> {
    let [name, email, ..] = args else {
        bail!("Usage: symcheck register <name> <email>");
    };
    let password = rpassword::prompt_password("Choose a password: ")?;
    let confirm = rpassword::prompt_password("Repeat password: ")?;
    if password != confirm {
        bail!("Passwords do not match");
    }

    manager
        .register(&RegisterRequest::new(name.as_str(), email.as_str(), password))
        .await
        .map_err(|e| anyhow::anyhow!(describe(&e)))?;
    remember_email(config, email);
    println!("Account created. Signed in as {name}.");
    Ok(())
}

async fn oauth(manager: &SessionManager, args: &[String]) -> Result<()> {
    let [provider, token, ..] = args else {
        bail!("Usage: symcheck oauth <google|github|facebook> <token>");
    };
    let provider =
        OAuthProvider::parse(provider).with_context(|| format!("Unknown provider: {provider}"))?;

    let session = manager
        .exchange_oauth_token(provider, token)
        .await
        .map_err(|e| anyhow::anyhow!(login_failure(&e)))?;
    let name = session
        .user
        .map(|u| u.display_name())
        .unwrap_or_else(|| provider.to_string());
    println!("Signed in with {provider} as {name}.");
    Ok(())
}

async fn whoami(manager: &SessionManager) -> Result<()> {
    if manager.check_auth().await == AuthState::LoggedOut {
        bail!("Not signed in. Run `symcheck login` first.");
    }
    let session = manager.session();
    match session.user {
        Some(user) => {
            println!("{}", user.display_name());
            if let Some(email) = user.email {
                println!("  email: {email}");
            }
            if let Some(role) = user.role {
                println!("  role:  {role}");
            }
        }
        None => println!("Signed in (no profile available)"),
    }
    if session.verified_at.is_none() {
        println!("  (offline: showing cached profile)");
    }
    Ok(())
}

fn require_session(manager: &SessionManager) -> Result<()> {
    if manager.store().get().is_none() {
        bail!("Not signed in. Run `symcheck login` first.");
    }
    Ok(())
}

async fn symptoms(manager: &SessionManager) -> Result<()> {
    require_session(manager)?;
    let symptoms = manager.api().fetch_symptoms().await.map_err(|e| anyhow::anyhow!(describe(&e)))?;
    for symptom in symptoms {
        println!("{symptom}");
    }
    Ok(())
}

async fn history(manager: &SessionManager, as_json: bool) -> Result<()> {
    require_session(manager)?;
    let records = manager.api().fetch_history().await.map_err(|e| anyhow::anyhow!(describe(&e)))?;

    if as_json {
        println!("{}", serde_json::to_string_pretty(&records)?);
        return Ok(());
    }
    if records.is_empty() {
        println!("No predictions yet.");
    }
    for record in records {
        let when = record
            .created_at_utc()
            .map(|t| t.format("%Y-%m-%d %H:%M").to_string())
            .or(record.created_at.clone())
            .unwrap_or_else(|| "-".to_string());
        println!(
            "{when}  {:<30} {}",
            record.prediction.disease,
            record.prediction.confidence_display()
        );
    }
    Ok(())
}

async fn predict(manager: &SessionManager, symptoms: &[String]) -> Result<()> {
    if symptoms.is_empty() {
        bail!("Usage: symcheck predict <symptom>...");
    }
    require_session(manager)?;
    let prediction = manager
        .api()
        .predict(symptoms)
        .await
        .map_err(|e| anyhow::anyhow!(describe(&e)))?;
    print_prediction(&prediction);
    Ok(())
}

fn print_prediction(prediction: &Prediction) {
    println!("{} ({})", prediction.disease, prediction.confidence_display());
    if !prediction.description.is_empty() {
        println!("\n{}", prediction.description);
    }
    println!("\nSee: {}", prediction.specialty_display());
    if !prediction.precautions.is_empty() {
        println!("Precautions:");
        for precaution in &prediction.precautions {
            println!("  - {precaution}");
        }
    }
}

/// Three requests at once; an expired token is refreshed a single time for all.
async fn overview(manager: &SessionManager) -> Result<()> {
    require_session(manager)?;
    let api = manager.api();
    let (user, history, symptoms) =
        join3(api.fetch_user(), api.fetch_history(), api.fetch_symptoms()).await;

    let user = user.map_err(|e| anyhow::anyhow!(describe(&e)))?;
    println!("{}", user.display_name());
    match history {
        Ok(records) => println!("  predictions: {}", records.len()),
        Err(e) => println!("  predictions: unavailable ({})", describe(&e)),
    }
    match symptoms {
        Ok(list) => println!("  known symptoms: {}", list.len()),
        Err(e) => println!("  known symptoms: unavailable ({})", describe(&e)),
    }
    Ok(())
}

fn login_failure(e: &ApiError) -> String {
    match e {
        ApiError::AuthRejected { .. } => "Invalid email or password".to_string(),
        other => describe(other),
    }
}

/// Map an API error to a message for the terminal.
fn describe(e: &ApiError) -> String {
    debug!(status = ?e.status(), error = %e, "Request failed");
    let message = match e {
        ApiError::Network(_) => {
            "Unable to connect to server. Check your internet connection.".to_string()
        }
        ApiError::RefreshFailed(RefreshError::Timeout(_)) => "Connection timed out.".to_string(),
        ApiError::RefreshFailed(_) => "Your session has expired.".to_string(),
        ApiError::AuthRejected { .. } => "The server rejected your credentials.".to_string(),
        ApiError::AccountNotFound => "This account no longer exists.".to_string(),
        ApiError::Status { status, message } if *status >= 500 => {
            format!("The server had a problem ({status}): {message}")
        }
        ApiError::Status { message, .. } => message.clone(),
        other => other.to_string(),
    };
    // Stored credentials are gone; only a new login helps
    if e.is_terminal() {
        format!("{message} Run `symcheck login` to sign in again.")
    } else {
        message
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_terminal_errors_suggest_login() {
        let expired = describe(&ApiError::RefreshFailed(RefreshError::NoRefreshToken));
        assert!(expired.starts_with("Your session has expired."));
        assert!(expired.ends_with("Run `symcheck login` to sign in again."));

        let timed_out = describe(&ApiError::RefreshFailed(RefreshError::Timeout(Duration::from_secs(15))));
        assert!(timed_out.starts_with("Connection timed out."));
        assert!(timed_out.contains("symcheck login"));

        assert!(describe(&ApiError::AccountNotFound).contains("symcheck login"));
    }

    #[test]
    fn test_transient_errors_keep_session() {
        let offline = describe(&ApiError::Network("connection refused".into()));
        assert!(offline.starts_with("Unable to connect"));
        assert!(!offline.contains("symcheck login"));

        let server = describe(&ApiError::Status { status: 503, message: "maintenance".into() });
        assert_eq!(server, "The server had a problem (503): maintenance");
    }

    #[test]
    fn test_login_failure_hides_server_message() {
        let err = ApiError::AuthRejected { status: 401, message: "Bad credentials".into() };
        assert_eq!(login_failure(&err), "Invalid email or password");
    }
}

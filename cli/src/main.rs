mod config;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{anyhow, bail, Context};
use campus_portal_client::{
    api::RegistrationRequest,
    flows::{CredentialsFlow, OAuthFlow, RegistrationOutcome},
    ApiClient, FileStore, Provider, RequestOptions, SessionManager,
};
use clap::{Args, Parser, Subcommand};
use reqwest::Method;
use serde_json::{json, Value};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::config::Config;

#[derive(Parser, Debug)]
#[command(name = "campus-portal-cli", about = "Campus portal session client")]
struct Cli {
    /// Overrides PORTAL_TOKEN_FILE.
    #[arg(long)]
    token_file: Option<PathBuf>,

    /// Overrides PORTAL_REGISTRATION_URL.
    #[arg(long)]
    registration_url: Option<String>,

    /// Overrides PORTAL_PERSONAL_ACCOUNT_URL.
    #[arg(long)]
    personal_account_url: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Restore the stored session and print it.
    Status,
    /// Adopt an access/refresh pair after validating it.
    Login { access: String, refresh: String },
    PasswordLogin {
        email: String,
        #[arg(long, env = "PORTAL_PASSWORD", hide_env_values = true)]
        password: String,
    },
    Register(RegisterArgs),
    /// Print the provider authorize URL and remember the PKCE verifier.
    OauthLink { provider: Provider },
    /// Finish a provider sign-in with the `code` and `state` from the redirect.
    OauthCallback {
        provider: Provider,
        code: String,
        state: Option<String>,
    },
    /// Send a request with the session headers attached.
    Fetch {
        url: String,
        #[arg(long, default_value = "GET")]
        method: String,
        /// JSON request body.
        #[arg(long)]
        json: Option<String>,
    },
    Logout,
}

#[derive(Args, Debug)]
struct RegisterArgs {
    #[arg(long)]
    first_name: String,
    #[arg(long)]
    last_name: String,
    #[arg(long)]
    phone_number: String,
    #[arg(long)]
    email: String,
    #[arg(long, env = "PORTAL_PASSWORD", hide_env_values = true)]
    password: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "campus_portal_cli=info,campus_portal_client=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    // Load `.env` before parsing so `env = ...` arguments see it.
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    let config =
        Config::load()?.with_service_urls(cli.registration_url, cli.personal_account_url)?;
    let token_file = cli.token_file.unwrap_or(config.token_file);
    tracing::debug!(
        registration_url = %config.client.registration_url,
        personal_account_url = %config.client.personal_account_url,
        token_file = %token_file.display(),
        "Loaded configuration from environment/.env"
    );

    let store = Arc::new(FileStore::new(token_file));
    let session = Arc::new(SessionManager::new(ApiClient::new(config.client), store));
    session.bootstrap().await;

    run(cli.command, session).await
}

async fn run(command: Command, session: Arc<SessionManager>) -> anyhow::Result<()> {
    match command {
        Command::Status => print_json(&serde_json::to_value(session.state())?),
        Command::Login { access, refresh } => {
            if !session.login(&access, &refresh).await {
                bail!("token pair was not accepted");
            }
            print_json(&serde_json::to_value(session.state())?)
        }
        Command::PasswordLogin { email, password } => {
            let flow = CredentialsFlow::new(session);
            match flow.sign_in(&email, &password).await {
                Ok(user_id) => print_json(&json!({ "user_id": user_id })),
                Err(err) if err.needs_registration() => {
                    Err(anyhow!(err).context("account not found, run `register` first"))
                }
                Err(err) => Err(err.into()),
            }
        }
        Command::Register(args) => {
            let request = RegistrationRequest {
                first_name: args.first_name,
                last_name: args.last_name,
                phone_number: args.phone_number,
                email: args.email,
                hash_password: args.password,
            };
            let login_route = session.api().config().login_route.clone();
            match CredentialsFlow::new(session).register(&request).await? {
                RegistrationOutcome::SignedIn(user_id) => {
                    print_json(&json!({ "user_id": user_id, "signed_in": true }))
                }
                RegistrationOutcome::Created => {
                    print_json(&json!({ "signed_in": false, "redirect_to": login_route }))
                }
            }
        }
        Command::OauthLink { provider } => {
            let request = OAuthFlow::new(session).begin(provider).await?;
            println!("{}", request.url);
            Ok(())
        }
        Command::OauthCallback {
            provider,
            code,
            state,
        } => {
            let success = OAuthFlow::new(session)
                .complete(provider, &code, state.as_deref())
                .await?;
            print_json(&json!({
                "user_id": success.user_id,
                "registered": success.registered,
                "redirect_to": success.redirect_to,
            }))
        }
        Command::Fetch { url, method, json } => {
            let method = Method::from_bytes(method.to_ascii_uppercase().as_bytes())
                .with_context(|| format!("invalid method: {method}"))?;
            let mut options = RequestOptions::get().method(method);
            if let Some(body) = json {
                let body: Value = serde_json::from_str(&body).context("invalid --json body")?;
                options = options.json(body);
            }
            let Some(response) = session.fetch_with_auth(&url, options).await else {
                bail!("request did not complete");
            };
            let status = response.status();
            let body = response.text().await?;
            eprintln!("{}", status);
            println!("{}", body);
            if !status.is_success() {
                bail!("server answered {}", status);
            }
            Ok(())
        }
        Command::Logout => {
            session.logout().await;
            Ok(())
        }
    }
}

fn print_json(value: &Value) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

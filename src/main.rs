// relay-login - sign in to a Nostr relay admin backend
//
// Supports five ways of proving who you are:
// - Browser extension (NIP-07 style signer)
// - Amber, an external signer app reached through a nostrsigner: link
// - NIP-46 bunker over a relay (bunker://...)
// - Read-only, with just a public key
// - A local private key (only the derived public key is sent)

mod auth;

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::{mpsc, Mutex};
use url::Url;

use auth::identifier::parse_bunker_url;
use auth::{
    classify, AuditLog, AuthFlowController, AuthMethod, FlowOutcome, FlowSettings,
    HttpSessionApi, IdentifierKind, Navigator, NostrConnectConnector, PageEvent,
    PublicKeyIdentifier, RememberedBunker, SessionApi, TransportSelector,
};

#[derive(Parser)]
#[command(name = "relay-login")]
#[command(about = "Sign in to a Nostr relay admin backend with a remote signer")]
#[command(version)]
struct Cli {
    /// Base URL of the relay admin backend
    #[arg(long, env = "RELAY_LOGIN_API", default_value = "http://localhost:8080")]
    api_url: String,

    /// Directory for the remembered bunker and the audit log
    #[arg(long, env = "RELAY_LOGIN_STATE", default_value = "~/.relay-login")]
    state_dir: String,

    /// Name shown inside the signer app
    #[arg(long, default_value = "Relay Admin")]
    app_name: String,

    /// URL the signer app sends the browser back to (default: <api-url>/auth/callback)
    #[arg(long, env = "RELAY_LOGIN_CALLBACK")]
    callback_url: Option<String>,

    /// Seconds to wait for the signer app or each bunker round trip (1-3600)
    #[arg(long, default_value_t = 30, value_parser = clap::value_parser!(u64).range(1..=3600))]
    signer_timeout: u64,

    /// Only log warnings
    #[arg(short, long, default_value_t = false)]
    quiet: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Sign in with one of the supported methods
    Login {
        #[command(subcommand)]
        method: LoginMethod,
    },
    /// Check whether a string is a public key or bunker URL
    Validate {
        input: String,
    },
    /// Show the remembered bunker and audit log location
    Status,
    /// Forget the remembered bunker
    ForgetBunker,
}

#[derive(Subcommand)]
enum LoginMethod {
    /// Use a browser extension signer
    Extension,
    /// Use the Amber signer app
    Amber {
        /// Bunker URI already paired with Amber; skips the app round trip
        #[arg(long)]
        bunker: Option<String>,
    },
    /// Use a NIP-46 bunker (defaults to the remembered one)
    Bunker {
        /// bunker://<pubkey>?relay=wss://...&secret=TOKEN
        uri: Option<String>,
    },
    /// View only, no signing
    ReadOnly {
        /// npub or 64-char hex public key
        pubkey: String,
    },
    /// Derive the public key from a local secret key
    PrivateKey {
        /// nsec or hex secret key
        #[arg(long, env = "NOSTR_NSEC", hide_env_values = true)]
        nsec: String,
    },
}

/// The terminal stands in for the browser page
struct TerminalNavigator {
    current: Arc<StdMutex<Option<Url>>>,
}

impl Navigator for TerminalNavigator {
    fn open(&self, target: &Url) -> Result<()> {
        if target.scheme() == "nostrsigner" {
            println!("\n📱 Open this link on the device running your signer app:");
            println!("   {}", target);
            println!(
                "\nThen paste the URL it returns you to. Enter re-checks, 'b' goes back, 'q' quits."
            );
        } else {
            println!("➡️  Continue at {}", target);
        }
        Ok(())
    }

    fn current_url(&self) -> Option<Url> {
        self.current.lock().ok().and_then(|url| url.clone())
    }

    fn replace_url(&self, url: Url) {
        if let Ok(mut current) = self.current.lock() {
            *current = Some(url);
        }
    }
}

/// Turn stdin lines into page events
fn spawn_page_events(current: Arc<StdMutex<Option<Url>>>) -> mpsc::Receiver<PageEvent> {
    let (tx, rx) = mpsc::channel(16);
    tokio::spawn(async move {
        let mut lines = BufReader::new(tokio::io::stdin()).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            let event = match line.trim() {
                "" => PageEvent::VisibilityRegained,
                "b" | "back" => PageEvent::GoBack,
                "q" | "quit" => PageEvent::Close,
                other => match Url::parse(other) {
                    Ok(url) => {
                        if let Ok(mut slot) = current.lock() {
                            *slot = Some(url.clone());
                        }
                        PageEvent::Navigated(url)
                    }
                    Err(_) => {
                        eprintln!("Not a URL. Paste the callback URL, or 'b' / 'q'.");
                        continue;
                    }
                },
            };
            if tx.send(event).await.is_err() {
                break;
            }
        }
    });
    rx
}

fn resolve_login(method: LoginMethod, state_dir: &Path) -> Result<(AuthMethod, Option<String>)> {
    let resolved = match method {
        LoginMethod::Extension => (AuthMethod::Extension, None),
        LoginMethod::Amber { bunker } => (AuthMethod::ExternalSigner, bunker),
        LoginMethod::Bunker { uri: Some(uri) } => (AuthMethod::Bunker, Some(uri)),
        LoginMethod::Bunker { uri: None } => {
            let remembered = RememberedBunker::load(state_dir)?.context(
                "No bunker URI given and none remembered.\n\
                 Use: relay-login login bunker \"bunker://<pubkey>?relay=wss://...&secret=TOKEN\"",
            )?;
            let descriptor = remembered.descriptor()?;
            println!("🔐 Using remembered bunker via {}", descriptor.relay());
            (AuthMethod::Bunker, Some(remembered.bunker_uri))
        }
        LoginMethod::ReadOnly { pubkey } => (AuthMethod::ReadOnly, Some(pubkey)),
        LoginMethod::PrivateKey { nsec } => (AuthMethod::PrivateKey, Some(nsec)),
    };
    Ok(resolved)
}

async fn login(settings: FlowSettings, state_dir: &Path, method: LoginMethod) -> Result<()> {
    std::fs::create_dir_all(state_dir).context("Failed to create state directory")?;
    let (method, input) = resolve_login(method, state_dir)?;

    let current = Arc::new(StdMutex::new(None));
    let navigator = Arc::new(TerminalNavigator {
        current: current.clone(),
    });
    let mut events = spawn_page_events(current);

    let api = Arc::new(HttpSessionApi::new(settings.api_url.clone())?);
    let audit = Arc::new(Mutex::new(AuditLog::new(state_dir)));
    let transports = TransportSelector::new(None, Arc::new(NostrConnectConnector));
    let mut controller =
        AuthFlowController::new(settings, navigator, api.clone(), transports, audit);

    controller.select_method(method);
    if method.is_signer_backed() {
        println!("🔐 Signing in with {}...", method);
    }

    match controller.submit(input.as_deref(), &mut events).await {
        FlowOutcome::SignedIn { .. } => {
            let session = controller
                .session()
                .context("Sign-in finished without a session")?;
            println!("✓ Signed in");
            println!("  public key: {}", session.public_key);
            println!("  mode:       {}", session.mode);
            if let Some(signing) = &session.capabilities.signing_method {
                println!("  signing:    {}", signing);
            }
            if session.is_read_only() {
                println!("\n👀 Read-only session: you can view, not sign.");
            }
            match api.has_session().await {
                Ok(true) => tracing::debug!("Backend confirms the session"),
                Ok(false) => eprintln!("⚠️  Backend does not report an active session yet"),
                Err(e) => eprintln!("⚠️  Could not confirm session: {}", e),
            }
        }
        FlowOutcome::Failed(e) => {
            let message = controller
                .state()
                .error()
                .map(str::to_string)
                .unwrap_or_else(|| e.to_string());
            anyhow::bail!(message);
        }
        FlowOutcome::Abandoned(_) => println!("Sign-in cancelled."),
    }
    Ok(())
}

fn validate(input: &str) -> Result<()> {
    match classify(input) {
        IdentifierKind::HexKey | IdentifierKind::Npub => {
            let id = PublicKeyIdentifier::parse(input)?;
            match id.canonical_hex() {
                Ok(hex) => println!("✓ Public key\n  hex: {}", hex),
                Err(e) => println!("⚠️  Looks like a public key but does not decode: {}", e),
            }
        }
        IdentifierKind::BunkerUrl => {
            let descriptor = parse_bunker_url(input)?;
            println!("✓ Bunker URL");
            println!("  Remote signer: {}", descriptor.remote_signer_pubkey());
            println!("  Relays: {}", descriptor.relays().collect::<Vec<_>>().join(", "));
            println!(
                "  Secret: {}",
                if descriptor.secret().is_some() { "yes" } else { "no" }
            );
        }
        IdentifierKind::Unknown => {
            anyhow::bail!("Not a public key (hex or npub) or bunker:// URL");
        }
    }
    Ok(())
}

fn show_status(state_dir: &Path) -> Result<()> {
    println!("=== relay-login status ===\n");

    if let Some(config) = RememberedBunker::load(state_dir)? {
        println!("Remembered bunker:");
        println!("  Remote signer: {}", config.remote_signer_pubkey);
        println!("  Relays: {}", config.relays.join(", "));
        if let Some(ref pk) = config.user_pubkey {
            println!("  User pubkey: {}", pk);
        }
        println!("  Created: {}", config.created_at);
        if let Some(ref last) = config.last_connected {
            println!("  Last connected: {}", last);
        }
        println!("  File: {}", RememberedBunker::config_path(state_dir).display());
    } else {
        println!("No remembered bunker.");
    }

    let audit = AuditLog::new(state_dir);
    if let Some(path) = audit.path() {
        println!("\nAudit log: {}", path.display());
    }
    if let Some(last) = audit.last_success()? {
        println!(
            "  Last sign-in: {} via {} as {} ({})",
            last.timestamp,
            last.method,
            last.public_key.as_deref().unwrap_or("?"),
            last.mode.as_deref().unwrap_or("?"),
        );
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    use tracing_subscriber::EnvFilter;
    let default_filter = if cli.quiet { "warn,nostr_relay_pool=off" } else { "info" };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_filter));
    let subscriber = tracing_subscriber::FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_target(true)
        .with_writer(std::io::stderr)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let state_dir = PathBuf::from(cli.state_dir.replace('~', &std::env::var("HOME").unwrap_or_default()));

    match cli.command {
        Commands::Validate { input } => validate(&input),
        Commands::Status => show_status(&state_dir),
        Commands::ForgetBunker => {
            if RememberedBunker::delete(&state_dir)? {
                println!("✓ Forgot remembered bunker");
            } else {
                println!("No remembered bunker.");
            }
            Ok(())
        }
        Commands::Login { method } => {
            let api_url = Url::parse(&cli.api_url).context("Invalid --api-url")?;
            let timeout = Duration::from_secs(cli.signer_timeout);

            let mut settings = FlowSettings::new(api_url);
            settings.app_name = cli.app_name;
            if let Some(callback) = cli.callback_url {
                settings.callback_url = Url::parse(&callback).context("Invalid --callback-url")?;
            }
            settings.callback_timeout = timeout;
            settings.bunker_timeout = timeout;
            settings.state_dir = Some(state_dir.clone());

            login(settings, &state_dir, method).await
        }
    }
}

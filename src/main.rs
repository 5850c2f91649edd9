use std::sync::Arc;

use anyhow::Context;
use lodestone_auth::{AuthConfig, AuthOrchestrator, FileTokenStore, SignInContext};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let storage_dir = FileTokenStore::default_storage_dir()?;
    let store = FileTokenStore::new(&storage_dir)
        .await
        .with_context(|| format!("Failed to open token store in {}", storage_dir.display()))?;
    info!("Session file: {}", store.path().display());

    let auth = AuthOrchestrator::new(AuthConfig::default(), Arc::new(store))?;

    if std::env::args().nth(1).as_deref() == Some("logout") {
        auth.logout().await?;
        println!("Signed out.");
        return Ok(());
    }

    let session = match auth.load_saved_auth().await {
        Some(session) => session,
        None => {
            let cancel = CancellationToken::new();
            let on_ctrl_c = cancel.clone();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    warn!("Interrupted, cancelling sign-in");
                    on_ctrl_c.cancel();
                }
            });

            let ctx = SignInContext::new()
                .with_cancellation(cancel)
                .on_challenge(|challenge| {
                    println!();
                    println!("To sign in, open {}", challenge.verification_uri);
                    println!("and enter the code {}", challenge.user_code);
                    println!("(the code expires in {} minutes)", challenge.expires_in_seconds / 60);
                    println!();
                });

            match auth.authenticate(&ctx).await {
                Ok(session) => session,
                Err(e) => {
                    eprintln!("{}", e.user_message());
                    return Err(e).context("Sign-in failed");
                }
            }
        }
    };

    let launch = session.launch_credentials();
    info!(
        "Ready to launch as {} ({}), session valid for {} more minutes",
        launch.username,
        launch.uuid,
        session.time_remaining(chrono::Utc::now()).num_minutes()
    );
    println!("Signed in as {}", launch.username);

    Ok(())
}

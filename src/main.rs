//! inbox-triage - Entry point for the background triage daemon

use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use inbox_triage::config::{MailProviderKind, Settings};
use inbox_triage::domain::UserId;
use inbox_triage::providers::ai::build_provider;
use inbox_triage::providers::email::{GmailSource, ImapSource, MailSource};
use inbox_triage::services::{
    Classifier, ReplyDrafter, SchedulerConfig, SchedulerExit, SyncScheduler, SyncService, Triage,
};
use inbox_triage::storage::{queries, KeychainAccess, StorageLayer};

#[tokio::main]
async fn main() {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .init();

    tracing::info!("Starting inbox-triage");

    if let Err(e) = run().await {
        tracing::error!("Fatal error: {:#}", e);
        std::process::exit(1);
    }
}

async fn run() -> Result<()> {
    let settings = Settings::load().context("loading settings")?;
    let db_path = settings.database_path().context("resolving database path")?;
    let storage = StorageLayer::open(&db_path)
        .await
        .with_context(|| format!("opening database at {}", db_path.display()))?;

    let triage = build_triage(&settings, &storage).await?;
    let source = build_mail_source(&settings, storage.keychain()).await?;
    let sync = Arc::new(SyncService::new(
        storage.db().clone(),
        source,
        triage,
        settings.sync.clone(),
    ));

    let users = queries::users::list_connected(storage.db())
        .await
        .context("listing connected users")?;
    if users.is_empty() {
        tracing::info!("No connected mailboxes, nothing to do");
        return Ok(());
    }

    if !settings.sync.enabled {
        for user in &users {
            if let Err(e) = sync.sync(&user.id).await {
                tracing::warn!(user_id = %user.id, error = %e, "One-shot sync failed");
            }
        }
        return Ok(());
    }

    let cancel = CancellationToken::new();
    let config = SchedulerConfig::from(&settings.sync);
    let mut schedulers = JoinSet::new();
    for user in users {
        let scheduler = SyncScheduler::new(sync.clone(), user.id.clone(), config);
        let token = cancel.child_token();
        schedulers.spawn(async move { (user.id, scheduler.run(token).await) });
    }

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("Shutting down");
            cancel.cancel();
        }
        _ = drain(&mut schedulers) => {}
    }
    drain(&mut schedulers).await;

    Ok(())
}

async fn drain(schedulers: &mut JoinSet<(UserId, SchedulerExit)>) {
    while let Some(joined) = schedulers.join_next().await {
        match joined {
            Ok((user_id, exit)) => tracing::info!(user_id = %user_id, exit = ?exit, "Scheduler finished"),
            Err(e) => tracing::error!("Scheduler task failed: {}", e),
        }
    }
}

async fn build_triage(settings: &Settings, storage: &StorageLayer) -> Result<Triage> {
    if !settings.ai.enabled {
        tracing::info!("AI processing disabled in settings");
        return Ok(Triage::disabled());
    }

    let name = settings.ai.default_provider.as_str();
    let provider_settings = settings
        .ai
        .active_provider()
        .with_context(|| format!("no settings for AI provider {name}"))?;
    let api_key = match &provider_settings.api_key_keychain_id {
        Some(key_id) => storage
            .keychain()
            .retrieve(key_id)
            .await
            .with_context(|| format!("reading API key {key_id} from keychain"))?,
        None => None,
    };

    let timeout = settings.sync.request_timeout();
    let provider = build_provider(name, provider_settings, api_key, timeout)
        .with_context(|| format!("building AI provider {name}"))?;
    tracing::info!(provider = name, model = provider.model(), "AI provider ready");

    let classifier = Classifier::new(
        provider.clone(),
        storage.db().clone(),
        &settings.ai,
        &settings.drafting,
        timeout,
    );
    let drafter = ReplyDrafter::new(
        provider,
        storage.db().clone(),
        &settings.ai,
        settings.drafting.clone(),
        timeout,
    );
    Ok(Triage::new(classifier, drafter))
}

async fn build_mail_source(
    settings: &Settings,
    keychain: &KeychainAccess,
) -> Result<Arc<dyn MailSource>> {
    let source: Arc<dyn MailSource> = match settings.mail.provider {
        MailProviderKind::Gmail => {
            let gmail = &settings.mail.gmail;
            let secret = keychain
                .require(&gmail.client_secret_keychain_id)
                .await
                .context("reading Gmail client secret from keychain")?;
            Arc::new(
                GmailSource::new(&gmail.client_id, secret)
                    .with_timeout(settings.sync.request_timeout())
                    .context("building Gmail client")?,
            )
        }
        MailProviderKind::Imap => {
            let imap = settings
                .mail
                .imap
                .clone()
                .context("mail.provider is imap but mail.imap is not set")?;
            Arc::new(ImapSource::new(imap))
        }
    };
    Ok(source)
}

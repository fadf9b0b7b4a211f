use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;

use tradie_desk::config::{AppConfig, relay_base};
use tradie_desk::leads::model::Tenant;
use tradie_desk::leads::{
    CommandHandler, LeadExtractor, NotificationDispatcher, spawn_notification_sweep,
};
use tradie_desk::llm::create_provider;
use tradie_desk::nurture::{self, NurtureEngine, Templates};
use tradie_desk::routes::{AppState, RelaySettings, app_routes};
use tradie_desk::session::SessionController;
use tradie_desk::sms::SmsResponder;
use tradie_desk::store::{Database, LibSqlBackend};
use tradie_desk::transport::{Transport, TwilioTransport};

/// How often pending operator alerts are retried, and how long an alert
/// must have been pending first.
const SWEEP_INTERVAL: Duration = Duration::from_secs(60);
const SWEEP_GRACE_SECS: i64 = 120;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    let config = AppConfig::from_env().context("Invalid configuration")?;

    eprintln!("📞 Tradie Desk v{}", env!("CARGO_PKG_VERSION"));
    eprintln!("   Model: {}", config.llm.model);
    eprintln!("   Voice webhook: {}/voice", config.server.base_url);
    eprintln!("   Relay: {}/ws", relay_base(&config.server.base_url));
    eprintln!("   Text webhook: {}/sms", config.server.base_url);

    // ── Database ─────────────────────────────────────────────────────────
    let db: Arc<dyn Database> = Arc::new(
        LibSqlBackend::new_local(std::path::Path::new(&config.server.db_path))
            .await
            .with_context(|| format!("Failed to open database at {}", config.server.db_path))?,
    );
    eprintln!("   Database: {}", config.server.db_path);

    let defaults = &config.tenant;
    let default_tenant = Tenant {
        id: "default".to_string(),
        business_name: defaults.business_name.clone(),
        owner_name: defaults.owner_name.clone(),
        owner_phone: defaults.owner_phone.clone(),
        transport_address: defaults.transport_address.clone(),
        region: defaults.region.clone(),
        active: true,
    };
    if !default_tenant.transport_address.is_empty() {
        db.upsert_tenant(&default_tenant)
            .await
            .context("Failed to seed default tenant")?;
    }
    if default_tenant.owner_phone.is_empty() {
        tracing::warn!("OWNER_PHONE not set; lead alerts will stay pending");
    }

    // ── Services ─────────────────────────────────────────────────────────
    let llm = create_provider(&config.llm).context("Failed to create LLM provider")?;
    let transport: Arc<dyn Transport> = Arc::new(TwilioTransport::new(config.twilio.clone()));

    let extractor = Arc::new(LeadExtractor::new(
        llm.clone(),
        config.urgency.clone(),
        config.session.generation_timeout,
    ));
    let dispatcher = Arc::new(NotificationDispatcher::new(db.clone(), transport.clone()));

    let nurture_engine = Arc::new(
        NurtureEngine::new(
            db.clone(),
            transport.clone(),
            config.nurture.clone(),
            Templates::new(
                defaults.region.clone(),
                config.nurture.trial_link.clone(),
                config.nurture.payment_link.clone(),
            ),
            config.twilio.from_number.clone(),
        )
        .with_speech(config.session.language.clone(), config.session.hints.clone()),
    );

    let sessions = Arc::new(
        SessionController::new(
            db.clone(),
            llm.clone(),
            extractor.clone(),
            dispatcher.clone(),
            config.session.clone(),
            default_tenant.clone(),
        )
        .with_observer(nurture_engine.clone()),
    );

    let sms = Arc::new(
        SmsResponder::new(
            db.clone(),
            llm,
            extractor,
            dispatcher.clone(),
            CommandHandler::new(db.clone(), transport),
            config.session.clone(),
            default_tenant.clone(),
        )
        .with_nurture(nurture_engine.clone()),
    );

    // ── Background tasks ─────────────────────────────────────────────────
    let _sweep_handle = spawn_notification_sweep(
        dispatcher,
        SWEEP_INTERVAL,
        chrono::Duration::seconds(SWEEP_GRACE_SECS),
    );
    let _ticker_handle = nurture::spawn_ticker(nurture_engine.clone(), config.nurture.tick_interval);
    eprintln!(
        "   Campaign: ticking every {}s, batches of {}",
        config.nurture.tick_interval.as_secs(),
        config.nurture.batch_size
    );

    // ── HTTP ─────────────────────────────────────────────────────────────
    let state = AppState {
        db,
        sessions,
        sms,
        nurture: nurture_engine,
        default_tenant,
        relay: RelaySettings {
            url: format!("{}/ws", relay_base(&config.server.base_url)),
            language: config.session.language.clone(),
            hints: config.session.hints.clone(),
        },
    };
    let app = app_routes(state);

    let listener = tokio::net::TcpListener::bind(format!("0.0.0.0:{}", config.server.port))
        .await
        .with_context(|| format!("Failed to bind port {}", config.server.port))?;
    tracing::info!(port = config.server.port, "HTTP server started");
    axum::serve(listener, app).await.context("HTTP server failed")?;

    Ok(())
}

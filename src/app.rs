//! Application wiring
//!
//! Explicitly-constructed components, no shared-module singletons: the
//! context owns every service behind its boundary trait, and the
//! background tasks (timer controller, pub/sub listener, gateway
//! fan-out, settlement sink) run under one cancellation token.

use sqlx::postgres::{PgPool, PgPoolOptions};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::auth::{HsTokenVerifier, TokenVerifier};
use crate::db::{
    AuctionRepo, BidRepo, NotificationRepo, PgAuctionRepo, PgBidRepo, PgNotificationRepo,
    PgUserRepo, UserRepo,
};
use crate::error::Result;
use crate::gateway::Gateway;
use crate::media::{MediaStore, PassthroughMediaStore};
use crate::queue::{RedisStreamQueue, SettlementQueue};
use crate::services::{
    AuctionCloser, AuctionService, BidEngine, SettlementSink, TimerController, UserDirectory,
    WebhookNotifier,
};
use crate::settings::Settings;
use crate::store::keys::Keys;
use crate::store::{LiveStore, PubSubListener, RedisStore};

/// Shared handler state. Cheap to clone; everything heavy is behind an
/// `Arc`.
#[derive(Clone)]
pub struct AppContext {
    pub settings: Settings,
    pub store: Arc<dyn LiveStore>,
    pub verifier: Arc<dyn TokenVerifier>,
    pub gateway: Arc<Gateway>,
    pub directory: Arc<UserDirectory>,
    pub auctions: Arc<AuctionService>,
    pub bid_engine: Arc<BidEngine>,
    pub db: Option<PgPool>,
}

/// Fully wired application plus its background machinery.
pub struct App {
    pub context: AppContext,
    timer: Arc<TimerController>,
    sink: Arc<SettlementSink>,
    listener: PubSubListener,
    fanout_rx: mpsc::Receiver<crate::store::BusMessage>,
}

impl App {
    /// Connect pools, run migrations, and wire every component.
    pub async fn build(settings: Settings) -> anyhow::Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(settings.database.max_connections)
            .connect(&settings.database.url)
            .await?;
        sqlx::migrate!("./migrations").run(&pool).await?;

        let keys = Keys::new(
            settings.redis.key_prefix.clone(),
            settings.redis.connection_prefix.clone(),
        );
        let redis_client = redis::Client::open(settings.redis.url.as_str())?;
        let redis_conn = redis::aio::ConnectionManager::new(redis_client.clone()).await?;

        let store: Arc<dyn LiveStore> =
            Arc::new(RedisStore::new(redis_conn.clone(), keys.clone()));
        let queue_impl = RedisStreamQueue::new(redis_conn, settings.queue.clone());
        queue_impl.ensure_group().await?;
        let queue: Arc<dyn SettlementQueue> = Arc::new(queue_impl);

        let auctions_repo: Arc<dyn AuctionRepo> = Arc::new(PgAuctionRepo::new(pool.clone()));
        let users_repo: Arc<dyn UserRepo> = Arc::new(PgUserRepo::new(pool.clone()));
        let bids_repo: Arc<dyn BidRepo> = Arc::new(PgBidRepo::new(pool.clone()));
        let notifications_repo: Arc<dyn NotificationRepo> =
            Arc::new(PgNotificationRepo::new(pool.clone()));

        let verifier: Arc<dyn TokenVerifier> = Arc::new(HsTokenVerifier::new(&settings.auth)?);
        let media: Arc<dyn MediaStore> = Arc::new(PassthroughMediaStore);

        let closer = Arc::new(AuctionCloser::new(
            store.clone(),
            auctions_repo.clone(),
            users_repo.clone(),
            queue.clone(),
            keys.clone(),
        ));
        let timer = Arc::new(TimerController::new(
            store.clone(),
            auctions_repo.clone(),
            closer.clone(),
            keys.clone(),
            settings.timer.clone(),
            settings.auction.clone(),
        ));
        let bid_engine = Arc::new(BidEngine::new(
            store.clone(),
            auctions_repo.clone(),
            queue.clone(),
            keys.clone(),
            settings.auction.clone(),
            &settings.queue,
        ));
        let auction_service = Arc::new(AuctionService::new(
            store.clone(),
            auctions_repo,
            users_repo.clone(),
            bids_repo.clone(),
            closer,
            timer.clone(),
            media,
            settings.auction.clone(),
        ));
        let directory = Arc::new(UserDirectory::new(users_repo));
        let gateway = Arc::new(Gateway::new(
            store.clone(),
            keys.clone(),
            settings.session.clone(),
        ));

        let notifier = Arc::new(WebhookNotifier::new(
            settings.queue.notify_webhook_url.clone(),
        ));
        let sink = Arc::new(SettlementSink::new(
            queue,
            bids_repo,
            notifications_repo,
            notifier,
            settings.queue.clone(),
        ));

        let (bus_tx, bus_rx) = mpsc::channel(1024);
        let listener = PubSubListener::new(
            redis_client,
            keys.channel_patterns().to_vec(),
            settings.pubsub.clone(),
            bus_tx,
        );

        let context = AppContext {
            settings,
            store,
            verifier,
            gateway,
            directory,
            auctions: auction_service,
            bid_engine,
            db: Some(pool),
        };
        Ok(Self {
            context,
            timer,
            sink,
            listener,
            fanout_rx: bus_rx,
        })
    }

    /// Spawn the long-lived tasks and serve HTTP until shutdown.
    pub async fn run(self, cancel: CancellationToken) -> anyhow::Result<()> {
        let mut tasks: Vec<JoinHandle<()>> = Vec::new();

        tasks.push(tokio::spawn(self.timer.clone().run(cancel.clone())));
        tasks.push(tokio::spawn(self.sink.clone().run(cancel.clone())));
        tasks.push(tokio::spawn(
            self.context
                .gateway
                .clone()
                .run_fanout(self.fanout_rx, cancel.clone()),
        ));
        tasks.push(tokio::spawn(self.listener.run(cancel.clone())));

        let router = crate::handlers::router(self.context.clone());
        let addr: std::net::SocketAddr = self.context.settings.server.bind_addr.parse()?;
        info!(%addr, "http server listening");
        let listener = tokio::net::TcpListener::bind(addr).await?;
        let shutdown = cancel.clone();
        axum::serve(listener, router)
            .with_graceful_shutdown(async move { shutdown.cancelled().await })
            .await?;

        cancel.cancel();
        for task in tasks {
            let _ = task.await;
        }
        Ok(())
    }
}

/// Reachability report for orchestration probes.
pub async fn health(context: &AppContext) -> Result<serde_json::Value> {
    let store_ok = context.store.ping().await.is_ok();
    let db_ok = match &context.db {
        Some(pool) => sqlx::query("SELECT 1").execute(pool).await.is_ok(),
        None => true,
    };
    Ok(serde_json::json!({
        "status": if store_ok && db_ok { "ok" } else { "degraded" },
        "state_store": store_ok,
        "database": db_ok,
    }))
}

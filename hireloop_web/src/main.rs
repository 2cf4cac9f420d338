mod api;
mod identity;

use std::{error::Error, net::SocketAddr, sync::Arc};

use axum_server::tls_rustls::RustlsConfig;
use eventstore::ClientSettings;
use hireloop::{
    domain::{IdGenerator, SystemClock},
    infrastructure::{
        core::{
            EventStoreAgencyRepository, EventStoreResourceRepository, EventStoreReviewRepository,
            EventStoreServiceRequestRepository, EventStoreTimelineRepository,
        },
        search::MeiliResourceSearch,
    },
    usecase::{Marketplace, Repositories, SubscriberRegistry},
    HireloopConfig,
};
use tracing::{error, info, Level};

use crate::{
    api::{router, AppState},
    identity::HeaderIdentity,
};

#[tokio::main]
async fn main() {
    match HireloopConfig::load() {
        Ok(config) => {
            tracing_subscriber::fmt()
                .with_max_level(Level::from(&config.logger.level))
                .init();
            if let Err(error) = serve(&config).await {
                error!("server stopped: {}", error);
            }
        }
        Err(error) => {
            tracing_subscriber::fmt::init();
            error!("failed to load configuration: {}", error)
        }
    }
}

async fn serve(config: &HireloopConfig) -> Result<(), Box<dyn Error>> {
    let settings = config.eventstore.url.parse::<ClientSettings>()?;
    let eventstore = eventstore::Client::new(settings)?;
    let meilisearch =
        meilisearch_sdk::Client::new(&config.meilisearch.url, &config.meilisearch.api_key);
    let repos = Repositories {
        agencies: Arc::new(EventStoreAgencyRepository::new(eventstore.clone())),
        resources: Arc::new(EventStoreResourceRepository::new(eventstore.clone())),
        requests: Arc::new(EventStoreServiceRequestRepository::new(eventstore.clone())),
        timelines: Arc::new(EventStoreTimelineRepository::new(eventstore.clone())),
        reviews: Arc::new(EventStoreReviewRepository::new(eventstore)),
        search: Arc::new(MeiliResourceSearch::new(meilisearch)),
    };
    let registry = Arc::new(SubscriberRegistry::default());
    let marketplace = Marketplace::new(
        repos,
        registry.clone(),
        Arc::new(IdGenerator::default()),
        Arc::new(SystemClock),
        config.booking.clone(),
    );
    let app = router(AppState {
        marketplace: Arc::new(marketplace),
        registry,
        identity: Arc::new(HeaderIdentity),
    });

    let addr = config.web.bind.parse::<SocketAddr>()?;
    match (&config.web.tls_cert, &config.web.tls_key) {
        (Some(cert), Some(key)) => {
            let tls = RustlsConfig::from_pem_file(cert, key).await?;
            info!("listening on https://{}", addr);
            axum_server::bind_rustls(addr, tls)
                .serve(app.into_make_service())
                .await?;
        }
        _ => {
            info!("listening on http://{}", addr);
            axum_server::bind(addr)
                .serve(app.into_make_service())
                .await?;
        }
    }
    Ok(())
}

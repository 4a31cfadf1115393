use custmaster::config::{Config, ConfigOverrides};
use custmaster::crm;
use custmaster::phone;
use custmaster::priority::{PriorityResolver, StaticPriorityResolver};
use custmaster::query::Repo;
use custmaster::repo::memory::MemoryBackend;
use custmaster::repo::persistent::PersistentBackend;
use custmaster::repo::Backend;
use custmaster::service::{
    CustomerGrpcService, CustomerServiceServer, ImportGrpcService, ImportServiceServer,
};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tonic::transport::Server;
use tracing_subscriber::EnvFilter;

fn parse_arg(flag: &str) -> Option<String> {
    let mut args = std::env::args();
    while let Some(arg) = args.next() {
        if arg == flag {
            return args.next();
        }
    }
    None
}

fn has_flag(flag: &str) -> bool {
    std::env::args().any(|arg| arg == flag)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let overrides = ConfigOverrides {
        listen: parse_arg("--listen").map(|v| v.parse()).transpose()?,
        crm_listen: parse_arg("--crm-listen").map(|v| v.parse()).transpose()?,
        phone_region: parse_arg("--phone-region"),
        debug: has_flag("--debug").then_some(true),
    };
    let config = Config::load(parse_arg("--config").as_deref(), overrides)?;

    let normalizer = phone::Normalizer::new(&config.phone_region);

    let backend: Arc<dyn Backend> = match &config.database.path {
        Some(path) => Arc::new(PersistentBackend::open(path, normalizer, config.lock_ttl())?),
        None => {
            tracing::warn!("using in-memory database, data will not be persisted across restarts");
            Arc::new(MemoryBackend::new())
        }
    };

    let repo = Repo::new(backend, normalizer);
    let resolver: Arc<dyn PriorityResolver> =
        Arc::new(StaticPriorityResolver::new(config.priorities.clone()));

    if config.debug {
        tracing::warn!("debug mode: request authentication is disabled");
    }

    let shutdown = CancellationToken::new();
    {
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::info!("shutting down");
                shutdown.cancel();
            }
        });
    }

    let customer_service = CustomerGrpcService::new(repo.clone(), resolver.clone());
    let import_service = ImportGrpcService::new(repo.clone(), resolver, shutdown.clone());

    let grpc = {
        let shutdown = shutdown.clone();
        let listen = config.listen;
        async move {
            tracing::info!(%listen, "gRPC server listening");
            Server::builder()
                .add_service(CustomerServiceServer::new(customer_service))
                .add_service(ImportServiceServer::new(import_service))
                .serve_with_shutdown(listen, shutdown.cancelled())
                .await
                .map_err(anyhow::Error::from)
        }
    };

    let http = {
        let shutdown = shutdown.clone();
        let listen = config.crm_listen;
        let router = crm::router(repo);
        async move {
            let listener = tokio::net::TcpListener::bind(listen).await?;
            tracing::info!(%listen, "CRM lookup endpoint listening");
            axum::serve(listener, router)
                .with_graceful_shutdown(async move { shutdown.cancelled().await })
                .await
                .map_err(anyhow::Error::from)
        }
    };

    tokio::try_join!(grpc, http)?;

    Ok(())
}

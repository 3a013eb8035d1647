use app::{AppError, Config, demo, telemetry};
use persistence::{InMemoryStore, PostRepository, PostgresStore, Store, UserRepository};
use sqlx::postgres::PgPoolOptions;

#[tokio::main]
async fn main() -> Result<(), AppError> {
    let config = Config::from_env();
    telemetry::init(&config)?;

    match &config.database_url {
        Some(url) => {
            tracing::info!(max_connections = config.max_connections, "connecting to PostgreSQL");
            let pool = PgPoolOptions::new()
                .max_connections(config.max_connections)
                .connect(url)
                .await?;
            let store = PostgresStore::new(pool);
            store.run_migrations().await?;
            store.health_check().await?;

            let result = run(store.clone(), store.users(), store.posts(), &config).await;
            store.close().await;
            result
        }
        None => {
            tracing::info!("DATABASE_URL not set, using in-memory store");
            let store = InMemoryStore::new();
            run(store.clone(), store.users(), store.posts(), &config).await
        }
    }
}

async fn run<S, R, P>(store: S, users: R, posts: P, config: &Config) -> Result<(), AppError>
where
    S: Store + Clone,
    R: UserRepository,
    P: PostRepository,
{
    tokio::select! {
        result = demo::run(store, users, posts, config.workflow_timeout) => {
            let summary = result?;
            tracing::info!(?summary, "demo finished");
        }
        () = shutdown_signal() => {
            tracing::info!("shutdown signal received, abandoning demo");
        }
    }
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "failed to install signal handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
    }
}

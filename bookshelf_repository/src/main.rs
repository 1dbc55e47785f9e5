use std::sync::Arc;

use anyhow::Context;
use opentelemetry::global;
use opentelemetry_sdk::propagation::TraceContextPropagator;
use opentelemetry_sdk::runtime::TokioCurrentThread;
use tracing_bunyan_formatter::{BunyanFormattingLayer, JsonStorageLayer};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::{EnvFilter, Registry};

use bookshelf_repository::api::ReadingStatus;
use bookshelf_repository::app_config::{AppConfig, BackendKind};
use bookshelf_repository::backend_switch::move_local_books;
use bookshelf_repository::books_repository::{
    BookChangeFeed, LocalBooksRepository, PostgresBooksRepository,
};
use bookshelf_repository::key_value_store::FileKeyValueStore;
use bookshelf_repository::shelves::Library;

// Based on https://github.com/LukeMathWalker/tracing-actix-web/blob/main/examples/opentelemetry/src/main.rs#L15
fn init_telemetry() {
    let app_name = "bookshelf";

    global::set_text_map_propagator(TraceContextPropagator::new());
    #[allow(deprecated)]
    let tracer = opentelemetry_jaeger::new_agent_pipeline()
        .with_service_name(app_name)
        .install_batch(TokioCurrentThread)
        .expect("Failed to install OpenTelemetry tracer.");

    // Tunable via `RUST_LOG` env variable
    let env_filter = EnvFilter::try_from_default_env().unwrap_or(EnvFilter::new("info"));
    let telemetry = tracing_opentelemetry::layer().with_tracer(tracer);
    // Logs go to stderr, stdout is for the shelves
    let formatting_layer = BunyanFormattingLayer::new(app_name.into(), std::io::stderr);
    let subscriber = Registry::default()
        .with(env_filter)
        .with(telemetry)
        .with(JsonStorageLayer)
        .with(formatting_layer);
    tracing::subscriber::set_global_default(subscriber)
        .expect("Failed to install `tracing` subscriber.")
}

async fn print_shelves(library: &Library) -> anyhow::Result<()> {
    let shelves = library.shelves().await?;
    for status in ReadingStatus::ALL {
        let shelf = shelves.shelf(status);
        println!("{} ({})", status, shelf.len());
        for book in shelf {
            let rating = book
                .rating
                .map(|rating| format!(" [{rating}/5]"))
                .unwrap_or_default();
            println!("  {} by {}{}", book.title, book.author, rating);
        }
    }
    Ok(())
}

async fn follow_changes(
    repository: &PostgresBooksRepository,
    library: &Library,
) -> anyhow::Result<()> {
    let mut subscription = repository
        .subscribe()
        .await
        .context("Failed to subscribe to book changes")?;
    println!("Following changes, press Ctrl-C to stop");

    loop {
        tokio::select! {
            change = subscription.next() => match change {
                Some(change) => {
                    println!("{:?} {}", change.kind, change.book_id);
                    print_shelves(library).await?;
                }
                None => break,
            },
            _ = tokio::signal::ctrl_c() => break,
        }
    }
    subscription.unsubscribe();
    Ok(())
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> anyhow::Result<()> {
    init_telemetry();
    let config = AppConfig::load().context("Failed to load configuration")?;

    let local_repository = Arc::new(LocalBooksRepository::new(Arc::new(
        FileKeyValueStore::new(config.local.data_dir.clone()),
    )));

    match config.backend {
        BackendKind::Local => {
            tracing::info!("Using local books in {}", config.local.data_dir.display());
            print_shelves(&Library::new(local_repository)).await?;
        }
        BackendKind::Remote => {
            let remote_repository = Arc::new(
                PostgresBooksRepository::init(config.remote.repository_config())
                    .await
                    .context("Failed to init postgres")?,
            );
            match config.remote.principal() {
                Some(principal) => {
                    remote_repository.sign_in(principal);
                    move_local_books(&local_repository, remote_repository.as_ref())
                        .await
                        .context("Failed to move local books to the remote backend")?;
                }
                None => tracing::warn!("No remote user configured, shelves will be empty"),
            }

            let library = Library::new(remote_repository.clone());
            print_shelves(&library).await?;
            if config.follow_changes {
                follow_changes(&remote_repository, &library).await?;
            }
        }
    }

    global::shutdown_tracer_provider();
    Ok(())
}

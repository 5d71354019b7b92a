pub mod card;
pub mod config;
pub mod err;
pub mod export;
pub mod gateway;
pub mod ident;
pub mod io;
pub mod models;
pub mod qr;
pub mod registration;
pub mod relay;
pub mod routes;

use std::sync::Arc;

use serde::Serialize;
use tokio::sync::Mutex;

use crate::card::CardCache;
use crate::config::{Backend, Settings};
use crate::err::{Error, Fine, Maybe, Nothing};
use crate::export::DocumentExporter;
use crate::gateway::{FileGateway, MemoryGateway, PersistenceGateway, PgGateway};
use crate::io::PhotoStore;
use crate::qr::CodeOptions;
use crate::relay::{EmailRelay, Notifier};
use crate::routes::AppState;

/// Handler result. `Maybe` carries its own status, so a `breaks` answer keeps
/// the error's status code.
pub type Payload<T> = axum::response::Result<Maybe<T>, Error>;

pub fn proceeds<V>(value: V) -> Payload<V> where V: Serialize {
    Ok(Fine(value))
}

pub fn breaks<V>(err: Error) -> Payload<V> where V: Serialize {
    Ok(Nothing(err))
}

async fn gateway(settings: &Settings, photos: PhotoStore) -> anyhow::Result<Arc<dyn PersistenceGateway>> {
    let root = &settings.storage.data_dir;
    Ok(match settings.storage.backend {
        Backend::Postgres => {
            io::prepare_io(root).await?;
            Arc::new(PgGateway::connect(&settings.database.url, photos).await?)
        }
        Backend::File => {
            io::prepare_io(root).await?;
            Arc::new(FileGateway::new(root, photos))
        }
        Backend::Memory => {
            log::warn!("Using in-memory storage, registrations are lost on restart");
            Arc::new(MemoryGateway::new())
        }
    })
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::init();
    let settings = Settings::new()?;

    let photos = PhotoStore::new(
        settings.storage.data_dir.join("photos"),
        settings.storage.photo_base_url.clone(),
    );
    let gateway = gateway(&settings, photos.clone()).await?;
    let notifier = settings.relay.url.as_ref().map(|url| {
        log::info!("Relaying registrations to {}", url);
        Arc::new(EmailRelay::new(url.clone())) as Arc<dyn Notifier>
    });

    let state = Arc::new(AppState {
        gateway,
        notifier,
        photos,
        photo_base_url: settings.storage.photo_base_url.trim_end_matches('/').to_string(),
        exporter: DocumentExporter::new(settings.card.supersample, settings.card.export_wait()),
        code_options: CodeOptions {
            target_size_px: settings.card.qr_size_px,
            ..CodeOptions::default()
        },
        cards: Mutex::new(CardCache::new(settings.card.cache_size)),
    });
    let app = routes::app(state);

    let addr = settings.addr();
    log::info!("Starting Fahm Ul Quran registration server on http://{}", addr);
    axum::Server::bind(&addr)
        .serve(app.into_make_service())
        .await?;
    Ok(())
}

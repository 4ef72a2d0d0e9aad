use actix_cors::Cors;
use actix_web::{middleware, web, App, HttpServer};
use std::io;
use std::sync::Arc;

use stash_vm::api::{self, AppState};
use stash_vm::auth::AuthService;
use stash_vm::config::Config;
use stash_vm::content::FsContentStore;
use stash_vm::notify::{LogNotifier, Notifier, WebhookNotifier};
use stash_vm::purge::PurgeWorker;
use stash_vm::store::{Store, StoreError};

#[actix_web::main]
async fn main() -> io::Result<()> {
    // Initialize logger
    env_logger::init_from_env(env_logger::Env::default().default_filter_or("info"));

    let config = Config::from_env().map_err(io::Error::other)?;

    let content = FsContentStore::new(&config.content_path).map_err(io::Error::other)?;

    let notifier: Arc<dyn Notifier> = match &config.notify_webhook_url {
        Some(url) => {
            log::info!("Delivering notifications to {}", url);
            Arc::new(WebhookNotifier::spawn(url.clone()))
        }
        None => Arc::new(LogNotifier),
    };

    // Initialize store
    let store = Arc::new(
        Store::new(&config.database_path)
            .map_err(io::Error::other)?
            .with_content_store(Arc::new(content))
            .with_notifier(notifier),
    );

    promote_admins(&store, &config);

    let auth_service = Arc::new(AuthService::new(&config.jwt_secret, config.token_ttl));

    log::info!("Database: {}", config.database_path);
    log::info!("Content store: {}", config.content_path.display());
    if config.invite_required() {
        log::info!("Registration requires an invite code");
    }

    let worker = PurgeWorker::new(store.clone(), config.purge_poll_interval).start();

    let port = config.port;
    let config = Arc::new(config);
    let server = HttpServer::new(move || {
        let cors = Cors::default()
            .allow_any_origin()
            .allow_any_method()
            .allow_any_header()
            .max_age(3600);

        App::new()
            .wrap(middleware::Logger::default())
            .wrap(cors)
            // Registered on its own for the AuthUser extractor
            .app_data(web::Data::new(auth_service.clone()))
            .app_data(web::Data::new(AppState {
                store: store.clone(),
                auth_service: auth_service.clone(),
                config: config.clone(),
            }))
            // Image uploads
            .app_data(web::PayloadConfig::new(20 * 1024 * 1024))
            .configure(api::configure_routes)
    });

    log::info!("Starting stash-vm server on port {}", port);
    let result = server.bind(("0.0.0.0", port))?.run().await;

    worker.stop().await;
    result
}

/// Give admin rights to existing accounts listed in `ADMIN_EMAILS`.
/// Accounts registered later are promoted on registration.
fn promote_admins(store: &Store, config: &Config) {
    for email in &config.admin_emails {
        match store.get_user_by_email(email) {
            Ok(user) if user.is_admin => {}
            Ok(user) => match store.set_admin(&user.id, true) {
                Ok(()) => log::info!("Granted admin rights to {}", email),
                Err(e) => log::error!("Failed to grant admin rights to {}: {}", email, e),
            },
            Err(StoreError::NotFound(_)) => {}
            Err(e) => log::error!("Failed to look up admin {}: {}", email, e),
        }
    }
}

pub mod daemon;
pub mod index;
pub mod metrics;
pub mod subscription;

pub use daemon::{daemon_status, restart_process};
pub use index::index;
pub use metrics::get_metrics;
pub use subscription::download_subscription;

use actix_web::{web, HttpResponse, Responder};
use chrono::Utc;

use crate::state::AppState;

pub async fn health(data: web::Data<AppState>) -> impl Responder {
    HttpResponse::Ok().json(serde_json::json!({
        "status": "healthy",
        "timestamp": Utc::now(),
        "uptime": data.started_at.elapsed().as_secs()
    }))
}

/// Registers every control-surface route; the subscription lives under `sub_path`.
pub fn routes(cfg: &mut web::ServiceConfig, sub_path: &str) {
    cfg.route("/", web::get().to(index))
        .route("/daemon-status", web::get().to(daemon_status))
        .route("/restart/{process}", web::post().to(restart_process))
        .route("/health", web::get().to(health))
        .route("/metrics", web::get().to(get_metrics))
        .route(
            &format!("/{}", sub_path.trim_start_matches('/')),
            web::get().to(download_subscription),
        );
}

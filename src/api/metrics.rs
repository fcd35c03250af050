use actix_web::{web, HttpResponse, Responder};

use crate::state::AppState;

pub async fn get_metrics(data: web::Data<AppState>) -> impl Responder {
    // 每次抓取时从快照重建
    match data.metrics.scrape(&data.supervisor.status()) {
        Ok(metrics_text) => HttpResponse::Ok()
            .content_type("text/plain; version=0.0.4")
            .body(metrics_text),
        Err(e) => {
            log::error!("Failed to render metrics: {}", e);
            HttpResponse::InternalServerError().body("Failed to render metrics")
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::{routes, testing};
    use actix_web::{test, App};
    use tempfile::TempDir;

    #[actix_rt::test]
    async fn test_metrics_exposition() {
        let dir = TempDir::new().unwrap();
        let state = testing::state(dir.path(), &[]);
        let app = test::init_service(
            App::new()
                .app_data(web::Data::new(state))
                .configure(|cfg| routes(cfg, "sub")),
        )
        .await;

        let req = test::TestRequest::get().uri("/metrics").to_request();
        let resp = test::call_service(&app, req).await;
        assert!(resp.status().is_success());
        assert!(resp
            .headers()
            .get("content-type")
            .unwrap()
            .to_str()
            .unwrap()
            .starts_with("text/plain"));

        let text = String::from_utf8(test::read_body(resp).await.to_vec()).unwrap();
        assert!(text.contains("daemon_uptime_seconds"));
    }
}

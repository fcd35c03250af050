use actix_web::http::header::{ContentDisposition, DispositionParam, DispositionType};
use actix_web::{web, HttpResponse, Responder};

use crate::services::subscription::{self as feed, SUBSCRIPTION_FILE};
use crate::state::AppState;

const FALLBACK_DOMAIN: &str = "example.trycloudflare.com";

/// Returns `sub.txt`, rendering it from the current tunnel domain first when missing.
pub async fn download_subscription(data: web::Data<AppState>) -> impl Responder {
    let path = data.config.file_path.join(SUBSCRIPTION_FILE);

    if !path.exists() {
        let mut domain = data.supervisor.tunnel_info().domain;
        if domain.is_empty() {
            domain = FALLBACK_DOMAIN.to_string();
        }

        if let Err(e) = feed::generate(&data.config, &domain) {
            log::error!("Failed to generate subscription: {:#}", e);
            return HttpResponse::ServiceUnavailable()
                .body("subscription not ready, try again later");
        }
    }

    match tokio::fs::read(&path).await {
        Ok(body) => HttpResponse::Ok()
            .content_type("text/plain; charset=utf-8")
            .insert_header(ContentDisposition {
                disposition: DispositionType::Attachment,
                parameters: vec![DispositionParam::Filename("subscription.txt".to_string())],
            })
            .body(body),
        Err(e) => {
            log::error!("Failed to read {}: {}", path.display(), e);
            HttpResponse::InternalServerError().body("failed to read subscription")
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::{routes, testing};
    use actix_web::http::StatusCode;
    use actix_web::{test, App};
    use base64::engine::general_purpose::STANDARD as BASE64;
    use base64::Engine;
    use tempfile::TempDir;

    #[actix_rt::test]
    async fn test_missing_file_is_generated_with_fallback_domain() {
        let dir = TempDir::new().unwrap();
        let state = testing::state(dir.path(), &[]);
        let app = test::init_service(
            App::new()
                .app_data(web::Data::new(state))
                .configure(|cfg| routes(cfg, "sub")),
        )
        .await;

        let req = test::TestRequest::get().uri("/sub").to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), StatusCode::OK);

        let disposition = resp.headers().get("content-disposition").unwrap().to_str().unwrap();
        assert!(disposition.contains("subscription.txt"));

        let body = test::read_body(resp).await;
        let links = String::from_utf8(BASE64.decode(&body).unwrap()).unwrap();
        assert!(links.contains("sni=example.trycloudflare.com"));
        assert!(dir.path().join(SUBSCRIPTION_FILE).exists());
    }

    #[actix_rt::test]
    async fn test_known_domain_is_used() {
        let dir = TempDir::new().unwrap();
        let state = testing::state(dir.path(), &[]);
        state.supervisor.set_tunnel_info("temporary", "bold-fox.trycloudflare.com");
        let app = test::init_service(
            App::new()
                .app_data(web::Data::new(state))
                .configure(|cfg| routes(cfg, "sub")),
        )
        .await;

        let req = test::TestRequest::get().uri("/sub").to_request();
        let body = test::call_and_read_body(&app, req).await;
        let links = String::from_utf8(BASE64.decode(&body).unwrap()).unwrap();
        assert!(links.contains("host=bold-fox.trycloudflare.com"));
    }

    #[actix_rt::test]
    async fn test_unwritable_directory_is_503() {
        let dir = TempDir::new().unwrap();
        let state = testing::state(&dir.path().join("missing"), &[]);
        let app = test::init_service(
            App::new()
                .app_data(web::Data::new(state))
                .configure(|cfg| routes(cfg, "sub")),
        )
        .await;

        let req = test::TestRequest::get().uri("/sub").to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), StatusCode::SERVICE_UNAVAILABLE);
    }
}

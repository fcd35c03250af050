use actix_web::{web, HttpResponse, Responder};
use serde_json::json;

use crate::error::SupervisorError;
use crate::models::process::{ALL, MANAGED_PROCESSES};
use crate::state::AppState;

pub async fn daemon_status(data: web::Data<AppState>) -> impl Responder {
    let snapshot = data.supervisor.status();

    HttpResponse::Ok().json(json!({
        "success": true,
        "data": snapshot,
        "message": "status query succeeded"
    }))
}

/// 重启进程：先由 supervisor 清零状态，再通过 launcher 重新生成配置并启动
pub async fn restart_process(
    data: web::Data<AppState>,
    path: web::Path<String>,
) -> impl Responder {
    let target = path.into_inner();

    if target != ALL && !MANAGED_PROCESSES.contains(&target.as_str()) {
        return HttpResponse::BadRequest().json(json!({
            "success": false,
            "message": format!(
                "invalid process name '{}', expected one of: {}, {}",
                target,
                MANAGED_PROCESSES.join(", "),
                ALL
            )
        }));
    }

    let names = match data.supervisor.restart(&target) {
        Ok(names) => names,
        Err(e @ SupervisorError::NotFound(_)) => {
            return HttpResponse::NotFound().json(json!({
                "success": false,
                "message": e.to_string()
            }));
        }
        Err(e) => {
            log::error!("❌ Restart of {} failed: {}", target, e);
            return HttpResponse::InternalServerError().json(json!({
                "success": false,
                "message": e.to_string()
            }));
        }
    };

    let mut failures = Vec::new();
    for name in &names {
        match data.launcher.launch(name) {
            Ok(pid) => log::info!("🔄 Process {} relaunched (PID: {:?})", name, pid),
            Err(e) => {
                log::error!("❌ Relaunch of {} failed: {:#}", name, e);
                failures.push(format!("{}: {:#}", name, e));
            }
        }
    }

    if !failures.is_empty() {
        return HttpResponse::InternalServerError().json(json!({
            "success": false,
            "message": failures.join("; ")
        }));
    }

    HttpResponse::Ok().json(json!({
        "success": true,
        "message": format!("restart of {} issued", target),
        "restarted": names
    }))
}

use actix_web::{web, HttpResponse, Responder};
use std::time::Duration;

use crate::state::AppState;

const INDEX_FILE: &str = "index.html";

/// Compact uptime: `3d 4h 5m`, `4h 5m`, `5m 6s` or `6s`.
pub fn format_duration(d: Duration) -> String {
    let total = d.as_secs();
    let days = total / 86_400;
    let hours = (total % 86_400) / 3_600;
    let minutes = (total % 3_600) / 60;
    let seconds = total % 60;

    if days > 0 {
        format!("{}d {}h {}m", days, hours, minutes)
    } else if hours > 0 {
        format!("{}h {}m", hours, minutes)
    } else if minutes > 0 {
        format!("{}m {}s", minutes, seconds)
    } else {
        format!("{}s", seconds)
    }
}

/// Serves `./index.html` when present, otherwise a generated control page.
pub async fn index(data: web::Data<AppState>) -> impl Responder {
    if let Ok(page) = tokio::fs::read_to_string(INDEX_FILE).await {
        return HttpResponse::Ok()
            .content_type("text/html; charset=utf-8")
            .body(page);
    }

    HttpResponse::Ok()
        .content_type("text/html; charset=utf-8")
        .body(render_page(&data))
}

fn render_page(state: &AppState) -> String {
    let config = &state.config;
    let uptime = format_duration(state.started_at.elapsed());
    let sub_path = &config.sub_path;

    format!(
        r#"<!DOCTYPE html>
<html>
<head>
    <title>Tunnel Server</title>
    <meta charset="utf-8">
    <meta name="viewport" content="width=device-width, initial-scale=1">
    <style>
        body {{ font-family: Arial, sans-serif; margin: 40px; line-height: 1.6; }}
        .container {{ max-width: 800px; margin: 0 auto; }}
        .status {{ background: #f4f4f4; padding: 20px; border-radius: 5px; margin: 20px 0; }}
        .btn {{ display: inline-block; background: #007bff; color: white; padding: 10px 20px; text-decoration: none; border-radius: 5px; margin: 5px; }}
    </style>
</head>
<body>
    <div class="container">
        <h1>🏔️ Tunnel Server</h1>
        <p>Uptime: {uptime}</p>

        <div class="status">
            <h2>📊 Status</h2>
            <p><a href="/daemon-status" class="btn">Process status</a> <a href="/metrics" class="btn">Metrics</a></p>
            <p><a href="/{sub_path}" class="btn">Download subscription</a></p>

            <h3>🔄 Restart</h3>
            <p>
                <a href="javascript:restartProcess('nezha')" class="btn">nezha</a>
                <a href="javascript:restartProcess('xray')" class="btn">xray</a>
                <a href="javascript:restartProcess('tunnel')" class="btn">tunnel</a>
                <a href="javascript:restartProcess('all')" class="btn">all</a>
            </p>
        </div>

        <ul>
            <li><strong>Subscription:</strong> <code>/{sub_path}</code></li>
            <li><strong>Control port:</strong> {port}</li>
            <li><strong>External port:</strong> {external_port}</li>
            <li><strong>UUID:</strong> {uuid}</li>
        </ul>
    </div>

    <script>
        function restartProcess(process) {{
            fetch('/restart/' + process, {{ method: 'POST' }})
                .then(response => response.json())
                .then(data => {{
                    alert(data.message || 'restart issued');
                    setTimeout(() => location.reload(), 2000);
                }})
                .catch(error => alert('restart failed: ' + error));
        }}
    </script>
</body>
</html>
"#,
        port = config.port,
        external_port = config.external_port,
        uuid = config.uuid,
    )
}

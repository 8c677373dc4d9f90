//! HTML control surface.
//!
//! Small server-rendered pages; the heavier interactivity (layout editor,
//! live charts) is driven by the JSON/SSE API from inline scripts. Pages
//! share one stylesheet and escape every interpolated value.

use decenza_history::{ShotFilter, ShotRecord, ShotSummary};

use crate::http::{RequestHead, Response};
use crate::ServerState;

const STYLE: &str = r"
  body { font-family: system-ui, sans-serif; margin: 2rem; background: #1b1b1d; color: #eee; }
  a { color: #7fb4ff; text-decoration: none; }
  table { border-collapse: collapse; width: 100%; }
  th, td { padding: .4rem .7rem; border-bottom: 1px solid #333; text-align: left; }
  .card { background: #242428; border-radius: 8px; padding: 1rem 1.5rem; margin: 1rem 0; }
  .muted { color: #999; }
";

/// HTML-escape an interpolated value.
#[must_use]
pub fn escape(text: &str) -> String {
    text.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
}

fn page(title: &str, body: &str) -> Response {
    Response::html(format!(
        "<!DOCTYPE html><html><head><meta charset=\"utf-8\">\
         <meta name=\"viewport\" content=\"width=device-width, initial-scale=1\">\
         <title>{}</title><style>{STYLE}</style></head><body>{body}</body></html>",
        escape(title)
    ))
}

/// `GET /` — the landing page.
pub async fn index(state: &ServerState) -> Response {
    let machine = if state.device().is_some() { "attached" } else { "not attached" };
    let body = format!(
        "<h1>Decenza</h1>\
         <div class=\"card\"><p>Machine: {machine}</p>\
         <p>Shots recorded: {}</p></div>\
         <ul>\
           <li><a href=\"/shots\">Shot history</a></li>\
           <li><a href=\"/debug\">Debug</a></li>\
         </ul>",
        state.history.total_shots()
    );
    page("Decenza", &body)
}

fn shot_row(shot: &ShotSummary) -> String {
    let ratio = if shot.dose_weight > 0.0 {
        format!("1:{:.1}", shot.final_weight / shot.dose_weight)
    } else {
        "-".to_string()
    };
    format!(
        "<tr><td><a href=\"/shot/{}\">#{}</a></td><td>{}</td><td>{}</td>\
         <td>{:.1}g\u{2192}{:.1}g ({ratio})</td><td>{:.0}s</td><td>{}</td></tr>",
        shot.id,
        shot.id,
        escape(&shot.profile_name),
        escape(&format!("{} {}", shot.bean_brand, shot.bean_type)),
        shot.dose_weight,
        shot.final_weight,
        shot.duration,
        if shot.enjoyment > 0 { format!("{}/100", shot.enjoyment) } else { "-".to_string() },
    )
}

/// `GET /shots` — the paged shot list.
pub async fn shot_list(state: &ServerState) -> Response {
    let shots = match state
        .history
        .request_shots_filtered(ShotFilter::default(), 0, 50)
        .await
    {
        Ok(Some((shots, _))) => shots,
        _ => Vec::new(),
    };

    let rows: String = shots.iter().map(shot_row).collect();
    let body = format!(
        "<h1>Shot history</h1><div class=\"card\"><table>\
         <tr><th>Shot</th><th>Profile</th><th>Bean</th><th>Dose\u{2192}Yield</th>\
         <th>Time</th><th>Score</th></tr>{rows}</table></div>\
         <p class=\"muted\">Showing the latest {} shots. \
         <a href=\"/api/shots\">JSON API</a></p>",
        shots.len()
    );
    page("Shot history", &body)
}

fn record_card(record: &ShotRecord) -> String {
    let summary = &record.summary;
    let mut card = format!(
        "<div class=\"card\"><h2>#{} {}</h2>\
         <p>{:.1}g \u{2192} {:.1}g in {:.0}s</p>",
        summary.id,
        escape(&summary.profile_name),
        summary.dose_weight,
        summary.final_weight,
        summary.duration,
    );
    if !summary.bean_brand.is_empty() || !summary.bean_type.is_empty() {
        card.push_str(&format!(
            "<p>Bean: {} {}</p>",
            escape(&summary.bean_brand),
            escape(&summary.bean_type)
        ));
    }
    if !record.grinder_model.is_empty() {
        card.push_str(&format!(
            "<p>Grinder: {} @ {}</p>",
            escape(&record.grinder_model),
            escape(&summary.grinder_setting)
        ));
    }
    if !record.espresso_notes.is_empty() {
        card.push_str(&format!("<p>Notes: {}</p>", escape(&record.espresso_notes)));
    }
    for phase in &record.phases {
        card.push_str(&format!(
            "<p class=\"muted\">{:.1}s {} (frame {}{})</p>",
            phase.time,
            escape(&phase.label),
            phase.frame_number,
            if phase.transition_reason.is_empty() {
                String::new()
            } else {
                format!(", exit on {}", escape(&phase.transition_reason))
            }
        ));
    }
    card.push_str("</div>");
    card
}

/// `GET /shot/:id` — one shot's detail view.
pub async fn shot_detail(state: &ServerState, shot_id: i64) -> Response {
    match state.history.get_shot(shot_id).await {
        Ok(Some(record)) => {
            let channels: Vec<String> = record.samples.keys().cloned().collect();
            let body = format!(
                "{}<p class=\"muted\">Channels: {}</p><p><a href=\"/shots\">Back</a></p>",
                record_card(&record),
                escape(&channels.join(", "))
            );
            page(&format!("Shot #{shot_id}"), &body)
        },
        Ok(None) => Response::error(404, "shot not found"),
        Err(e) => {
            tracing::warn!(error = %e, shot_id, "shot load failed");
            Response::error(500, "failed to load shot")
        },
    }
}

/// `GET /compare?ids=1,2,...` — side-by-side comparison.
pub async fn compare(state: &ServerState, head: &RequestHead) -> Response {
    let params = head.query_params();
    let ids: Vec<i64> = params
        .get("ids")
        .map(|value| value.split(',').filter_map(|id| id.trim().parse().ok()).collect())
        .unwrap_or_default();
    if ids.is_empty() {
        return Response::error(400, "missing ids");
    }

    match state.history.get_shots(ids).await {
        Ok(records) => {
            let cards: String = records.iter().map(record_card).collect();
            page("Compare shots", &format!("<h1>Compare</h1>{cards}"))
        },
        Err(e) => {
            tracing::warn!(error = %e, "comparison load failed");
            Response::error(500, "failed to load shots")
        },
    }
}

/// `GET /debug` — server internals at a glance.
pub fn debug(state: &ServerState) -> Response {
    let body = format!(
        "<h1>Debug</h1><div class=\"card\">\
         <p>Version: {}</p>\
         <p>Database: {}</p>\
         <p>Total shots: {}</p>\
         <p>Backups: {}</p></div>",
        escape(&state.config.version),
        escape(&state.history.db_path().display().to_string()),
        state.history.total_shots(),
        state.backup.available_backups().len(),
    );
    page("Debug", &body)
}

/// `GET /auth/login` — the TOTP login form.
#[must_use]
pub fn login_page(failed: bool) -> String {
    let notice = if failed {
        "<p class=\"muted\">Code not accepted, try again.</p>"
    } else {
        ""
    };
    format!(
        "<!DOCTYPE html><html><head><meta charset=\"utf-8\"><title>Sign in</title>\
         <style>{STYLE}</style></head><body><h1>Sign in</h1>{notice}\
         <form method=\"post\" action=\"/auth/login\" class=\"card\">\
         <label>Authenticator code <input name=\"code\" inputmode=\"numeric\" \
         autocomplete=\"one-time-code\" autofocus></label> \
         <button type=\"submit\">Sign in</button></form></body></html>"
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn escape_neutralizes_html() {
        assert_eq!(escape("<script>\"&\"</script>"),
            "&lt;script&gt;&quot;&amp;&quot;&lt;/script&gt;");
    }

    #[test]
    fn login_page_has_form() {
        let html = login_page(false);
        assert!(html.contains("action=\"/auth/login\""));
        assert!(html.contains("name=\"code\""));
        assert!(!html.contains("not accepted"));
        assert!(login_page(true).contains("not accepted"));
    }
}

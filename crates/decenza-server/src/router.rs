//! Route dispatch and handlers.
//!
//! The URL surface is fixed; unknown paths 404, method mismatches 405.
//! When a TOTP secret is configured every route outside `/auth/*` requires
//! a live session: API callers get 401, page requests are redirected to
//! the login form.

use std::net::SocketAddr;
use std::sync::Arc;

use decenza_backup::RestoreOptions;
use decenza_core::Value;
use decenza_history::ShotFilter;
use decenza_history::model::FavoriteGroupBy;

use crate::http::{RequestHead, Response};
use crate::sse::SseTopic;
use crate::{Body, HealthProbe, PROBE_TIMEOUT, ServerState, auth, pages};

/// Settings key holding the base32 TOTP secret.
pub const TOTP_SECRET_KEY: &str = "totpSecret";
/// Settings key holding the layout item list.
const LAYOUT_ITEMS_KEY: &str = "layout/items";
/// Settings key holding the per-zone offsets map.
const LAYOUT_ZONE_OFFSETS_KEY: &str = "layout/zoneOffsets";
/// Prefix for theme keys.
const THEME_PREFIX: &str = "theme/";

/// Map a request to its SSE topic, if it targets one.
#[must_use]
pub fn sse_topic(head: &RequestHead) -> Option<SseTopic> {
    match (head.method.as_str(), head.path.as_str()) {
        ("GET", "/events/layout") => Some(SseTopic::Layout),
        ("GET", "/events/theme") => Some(SseTopic::Theme),
        _ => None,
    }
}

/// Whether this request carries a valid session (or none is needed).
#[must_use]
pub fn is_authorized(state: &ServerState, head: &RequestHead) -> bool {
    if head.path.starts_with("/auth/") {
        return true;
    }
    let secret = state.settings.string_or(TOTP_SECRET_KEY, "");
    if secret.is_empty() {
        // No second factor configured: the surface is open
        return true;
    }
    head.cookie("session").is_some_and(|token| state.sessions.check(token))
}

/// Dispatch one request to its handler.
pub async fn dispatch(
    state: &Arc<ServerState>,
    head: &RequestHead,
    body: &Body,
    peer: SocketAddr,
) -> Response {
    if !is_authorized(state, head) {
        // Pages redirect to login, API calls get a bare 401
        if head.method == "GET" && !head.path.starts_with("/api/") {
            return Response::redirect("/auth/login", None);
        }
        return Response::error(401, "unauthorized");
    }

    let method = head.method.as_str();
    let path = head.path.as_str();

    match (method, path) {
        // HTML surface
        ("GET", "/") => pages::index(state).await,
        ("GET", "/shots") => pages::shot_list(state).await,
        ("GET", "/debug") => pages::debug(state),
        ("GET", "/compare") => pages::compare(state, head).await,

        // Shots API
        ("GET", "/api/shots") => api_shots(state, head).await,
        ("GET", "/api/favorites") => api_favorites(state, head).await,

        // Layout
        ("GET", "/api/layout") => Response::json(&layout_json(state)),
        ("POST", "/api/layout/ai") => {
            probe_response(state.probes.layout_ai.clone(), body.json(), "AI layout design").await
        },

        // Theme
        ("GET", "/api/theme") => Response::json(&theme_json(state)),

        // Settings
        ("GET", "/api/settings") => Response::json(&state.settings.export_json(false)),
        ("POST", "/api/settings") => api_save_settings(state, body),
        ("POST", "/api/settings/visualizer/test") => {
            probe_response(state.probes.visualizer.clone(), body.json(), "Visualizer").await
        },
        ("POST", "/api/settings/ai/test") => {
            probe_response(state.probes.ai.clone(), body.json(), "AI provider").await
        },
        ("POST", "/api/settings/mqtt/connect") => {
            probe_response(state.probes.mqtt_connect.clone(), body.json(), "MQTT").await
        },
        ("POST", "/api/settings/mqtt/disconnect") => {
            Response::json(&serde_json::json!({"ok": true, "message": "disconnected"}))
        },
        ("POST", "/api/settings/mqtt/status") => {
            probe_response(state.probes.mqtt_status.clone(), body.json(), "MQTT").await
        },
        ("POST", "/api/settings/mqtt/publish-discovery") => {
            probe_response(state.probes.mqtt_connect.clone(), body.json(), "MQTT").await
        },

        // Backup API
        ("GET", "/api/backup/manifest") => api_backup_manifest(state),
        ("GET", "/api/backup/settings") => Response::json(&state.settings.export_json(false)),
        ("GET", "/api/backup/profiles") => api_backup_profiles_list(state),
        ("GET", "/api/backup/media") => api_backup_media_list(state),
        ("GET", "/api/backup/ai-conversations") => {
            Response::json(&state.conversations.export_all())
        },
        ("GET", "/api/backup/full") => api_backup_full(state).await,
        ("POST", "/api/backup/restore") => api_backup_restore(state, head, body).await,

        // OTA upload
        ("POST", "/upload") => api_ota_upload(state, head, body),

        // Auth
        ("GET", "/auth/login") => Response::html(pages::login_page(false)),
        ("POST", "/auth/login") => auth_login(state, head, body, peer),
        ("POST", "/auth/logout") | ("GET", "/auth/logout") => auth_logout(state, head),

        _ => dispatch_dynamic(state, head, body).await,
    }
}

/// Routes with path parameters or verb suffixes.
async fn dispatch_dynamic(
    state: &Arc<ServerState>,
    head: &RequestHead,
    body: &Body,
) -> Response {
    let method = head.method.as_str();
    let path = head.path.as_str();

    if let Some(rest) = path.strip_prefix("/shot/") {
        if method != "GET" {
            return Response::error(405, "method not allowed");
        }
        return match rest.parse::<i64>() {
            Ok(id) => pages::shot_detail(state, id).await,
            Err(_) => Response::error(404, "not found"),
        };
    }

    if let Some(op) = path.strip_prefix("/api/layout/") {
        if method != "POST" {
            return Response::error(405, "method not allowed");
        }
        return api_layout_mutate(state, op, &body.json());
    }

    if let Some(op) = path.strip_prefix("/api/theme/") {
        if method != "POST" {
            return Response::error(405, "method not allowed");
        }
        return api_theme_mutate(state, op, &body.json());
    }

    if let Some(rest) = path.strip_prefix("/api/backup/profiles/") {
        if method != "GET" {
            return Response::error(405, "method not allowed");
        }
        return api_backup_profile_file(state, rest);
    }

    if let Some(file) = path.strip_prefix("/api/backup/media/") {
        if method != "GET" {
            return Response::error(405, "method not allowed");
        }
        return api_backup_media_file(state, file);
    }

    if let Some(rest) = path.strip_prefix("/api/machine/") {
        if method != "POST" {
            return Response::error(405, "method not allowed");
        }
        return api_machine(state, rest);
    }

    Response::error(404, "not found")
}

// --- Shots ---

fn filter_from_query(head: &RequestHead) -> ShotFilter {
    let params = head.query_params();
    let text = |key: &str| params.get(key).filter(|v| !v.is_empty()).cloned();
    let int = |key: &str| params.get(key).and_then(|v| v.parse::<i64>().ok());
    let real = |key: &str| params.get(key).and_then(|v| v.parse::<f64>().ok());

    ShotFilter {
        profile_name: text("profileName"),
        bean_brand: text("beanBrand"),
        bean_type: text("beanType"),
        grinder_model: text("grinderModel"),
        grinder_setting: text("grinderSetting"),
        roast_level: text("roastLevel"),
        min_enjoyment: int("minEnjoyment"),
        max_enjoyment: int("maxEnjoyment"),
        min_dose: real("minDose"),
        max_dose: real("maxDose"),
        min_yield: real("minYield"),
        max_yield: real("maxYield"),
        min_duration: real("minDuration"),
        max_duration: real("maxDuration"),
        min_tds: real("minTds"),
        max_tds: real("maxTds"),
        min_ey: real("minEy"),
        max_ey: real("maxEy"),
        date_from: int("dateFrom"),
        date_to: int("dateTo"),
        search_text: text("search"),
        only_with_visualizer: params.get("onlyWithVisualizer").is_some_and(|v| v == "true"),
        sort_field: text("sortField"),
        sort_direction: text("sortDirection"),
    }
}

async fn api_shots(state: &ServerState, head: &RequestHead) -> Response {
    let params = head.query_params();
    let offset = params.get("offset").and_then(|v| v.parse().ok()).unwrap_or(0);
    let limit = params
        .get("limit")
        .and_then(|v| v.parse().ok())
        .unwrap_or(50)
        .clamp(1, 500);
    let filter = filter_from_query(head);

    match state.history.request_shots_filtered(filter, offset, limit).await {
        Ok(Some((shots, total))) => Response::json(&serde_json::json!({
            "shots": shots,
            "totalCount": total,
            "offset": offset,
            "limit": limit,
        })),
        // A newer request superseded this page
        Ok(None) => Response::json(&serde_json::json!({
            "shots": [], "totalCount": 0, "offset": offset, "limit": limit, "stale": true,
        })),
        Err(e) => {
            tracing::warn!(error = %e, "shot query failed");
            Response::error(500, "query failed")
        },
    }
}

async fn api_favorites(state: &ServerState, head: &RequestHead) -> Response {
    let params = head.query_params();
    let group_by =
        FavoriteGroupBy::from_key(params.get("groupBy").map_or("bean_profile", String::as_str));
    let max_items = params.get("maxItems").and_then(|v| v.parse().ok()).unwrap_or(10);

    match state.history.auto_favorites(group_by, max_items).await {
        Ok(favorites) => Response::json(&serde_json::json!({ "favorites": favorites })),
        Err(e) => {
            tracing::warn!(error = %e, "favorites query failed");
            Response::error(500, "query failed")
        },
    }
}

// --- Layout ---

fn layout_json(state: &ServerState) -> serde_json::Value {
    let items = state
        .settings
        .get(LAYOUT_ITEMS_KEY)
        .map_or(serde_json::Value::Array(Vec::new()), |v| v.to_json());
    let offsets = state
        .settings
        .get(LAYOUT_ZONE_OFFSETS_KEY)
        .map_or_else(|| serde_json::json!({}), |v| v.to_json());
    serde_json::json!({ "items": items, "zoneOffsets": offsets })
}

fn store_layout_items(state: &ServerState, items: Vec<serde_json::Value>) -> Response {
    let value =
        Value::from_json(&serde_json::Value::Array(items)).unwrap_or(Value::List(Vec::new()));
    if let Err(e) = state.settings.set(LAYOUT_ITEMS_KEY, value) {
        tracing::warn!(error = %e, "failed to persist layout");
        return Response::error(500, "failed to persist layout");
    }
    let layout = layout_json(state);
    state.sse.broadcast(SseTopic::Layout, &layout);
    Response::json(&layout)
}

fn current_layout_items(state: &ServerState) -> Vec<serde_json::Value> {
    match layout_json(state)["items"].as_array() {
        Some(items) => items.clone(),
        None => Vec::new(),
    }
}

fn api_layout_mutate(state: &ServerState, op: &str, body: &serde_json::Value) -> Response {
    let mut items = current_layout_items(state);
    match op {
        "add" => {
            let Some(item) = body.get("item") else {
                return Response::error(400, "missing item");
            };
            items.push(item.clone());
        },
        "remove" => {
            let Some(index) = body.get("index").and_then(serde_json::Value::as_u64) else {
                return Response::error(400, "missing index");
            };
            let index = index as usize;
            if index >= items.len() {
                return Response::error(400, "index out of range");
            }
            items.remove(index);
        },
        "move" => {
            let (Some(from), Some(to)) = (
                body.get("from").and_then(serde_json::Value::as_u64),
                body.get("to").and_then(serde_json::Value::as_u64),
            ) else {
                return Response::error(400, "missing from/to");
            };
            let (from, to) = (from as usize, to as usize);
            if from >= items.len() || to >= items.len() {
                return Response::error(400, "index out of range");
            }
            let item = items.remove(from);
            items.insert(to, item);
        },
        "reorder" => {
            let Some(order) = body.get("order").and_then(serde_json::Value::as_array) else {
                return Response::error(400, "missing order");
            };
            let indices: Option<Vec<usize>> =
                order.iter().map(|v| v.as_u64().map(|i| i as usize)).collect();
            let Some(indices) = indices else {
                return Response::error(400, "bad order");
            };
            if indices.len() != items.len()
                || indices.iter().any(|&i| i >= items.len())
            {
                return Response::error(400, "order does not permute items");
            }
            items = indices.iter().map(|&i| items[i].clone()).collect();
        },
        "reset" => {
            items.clear();
        },
        "item" => {
            let (Some(index), Some(item)) =
                (body.get("index").and_then(serde_json::Value::as_u64), body.get("item"))
            else {
                return Response::error(400, "missing index/item");
            };
            let index = index as usize;
            if index >= items.len() {
                return Response::error(400, "index out of range");
            }
            items[index] = item.clone();
        },
        "zone-offset" => {
            let (Some(zone), Some(offset)) =
                (body.get("zone").and_then(serde_json::Value::as_str), body.get("offset"))
            else {
                return Response::error(400, "missing zone/offset");
            };
            let mut offsets = state
                .settings
                .get(LAYOUT_ZONE_OFFSETS_KEY)
                .map_or_else(|| serde_json::json!({}), |v| v.to_json());
            if let Some(object) = offsets.as_object_mut() {
                object.insert(zone.to_string(), offset.clone());
            }
            if let Some(value) = Value::from_json(&offsets) {
                if let Err(e) = state.settings.set(LAYOUT_ZONE_OFFSETS_KEY, value) {
                    tracing::warn!(error = %e, "failed to persist zone offsets");
                    return Response::error(500, "failed to persist layout");
                }
            }
            let layout = layout_json(state);
            state.sse.broadcast(SseTopic::Layout, &layout);
            return Response::json(&layout);
        },
        _ => return Response::error(404, "unknown layout operation"),
    }
    store_layout_items(state, items)
}

// --- Theme ---

fn theme_json(state: &ServerState) -> serde_json::Value {
    let mut object = serde_json::Map::new();
    for key in state.settings.keys_with_prefix(THEME_PREFIX) {
        if let Some(value) = state.settings.get(&key) {
            let short = key.strip_prefix(THEME_PREFIX).unwrap_or(&key).to_string();
            object.insert(short, value.to_json());
        }
    }
    serde_json::Value::Object(object)
}

fn api_theme_mutate(state: &ServerState, op: &str, body: &serde_json::Value) -> Response {
    match op {
        "set" => {
            let Some(object) = body.as_object() else {
                return Response::error(400, "expected object body");
            };
            for (key, value) in object {
                if let Some(value) = Value::from_json(value) {
                    if let Err(e) = state.settings.set(&format!("{THEME_PREFIX}{key}"), value) {
                        tracing::warn!(error = %e, "failed to persist theme key");
                        return Response::error(500, "failed to persist theme");
                    }
                }
            }
        },
        "reset" => {
            for key in state.settings.keys_with_prefix(THEME_PREFIX) {
                let _ = state.settings.remove(&key);
            }
        },
        _ => return Response::error(404, "unknown theme operation"),
    }
    let theme = theme_json(state);
    state.sse.broadcast(SseTopic::Theme, &theme);
    Response::json(&theme)
}

// --- Settings ---

fn api_save_settings(state: &ServerState, body: &Body) -> Response {
    let json = body.json();
    let Some(object) = json.as_object() else {
        return Response::error(400, "expected object body");
    };
    for (key, value) in object {
        if let Some(value) = Value::from_json(value) {
            if let Err(e) = state.settings.set(key, value) {
                tracing::warn!(key, error = %e, "failed to persist setting");
                return Response::error(500, "failed to persist settings");
            }
        }
    }
    Response::json(&serde_json::json!({"ok": true}))
}

/// Run a collaborator probe with the 15 s budget.
///
/// The await-once structure guarantees at most one reply per test; a
/// timeout produces the failure message instead of hanging the route.
async fn probe_response(
    probe: Option<HealthProbe>,
    body: serde_json::Value,
    what: &str,
) -> Response {
    let Some(probe) = probe else {
        return Response::json(&serde_json::json!({
            "ok": false,
            "message": format!("{what} support not configured"),
        }));
    };
    let (ok, message) = match tokio::time::timeout(PROBE_TIMEOUT, probe(body)).await {
        Ok(result) => result,
        Err(_) => (false, format!("{what} test timed out")),
    };
    Response::json(&serde_json::json!({"ok": ok, "message": message}))
}

// --- Backup routes ---

fn list_files(dir: &std::path::Path) -> Vec<String> {
    std::fs::read_dir(dir)
        .map(|entries| {
            let mut names: Vec<String> = entries
                .filter_map(Result::ok)
                .filter(|e| e.file_type().map(|t| t.is_file()).unwrap_or(false))
                .filter_map(|e| e.file_name().into_string().ok())
                .collect();
            names.sort();
            names
        })
        .unwrap_or_default()
}

/// A bare filename with no path structure; rejects traversal attempts.
fn safe_filename(name: &str) -> bool {
    !name.is_empty() && !name.contains('/') && !name.contains('\\') && name != ".." && name != "."
}

fn api_backup_manifest(state: &ServerState) -> Response {
    Response::json(&serde_json::json!({
        "totalShots": state.history.total_shots(),
        "profiles": {
            "user": list_files(&state.paths.profiles_user_dir()).len(),
            "downloaded": list_files(&state.paths.profiles_downloaded_dir()).len(),
        },
        "media": list_files(&state.paths.media_dir()).len(),
        "backups": state.backup.available_backups(),
    }))
}

fn api_backup_profiles_list(state: &ServerState) -> Response {
    Response::json(&serde_json::json!({
        "user": list_files(&state.paths.profiles_user_dir()),
        "downloaded": list_files(&state.paths.profiles_downloaded_dir()),
    }))
}

fn api_backup_profile_file(state: &ServerState, rest: &str) -> Response {
    let Some((category, filename)) = rest.split_once('/') else {
        return Response::error(404, "not found");
    };
    if !safe_filename(filename) {
        return Response::error(400, "bad filename");
    }
    let dir = match category {
        "user" => state.paths.profiles_user_dir(),
        "downloaded" => state.paths.profiles_downloaded_dir(),
        _ => return Response::error(404, "unknown profile category"),
    };
    match std::fs::read(dir.join(filename)) {
        Ok(bytes) => Response::new(200, "application/json", bytes),
        Err(_) => Response::error(404, "profile not found"),
    }
}

fn api_backup_media_list(state: &ServerState) -> Response {
    let files: Vec<String> = list_files(&state.paths.media_dir())
        .into_iter()
        .filter(|name| name != "catalog.json")
        .collect();
    Response::json(&serde_json::json!({ "files": files }))
}

fn api_backup_media_file(state: &ServerState, filename: &str) -> Response {
    if !safe_filename(filename) {
        return Response::error(400, "bad filename");
    }
    match std::fs::read(state.paths.media_dir().join(filename)) {
        Ok(bytes) => Response::new(200, "application/octet-stream", bytes),
        Err(_) => Response::error(404, "media not found"),
    }
}

async fn api_backup_full(state: &ServerState) -> Response {
    match state.backup.create_backup(true).await {
        Ok(zip_path) => match std::fs::read(&zip_path) {
            Ok(bytes) => {
                let name = zip_path
                    .file_name()
                    .and_then(|n| n.to_str())
                    .unwrap_or("backup.zip")
                    .to_string();
                Response::new(200, "application/zip", bytes).with_header(format!(
                    "Content-Disposition: attachment; filename=\"{name}\""
                ))
            },
            Err(e) => {
                tracing::warn!(error = %e, "failed to read backup archive");
                Response::error(500, "failed to read backup archive")
            },
        },
        Err(e) => {
            tracing::warn!(error = %e, "backup failed");
            Response::error(500, "backup failed")
        },
    }
}

async fn api_backup_restore(state: &ServerState, head: &RequestHead, body: &Body) -> Response {
    let params = head.query_params();
    let flag = |key: &str, default: bool| {
        params.get(key).map_or(default, |v| v == "true" || v == "1")
    };
    let options = RestoreOptions {
        merge: flag("merge", true),
        shots: flag("shots", true),
        settings: flag("settings", true),
        profiles: flag("profiles", true),
        media: flag("media", true),
    };

    // Stage the uploaded archive into the backups directory where the
    // restore engine expects its input, and remove it afterwards
    let filename = format!("restore_upload_{}.zip", uuid::Uuid::new_v4().simple());
    let dest = state.paths.backups_dir().join(&filename);
    let staged = match body {
        Body::File(path) => std::fs::rename(path, &dest).or_else(|_| {
            std::fs::copy(path, &dest).map(|_| ())
        }),
        Body::Memory(bytes) => std::fs::write(&dest, bytes),
    };
    if let Err(e) = staged {
        tracing::warn!(error = %e, "failed to stage restore upload");
        return Response::error(500, "failed to stage uploaded archive");
    }

    let result = state.backup.restore_backup(&filename, options).await;
    let _ = std::fs::remove_file(&dest);

    match result {
        Ok(()) => Response::json(&serde_json::json!({"ok": true, "restored": filename})),
        Err(e) => Response::json(&serde_json::json!({"ok": false, "errors": e.to_string()})),
    }
}

// --- OTA upload ---

fn api_ota_upload(state: &ServerState, head: &RequestHead, body: &Body) -> Response {
    let filename = head.header("x-filename").unwrap_or("update.apk").to_string();
    if !safe_filename(&filename) {
        return Response::error(400, "bad filename");
    }

    let dest = state.paths.cache_dir().join(&filename);
    let written = match body {
        Body::File(path) => std::fs::rename(path, &dest)
            .or_else(|_| std::fs::copy(path, &dest).map(|_| ())),
        Body::Memory(bytes) => std::fs::write(&dest, bytes),
    };

    match written {
        Ok(()) => {
            tracing::info!(path = %dest.display(), "OTA package staged, installation starting");
            Response::text(200, format!("Upload complete: {}", dest.display()))
        },
        Err(e) => {
            tracing::warn!(error = %e, "OTA upload failed");
            Response::error(500, "failed to store upload")
        },
    }
}

// --- Machine control ---

fn api_machine(state: &ServerState, op: &str) -> Response {
    let Some(device) = state.device() else {
        return Response::error(503, "no machine attached");
    };
    match op {
        "wake" => device.wake_up(),
        "sleep" => device.go_to_sleep(),
        "stop" => device.stop_operation(),
        "espresso" => device.start_espresso(),
        "steam" => device.start_steam(),
        "hot-water" => device.start_hot_water(),
        "flush" => device.start_flush(),
        _ => return Response::error(404, "unknown machine operation"),
    }
    Response::json(&serde_json::json!({"ok": true}))
}

// --- Auth ---

fn auth_login(
    state: &ServerState,
    head: &RequestHead,
    body: &Body,
    peer: SocketAddr,
) -> Response {
    if !state.sessions.check_rate_limit(peer.ip()) {
        tracing::warn!(ip = %peer.ip(), "login rate limit hit");
        return Response::error(429, "too many attempts");
    }

    let secret = state.settings.string_or(TOTP_SECRET_KEY, "");
    if secret.is_empty() {
        return Response::error(401, "unauthorized");
    }

    // Accept both the login form and JSON API clients
    let bytes = body.bytes().unwrap_or_default();
    let text = String::from_utf8_lossy(&bytes);
    let code = serde_json::from_slice::<serde_json::Value>(&bytes)
        .ok()
        .and_then(|json| json.get("code").and_then(|c| c.as_str()).map(str::to_string))
        .or_else(|| {
            crate::http::parse_query(text.trim()).get("code").cloned()
        })
        .unwrap_or_default();

    let now = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0);
    if !auth::verify_totp(&secret, &code, now) {
        // Indistinguishable from a missing session on purpose
        return Response::error(401, "unauthorized");
    }

    let user_agent = head.header("user-agent").unwrap_or("unknown");
    let token = state.sessions.create(user_agent);
    let cookie = format!(
        "session={token}; Path=/; Max-Age={}; HttpOnly; SameSite=Strict",
        auth::SESSION_LIFETIME.as_secs()
    );
    Response::redirect("/", Some(cookie))
}

fn auth_logout(state: &ServerState, head: &RequestHead) -> Response {
    if let Some(token) = head.cookie("session") {
        state.sessions.remove(token);
    }
    Response::redirect("/auth/login", Some("session=; Path=/; Max-Age=0".to_string()))
}

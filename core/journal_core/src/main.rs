use axum::{
    extract::{Query, State},
    http::{HeaderValue, Method, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use clap::Parser;
use journal_core::{
    config::{load_or_init_settings, Settings, SETTINGS_FILE_NAME},
    error::JournalError,
    journal::{Journal, SystemClock},
    model::ShiftKind,
    report::{render_csv, render_markdown},
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::{
    net::{IpAddr, SocketAddr},
    path::PathBuf,
    sync::Arc,
};
use tokio::sync::Notify;
use tower_http::cors::CorsLayer;
use tracing::{error, info, warn};

const DEFAULT_PORT: u16 = 17700;

#[derive(Parser, Debug)]
#[command(name = "journal_core", version)]
struct Args {
    /// Listen address.
    ///
    /// Accepts:
    /// - ip:port (recommended), e.g. 127.0.0.1:17700
    /// - ip (implies port 17700), e.g. 127.0.0.1
    #[arg(long, default_value = "127.0.0.1:17700")]
    listen: String,

    /// Directory holding one sub-directory per day plus settings.json.
    #[arg(long, default_value = "./data")]
    data_dir: PathBuf,

    /// Timer flush interval in seconds. Used when settings.json does not exist yet.
    #[arg(long, default_value_t = 60)]
    tick_seconds: u64,

    /// Minutes between note prompts.
    #[arg(long, default_value_t = 15)]
    prompt_minutes: u64,

    /// Minutes to wait for an answer before leaving an auto-note.
    #[arg(long, default_value_t = 3)]
    prompt_timeout_minutes: u64,
}

#[derive(Clone)]
struct AppState {
    journal: Arc<Journal>,
    stop: Arc<Notify>,
}

#[derive(Serialize)]
struct OkResponse<T: Serialize> {
    ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    data: Option<T>,
}

#[derive(Serialize)]
struct ErrResponse {
    ok: bool,
    error: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    detail: Option<String>,
}

fn ok<T: Serialize>(data: T) -> Response {
    Json(OkResponse {
        ok: true,
        data: Some(data),
    })
    .into_response()
}

fn err(status: StatusCode, code: &'static str, detail: Option<String>) -> Response {
    (
        status,
        Json(ErrResponse {
            ok: false,
            error: code,
            detail,
        }),
    )
        .into_response()
}

fn journal_error_response(e: JournalError) -> Response {
    match &e {
        JournalError::EmptyNote => err(StatusCode::BAD_REQUEST, "empty_note", None),
        JournalError::UnknownCategory(_) => {
            err(StatusCode::BAD_REQUEST, "unknown_category", Some(e.to_string()))
        }
        JournalError::IllegalTransition { .. } => {
            err(StatusCode::CONFLICT, "illegal_transition", Some(e.to_string()))
        }
        JournalError::Store(_) => {
            error!("journal write failed: {e}");
            err(StatusCode::INTERNAL_SERVER_ERROR, "db_error", Some(e.to_string()))
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "journal_core=info,tower_http=info".into()),
        )
        .init();

    let args = Args::parse();
    let default_settings = Settings {
        tick_seconds: args.tick_seconds,
        prompt_minutes: args.prompt_minutes,
        prompt_timeout_minutes: args.prompt_timeout_minutes,
        ..Settings::default()
    };

    std::fs::create_dir_all(&args.data_dir)?;
    let settings =
        load_or_init_settings(&args.data_dir.join(SETTINGS_FILE_NAME), default_settings)?;

    let journal = Journal::open(args.data_dir.clone(), settings, Arc::new(SystemClock))?;
    journal.start_timers().await;

    let state = AppState {
        journal: journal.clone(),
        stop: Arc::new(Notify::new()),
    };

    let cors = CorsLayer::new()
        .allow_origin(HeaderValue::from_static("*"))
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers([axum::http::header::CONTENT_TYPE]);

    let app = Router::new()
        .route("/health", get(health))
        .route("/now", get(get_now))
        .route("/category", post(post_category).options(options_ok))
        .route("/note", post(post_note).options(options_ok))
        .route("/tick", post(post_tick).options(options_ok))
        .route("/shift", post(post_shift).options(options_ok))
        .route("/shutdown", post(post_shutdown).options(options_ok))
        .route("/notifications", get(get_notifications))
        .route("/report", get(get_report))
        .route("/settings", get(get_settings))
        .with_state(state.clone())
        .layer(cors);

    let addr = parse_listen(&args.listen)?;
    info!("Journal listening on http://{addr}");
    info!("Data dir: {}", args.data_dir.display());

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(state.stop.clone()))
        .await?;

    if !journal.snapshot().await.closed {
        if let Err(e) = journal.shutdown().await {
            error!("final flush failed: {e}");
        }
    }
    Ok(())
}

fn parse_listen(input: &str) -> anyhow::Result<SocketAddr> {
    if let Ok(addr) = input.parse::<SocketAddr>() {
        return Ok(addr);
    }

    if let Ok(ip) = input.parse::<IpAddr>() {
        return Ok(SocketAddr::new(ip, DEFAULT_PORT));
    }

    if let Some((host, port_str)) = input.rsplit_once(':') {
        if host == "localhost" {
            let port: u16 = port_str.parse().map_err(|_| {
                anyhow::anyhow!(
                    "invalid --listen '{}': bad port. Example: 127.0.0.1:{}",
                    input,
                    DEFAULT_PORT
                )
            })?;
            return Ok(SocketAddr::new(IpAddr::from([127, 0, 0, 1]), port));
        }
    }

    if input == "localhost" {
        return Ok(SocketAddr::new(IpAddr::from([127, 0, 0, 1]), DEFAULT_PORT));
    }

    Err(anyhow::anyhow!(
        "invalid --listen '{}'. Use ip:port (e.g. 127.0.0.1:{}) or ip (e.g. 127.0.0.1).",
        input,
        DEFAULT_PORT
    ))
}

async fn shutdown_signal(stop: Arc<Notify>) {
    tokio::select! {
        _ = tokio::signal::ctrl_c() => info!("shutdown requested (ctrl-c)"),
        _ = stop.notified() => info!("shutdown requested (http)"),
    }
}

async fn options_ok() -> impl IntoResponse {
    StatusCode::OK
}

#[derive(Serialize)]
struct HealthInfo {
    service: &'static str,
    version: &'static str,
}

async fn health() -> impl IntoResponse {
    Json(OkResponse {
        ok: true,
        data: Some(HealthInfo {
            service: "journal_core",
            version: env!("CARGO_PKG_VERSION"),
        }),
    })
}

async fn get_now(State(state): State<AppState>) -> Response {
    ok(state.journal.snapshot().await)
}

#[derive(Deserialize)]
struct CategoryBody {
    category: String,
}

async fn post_category(State(state): State<AppState>, Json(payload): Json<Value>) -> Response {
    let body: CategoryBody = match serde_json::from_value(payload) {
        Ok(v) => v,
        Err(_) => return err(StatusCode::BAD_REQUEST, "invalid_json", None),
    };
    match state.journal.category_selected(&body.category).await {
        Ok(snapshot) => ok(snapshot),
        Err(e) => journal_error_response(e),
    }
}

#[derive(Deserialize)]
struct NoteBody {
    text: String,
    #[serde(default)]
    subcategory: Option<String>,
}

async fn post_note(State(state): State<AppState>, Json(payload): Json<Value>) -> Response {
    let body: NoteBody = match serde_json::from_value(payload) {
        Ok(v) => v,
        Err(_) => return err(StatusCode::BAD_REQUEST, "invalid_json", None),
    };
    match state
        .journal
        .note_submitted(&body.text, body.subcategory.as_deref())
        .await
    {
        Ok(note) => ok(note),
        Err(e) => journal_error_response(e),
    }
}

async fn post_tick(State(state): State<AppState>) -> Response {
    match state.journal.tick().await {
        Ok(entry) => ok(entry),
        Err(e) => journal_error_response(e),
    }
}

#[derive(Deserialize)]
struct ShiftBody {
    kind: ShiftKind,
}

async fn post_shift(State(state): State<AppState>, Json(payload): Json<Value>) -> Response {
    let body: ShiftBody = match serde_json::from_value(payload) {
        Ok(v) => v,
        Err(_) => return err(StatusCode::BAD_REQUEST, "invalid_shift_kind", None),
    };
    match state.journal.shift_button(body.kind).await {
        Ok(entry) => ok(entry),
        Err(e) => journal_error_response(e),
    }
}

async fn post_shutdown(State(state): State<AppState>) -> Response {
    if let Err(e) = state.journal.shutdown().await {
        return journal_error_response(e);
    }
    state.stop.notify_one();
    ok(true)
}

async fn get_notifications(State(state): State<AppState>) -> Response {
    ok(state.journal.drain_notifications().await)
}

#[derive(Clone, Copy, Debug, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
enum ReportFormat {
    #[default]
    Json,
    Markdown,
    Csv,
}

#[derive(Deserialize)]
struct ReportQuery {
    #[serde(default)]
    format: ReportFormat,
}

async fn get_report(State(state): State<AppState>, Query(q): Query<ReportQuery>) -> Response {
    let report = match state.journal.report().await {
        Ok(r) => r,
        Err(e) => return journal_error_response(e),
    };
    match q.format {
        ReportFormat::Json => ok(report),
        ReportFormat::Markdown => (
            StatusCode::OK,
            [("content-type", "text/markdown; charset=utf-8")],
            render_markdown(&report),
        )
            .into_response(),
        ReportFormat::Csv => (
            StatusCode::OK,
            [("content-type", "text/csv; charset=utf-8")],
            render_csv(&report),
        )
            .into_response(),
    }
}

async fn get_settings(State(state): State<AppState>) -> Response {
    let settings = state.journal.settings().clone();
    if settings.categories.is_empty() {
        warn!("no categories configured; only default is selectable");
    }
    ok(settings)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_listen_accepts_common_forms() {
        assert_eq!(
            parse_listen("127.0.0.1:9000").unwrap(),
            "127.0.0.1:9000".parse::<SocketAddr>().unwrap()
        );
        assert_eq!(parse_listen("0.0.0.0").unwrap().port(), DEFAULT_PORT);
        assert_eq!(parse_listen("localhost:8080").unwrap().port(), 8080);
        assert_eq!(parse_listen("localhost").unwrap().port(), DEFAULT_PORT);
        assert!(parse_listen("localhost:notaport").is_err());
        assert!(parse_listen("example.com").is_err());
    }

    #[test]
    fn journal_errors_map_to_statuses() {
        use journal_core::shift::ShiftState;

        assert_eq!(
            journal_error_response(JournalError::EmptyNote).status(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            journal_error_response(JournalError::UnknownCategory("x".into())).status(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            journal_error_response(JournalError::IllegalTransition {
                kind: ShiftKind::LunchOut,
                state: ShiftState::Off,
                reason: "must clock in first",
            })
            .status(),
            StatusCode::CONFLICT
        );
        assert_eq!(
            journal_error_response(JournalError::Store(
                journal_core::error::StoreError::Corrupt("x".into())
            ))
            .status(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[test]
    fn report_format_defaults_to_json() {
        let q: ReportQuery = serde_json::from_str("{}").unwrap();
        assert_eq!(q.format, ReportFormat::Json);
        let q: ReportQuery = serde_json::from_str(r#"{"format":"csv"}"#).unwrap();
        assert_eq!(q.format, ReportFormat::Csv);
    }
}

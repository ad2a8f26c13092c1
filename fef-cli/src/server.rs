//! The `/load`, `/unload`, `/erase`, `/stop` control plane, matching the
//! query-parameter contract of the original's `httplib`-based server:
//! `name`, `path`, `toJson`, `toBson`, `loadCSV` on `/load`, `name` alone on
//! `/unload`/`/erase`.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;

use axum::extract::{Query, State};
use axum::routing::get;
use axum::Router;
use tokio::sync::Notify;

use fef::segment::SegmentStore;
use fef::writer::{self, LoadOptions};

struct AppState {
    store: Arc<SegmentStore>,
    options: LoadOptions,
    shutdown: Arc<Notify>,
}

/// Runs the HTTP control plane until `/stop` is hit, then frees every
/// segment named in `startup_loaded`, mirroring the original's "clients
/// manually handle the lifetime of the datasets they request" comment —
/// only what the command line itself loaded is cleaned up automatically.
fn app(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/load", get(load_handler))
        .route("/unload", get(unload_handler))
        .route("/erase", get(erase_handler))
        .route("/stop", get(stop_handler))
        .with_state(state)
}

pub async fn serve(
    store: SegmentStore,
    options: LoadOptions,
    http_port: u16,
    startup_loaded: Vec<String>,
) -> anyhow::Result<()> {
    let store = Arc::new(store);
    let shutdown = Arc::new(Notify::new());
    let state = Arc::new(AppState {
        store: store.clone(),
        options,
        shutdown: shutdown.clone(),
    });

    let app = app(state);

    let addr = SocketAddr::from(([0, 0, 0, 0], http_port));
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!("server running on port {http_port}...");

    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            shutdown.notified().await;
        })
        .await?;

    for name in startup_loaded {
        info!("deleting '{name}'...");
        if let Err(err) = writer::free(&store, &name) {
            warn!("failed to free '{name}': {err}");
        }
    }

    Ok(())
}

/// Parses the original's ad-hoc boolean query parameters: absent means
/// `default`, present-and-empty or `"True"`/`"true"` means `true`, and any
/// other value falls back to a base-10 integer parse (`>0` is truthy).
fn parse_bool_param(params: &HashMap<String, String>, key: &str, default: bool) -> bool {
    match params.get(key) {
        None => default,
        Some(value) => {
            value.is_empty()
                || value == "True"
                || value == "true"
                || value.parse::<i64>().map(|n| n > 0).unwrap_or(false)
        }
    }
}

async fn load_handler(
    State(state): State<Arc<AppState>>,
    Query(params): Query<HashMap<String, String>>,
) -> String {
    let name = params.get("name").cloned().unwrap_or_default();
    let path = params.get("path").cloned().unwrap_or_default();
    let load_csv = parse_bool_param(&params, "loadCSV", true);
    let to_json = parse_bool_param(&params, "toJson", false);
    let to_bson = parse_bool_param(&params, "toBson", false);

    if to_json || to_bson {
        warn!(
            "toJson/toBson request a schema-free dump path this crate does not implement; \
             falling back to the normal FEF load for '{name}'"
        );
    }

    info!("loading dataset '{name}' from '{path}'");
    let json_path = Path::new(&path);
    let csv_prefix = json_path.parent().unwrap_or_else(|| Path::new("."));

    let options = LoadOptions {
        disable_rle: state.options.disable_rle,
        disable_csv_handling: state.options.disable_csv_handling || !load_csv,
        force_reload: state.options.force_reload,
    };

    let start = std::time::Instant::now();
    match writer::load(&state.store, json_path, &name, csv_prefix, &options) {
        Ok(handle) => {
            info!(
                "took {:?} ({} args, {} exprs)",
                start.elapsed(),
                handle.argument_count,
                handle.expression_count
            );
            "Done.".to_string()
        }
        Err(err) => {
            warn!("failed to load '{name}': {err}");
            format!("Error: {err}")
        }
    }
}

async fn unload_handler(
    State(state): State<Arc<AppState>>,
    Query(params): Query<HashMap<String, String>>,
) -> String {
    let name = params.get("name").cloned().unwrap_or_default();
    info!("unloading dataset '{name}'");
    match writer::unload(&state.store, &name) {
        Ok(()) => "Done.".to_string(),
        Err(err) => format!("Error: {err}"),
    }
}

async fn erase_handler(
    State(state): State<Arc<AppState>>,
    Query(params): Query<HashMap<String, String>>,
) -> String {
    let name = params.get("name").cloned().unwrap_or_default();
    info!("erasing dataset '{name}'");
    match writer::free(&state.store, &name) {
        Ok(()) => "Done.".to_string(),
        Err(err) => format!("Error: {err}"),
    }
}

async fn stop_handler(State(state): State<Arc<AppState>>) -> &'static str {
    state.shutdown.notify_one();
    "Stopping."
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use tower::ServiceExt;

    fn test_state() -> (tempfile::TempDir, Arc<AppState>) {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(SegmentStore::new(dir.path().join("segments")).unwrap());
        let state = Arc::new(AppState {
            store,
            options: LoadOptions::default(),
            shutdown: Arc::new(Notify::new()),
        });
        (dir, state)
    }

    #[tokio::test]
    async fn load_then_erase_round_trip() {
        let (dir, state) = test_state();
        let json_path = dir.path().join("doc.json");
        std::fs::write(&json_path, r#"{"a": 1, "b": 2}"#).unwrap();

        let uri = format!(
            "/load?name=doc&path={}",
            urlencoding_minimal(json_path.to_str().unwrap())
        );
        let response = app(state.clone())
            .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert!(response.status().is_success());
        assert!(state.store.is_loaded("doc"));

        let response = app(state.clone())
            .oneshot(
                Request::builder()
                    .uri("/erase?name=doc")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert!(response.status().is_success());
        assert!(!state.store.is_loaded("doc"));
    }

    #[tokio::test]
    async fn stop_notifies_shutdown() {
        let (_dir, state) = test_state();
        let shutdown = state.shutdown.clone();
        let response = app(state)
            .oneshot(Request::builder().uri("/stop").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert!(response.status().is_success());
        // Resolves immediately since stop_handler already called notify_one.
        shutdown.notified().await;
    }

    /// `axum`'s `Query` extractor expects percent-encoded values; path
    /// separators and nothing else need escaping for the temp paths these
    /// tests generate.
    fn urlencoding_minimal(s: &str) -> String {
        s.replace('/', "%2F")
    }
}

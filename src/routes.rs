use std::path::PathBuf;
use std::sync::Arc;

use actix_web::{HttpRequest, HttpResponse, Responder, guard, http::Method, web};
use serde_json::json;

use crate::error::AppError;
use crate::relay::{LineBackend, RelayController};

pub struct AppState<B: LineBackend> {
    pub controller: Arc<RelayController<B>>,
    /// Source re-read by `/reload_config`.
    pub config_path: Arc<PathBuf>,
}

impl<B: LineBackend> Clone for AppState<B> {
    fn clone(&self) -> Self {
        Self {
            controller: Arc::clone(&self.controller),
            config_path: Arc::clone(&self.config_path),
        }
    }
}

impl<B: LineBackend + 'static> AppState<B> {
    pub fn new(controller: Arc<RelayController<B>>, config_path: impl Into<PathBuf>) -> Self {
        Self {
            controller,
            config_path: Arc::new(config_path.into()),
        }
    }

    pub fn api_scope(&self, base_path: &str) -> actix_web::Scope {
        web::scope(base_path)
            .service(
                web::resource("/relays")
                    .route(web::get().to(list_relays::<B>))
                    .route(
                        web::route()
                            .guard(guard_not_methods(&[Method::GET]))
                            .to(method_not_allowed),
                    ),
            )
            .service(
                web::resource("/relay/{relay_id}/{state}")
                    .route(web::get().to(set_relay::<B>))
                    .route(web::post().to(set_relay::<B>))
                    .route(
                        web::route()
                            .guard(guard_not_methods(&[Method::GET, Method::POST]))
                            .to(method_not_allowed),
                    ),
            )
            .service(
                web::resource("/relay_state/{relay_id}")
                    .route(web::get().to(get_relay::<B>))
                    .route(
                        web::route()
                            .guard(guard_not_methods(&[Method::GET]))
                            .to(method_not_allowed),
                    ),
            )
            .service(
                web::resource("/reload_config")
                    .route(web::get().to(reload_config::<B>))
                    .route(web::post().to(reload_config::<B>))
                    .route(
                        web::route()
                            .guard(guard_not_methods(&[Method::GET, Method::POST]))
                            .to(method_not_allowed),
                    ),
            )
    }
}

async fn list_relays<B: LineBackend + 'static>(
    state: web::Data<AppState<B>>,
) -> Result<impl Responder, AppError> {
    Ok(web::Json(state.controller.list_relays()))
}

async fn set_relay<B: LineBackend + 'static>(
    req: HttpRequest,
    state: web::Data<AppState<B>>,
) -> Result<impl Responder, AppError> {
    let relay_id = parse_relay_id(&req)?;
    let value = parse_state(&req)?;

    state.controller.set_relay_value(relay_id, value)?;

    Ok(HttpResponse::Ok().json(json!({ "message": format!("Relay {relay_id} set to {value}") })))
}

async fn get_relay<B: LineBackend + 'static>(
    req: HttpRequest,
    state: web::Data<AppState<B>>,
) -> Result<impl Responder, AppError> {
    let relay_id = parse_relay_id(&req)?;

    let on = state.controller.get_relay(relay_id)?;

    Ok(HttpResponse::Ok().json(json!({ "relay_id": relay_id, "state": u8::from(on) })))
}

async fn reload_config<B: LineBackend + 'static>(
    state: web::Data<AppState<B>>,
) -> Result<impl Responder, AppError> {
    let controller = Arc::clone(&state.controller);
    let config_path = Arc::clone(&state.config_path);
    // export settling sleeps on the path backend
    let summary = web::block(move || controller.reload(config_path.as_path())).await??;

    Ok(HttpResponse::Ok().json(json!({
        "message": "GPIO config reloaded",
        "summary": summary,
    })))
}

fn parse_relay_id(req: &HttpRequest) -> Result<&str, AppError> {
    req.match_info()
        .get("relay_id")
        .filter(|id| !id.is_empty())
        .ok_or_else(|| AppError::UnknownRelay("missing relay id".into()))
}

fn parse_state(req: &HttpRequest) -> Result<u8, AppError> {
    let raw = req
        .match_info()
        .get("state")
        .ok_or_else(|| AppError::InvalidState("Missing state".into()))?;
    raw.trim()
        .parse::<u8>()
        .map_err(|_| AppError::InvalidState(format!("State must be 0 or 1, got {raw:?}")))
}

async fn method_not_allowed() -> HttpResponse {
    HttpResponse::MethodNotAllowed().finish()
}

fn guard_not_methods(methods: &[Method]) -> impl guard::Guard {
    let allowed: Vec<Method> = methods.to_vec();
    guard::fn_guard(move |ctx| !allowed.iter().any(|m| m == ctx.head().method))
}

use log::warn;
use std::sync::Arc;

use actix_web::{HttpRequest, HttpResponse, Responder, guard, http::Method, web};
use actix_ws::{Message, MessageStream, Session};
use serde::Deserialize;

use crate::bus::{Interest, Subscription};
use crate::dispatcher::Dispatcher;
use crate::error::AppError;
use crate::resource::{
    GpioState, Operation, Outcome, PinSettings, PwmSettings, ResourceId, SerialSettings,
};

#[derive(Clone)]
pub struct AppState {
    pub dispatcher: Arc<Dispatcher>,
}

#[derive(Deserialize)]
struct PinSettingsPayload {
    state: GpioState,
}

#[derive(Deserialize)]
struct SerialSettingsPayload {
    baud_rate: u32,
}

#[derive(Deserialize)]
struct PwmSettingsPayload {
    frequency_hz: u32,
    enabled: bool,
}

#[derive(Deserialize, Default)]
struct EventsQuery {
    limit: Option<usize>,
}

#[derive(Deserialize, Default)]
struct ReadQuery {
    max_len: Option<usize>,
}

async fn handle_event_websocket(
    mut session: Session,
    mut client_stream: MessageStream,
    subscription: Subscription,
) {
    loop {
        tokio::select! {
            msg = client_stream.recv() => {
                let Some(msg) = msg else { break; };

                match msg {
                    Ok(Message::Ping(bytes)) => {
                        let _ = session.pong(&bytes).await;
                    }
                    Ok(Message::Close(reason)) => {
                        let _ = session.close(reason).await;
                        break;
                    }
                    Ok(Message::Text(_))
                    | Ok(Message::Binary(_))
                    | Ok(Message::Pong(_))
                    | Ok(Message::Continuation(_))
                    | Ok(Message::Nop) => {}
                    Err(_) => break,
                }
            }
            event = subscription.recv() => {
                let Some(event) = event else { break; };

                if let Ok(text) = serde_json::to_string(&event)
                    && session.text(text).await.is_err()
                {
                    warn!("WebSocket client disconnected");
                    break;
                }
            }
        }
    }
}

fn resource(path: &str, methods: &[Method]) -> actix_web::Resource {
    web::resource(path).route(
        web::route()
            .guard(guard_not_methods(methods))
            .to(method_not_allowed),
    )
}

impl AppState {
    pub fn api_scope(&self, base_path: &str) -> actix_web::Scope {
        web::scope(base_path)
            .service(
                resource("/resources", &[Method::GET]).route(web::get().to(list_resources)),
            )
            .service(resource("/events", &[Method::GET]).route(web::get().to(events_ws_all)))
            .service(resource("/gpio/{pin_id}", &[Method::GET]).route(web::get().to(pin_status)))
            .service(
                resource("/gpio/{pin_id}/value", &[Method::GET, Method::POST])
                    .route(web::get().to(read_pin))
                    .route(web::post().to(write_pin)),
            )
            .service(
                resource("/gpio/{pin_id}/settings", &[Method::POST])
                    .route(web::post().to(configure_pin)),
            )
            .service(
                resource("/gpio/{pin_id}/state", &[Method::GET])
                    .route(web::get().to(pin_state)),
            )
            .service(
                resource("/gpio/{pin_id}/event", &[Method::GET])
                    .route(web::get().to(pin_last_event)),
            )
            .service(
                resource("/gpio/{pin_id}/events", &[Method::GET])
                    .route(web::get().to(pin_events)),
            )
            .service(
                resource("/gpio/{pin_id}/reset", &[Method::POST])
                    .route(web::post().to(pin_reset)),
            )
            .service(
                resource("/serial/{name}/data", &[Method::GET, Method::POST])
                    .route(web::get().to(read_serial))
                    .route(web::post().to(write_serial)),
            )
            .service(
                resource("/serial/{name}/frame", &[Method::GET])
                    .route(web::get().to(read_frame)),
            )
            .service(
                resource("/serial/{name}/settings", &[Method::POST])
                    .route(web::post().to(configure_serial)),
            )
            .service(
                resource("/serial/{name}/state", &[Method::GET])
                    .route(web::get().to(serial_state)),
            )
            .service(
                resource("/serial/{name}/reset", &[Method::POST])
                    .route(web::post().to(serial_reset)),
            )
            .service(resource("/pwm/{name}", &[Method::GET]).route(web::get().to(pwm_status)))
            .service(
                resource("/pwm/{name}/duty", &[Method::GET, Method::POST])
                    .route(web::get().to(read_pwm))
                    .route(web::post().to(write_pwm)),
            )
            .service(
                resource("/pwm/{name}/angle", &[Method::POST])
                    .route(web::post().to(write_servo)),
            )
            .service(
                resource("/pwm/{name}/settings", &[Method::POST])
                    .route(web::post().to(configure_pwm)),
            )
            .service(
                resource("/pwm/{name}/reset", &[Method::POST])
                    .route(web::post().to(pwm_reset)),
            )
    }
}

/// Submits and waits for completion off the async executor.
async fn run(state: &AppState, id: ResourceId, operation: Operation) -> Result<Outcome, AppError> {
    let pending = state.dispatcher.submit(&id, operation)?;
    let timeout = state.dispatcher.config().http.wait_timeout();

    web::block(move || pending.wait(timeout))
        .await
        .map_err(|_| AppError::ShutdownInProgress)?
}

async fn list_resources(state: web::Data<AppState>) -> Result<impl Responder, AppError> {
    Ok(web::Json(state.dispatcher.list_resources()))
}

async fn pin_status(
    req: HttpRequest,
    state: web::Data<AppState>,
) -> Result<impl Responder, AppError> {
    let id = parse_pin_id(&req)?;
    Ok(web::Json(state.dispatcher.status(&id)?))
}

async fn read_pin(req: HttpRequest, state: web::Data<AppState>) -> Result<impl Responder, AppError> {
    let id = parse_pin_id(&req)?;
    let outcome = run(&state, id, Operation::ReadPin).await?;

    Ok(web::Json(outcome))
}

async fn write_pin(
    req: HttpRequest,
    body: web::Bytes,
    state: web::Data<AppState>,
) -> Result<impl Responder, AppError> {
    let id = parse_pin_id(&req)?;
    let value = parse_value_payload(&body)?;
    run(&state, id, Operation::WritePin(value)).await?;

    Ok(HttpResponse::Ok())
}

async fn configure_pin(
    req: HttpRequest,
    body: web::Bytes,
    state: web::Data<AppState>,
) -> Result<impl Responder, AppError> {
    let id = parse_pin_id(&req)?;
    let payload: PinSettingsPayload = parse_json(&body, "settings")?;
    let settings = PinSettings {
        state: payload.state,
    };
    run(&state, id, Operation::ConfigurePin(settings)).await?;

    Ok(web::Json(settings))
}

async fn pin_state(req: HttpRequest, state: web::Data<AppState>) -> Result<impl Responder, AppError> {
    let id = parse_pin_id(&req)?;
    Ok(web::Json(state.dispatcher.current_value(&id)?))
}

async fn pin_last_event(
    req: HttpRequest,
    state: web::Data<AppState>,
) -> Result<impl Responder, AppError> {
    let id = parse_pin_id(&req)?;

    match state.dispatcher.last_event(&id)? {
        Some(event) => Ok(HttpResponse::Ok().json(event)),
        None => Ok(HttpResponse::Ok().finish()),
    }
}

async fn pin_events(
    req: HttpRequest,
    query: web::Query<EventsQuery>,
    state: web::Data<AppState>,
) -> Result<impl Responder, AppError> {
    let id = parse_pin_id(&req)?;
    Ok(web::Json(state.dispatcher.events(&id, query.limit)?))
}

async fn pin_reset(req: HttpRequest, state: web::Data<AppState>) -> Result<impl Responder, AppError> {
    let id = parse_pin_id(&req)?;
    Ok(web::Json(state.dispatcher.reset(&id)?))
}

async fn read_serial(
    req: HttpRequest,
    query: web::Query<ReadQuery>,
    state: web::Data<AppState>,
) -> Result<impl Responder, AppError> {
    let id = parse_serial_name(&req)?;
    let max_len = match query.max_len {
        Some(max_len) => max_len,
        None => state.dispatcher.config().tuning_for(&id)?.max_read_len,
    };
    let outcome = run(&state, id, Operation::ReadSerial { max_len }).await?;

    Ok(web::Json(outcome))
}

async fn write_serial(
    req: HttpRequest,
    body: web::Bytes,
    state: web::Data<AppState>,
) -> Result<impl Responder, AppError> {
    let id = parse_serial_name(&req)?;
    run(&state, id, Operation::WriteSerial(body.to_vec())).await?;

    Ok(HttpResponse::Ok())
}

async fn read_frame(req: HttpRequest, state: web::Data<AppState>) -> Result<impl Responder, AppError> {
    let id = parse_serial_name(&req)?;
    let outcome = run(&state, id, Operation::ReadFrame).await?;

    Ok(web::Json(outcome))
}

async fn configure_serial(
    req: HttpRequest,
    body: web::Bytes,
    state: web::Data<AppState>,
) -> Result<impl Responder, AppError> {
    let id = parse_serial_name(&req)?;
    let payload: SerialSettingsPayload = parse_json(&body, "settings")?;
    let settings = SerialSettings {
        baud_rate: payload.baud_rate,
    };
    run(&state, id, Operation::ConfigureSerial(settings)).await?;

    Ok(web::Json(settings))
}

async fn serial_state(
    req: HttpRequest,
    state: web::Data<AppState>,
) -> Result<impl Responder, AppError> {
    let id = parse_serial_name(&req)?;
    Ok(web::Json(state.dispatcher.current_value(&id)?))
}

async fn serial_reset(
    req: HttpRequest,
    state: web::Data<AppState>,
) -> Result<impl Responder, AppError> {
    let id = parse_serial_name(&req)?;
    Ok(web::Json(state.dispatcher.reset(&id)?))
}

async fn pwm_status(req: HttpRequest, state: web::Data<AppState>) -> Result<impl Responder, AppError> {
    let id = parse_pwm_name(&req)?;
    Ok(web::Json(state.dispatcher.status(&id)?))
}

async fn read_pwm(req: HttpRequest, state: web::Data<AppState>) -> Result<impl Responder, AppError> {
    let id = parse_pwm_name(&req)?;
    let outcome = run(&state, id, Operation::ReadPwm).await?;

    Ok(web::Json(outcome))
}

async fn write_pwm(
    req: HttpRequest,
    body: web::Bytes,
    state: web::Data<AppState>,
) -> Result<impl Responder, AppError> {
    let id = parse_pwm_name(&req)?;
    let duty = parse_number_payload(&body, "Duty cycle")?;
    run(&state, id, Operation::WritePwm { duty }).await?;

    Ok(HttpResponse::Ok())
}

async fn write_servo(
    req: HttpRequest,
    body: web::Bytes,
    state: web::Data<AppState>,
) -> Result<impl Responder, AppError> {
    let id = parse_pwm_name(&req)?;
    let angle = parse_number_payload(&body, "Angle")?;
    run(&state, id, Operation::WriteServo { angle }).await?;

    Ok(HttpResponse::Ok())
}

async fn configure_pwm(
    req: HttpRequest,
    body: web::Bytes,
    state: web::Data<AppState>,
) -> Result<impl Responder, AppError> {
    let id = parse_pwm_name(&req)?;
    let payload: PwmSettingsPayload = parse_json(&body, "settings")?;
    let settings = PwmSettings {
        frequency_hz: payload.frequency_hz,
        enabled: payload.enabled,
    };
    run(&state, id, Operation::ConfigurePwm(settings)).await?;

    Ok(web::Json(settings))
}

async fn pwm_reset(req: HttpRequest, state: web::Data<AppState>) -> Result<impl Responder, AppError> {
    let id = parse_pwm_name(&req)?;
    Ok(web::Json(state.dispatcher.reset(&id)?))
}

async fn events_ws_all(
    req: HttpRequest,
    stream: web::Payload,
    state: web::Data<AppState>,
) -> Result<HttpResponse, AppError> {
    let subscription = state.dispatcher.subscribe(Interest::All)?;
    let (response, session, client_stream) = actix_ws::handle(&req, stream)
        .map_err(|e| AppError::InvalidState(format!("Websocket error: {e}")))?;

    actix_web::rt::spawn(async move {
        handle_event_websocket(session, client_stream, subscription).await;
    });

    Ok(response)
}

fn parse_value_payload(body: &[u8]) -> Result<u8, AppError> {
    if body.is_empty() {
        return Err(AppError::InvalidValue("Empty value payload".into()));
    }

    match std::str::from_utf8(body) {
        Ok(text) => text
            .trim()
            .parse::<u8>()
            .map_err(|_| AppError::InvalidValue("Value must be an integer".into())),
        _ => Err(AppError::InvalidValue(
            "Value payload must be valid UTF-8".into(),
        )),
    }
}

fn parse_number_payload(body: &[u8], what: &str) -> Result<f64, AppError> {
    if body.is_empty() {
        return Err(AppError::InvalidValue(format!("Empty {what} payload")));
    }

    std::str::from_utf8(body)
        .ok()
        .and_then(|text| text.trim().parse::<f64>().ok())
        .filter(|value| value.is_finite())
        .ok_or_else(|| AppError::InvalidValue(format!("{what} must be a number")))
}

fn parse_json<T: for<'de> Deserialize<'de>>(body: &[u8], what: &str) -> Result<T, AppError> {
    if body.is_empty() {
        return Err(AppError::InvalidValue(format!("Empty {what} payload")));
    }

    serde_json::from_slice(body)
        .map_err(|e| AppError::InvalidValue(format!("Invalid {what} payload: {e}")))
}

fn parse_pin_id(req: &HttpRequest) -> Result<ResourceId, AppError> {
    let pin_id = req
        .match_info()
        .get("pin_id")
        .ok_or_else(|| AppError::InvalidValue("Missing pin id".into()))?;
    let pin_id = pin_id
        .parse::<u32>()
        .map_err(|_| AppError::InvalidValue("Invalid pin id".into()))?;

    Ok(ResourceId::Pin(pin_id))
}

fn parse_serial_name(req: &HttpRequest) -> Result<ResourceId, AppError> {
    let name = req
        .match_info()
        .get("name")
        .ok_or_else(|| AppError::InvalidValue("Missing serial name".into()))?;

    Ok(ResourceId::Serial(name.to_string()))
}

fn parse_pwm_name(req: &HttpRequest) -> Result<ResourceId, AppError> {
    let name = req
        .match_info()
        .get("name")
        .ok_or_else(|| AppError::InvalidValue("Missing pwm name".into()))?;

    Ok(ResourceId::Pwm(name.to_string()))
}

async fn method_not_allowed() -> HttpResponse {
    HttpResponse::MethodNotAllowed().finish()
}

fn guard_not_methods(methods: &[Method]) -> impl guard::Guard + use<> {
    let allowed: Vec<Method> = methods.to_vec();
    guard::fn_guard(move |ctx| !allowed.iter().any(|m| m == ctx.head().method))
}

use log::warn;
use std::collections::BTreeMap;
use std::sync::Arc;

use actix_web::{HttpRequest, HttpResponse, Responder, guard, http::Method, web};
use actix_ws::{Message, MessageStream, Session};
use serde::Deserialize;
use tokio::sync::broadcast;
use tokio_stream::StreamExt;
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;

use crate::config::{Direction, Edge, PinId, PullMode};
use crate::error::GpioError;
use crate::gpio::{EdgeEvent, GpioInterface, PlatformDriver};
use crate::sensor::{Measurement, SensorModule};

pub struct AppState<D: PlatformDriver> {
    pub gpio: Arc<GpioInterface<D>>,
    pub sensors: Arc<Vec<Arc<dyn SensorModule>>>,
}

impl<D: PlatformDriver> Clone for AppState<D> {
    fn clone(&self) -> Self {
        Self {
            gpio: Arc::clone(&self.gpio),
            sensors: Arc::clone(&self.sensors),
        }
    }
}

#[derive(Deserialize)]
struct SetupPayload {
    direction: String,
    pull: Option<String>,
}

#[derive(Deserialize)]
struct DetectPayload {
    edge: String,
    debounce_ms: Option<u64>,
}

async fn handle_event_websocket(
    mut session: Session,
    mut client_stream: MessageStream,
    rx: broadcast::Receiver<EdgeEvent>,
    pin_filter: Option<PinId>,
) {
    let mut events = BroadcastStream::new(rx);

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
            event = events.next() => {
                let Some(event) = event else { break; };

                match event {
                    Ok(event) => {
                        if pin_filter.map(|p| p == event.pin).unwrap_or(true) {
                            if let Ok(text) = serde_json::to_string(&event) {
                                if session.text(text).await.is_err() {
                                    warn!("WebSocket client disconnected");
                                    break;
                                }
                            }
                        }
                    }
                    Err(BroadcastStreamRecvError::Lagged(n)) => {
                        let notice = GpioError::Driver(format!("Event stream lagged by {n} events"));
                        if session.text(notice.to_string()).await.is_err() {
                            warn!("WebSocket client lagged and disconnected");
                            break;
                        }
                    }
                }
            }
        }
    }
}

impl<D: PlatformDriver> AppState<D> {
    pub fn api_scope(&self, base_path: &str) -> actix_web::Scope {
        web::scope(base_path)
            .service(
                web::resource("/pins")
                    .route(web::get().to(list_pins::<D>))
                    .route(not_allowed(&[Method::GET])),
            )
            .service(
                web::resource("/pins/{pin_id}")
                    .route(web::get().to(pin_status::<D>))
                    .route(not_allowed(&[Method::GET])),
            )
            .service(
                web::resource("/pins/{pin_id}/setup")
                    .route(web::post().to(setup_pin::<D>))
                    .route(not_allowed(&[Method::POST])),
            )
            .service(
                web::resource("/pins/{pin_id}/value")
                    .route(web::get().to(get_value::<D>))
                    .route(web::post().to(set_value::<D>))
                    .route(not_allowed(&[Method::GET, Method::POST])),
            )
            .service(
                web::resource("/pins/{pin_id}/detect")
                    .route(web::post().to(add_detect::<D>))
                    .route(web::delete().to(remove_detect::<D>))
                    .route(not_allowed(&[Method::POST, Method::DELETE])),
            )
            .service(
                web::resource("/pins/{pin_id}/detected")
                    .route(web::get().to(event_detected::<D>))
                    .route(not_allowed(&[Method::GET])),
            )
            .service(
                web::resource("/pins/{pin_id}/events")
                    .route(web::get().to(events_ws_pin::<D>))
                    .route(not_allowed(&[Method::GET])),
            )
            .service(
                web::resource("/events")
                    .route(web::get().to(events_ws_all::<D>))
                    .route(not_allowed(&[Method::GET])),
            )
            .service(
                web::resource("/sensors")
                    .route(web::get().to(sensor_readings::<D>))
                    .route(not_allowed(&[Method::GET])),
            )
            .service(
                web::resource("/sensors/meta")
                    .route(web::get().to(sensor_meta::<D>))
                    .route(not_allowed(&[Method::GET])),
            )
    }
}

async fn list_pins<D: PlatformDriver>(
    state: web::Data<AppState<D>>,
) -> Result<impl Responder, GpioError> {
    Ok(web::Json(state.gpio.pin_statuses()))
}

async fn pin_status<D: PlatformDriver>(
    req: HttpRequest,
    state: web::Data<AppState<D>>,
) -> Result<impl Responder, GpioError> {
    let pin = parse_pin_id(&req)?;
    let status = state
        .gpio
        .pin_status(pin)
        .ok_or_else(|| GpioError::NotFound(pin.to_string()))?;

    Ok(web::Json(status))
}

async fn setup_pin<D: PlatformDriver>(
    req: HttpRequest,
    body: web::Bytes,
    state: web::Data<AppState<D>>,
) -> Result<impl Responder, GpioError> {
    let pin = parse_pin_id(&req)?;
    let payload: SetupPayload = parse_json(&body)?;
    let direction: Direction = payload.direction.parse()?;
    let pull: PullMode = match payload.pull {
        Some(pull) => pull.parse()?,
        None => PullMode::default(),
    };

    state.gpio.setup(pin, direction, pull)?;

    Ok(web::Json(state.gpio.pin_status(pin)))
}

async fn get_value<D: PlatformDriver>(
    req: HttpRequest,
    state: web::Data<AppState<D>>,
) -> Result<impl Responder, GpioError> {
    let pin = parse_pin_id(&req)?;

    let value = state.gpio.input(pin)?;

    Ok(web::Json(value))
}

async fn set_value<D: PlatformDriver>(
    req: HttpRequest,
    body: web::Bytes,
    state: web::Data<AppState<D>>,
) -> Result<impl Responder, GpioError> {
    let pin = parse_pin_id(&req)?;
    let value = parse_value_payload(&body)?;

    state.gpio.output(pin, value)?;

    Ok(HttpResponse::Ok())
}

async fn add_detect<D: PlatformDriver>(
    req: HttpRequest,
    body: web::Bytes,
    state: web::Data<AppState<D>>,
) -> Result<impl Responder, GpioError> {
    let pin = parse_pin_id(&req)?;
    let payload: DetectPayload = parse_json(&body)?;
    let edge: Edge = payload.edge.parse()?;

    state
        .gpio
        .add_event_detect(pin, edge, None, payload.debounce_ms)?;

    Ok(web::Json(state.gpio.pin_status(pin)))
}

async fn remove_detect<D: PlatformDriver>(
    req: HttpRequest,
    state: web::Data<AppState<D>>,
) -> Result<impl Responder, GpioError> {
    let pin = parse_pin_id(&req)?;

    state.gpio.remove_event_detect(pin)?;

    Ok(HttpResponse::Ok())
}

async fn event_detected<D: PlatformDriver>(
    req: HttpRequest,
    state: web::Data<AppState<D>>,
) -> Result<impl Responder, GpioError> {
    let pin = parse_pin_id(&req)?;

    Ok(web::Json(state.gpio.event_detected(pin)?))
}

async fn sensor_readings<D: PlatformDriver>(
    state: web::Data<AppState<D>>,
) -> Result<impl Responder, GpioError> {
    let mut readings: Vec<Measurement> = Vec::new();
    for sensor in state.sensors.iter() {
        readings.extend(sensor.read_data()?);
    }

    Ok(web::Json(readings))
}

async fn sensor_meta<D: PlatformDriver>(
    state: web::Data<AppState<D>>,
) -> Result<impl Responder, GpioError> {
    let meta: BTreeMap<_, _> = state
        .sensors
        .iter()
        .map(|sensor| (sensor.name().to_string(), sensor.meta_data()))
        .collect();

    Ok(web::Json(meta))
}

async fn events_ws_all<D: PlatformDriver>(
    req: HttpRequest,
    stream: web::Payload,
    state: web::Data<AppState<D>>,
) -> Result<HttpResponse, GpioError> {
    open_event_websocket(&req, stream, &state, None)
}

async fn events_ws_pin<D: PlatformDriver>(
    req: HttpRequest,
    stream: web::Payload,
    state: web::Data<AppState<D>>,
) -> Result<HttpResponse, GpioError> {
    let pin = parse_pin_id(&req)?;
    state
        .gpio
        .pin_status(pin)
        .ok_or_else(|| GpioError::NotFound(pin.to_string()))?;

    open_event_websocket(&req, stream, &state, Some(pin))
}

fn open_event_websocket<D: PlatformDriver>(
    req: &HttpRequest,
    stream: web::Payload,
    state: &AppState<D>,
    pin_filter: Option<PinId>,
) -> Result<HttpResponse, GpioError> {
    let rx = state.gpio.subscribe_events();
    let (response, session, client_stream) = actix_ws::handle(req, stream)
        .map_err(|e| GpioError::InvalidValue(format!("Websocket error: {e}")))?;

    actix_web::rt::spawn(async move {
        handle_event_websocket(session, client_stream, rx, pin_filter).await;
    });

    Ok(response)
}

fn parse_json<'a, T: Deserialize<'a>>(body: &'a [u8]) -> Result<T, GpioError> {
    if body.is_empty() {
        return Err(GpioError::InvalidValue("Empty payload".into()));
    }

    serde_json::from_slice(body).map_err(|e| GpioError::InvalidValue(format!("Invalid payload: {e}")))
}

fn parse_value_payload(body: &[u8]) -> Result<bool, GpioError> {
    if body.is_empty() {
        return Err(GpioError::InvalidValue("Empty value payload".into()));
    }

    match std::str::from_utf8(body) {
        Ok(text) => match text.trim() {
            "1" | "true" => Ok(true),
            "0" | "false" => Ok(false),
            _ => Err(GpioError::InvalidValue(
                "Value must be 0, 1, true or false".into(),
            )),
        },
        _ => Err(GpioError::InvalidValue(
            "Value payload must be valid UTF-8".into(),
        )),
    }
}

fn parse_pin_id(req: &HttpRequest) -> Result<PinId, GpioError> {
    let pin_id = req
        .match_info()
        .get("pin_id")
        .ok_or_else(|| GpioError::InvalidValue("Missing pin id".into()))?;
    let pin_id = pin_id
        .parse::<PinId>()
        .map_err(|_| GpioError::InvalidValue("Invalid pin id".into()))?;

    Ok(pin_id)
}

fn not_allowed(methods: &'static [Method]) -> actix_web::Route {
    web::route()
        .guard(guard_not_methods(methods))
        .to(method_not_allowed)
}

async fn method_not_allowed() -> HttpResponse {
    HttpResponse::MethodNotAllowed().finish()
}

fn guard_not_methods(methods: &'static [Method]) -> impl guard::Guard {
    let allowed: Vec<Method> = methods.to_vec();
    guard::fn_guard(move |ctx| !allowed.iter().any(|m| m == ctx.head().method))
}

use std::convert::Infallible;
use std::net::SocketAddr;

use actix_web::dev::Server;
use actix_web::web::{self, Bytes};
use actix_web::{App, HttpResponse, HttpServer, Responder, get};
use futures::{StreamExt, stream};
use serde_json::json;

use crate::events::{Event, EventHub};

/// Seconds open connections get to finish once the server is told to stop
const SHUTDOWN_TIMEOUT_SECS: u64 = 5;

/// Liveness endpoint and the live event stream
pub fn routes(cfg: &mut web::ServiceConfig) {
    cfg.service(health_route).service(events_route);
}

/// Bind and start the server. Signals are left to the caller.
pub fn build_server(addr: SocketAddr, hub: EventHub) -> std::io::Result<Server> {
    let hub = web::Data::new(hub);
    let server = HttpServer::new(move || App::new().app_data(hub.clone()).configure(routes))
        .bind(addr)?
        .disable_signals()
        .shutdown_timeout(SHUTDOWN_TIMEOUT_SECS)
        .run();
    Ok(server)
}

/// Health check route
#[get("/health")]
pub async fn health_route() -> impl Responder {
    HttpResponse::Ok().json(json!({ "ok": true }))
}

/// Server-Sent Events stream of every published event.
///
/// The subscription lives inside the response stream, so a client
/// disconnect drops it and unsubscribes.
#[get("/events")]
pub async fn events_route(hub: web::Data<EventHub>) -> impl Responder {
    let subscription = hub.subscribe();
    tracing::debug!(subscriber = %subscription.id(), "SSE client connected");

    let opening = stream::once(async { Ok::<_, Infallible>(Bytes::from_static(b": connected\n\n")) });
    let events = stream::unfold(subscription, |mut subscription| async move {
        let event = subscription.recv().await?;
        Some((Ok::<_, Infallible>(sse_frame(&event)), subscription))
    });

    HttpResponse::Ok()
        .content_type("text/event-stream")
        .insert_header(("Cache-Control", "no-cache"))
        .streaming(opening.chain(events))
}

fn sse_frame(event: &Event) -> Bytes {
    match serde_json::to_string(event) {
        Ok(json) => Bytes::from(format!("data: {json}\n\n")),
        Err(e) => {
            tracing::warn!(error = %e, event = event.type_name(), "Failed to serialize event");
            Bytes::from_static(b": dropped event\n\n")
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::SchedulerErrorEvent;
    use actix_web::{body, http::header, test};
    use serde_json::Value;

    #[actix_web::test]
    async fn health_reports_ok() {
        let app = test::init_service(App::new().configure(routes)).await;
        let req = test::TestRequest::get().uri("/health").to_request();
        let body: Value = test::call_and_read_body_json(&app, req).await;
        assert_eq!(body, json!({ "ok": true }));
    }

    #[actix_web::test]
    async fn events_are_streamed_as_sse_frames() {
        let hub = EventHub::default();
        let app =
            test::init_service(App::new().app_data(web::Data::new(hub.clone())).configure(routes)).await;

        let req = test::TestRequest::get().uri("/events").to_request();
        let resp = test::call_service(&app, req).await;
        assert!(resp.status().is_success());
        assert_eq!(
            resp.headers().get(header::CONTENT_TYPE).and_then(|v| v.to_str().ok()),
            Some("text/event-stream")
        );
        assert_eq!(hub.subscriber_count(), 1);

        hub.broadcast(Event::SchedulerError(SchedulerErrorEvent {
            device_id: 1,
            check_id: 4,
            kind: "tcp".into(),
            error: "boom".into(),
        }));
        hub.close();

        let bytes = body::to_bytes(resp.into_body()).await.unwrap();
        let text = std::str::from_utf8(&bytes).unwrap();
        let mut frames = text.split("\n\n").filter(|f| !f.is_empty());
        assert_eq!(frames.next(), Some(": connected"));

        let data = frames.next().unwrap().strip_prefix("data: ").unwrap();
        let event: Value = serde_json::from_str(data).unwrap();
        assert_eq!(event["type"], "scheduler_error");
        assert_eq!(event["check_id"], 4);
        assert_eq!(frames.next(), None);
    }
}

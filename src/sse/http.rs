//! Wire-format adapter: turns a [`Broker`] subscription into a
//! `text/event-stream` response body, emitting a synthetic `connected`
//! event first and a heartbeat comment every 15 seconds so idle
//! connections survive intermediary read timeouts.

use std::time::Duration;

use bytes::Bytes;
use chrono::Utc;
use http::{Response, StatusCode};
use http_body_util::{BodyExt, StreamBody};
use hyper::body::Frame;
use serde_json::json;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_stream::StreamExt;

use super::broker::{Broker, Event, SubscribeOptions};
use crate::proxy::Body;

const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(15);
const OUTPUT_BUFFER: usize = 16;

fn format_event(event: &Event) -> String {
    let mut frame = String::new();
    frame.push_str("event: ");
    frame.push_str(&event.event_type);
    frame.push('\n');
    if let Some(id) = &event.id {
        frame.push_str("id: ");
        frame.push_str(id);
        frame.push('\n');
    }
    if let Some(retry) = event.retry {
        frame.push_str(&format!("retry: {retry}\n"));
    }
    for line in event.data.to_string().lines() {
        frame.push_str("data: ");
        frame.push_str(line);
        frame.push('\n');
    }
    frame.push('\n');
    frame
}

fn heartbeat_comment() -> Bytes {
    Bytes::from(format!(": heartbeat {}\n\n", Utc::now().to_rfc3339()))
}

/// Builds the streaming response for a new SSE client. Returns `503` if
/// the broker has reached `max_clients`.
pub async fn serve(broker: &Broker, options: SubscribeOptions) -> Response<Body> {
    let Some(mut subscription) = broker.subscribe(options).await else {
        return Response::builder()
            .status(StatusCode::SERVICE_UNAVAILABLE)
            .header("Content-Type", "application/json")
            .body(crate::proxy::full_body(
                json!({ "error": "too_many_clients", "message": "SSE client limit reached" })
                    .to_string(),
            ))
            .unwrap_or_else(|_| Response::new(crate::proxy::full_body(Bytes::new())));
    };

    let (out_tx, out_rx) = mpsc::channel::<Bytes>(OUTPUT_BUFFER);

    let connected_event = Event::new(
        "connected",
        json!({ "timestamp": Utc::now().to_rfc3339(), "message": "subscribed" }),
    );
    let _ = out_tx.send(Bytes::from(format_event(&connected_event))).await;

    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(HEARTBEAT_INTERVAL);
        ticker.tick().await; // first tick fires immediately; the connected frame already did that job
        loop {
            tokio::select! {
                event = subscription.receiver.recv() => {
                    match event {
                        Some(event) => {
                            if out_tx.send(Bytes::from(format_event(&event))).await.is_err() {
                                break;
                            }
                        }
                        None => break,
                    }
                }
                _ = ticker.tick() => {
                    if out_tx.send(heartbeat_comment()).await.is_err() {
                        break;
                    }
                }
            }
        }
        subscription.cleanup();
    });

    let body = StreamBody::new(ReceiverStream::new(out_rx).map(|chunk| {
        Ok::<_, std::convert::Infallible>(Frame::data(chunk))
    }))
    .boxed();

    Response::builder()
        .status(StatusCode::OK)
        .header("Content-Type", "text/event-stream")
        .header("Cache-Control", "no-cache")
        .header("Connection", "keep-alive")
        .header("X-Accel-Buffering", "no")
        .header("Access-Control-Allow-Origin", "*")
        .body(body)
        .unwrap_or_else(|_| Response::new(crate::proxy::full_body(Bytes::new())))
}

#[cfg(test)]
mod tests {
    use super::*;
    use http_body_util::BodyExt;

    #[test]
    fn connected_frame_is_not_emitted_for_rejected_admission() {
        // format_event is exercised directly here; the admission path
        // itself is covered in sse::broker's tests against Broker::subscribe.
        let event = Event::new("connected", json!({ "message": "subscribed" }));
        let frame = format_event(&event);
        assert!(frame.starts_with("event: connected\n"));
        assert!(frame.ends_with("\n\n"));
    }

    #[tokio::test]
    async fn serve_rejects_once_max_clients_is_reached() {
        let broker = Broker::new(0, Duration::from_secs(1));
        broker.start().await;

        let resp = serve(&broker, SubscribeOptions::default()).await;
        assert_eq!(resp.status(), StatusCode::SERVICE_UNAVAILABLE);

        let body = resp.into_body().collect().await.unwrap().to_bytes();
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json["error"], "too_many_clients");

        broker.stop().await;
    }

    #[tokio::test]
    async fn serve_streams_the_connected_event_first() {
        let broker = Broker::new(10, Duration::from_secs(1));
        broker.start().await;

        let resp = serve(&broker, SubscribeOptions::default()).await;
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(
            resp.headers().get("Content-Type").unwrap(),
            "text/event-stream"
        );

        let frame = resp.into_body().frame().await.unwrap().unwrap();
        let data = frame.into_data().unwrap();
        let text = String::from_utf8(data.to_vec()).unwrap();
        assert!(text.starts_with("event: connected\n"));

        broker.stop().await;
    }
}

//! End-to-end tests over real sockets.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use axum::http::{Method, StatusCode};
use futures_util::{SinkExt, StreamExt};
use switchyard::config::ServerConfig;
use switchyard::http::{ExchangeContext, Reject, Reply};
use switchyard::observability::{ExchangeObserver, ExchangeSummary, ExchangeTimings, ObserverSet};
use switchyard::routing::{EndpointFlags, RouteTable, RouteTableBuilder};
use switchyard::websocket::{OutboundMessage, WebSocketSession};
use switchyard::BoxError;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::Message;

mod common;

fn tagged(builder: &mut RouteTableBuilder, template: &str, tag: &'static str) {
    builder
        .register(
            template,
            &[Method::GET],
            move |_ctx: ExchangeContext| async move { Ok::<_, Reject>(Reply::text(tag)) },
            EndpointFlags::default(),
        )
        .unwrap();
}

fn routes() -> RouteTable {
    let mut builder = RouteTableBuilder::new();
    tagged(&mut builder, "*", "wildcard");
    tagged(&mut builder, "/items/<int:id>", "templated");
    tagged(&mut builder, "/items/special", "literal");

    builder
        .register(
            "/user/<int:id>",
            &[Method::GET],
            |ctx: ExchangeContext| async move {
                let id: i32 = ctx.params().get_as("id").unwrap_or_default();
                Ok::<_, Reject>(Reply::text(id.to_string()))
            },
            EndpointFlags::default(),
        )
        .unwrap()
        .register(
            "/echo",
            &[Method::POST],
            |ctx: ExchangeContext| async move {
                let value = ctx.json().cloned().unwrap_or_default();
                Ok::<_, Reject>(Reply::json(&value)?)
            },
            EndpointFlags::background(),
        )
        .unwrap()
        .register(
            "/private",
            &[Method::GET],
            |_ctx: ExchangeContext| async move { Err::<Reply, _>(Reject::Unauthorized) },
            EndpointFlags::default(),
        )
        .unwrap()
        .register(
            "/slow",
            &[Method::GET],
            |_ctx: ExchangeContext| async move {
                tokio::time::sleep(Duration::from_secs(30)).await;
                Ok::<_, Reject>(Reply::empty())
            },
            EndpointFlags::default(),
        )
        .unwrap()
        .register_websocket(
            "/ws/burst",
            |session: WebSocketSession| async move {
                for i in 0..100 {
                    session.send_text(format!("m{}", i)).await?;
                }
                Ok::<(), BoxError>(())
            },
            EndpointFlags::default(),
        )
        .unwrap()
        .register_websocket(
            "/ws/wait",
            |session: WebSocketSession| async move {
                session.receive().await?;
                Ok::<(), BoxError>(())
            },
            EndpointFlags::default(),
        )
        .unwrap()
        .register_websocket(
            "/ws/lenient",
            |session: WebSocketSession| async move {
                while session.receive().await.is_ok() {}
                Ok::<(), BoxError>(())
            },
            EndpointFlags::default(),
        )
        .unwrap()
        .register_websocket(
            "/ws/closing",
            |session: WebSocketSession| async move {
                session.send_text("last words").await?;
                session.close(4001, "finished").await?;
                Ok::<(), BoxError>(())
            },
            EndpointFlags::default(),
        )
        .unwrap()
        .register_websocket(
            "/ws/echo/<string:prefix>",
            |session: WebSocketSession| async move {
                let prefix: String = session.params().get_as("prefix").unwrap_or_default();
                let message = session.receive().await?;
                let text = message.as_text().unwrap_or_default();
                session
                    .send(OutboundMessage::text(format!("{}:", prefix)).partial())
                    .await?;
                session.send(OutboundMessage::text(text.to_string())).await?;
                Ok::<(), BoxError>(())
            },
            EndpointFlags::default(),
        )
        .unwrap();

    builder.build()
}

#[tokio::test]
async fn test_scoring_prefers_literal_then_templated_then_wildcard() {
    let server = common::start_server(routes()).await;
    let client = common::client();

    for (path, expected) in [
        ("/items/special", "literal"),
        ("/items/7", "templated"),
        ("/somewhere/else", "wildcard"),
    ] {
        let res = client.get(server.url(path)).send().await.unwrap();
        assert_eq!(res.status(), 200);
        assert_eq!(res.text().await.unwrap(), expected, "path {}", path);
    }

    server.stop().await;
}

#[tokio::test]
async fn test_typed_parameter_binding() {
    let server = common::start_server(routes()).await;
    let client = common::client();

    let res = client.get(server.url("/user/42")).send().await.unwrap();
    assert_eq!(res.status(), 200);
    assert_eq!(res.text().await.unwrap(), "42");

    let res = client.get(server.url("/user/abc")).send().await.unwrap();
    assert_eq!(res.status(), 400);
    let text = res.text().await.unwrap();
    assert!(text.contains("id") && text.contains("int") && text.contains("abc"), "{}", text);

    server.stop().await;
}

#[tokio::test]
async fn test_endpoint_kind_mismatches() {
    let mut builder = RouteTableBuilder::new();
    tagged(&mut builder, "/plain", "plain");
    builder
        .register_websocket(
            "/socket",
            |_session: WebSocketSession| async move { Ok::<(), BoxError>(()) },
            EndpointFlags::default(),
        )
        .unwrap();
    let server = common::start_server(builder.build()).await;
    let client = common::client();

    let res = client.get(server.url("/socket")).send().await.unwrap();
    assert_eq!(res.status(), StatusCode::METHOD_NOT_ALLOWED.as_u16());

    let res = client
        .get(server.url("/plain"))
        .header("connection", "Upgrade")
        .header("upgrade", "websocket")
        .header("sec-websocket-version", "13")
        .header("sec-websocket-key", "dGhlIHNhbXBsZSBub25jZQ==")
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::UPGRADE_REQUIRED.as_u16());

    let res = client.get(server.url("/missing")).send().await.unwrap();
    assert_eq!(res.status(), 404);

    server.stop().await;
}

#[tokio::test]
async fn test_json_echo_on_background_pool_and_default_headers() {
    let server = common::start_server(routes()).await;
    let client = common::client();

    let res = client
        .post(server.url("/echo"))
        .json(&serde_json::json!({"a": [1, 2, 3]}))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), 200);
    assert_eq!(res.headers().get("access-control-allow-origin").unwrap(), "*");
    let body: serde_json::Value = res.json().await.unwrap();
    assert_eq!(body, serde_json::json!({"a": [1, 2, 3]}));

    let res = client.get(server.url("/private")).send().await.unwrap();
    assert_eq!(res.status(), 401);

    server.stop().await;
}

#[tokio::test]
async fn test_websocket_frames_arrive_in_enqueue_order() {
    let mut config = ServerConfig::default();
    config.websocket.send_queue_capacity = 2;
    let server = common::start_server_with(config, routes(), ObserverSet::default()).await;

    let (mut ws, _) = tokio_tungstenite::connect_async(server.ws_url("/ws/burst")).await.unwrap();

    for i in 0..100 {
        // Read slowly at first so producers hit the full queue.
        if i < 5 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        let message = ws.next().await.unwrap().unwrap();
        assert_eq!(message.to_text().unwrap(), format!("m{}", i));
    }

    match ws.next().await.unwrap().unwrap() {
        Message::Close(Some(frame)) => assert_eq!(frame.code, CloseCode::Normal),
        other => panic!("expected close frame, got {:?}", other),
    }

    server.stop().await;
}

#[tokio::test]
async fn test_websocket_fragments_and_route_params() {
    let server = common::start_server(routes()).await;
    let (mut ws, _) = tokio_tungstenite::connect_async(server.ws_url("/ws/echo/tag"))
        .await
        .unwrap();

    ws.send(Message::text("payload")).await.unwrap();
    let message = ws.next().await.unwrap().unwrap();
    assert_eq!(message.to_text().unwrap(), "tag:payload");

    server.stop().await;
}

#[tokio::test]
async fn test_shutdown_terminates_waiting_session_and_slow_exchange() {
    let server = common::start_server(routes()).await;
    let (mut ws, _) = tokio_tungstenite::connect_async(server.ws_url("/ws/wait")).await.unwrap();

    let client = common::client();
    let slow = tokio::spawn(client.get(server.url("/slow")).send());

    tokio::time::sleep(Duration::from_millis(100)).await;
    server.shutdown.trigger();

    match ws.next().await.unwrap().unwrap() {
        Message::Close(Some(frame)) => assert_eq!(frame.code, CloseCode::Away),
        other => panic!("expected close frame, got {:?}", other),
    }

    let res = slow.await.unwrap().unwrap();
    assert_eq!(res.status(), 444);

    tokio::time::timeout(Duration::from_secs(10), server.handle)
        .await
        .unwrap()
        .unwrap();
}

#[tokio::test]
async fn test_shutdown_closes_session_whose_handler_ignores_receive_errors() {
    let server = common::start_server(routes()).await;
    let (mut ws, _) = tokio_tungstenite::connect_async(server.ws_url("/ws/lenient")).await.unwrap();

    tokio::time::sleep(Duration::from_millis(50)).await;
    server.shutdown.trigger();

    match ws.next().await.unwrap().unwrap() {
        Message::Close(Some(frame)) => {
            assert_eq!(frame.code, CloseCode::Away);
            assert_eq!(frame.reason.as_str(), "Server is shutting down");
        }
        other => panic!("expected close frame, got {:?}", other),
    }

    tokio::time::timeout(Duration::from_secs(10), server.handle)
        .await
        .unwrap()
        .unwrap();
}

#[tokio::test]
async fn test_handler_close_uses_its_own_status() {
    let server = common::start_server(routes()).await;
    let (mut ws, _) = tokio_tungstenite::connect_async(server.ws_url("/ws/closing")).await.unwrap();

    let message = ws.next().await.unwrap().unwrap();
    assert_eq!(message.to_text().unwrap(), "last words");

    match ws.next().await.unwrap().unwrap() {
        Message::Close(Some(frame)) => {
            assert_eq!(u16::from(frame.code), 4001);
            assert_eq!(frame.reason.as_str(), "finished");
        }
        other => panic!("expected close frame, got {:?}", other),
    }

    server.stop().await;
}

#[tokio::test]
async fn test_no_content_status_has_no_body() {
    let mut builder = RouteTableBuilder::new();
    builder
        .register(
            "/empty",
            &[Method::DELETE],
            |_ctx: ExchangeContext| async move { Ok::<_, Reject>(Reply::status(StatusCode::NO_CONTENT)) },
            EndpointFlags::default(),
        )
        .unwrap();
    let server = common::start_server(builder.build()).await;

    let res = common::client().delete(server.url("/empty")).send().await.unwrap();
    assert_eq!(res.status(), 204);
    assert!(res.headers().get("content-length").is_none());
    assert!(res.bytes().await.unwrap().is_empty());

    server.stop().await;
}

#[tokio::test]
async fn test_failing_observer_does_not_affect_exchange() {
    struct Exploding;

    impl ExchangeObserver for Exploding {
        fn on_accepted(&self, _exchange: &ExchangeSummary) {
            panic!("observer bug");
        }
    }

    #[derive(Default)]
    struct Flushed(AtomicUsize);

    impl ExchangeObserver for Flushed {
        fn on_response_flushed(&self, _exchange: &ExchangeSummary, _status: StatusCode, _timings: &ExchangeTimings) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    let flushed = Arc::new(Flushed::default());
    let observers = ObserverSet::new(vec![Arc::new(Exploding), flushed.clone()]);
    let server = common::start_server_with(ServerConfig::default(), routes(), observers).await;
    let client = common::client();

    let res = client.get(server.url("/items/special")).send().await.unwrap();
    assert_eq!(res.status(), 200);
    assert_eq!(res.text().await.unwrap(), "literal");

    server.stop().await;
    assert_eq!(flushed.0.load(Ordering::SeqCst), 1);
}

mod common;

use common::{backends, config, wait_for, Remote};
use ech_tunnel::ServiceController;
use futures::{SinkExt, StreamExt};
use http::HeaderValue;
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::Message;

#[tokio::test]
async fn websocket_frames_reach_the_target() {
    let (dns, connector) = backends(Remote::Reply {
        expect: 1024,
        reply: 2048,
    });
    let controller = ServiceController::new();
    assert!(
        controller
            .start_with_backends(config("ws://127.0.0.1:0/tunnel"), dns, connector.clone())
            .await
            .success
    );
    let addr = controller.local_addr().unwrap();

    let mut request = format!("ws://{}/tunnel", addr).into_client_request().unwrap();
    request
        .headers_mut()
        .insert("X-Target", HeaderValue::from_static("example.com:443"));
    let tcp = TcpStream::connect(addr).await.unwrap();
    let (mut ws, _) = tokio_tungstenite::client_async(request, tcp).await.unwrap();

    ws.send(Message::Binary(vec![0x22; 1024])).await.unwrap();
    let mut received = Vec::new();
    while let Some(message) = ws.next().await {
        match message {
            Ok(Message::Binary(data)) => received.extend_from_slice(&data),
            Ok(Message::Close(_)) | Err(_) => break,
            Ok(_) => {}
        }
    }
    assert_eq!(received, vec![0xAB; 2048]);

    assert!(
        wait_for(|| {
            let stats = controller.stats();
            stats["acceptor"]["bytes_in"] == 1024 && stats["acceptor"]["bytes_out"] == 2048
        })
        .await
    );
    assert_eq!(connector.targets(), vec!["example.com:443".parse().unwrap()]);
    controller.release().await;
}

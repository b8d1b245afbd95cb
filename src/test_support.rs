//! In-process mock HTTP servers for client tests.

use axum::Router;
use tokio::net::TcpListener;
use tokio::sync::oneshot;

/// Serve `app` on a random local port.
/// Returns the base url and a sender that stops the server.
pub async fn spawn_mock(app: Router) -> (String, oneshot::Sender<()>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let base_url = format!("http://127.0.0.1:{}", addr.port());

    let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();

    tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                let _ = shutdown_rx.await;
            })
            .await
            .unwrap();
    });

    (base_url, shutdown_tx)
}

//! Accept loop and connection lifecycle.
//!
//! One task per connection drives hyper's HTTP/1.1 state machine with
//! keep-alive on; pipelined requests on a connection are answered in
//! arrival order by that machine, and a connection error tears down only
//! its own task. The loop also ticks the hot cache sweep for every mount
//! that carries one.
//!
//! # Examples
//!
//! ```rust,no_run
//! use catzilla::{serve, router::Router, Method};
//! use tokio::net::TcpListener;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let listener = TcpListener::bind("127.0.0.1:8080").await?;
//! let mut router = Router::new();
//! router.route(Method::GET, "/", || async { "hello" });
//! serve(listener, router).await;
//! # Ok(())
//! # }
//! ```

use std::sync::Arc;
use std::time::Duration;

use hyper::{Request, server::conn::http1, service::service_fn};
use std::convert::Infallible;
use tokio::net::TcpListener;

use crate::platform::format_addr;
use crate::router::Router;
use crate::types::BoxError;

/// Interval between hot cache TTL sweeps.
const SWEEP_INTERVAL: Duration = Duration::from_secs(60);

/// Serves until the process exits.
pub async fn serve(listener: TcpListener, router: Router) {
    let never = std::future::pending::<()>();
    if let Err(err) = run(listener, router, never).await {
        tracing::error!(error = %err, "server terminated");
    }
}

/// Serves until `shutdown` resolves, then stops accepting. In-flight
/// connections finish on their own tasks.
pub async fn serve_with_shutdown<F>(listener: TcpListener, router: Router, shutdown: F)
where
    F: std::future::Future<Output = ()> + Send,
{
    if let Err(err) = run(listener, router, shutdown).await {
        tracing::error!(error = %err, "server terminated");
    }
}

async fn run<F>(listener: TcpListener, router: Router, shutdown: F) -> Result<(), BoxError>
where
    F: std::future::Future<Output = ()> + Send,
{
    #[cfg(feature = "telemetry")]
    crate::tracing::init_tracing();

    let router = Arc::new(router);
    router.setup_plugins_once();

    // Periodic TTL sweep for every mount-attached cache.
    let sweeper = {
        let router = router.clone();
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(SWEEP_INTERVAL);
            tick.tick().await;
            loop {
                tick.tick().await;
                for mount in router.mounts() {
                    if let Some(cache) = mount.hot_cache() {
                        let dropped = cache.sweep();
                        if dropped > 0 {
                            tracing::debug!(prefix = mount.prefix(), dropped, "cache sweep");
                        }
                    }
                }
            }
        })
    };

    let local_addr = listener.local_addr()?;
    tracing::info!(addr = %format_addr(&local_addr), "listening");

    tokio::pin!(shutdown);
    loop {
        let accepted = tokio::select! {
            _ = &mut shutdown => break,
            accepted = listener.accept() => accepted,
        };
        let (stream, addr) = match accepted {
            Ok(pair) => pair,
            Err(err) => {
                tracing::warn!(error = %err, "accept failed");
                continue;
            }
        };
        let io = hyper_util::rt::TokioIo::new(stream);
        let router = router.clone();

        // One task per connection.
        tokio::spawn(async move {
            let svc = service_fn(move |mut req: Request<_>| {
                let router = router.clone();
                async move {
                    req.extensions_mut().insert(addr);
                    Ok::<_, Infallible>(router.dispatch(req).await)
                }
            });

            let mut http = http1::Builder::new();
            http.keep_alive(true);
            let conn = http.serve_connection(io, svc);

            if let Err(err) = conn.await {
                tracing::debug!(peer = %addr, error = %err, "connection closed with error");
            }
        });
    }

    sweeper.abort();
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::router::Router;
    use crate::static_files::StaticMount;
    use hyper::Method;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpStream;

    async fn start_server(router: Router) -> (std::net::SocketAddr, tokio::sync::oneshot::Sender<()>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (tx, rx) = tokio::sync::oneshot::channel::<()>();
        tokio::spawn(async move {
            serve_with_shutdown(listener, router, async {
                let _ = rx.await;
            })
            .await;
        });
        (addr, tx)
    }

    /// Writes raw HTTP/1.1 bytes and reads until the server closes. The
    /// final request must carry `Connection: close`.
    async fn raw_request(addr: std::net::SocketAddr, request: &str) -> String {
        let mut stream = TcpStream::connect(addr).await.unwrap();
        stream.write_all(request.as_bytes()).await.unwrap();
        let mut response = Vec::new();
        stream.read_to_end(&mut response).await.unwrap();
        String::from_utf8_lossy(&response).into_owned()
    }

    #[tokio::test]
    async fn serves_registered_route() {
        let mut router = Router::new();
        router.route(Method::GET, "/ping", || async { "pong" });
        let (addr, _shutdown) = start_server(router).await;

        let response = raw_request(
            addr,
            "GET /ping HTTP/1.1\r\nHost: test\r\nConnection: close\r\n\r\n",
        )
        .await;
        assert!(response.starts_with("HTTP/1.1 200 OK"));
        assert!(response.ends_with("pong"));
    }

    #[tokio::test]
    async fn unknown_path_is_404() {
        let mut router = Router::new();
        router.route(Method::GET, "/known", || async { "here" });
        let (addr, _shutdown) = start_server(router).await;

        let response = raw_request(
            addr,
            "GET /missing HTTP/1.1\r\nHost: test\r\nConnection: close\r\n\r\n",
        )
        .await;
        assert!(response.starts_with("HTTP/1.1 404"));
    }

    #[tokio::test]
    async fn pipelined_responses_keep_request_order() {
        let mut router = Router::new();
        router.route(Method::GET, "/a", || async {
            // The later request must not overtake this slower one.
            tokio::time::sleep(Duration::from_millis(50)).await;
            "first"
        });
        router.route(Method::GET, "/b", || async { "second" });
        let (addr, _shutdown) = start_server(router).await;

        let response = raw_request(
            addr,
            "GET /a HTTP/1.1\r\nHost: t\r\n\r\n\
             GET /b HTTP/1.1\r\nHost: t\r\nConnection: close\r\n\r\n",
        )
        .await;
        let first = response.find("first").expect("first response missing");
        let second = response.find("second").expect("second response missing");
        assert!(first < second, "responses out of request order");
    }

    #[tokio::test]
    async fn mount_takes_precedence_over_routes() {
        let dir = tempfile::tempdir().unwrap();
        tokio::fs::write(dir.path().join("hello.txt"), b"from disk")
            .await
            .unwrap();
        let mut router = Router::new();
        router.route(Method::GET, "/static/hello.txt", || async { "from route" });
        router.mount(StaticMount::builder("/static", dir.path()).build());
        let (addr, _shutdown) = start_server(router).await;

        let response = raw_request(
            addr,
            "GET /static/hello.txt HTTP/1.1\r\nHost: t\r\nConnection: close\r\n\r\n",
        )
        .await;
        assert!(response.starts_with("HTTP/1.1 200 OK"));
        assert!(response.contains("from disk"));
    }

    #[tokio::test]
    async fn middleware_priority_orders_execution() {
        use std::sync::{Arc, Mutex};
        let order: Arc<Mutex<Vec<&'static str>>> = Arc::new(Mutex::new(Vec::new()));

        let mut router = Router::new();
        let late = order.clone();
        router.middleware_with_priority(200, move |req, next| {
            let late = late.clone();
            async move {
                late.lock().unwrap().push("late");
                next.run(req).await
            }
        });
        let early = order.clone();
        router.middleware_with_priority(1, move |req, next| {
            let early = early.clone();
            async move {
                early.lock().unwrap().push("early");
                next.run(req).await
            }
        });
        router.route(Method::GET, "/", || async { "ok" });
        let (addr, _shutdown) = start_server(router).await;

        raw_request(addr, "GET / HTTP/1.1\r\nHost: t\r\nConnection: close\r\n\r\n").await;
        assert_eq!(*order.lock().unwrap(), vec!["early", "late"]);
    }

    #[tokio::test]
    async fn middleware_can_short_circuit() {
        let mut router = Router::new();
        router.middleware(|_req, _next| async {
            (http::StatusCode::FORBIDDEN, "blocked")
        });
        router.route(Method::GET, "/", || async { "never" });
        let (addr, _shutdown) = start_server(router).await;

        let response =
            raw_request(addr, "GET / HTTP/1.1\r\nHost: t\r\nConnection: close\r\n\r\n").await;
        assert!(response.starts_with("HTTP/1.1 403"));
        assert!(!response.contains("never"));
    }

    #[tokio::test]
    async fn wildcard_method_route_catches_post() {
        let mut router = Router::new();
        router.route_any_method("/hook", || async { "any" });
        let (addr, _shutdown) = start_server(router).await;

        let response = raw_request(
            addr,
            "POST /hook HTTP/1.1\r\nHost: t\r\nContent-Length: 0\r\nConnection: close\r\n\r\n",
        )
        .await;
        assert!(response.starts_with("HTTP/1.1 200 OK"));
    }
}

//! Calls over TCP and TLS endpoints.

use std::sync::Arc;
use std::time::Duration;

use rustls::pki_types::{CertificateDer, ServerName};
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;
use trellis::transport::stream::StreamClient;
use tokio::sync::oneshot;
use trellis::{
    Code, Handler, KeyCertPair, Server, ServerCredentials, ServerError, Status, UnaryCall,
    UnaryCallback, codec,
};

type Unary = UnaryCall<String, String>;
type Callback = UnaryCallback<String>;

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
}

async fn timeout<F: std::future::Future>(fut: F) -> F::Output {
    tokio::time::timeout(Duration::from_secs(5), fut)
        .await
        .expect("timed out")
}

fn greeter() -> Server {
    let (ser, de) = codec::utf8();
    let handler = Handler::unary(|call: Unary, callback: Callback| async move {
        if call.request().is_empty() {
            callback.send(Err(Status::invalid_argument("name is required")));
        } else {
            callback.send(Ok(format!("hello, {} from {}", call.request(), call.peer())));
        }
    });
    let mut server = Server::default();
    server.register("/test.Greeter/Hello", handler, ser, de);
    server
}

#[tokio::test]
async fn insecure_tcp_round_trip() {
    init_tracing();
    let server = greeter();
    let port = server
        .bind("127.0.0.1:0", &ServerCredentials::insecure())
        .await
        .unwrap();
    assert_ne!(port, 0);
    server.start().unwrap();

    let socket = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
    let local = socket.local_addr().unwrap().to_string();
    let client = StreamClient::new(socket);

    let stream = client.open("/test.Greeter/Hello", Vec::new()).await.unwrap();
    stream.send_message(b"ada").await.unwrap();
    stream.end().await.unwrap();
    let response = timeout(stream.collect()).await.unwrap();
    assert_eq!(response.status.code(), Code::Ok);
    assert_eq!(
        String::from_utf8(response.payload().to_vec()).unwrap(),
        format!("hello, ada from {}", local)
    );

    // Several calls share one connection.
    let a = client.open("/test.Greeter/Hello", Vec::new()).await.unwrap();
    let b = client.open("/test.Greeter/Missing", Vec::new()).await.unwrap();
    a.send_message(b"").await.unwrap();
    a.end().await.unwrap();
    b.end().await.unwrap();
    let (a, b) = tokio::join!(a.collect(), b.collect());
    assert_eq!(a.unwrap().status.code(), Code::InvalidArgument);
    assert_eq!(b.unwrap().status.code(), Code::Unimplemented);

    server.shutdown().await;
}

#[tokio::test]
async fn endpoint_bound_after_start_accepts_immediately() {
    init_tracing();
    let server = greeter();
    let _connector = server.bind_in_process().unwrap();
    server.start().unwrap();

    let port = server
        .bind("127.0.0.1:0", &ServerCredentials::insecure())
        .await
        .unwrap();
    let client = StreamClient::new(TcpStream::connect(("127.0.0.1", port)).await.unwrap());
    let stream = client.open("/test.Greeter/Hello", Vec::new()).await.unwrap();
    stream.send_message(b"late").await.unwrap();
    stream.end().await.unwrap();
    let response = timeout(stream.collect()).await.unwrap();
    assert_eq!(response.status.code(), Code::Ok);
    server.shutdown().await;
}

#[tokio::test]
async fn bind_async_reports_the_port() {
    init_tracing();
    let server = greeter();
    let (tx, rx) = tokio::sync::oneshot::channel();
    server.bind_async("127.0.0.1:0", ServerCredentials::insecure(), move |result| {
        let _ = tx.send(result);
    });
    let port = timeout(rx).await.unwrap().unwrap();
    assert_ne!(port, 0);
}

#[tokio::test]
async fn bind_reports_address_in_use() {
    init_tracing();
    let first = greeter();
    let port = first
        .bind("127.0.0.1:0", &ServerCredentials::insecure())
        .await
        .unwrap();

    let second = greeter();
    let err = second
        .bind(&format!("127.0.0.1:{}", port), &ServerCredentials::insecure())
        .await
        .unwrap_err();
    assert!(matches!(err, ServerError::Bind { .. }), "{err}");
}

#[tokio::test]
async fn bind_rejects_unusable_tls_material() {
    init_tracing();
    let server = greeter();
    let garbage = KeyCertPair::new("not a key", "not a certificate");
    let creds = ServerCredentials::ssl(None, vec![garbage], false).unwrap();
    let err = server.bind("127.0.0.1:0", &creds).await.unwrap_err();
    assert!(matches!(err, ServerError::Credentials(_)), "{err}");
}

#[tokio::test]
async fn tls_round_trip() {
    init_tracing();
    let certified = rcgen::generate_simple_self_signed(vec!["localhost".to_string()]).unwrap();
    let pair = KeyCertPair::new(certified.key_pair.serialize_pem(), certified.cert.pem());
    let creds = ServerCredentials::ssl(None, vec![pair], false).unwrap();

    let server = greeter();
    let port = server.bind("127.0.0.1:0", &creds).await.unwrap();
    server.start().unwrap();

    let mut roots = rustls::RootCertStore::empty();
    let der: CertificateDer<'static> = certified.cert.der().clone();
    roots.add(der).unwrap();
    let config = rustls::ClientConfig::builder_with_provider(Arc::new(
        rustls::crypto::ring::default_provider(),
    ))
    .with_safe_default_protocol_versions()
    .unwrap()
    .with_root_certificates(roots)
    .with_no_client_auth();
    let connector = TlsConnector::from(Arc::new(config));

    let socket = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
    let tls = connector
        .connect(ServerName::try_from("localhost").unwrap(), socket)
        .await
        .unwrap();
    let client = StreamClient::new(tls);

    let stream = client.open("/test.Greeter/Hello", Vec::new()).await.unwrap();
    stream.send_message(b"tls").await.unwrap();
    stream.end().await.unwrap();
    let response = timeout(stream.collect()).await.unwrap();
    assert_eq!(response.status.code(), Code::Ok);
    assert!(
        String::from_utf8(response.payload().to_vec())
            .unwrap()
            .starts_with("hello, tls")
    );
    server.shutdown().await;
}

#[tokio::test]
async fn connection_close_cancels_open_calls() {
    init_tracing();
    let (ser, de) = codec::utf8();
    let handler = Handler::unary(|call: Unary, _callback: Callback| async move {
        call.cancelled().await;
    });
    let mut server = Server::default();
    server.register("/test.Greeter/Wait", handler, ser, de);
    let port = server
        .bind("127.0.0.1:0", &ServerCredentials::insecure())
        .await
        .unwrap();
    server.start().unwrap();

    let client = StreamClient::new(TcpStream::connect(("127.0.0.1", port)).await.unwrap());
    let stream = client.open("/test.Greeter/Wait", Vec::new()).await.unwrap();
    stream.send_message(b"x").await.unwrap();
    timeout(async {
        while server.in_flight() == 0 {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
    })
    .await;
    drop(stream);
    drop(client);
    timeout(async {
        while server.in_flight() != 0 {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
    })
    .await;
    server.shutdown().await;
}

#[tokio::test]
async fn stream_dropped_after_end_cancels_its_call() {
    init_tracing();
    let (ser, de) = codec::utf8();
    let (seen_tx, seen_rx) = oneshot::channel();
    let seen_tx = Arc::new(parking_lot::Mutex::new(Some(seen_tx)));
    let handler = Handler::unary(move |call: Unary, _callback: Callback| {
        let seen_tx = seen_tx.clone();
        async move {
            call.cancelled().await;
            if let Some(tx) = seen_tx.lock().take() {
                let _ = tx.send(());
            }
        }
    });
    let mut server = Server::default();
    server.register("/test.Greeter/Wait", handler, ser, de);
    let port = server
        .bind("127.0.0.1:0", &ServerCredentials::insecure())
        .await
        .unwrap();
    server.start().unwrap();

    // The connection stays up; only the stream is abandoned.
    let client = StreamClient::new(TcpStream::connect(("127.0.0.1", port)).await.unwrap());
    let stream = client.open("/test.Greeter/Wait", Vec::new()).await.unwrap();
    stream.send_message(b"x").await.unwrap();
    stream.end().await.unwrap();
    timeout(async {
        while server.in_flight() == 0 {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
    })
    .await;
    drop(stream);

    timeout(seen_rx).await.unwrap();
    timeout(server.shutdown()).await;
    drop(client);
}

//! Accept loop: binds the listening socket, builds the TLS acceptor, and
//! dispatches each accepted connection to its own handler task. Per-accept
//! errors are logged and the loop continues — it never exits on a transient
//! accept failure.

use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;
use tokio_rustls::TlsAcceptor;
use tracing::{info, warn};

use crate::auth::AuthRegistry;
use crate::balancer::Balancer;
use crate::error::ProxyError;
use crate::proxy::handler::handle_connection;
use crate::proxy::tls::build_server_config;

pub struct ListenerConfig {
    pub addr: String,
    pub client_ca_cert_path: String,
    pub server_cert_path: String,
    pub server_key_path: String,
    pub heartbeat_timeout: Duration,
    pub forward_buff_size: usize,
}

pub async fn run(
    config: ListenerConfig,
    auth: Arc<AuthRegistry>,
    balancer: Arc<Balancer>,
) -> Result<(), ProxyError> {
    let server_config = build_server_config(
        &config.client_ca_cert_path,
        &config.server_cert_path,
        &config.server_key_path,
    )?;
    let acceptor = TlsAcceptor::from(server_config);

    let listener = TcpListener::bind(&config.addr)
        .await
        .map_err(|e| ProxyError::ConfigInvalid(format!("binding '{}': {e}", config.addr)))?;
    info!(addr = %config.addr, "listening");

    loop {
        let (raw_conn, peer_addr) = match listener.accept().await {
            Ok(pair) => pair,
            Err(e) => {
                warn!(error = %e, "transient accept error, continuing");
                continue;
            }
        };

        let acceptor = acceptor.clone();
        let auth = Arc::clone(&auth);
        let balancer = Arc::clone(&balancer);
        let heartbeat = config.heartbeat_timeout;
        let buf_size = config.forward_buff_size;

        tokio::spawn(async move {
            if let Err(e) = handle_connection(acceptor, raw_conn, auth, balancer, heartbeat, buf_size).await {
                warn!(peer = %peer_addr, error = %e, "connection ended with error");
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::AuthRegistry;
    use crate::config::{ClientConfig, PermsConfig};
    use rustls::{Certificate as RustlsCert, ClientConfig as RustlsClientConfig, PrivateKey, RootCertStore};
    use std::convert::TryFrom;
    use std::io::Write;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio_rustls::TlsConnector;

    fn gen_ca() -> rcgen::Certificate {
        let mut params = rcgen::CertificateParams::new(vec![]);
        let mut name = rcgen::DistinguishedName::new();
        name.push(rcgen::DnType::CommonName, "test-ca");
        params.distinguished_name = name;
        params.is_ca = rcgen::IsCa::Ca(rcgen::BasicConstraints::Unconstrained);
        rcgen::Certificate::from_params(params).unwrap()
    }

    fn gen_leaf(cn: &str, dns_san: Option<&str>) -> rcgen::Certificate {
        let sans = dns_san.map(|s| vec![s.to_string()]).unwrap_or_default();
        let mut params = rcgen::CertificateParams::new(sans);
        let mut name = rcgen::DistinguishedName::new();
        name.push(rcgen::DnType::CommonName, cn);
        params.distinguished_name = name;
        if let Some(s) = dns_san {
            params.subject_alt_names = vec![rcgen::SanType::DnsName(s.to_string())];
        }
        rcgen::Certificate::from_params(params).unwrap()
    }

    fn write_tmp(contents: &str) -> tempfile::NamedTempFile {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        f.write_all(contents.as_bytes()).unwrap();
        f
    }

    async fn connect_client(
        ca_der: Vec<u8>,
        cert_der: Vec<u8>,
        key_der: Vec<u8>,
        addr: std::net::SocketAddr,
    ) -> tokio_rustls::client::TlsStream<tokio::net::TcpStream> {
        let mut root_store = RootCertStore::empty();
        root_store.add(&RustlsCert(ca_der)).unwrap();

        let client_config = RustlsClientConfig::builder()
            .with_safe_default_cipher_suites()
            .with_safe_default_kx_groups()
            .with_protocol_versions(&[&rustls::version::TLS13])
            .unwrap()
            .with_root_certificates(root_store)
            .with_client_auth_cert(vec![RustlsCert(cert_der)], PrivateKey(key_der))
            .unwrap();
        let connector = TlsConnector::from(Arc::new(client_config));
        let domain = rustls::ServerName::try_from("localhost").unwrap();

        let tcp = tokio::net::TcpStream::connect(addr).await.unwrap();
        connector.connect(domain, tcp).await.unwrap()
    }

    #[tokio::test]
    async fn binding_an_invalid_address_fails_before_entering_the_accept_loop() {
        let ca = gen_ca();
        let server_leaf = gen_leaf("localhost", Some("localhost"));
        let ca_file = write_tmp(&ca.serialize_pem().unwrap());
        let cert_file = write_tmp(&server_leaf.serialize_pem_with_signer(&ca).unwrap());
        let key_file = write_tmp(&server_leaf.serialize_private_key_pem());

        let config = ListenerConfig {
            addr: "not-an-address".to_string(),
            client_ca_cert_path: ca_file.path().to_str().unwrap().to_string(),
            server_cert_path: cert_file.path().to_str().unwrap().to_string(),
            server_key_path: key_file.path().to_str().unwrap().to_string(),
            heartbeat_timeout: Duration::from_secs(30),
            forward_buff_size: 1024,
        };

        let auth = Arc::new(AuthRegistry::new(vec![]));
        let balancer = Balancer::new(vec!["127.0.0.1:1".to_string()], &[]).unwrap();

        let err = run(config, auth, balancer).await.unwrap_err();
        assert!(matches!(err, ProxyError::ConfigInvalid(_)));
    }

    #[tokio::test]
    async fn accepted_connections_are_dispatched_to_the_handler_end_to_end() {
        let ca = gen_ca();
        let server_leaf = gen_leaf("localhost", Some("localhost"));
        let client_leaf = gen_leaf("alice", None);

        let ca_file = write_tmp(&ca.serialize_pem().unwrap());
        let cert_file = write_tmp(&server_leaf.serialize_pem_with_signer(&ca).unwrap());
        let key_file = write_tmp(&server_leaf.serialize_private_key_pem());

        let ca_der = ca.serialize_der().unwrap();
        let client_cert_der = client_leaf.serialize_der_with_signer(&ca).unwrap();
        let client_key_der = client_leaf.serialize_private_key_der();

        // Stub upstream: echoes whatever it is sent.
        let upstream_listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let upstream_addr = upstream_listener.local_addr().unwrap();
        tokio::spawn(async move {
            if let Ok((mut stream, _)) = upstream_listener.accept().await {
                let mut buf = [0u8; 5];
                if stream.read_exact(&mut buf).await.is_ok() {
                    let _ = stream.write_all(&buf).await;
                }
            }
        });

        // Bind on an ephemeral port ourselves first so the test knows the
        // address to connect to, then hand that exact address to `run`.
        let probe = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let proxy_addr = probe.local_addr().unwrap();
        drop(probe);

        let config = ListenerConfig {
            addr: proxy_addr.to_string(),
            client_ca_cert_path: ca_file.path().to_str().unwrap().to_string(),
            server_cert_path: cert_file.path().to_str().unwrap().to_string(),
            server_key_path: key_file.path().to_str().unwrap().to_string(),
            heartbeat_timeout: Duration::from_secs(30),
            forward_buff_size: 1024,
        };

        let auth = Arc::new(AuthRegistry::new(vec![ClientConfig {
            id: "alice".into(),
            perms: PermsConfig { upstream_addrs: vec![], limit: 0 },
        }]));
        let balancer = Balancer::new(vec![upstream_addr.to_string()], auth.all_clients_perms()).unwrap();

        tokio::spawn(run(config, auth, balancer));
        // The accept loop binds its own listener as part of `run`'s startup;
        // give it a moment to reach the `accept().await` point before the
        // client dials in.
        tokio::time::sleep(Duration::from_millis(50)).await;

        let mut stream = connect_client(ca_der, client_cert_der, client_key_der, proxy_addr).await;
        stream.write_all(b"hello").await.unwrap();
        let mut echoed = [0u8; 5];
        tokio::time::timeout(Duration::from_secs(2), stream.read_exact(&mut echoed))
            .await
            .expect("the listener should have dispatched the connection to a handler")
            .unwrap();
        assert_eq!(&echoed, b"hello");
    }
}

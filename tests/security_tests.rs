mod common;

use std::{fs, path::Path, sync::Arc};

use common::{TestClient, init_logging, scalar, search, test_settings};
use pvars::{
    PvaServer, ServerBuilder, ServerPv,
    cert_status::CertificateStatus,
    data::{BitSet, PvStructure, PvValue},
    messages::{Command, StatusType, parse_u8, parse_u32},
    server::HandlerResult,
    tls::STATUS_PV_EXTENSION_OID,
};
use rcgen::{
    BasicConstraints, Certificate, CertificateParams, CustomExtension, DnType,
    ExtendedKeyUsagePurpose, IsCa,
};
use rustls::{
    ClientConfig, RootCertStore,
    pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer, ServerName},
};
use tempfile::TempDir;
use tokio::net::TcpStream;
use tokio_rustls::{TlsConnector, client::TlsStream};

const STATUS_PV: &str = "CERT:STATUS:alice";

fn store_written(pv: &ServerPv, _changes: &BitSet, written: PvStructure) -> HandlerResult<()> {
    pv.update(&written)?;
    Ok(())
}

/// A throwaway CA, with a server and a client certificate signed by it
struct TestPki {
    dir: TempDir,
    ca: Certificate,
    client: Certificate,
    client_der: Vec<u8>,
}

impl TestPki {
    fn new() -> Self {
        let mut params = CertificateParams::new(Vec::<String>::new());
        params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        params
            .distinguished_name
            .push(DnType::CommonName, "pvars test CA");
        let ca = Certificate::from_params(params).unwrap();

        let mut params = CertificateParams::new(vec!["localhost".to_string()]);
        params
            .distinguished_name
            .push(DnType::CommonName, "pvars test server");
        params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ServerAuth];
        let server = Certificate::from_params(params).unwrap();

        let mut params = CertificateParams::new(vec!["ws1".to_string()]);
        params.distinguished_name.push(DnType::CommonName, "alice");
        params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ClientAuth];
        let oid: Vec<u64> = STATUS_PV_EXTENSION_OID
            .split('.')
            .map(|part| part.parse().unwrap())
            .collect();
        // DER UTF8String
        let mut content = vec![0x0C, STATUS_PV.len() as u8];
        content.extend_from_slice(STATUS_PV.as_bytes());
        params
            .custom_extensions
            .push(CustomExtension::from_oid_content(&oid, content));
        let client = Certificate::from_params(params).unwrap();
        let client_der = client.serialize_der_with_signer(&ca).unwrap();

        let dir = tempfile::tempdir().unwrap();
        let keychain = format!(
            "{}{}",
            server.serialize_pem_with_signer(&ca).unwrap(),
            server.serialize_private_key_pem()
        );
        fs::write(dir.path().join("server.pem"), keychain).unwrap();
        fs::write(dir.path().join("ca.pem"), ca.serialize_pem().unwrap()).unwrap();
        TestPki {
            dir,
            ca,
            client,
            client_der,
        }
    }

    fn path(&self, name: &str) -> std::path::PathBuf {
        self.dir.path().join(name)
    }

    async fn start_server(&self) -> PvaServer {
        init_logging();
        ServerBuilder::with_settings(test_settings())
            .tls(self.path("server.pem"), Some(self.path("ca.pem")))
            .start()
            .await
            .unwrap()
    }

    fn connector(&self, with_client_certificate: bool) -> TlsConnector {
        let mut roots = RootCertStore::empty();
        roots
            .add(CertificateDer::from(self.ca.serialize_der().unwrap()))
            .unwrap();
        let builder =
            ClientConfig::builder_with_provider(Arc::new(rustls::crypto::ring::default_provider()))
                .with_safe_default_protocol_versions()
                .unwrap()
                .with_root_certificates(roots);
        let config = if with_client_certificate {
            let key = PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(
                self.client.serialize_private_key_der(),
            ));
            builder
                .with_client_auth_cert(vec![CertificateDer::from(self.client_der.clone())], key)
                .unwrap()
        } else {
            builder.with_no_client_auth()
        };
        TlsConnector::from(Arc::new(config))
    }

    async fn connect(
        &self,
        server: &PvaServer,
        with_client_certificate: bool,
    ) -> TestClient<TlsStream<TcpStream>> {
        let port = server.tls_port().expect("TLS not enabled");
        let stream = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
        let stream = self
            .connector(with_client_certificate)
            .connect(ServerName::try_from("localhost").unwrap(), stream)
            .await
            .unwrap();
        TestClient::handshake(stream).await
    }
}

async fn try_write<S>(client: &mut TestClient<S>, sid: u32, value: f64) -> pvars::messages::Status
where
    S: tokio::io::AsyncRead + tokio::io::AsyncWrite,
{
    let desc = client.init(Command::Put, sid, 1).await.unwrap();
    let mut written = PvStructure::from_desc(&desc);
    *written.get_mut("value").unwrap() = PvValue::Double(value);
    let changes: BitSet = [written.index_of("value").unwrap()].into_iter().collect();
    client.put(sid, 1, &changes, &written).await
}

#[tokio::test]
async fn tls_search_reply_names_tls_port() {
    let pki = TestPki::new();
    let server = pki.start_server().await;
    server.create_pv("SECURE:PV", scalar(0.0)).unwrap();
    let tls_port = server.tls_port().unwrap();
    assert_ne!(tls_port, server.tcp_port());

    let response = search(server.udp_port(), &[(1, "SECURE:PV")], false, &["tls", "tcp"])
        .await
        .unwrap();
    assert_eq!(response.protocol, "tls");
    assert_eq!(response.server_address.port(), tls_port);

    let response = search(server.udp_port(), &[(1, "SECURE:PV")], false, &["tcp"])
        .await
        .unwrap();
    assert_eq!(response.protocol, "tcp");
    assert_eq!(response.server_address.port(), server.tcp_port());
    server.close().await;
}

#[tokio::test]
async fn plain_server_answers_tls_search_with_tcp() {
    init_logging();
    let server = ServerBuilder::with_settings(test_settings())
        .start()
        .await
        .unwrap();
    server.create_pv("PLAIN:PV", scalar(0.0)).unwrap();
    assert_eq!(server.tls_port(), None);
    let response = search(server.udp_port(), &[(1, "PLAIN:PV")], false, &["tls"])
        .await
        .unwrap();
    assert_eq!(response.protocol, "tcp");
    assert_eq!(response.server_address.port(), server.tcp_port());
    server.close().await;
}

#[tokio::test]
async fn certificate_identity_may_write() {
    let pki = TestPki::new();
    let server = pki.start_server().await;
    let pv = server
        .create_writable_pv("SECURE:PV", scalar(0.0), store_written)
        .unwrap();
    server
        .certificate_status()
        .set_status(STATUS_PV, CertificateStatus::Valid);
    let mut client = pki.connect(&server, true).await;
    assert!(client.auth_methods.iter().any(|m| m == "x509"));
    client.validate("x509", None).await;

    let sid = client.create_channel(1, "SECURE:PV").await;
    let status = try_write(&mut client, sid, 4.0).await;
    assert!(status.is_ok(), "{status:?}");
    assert_eq!(pv.get_data().get("value"), Some(&PvValue::Double(4.0)));
    server.close().await;
}

#[tokio::test]
async fn x509_without_certificate_is_anonymous() {
    let pki = TestPki::new();
    let server = pki.start_server().await;
    server
        .create_writable_pv("SECURE:PV", scalar(0.0), store_written)
        .unwrap();
    let mut client = pki.connect(&server, false).await;
    client.validate("x509", None).await;
    let sid = client.create_channel(1, "SECURE:PV").await;
    let status = try_write(&mut client, sid, 4.0).await;
    assert_eq!(status.kind, StatusType::Error);
    server.close().await;
}

async fn expect_rights(client: &mut TestClient<TlsStream<TcpStream>>, cid: u32, writable: bool) {
    let frame = client.expect(Command::AclChange).await;
    let (rest, reply_cid) = parse_u32(frame.byte_order(), &frame.payload).unwrap();
    let (_, rights) = parse_u8(rest).unwrap();
    assert_eq!(reply_cid, cid);
    assert_eq!(rights & 1 != 0, writable);
}

#[tokio::test]
async fn revoked_certificate_loses_write_access() {
    let pki = TestPki::new();
    let server = pki.start_server().await;
    server
        .create_writable_pv("SECURE:PV", scalar(0.0), store_written)
        .unwrap();
    server
        .certificate_status()
        .set_status(STATUS_PV, CertificateStatus::Valid);
    let mut client = pki.connect(&server, true).await;
    client.validate("x509", None).await;
    let sid = client.create_channel(7, "SECURE:PV").await;

    server
        .certificate_status()
        .set_status(STATUS_PV, CertificateStatus::Revoked);
    expect_rights(&mut client, 7, false).await;

    let status = try_write(&mut client, sid, 4.0).await;
    assert_eq!(status.kind, StatusType::Error);
    server.close().await;
}

#[tokio::test]
async fn certificate_identity_returns_once_valid() {
    let pki = TestPki::new();
    let server = pki.start_server().await;
    let pv = server
        .create_writable_pv("SECURE:PV", scalar(0.0), store_written)
        .unwrap();
    // Nothing published yet, so the certificate is not trusted
    let mut client = pki.connect(&server, true).await;
    client.validate("x509", None).await;
    let sid = client.create_channel(3, "SECURE:PV").await;
    assert_eq!(try_write(&mut client, sid, 1.0).await.kind, StatusType::Error);

    server
        .certificate_status()
        .set_status(STATUS_PV, CertificateStatus::Valid);
    expect_rights(&mut client, 3, true).await;
    assert!(try_write(&mut client, sid, 2.0).await.is_ok());
    assert_eq!(pv.get_data().get("value"), Some(&PvValue::Double(2.0)));

    server
        .certificate_status()
        .set_status(STATUS_PV, CertificateStatus::PendingRenewal);
    expect_rights(&mut client, 3, false).await;
    assert_eq!(try_write(&mut client, sid, 3.0).await.kind, StatusType::Error);

    server
        .certificate_status()
        .set_status(STATUS_PV, CertificateStatus::Valid);
    expect_rights(&mut client, 3, true).await;
    assert!(try_write(&mut client, sid, 4.0).await.is_ok());
    server.close().await;
}

#[tokio::test]
async fn certificate_already_revoked_is_anonymous() {
    let pki = TestPki::new();
    let server = pki.start_server().await;
    server
        .create_writable_pv("SECURE:PV", scalar(0.0), store_written)
        .unwrap();
    server
        .certificate_status()
        .set_status(STATUS_PV, CertificateStatus::Expired);
    let mut client = pki.connect(&server, true).await;
    client.validate("x509", None).await;
    let sid = client.create_channel(1, "SECURE:PV").await;
    let status = try_write(&mut client, sid, 4.0).await;
    assert_eq!(status.kind, StatusType::Error);
    server.close().await;
}

const PVLIST: &str = r#"
EVALUATION ORDER ALLOW, DENY
.*          ALLOW
ramp:.*     ALLOW RAMPS 1
secret:.*   DENY
"#;

const ACF: &str = r#"
UAG(ops) { alice }
ASG(DEFAULT) {
    RULE(1, READ)
}
ASG(RAMPS) {
    RULE(1, READ)
    RULE(1, WRITE) {
        UAG(ops)
    }
}
"#;

async fn start_with_access_files(dir: &Path) -> PvaServer {
    init_logging();
    fs::write(dir.join("server.pvlist"), PVLIST).unwrap();
    fs::write(dir.join("server.acf"), ACF).unwrap();
    let mut settings = test_settings();
    settings.pvlist = Some(dir.join("server.pvlist"));
    settings.acf = Some(dir.join("server.acf"));
    let server = ServerBuilder::with_settings(settings).start().await.unwrap();
    for name in ["ramp:speed", "secret:key", "plain"] {
        server
            .create_writable_pv(name, scalar(0.0), store_written)
            .unwrap();
    }
    server
}

#[tokio::test]
async fn access_files_hide_denied_names() {
    let dir = tempfile::tempdir().unwrap();
    let server = start_with_access_files(dir.path()).await;

    assert!(
        search(server.udp_port(), &[(1, "secret:key")], false, &["tcp"])
            .await
            .is_none()
    );
    let response = search(server.udp_port(), &[(2, "ramp:speed")], false, &["tcp"])
        .await
        .unwrap();
    assert_eq!(response.cids, vec![2]);
    server.close().await;
}

#[tokio::test]
async fn access_files_decide_writes() {
    let dir = tempfile::tempdir().unwrap();
    let server = start_with_access_files(dir.path()).await;

    let mut alice = TestClient::connect(server.tcp_port()).await;
    alice.validate_as("alice", "ws1").await;
    let ramp = alice.create_channel(1, "ramp:speed").await;
    let plain = alice.create_channel(2, "plain").await;
    assert!(try_write(&mut alice, ramp, 1.0).await.is_ok());
    assert_eq!(
        try_write(&mut alice, plain, 1.0).await.kind,
        StatusType::Error
    );

    let mut bob = TestClient::connect(server.tcp_port()).await;
    bob.validate_as("bob", "ws1").await;
    let ramp = bob.create_channel(1, "ramp:speed").await;
    assert_eq!(try_write(&mut bob, ramp, 2.0).await.kind, StatusType::Error);
    assert_eq!(
        server.get_pv("ramp:speed").unwrap().get_data().get("value"),
        Some(&PvValue::Double(1.0))
    );
    server.close().await;
}

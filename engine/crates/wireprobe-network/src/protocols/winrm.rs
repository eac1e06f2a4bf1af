//! WinRM (WS-Management) Identify over HTTP
//!
//! An anonymous `wsmid:Identify` POST to `/wsman`. A 200 answer carries the
//! IdentifyResponse; a 401 still identifies the service and lists the
//! authentication schemes it accepts.

use async_trait::async_trait;
use quick_xml::events::Event;
use quick_xml::Reader;
use wireprobe_core::{Error, Payload, ProbeLimits, ProbeTarget, RawRequest, Result};

use crate::driver::Probe;
use crate::http::{self, HttpRequest, HttpResponse};
use crate::protocols::tls_target;
use crate::transport::Connection;

pub const DEFAULT_PORT: u16 = 5985;
pub const DEFAULT_TLS_PORT: u16 = 5986;

const IDENTIFY_BODY: &str = concat!(
    r#"<s:Envelope xmlns:s="http://www.w3.org/2003/05/soap-envelope" "#,
    r#"xmlns:wsmid="http://schemas.dmtf.org/wbem/wsman/identity/1/wsmanidentity.xsd">"#,
    r#"<s:Header/><s:Body><wsmid:Identify/></s:Body></s:Envelope>"#
);

/// Fields of an IdentifyResponse
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Identity {
    pub protocol_version: Option<String>,
    pub product_vendor: Option<String>,
    pub product_version: Option<String>,
    pub security_profiles: Vec<String>,
}

pub fn identify_request(target: &ProbeTarget) -> HttpRequest {
    HttpRequest::new("POST", "/wsman", target.address())
        .header("Content-Type", "application/soap+xml;charset=UTF-8")
        .header("User-Agent", "wireprobe")
        .header("WSMANIDENTIFY", "unauthenticated")
        .body(IDENTIFY_BODY)
}

pub fn parse_identify_response(xml: &str) -> Result<Identity> {
    let mut reader = Reader::from_str(xml);
    reader.trim_text(true);

    let mut identity = Identity::default();
    let mut current_element = String::new();
    let mut seen_response = false;
    let mut buf = Vec::new();

    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(e)) => {
                current_element = String::from_utf8_lossy(e.local_name().as_ref()).to_string();
                if current_element == "IdentifyResponse" {
                    seen_response = true;
                }
            }
            Ok(Event::End(_)) => current_element.clear(),
            Ok(Event::Text(e)) => {
                let text = e.unescape().unwrap_or_default().to_string();
                match current_element.as_str() {
                    "ProtocolVersion" => identity.protocol_version = Some(text),
                    "ProductVendor" => identity.product_vendor = Some(text),
                    "ProductVersion" => identity.product_version = Some(text),
                    "SecurityProfileName" => identity.security_profiles.push(text),
                    _ => {}
                }
            }
            Ok(Event::Eof) => break,
            Err(e) => {
                return Err(Error::protocol("WinRM", format!("malformed XML: {}", e)));
            }
            _ => {}
        }
        buf.clear();
    }

    if !seen_response {
        return Err(Error::protocol("WinRM", "response carries no IdentifyResponse"));
    }
    Ok(identity)
}

/// Scheme names from every WWW-Authenticate header
pub fn auth_methods(response: &HttpResponse) -> Vec<String> {
    response
        .header_values("WWW-Authenticate")
        .iter()
        .flat_map(|value| value.split(','))
        .filter_map(|part| part.split_whitespace().next())
        .filter(|scheme| !scheme.contains('='))
        .map(String::from)
        .collect()
}

pub struct WinrmIdentify;

#[async_trait]
impl Probe for WinrmIdentify {
    type Request = ProbeTarget;

    fn name(&self) -> &'static str {
        "WinRM"
    }

    fn validate(&self, raw: &RawRequest, limits: &ProbeLimits) -> Result<ProbeTarget> {
        tls_target(raw, DEFAULT_PORT, DEFAULT_TLS_PORT, limits)
    }

    fn target<'a>(&self, request: &'a ProbeTarget) -> &'a ProbeTarget {
        request
    }

    async fn handshake(&self, target: &ProbeTarget, conn: &mut Connection) -> Result<Payload> {
        let response = http::exchange(conn, &identify_request(target)).await?;

        let mut payload = Payload::new()
            .with("statusCode", response.status)
            .with("tls", target.tls)
            .with("authMethods", auth_methods(&response));
        if let Some(server) = response.header("Server") {
            payload.insert("server", server);
        }

        match response.status {
            200 => {
                let identity = parse_identify_response(&response.body_text())?;
                payload.insert("identified", true);
                if let Some(v) = identity.protocol_version {
                    payload.insert("protocolVersion", v);
                }
                if let Some(v) = identity.product_vendor {
                    payload.insert("productVendor", v);
                }
                if let Some(v) = identity.product_version {
                    payload.insert("productVersion", v);
                }
                if !identity.security_profiles.is_empty() {
                    payload.insert("securityProfiles", identity.security_profiles);
                }
                Ok(payload)
            }
            401 => Ok(payload.with("identified", false).with("authRequired", true)),
            status => Err(Error::protocol(
                "WinRM",
                format!("endpoint answered HTTP {} {}, not a WS-Management response", status, response.reason),
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocols::testing::{local, run, serve_once};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    const IDENTIFY_RESPONSE: &str = r#"<s:Envelope xmlns:s="http://www.w3.org/2003/05/soap-envelope" xmlns:wsmid="http://schemas.dmtf.org/wbem/wsman/identity/1/wsmanidentity.xsd"><s:Header/><s:Body><wsmid:IdentifyResponse><wsmid:ProtocolVersion>http://schemas.dmtf.org/wbem/wsman/1/wsman.xsd</wsmid:ProtocolVersion><wsmid:ProductVendor>Microsoft Corporation</wsmid:ProductVendor><wsmid:ProductVersion>OS: 10.0.20348 SP: 0.0 Stack: 3.0</wsmid:ProductVersion><wsmid:SecurityProfiles><wsmid:SecurityProfileName>http://schemas.dmtf.org/wbem/wsman/1/wsman/secprofile/http/spnego-kerberos</wsmid:SecurityProfileName></wsmid:SecurityProfiles></wsmid:IdentifyResponse></s:Body></s:Envelope>"#;

    async fn drain_request(socket: &mut tokio::net::TcpStream) {
        let mut buf = vec![0u8; 4096];
        let mut len = 0;
        while !String::from_utf8_lossy(&buf[..len]).contains("</s:Envelope>") {
            len += socket.read(&mut buf[len..]).await.unwrap();
        }
    }

    #[test]
    fn test_parse_identify_response() {
        let identity = parse_identify_response(IDENTIFY_RESPONSE).unwrap();
        assert_eq!(identity.product_vendor.as_deref(), Some("Microsoft Corporation"));
        assert_eq!(identity.product_version.as_deref(), Some("OS: 10.0.20348 SP: 0.0 Stack: 3.0"));
        assert_eq!(identity.security_profiles.len(), 1);
        assert!(parse_identify_response("<html><body>hi</body></html>").is_err());
    }

    #[test]
    fn test_auth_methods() {
        let response = HttpResponse {
            status: 401,
            reason: String::from("Unauthorized"),
            headers: vec![
                (String::from("WWW-Authenticate"), String::from("Negotiate")),
                (String::from("WWW-Authenticate"), String::from("Basic realm=\"WSMAN\"")),
            ],
            body: Vec::new(),
        };
        assert_eq!(auth_methods(&response), vec!["Negotiate", "Basic"]);
    }

    #[tokio::test]
    async fn test_identify_against_fake_endpoint() {
        let port = serve_once(|mut socket| async move {
            drain_request(&mut socket).await;
            let response = format!(
                "HTTP/1.1 200 OK\r\nServer: Microsoft-HTTPAPI/2.0\r\nContent-Type: application/soap+xml;charset=UTF-8\r\nContent-Length: {}\r\n\r\n{}",
                IDENTIFY_RESPONSE.len(),
                IDENTIFY_RESPONSE
            );
            socket.write_all(response.as_bytes()).await.unwrap();
        })
        .await;

        let envelope = run(&WinrmIdentify, local(port)).await;
        assert!(envelope.success, "{:?}", envelope.error);
        let json = envelope.to_json();
        assert_eq!(json["productVendor"], "Microsoft Corporation");
        assert_eq!(json["server"], "Microsoft-HTTPAPI/2.0");
    }

    #[tokio::test]
    async fn test_unauthorized_still_identifies() {
        let port = serve_once(|mut socket| async move {
            drain_request(&mut socket).await;
            socket
                .write_all(b"HTTP/1.1 401 Unauthorized\r\nWWW-Authenticate: Negotiate\r\nContent-Length: 0\r\n\r\n")
                .await
                .unwrap();
        })
        .await;

        let envelope = run(&WinrmIdentify, local(port)).await;
        assert!(envelope.success, "{:?}", envelope.error);
        let json = envelope.to_json();
        assert_eq!(json["statusCode"], 401);
        assert_eq!(json["authMethods"][0], "Negotiate");
    }
}

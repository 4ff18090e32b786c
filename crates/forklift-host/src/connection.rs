//! Login test against an ESXi host's SDK endpoint

use std::net::IpAddr;
use std::time::Duration;

use async_trait::async_trait;
use quick_xml::escape::{escape, unescape};
use quick_xml::events::Event;
use quick_xml::Reader;
use reqwest::header::CONTENT_TYPE;
use thiserror::Error;
use tracing::debug;
use url::Url;

#[cfg(test)]
use mockall::automock;

/// Session manager of a standalone ESXi host
const SESSION_MANAGER: &str = "ha-sessionmgr";
const SOAP_ACTION: &str = "urn:vim25/6.0";
const LOGIN_TIMEOUT: Duration = Duration::from_secs(30);

/// Why a host login did not succeed
#[derive(Clone, Debug, Error, PartialEq)]
pub enum ConnectionError {
    /// The endpoint could not be reached
    #[error("{0}")]
    Transport(String),
    /// The host answered and refused the login
    #[error("login rejected: {0}")]
    Rejected(String),
}

/// Credentials read from a host secret
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Credentials {
    /// Login user
    pub user: String,
    /// Login password
    pub password: String,
    /// Skip TLS certificate verification
    pub insecure: bool,
}

/// Connection test seam
#[cfg_attr(test, automock)]
#[async_trait]
pub trait HostConnection: Send + Sync {
    /// Log in to `endpoint` with `credentials`
    async fn test(&self, endpoint: &Url, credentials: &Credentials) -> Result<(), ConnectionError>;
}

/// SDK endpoint of the host at `ip`
pub fn sdk_endpoint(ip: IpAddr) -> Result<Url, url::ParseError> {
    let host = match ip {
        IpAddr::V4(v4) => v4.to_string(),
        IpAddr::V6(v6) => format!("[{v6}]"),
    };
    Url::parse(&format!("https://{host}/sdk"))
}

/// SOAP login against the host's session manager
#[derive(Clone, Debug)]
pub struct SoapConnection {
    timeout: Duration,
}

impl Default for SoapConnection {
    fn default() -> Self {
        Self {
            timeout: LOGIN_TIMEOUT,
        }
    }
}

impl SoapConnection {
    /// Bound every login by `timeout`
    pub fn with_timeout(timeout: Duration) -> Self {
        Self { timeout }
    }
}

#[async_trait]
impl HostConnection for SoapConnection {
    async fn test(&self, endpoint: &Url, credentials: &Credentials) -> Result<(), ConnectionError> {
        let http = reqwest::Client::builder()
            .timeout(self.timeout)
            .danger_accept_invalid_certs(credentials.insecure)
            .build()
            .map_err(|e| ConnectionError::Transport(e.to_string()))?;

        let response = http
            .post(endpoint.clone())
            .header(CONTENT_TYPE, "text/xml; charset=utf-8")
            .header("SOAPAction", SOAP_ACTION)
            .body(login_envelope(credentials))
            .send()
            .await
            .map_err(|e| ConnectionError::Transport(e.to_string()))?;

        let status = response.status();
        debug!(endpoint = %endpoint, status = %status, "host login answered");
        if status.is_success() {
            return Ok(());
        }
        let body = response.text().await.unwrap_or_default();
        Err(ConnectionError::Rejected(
            fault_string(&body).unwrap_or_else(|| status.to_string()),
        ))
    }
}

fn login_envelope(credentials: &Credentials) -> String {
    format!(
        concat!(
            r#"<?xml version="1.0" encoding="UTF-8"?>"#,
            r#"<soapenv:Envelope xmlns:soapenv="http://schemas.xmlsoap.org/soap/envelope/" xmlns:urn="urn:vim25">"#,
            "<soapenv:Body><urn:Login>",
            r#"<urn:_this type="SessionManager">{}</urn:_this>"#,
            "<urn:userName>{}</urn:userName>",
            "<urn:password>{}</urn:password>",
            "</urn:Login></soapenv:Body></soapenv:Envelope>"
        ),
        SESSION_MANAGER,
        escape(credentials.user.as_str()),
        escape(credentials.password.as_str()),
    )
}

/// Text of the first `faultstring` element of a SOAP fault
fn fault_string(xml: &str) -> Option<String> {
    let mut reader = Reader::from_str(xml);
    loop {
        match reader.read_event() {
            Ok(Event::Start(e)) if e.local_name().as_ref() == b"faultstring" => {
                let text = reader.read_text(e.name()).ok()?;
                let text = unescape(&text).ok()?;
                let text = text.trim();
                return (!text.is_empty()).then(|| text.to_string());
            }
            Ok(Event::Eof) | Err(_) => return None,
            Ok(_) => {}
        }
    }
}

//! One-shot terminal provisioning over ISAPI.
//!
//! When `features.auto_configure_terminals` is set, every configured
//! terminal is pointed at the bridge's webhook: a reachability probe, a
//! deviceInfo identity check, then `PUT httpHosts` and `PUT trigger`.
//! Per-device failures are logged and the loop moves on -- provisioning
//! never blocks event ingestion.

use crate::config::BridgeConfig;
use isapi_core::{AlertParseError, DeviceInfo, DigestError, DigestState, parse_device_info};
use std::time::Duration;
use tracing::{info, warn};

const DEVICE_INFO_PATH: &str = "/ISAPI/System/deviceInfo";
const TRIGGER_PATH: &str = "/ISAPI/Event/notification/trigger";

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum ProvisionError {
    #[error("HTTP: {0}")]
    Http(#[from] reqwest::Error),
    #[error("digest: {0}")]
    Digest(#[from] DigestError),
    #[error("deviceInfo parse: {0}")]
    Parse(#[from] AlertParseError),
    #[error("device rejected request (HTTP {0})")]
    Rejected(u16),
}

// ---------------------------------------------------------------------------
// Device client
// ---------------------------------------------------------------------------

/// Digest-authenticated ISAPI client for one device.
pub struct DeviceClient {
    base_url: String,
    client: reqwest::Client,
    digest: DigestState,
}

impl DeviceClient {
    pub fn new(
        ip: &str,
        port: u16,
        username: &str,
        password: &str,
    ) -> Result<DeviceClient, ProvisionError> {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .timeout(Duration::from_secs(60))
            .build()?;
        Ok(DeviceClient {
            base_url: format!("http://{}:{}", ip, port),
            client,
            digest: DigestState::new(username, password),
        })
    }

    /// Send a request, answering one Digest challenge if the device asks.
    async fn request(
        &mut self,
        method: reqwest::Method,
        path: &str,
        body: Option<String>,
    ) -> Result<reqwest::Response, ProvisionError> {
        let url = format!("{}{}", self.base_url, path);

        let build = |client: &reqwest::Client, auth: Option<String>, body: &Option<String>| {
            let mut req = client.request(method.clone(), &url);
            if let Some(auth) = auth {
                req = req.header("Authorization", auth);
            }
            if let Some(body) = body {
                req = req
                    .header("Content-Type", "application/xml")
                    .body(body.clone());
            }
            req
        };

        let auth = self.digest.authorization(method.as_str(), path);
        let response = build(&self.client, auth, &body).send().await?;
        if response.status() != reqwest::StatusCode::UNAUTHORIZED {
            return Ok(response);
        }

        let challenge = response
            .headers()
            .get("WWW-Authenticate")
            .and_then(|v| v.to_str().ok())
            .unwrap_or("")
            .to_owned();
        self.digest.handle_challenge(&challenge)?;
        let auth = self.digest.authorization(method.as_str(), path);
        Ok(build(&self.client, auth, &body).send().await?)
    }

    /// A device is reachable when it answers at all; 401 counts, since it
    /// proves something is listening on the ISAPI port.
    pub async fn is_reachable(&mut self) -> bool {
        match self.request(reqwest::Method::GET, DEVICE_INFO_PATH, None).await {
            Ok(_) => true,
            Err(e) => {
                warn!(device = %self.base_url, error = %e, "reachability check failed");
                false
            }
        }
    }

    pub async fn device_info(&mut self) -> Result<DeviceInfo, ProvisionError> {
        let response = self
            .request(reqwest::Method::GET, DEVICE_INFO_PATH, None)
            .await?;
        if !response.status().is_success() {
            return Err(ProvisionError::Rejected(response.status().as_u16()));
        }
        let xml = response.text().await?;
        Ok(parse_device_info(&xml)?)
    }

    pub async fn configure_http_host(
        &mut self,
        callback_url: &str,
        host_id: u32,
    ) -> Result<(), ProvisionError> {
        let payload = build_http_host_payload(callback_url, host_id);
        let path = format!("/ISAPI/Event/notification/httpHosts/{}", host_id);
        let response = self
            .request(reqwest::Method::PUT, &path, Some(payload))
            .await?;
        expect_provision_ok(response.status().as_u16())
    }

    pub async fn enable_events(
        &mut self,
        event_types: &[String],
        host_id: u32,
    ) -> Result<(), ProvisionError> {
        let payload = build_event_trigger_payload(event_types, host_id);
        let response = self
            .request(reqwest::Method::PUT, TRIGGER_PATH, Some(payload))
            .await?;
        expect_provision_ok(response.status().as_u16())
    }
}

fn expect_provision_ok(status: u16) -> Result<(), ProvisionError> {
    match status {
        200 | 201 | 204 => Ok(()),
        other => Err(ProvisionError::Rejected(other)),
    }
}

// ---------------------------------------------------------------------------
// XML payloads
// ---------------------------------------------------------------------------

/// `<HttpHostNotification>` pointing the device at our webhook.
pub fn build_http_host_payload(callback_url: &str, host_id: u32) -> String {
    let (ip_addr, port, path) = match reqwest::Url::parse(callback_url) {
        Ok(url) => (
            url.host_str().unwrap_or_default().to_owned(),
            url.port_or_known_default().unwrap_or(80),
            if url.path().is_empty() { "/".to_owned() } else { url.path().to_owned() },
        ),
        Err(_) => (String::new(), 80, "/".to_owned()),
    };

    format!(
        "<HttpHostNotification version=\"2.0\" xmlns=\"http://www.hikvision.com/ver20/XMLSchema\">\n\
    <id>{host_id}</id>\n\
    <enabled>true</enabled>\n\
    <addressingFormatType>ipaddress</addressingFormatType>\n\
    <ipAddress>{ip_addr}</ipAddress>\n\
    <portNo>{port}</portNo>\n\
    <protocolType>HTTP</protocolType>\n\
    <url>{path}</url>\n\
    <httpAuthenticationMethod>digest</httpAuthenticationMethod>\n\
</HttpHostNotification>"
    )
}

/// `<EventTriggerNotificationList>` enabling the named event types.
pub fn build_event_trigger_payload(event_types: &[String], host_id: u32) -> String {
    let entries: String = event_types
        .iter()
        .enumerate()
        .map(|(idx, event_type)| {
            format!(
                "    <EventTriggerNotification>\n\
        <id>{id}</id>\n\
        <eventType>{event_type}</eventType>\n\
        <eventDescription>auto</eventDescription>\n\
        <protocolType>HTTP</protocolType>\n\
        <httpHostId>{host_id}</httpHostId>\n\
        <triggerState>true</triggerState>\n\
    </EventTriggerNotification>\n",
                id = idx + 1,
            )
        })
        .collect();

    format!(
        "<EventTriggerNotificationList version=\"2.0\" xmlns=\"http://www.hikvision.com/ver20/XMLSchema\">\n\
{entries}</EventTriggerNotificationList>"
    )
}

// ---------------------------------------------------------------------------
// Auto-configuration sweep
// ---------------------------------------------------------------------------

/// The callback URL advertised to devices.  `hikvision.callback.host`
/// (with `callback.port`, defaulting to the webhook listener port) wins
/// over `isapi.webhook_base_url`; with neither set there is nothing to
/// advertise.
fn resolve_callback_url(cfg: &BridgeConfig) -> Option<String> {
    if let Some(host) = &cfg.hikvision.callback_host {
        let port = cfg.hikvision.callback_port.unwrap_or(cfg.isapi.port);
        return Some(format!(
            "http://{}:{}{}",
            host, port, cfg.hikvision.callback_path
        ));
    }
    cfg.isapi.webhook_base_url.as_deref().map(|base| {
        format!(
            "{}{}",
            base.trim_end_matches('/'),
            cfg.hikvision.callback_path
        )
    })
}

/// Point every configured terminal at the bridge webhook.  Returns the
/// number of terminals fully configured.
pub async fn auto_configure_terminals(cfg: &BridgeConfig) -> usize {
    let Some(callback_url) = resolve_callback_url(cfg) else {
        warn!(
            "auto_configure_terminals set but neither hikvision.callback.host nor \
             isapi.webhook_base_url is configured; skipping"
        );
        return 0;
    };

    let mut configured = 0;
    for terminal in &cfg.terminals {
        let username = terminal.username.as_deref().unwrap_or(&cfg.isapi.username);
        let password = terminal.password.as_deref().unwrap_or(&cfg.isapi.password);

        info!(ip = %terminal.ip, "configuring terminal");
        let mut client = match DeviceClient::new(&terminal.ip, terminal.port, username, password) {
            Ok(c) => c,
            Err(e) => {
                warn!(ip = %terminal.ip, error = %e, "failed to build device client");
                continue;
            }
        };

        if !client.is_reachable().await {
            warn!(ip = %terminal.ip, "terminal unreachable, skipping");
            continue;
        }

        let info = match client.device_info().await {
            Ok(info) => info,
            Err(e) => {
                warn!(ip = %terminal.ip, error = %e, "failed to read deviceInfo");
                continue;
            }
        };
        if !info.has_valid_device_id() {
            warn!(ip = %terminal.ip, device_id = ?info.device_id, "invalid deviceID, skipping");
            continue;
        }

        if let Err(e) = client.configure_http_host(&callback_url, 1).await {
            warn!(ip = %terminal.ip, error = %e, "failed to configure httpHost");
            continue;
        }
        if let Err(e) = client.enable_events(&cfg.isapi.event_types, 1).await {
            warn!(ip = %terminal.ip, error = %e, "failed to enable event types");
            continue;
        }

        info!(
            ip = %terminal.ip,
            event_types = %cfg.isapi.event_types.join(","),
            "terminal configured"
        );
        configured += 1;
    }
    configured
}

// ---------------------------------------------------------------------------
// Unit tests
// ---------------------------------------------------------------------------

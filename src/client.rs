use anyhow::{Context, Result, bail};
use bytesize::ByteSize;
use std::net::SocketAddr;
use std::time::Duration;
use swcache_protocol::{Ack, Command, MESSAGE_PATH, STATUS_PATH, StatusResponse};

/// Talks to a running daemon over its control endpoints.
pub struct ControlClient {
    http: reqwest::Client,
    base: String,
}

impl ControlClient {
    pub fn new(listen: SocketAddr) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()?;
        Ok(Self {
            http,
            base: format!("http://{listen}"),
        })
    }

    /// Deliver one command. A rejection from the daemon is an error.
    pub async fn send(&self, cmd: &Command) -> Result<Ack> {
        let resp = self
            .http
            .post(format!("{}{MESSAGE_PATH}", self.base))
            .json(cmd)
            .send()
            .await
            .with_context(|| format!("connecting to swcache at {}", self.base))?;
        let status = resp.status();
        let ack: Ack = resp
            .json()
            .await
            .with_context(|| format!("unexpected reply from daemon (HTTP {status})"))?;
        if !ack.ok {
            bail!(
                "daemon rejected {}: {}",
                cmd.action(),
                ack.error.as_deref().unwrap_or("unknown error")
            );
        }
        Ok(ack)
    }

    pub async fn status(&self) -> Result<StatusResponse> {
        let resp = self
            .http
            .get(format!("{}{STATUS_PATH}", self.base))
            .send()
            .await
            .with_context(|| format!("connecting to swcache at {}", self.base))?
            .error_for_status()?;
        resp.json().await.context("decoding status")
    }
}

pub fn print_status(status: &StatusResponse) {
    println!("swcache {}", status.version);
    println!(
        "api version:  {}",
        status.api_version.as_deref().unwrap_or("(none)")
    );
    println!("in flight:    {}", status.in_flight_prefetches);
    println!("resumable:    {}", status.resumable_prefetches);
    println!();
    println!("{:<32} {:>8} {:>12}", "CACHE", "ENTRIES", "SIZE");
    for cache in &status.caches {
        println!(
            "{:<32} {:>8} {:>12}",
            cache.name,
            cache.entries,
            ByteSize(cache.bytes).to_string()
        );
    }
}

/// Parse a duration like "7d", "24h", "30m" or plain seconds.
pub fn parse_duration_secs(s: &str) -> Option<u64> {
    let s = s.trim();
    if let Some(days) = s.strip_suffix('d') {
        days.parse::<u64>().ok().map(|d| d * 86_400)
    } else if let Some(hours) = s.strip_suffix('h') {
        hours.parse::<u64>().ok().map(|h| h * 3600)
    } else if let Some(mins) = s.strip_suffix('m') {
        mins.parse::<u64>().ok().map(|m| m * 60)
    } else {
        s.strip_suffix('s').unwrap_or(s).parse::<u64>().ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{body_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn client_for(server: &MockServer) -> ControlClient {
        ControlClient::new(*server.address()).unwrap()
    }

    #[test]
    fn test_parse_duration_secs() {
        assert_eq!(parse_duration_secs("7d"), Some(604_800));
        assert_eq!(parse_duration_secs("24h"), Some(86_400));
        assert_eq!(parse_duration_secs("30m"), Some(1800));
        assert_eq!(parse_duration_secs("45s"), Some(45));
        assert_eq!(parse_duration_secs("90"), Some(90));
        assert_eq!(parse_duration_secs("soon"), None);
    }

    #[tokio::test]
    async fn test_send_accepted() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path(MESSAGE_PATH))
            .and(body_json(serde_json::json!({"action": "abort-prefetches"})))
            .respond_with(ResponseTemplate::new(200).set_body_json(Ack::accepted("abort-prefetches")))
            .mount(&server)
            .await;

        let ack = client_for(&server)
            .send(&Command::AbortPrefetches)
            .await
            .unwrap();
        assert!(ack.ok);
    }

    #[tokio::test]
    async fn test_send_rejected_is_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path(MESSAGE_PATH))
            .respond_with(ResponseTemplate::new(400).set_body_json(Ack::rejected("bad path")))
            .mount(&server)
            .await;

        let err = client_for(&server)
            .send(&Command::ClearCache)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("bad path"));
    }

    #[tokio::test]
    async fn test_status_decodes() {
        let server = MockServer::start().await;
        let status = StatusResponse {
            version: "0.3.0".into(),
            api_version: Some("v1".into()),
            in_flight_prefetches: 2,
            resumable_prefetches: 0,
            caches: Vec::new(),
        };
        Mock::given(method("GET"))
            .and(path(STATUS_PATH))
            .respond_with(ResponseTemplate::new(200).set_body_json(&status))
            .mount(&server)
            .await;

        assert_eq!(client_for(&server).status().await.unwrap(), status);
    }
}

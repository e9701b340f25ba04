//! Upstream brokerage client: REST GET for bars/expirations/strikes/
//! quotes, plus the chunked-transfer streaming options-chain feed.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, NaiveDate, Utc};
use futures::StreamExt;
use serde::Deserialize;
use services_common::auth::AuthManager;
use services_common::errors::PipelineError;
use services_common::types::StreamFrame;
use tokio::sync::mpsc;
use tracing::{debug, warn};

const LIVE_BASE_URL: &str = "https://api.tradestation.com/v3";
const SANDBOX_BASE_URL: &str = "https://sim-api.tradestation.com/v3";
const REST_TIMEOUT: Duration = Duration::from_secs(10);
const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

pub struct UpstreamClient {
    http: reqwest::Client,
    auth: Arc<AuthManager>,
    base_url: String,
}

#[derive(Debug, Clone)]
pub struct UnderlyingBar {
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub timestamp: DateTime<Utc>,
    pub total_volume: i64,
    pub up_volume: i64,
    pub down_volume: i64,
}

impl UpstreamClient {
    pub fn new(auth: Arc<AuthManager>, use_sandbox: bool) -> Self {
        let http = reqwest::Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .build()
            .expect("reqwest client builds");
        Self {
            http,
            auth,
            base_url: if use_sandbox {
                SANDBOX_BASE_URL
            } else {
                LIVE_BASE_URL
            }
            .to_string(),
        }
    }

    async fn auth_header(&self) -> Result<(String, String), PipelineError> {
        self.auth.get_headers().await
    }

    /// Most recent 1-minute bar for `symbol`.
    pub async fn get_bars(&self, symbol: &str) -> Result<UnderlyingBar, PipelineError> {
        #[derive(Deserialize)]
        struct BarsResponse {
            #[serde(rename = "Bars")]
            bars: Vec<Bar>,
        }
        #[derive(Deserialize)]
        struct Bar {
            #[serde(rename = "Open")]
            open: String,
            #[serde(rename = "High")]
            high: String,
            #[serde(rename = "Low")]
            low: String,
            #[serde(rename = "Close")]
            close: String,
            #[serde(rename = "TimeStamp")]
            timestamp: DateTime<Utc>,
            #[serde(rename = "TotalVolume")]
            total_volume: String,
            #[serde(rename = "UpVolume")]
            up_volume: Option<String>,
            #[serde(rename = "DownVolume")]
            down_volume: Option<String>,
        }

        let (k, v) = self.auth_header().await?;
        let url = format!(
            "{}/marketdata/barcharts/{}?unit=Minute&barsback=1&sessiontemplate=USEQ24Hour",
            self.base_url, symbol
        );
        let resp = self
            .http
            .get(&url)
            .header(k, v)
            .timeout(REST_TIMEOUT)
            .send()
            .await?;
        let parsed: BarsResponse = resp.json().await?;
        let bar = parsed
            .bars
            .into_iter()
            .next()
            .ok_or_else(|| PipelineError::Protocol("empty bar response".to_string()))?;
        Ok(UnderlyingBar {
            open: bar.open.parse().unwrap_or(0.0),
            high: bar.high.parse().unwrap_or(0.0),
            low: bar.low.parse().unwrap_or(0.0),
            close: bar.close.parse().unwrap_or(0.0),
            timestamp: bar.timestamp,
            total_volume: bar.total_volume.parse().unwrap_or(0),
            up_volume: bar.up_volume.and_then(|v| v.parse().ok()).unwrap_or(0),
            down_volume: bar.down_volume.and_then(|v| v.parse().ok()).unwrap_or(0),
        })
    }

    pub async fn get_quote(&self, symbol: &str) -> Result<f64, PipelineError> {
        Ok(self.get_bars(symbol).await?.close)
    }

    pub async fn get_expirations(&self, symbol: &str) -> Result<Vec<NaiveDate>, PipelineError> {
        #[derive(Deserialize)]
        struct ExpirationsResponse {
            #[serde(rename = "Expirations")]
            expirations: Vec<Expiration>,
        }
        #[derive(Deserialize)]
        struct Expiration {
            #[serde(rename = "Date")]
            date: DateTime<Utc>,
        }

        let (k, v) = self.auth_header().await?;
        let url = format!("{}/marketdata/options/expirations/{}", self.base_url, symbol);
        let resp = self
            .http
            .get(&url)
            .header(k, v)
            .timeout(REST_TIMEOUT)
            .send()
            .await?;
        let parsed: ExpirationsResponse = resp.json().await?;
        Ok(parsed
            .expirations
            .into_iter()
            .map(|e| e.date.date_naive())
            .collect())
    }

    pub async fn get_strikes(&self, symbol: &str, expiration: NaiveDate) -> Result<Vec<f64>, PipelineError> {
        #[derive(Deserialize)]
        struct StrikesResponse {
            #[serde(rename = "Strikes")]
            strikes: Vec<Vec<String>>,
        }
        let (k, v) = self.auth_header().await?;
        let url = format!(
            "{}/marketdata/options/strikes/{}?expiration={}",
            self.base_url, symbol, expiration
        );
        let resp = self
            .http
            .get(&url)
            .header(k, v)
            .timeout(REST_TIMEOUT)
            .send()
            .await?;
        let parsed: StrikesResponse = resp.json().await?;
        Ok(parsed
            .strikes
            .into_iter()
            .filter_map(|row| row.first().and_then(|s| s.parse().ok()))
            .collect())
    }

    /// Opens the chunked-transfer streaming endpoint and decodes
    /// newline-delimited JSON frames into `sink`. Maintains a decode
    /// buffer across chunk boundaries; malformed lines are logged and
    /// skipped rather than terminating the stream.
    pub async fn stream_options_chain(
        &self,
        underlying: &str,
        expiration: NaiveDate,
        strike_proximity: Option<u32>,
        sink: mpsc::Sender<StreamFrame>,
    ) -> Result<(), PipelineError> {
        let (k, v) = self.auth_header().await?;
        let mut url = format!(
            "{}/marketdata/stream/options/chains/{}?expiration={}",
            self.base_url, underlying, expiration
        );
        if let Some(p) = strike_proximity {
            url.push_str(&format!("&strikeProximity={p}"));
        }

        let resp = self
            .http
            .get(&url)
            .header(k, v)
            .header("Accept", "application/vnd.tradestation.streams.v2+json")
            .send()
            .await?;

        let mut byte_stream = resp.bytes_stream();
        let mut buffer = String::new();
        let mut malformed = 0u64;

        while let Some(chunk) = byte_stream.next().await {
            let chunk = chunk.map_err(|e| PipelineError::Transport(e.to_string()))?;
            buffer.push_str(&String::from_utf8_lossy(&chunk));

            while let Some(pos) = buffer.find('\n') {
                let line = buffer[..pos].trim().to_string();
                buffer.drain(..=pos);
                if line.is_empty() {
                    continue;
                }
                match serde_json::from_str::<StreamFrame>(&line) {
                    Ok(frame) => {
                        if sink.send(frame).await.is_err() {
                            return Ok(()); // receiver dropped: cooperative shutdown
                        }
                    }
                    Err(e) => {
                        malformed += 1;
                        warn!(error = %e, malformed, "skipping malformed stream frame");
                    }
                }
            }
        }
        debug!(malformed, "stream ended");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use services_common::config::BrokerCredentials;
    use wiremock::matchers::{method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[test]
    fn base_url_switches_for_sandbox() {
        assert_ne!(LIVE_BASE_URL, SANDBOX_BASE_URL);
    }

    /// Builds an `UpstreamClient` whose auth and data hosts both point
    /// at `server`, mounting a token-refresh mock so `auth_header()`
    /// succeeds without reaching the real TradeStation host.
    async fn client_against(server: &MockServer) -> UpstreamClient {
        Mock::given(method("POST"))
            .and(path("/oauth/token"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "access_token": "mock-token",
                "expires_in": 1200
            })))
            .mount(server)
            .await;
        let creds = BrokerCredentials {
            client_id: "id".to_string(),
            client_secret: "secret".to_string(),
            refresh_token: "rt".to_string(),
            use_sandbox: false,
        };
        let auth = AuthManager::new_with_token_url(creds, format!("{}/oauth/token", server.uri()));
        UpstreamClient {
            http: reqwest::Client::new(),
            auth,
            base_url: server.uri(),
        }
    }

    #[tokio::test]
    async fn get_bars_parses_latest_bar() {
        let server = MockServer::start().await;
        let client = client_against(&server).await;
        Mock::given(method("GET"))
            .and(path("/marketdata/barcharts/SPY"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "Bars": [{
                    "Open": "600.1", "High": "601.0", "Low": "599.5", "Close": "600.8",
                    "TimeStamp": "2024-02-05T14:30:00Z",
                    "TotalVolume": "1000000", "UpVolume": "600000", "DownVolume": "400000",
                    "IsRealtime": true
                }]
            })))
            .mount(&server)
            .await;

        let bar = client.get_bars("SPY").await.unwrap();
        assert!((bar.close - 600.8).abs() < 1e-9);
        assert_eq!(bar.total_volume, 1_000_000);
    }

    #[tokio::test]
    async fn get_strikes_extracts_first_column() {
        let server = MockServer::start().await;
        let client = client_against(&server).await;
        Mock::given(method("GET"))
            .and(path("/marketdata/options/strikes/SPY"))
            .and(query_param("expiration", "2024-02-05"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "Strikes": [["595.0"], ["600.0"], ["605.0"]]
            })))
            .mount(&server)
            .await;

        let strikes = client
            .get_strikes("SPY", NaiveDate::from_ymd_opt(2024, 2, 5).unwrap())
            .await
            .unwrap();
        assert_eq!(strikes, vec![595.0, 600.0, 605.0]);
    }

    #[tokio::test]
    async fn stream_options_chain_skips_malformed_lines_without_ending_stream() {
        // A malformed line is interleaved between a heartbeat and a
        // quote frame and must be dropped without terminating the
        // stream or the other two frames.
        let server = MockServer::start().await;
        let client = client_against(&server).await;
        let body = concat!(
            r#"{"Heartbeat": 1, "Timestamp": "2024-02-05T14:30:00Z"}"#,
            "\n",
            "{not valid json}\n",
            r#"{"Legs":[{"Symbol":"SPY","StrikePrice":600.0,"OptionType":"Call","Expiration":"2024-02-05T00:00:00Z"}],"#,
            r#""Bid":1.0,"Ask":1.2,"Mid":1.1,"Last":1.15,"Volume":10,"#,
            r#""DailyOpenInterest":500,"ImpliedVolatility":0.15,"#,
            r#""Delta":0.5,"Gamma":0.02,"Theta":-0.1,"Vega":0.3,"Rho":0.05}"#,
            "\n",
        );
        Mock::given(method("GET"))
            .and(path("/marketdata/stream/options/chains/SPY"))
            .respond_with(ResponseTemplate::new(200).set_body_raw(body, "application/json"))
            .mount(&server)
            .await;

        let (tx, mut rx) = mpsc::channel(8);
        client
            .stream_options_chain("SPY", NaiveDate::from_ymd_opt(2024, 2, 5).unwrap(), None, tx)
            .await
            .unwrap();

        let mut frames = Vec::new();
        while let Ok(frame) = rx.try_recv() {
            frames.push(frame);
        }
        assert_eq!(frames.len(), 2); // heartbeat + quote; malformed line dropped
        assert!(matches!(frames[0], StreamFrame::Heartbeat(_)));
        assert!(matches!(frames[1], StreamFrame::Quote(_)));
    }
}

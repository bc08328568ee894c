//! XML session configuration. Each `<Session>` element selects a venue
//! connection factory via its `schema` attribute and carries connection
//! parameters plus free-form `<Parameter>` children for anything venue
//! specific that doesn't warrant its own attribute.

use serde::Deserialize;

use crate::error::{GatewayError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionSchema {
    BinanceMd,
    BinanceOrd,
    CoinbaseMd,
    CoinbaseOrd,
    OkxMd,
    OkxOrd,
}

impl SessionSchema {
    pub fn parse(raw: &str) -> Result<Self> {
        match raw {
            "Binance:MD" => Ok(Self::BinanceMd),
            "Binance:ORD" => Ok(Self::BinanceOrd),
            "Coinbase:MD" => Ok(Self::CoinbaseMd),
            "Coinbase:ORD" => Ok(Self::CoinbaseOrd),
            "OKX:MD" => Ok(Self::OkxMd),
            "OKX:ORD" => Ok(Self::OkxOrd),
            other => Err(GatewayError::InvalidArgument(format!("unknown session schema: {other}"))),
        }
    }

    /// Order-execution schemas are recognized so a config file mixing MD
    /// and ORD sessions parses cleanly, but this gateway only connects MD
    /// sessions; ORD sessions are rejected at construction time.
    pub fn is_market_data(self) -> bool {
        matches!(self, Self::BinanceMd | Self::CoinbaseMd | Self::OkxMd)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct Parameter {
    #[serde(rename = "@name")]
    pub name: String,
    #[serde(rename = "@value")]
    pub value: String,
}

#[derive(Debug, Clone, Deserialize)]
struct RawSession {
    #[serde(rename = "@name")]
    name: String,
    #[serde(rename = "@num_id")]
    num_id: i64,
    #[serde(rename = "@active", default = "default_true")]
    active: bool,
    #[serde(rename = "@host")]
    host: String,
    #[serde(rename = "@port")]
    port: u16,
    #[serde(rename = "@api_key", default)]
    api_key: String,
    #[serde(rename = "@secret_key", default)]
    secret_key: String,
    #[serde(rename = "@passphrase", default)]
    passphrase: String,
    #[serde(rename = "@recv_window", default)]
    recv_window: i64,
    #[serde(rename = "@instruments")]
    instruments: String,
    #[serde(rename = "@channels", default)]
    channels: String,
    #[serde(rename = "@depth", default)]
    depth: u32,
    #[serde(rename = "@protocol", default)]
    protocol: String,
    #[serde(rename = "@schema")]
    schema: String,
    #[serde(rename = "Parameter", default)]
    parameters: Vec<Parameter>,
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Deserialize)]
struct RawGatewayConfig {
    #[serde(rename = "Session", default)]
    sessions: Vec<RawSession>,
}

#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub name: String,
    pub num_id: i64,
    pub active: bool,
    pub host: String,
    pub port: u16,
    pub api_key: String,
    pub secret_key: String,
    pub passphrase: String,
    pub recv_window: i64,
    pub instruments: Vec<String>,
    pub channels: Vec<String>,
    pub depth: u32,
    pub protocol: String,
    pub schema: SessionSchema,
    pub parameters: std::collections::HashMap<String, String>,
}

impl SessionConfig {
    fn from_raw(raw: RawSession) -> Result<Self> {
        let schema = SessionSchema::parse(&raw.schema)?;
        if !schema.is_market_data() {
            return Err(GatewayError::InvalidArgument(format!(
                "session '{}': order-execution schemas are out of scope",
                raw.name
            )));
        }
        Ok(Self {
            name: raw.name,
            num_id: raw.num_id,
            active: raw.active,
            host: raw.host,
            port: raw.port,
            api_key: raw.api_key,
            secret_key: raw.secret_key,
            passphrase: raw.passphrase,
            recv_window: raw.recv_window,
            instruments: split_csv(&raw.instruments),
            channels: split_csv(&raw.channels),
            depth: raw.depth,
            protocol: raw.protocol,
            schema,
            parameters: raw.parameters.into_iter().map(|p| (p.name, p.value)).collect(),
        })
    }

    pub fn parameter(&self, name: &str) -> Option<&str> {
        self.parameters.get(name).map(String::as_str)
    }
}

fn split_csv(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub sessions: Vec<SessionConfig>,
}

impl GatewayConfig {
    pub fn from_xml(xml: &str) -> Result<Self> {
        let raw: RawGatewayConfig =
            quick_xml::de::from_str(xml).map_err(|e| GatewayError::ParseError(format!("config xml: {e}")))?;
        let sessions = raw
            .sessions
            .into_iter()
            .map(SessionConfig::from_raw)
            .collect::<Result<Vec<_>>>()?;
        Ok(Self { sessions })
    }

    pub fn active_sessions(&self) -> impl Iterator<Item = &SessionConfig> {
        self.sessions.iter().filter(|s| s.active)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
        <GatewayConfig>
            <Session name="binance-md-1" num_id="1" active="true" host="stream.binance.com" port="9443"
                     instruments="BTC/USDT,ETH/USDT" channels="depth" depth="20" protocol="wss" schema="Binance:MD">
                <Parameter name="update_speed" value="100ms"/>
            </Session>
            <Session name="coinbase-ord-1" num_id="2" active="false" host="ws-feed.exchange.coinbase.com" port="443"
                     instruments="BTC-USD" schema="Coinbase:ORD"/>
        </GatewayConfig>
    "#;

    #[test]
    fn rejects_order_execution_schema() {
        let raw: RawGatewayConfig = quick_xml::de::from_str(SAMPLE).unwrap();
        let err = SessionConfig::from_raw(raw.sessions.into_iter().nth(1).unwrap()).unwrap_err();
        assert!(matches!(err, GatewayError::InvalidArgument(_)));
    }

    #[test]
    fn parses_instruments_and_parameters() {
        let raw: RawGatewayConfig = quick_xml::de::from_str(SAMPLE).unwrap();
        let session = SessionConfig::from_raw(raw.sessions.into_iter().next().unwrap()).unwrap();
        assert_eq!(session.instruments, vec!["BTC/USDT", "ETH/USDT"]);
        assert_eq!(session.parameter("update_speed"), Some("100ms"));
        assert_eq!(session.schema, SessionSchema::BinanceMd);
    }
}

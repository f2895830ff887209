use super::{
    Credential, DataPoint, ForecastSnapshot,
    connect::{CloseCode, State, WS_READ_TIMEOUT, connect_ws},
};

use fastwebsockets::{Frame, OpCode};
use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use url::Url;

use std::time::Duration;

const FETCH_TIMEOUT: Duration = Duration::from_secs(15);

const HISTORY_PATH: &str = "/data/history";
const FORECAST_PATH: &str = "/data/forecast";

#[derive(thiserror::Error, Debug)]
pub enum AdapterError {
    #[error("{0}")]
    FetchError(#[from] reqwest::Error),
    #[error("HTTP {0}: {1}")]
    HttpStatus(reqwest::StatusCode, String),
    #[error("Parsing: {0}")]
    ParseError(String),
    #[error("Stream: {0}")]
    WebsocketError(String),
    #[error("Invalid request: {0}")]
    InvalidRequest(String),
    #[error("Insufficient data: {0}")]
    InsufficientData(String),
}

impl AdapterError {
    pub fn to_user_message(&self) -> &'static str {
        match self {
            AdapterError::InvalidRequest(err) => {
                log::error!("Adapter invalid request: {err}");
                "Invalid request made to the backend. Check logs for details."
            }
            AdapterError::FetchError(err) => {
                log::error!("Adapter fetch error: {err}");
                "Network error while contacting the backend."
            }
            AdapterError::HttpStatus(status, body) => {
                log::error!("Adapter HTTP {status}: {body}");
                if *status == reqwest::StatusCode::UNAUTHORIZED {
                    "Session expired. Please log in again."
                } else {
                    "The backend rejected the request. Check logs for details."
                }
            }
            AdapterError::ParseError(err) => {
                log::error!("Adapter parse error: {err}");
                "Unexpected response from the backend. Check logs for details."
            }
            AdapterError::WebsocketError(err) => {
                log::error!("Adapter websocket error: {err}");
                "Realtime connection error. Trying to reconnect..."
            }
            AdapterError::InsufficientData(err) => {
                log::info!("Forecast unavailable: {err}");
                "Not enough data for a forecast yet."
            }
        }
    }
}

/// Identifies one transport instance.
///
/// Every `start` opens a fresh id, so events from a replaced socket can be told
/// apart from events of the live one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StreamId(pub u64);

impl std::fmt::Display for StreamId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[derive(Debug, Clone)]
pub enum Event {
    Connected(StreamId),
    DataReceived(StreamId, DataPoint),
    /// A frame that could not be decoded. The connection stays open.
    Malformed(StreamId, String),
    /// Transport-level failure. Does not close the connection by itself.
    Error(StreamId, String),
    Closed(StreamId, CloseCode),
}

impl Event {
    pub fn stream_id(&self) -> StreamId {
        match self {
            Event::Connected(id)
            | Event::DataReceived(id, _)
            | Event::Malformed(id, _)
            | Event::Error(id, _)
            | Event::Closed(id, _) => *id,
        }
    }
}

#[derive(Debug, PartialEq)]
enum StreamData {
    NewData(DataPoint),
    Ignored(String),
}

fn feed_de(slice: &[u8]) -> Result<StreamData, AdapterError> {
    let mut v: Value =
        serde_json::from_slice(slice).map_err(|e| AdapterError::ParseError(e.to_string()))?;

    let kind = v
        .get("type")
        .and_then(|t| t.as_str())
        .ok_or_else(|| AdapterError::ParseError("Missing message type".to_string()))?;

    if kind != "new_data" {
        return Ok(StreamData::Ignored(kind.to_string()));
    }

    let payload = v
        .get_mut("payload")
        .map(Value::take)
        .ok_or_else(|| AdapterError::ParseError("new_data without payload".to_string()))?;

    serde_json::from_value(payload)
        .map(StreamData::NewData)
        .map_err(|e| AdapterError::ParseError(e.to_string()))
}

/// Appends the credential as the `token` query parameter.
pub fn stream_url(base: &Url, credential: &Credential) -> Url {
    let mut url = base.clone();
    url.query_pairs_mut()
        .clear()
        .append_pair("token", credential.expose());
    url
}

async fn try_connect(id: StreamId, url: &Url, output: &mpsc::Sender<Event>) -> State {
    match connect_ws(url).await {
        Ok(websocket) => {
            let _ = output.send(Event::Connected(id)).await;
            State::Connected(websocket)
        }
        Err(err) => {
            let _ = output
                .send(Event::Error(id, format!("Failed to connect: {err}")))
                .await;
            let _ = output.send(Event::Closed(id, CloseCode::ABNORMAL)).await;
            State::Disconnected
        }
    }
}

/// Runs a single live connection until it closes or `shutdown` fires.
///
/// Never reconnects on its own: the caller owns the reconnect policy and opens a
/// new stream with a new id. Firing `shutdown` sends a `1000` close frame and
/// returns without reporting a close event.
pub async fn connect_data_stream(
    id: StreamId,
    url: Url,
    output: mpsc::Sender<Event>,
    mut shutdown: oneshot::Receiver<()>,
) {
    let mut state = tokio::select! {
        biased;
        _ = &mut shutdown => {
            log::debug!("stream {id} cancelled while connecting");
            return;
        }
        state = try_connect(id, &url, &output) => state,
    };

    loop {
        let State::Connected(ws) = &mut state else {
            return;
        };

        let read = tokio::select! {
            read = tokio::time::timeout(WS_READ_TIMEOUT, ws.read_frame()) => read,
            _ = &mut shutdown => {
                if let Err(e) = ws.write_frame(Frame::close(CloseCode::NORMAL.0, b"")).await {
                    log::debug!("stream {id} close frame not delivered: {e}");
                }
                log::debug!("stream {id} closed intentionally");
                return;
            }
        };

        match read {
            Ok(Ok(msg)) => match msg.opcode {
                OpCode::Text => match feed_de(&msg.payload[..]) {
                    Ok(StreamData::NewData(point)) => {
                        let _ = output.send(Event::DataReceived(id, point)).await;
                    }
                    Ok(StreamData::Ignored(kind)) => {
                        log::debug!("stream {id} ignoring message type {kind:?}");
                    }
                    Err(err) => {
                        let _ = output.send(Event::Malformed(id, err.to_string())).await;
                    }
                },
                OpCode::Close => {
                    let code = CloseCode::from_payload(&msg.payload[..]);
                    state = State::Disconnected;
                    let _ = output.send(Event::Closed(id, code)).await;
                }
                _ => {}
            },
            Ok(Err(e)) => {
                state = State::Disconnected;
                let _ = output
                    .send(Event::Error(id, format!("Error reading frame: {e}")))
                    .await;
                let _ = output.send(Event::Closed(id, CloseCode::ABNORMAL)).await;
            }
            Err(_) => {
                state = State::Disconnected;
                let _ = output
                    .send(Event::Error(
                        id,
                        format!("No frames for {}s", WS_READ_TIMEOUT.as_secs()),
                    ))
                    .await;
                let _ = output.send(Event::Closed(id, CloseCode::ABNORMAL)).await;
            }
        }
    }
}

fn endpoint(api: &Url, path: &str) -> Url {
    let mut url = api.clone();
    url.set_path(path);
    url.set_query(None);
    url
}

async fn get_json(
    client: &reqwest::Client,
    url: Url,
    credential: &Credential,
) -> Result<Value, AdapterError> {
    let resp = client
        .get(url)
        .bearer_auth(credential.expose())
        .timeout(FETCH_TIMEOUT)
        .send()
        .await?;

    if !resp.status().is_success() {
        let status = resp.status();
        let body = resp.text().await.unwrap_or_default();
        return Err(AdapterError::HttpStatus(status, body));
    }

    let text = resp.text().await?;
    serde_json::from_str(&text).map_err(|e| AdapterError::ParseError(e.to_string()))
}

/// Recent history, oldest first.
pub async fn fetch_history(
    client: &reqwest::Client,
    api: &Url,
    credential: &Credential,
) -> Result<Vec<DataPoint>, AdapterError> {
    let body = get_json(client, endpoint(api, HISTORY_PATH), credential).await?;

    serde_json::from_value(body).map_err(|e| AdapterError::ParseError(format!("history: {e}")))
}

pub async fn fetch_forecast(
    client: &reqwest::Client,
    api: &Url,
    credential: &Credential,
) -> Result<ForecastSnapshot, AdapterError> {
    let body = get_json(client, endpoint(api, FORECAST_PATH), credential).await?;

    parse_forecast(body)
}

fn parse_forecast(body: Value) -> Result<ForecastSnapshot, AdapterError> {
    // the backend answers 200 with {error, message} until it has enough points
    if let Some(err) = body.get("error").and_then(|e| e.as_str()) {
        let message = body
            .get("message")
            .and_then(|m| m.as_str())
            .unwrap_or(err)
            .to_string();
        return Err(AdapterError::InsufficientData(message));
    }

    serde_json::from_value(body).map_err(|e| AdapterError::ParseError(format!("forecast: {e}")))
}

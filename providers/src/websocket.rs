//! Generic WebSocket transport.
//!
//! The socket handling is shared; message layout is delegated to a
//! [`WireCodec`]. [`JsonCodec`] speaks a plain JSON protocol with base64
//! audio. Provider-specific codecs plug in behind the same trait.

use crate::transport::{Connected, InboundEvent, ProviderTransport, TransportConnector};
use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use errors::TransportError;
use futures_util::{SinkExt, StreamExt};
use relay_core::{AudioFormat, AudioFrame, SessionConfig, ToolDefinition};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::header::{AUTHORIZATION, RETRY_AFTER};
use tokio_tungstenite::tungstenite::http::{HeaderValue, StatusCode};
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use tracing::{debug, trace};

/// Maps session setup, audio and events to and from text frames.
pub trait WireCodec: Send + Sync {
    fn encode_setup(&self, session: &SessionConfig) -> Result<String, TransportError>;

    fn encode_audio(&self, frame: &AudioFrame) -> Result<String, TransportError>;

    fn encode_function_result(&self, call_id: &str, output: &Value)
    -> Result<String, TransportError>;

    /// `Ok(None)` for messages the relay does not act on.
    fn decode(
        &self,
        text: &str,
        output_format: AudioFormat
    ) -> Result<Option<InboundEvent>, TransportError>;
}

#[derive(Serialize)]
struct SetupPayload<'a> {
    model: &'a str,
    instructions: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    voice: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_output_tokens: Option<u32>,
    input_audio_format: AudioFormat,
    output_audio_format: AudioFormat,
    tools: &'a [ToolDefinition]
}

#[derive(Serialize)]
#[serde(tag = "type")]
enum Outbound<'a> {
    #[serde(rename = "session.setup")]
    SessionSetup { session: SetupPayload<'a> },
    #[serde(rename = "input_audio.append")]
    AudioAppend { audio: String, sequence: u64 },
    #[serde(rename = "function_call.output")]
    FunctionCallOutput { call_id: &'a str, output: &'a Value }
}

#[derive(Deserialize)]
#[serde(tag = "type")]
enum Inbound {
    #[serde(rename = "session.created", alias = "session.updated")]
    Session { session_id: String },
    #[serde(rename = "output_audio.delta")]
    AudioDelta {
        audio: String,
        #[serde(default)]
        sequence: u64
    },
    #[serde(rename = "transcript")]
    Transcript {
        text: String,
        #[serde(default)]
        is_final: bool
    },
    #[serde(rename = "function_call")]
    FunctionCall {
        call_id: String,
        name: String,
        #[serde(default)]
        arguments: Value
    },
    #[serde(rename = "rate_limited")]
    RateLimited {
        #[serde(default)]
        retry_after_secs: Option<u64>
    },
    #[serde(rename = "error")]
    Error { message: String },
    #[serde(rename = "heartbeat")]
    Heartbeat,
    #[serde(other)]
    Unknown
}

/// JSON text protocol with base64-encoded audio.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonCodec;

fn encode<T: Serialize>(message: &T) -> Result<String, TransportError> {
    serde_json::to_string(message).map_err(|e| TransportError::Protocol {
        reason: e.to_string()
    })
}

impl WireCodec for JsonCodec {
    fn encode_setup(&self, session: &SessionConfig) -> Result<String, TransportError> {
        encode(&Outbound::SessionSetup {
            session: SetupPayload {
                model: &session.model,
                instructions: &session.instructions,
                voice: session.voice.as_deref(),
                temperature: session.temperature,
                max_output_tokens: session.max_output_tokens,
                input_audio_format: session.input_format,
                output_audio_format: session.output_format,
                tools: &session.tools
            }
        })
    }

    fn encode_audio(&self, frame: &AudioFrame) -> Result<String, TransportError> {
        encode(&Outbound::AudioAppend {
            audio: BASE64.encode(frame.payload()),
            sequence: frame.sequence()
        })
    }

    fn encode_function_result(
        &self,
        call_id: &str,
        output: &Value
    ) -> Result<String, TransportError> {
        encode(&Outbound::FunctionCallOutput { call_id, output })
    }

    fn decode(
        &self,
        text: &str,
        output_format: AudioFormat
    ) -> Result<Option<InboundEvent>, TransportError> {
        let message: Inbound = serde_json::from_str(text).map_err(|e| TransportError::Protocol {
            reason: format!("undecodable provider message: {e}")
        })?;

        let event = match message {
            Inbound::Session { session_id } => InboundEvent::SessionUpdated { session_id },
            Inbound::AudioDelta { audio, sequence } => {
                let payload = BASE64.decode(audio).map_err(|e| TransportError::Protocol {
                    reason: format!("invalid audio payload: {e}")
                })?;
                InboundEvent::Audio(AudioFrame::new(payload, output_format, sequence))
            }
            Inbound::Transcript { text, is_final } => InboundEvent::Transcript { text, is_final },
            Inbound::FunctionCall {
                call_id,
                name,
                arguments
            } => InboundEvent::FunctionCall {
                call_id,
                name,
                arguments
            },
            Inbound::RateLimited { retry_after_secs } => {
                InboundEvent::RateLimited { retry_after_secs }
            }
            Inbound::Error { message } => InboundEvent::ProviderError { message },
            Inbound::Heartbeat => InboundEvent::Heartbeat,
            Inbound::Unknown => return Ok(None)
        };
        Ok(Some(event))
    }
}

pub struct WebSocketConnector {
    endpoint: String,
    api_key: Option<String>,
    codec: Arc<dyn WireCodec>
}

impl std::fmt::Debug for WebSocketConnector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WebSocketConnector")
            .field("endpoint", &self.endpoint)
            .field("api_key", &self.api_key.as_ref().map(|_| "***"))
            .finish_non_exhaustive()
    }
}

impl WebSocketConnector {
    pub fn new(endpoint: impl Into<String>, codec: Arc<dyn WireCodec>) -> Self {
        Self {
            endpoint: endpoint.into(),
            api_key: None,
            codec
        }
    }

    /// Sent as a bearer token on the upgrade request.
    pub fn with_api_key(mut self, api_key: impl Into<String>) -> Self {
        self.api_key = Some(api_key.into());
        self
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    fn connect_error(&self, error: tungstenite::Error) -> TransportError {
        match error {
            tungstenite::Error::Http(response)
                if response.status() == StatusCode::TOO_MANY_REQUESTS =>
            {
                let retry_after_secs = response
                    .headers()
                    .get(RETRY_AFTER)
                    .and_then(|value| value.to_str().ok())
                    .and_then(|value| value.trim().parse().ok());
                TransportError::RateLimited { retry_after_secs }
            }
            other => TransportError::Connect {
                endpoint: self.endpoint.clone(),
                reason: other.to_string()
            }
        }
    }
}

#[async_trait]
impl TransportConnector for WebSocketConnector {
    async fn connect(&self, session: &SessionConfig) -> Result<Connected, TransportError> {
        let mut request =
            self.endpoint
                .as_str()
                .into_client_request()
                .map_err(|e| TransportError::Connect {
                    endpoint: self.endpoint.clone(),
                    reason: e.to_string()
                })?;
        if let Some(api_key) = &self.api_key {
            let value = HeaderValue::from_str(&format!("Bearer {api_key}")).map_err(|e| {
                TransportError::Connect {
                    endpoint: self.endpoint.clone(),
                    reason: format!("invalid api key header: {e}")
                }
            })?;
            request.headers_mut().insert(AUTHORIZATION, value);
        }

        let (stream, _response) = connect_async(request)
            .await
            .map_err(|e| self.connect_error(e))?;
        debug!(endpoint = %self.endpoint, "WebSocket connected, sending session setup");

        let mut transport = WebSocketTransport {
            stream,
            codec: Arc::clone(&self.codec),
            output_format: session.output_format,
            awaiting_pong: false
        };
        transport.send_text(self.codec.encode_setup(session)?).await?;
        let session_id = transport.await_session_ack().await?;

        Ok(Connected {
            transport: Box::new(transport),
            session_id: Some(session_id)
        })
    }
}

pub struct WebSocketTransport {
    stream: WebSocketStream<MaybeTlsStream<TcpStream>>,
    codec: Arc<dyn WireCodec>,
    output_format: AudioFormat,
    /// Set by `ping`, cleared by anything the peer sends
    awaiting_pong: bool
}

impl WebSocketTransport {
    async fn send_text(&mut self, text: String) -> Result<(), TransportError> {
        self.stream
            .send(Message::Text(text.into()))
            .await
            .map_err(|e| TransportError::Send {
                reason: e.to_string()
            })
    }

    /// Read until the provider acknowledges the session setup.
    async fn await_session_ack(&mut self) -> Result<String, TransportError> {
        loop {
            match self.recv().await {
                Some(Ok(InboundEvent::SessionUpdated { session_id })) => return Ok(session_id),
                Some(Ok(InboundEvent::ProviderError { message })) => {
                    return Err(TransportError::Handshake { reason: message });
                }
                Some(Ok(InboundEvent::RateLimited { retry_after_secs })) => {
                    return Err(TransportError::RateLimited { retry_after_secs });
                }
                Some(Ok(other)) => trace!(event = ?other, "Ignoring event before session ack"),
                Some(Err(e)) => return Err(e),
                None => return Err(TransportError::Closed)
            }
        }
    }
}

#[async_trait]
impl ProviderTransport for WebSocketTransport {
    async fn send_audio(&mut self, frame: &AudioFrame) -> Result<(), TransportError> {
        let text = self.codec.encode_audio(frame)?;
        self.send_text(text).await
    }

    async fn send_function_result(
        &mut self,
        call_id: &str,
        output: &Value
    ) -> Result<(), TransportError> {
        let text = self.codec.encode_function_result(call_id, output)?;
        self.send_text(text).await
    }

    async fn recv(&mut self) -> Option<Result<InboundEvent, TransportError>> {
        loop {
            let message = self.stream.next().await;
            if matches!(message, Some(Ok(_))) {
                self.awaiting_pong = false;
            }
            match message {
                Some(Ok(Message::Text(text))) => {
                    match self.codec.decode(&text, self.output_format) {
                        Ok(Some(event)) => return Some(Ok(event)),
                        Ok(None) => continue,
                        Err(e) => return Some(Err(e))
                    }
                }
                Some(Ok(Message::Pong(_))) => return Some(Ok(InboundEvent::Heartbeat)),
                // Pings are answered by tungstenite itself
                Some(Ok(Message::Ping(_) | Message::Binary(_) | Message::Frame(_))) => continue,
                Some(Ok(Message::Close(_))) | None => return None,
                Some(Err(e)) => {
                    return Some(Err(TransportError::Protocol {
                        reason: e.to_string()
                    }));
                }
            }
        }
    }

    /// Fails when the peer stayed silent since the previous ping, which is
    /// how a half-open TCP link shows up.
    async fn ping(&mut self) -> Result<(), TransportError> {
        if self.awaiting_pong {
            return Err(TransportError::Unresponsive);
        }
        self.stream
            .send(Message::Ping(Default::default()))
            .await
            .map_err(|e| TransportError::Send {
                reason: e.to_string()
            })?;
        self.awaiting_pong = true;
        Ok(())
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        self.stream
            .close(None)
            .await
            .map_err(|e| TransportError::Protocol {
                reason: e.to_string()
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use relay_core::AudioEncoding;
    use std::time::Duration;
    use tokio::net::TcpListener;

    fn decode(text: &str) -> Result<Option<InboundEvent>, TransportError> {
        JsonCodec.decode(text, AudioFormat::pcm16_24k())
    }

    #[test]
    fn test_setup_message_carries_session_config() {
        let session = SessionConfig::new("p", "model-x")
            .with_instructions("be brief")
            .with_voice("alloy")
            .with_formats(AudioFormat::telephony(), AudioFormat::pcm16_24k());

        let json: Value = serde_json::from_str(&JsonCodec.encode_setup(&session).unwrap()).unwrap();
        assert_eq!(json["type"], "session.setup");
        assert_eq!(json["session"]["model"], "model-x");
        assert_eq!(json["session"]["instructions"], "be brief");
        assert_eq!(json["session"]["voice"], "alloy");
        assert_eq!(json["session"]["input_audio_format"]["encoding"], "mulaw");
        assert_eq!(json["session"]["output_audio_format"]["sample_rate"], 24_000);
        assert!(json["session"].get("temperature").is_none());
    }

    #[test]
    fn test_audio_is_base64_encoded() {
        let frame = AudioFrame::new(vec![1u8, 2, 3], AudioFormat::telephony(), 4);
        let json: Value = serde_json::from_str(&JsonCodec.encode_audio(&frame).unwrap()).unwrap();
        assert_eq!(json["type"], "input_audio.append");
        assert_eq!(json["audio"], "AQID");
        assert_eq!(json["sequence"], 4);
    }

    #[test]
    fn test_decode_inbound_messages() {
        match decode(r#"{"type":"output_audio.delta","audio":"AQID","sequence":2}"#) {
            Ok(Some(InboundEvent::Audio(frame))) => {
                assert_eq!(frame.payload().as_ref(), &[1, 2, 3]);
                assert_eq!(frame.format().encoding, AudioEncoding::Pcm16);
                assert_eq!(frame.sequence(), 2);
            }
            other => panic!("unexpected {other:?}")
        }

        assert_eq!(
            decode(r#"{"type":"session.created","session_id":"s1"}"#).unwrap(),
            Some(InboundEvent::SessionUpdated {
                session_id: "s1".into()
            })
        );
        assert_eq!(
            decode(r#"{"type":"rate_limited","retry_after_secs":12}"#).unwrap(),
            Some(InboundEvent::RateLimited {
                retry_after_secs: Some(12)
            })
        );
        assert_eq!(
            decode(r#"{"type":"function_call","call_id":"c1","name":"lookup"}"#).unwrap(),
            Some(InboundEvent::FunctionCall {
                call_id: "c1".into(),
                name: "lookup".into(),
                arguments: Value::Null
            })
        );
        assert_eq!(decode(r#"{"type":"heartbeat"}"#).unwrap(), Some(InboundEvent::Heartbeat));
    }

    #[test]
    fn test_unknown_messages_are_ignored_and_garbage_rejected() {
        assert_eq!(decode(r#"{"type":"response.done"}"#).unwrap(), None);
        assert!(matches!(decode("not json"), Err(TransportError::Protocol { .. })));
        assert!(matches!(
            decode(r#"{"type":"output_audio.delta","audio":"%%%"}"#),
            Err(TransportError::Protocol { .. })
        ));
    }

    #[tokio::test]
    async fn test_connect_handshake_and_stream_audio() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let server = tokio::spawn(async move {
            let (socket, _) = listener.accept().await.unwrap();
            let mut ws = tokio_tungstenite::accept_async(socket).await.unwrap();

            let setup = match ws.next().await {
                Some(Ok(Message::Text(text))) => serde_json::from_str::<Value>(&text).unwrap(),
                other => panic!("expected setup, got {other:?}")
            };
            assert_eq!(setup["type"], "session.setup");

            ws.send(Message::Text(
                r#"{"type":"session.created","session_id":"srv-1"}"#.to_string().into()
            ))
            .await
            .unwrap();
            ws.send(Message::Text(
                r#"{"type":"output_audio.delta","audio":"AQID"}"#.to_string().into()
            ))
            .await
            .unwrap();

            match ws.next().await {
                Some(Ok(Message::Text(text))) => serde_json::from_str::<Value>(&text).unwrap(),
                other => panic!("expected audio, got {other:?}")
            }
        });

        let connector = WebSocketConnector::new(format!("ws://{addr}"), Arc::new(JsonCodec))
            .with_api_key("secret");
        let mut connected = connector
            .connect(&SessionConfig::new("p", "model-x"))
            .await
            .unwrap();
        assert_eq!(connected.session_id.as_deref(), Some("srv-1"));

        match connected.transport.recv().await {
            Some(Ok(InboundEvent::Audio(frame))) => assert_eq!(frame.len(), 3),
            other => panic!("unexpected {other:?}")
        }
        connected
            .transport
            .send_audio(&AudioFrame::new(vec![9u8], AudioFormat::telephony(), 1))
            .await
            .unwrap();

        let received = server.await.unwrap();
        assert_eq!(received["type"], "input_audio.append");
        assert_eq!(received["sequence"], 1);
    }

    async fn accept_session(listener: TcpListener) -> WebSocketStream<TcpStream> {
        let (socket, _) = listener.accept().await.unwrap();
        let mut ws = tokio_tungstenite::accept_async(socket).await.unwrap();
        assert!(matches!(ws.next().await, Some(Ok(Message::Text(_)))));
        ws.send(Message::Text(
            r#"{"type":"session.created","session_id":"srv-1"}"#.to_string().into()
        ))
        .await
        .unwrap();
        ws
    }

    #[tokio::test]
    async fn test_unanswered_ping_fails_next_ping() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (hold_tx, hold_rx) = tokio::sync::oneshot::channel::<()>();

        // Stops reading after the handshake, so pings are never answered.
        let server = tokio::spawn(async move {
            let ws = accept_session(listener).await;
            let _ = hold_rx.await;
            drop(ws);
        });

        let connector = WebSocketConnector::new(format!("ws://{addr}"), Arc::new(JsonCodec));
        let mut connected = connector
            .connect(&SessionConfig::new("p", "m"))
            .await
            .unwrap();

        connected.transport.ping().await.unwrap();
        assert!(matches!(
            connected.transport.ping().await,
            Err(TransportError::Unresponsive)
        ));

        let _ = hold_tx.send(());
        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_answered_ping_keeps_transport_alive() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let server = tokio::spawn(async move {
            let mut ws = accept_session(listener).await;
            // Reading lets tungstenite answer pings.
            while let Some(Ok(_)) = ws.next().await {}
        });

        let connector = WebSocketConnector::new(format!("ws://{addr}"), Arc::new(JsonCodec));
        let mut connected = connector
            .connect(&SessionConfig::new("p", "m"))
            .await
            .unwrap();

        connected.transport.ping().await.unwrap();
        let reply = tokio::time::timeout(Duration::from_secs(5), connected.transport.recv())
            .await
            .unwrap();
        assert!(matches!(reply, Some(Ok(InboundEvent::Heartbeat))));
        connected.transport.ping().await.unwrap();

        connected.transport.close().await.unwrap();
        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_connect_refused_maps_to_connect_error() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let connector = WebSocketConnector::new(format!("ws://{addr}"), Arc::new(JsonCodec));
        let err = connector
            .connect(&SessionConfig::new("p", "m"))
            .await
            .unwrap_err();
        assert!(matches!(err, TransportError::Connect { .. }));
    }
}

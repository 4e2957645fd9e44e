//! Notification channel between the remote service and the mirror host.
//!
//! The host connects over a local TCP socket. Every frame is a
//! little-endian `u32` length followed by a MessagePack [`Envelope`].

use crate::model::ConfigSnapshot;
use crate::service::RemoteService;
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpListener;
use thiserror::Error;
use tokio::sync::{broadcast, watch};
use uuid::Uuid;

const BUS_PROTOCOL_VERSION: u8 = 1;
const MAX_FRAME_SIZE: usize = 64 * 1024;

pub type NotificationSender = broadcast::Sender<Notification>;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope<T> {
    pub v: u8,
    pub id: String,
    pub ts_unix_ms: u64,
    #[serde(rename = "type")]
    pub message_type: String,
    pub payload: T,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VisibilityPayload {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub module: Option<String>,
    #[serde(rename = "useLockStrings", skip_serializing_if = "Option::is_none")]
    pub use_lock_strings: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub force: Option<bool>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AlertPayload {
    #[serde(rename = "type")]
    pub kind: String,
    pub title: String,
    pub message: String,
    /// Display time in milliseconds.
    pub timer: u64,
}

/// Outbound notifications, service -> host.
#[derive(Debug, Clone, PartialEq)]
pub enum Notification {
    Update,
    Show(VisibilityPayload),
    Hide(VisibilityPayload),
    Brightness(Option<String>),
    Restart,
    Refresh,
    HideAlert,
    ShowAlert(AlertPayload),
    DefaultSettings(ConfigSnapshot),
    IpAddresses(Vec<String>),
}

impl Notification {
    pub fn message_type(&self) -> &'static str {
        match self {
            Notification::Update => "UPDATE",
            Notification::Show(_) => "SHOW",
            Notification::Hide(_) => "HIDE",
            Notification::Brightness(_) => "BRIGHTNESS",
            Notification::Restart => "RESTART",
            Notification::Refresh => "REFRESH",
            Notification::HideAlert => "HIDE_ALERT",
            Notification::ShowAlert(_) => "SHOW_ALERT",
            Notification::DefaultSettings(_) => "DEFAULT_SETTINGS",
            Notification::IpAddresses(_) => "IP_ADDRESSES",
        }
    }

    pub fn payload(&self) -> serde_json::Result<Value> {
        match self {
            Notification::Update
            | Notification::Restart
            | Notification::Refresh
            | Notification::HideAlert => Ok(Value::Null),
            Notification::Show(p) | Notification::Hide(p) => serde_json::to_value(p),
            Notification::Brightness(value) => serde_json::to_value(value),
            Notification::ShowAlert(p) => serde_json::to_value(p),
            Notification::DefaultSettings(snapshot) => serde_json::to_value(snapshot),
            Notification::IpAddresses(addrs) => serde_json::to_value(addrs),
        }
    }

    pub fn to_envelope(&self) -> serde_json::Result<Envelope<Value>> {
        Ok(make_envelope(self.message_type(), self.payload()?))
    }
}

/// Inbound notifications, host -> service.
#[derive(Debug, Clone, PartialEq)]
pub enum Inbound {
    CurrentStatus(ConfigSnapshot),
    RequestDefaultSettings,
    Lang(String),
    RemoteAction(IndexMap<String, String>),
}

impl Inbound {
    /// `Ok(None)` for message types this side does not handle.
    pub fn from_envelope(envelope: &Envelope<Value>) -> io::Result<Option<Self>> {
        let msg = match envelope.message_type.as_str() {
            "CURRENT_STATUS" => Inbound::CurrentStatus(decode_payload(envelope)?),
            "REQUEST_DEFAULT_SETTINGS" => Inbound::RequestDefaultSettings,
            "LANG" => Inbound::Lang(decode_payload(envelope)?),
            "REMOTE_ACTION" => Inbound::RemoteAction(query_from_value(&envelope.payload)?),
            _ => return Ok(None),
        };
        Ok(Some(msg))
    }
}

/// Flattens a `REMOTE_ACTION` payload into query form; scalars are
/// stringified the way they would appear in a URL.
fn query_from_value(payload: &Value) -> io::Result<IndexMap<String, String>> {
    let Value::Object(map) = payload else {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            "REMOTE_ACTION payload must be an object",
        ));
    };
    Ok(map
        .iter()
        .filter_map(|(key, value)| {
            let value = match value {
                Value::Null => return None,
                Value::String(s) => s.clone(),
                other => other.to_string(),
            };
            Some((key.clone(), value))
        })
        .collect())
}

fn now_unix_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

pub fn make_envelope<T: Serialize>(message_type: &str, payload: T) -> Envelope<T> {
    Envelope {
        v: BUS_PROTOCOL_VERSION,
        id: Uuid::new_v4().to_string(),
        ts_unix_ms: now_unix_ms(),
        message_type: message_type.to_string(),
        payload,
    }
}

fn decode_payload<T: for<'de> Deserialize<'de>>(envelope: &Envelope<Value>) -> io::Result<T> {
    serde_json::from_value(envelope.payload.clone()).map_err(|err| {
        io::Error::new(
            io::ErrorKind::InvalidData,
            format!("payload decode failed: {err}"),
        )
    })
}

/// Why an inbound frame could not be turned into an [`Envelope`].
#[derive(Error, Debug)]
pub enum FrameError {
    #[error("frame too large: {0}")]
    TooLarge(usize),

    #[error("decode failed: {0}")]
    Decode(#[from] rmp_serde::decode::Error),

    #[error(transparent)]
    Io(#[from] io::Error),
}

impl FrameError {
    /// The peer closed the stream between frames.
    pub fn is_eof(&self) -> bool {
        matches!(self, FrameError::Io(err) if err.kind() == io::ErrorKind::UnexpectedEof)
    }
}

impl From<FrameError> for io::Error {
    fn from(err: FrameError) -> Self {
        match err {
            FrameError::Io(err) => err,
            other => io::Error::new(io::ErrorKind::InvalidData, other),
        }
    }
}

pub async fn read_frame<R>(reader: &mut R) -> Result<Envelope<Value>, FrameError>
where
    R: AsyncRead + Unpin,
{
    let len = reader.read_u32_le().await? as usize;
    if len > MAX_FRAME_SIZE {
        return Err(FrameError::TooLarge(len));
    }
    let mut buf = vec![0u8; len];
    reader.read_exact(&mut buf).await?;
    Ok(rmp_serde::from_slice(&buf)?)
}

pub async fn write_frame<W, T>(writer: &mut W, message: &Envelope<T>) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    let payload = rmp_serde::to_vec_named(message).map_err(|err| {
        io::Error::new(io::ErrorKind::InvalidData, format!("encode failed: {err}"))
    })?;
    if payload.len() > MAX_FRAME_SIZE {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("encoded frame too large: {}", payload.len()),
        ));
    }
    writer.write_u32_le(payload.len() as u32).await?;
    writer.write_all(&payload).await?;
    writer.flush().await
}

pub async fn bind(addr: SocketAddr) -> io::Result<TcpListener> {
    let listener = TcpListener::bind(addr).await?;
    tracing::info!(%addr, "bus listening");
    Ok(listener)
}

/// Accepts host connections until `shutdown_rx` flips.
pub async fn serve(
    listener: TcpListener,
    service: Arc<RemoteService>,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            accepted = listener.accept() => {
                let (stream, peer) = match accepted {
                    Ok(conn) => conn,
                    Err(err) => {
                        tracing::warn!(error = %err, "bus accept failed");
                        continue;
                    }
                };
                tracing::info!(%peer, "bus session connected");
                let service = service.clone();
                tokio::spawn(async move {
                    let (mut reader, mut writer) = stream.into_split();
                    match handle_session_io(&mut reader, &mut writer, service).await {
                        Ok(()) => tracing::info!(%peer, "bus session closed"),
                        Err(err) => tracing::warn!(%peer, error = %err, "bus session ended with error"),
                    }
                });
            }
            _ = shutdown_rx.changed() => {
                tracing::info!("bus shutting down");
                return;
            }
        }
    }
}

pub async fn handle_session_io<R, W>(
    reader: &mut R,
    writer: &mut W,
    service: Arc<RemoteService>,
) -> io::Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut outbound = service.subscribe();

    let inbound_loop = async {
        loop {
            let envelope = match read_frame(reader).await {
                Ok(envelope) => envelope,
                Err(err) if err.is_eof() => return Ok::<(), io::Error>(()),
                Err(FrameError::Decode(err)) => {
                    tracing::warn!(error = %err, "skipping undecodable bus frame");
                    continue;
                }
                Err(err) => return Err(err.into()),
            };

            if envelope.v != BUS_PROTOCOL_VERSION {
                tracing::warn!(
                    version = envelope.v,
                    expected = BUS_PROTOCOL_VERSION,
                    "bus protocol version mismatch"
                );
                continue;
            }

            match Inbound::from_envelope(&envelope) {
                Ok(Some(msg)) => service.handle_inbound(msg),
                Ok(None) => {
                    tracing::debug!(message_type = %envelope.message_type, "ignoring unknown bus message")
                }
                Err(err) => tracing::warn!(
                    message_type = %envelope.message_type,
                    error = %err,
                    "invalid bus payload"
                ),
            }
        }
    };

    let outbound_loop = async {
        loop {
            let notification = match outbound.recv().await {
                Ok(n) => n,
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "bus session lagging, notifications dropped");
                    continue;
                }
                Err(broadcast::error::RecvError::Closed) => return Ok::<(), io::Error>(()),
            };
            let envelope = notification.to_envelope().map_err(|err| {
                io::Error::new(io::ErrorKind::InvalidData, format!("encode failed: {err}"))
            })?;
            write_frame(writer, &envelope).await?;
        }
    };

    tokio::select! {
        res = inbound_loop => res,
        res = outbound_loop => res,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commands::{CommandError, CommandOutput, CommandRunner};
    use crate::config::Config;
    use crate::model::ModuleDescriptor;
    use std::time::Duration;
    use tokio::io::{split, DuplexStream};

    struct NoopRunner;

    #[async_trait::async_trait]
    impl CommandRunner for NoopRunner {
        async fn run(&self, _command: &str, _limit: Duration) -> Result<CommandOutput, CommandError> {
            Ok(CommandOutput {
                exit_code: Some(0),
                ..Default::default()
            })
        }
    }

    fn test_service() -> Arc<RemoteService> {
        RemoteService::new(&Config::default(), Arc::new(NoopRunner))
    }

    async fn spawn_test_session(
        service: Arc<RemoteService>,
    ) -> (DuplexStream, tokio::task::JoinHandle<io::Result<()>>) {
        let (server_side, client_side) = tokio::io::duplex(64 * 1024);
        let (mut server_reader, mut server_writer) = split(server_side);
        let task = tokio::spawn(async move {
            handle_session_io(&mut server_reader, &mut server_writer, service).await
        });
        // let the session subscribe before the test emits anything
        tokio::task::yield_now().await;
        (client_side, task)
    }

    async fn read_event(client: &mut DuplexStream) -> Envelope<Value> {
        tokio::time::timeout(Duration::from_secs(1), read_frame(client))
            .await
            .unwrap()
            .unwrap()
    }

    #[test]
    fn msgpack_envelope_roundtrips() {
        let env = Notification::ShowAlert(AlertPayload {
            kind: "alert".to_string(),
            title: "Note".to_string(),
            message: "Attention!".to_string(),
            timer: 4000,
        })
        .to_envelope()
        .unwrap();
        let bytes = rmp_serde::to_vec_named(&env).unwrap();
        let decoded: Envelope<AlertPayload> = rmp_serde::from_slice(&bytes).unwrap();
        assert_eq!(decoded.v, BUS_PROTOCOL_VERSION);
        assert_eq!(decoded.message_type, "SHOW_ALERT");
        assert_eq!(decoded.payload.timer, 4000);
        assert_eq!(decoded.payload.kind, "alert");
    }

    #[test]
    fn visibility_payload_omits_absent_fields() {
        let payload = Notification::Show(VisibilityPayload {
            module: Some("module_1_clock".to_string()),
            use_lock_strings: None,
            force: None,
        })
        .payload()
        .unwrap();
        assert_eq!(payload, serde_json::json!({"module": "module_1_clock"}));
    }

    #[test]
    fn remote_action_payload_is_stringified() {
        let env = make_envelope(
            "REMOTE_ACTION",
            serde_json::json!({"action": "SHOW_ALERT", "timer": 10, "force": true, "title": null}),
        );
        let Some(Inbound::RemoteAction(query)) = Inbound::from_envelope(&env).unwrap() else {
            panic!("expected remote action");
        };
        assert_eq!(query.get("action").map(String::as_str), Some("SHOW_ALERT"));
        assert_eq!(query.get("timer").map(String::as_str), Some("10"));
        assert_eq!(query.get("force").map(String::as_str), Some("true"));
        assert!(!query.contains_key("title"));
    }

    #[test]
    fn unknown_inbound_type_is_ignored() {
        let env = make_envelope("SOMETHING_ELSE", Value::Null);
        assert!(Inbound::from_envelope(&env).unwrap().is_none());
    }

    #[tokio::test]
    async fn read_frame_rejects_oversized_length() {
        let (mut a, mut b) = tokio::io::duplex(1024);
        a.write_u32_le((MAX_FRAME_SIZE + 1) as u32).await.unwrap();
        let err = read_frame(&mut b).await.unwrap_err();
        assert!(matches!(err, FrameError::TooLarge(len) if len == MAX_FRAME_SIZE + 1));
        assert_eq!(io::Error::from(err).kind(), io::ErrorKind::InvalidData);
    }

    #[tokio::test]
    async fn session_applies_current_status() {
        let service = test_service();
        let (mut client, task) = spawn_test_session(service.clone()).await;

        let snapshot = ConfigSnapshot {
            brightness: Some(serde_json::json!(70)),
            module_data: Some(vec![ModuleDescriptor {
                identifier: "module_1_clock".to_string(),
                name: "clock".to_string(),
                ..Default::default()
            }]),
            ..Default::default()
        };
        let env = make_envelope("CURRENT_STATUS", serde_json::to_value(&snapshot).unwrap());
        write_frame(&mut client, &env).await.unwrap();

        let deadline = tokio::time::Instant::now() + Duration::from_secs(1);
        while service.snapshot() != snapshot {
            assert!(tokio::time::Instant::now() < deadline, "snapshot not applied");
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        drop(client);
        let _ = task.await;
    }

    #[tokio::test]
    async fn session_forwards_outbound_notifications() {
        let service = test_service();
        let (mut client, task) = spawn_test_session(service.clone()).await;

        service.notify(Notification::Refresh);
        let evt = read_event(&mut client).await;
        assert_eq!(evt.message_type, "REFRESH");
        assert_eq!(evt.payload, Value::Null);

        drop(client);
        let _ = task.await;
    }

    #[tokio::test]
    async fn session_answers_lang_with_ip_addresses() {
        let service = test_service();
        let (mut client, task) = spawn_test_session(service.clone()).await;

        let env = make_envelope("LANG", "de");
        write_frame(&mut client, &env).await.unwrap();

        let evt = read_event(&mut client).await;
        assert_eq!(evt.message_type, "IP_ADDRESSES");
        assert!(evt.payload.is_array());

        drop(client);
        let _ = task.await;
    }

    #[tokio::test]
    async fn session_ends_on_oversized_frame() {
        let service = test_service();
        let (mut client, task) = spawn_test_session(service).await;

        client.write_u32_le((MAX_FRAME_SIZE + 1) as u32).await.unwrap();
        client.flush().await.unwrap();

        let result = tokio::time::timeout(Duration::from_secs(1), task)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(result.unwrap_err().kind(), io::ErrorKind::InvalidData);
    }

    #[tokio::test]
    async fn session_accepts_loosely_shaped_status() {
        let service = test_service();
        let (mut client, task) = spawn_test_session(service.clone()).await;

        let raw = serde_json::json!({
            "brightness": 42.5,
            "moduleData": [{"identifier": "module_4_weather", "position": null, "urlPath": "weather"}]
        });
        write_frame(&mut client, &make_envelope("CURRENT_STATUS", raw.clone()))
            .await
            .unwrap();

        let deadline = tokio::time::Instant::now() + Duration::from_secs(1);
        while service.snapshot().find_module("module_4_weather").is_none() {
            assert!(tokio::time::Instant::now() < deadline, "snapshot not applied");
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        let snapshot = service.snapshot();
        assert_eq!(snapshot.brightness, Some(serde_json::json!(42.5)));
        assert_eq!(
            snapshot.module_data.unwrap()[0].extra.get("urlPath"),
            Some(&serde_json::json!("weather"))
        );

        drop(client);
        let _ = task.await;
    }

    #[tokio::test]
    async fn session_skips_garbage_frames() {
        let service = test_service();
        let (mut client, task) = spawn_test_session(service.clone()).await;

        client.write_u32_le(3).await.unwrap();
        client.write_all(&[0xc1, 0xc1, 0xc1]).await.unwrap();
        client.flush().await.unwrap();

        let env = make_envelope("LANG", "en");
        write_frame(&mut client, &env).await.unwrap();
        let evt = read_event(&mut client).await;
        assert_eq!(evt.message_type, "IP_ADDRESSES");

        drop(client);
        let _ = task.await;
    }
}

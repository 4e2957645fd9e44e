//! Stand-in for the mirror host: connects to the bus, answers `UPDATE`
//! with `CURRENT_STATUS` and applies visibility/brightness changes to its
//! own copy of the snapshot.
//!
//! Usage: `bus_dev_client [--addr 127.0.0.1:7071] [--snapshot file.json]
//! [--lang en] [--action REFRESH]`

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use uuid::Uuid;

const BUS_PROTOCOL_VERSION: u8 = 1;
const MAX_FRAME_SIZE: usize = 64 * 1024;
const DEFAULT_ADDR: &str = "127.0.0.1:7071";

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Envelope<T> {
    v: u8,
    id: String,
    ts_unix_ms: u64,
    #[serde(rename = "type")]
    message_type: String,
    payload: T,
}

fn now_unix_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

fn make_envelope(message_type: &str, payload: Value) -> Envelope<Value> {
    Envelope {
        v: BUS_PROTOCOL_VERSION,
        id: Uuid::new_v4().to_string(),
        ts_unix_ms: now_unix_ms(),
        message_type: message_type.to_string(),
        payload,
    }
}

async fn read_frame<R>(reader: &mut R) -> std::io::Result<Envelope<Value>>
where
    R: AsyncRead + Unpin,
{
    let len = reader.read_u32_le().await? as usize;
    if len > MAX_FRAME_SIZE {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            format!("frame too large: {len}"),
        ));
    }
    let mut buf = vec![0u8; len];
    reader.read_exact(&mut buf).await?;
    rmp_serde::from_slice(&buf)
        .map_err(|err| std::io::Error::new(std::io::ErrorKind::InvalidData, err.to_string()))
}

async fn write_frame<W>(writer: &mut W, msg: &Envelope<Value>) -> std::io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    let buf = rmp_serde::to_vec_named(msg)
        .map_err(|err| std::io::Error::new(std::io::ErrorKind::InvalidData, err.to_string()))?;
    if buf.len() > MAX_FRAME_SIZE {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            format!("encoded frame too large: {}", buf.len()),
        ));
    }
    writer.write_u32_le(buf.len() as u32).await?;
    writer.write_all(&buf).await?;
    writer.flush().await
}

fn arg_value(name: &str) -> Option<String> {
    let mut args = std::env::args();
    while let Some(arg) = args.next() {
        if arg == name {
            return args.next();
        }
    }
    None
}

fn sample_snapshot() -> Value {
    json!({
        "brightness": 100,
        "moduleData": [
            {
                "identifier": "module_0_alert",
                "name": "alert",
                "path": "modules/default/alert",
                "hidden": false,
                "lockStrings": []
            },
            {
                "identifier": "module_1_clock",
                "name": "clock",
                "path": "modules/default/clock",
                "position": "top_left",
                "hidden": false,
                "lockStrings": []
            },
            {
                "identifier": "module_2_MMM-Calendar",
                "name": "MMM-Calendar",
                "path": "modules/MMM-Calendar",
                "position": "top_right",
                "hidden": true,
                "lockStrings": ["module_5_pir"]
            }
        ]
    })
}

fn load_snapshot() -> Result<Value, Box<dyn std::error::Error>> {
    match arg_value("--snapshot") {
        Some(path) => Ok(serde_json::from_str(&std::fs::read_to_string(path)?)?),
        None => Ok(sample_snapshot()),
    }
}

fn set_hidden(snapshot: &mut Value, payload: &Value, hidden: bool) {
    let Some(modules) = snapshot
        .get_mut("moduleData")
        .and_then(Value::as_array_mut)
    else {
        return;
    };
    let target = payload.get("module").and_then(Value::as_str);
    for module in modules.iter_mut() {
        let matches = match target {
            Some("all") | None => true,
            Some(id) => module.get("identifier").and_then(Value::as_str) == Some(id),
        };
        if matches {
            module["hidden"] = Value::Bool(hidden);
        }
    }
}

async fn run() -> Result<(), Box<dyn std::error::Error>> {
    let addr = arg_value("--addr").unwrap_or_else(|| DEFAULT_ADDR.to_string());
    let lang = arg_value("--lang").unwrap_or_else(|| "en".to_string());
    let mut snapshot = load_snapshot()?;

    println!("bus-dev-client: connecting to {addr}");
    let stream = loop {
        match TcpStream::connect(&addr).await {
            Ok(stream) => break stream,
            Err(_) => tokio::time::sleep(Duration::from_millis(250)).await,
        }
    };
    println!("bus-dev-client: connected");

    let (mut reader, mut writer) = stream.into_split();
    let (out_tx, mut out_rx) = mpsc::unbounded_channel::<Envelope<Value>>();

    tokio::spawn(async move {
        while let Some(msg) = out_rx.recv().await {
            if write_frame(&mut writer, &msg).await.is_err() {
                break;
            }
        }
    });

    out_tx.send(make_envelope("LANG", Value::String(lang.clone())))?;
    println!("-> LANG {lang}");
    out_tx.send(make_envelope("REQUEST_DEFAULT_SETTINGS", Value::Null))?;
    println!("-> REQUEST_DEFAULT_SETTINGS");

    if let Some(action) = arg_value("--action") {
        out_tx.send(make_envelope("REMOTE_ACTION", json!({ "action": action })))?;
        println!("-> REMOTE_ACTION {action}");
    }

    loop {
        let msg = read_frame(&mut reader).await?;
        println!(
            "<- {} {}",
            msg.message_type,
            serde_json::to_string(&msg.payload)?
        );

        match msg.message_type.as_str() {
            "UPDATE" => {
                out_tx.send(make_envelope("CURRENT_STATUS", snapshot.clone()))?;
                println!("-> CURRENT_STATUS");
            }
            "SHOW" => set_hidden(&mut snapshot, &msg.payload, false),
            "HIDE" => set_hidden(&mut snapshot, &msg.payload, true),
            "BRIGHTNESS" => {
                if let Some(value) = msg.payload.as_str().and_then(|v| v.parse::<i64>().ok()) {
                    snapshot["brightness"] = json!(value);
                }
            }
            _ => {}
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    run().await
}

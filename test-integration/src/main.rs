//! Exercice de bout en bout de la gateway SmartSensor contre un broker réel.
//!
//! Prérequis : un broker MQTT sur localhost:1883 et la gateway démarrée
//! (HTTP sur localhost:8080, token admin "admin-token" configuré).
//!
//! Scénario joué :
//! 1. abonnement WebSocket au stream avec un filtre pression/température
//! 2. publication MQTT d'une frame TPMS nominale puis d'une frame sous seuil
//! 3. vérification de la réception temps réel côté WebSocket
//! 4. vérification du device et des alertes via l'API admin

use anyhow::{bail, Context, Result};
use futures_util::{SinkExt, StreamExt};
use log::{error, info};
use rumqttc::{AsyncClient, MqttOptions, QoS};
use serde_json::{json, Value};
use tokio::time::{sleep, timeout, Duration};
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::Message;

const MQTT_BROKER: &str = "127.0.0.1";
const MQTT_PORT: u16 = 1883;
const GATEWAY_HTTP: &str = "http://127.0.0.1:8080";
const GATEWAY_WS: &str = "ws://127.0.0.1:8080/v1/stream";
const ADMIN_TOKEN: &str = "admin-token";
const DEVICE_ID: &str = "HK_000001";

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::init();
    info!("starting gateway end-to-end exercise");

    // 1. WebSocket : abonnement au stream avant d'injecter des frames
    let mut req = GATEWAY_WS.into_client_request()?;
    req.headers_mut()
        .insert("Authorization", format!("Bearer {}", ADMIN_TOKEN).parse()?);
    req.headers_mut()
        .insert("Sec-WebSocket-Protocol", "smartsensor.v1".parse()?);
    let (mut ws, _) = tokio_tungstenite::connect_async(req)
        .await
        .context("cannot open websocket to gateway")?;

    ws.send(Message::Text(
        json!({
            "type": "subscribe",
            "filter": {"devices": ["*"], "kinds": ["pressure", "temperature"]}
        })
        .to_string(),
    ))
    .await?;

    let subscribed = expect_ws_message(&mut ws, "subscribed").await?;
    info!("subscribed to stream: {}", subscribed);

    // 2. MQTT : publication de frames device
    let mut mqttoptions = MqttOptions::new("test-integration-client", MQTT_BROKER, MQTT_PORT);
    mqttoptions.set_keep_alive(Duration::from_secs(30));
    let (client, mut eventloop) = AsyncClient::new(mqttoptions, 10);
    tokio::spawn(async move {
        loop {
            if let Err(e) = eventloop.poll().await {
                error!("mqtt event loop error: {}", e);
                sleep(Duration::from_secs(1)).await;
            }
        }
    });

    let topic = format!("smartsensor/devices/{}/data", DEVICE_ID);
    let nominal = json!({
        "device_id": DEVICE_ID,
        "timestamp": now_rfc3339(),
        "sensors": {"tires": [{"position": "FL", "pressure_kpa": 220.0, "temperature_c": 35.0}]}
    });
    client
        .publish(&topic, QoS::AtLeastOnce, false, nominal.to_string())
        .await?;
    info!("published nominal tpms frame");

    // 3. la frame doit arriver sur le stream
    let reading = expect_ws_message(&mut ws, "reading").await?;
    if reading["device_id"] != DEVICE_ID || reading["sensor_kind"] != "pressure" {
        bail!("unexpected first reading: {}", reading);
    }
    info!("websocket received the pressure reading");

    // frame sous le seuil TPMS : doit ouvrir une alerte si la règle
    // tpms_low (threshold_below pressure 200) est chargée
    let low = json!({
        "device_id": DEVICE_ID,
        "timestamp": now_rfc3339(),
        "sensors": {"tires": [{"position": "FL", "pressure_kpa": 180.0, "temperature_c": 36.0}]}
    });
    client.publish(&topic, QoS::AtLeastOnce, false, low.to_string()).await?;
    info!("published low-pressure tpms frame");
    let _ = expect_ws_message(&mut ws, "reading").await?;

    // 4. API admin : device enregistré et alerte ouverte
    let http = reqwest::Client::new();
    let device: Value = http
        .get(format!("{}/v1/devices/{}", GATEWAY_HTTP, DEVICE_ID))
        .bearer_auth(ADMIN_TOKEN)
        .send()
        .await?
        .error_for_status()
        .context("device not visible in registry")?
        .json()
        .await?;
    info!("registry knows the device (health {})", device["health_score"]);

    sleep(Duration::from_secs(2)).await;
    let alerts: Vec<Value> = http
        .get(format!("{}/v1/alerts", GATEWAY_HTTP))
        .bearer_auth(ADMIN_TOKEN)
        .send()
        .await?
        .error_for_status()?
        .json()
        .await?;
    match alerts.iter().find(|a| a["device_id"] == DEVICE_ID) {
        Some(a) => info!("alert open as expected: {} ({})", a["rule_id"], a["severity"]),
        None => info!("no alert open (tpms_low rule not configured on this gateway)"),
    }

    let metrics = http
        .get(format!("{}/metrics", GATEWAY_HTTP))
        .send()
        .await?
        .error_for_status()?
        .text()
        .await?;
    if !metrics.contains("ingest_frames_total{source=\"mqtt\"}") {
        bail!("metrics endpoint is missing ingest counters");
    }

    info!("end-to-end exercise passed");
    Ok(())
}

/// Attend le prochain message WebSocket du type attendu (ignore les pings,
/// y répond pour garder la session vivante)
async fn expect_ws_message(
    ws: &mut (impl futures_util::Stream<
        Item = std::result::Result<Message, tokio_tungstenite::tungstenite::Error>,
    > + futures_util::Sink<Message, Error = tokio_tungstenite::tungstenite::Error>
          + Unpin),
    wanted: &str,
) -> Result<Value> {
    let deadline = Duration::from_secs(10);
    loop {
        let msg = timeout(deadline, ws.next())
            .await
            .context("timeout waiting for websocket message")?
            .context("websocket closed")??;
        if let Message::Text(text) = msg {
            let v: Value = serde_json::from_str(&text)?;
            match v["type"].as_str() {
                Some(t) if t == wanted => return Ok(v),
                Some("ping") => {
                    ws.send(Message::Text(json!({"type": "pong"}).to_string())).await?;
                }
                _ => {}
            }
        }
    }
}

fn now_rfc3339() -> String {
    chrono::Utc::now().to_rfc3339()
}

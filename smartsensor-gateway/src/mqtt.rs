/**
 * INGEST MQTT - Consommateur du broker amont (la gateway est un client)
 *
 * RÔLE :
 * Session durable vers le broker, abonnement à `<root>/devices/+/data`,
 * décodage (codec), authentification (registre) et remise au pipeline.
 *
 * FONCTIONNEMENT :
 * - QoS >= 1 avec acquittement MANUEL : on n'acke le broker qu'une fois la
 *   frame acceptée par le pipeline (donc par le WAB). Pipeline saturé =>
 *   les acks s'arrêtent, le broker retient les messages : c'est la
 *   backpressure voulue, on ne jette jamais côté gateway
 * - Déconnexion : backoff exponentiel plafonné à 60s, failover round-robin
 *   sur la liste de brokers, réabonnement à chaque ConnAck
 * - Les messages malformés / refusés sont ackés puis jetés (les re-livrer
 *   ne les rendrait pas meilleurs), compteur + log échantillonné
 */

use crate::admission::Admission;
use crate::codec;
use crate::config::MqttConf;
use crate::health::{parse_endpoint, HealthTracker};
use crate::metrics::GatewayMetrics;
use crate::pipeline::{Pipeline, WorkItem};
use crate::registry::{Resolution, SharedRegistry};
use rumqttc::{AsyncClient, Event, Incoming, MqttOptions, Publish, QoS};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;
use time::OffsetDateTime;
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

const BACKOFF_MIN: Duration = Duration::from_millis(100);
const BACKOFF_MAX: Duration = Duration::from_secs(60);

/// Extrait le device_id du topic `<root>/devices/<id>/data`
fn device_id_from_topic(topic: &str) -> Option<&str> {
    let mut parts = topic.split('/');
    let _root = parts.next()?;
    if parts.next()? != "devices" {
        return None;
    }
    let id = parts.next()?;
    if parts.next()? != "data" || parts.next().is_some() {
        return None;
    }
    Some(id)
}

fn qos_of(level: u8) -> QoS {
    match level {
        0 => QoS::AtMostOnce,
        1 => QoS::AtLeastOnce,
        _ => QoS::ExactlyOnce,
    }
}

pub fn spawn_mqtt_ingest(
    conf: MqttConf,
    registry: SharedRegistry,
    pipeline: Arc<Pipeline>,
    admission: Arc<Admission>,
    health: HealthTracker,
    metrics: Arc<GatewayMetrics>,
    shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(ingest_loop(conf, registry, pipeline, admission, health, metrics, shutdown))
}

async fn ingest_loop(
    conf: MqttConf,
    registry: SharedRegistry,
    pipeline: Arc<Pipeline>,
    admission: Arc<Admission>,
    health: HealthTracker,
    metrics: Arc<GatewayMetrics>,
    mut shutdown: watch::Receiver<bool>,
) {
    if conf.disabled {
        info!("[mqtt] ingest disabled by configuration");
        return;
    }

    let topic = format!("{}/devices/+/data", conf.topic_root);
    let mut broker_idx = 0usize;
    let mut backoff = BACKOFF_MIN;

    'outer: loop {
        if *shutdown.borrow() {
            break;
        }

        let endpoint = conf.brokers[broker_idx % conf.brokers.len()].clone();
        broker_idx += 1;
        let Some((host, port)) = parse_endpoint(Some(&endpoint)) else {
            warn!("[mqtt] bad broker endpoint '{}', skipping", endpoint);
            continue;
        };

        info!("[mqtt] connecting to {}:{} (topic: {})", host, port, topic);
        let mut opts = MqttOptions::new(conf.client_id.clone(), host, port);
        opts.set_keep_alive(Duration::from_secs(conf.keepalive_secs));
        // session durable : le broker garde l'état d'abonnement et les
        // messages QoS1 non ackés entre deux connexions
        opts.set_clean_session(false);
        opts.set_manual_acks(true);
        if let (Some(user), Some(pass)) = (&conf.username, &conf.password) {
            opts.set_credentials(user.clone(), pass.clone());
        }

        let (client, mut eventloop) = AsyncClient::new(opts, 64);

        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        info!("[mqtt] shutdown, disconnecting");
                        let _ = client.disconnect().await;
                        break 'outer;
                    }
                }
                event = eventloop.poll() => match event {
                    Ok(Event::Incoming(Incoming::ConnAck(_))) => {
                        health.mark_mqtt_connected();
                        backoff = BACKOFF_MIN;
                        match client.subscribe(&topic, qos_of(conf.qos)).await {
                            Ok(()) => info!("[mqtt] subscribed to {} (qos {})", topic, conf.qos),
                            Err(e) => warn!("[mqtt] subscribe failed: {:?}", e),
                        }
                    }
                    Ok(Event::Incoming(Incoming::Publish(publish))) => {
                        handle_publish(
                            publish,
                            &client,
                            &registry,
                            &pipeline,
                            &admission,
                            &metrics,
                        )
                        .await;
                    }
                    Ok(_) => {}
                    Err(e) => {
                        warn!("[mqtt] connection error: {:?}, retrying in {:?}", e, backoff);
                        health.increment_reconnects();
                        tokio::time::sleep(backoff).await;
                        backoff = (backoff * 2).min(BACKOFF_MAX);
                        // failover : prochain broker de la liste
                        continue 'outer;
                    }
                }
            }
        }
    }

    health.mark_mqtt_disconnected();
    info!("[mqtt] ingest stopped");
}

/// Traite un message entrant. L'ack broker est différé : il part quand le
/// pipeline a signalé l'acceptation de la frame (WAB inclus).
async fn handle_publish(
    publish: Publish,
    client: &AsyncClient,
    registry: &SharedRegistry,
    pipeline: &Pipeline,
    admission: &Admission,
    metrics: &Arc<GatewayMetrics>,
) {
    metrics.ingest_frames_mqtt.fetch_add(1, Ordering::Relaxed);

    let topic_device = device_id_from_topic(&publish.topic).map(str::to_string);

    // admission : un capteur qui flood est jeté (acké pour ne pas être
    // re-livré en boucle par le broker)
    if let Some(id) = &topic_device {
        if !admission.admit_device(id) {
            metrics.ingest_rejected_rate.fetch_add(1, Ordering::Relaxed);
            let _ = client.ack(&publish).await;
            return;
        }
    }

    let mut frame = match codec::decode_frame(&publish.payload, OffsetDateTime::now_utc()) {
        Ok(f) => f,
        Err(e) => {
            metrics.ingest_rejected_decode.fetch_add(1, Ordering::Relaxed);
            debug!("[mqtt] undecodable frame on {}: {}", publish.topic, e);
            let _ = client.ack(&publish).await;
            return;
        }
    };

    // le device_id du payload fait foi mais doit être cohérent avec le topic
    if let Some(id) = &topic_device {
        if *id != frame.device_id {
            metrics.ingest_rejected_decode.fetch_add(1, Ordering::Relaxed);
            debug!(
                "[mqtt] device_id mismatch: topic says {}, payload says {}",
                id, frame.device_id
            );
            let _ = client.ack(&publish).await;
            return;
        }
    }

    match registry.resolve(&frame.device_id, None) {
        Resolution::Known(view) => {
            if view.quarantined {
                codec::downgrade_quarantined(&mut frame.readings);
            }
        }
        Resolution::Unknown | Resolution::AuthFailed => {
            metrics.ingest_rejected_auth.fetch_add(1, Ordering::Relaxed);
            let _ = client.ack(&publish).await;
            return;
        }
    }

    let (done_tx, done_rx) = oneshot::channel();
    // enqueue bloque si le shard est plein : la boucle d'événements stoppe,
    // les acks cessent, le broker retient => backpressure de bout en bout
    if pipeline.enqueue(WorkItem { frame, done: Some(done_tx) }).await.is_err() {
        // pipeline fermé (shutdown) : on n'acke pas, le broker re-livrera
        return;
    }

    let ack_client = client.clone();
    tokio::spawn(async move {
        if done_rx.await.is_ok() {
            let _ = ack_client.ack(&publish).await;
        }
        // done abandonné = arrêt avant acceptation : pas d'ack, le broker
        // re-livrera à la prochaine session (at-least-once)
    });
}

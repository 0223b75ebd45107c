/// MQTT transport over the ESP-IDF client
///
/// Broker events are forwarded to the shared connection register from the
/// client's event callback. `connect` blocks until the broker acknowledged or
/// the timeout elapsed.
use std::sync::Arc;

use esp_idf_hal::delay::FreeRtos;
use esp_idf_svc::mqtt::client::{
    EspMqttClient, EventPayload, LwtConfiguration, MqttClientConfiguration, QoS as EspQoS,
};
use esp_idf_svc::tls::X509;
use log::{debug, info, warn};
use pressure_telemetry::session::{ConnectOptions, LinkEvent, QoS, TransportError};
use pressure_telemetry::{BrokerTransport, ConnectionRegister, ConnectionState};

const CONNECT_TIMEOUT_MS: u32 = 5000;
const POLL_INTERVAL_MS: u32 = 100;

pub struct EspMqttTransport {
    client: Option<EspMqttClient<'static>>,
    /// Nul-terminated PEM handed to the client, which keeps the pointer
    certificate: Option<&'static [u8]>,
}

impl EspMqttTransport {
    pub fn new() -> Self {
        Self {
            client: None,
            certificate: None,
        }
    }

    /// The ESP-IDF client keeps a pointer to the CA buffer for its whole
    /// lifetime, so the buffer is leaked once and reused until the PEM changes
    fn certificate(&mut self, pem: &str) -> &'static [u8] {
        let unchanged = self
            .certificate
            .is_some_and(|cached| cached.strip_suffix(&[0]) == Some(pem.as_bytes()));
        if !unchanged {
            let mut bytes = Vec::with_capacity(pem.len() + 1);
            bytes.extend_from_slice(pem.as_bytes());
            bytes.push(0);
            self.certificate = Some(Box::leak(bytes.into_boxed_slice()));
        }
        self.certificate.unwrap_or(&[0])
    }
}

fn esp_qos(qos: QoS) -> EspQoS {
    match qos {
        QoS::AtMostOnce => EspQoS::AtMostOnce,
        QoS::AtLeastOnce => EspQoS::AtLeastOnce,
    }
}

impl BrokerTransport for EspMqttTransport {
    fn connect(
        &mut self,
        options: &ConnectOptions,
        register: &Arc<ConnectionRegister>,
    ) -> Result<(), TransportError> {
        // Stop and release any previous client first
        self.client = None;

        let server_certificate = match options.trust_anchor.as_deref() {
            Some(pem) => Some(X509::pem_until_nul(self.certificate(pem))),
            None => None,
        };

        let mqtt_config = MqttClientConfiguration {
            client_id: options.client_id.as_deref(),
            username: options.username.as_deref(),
            password: options.password.as_deref(),
            keep_alive_interval: Some(core::time::Duration::from_secs(30)),
            // Reconnects are driven by the session
            disable_auto_reconnect: true,
            network_timeout: core::time::Duration::from_millis(CONNECT_TIMEOUT_MS as u64),
            buffer_size: 1024,
            out_buffer_size: 2048,
            lwt: options.last_will.as_ref().map(|will| LwtConfiguration {
                topic: &will.topic,
                payload: will.payload.as_bytes(),
                qos: EspQoS::AtLeastOnce,
                retain: will.retain,
            }),
            server_certificate,
            ..Default::default()
        };

        let events = register.clone();
        let client = EspMqttClient::new_cb(&options.url, &mqtt_config, move |event| {
            match event.payload() {
                EventPayload::Connected(_) => {
                    info!("MQTT: Connected event received");
                    events.apply(LinkEvent::Acknowledged).ok();
                }
                EventPayload::Disconnected => {
                    info!("MQTT: Disconnected event received");
                    events.apply(LinkEvent::Lost).ok();
                }
                EventPayload::Error(e) => {
                    warn!("MQTT: Error event: {:?}", e);
                    events.apply(LinkEvent::ConnectFailed).ok();
                }
                EventPayload::Published(id) => debug!("MQTT: published msg_id={}", id),
                _ => {}
            }
        })
        .map_err(|e| TransportError::Connect(e.to_string()))?;
        self.client = Some(client);

        info!(
            "MQTT client created, waiting for connection (up to {}s)",
            CONNECT_TIMEOUT_MS / 1000
        );

        let mut waited = 0;
        loop {
            match register.current() {
                ConnectionState::Connected => return Ok(()),
                ConnectionState::Failed => {
                    return Err(TransportError::Connect("broker refused connection".into()))
                }
                _ if waited >= CONNECT_TIMEOUT_MS => {
                    info!("MQTT connection timed out after {}ms", waited);
                    return Err(TransportError::Timeout);
                }
                _ => {}
            }
            FreeRtos::delay_ms(POLL_INTERVAL_MS);
            waited += POLL_INTERVAL_MS;
        }
    }

    fn publish(
        &mut self,
        topic: &str,
        payload: &[u8],
        qos: QoS,
        retain: bool,
    ) -> Result<(), TransportError> {
        let client = self.client.as_mut().ok_or(TransportError::NotConnected)?;
        client
            .publish(topic, esp_qos(qos), retain, payload)
            .map(|_| ())
            .map_err(|e| TransportError::Publish(e.to_string()))
    }

    fn disconnect(&mut self) {
        if self.client.take().is_some() {
            info!("MQTT client stopped and released");
        }
    }
}

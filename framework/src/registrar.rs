//! Periodic publication of the discovery documents
//!
//! Runs on its own timer. The registrar never connects by itself: it waits a
//! bounded time for the sampler's session to come up and otherwise skips the
//! round.

use std::sync::{Arc, Mutex, MutexGuard};

use embedded_hal::delay::DelayNs;
use log::{debug, info, warn};

use crate::discovery::{DeviceProfile, DiscoveryDocument, DiscoveryError, ADVERTISED_METRICS};
use crate::session::{BrokerTransport, ConnectionMode, ConnectionRegister, Session, TrustAnchorStore};
use crate::settings::DeviceIdentity;
use crate::topics::{discovery_topic, TopicNamespace};

/// Payload announced on the availability topic
pub const ONLINE: &str = "online";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegistrarConfig {
    /// Connection checks before a round is skipped
    pub ready_checks: u32,
    /// Delay between connection checks (ms)
    pub check_interval_ms: u32,
    /// Period between rounds (ms)
    pub interval_ms: u32,
}

impl Default for RegistrarConfig {
    fn default() -> Self {
        Self {
            ready_checks: 10,
            check_interval_ms: 1000,
            interval_ms: 60_000,
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

pub struct Registrar<D: DelayNs> {
    register: Arc<ConnectionRegister>,
    profile: DeviceProfile,
    config: RegistrarConfig,
    delay: D,
}

impl<D: DelayNs> Registrar<D> {
    pub fn new(
        register: Arc<ConnectionRegister>,
        profile: DeviceProfile,
        config: RegistrarConfig,
        delay: D,
    ) -> Self {
        Self {
            register,
            profile,
            config,
            delay,
        }
    }

    pub fn config(&self) -> &RegistrarConfig {
        &self.config
    }

    /// Update the profile, e.g. after the node obtained a new address
    pub fn set_profile(&mut self, profile: DeviceProfile) {
        self.profile = profile;
    }

    /// Poll the connection state, true once connected
    pub fn wait_connected(&mut self) -> bool {
        for check in 0..self.config.ready_checks {
            if self.register.is_connected() {
                return true;
            }
            debug!(
                "Discovery: waiting for MQTT connection ({}/{})",
                check + 1,
                self.config.ready_checks
            );
            self.delay.delay_ms(self.config.check_interval_ms);
        }
        self.register.is_connected()
    }

    /// One round: every advertised document, then availability
    ///
    /// Returns the number of documents published.
    pub fn publish_discovery<T, A>(
        &mut self,
        session: &Mutex<Session<T, A>>,
        mode: ConnectionMode,
        identity: &DeviceIdentity,
        topics: &TopicNamespace,
        hub_prefix: &str,
    ) -> Result<usize, DiscoveryError>
    where
        T: BrokerTransport,
        A: TrustAnchorStore,
    {
        if mode == ConnectionMode::Disabled {
            debug!("MQTT disabled, discovery skipped");
            return Ok(0);
        }

        if !self.wait_connected() {
            warn!("Discovery: MQTT not connected, retrying next round");
            return Err(DiscoveryError::NotConnected);
        }

        let mut messages = Vec::with_capacity(ADVERTISED_METRICS.len());
        for metric in &ADVERTISED_METRICS {
            let doc = DiscoveryDocument::for_metric(&self.profile, identity, topics, metric)?;
            let topic = discovery_topic(hub_prefix, &identity.device_id, metric.name)?;
            messages.push((topic, doc.to_json()?));
        }

        let availability = topics.availability();
        let attempted = messages.len() + 1;
        let mut published = 0;
        let mut failed = 0;

        for (index, (topic, payload)) in messages.iter().enumerate() {
            match lock(session).publish(mode, topic, payload, true) {
                Ok(()) => {
                    debug!("Discovery published to {}", topic);
                    published += 1;
                }
                Err(e) => {
                    warn!("Discovery for {} failed: {}", topic, e);
                    failed += 1;
                }
            }

            if index == 0 {
                if let Err(e) = lock(session).publish(mode, &availability, ONLINE, true) {
                    warn!("Availability publish to {} failed: {}", availability, e);
                    failed += 1;
                }
            }
        }

        if failed > 0 {
            return Err(DiscoveryError::Publish { failed, attempted });
        }

        info!("Discovery: {} documents published", published);
        Ok(published)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::discovery::tests::{identity, topics};
    use crate::session::tests::{session, MockTransport};
    use crate::session::LinkEvent;

    #[derive(Default)]
    struct CountingDelay {
        calls: u32,
    }

    impl DelayNs for CountingDelay {
        fn delay_ns(&mut self, _ns: u32) {
            self.calls += 1;
        }

        fn delay_ms(&mut self, _ms: u32) {
            self.calls += 1;
        }
    }

    fn registrar(register: Arc<ConnectionRegister>) -> Registrar<CountingDelay> {
        Registrar::new(
            register,
            DeviceProfile::new("192.168.1.50", "v5.2.2"),
            RegistrarConfig::default(),
            CountingDelay::default(),
        )
    }

    fn connected(transport: &MockTransport) -> Mutex<Session<MockTransport>> {
        let mut s = session(transport);
        s.ensure_connected(ConnectionMode::AutoReconnect).unwrap();
        Mutex::new(s)
    }

    #[test]
    fn test_publishes_every_metric_then_online() {
        let transport = MockTransport::default();
        let s = connected(&transport);
        let mut registrar = registrar(lock(&s).register());

        let published = registrar
            .publish_discovery(
                &s,
                ConnectionMode::AutoReconnect,
                &identity(),
                &topics(),
                "homeassistant",
            )
            .unwrap();
        assert_eq!(published, 4);

        let wire = transport.wire.lock().unwrap();
        let sent: Vec<&str> = wire.messages.iter().map(|(t, _, _)| t.as_str()).collect();
        assert_eq!(
            sent,
            [
                "homeassistant/sensor/A1B2C3D4E5F6/pressure/config",
                "pressure_sensor/A1B2C3D4E5F6/status",
                "homeassistant/sensor/A1B2C3D4E5F6/voltage/config",
                "homeassistant/sensor/A1B2C3D4E5F6/voltage_raw/config",
                "homeassistant/sensor/A1B2C3D4E5F6/voltage_offset/config",
            ]
        );
        assert!(wire.messages.iter().all(|(_, _, retain)| *retain));
        assert_eq!(wire.messages[1].1, "online");
        assert_eq!(registrar.delay.calls, 0);
    }

    #[test]
    fn test_not_connected_skips_round_after_bounded_wait() {
        let transport = MockTransport::default();
        let s = Mutex::new(session(&transport));
        let mut registrar = registrar(lock(&s).register());

        let result = registrar.publish_discovery(
            &s,
            ConnectionMode::AutoReconnect,
            &identity(),
            &topics(),
            "homeassistant",
        );
        assert_eq!(result, Err(DiscoveryError::NotConnected));
        assert_eq!(registrar.delay.calls, 10);

        let wire = transport.wire.lock().unwrap();
        assert!(wire.messages.is_empty());
        assert_eq!(wire.connects, 0);
    }

    #[test]
    fn test_disabled_mode_skips_without_waiting() {
        let transport = MockTransport::default();
        let s = Mutex::new(session(&transport));
        let mut registrar = registrar(lock(&s).register());

        assert_eq!(
            registrar.publish_discovery(
                &s,
                ConnectionMode::Disabled,
                &identity(),
                &topics(),
                "homeassistant"
            ),
            Ok(0)
        );
        assert_eq!(registrar.delay.calls, 0);
    }

    #[test]
    fn test_failed_document_does_not_stop_the_round() {
        let transport = MockTransport::default();
        *transport.fail_topic.lock().unwrap() =
            Some("homeassistant/sensor/A1B2C3D4E5F6/voltage/config".into());
        let s = connected(&transport);
        let mut registrar = registrar(lock(&s).register());

        let result = registrar.publish_discovery(
            &s,
            ConnectionMode::AutoReconnect,
            &identity(),
            &topics(),
            "homeassistant",
        );
        assert_eq!(
            result,
            Err(DiscoveryError::Publish {
                failed: 1,
                attempted: 5
            })
        );
        assert_eq!(transport.wire.lock().unwrap().messages.len(), 4);
    }

    #[test]
    fn test_lost_connection_fails_wait() {
        let transport = MockTransport::default();
        let s = connected(&transport);
        let register = lock(&s).register();
        register.apply(LinkEvent::Lost).unwrap();

        let mut registrar = registrar(register);
        assert!(!registrar.wait_connected());
    }

    #[test]
    fn test_invalid_hub_prefix_is_reported() {
        let transport = MockTransport::default();
        let s = connected(&transport);
        let mut registrar = registrar(lock(&s).register());

        assert!(matches!(
            registrar.publish_discovery(
                &s,
                ConnectionMode::AutoReconnect,
                &identity(),
                &topics(),
                "home/#"
            ),
            Err(DiscoveryError::Topic(_))
        ));
        assert!(transport.wire.lock().unwrap().messages.is_empty());
    }
}

// SPDX-License-Identifier: MPL-2.0
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The availability extension: timers, pings and reconnect re-reads.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use rand::Rng;
use wildmatch::WildMatch;

use super::{AvailabilityState, availability_payload};
use crate::entity::{Device, Entity, EntityId, EntityOptions, Group};
use crate::error::{NetworkError, Result};
use crate::event::{
    AvailabilityChanged, BusEvent, DeviceAnnounce, DeviceLeave, EntityOptionsChanged, EntityRemoved,
    EntityRenamed, GroupMembersChanged, LastSeenChanged, Subscriptions,
};
use crate::extension::{Extension, ExtensionContext};
use crate::queue::OperationQueue;
use crate::timer::TimerMap;
use crate::transport::PublishOptions;

/// Attributes re-read after a device reconnects, one network call per set.
const RECONNECT_READ_SETS: &[&[&str]] = &[&["state"], &["brightness"], &["color", "color_temp"]];

/// Pause between the network calls of one re-read.
const READ_SPACING: Duration = Duration::from_millis(500);

const PING: &str = "ping";
const READ: &str = "read";

struct Shared {
    context: ExtensionContext,
    states: Mutex<HashMap<EntityId, AvailabilityState>>,
    timers: TimerMap<String>,
    read_timers: TimerMap<String>,
    queue: OperationQueue<String>,
    subscriptions: Mutex<Option<Subscriptions>>,
    stopped: AtomicBool,
}

/// Tracks and publishes whether entities are reachable.
///
/// Every tracked device has at most one live timer. For active devices the
/// timer queues a ping on the bounded ping queue; for passive devices it marks
/// the device offline. Any traffic from a device (`LastSeenChanged`) resets
/// its timer and marks it online; a device coming back from offline has its
/// basic state read again once its announce burst has settled.
pub struct Availability {
    shared: Arc<Shared>,
}

impl Availability {
    /// Creates the extension. Nothing is tracked before [`start`](Extension::start).
    #[must_use]
    pub fn new(context: ExtensionContext) -> Self {
        let concurrency = context.settings.availability.ping_concurrency;
        Self {
            shared: Arc::new(Shared {
                context,
                states: Mutex::new(HashMap::new()),
                timers: TimerMap::new(),
                read_timers: TimerMap::new(),
                queue: OperationQueue::new(concurrency),
                subscriptions: Mutex::new(None),
                stopped: AtomicBool::new(false),
            }),
        }
    }

    /// Returns the current availability of an entity.
    #[must_use]
    pub fn state_of(&self, id: &EntityId) -> AvailabilityState {
        self.shared.state_of(id)
    }

    /// Returns `true` if the entity is tracked under the current settings.
    #[must_use]
    pub fn is_tracked(&self, entity: &Entity) -> bool {
        self.shared.is_in_scope(entity)
    }
}

#[async_trait]
impl Extension for Availability {
    fn name(&self) -> &str {
        "availability"
    }

    async fn start(&self) -> Result<()> {
        let shared = &self.shared;
        let subscriptions = Subscriptions::new(&shared.context.bus, self.name());
        subscribe(&subscriptions, shared, Shared::on_last_seen);
        subscribe(&subscriptions, shared, |s, e: &DeviceAnnounce| s.schedule_reconnect_read(&e.device));
        subscribe(&subscriptions, shared, Shared::on_renamed);
        subscribe(&subscriptions, shared, |s, e: &DeviceLeave| {
            s.forget(&EntityId::device(e.address.clone()), e.name.as_deref());
        });
        subscribe(&subscriptions, shared, |s, e: &EntityRemoved| s.forget(&e.id, Some(&e.name)));
        subscribe(&subscriptions, shared, Shared::on_options_changed);
        subscribe(&subscriptions, shared, |s, e: &GroupMembersChanged| s.update_group(&e.group, false));
        *shared.subscriptions.lock() = Some(subscriptions);

        let timeout_check = Utc::now();
        for device in shared.context.registry.devices() {
            if !shared.is_device_in_scope(&device) {
                continue;
            }
            let timeout = shared.timeout_for(&device);
            let online = device.last_seen.is_none_or(|seen| {
                timeout_check
                    .signed_duration_since(seen)
                    .to_std()
                    .map_or(true, |age| age < timeout)
            });

            shared.reset_timer(&device);
            shared.set_state(&Entity::from(device.clone()), AvailabilityState::from_online(online), true, false);
            if device.is_actively_pollable() && !online {
                shared.queue_ping(&device.address);
            }
        }
        for group in shared.context.registry.groups() {
            shared.update_group(&group, true);
        }

        tracing::info!(
            tracked = shared.states.lock().len(),
            "Availability tracking started"
        );
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        let shared = &self.shared;
        if shared.stopped.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        if let Some(subscriptions) = shared.subscriptions.lock().take() {
            subscriptions.dispose();
        }
        shared.timers.close();
        shared.read_timers.close();
        shared.queue.stop();
        tracing::debug!("Availability tracking stopped");
        Ok(())
    }
}

impl std::fmt::Debug for Availability {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Availability")
            .field("tracked", &self.shared.states.lock().len())
            .field("timers", &self.shared.timers.len())
            .field("queue", &self.shared.queue)
            .field("stopped", &self.shared.stopped.load(Ordering::Acquire))
            .finish()
    }
}

/// Registers `handler` with a weak reference to the shared state.
fn subscribe<E, F>(subscriptions: &Subscriptions, shared: &Arc<Shared>, handler: F)
where
    E: BusEvent,
    F: Fn(&Arc<Shared>, &E) + Send + Sync + 'static,
{
    let weak = Arc::downgrade(shared);
    subscriptions.on(move |event: &E| {
        if let Some(shared) = Weak::upgrade(&weak)
            && !shared.is_stopped()
        {
            handler(&shared, event);
        }
        Ok(())
    });
}

fn jitter(timeout: Duration, fraction: f64) -> Duration {
    if fraction.is_nan() || fraction <= 0.0 || timeout.is_zero() {
        return Duration::ZERO;
    }
    let factor: f64 = rand::thread_rng().gen_range(0.0..=fraction.min(1.0));
    Duration::try_from_secs_f64(timeout.as_secs_f64() * factor).unwrap_or(timeout)
}

impl Shared {
    fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::Acquire)
    }

    fn state_of(&self, id: &EntityId) -> AvailabilityState {
        self.states.lock().get(id).copied().unwrap_or_default()
    }

    fn is_in_scope(&self, entity: &Entity) -> bool {
        match entity {
            Entity::Device(device) => self.is_device_in_scope(device),
            Entity::Group(group) => self.matches_scope(&group.friendly_name, &entity.id(), &group.options),
        }
    }

    fn is_device_in_scope(&self, device: &Device) -> bool {
        !device.is_coordinator() && self.matches_scope(&device.friendly_name, &device.id(), &device.options)
    }

    fn matches_scope(&self, name: &str, id: &EntityId, options: &EntityOptions) -> bool {
        if options.disabled {
            return false;
        }
        if let Some(availability) = options.availability {
            return availability.is_enabled();
        }

        let settings = &self.context.settings.availability;
        if !settings.enabled {
            return false;
        }
        let id = id.to_string();
        let listed = |patterns: &[String]| {
            patterns
                .iter()
                .any(|pattern| *pattern == id || WildMatch::new(pattern).matches(name))
        };
        if settings.include.is_empty() {
            !listed(&settings.exclude)
        } else {
            listed(&settings.include)
        }
    }

    fn timeout_for(&self, device: &Device) -> Duration {
        if let Some(timeout) = device.options.availability.and_then(|a| a.timeout()) {
            return timeout;
        }
        let settings = &self.context.settings.availability;
        if device.is_actively_pollable() {
            settings.active_timeout()
        } else {
            settings.passive_timeout()
        }
    }

    /// Cancels the device timer and starts a fresh one.
    fn reset_timer(self: &Arc<Self>, device: &Device) {
        if self.is_stopped() {
            return;
        }
        let timeout = self.timeout_for(device);
        let address = device.address.clone();
        let weak = Arc::downgrade(self);

        if device.is_actively_pollable() {
            let jitter = jitter(timeout, self.context.settings.availability.jitter_fraction);
            let delay = timeout.saturating_add(jitter);
            let target = address.clone();
            self.timers.schedule(address, delay, move || {
                if let Some(shared) = Weak::upgrade(&weak) {
                    shared.queue_ping(&target);
                }
            });
        } else {
            let target = address.clone();
            self.timers.schedule(address, timeout, move || {
                if let Some(shared) = Weak::upgrade(&weak) {
                    shared.on_passive_timeout(&target);
                }
            });
        }
    }

    fn on_passive_timeout(self: &Arc<Self>, address: &str) {
        if self.is_stopped() {
            return;
        }
        if let Some(device) = self.context.registry.device(address)
            && self.is_device_in_scope(&device)
        {
            tracing::debug!(entity = %device.friendly_name, "Passive device timed out");
            self.set_state(&Entity::from(device), AvailabilityState::Offline, false, true);
        }
    }

    fn queue_ping(self: &Arc<Self>, address: &str) {
        if self.is_stopped() {
            return;
        }
        let Some(device) = self.context.registry.device(address) else {
            return;
        };
        let was_online = self.state_of(&device.id()).is_online();
        let attempts = if was_online { 2 } else { 1 };
        let settings = &self.context.settings.availability;
        let ping_timeout = settings.ping_timeout();
        let retry_delay = settings.ping_retry_delay();
        let network = Arc::clone(&self.context.network);
        let target = address.to_string();

        let work = async move {
            let mut outcome = Ok(());
            for attempt in 0..attempts {
                if attempt > 0 {
                    tokio::time::sleep(retry_delay).await;
                }
                // Route recovery only on the retry of a device believed online.
                let disable_recovery = attempt == 0;
                outcome = match tokio::time::timeout(ping_timeout, network.ping(&target, disable_recovery)).await {
                    Ok(result) => result,
                    Err(_) => Err(NetworkError::Timeout(ping_timeout)),
                };
                if outcome.is_ok() {
                    break;
                }
            }
            outcome
        };

        let weak = Arc::downgrade(self);
        let target = address.to_string();
        self.queue.push(address.to_string(), PING, work, move |outcome| {
            if let Some(shared) = Weak::upgrade(&weak) {
                shared.on_ping_result(&target, was_online, outcome);
            }
        });
    }

    fn on_ping_result(self: &Arc<Self>, address: &str, was_online: bool, outcome: std::result::Result<(), NetworkError>) {
        if self.is_stopped() {
            return;
        }
        let Some(device) = self.context.registry.device(address) else {
            return;
        };
        if !self.is_device_in_scope(&device) {
            return;
        }

        let state = match outcome {
            Ok(()) => {
                tracing::debug!(entity = %device.friendly_name, "Ping succeeded");
                AvailabilityState::Online
            }
            Err(e) if was_online => {
                tracing::error!(entity = %device.friendly_name, error = %e, "Failed to ping device");
                AvailabilityState::Offline
            }
            Err(e) => {
                tracing::debug!(entity = %device.friendly_name, error = %e, "Failed to ping device");
                AvailabilityState::Offline
            }
        };
        self.reset_timer(&device);
        self.set_state(&Entity::from(device), state, false, true);
    }

    fn on_last_seen(self: &Arc<Self>, event: &LastSeenChanged) {
        let device = &event.device;
        if !self.is_device_in_scope(device) {
            return;
        }
        self.queue.remove_pending_kind(&device.address, PING);
        self.reset_timer(device);

        let previous = self.state_of(&device.id());
        self.set_state(&Entity::from(device.clone()), AvailabilityState::Online, false, true);
        if previous == AvailabilityState::Offline {
            self.schedule_reconnect_read(device);
        }
    }

    /// Re-reads basic state once reconnect traffic settles.
    fn schedule_reconnect_read(self: &Arc<Self>, device: &Device) {
        if self.is_stopped() || !self.is_device_in_scope(device) {
            return;
        }
        let weak = Arc::downgrade(self);
        let target = device.address.clone();
        let delay = self.context.settings.availability.reconnect_read_debounce();
        self.read_timers.schedule(device.address.clone(), delay, move || {
            if let Some(shared) = Weak::upgrade(&weak) {
                shared.queue_state_read(&target);
            }
        });
    }

    fn queue_state_read(self: &Arc<Self>, address: &str) {
        if self.is_stopped() {
            return;
        }
        let Some(device) = self.context.registry.device(address) else {
            return;
        };
        if device.interviewing {
            tracing::debug!(entity = %device.friendly_name, "Skipping state read during interview");
            return;
        }

        let key_sets: Vec<Vec<String>> = RECONNECT_READ_SETS
            .iter()
            .map(|set| {
                set.iter()
                    .filter(|key| device.capabilities.can_read(key))
                    .map(|key| (*key).to_string())
                    .collect::<Vec<_>>()
            })
            .filter(|keys| !keys.is_empty())
            .collect();
        if key_sets.is_empty() {
            return;
        }

        tracing::debug!(entity = %device.friendly_name, "Reading state after reconnect");
        let network = Arc::clone(&self.context.network);
        let target = address.to_string();
        let name = device.friendly_name.clone();
        let work = async move {
            for (index, keys) in key_sets.iter().enumerate() {
                if index > 0 {
                    tokio::time::sleep(READ_SPACING).await;
                }
                if let Err(e) = network.read_attributes(&target, keys).await {
                    tracing::debug!(entity = %name, error = %e, "Failed to read state");
                }
            }
        };
        self.queue.push(address.to_string(), READ, work, |()| {});
    }

    fn on_renamed(self: &Arc<Self>, event: &EntityRenamed) {
        let id = event.entity.id();
        if !self.states.lock().contains_key(&id) {
            return;
        }
        self.context.topics.clear_retained(&format!("{}/availability", event.from));
        let state = self.state_of(&id);
        self.set_state(&event.entity, state, true, false);
    }

    fn on_options_changed(self: &Arc<Self>, event: &EntityOptionsChanged) {
        let entity = &event.entity;
        let id = entity.id();
        let tracked = self.is_in_scope(entity);

        match entity {
            Entity::Device(device) if tracked => {
                self.reset_timer(device);
                let state = match self.state_of(&id) {
                    AvailabilityState::Unknown => AvailabilityState::Online,
                    known => known,
                };
                self.set_state(entity, state, false, true);
            }
            Entity::Device(device) => {
                self.cancel_device(&device.address);
                self.states.lock().remove(&id);
                for group in self.context.registry.groups_containing(&device.address) {
                    self.update_group(&group, false);
                }
            }
            Entity::Group(group) if tracked => self.update_group(group, false),
            Entity::Group(_) => {
                self.states.lock().remove(&id);
            }
        }
    }

    fn forget(self: &Arc<Self>, id: &EntityId, name: Option<&str>) {
        if let Some(address) = id.address() {
            self.cancel_device(address);
        }
        let was_tracked = self.states.lock().remove(id).is_some();
        if was_tracked && let Some(name) = name {
            self.context.topics.clear_retained(&format!("{name}/availability"));
        }
        for group in self.context.registry.groups() {
            self.update_group(&group, false);
        }
    }

    fn cancel_device(&self, address: &str) {
        self.timers.cancel(&address.to_string());
        self.read_timers.cancel(&address.to_string());
        self.queue.remove_pending(&address.to_string());
    }

    /// Recomputes a group from its members.
    ///
    /// Members without tracking are ignored; a member not known to be online
    /// makes the group offline. An empty group is online.
    fn update_group(self: &Arc<Self>, group: &Group, force: bool) {
        let entity = Entity::from(group.clone());
        if !self.is_in_scope(&entity) {
            return;
        }
        let members: Vec<EntityId> = group
            .members
            .iter()
            .filter_map(|address| self.context.registry.device(address))
            .filter(|device| self.is_device_in_scope(device))
            .map(|device| device.id())
            .collect();
        let online = {
            let states = self.states.lock();
            members
                .iter()
                .all(|id| states.get(id).is_some_and(|state| state.is_online()))
        };
        self.set_state(&entity, AvailabilityState::from_online(online), force, false);
    }

    /// Records a state and publishes it if it changed or `force` is set.
    fn set_state(self: &Arc<Self>, entity: &Entity, state: AvailabilityState, force: bool, update_groups: bool) {
        if self.is_stopped() || state == AvailabilityState::Unknown {
            return;
        }
        let id = entity.id();
        let previous = self.states.lock().insert(id.clone(), state);
        let changed = previous != Some(state);
        if !changed && !force {
            return;
        }

        let settings = &self.context.settings;
        let payload = availability_payload(state.is_online(), settings.legacy_availability_payload);
        self.context.topics.publish(
            &format!("{}/availability", entity.name()),
            &payload,
            PublishOptions::retained(),
        );

        if changed {
            tracing::debug!(entity = %entity.name(), state = %state, "Availability changed");
            self.context.bus.emit(&AvailabilityChanged {
                id,
                name: entity.name().to_string(),
                state,
            });
        }

        if update_groups && let Entity::Device(device) = entity {
            for group in self.context.registry.groups_containing(&device.address) {
                self.update_group(&group, false);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entity::{AvailabilityOverride, Capabilities, DeviceKind, PowerSource};
    use crate::settings::{AvailabilitySettings, BridgeSettings};
    use crate::testing::{FakeNetwork, TestContext};

    const ROUTER: &str = "0xrouter";
    const SENSOR: &str = "0xsensor";

    fn router() -> Device {
        Device::new(ROUTER, "plug")
            .with_kind(DeviceKind::Router)
            .with_power_source(PowerSource::Mains)
            .with_capabilities(Capabilities::builder().readable("state").readable("color_temp").build())
    }

    fn sensor() -> Device {
        Device::new(SENSOR, "motion").with_power_source(PowerSource::Battery)
    }

    fn settings() -> BridgeSettings {
        BridgeSettings::default().with_availability(
            AvailabilitySettings::default()
                .with_active_timeout(1)
                .with_passive_timeout(5)
                .with_jitter_fraction(0.0),
        )
    }

    fn setup(settings: BridgeSettings, devices: Vec<Device>) -> (TestContext, Availability) {
        let test = TestContext::new(settings, FakeNetwork::new());
        for device in devices {
            test.context.registry.insert(device).unwrap();
        }
        let availability = Availability::new(test.context.clone());
        (test, availability)
    }

    fn availability_payloads(test: &TestContext, name: &str) -> Vec<String> {
        test.transport
            .published_to(&format!("meshbridge/{name}/availability"))
            .into_iter()
            .map(|p| p.payload)
            .collect()
    }

    fn heard_from(test: &TestContext, device: &Device) {
        test.context.bus.emit(&LastSeenChanged {
            device: device.clone(),
            previous: None,
        });
    }

    #[tokio::test(start_paused = true)]
    async fn start_publishes_initial_state() {
        let (test, availability) = setup(settings(), vec![router(), sensor()]);
        availability.start().await.unwrap();

        assert_eq!(availability_payloads(&test, "plug"), vec![r#"{"state":"online"}"#]);
        assert_eq!(availability_payloads(&test, "motion"), vec![r#"{"state":"online"}"#]);
        let published = test.transport.published_to("meshbridge/plug/availability");
        assert!(published[0].options.retain);
        assert_eq!(availability.state_of(&EntityId::device(ROUTER)), AvailabilityState::Online);
        availability.stop().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn stale_active_device_starts_offline_and_is_pinged() {
        let stale = router().with_last_seen(Utc::now() - chrono::Duration::hours(1));
        let (test, availability) = setup(settings(), vec![stale]);
        availability.start().await.unwrap();

        assert_eq!(availability_payloads(&test, "plug")[0], r#"{"state":"offline"}"#);
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(test.network.pings(), vec![(ROUTER.to_string(), true)]);
        assert_eq!(availability.state_of(&EntityId::device(ROUTER)), AvailabilityState::Online);
        availability.stop().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn passive_device_goes_offline_after_timeout() {
        let (test, availability) = setup(settings(), vec![sensor()]);
        availability.start().await.unwrap();

        tokio::time::sleep(Duration::from_secs(4 * 60)).await;
        heard_from(&test, &sensor());
        tokio::time::sleep(Duration::from_secs(4 * 60)).await;
        assert_eq!(availability.state_of(&EntityId::device(SENSOR)), AvailabilityState::Online);

        tokio::time::sleep(Duration::from_secs(2 * 60)).await;
        assert_eq!(availability.state_of(&EntityId::device(SENSOR)), AvailabilityState::Offline);
        assert_eq!(
            availability_payloads(&test, "motion"),
            vec![r#"{"state":"online"}"#, r#"{"state":"offline"}"#]
        );
        assert!(test.network.pings().is_empty());
        availability.stop().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn failed_pings_of_online_device_retry_then_go_offline() {
        let (test, availability) = setup(settings(), vec![router()]);
        test.network.set_reachable(ROUTER, false);
        availability.start().await.unwrap();

        tokio::time::sleep(Duration::from_secs(61)).await;
        tokio::time::sleep(Duration::from_secs(4)).await;

        assert_eq!(
            test.network.pings(),
            vec![(ROUTER.to_string(), true), (ROUTER.to_string(), false)]
        );
        assert_eq!(availability.state_of(&EntityId::device(ROUTER)), AvailabilityState::Offline);
        availability.stop().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn hanging_ping_is_bounded_by_timeout() {
        let (test, availability) = setup(settings(), vec![router()]);
        test.network.set_ping_delay(Duration::from_secs(3600));
        availability.start().await.unwrap();

        // timeout, two attempts of 10 s each and the 3 s retry delay
        tokio::time::sleep(Duration::from_secs(60 + 10 + 3 + 10 + 1)).await;
        assert_eq!(test.network.pings().len(), 2);
        assert_eq!(availability.state_of(&EntityId::device(ROUTER)), AvailabilityState::Offline);
        availability.stop().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn jittered_timeout_never_fires_early() {
        let settings = BridgeSettings::default().with_availability(
            AvailabilitySettings::default()
                .with_active_timeout(10)
                .with_jitter_fraction(0.1),
        );
        let (test, availability) = setup(settings, vec![router()]);
        test.network.set_ping_delay(Duration::from_secs(3600));
        availability.start().await.unwrap();

        tokio::time::sleep(Duration::from_secs(599)).await;
        assert!(test.network.pings().is_empty());
        assert_eq!(availability.state_of(&EntityId::device(ROUTER)), AvailabilityState::Online);

        // timeout plus 10% jitter, two attempts of 10 s each and the 3 s retry delay
        tokio::time::sleep(Duration::from_secs(660 + 10 + 3 + 10 + 1 - 599)).await;
        assert_eq!(test.network.pings().len(), 2);
        assert_eq!(availability.state_of(&EntityId::device(ROUTER)), AvailabilityState::Offline);
        availability.stop().await.unwrap();
    }

    #[test]
    fn jitter_stays_within_fraction() {
        let timeout = Duration::from_secs(600);
        for _ in 0..200 {
            assert!(jitter(timeout, 0.1) <= Duration::from_secs(60));
            assert!(jitter(timeout, 1e300) <= timeout);
        }
        assert_eq!(jitter(timeout, 0.0), Duration::ZERO);
        assert_eq!(jitter(timeout, f64::NAN), Duration::ZERO);
        let _ = jitter(Duration::MAX, 1.0);
    }

    #[tokio::test(start_paused = true)]
    async fn huge_timeouts_do_not_overflow() {
        let mut settings = settings();
        settings.availability.active_timeout = u64::MAX;
        settings.availability.jitter_fraction = 1.0;
        let (test, availability) = setup(settings, vec![router()]);
        availability.start().await.unwrap();

        tokio::time::sleep(Duration::from_secs(3600)).await;
        assert!(test.network.pings().is_empty());
        assert_eq!(availability.state_of(&EntityId::device(ROUTER)), AvailabilityState::Online);
        availability.stop().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn traffic_after_offline_triggers_reconnect_read() {
        let (test, availability) = setup(settings(), vec![router()]);
        test.network.set_reachable(ROUTER, false);
        availability.start().await.unwrap();
        tokio::time::sleep(Duration::from_secs(80)).await;
        assert_eq!(availability.state_of(&EntityId::device(ROUTER)), AvailabilityState::Offline);

        heard_from(&test, &router());
        heard_from(&test, &router());
        assert_eq!(availability.state_of(&EntityId::device(ROUTER)), AvailabilityState::Online);
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert!(test.network.reads().is_empty());

        tokio::time::sleep(Duration::from_millis(1100)).await;
        assert_eq!(test.network.reads(), vec![(ROUTER.to_string(), vec!["state".to_string()])]);
        tokio::time::sleep(Duration::from_millis(500)).await;
        assert_eq!(
            test.network.reads(),
            vec![
                (ROUTER.to_string(), vec!["state".to_string()]),
                (ROUTER.to_string(), vec!["color_temp".to_string()]),
            ]
        );
        availability.stop().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn reconnect_read_skipped_while_interviewing() {
        let (test, availability) = setup(settings(), vec![router()]);
        availability.start().await.unwrap();
        test.context.registry.set_interviewing(ROUTER, true);

        test.context.bus.emit(&DeviceAnnounce { device: router() });
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert!(test.network.reads().is_empty());
        availability.stop().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn legacy_payload() {
        let (test, availability) = setup(settings().with_legacy_availability_payload(true), vec![sensor()]);
        availability.start().await.unwrap();
        assert_eq!(availability_payloads(&test, "motion"), vec!["online"]);
        availability.stop().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn group_follows_members() {
        let (test, availability) = setup(settings(), vec![router(), sensor()]);
        test.context
            .registry
            .insert(Group::new(7, "room").with_members([ROUTER, SENSOR]))
            .unwrap();
        test.context.registry.insert(Group::new(8, "empty")).unwrap();
        availability.start().await.unwrap();

        assert_eq!(availability_payloads(&test, "room"), vec![r#"{"state":"online"}"#]);
        assert_eq!(availability_payloads(&test, "empty"), vec![r#"{"state":"online"}"#]);

        tokio::time::sleep(Duration::from_secs(5 * 60 + 1)).await;
        assert_eq!(availability.state_of(&EntityId::group(7)), AvailabilityState::Offline);
        assert_eq!(
            availability_payloads(&test, "room"),
            vec![r#"{"state":"online"}"#, r#"{"state":"offline"}"#]
        );
        availability.stop().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn scope_rules() {
        let excluded = Device::new("0x03", "hidden");
        let disabled = Device::new("0x04", "off").with_options(EntityOptions {
            disabled: true,
            ..EntityOptions::default()
        });
        let forced = Device::new("0x05", "forced")
            .with_options(EntityOptions::default().with_availability(AvailabilityOverride::Toggle(true)));
        let coordinator = Device::new("0x00", "Coordinator").with_kind(DeviceKind::Coordinator);
        let mut settings = settings();
        settings.availability = settings.availability.with_exclude(["hid*", "forced"]);

        let (test, availability) = setup(settings, vec![excluded.clone(), disabled.clone(), forced.clone(), coordinator.clone()]);
        assert!(!availability.is_tracked(&excluded.into()));
        assert!(!availability.is_tracked(&disabled.into()));
        assert!(availability.is_tracked(&forced.into()));
        assert!(!availability.is_tracked(&coordinator.into()));

        availability.start().await.unwrap();
        assert!(availability_payloads(&test, "hidden").is_empty());
        assert_eq!(availability_payloads(&test, "forced").len(), 1);
        availability.stop().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn include_list_wins_over_exclude() {
        let mut settings = settings();
        settings.availability = settings
            .availability
            .with_include([SENSOR])
            .with_exclude(["motion"]);
        let (_test, availability) = setup(settings, vec![router(), sensor()]);

        assert!(availability.is_tracked(&sensor().into()));
        assert!(!availability.is_tracked(&router().into()));
    }

    #[tokio::test(start_paused = true)]
    async fn rename_clears_old_topic() {
        let (test, availability) = setup(settings(), vec![sensor()]);
        availability.start().await.unwrap();
        test.context.registry.rename("motion", "hall").unwrap();
        let renamed = test.context.registry.resolve("hall").unwrap();

        test.context.bus.emit(&EntityRenamed {
            entity: renamed,
            from: "motion".to_string(),
            to: "hall".to_string(),
        });

        let cleared = availability_payloads(&test, "motion");
        assert_eq!(cleared.last().map(String::as_str), Some(""));
        assert_eq!(availability_payloads(&test, "hall"), vec![r#"{"state":"online"}"#]);
        availability.stop().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn leave_cancels_timer() {
        let (test, availability) = setup(settings(), vec![sensor()]);
        availability.start().await.unwrap();

        test.context.bus.emit(&DeviceLeave {
            address: SENSOR.to_string(),
            name: Some("motion".to_string()),
        });
        tokio::time::sleep(Duration::from_secs(10 * 60)).await;

        assert_eq!(availability.state_of(&EntityId::device(SENSOR)), AvailabilityState::Unknown);
        let payloads = availability_payloads(&test, "motion");
        assert_eq!(payloads, vec![r#"{"state":"online"}"#.to_string(), String::new()]);
        availability.stop().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn availability_changed_event() {
        let (test, availability) = setup(settings(), vec![sensor()]);
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let owner = test.context.bus.owner("test");
        test.context.bus.on(&owner, move |event: &AvailabilityChanged| {
            sink.lock().push((event.name.clone(), event.state));
            Ok(())
        });

        availability.start().await.unwrap();
        assert_eq!(*seen.lock(), vec![("motion".to_string(), AvailabilityState::Online)]);
        availability.stop().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn nothing_happens_after_stop() {
        let (test, availability) = setup(settings(), vec![router(), sensor()]);
        test.network.set_ping_delay(Duration::from_secs(1));
        availability.start().await.unwrap();
        tokio::time::sleep(Duration::from_secs(60)).await;
        availability.stop().await.unwrap();
        availability.stop().await.unwrap();
        let published = test.transport.published().len();

        heard_from(&test, &sensor());
        tokio::time::sleep(Duration::from_secs(3600)).await;
        assert_eq!(test.transport.published().len(), published);
    }
}

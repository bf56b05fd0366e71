use std::sync::Arc;
use std::time::{Duration, Instant};

use hwmux::bus::EventBus;
use hwmux::debounce::StateCache;
use hwmux::{EventKind, Interest, ResourceId, Value};

fn cache_for(id: &ResourceId) -> (Arc<StateCache>, Arc<EventBus>) {
    let bus = Arc::new(EventBus::new([id.clone()], 16));
    (Arc::new(StateCache::new(bus.clone())), bus)
}

fn published(bus: &EventBus, id: &ResourceId) -> Vec<Value> {
    bus.history(id, None)
        .into_iter()
        .filter_map(|e| match e.kind {
            EventKind::Changed { value } => Some(value),
            _ => None,
        })
        .collect()
}

#[test]
fn bouncing_input_publishes_once_after_settling() {
    let id = ResourceId::Pin(2);
    let (cache, bus) = cache_for(&id);
    let window = Duration::from_millis(10);
    let t0 = Instant::now();

    for (ms, level) in [0u8, 1, 0, 1, 1, 1].into_iter().enumerate() {
        let at = t0 + Duration::from_millis(ms as u64);
        assert!(
            cache
                .observe(&id, Value::Digital(level), window, 0.0, at)
                .is_none()
        );
    }

    // Last raw change was at 3ms.
    assert!(cache.settle_due(t0 + Duration::from_millis(12)).is_empty());
    let settled = cache.settle_due(t0 + Duration::from_millis(20));
    assert_eq!(settled.len(), 1);
    assert!(cache.settle_due(t0 + Duration::from_millis(40)).is_empty());

    assert_eq!(published(&bus, &id), vec![Value::Digital(1)]);
    let snapshot = cache.snapshot(&id).expect("observed");
    assert_eq!(snapshot.value, Some(Value::Digital(1)));
    assert!(!snapshot.settling);
}

#[test]
fn repeated_samples_do_not_extend_the_window() {
    let id = ResourceId::Pin(2);
    let (cache, _bus) = cache_for(&id);
    let window = Duration::from_millis(10);
    let t0 = Instant::now();

    cache.observe(&id, Value::Digital(1), window, 0.0, t0);
    cache.observe(&id, Value::Digital(1), window, 0.0, t0 + Duration::from_millis(8));

    assert_eq!(cache.next_deadline(), Some(t0 + window));
    let settled = cache.observe(
        &id,
        Value::Digital(1),
        window,
        0.0,
        t0 + Duration::from_millis(11),
    );
    assert!(settled.is_some());
    assert_eq!(cache.next_deadline(), None);
}

#[test]
fn hysteresis_suppresses_small_changes() {
    let id = ResourceId::Serial("adc".into());
    let (cache, bus) = cache_for(&id);
    let t0 = Instant::now();

    for (ms, sample) in [10.0, 11.0, 10.0, 15.0].into_iter().enumerate() {
        let at = t0 + Duration::from_millis(ms as u64);
        cache.observe(&id, Value::Analog(sample), Duration::ZERO, 2.0, at);
    }

    assert_eq!(
        published(&bus, &id),
        vec![Value::Analog(10.0), Value::Analog(15.0)]
    );
    let snapshot = cache.snapshot(&id).expect("observed");
    assert_eq!(snapshot.value, Some(Value::Analog(15.0)));
    assert_eq!(snapshot.raw, Some(Value::Analog(15.0)));
}

#[test]
fn hysteresis_compares_channels_by_largest_change() {
    let id = ResourceId::Serial("remote".into());
    let (cache, bus) = cache_for(&id);
    let t0 = Instant::now();

    let frames = [
        vec![1500, 1500, 1500],
        vec![1503, 1499, 1500],
        vec![1500, 1500, 1520],
    ];
    for (ms, channels) in frames.into_iter().enumerate() {
        let at = t0 + Duration::from_millis(ms as u64);
        cache.observe(&id, Value::Channels(channels), Duration::ZERO, 5.0, at);
    }

    assert_eq!(
        published(&bus, &id),
        vec![
            Value::Channels(vec![1500, 1500, 1500]),
            Value::Channels(vec![1500, 1500, 1520]),
        ]
    );
}

#[test]
fn digital_changes_ignore_hysteresis() {
    let id = ResourceId::Pin(1);
    let (cache, bus) = cache_for(&id);
    let t0 = Instant::now();

    cache.observe(&id, Value::Digital(0), Duration::ZERO, 5.0, t0);
    cache.observe(&id, Value::Digital(1), Duration::ZERO, 5.0, t0);

    assert_eq!(
        published(&bus, &id),
        vec![Value::Digital(0), Value::Digital(1)]
    );
}

#[test]
fn payloads_are_not_cached() {
    let id = ResourceId::Serial("uart0".into());
    let (cache, bus) = cache_for(&id);

    let event = cache.observe(
        &id,
        Value::Bytes(b"abc".to_vec()),
        Duration::ZERO,
        0.0,
        Instant::now(),
    );
    assert!(event.is_none());
    assert!(cache.snapshot(&id).is_none());
    assert!(bus.history(&id, None).is_empty());
}

#[test]
fn timer_thread_publishes_due_samples() {
    let id = ResourceId::Pin(2);
    let (cache, bus) = cache_for(&id);
    let events = bus.subscribe(Interest::one(id.clone()));
    let mut timer = cache.start_timer().expect("timer thread");

    cache.observe(
        &id,
        Value::Digital(1),
        Duration::from_millis(30),
        0.0,
        Instant::now(),
    );
    assert!(cache.snapshot(&id).expect("observed").settling);

    let event = events.recv_timeout(Duration::from_secs(2)).expect("settled");
    assert_eq!(
        event.kind,
        EventKind::Changed {
            value: Value::Digital(1)
        }
    );
    timer.stop();
}

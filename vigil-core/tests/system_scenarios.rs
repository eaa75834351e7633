/*
 * End-to-end scenarios for the Vigil control plane
 *
 * Each test brings up a full System against the mock backend with fast
 * monitor ticks and drives it through the frontend API functions, exactly
 * the way the RPC server does.
 */

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use vigil_core::{api, ClientCtx, EventClientCtx, System, SystemConfig, WatchClientCtx};
use vigil_error::{ApiStatus, ErrorCode};
use vigil_protocol::{
    EventFilter, EventGenSpec, EventInfo, GpuResetSpec, GpuUpdateSpec, WatchInfo, WatchSpec,
};
use vigil_smi::{
    gpu_uuid, EventId, EventSeverity, GpuHandle, MockSmi, ObjKey, ResetType, SmiBackend,
    WatchAttrId,
};

fn fast_config() -> SystemConfig {
    SystemConfig {
        event_start_delay: Duration::from_millis(10),
        event_tick: Duration::from_millis(25),
        watch_tick: Duration::from_millis(25),
        api_timeout: Duration::from_secs(5),
    }
}

fn start_system(num_gpus: u32) -> (Arc<System>, Arc<MockSmi>) {
    let smi = Arc::new(MockSmi::new(num_gpus));
    let sys = System::start(smi.clone(), fast_config()).expect("system start");
    (sys, smi)
}

fn wait_until(timeout: Duration, mut cond: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
    cond()
}

fn watch_key(i: u8) -> ObjKey {
    // any valid non-GPU key works for watch groups
    gpu_uuid(0xf0 | i, 0xdead_0000 + i as u64)
}

#[test]
fn enumeration_reports_every_gpu_with_derived_keys() {
    let (sys, smi) = start_system(4);
    let infos = api::gpu_get(&sys, &[]).unwrap();
    assert_eq!(infos.len(), 4);

    let discovered = smi.discover().unwrap();
    for gpu in &discovered {
        let expected = gpu_uuid(gpu.handle.0 as u8, gpu.unique_id);
        assert!(
            infos.iter().any(|i| i.key == expected),
            "missing GPU key {}",
            expected
        );
    }
    // inventory came from the backend
    assert!(infos.iter().all(|i| i.status.card_series.contains("MI200")));
    sys.shutdown();
}

#[test]
fn update_then_read_observes_new_spec() {
    let (sys, _smi) = start_system(2);
    let key = api::gpu_get(&sys, &[]).unwrap()[0].key;

    let (status, code) = api::gpu_update(
        &sys,
        vec![GpuUpdateSpec {
            key,
            overdrive_level: Some(5),
            ..Default::default()
        }],
    );
    assert_eq!((status, code), (ApiStatus::Ok, ErrorCode::None));

    let info = &api::gpu_get(&sys, &[key]).unwrap()[0];
    assert_eq!(info.spec.overdrive_level, 5);
    sys.shutdown();
}

#[test]
fn serialized_updates_are_prefix_consistent() {
    let (sys, _smi) = start_system(1);
    let key = api::gpu_get(&sys, &[]).unwrap()[0].key;

    for i in 1..=5u32 {
        let (status, _) = api::gpu_update(
            &sys,
            vec![GpuUpdateSpec {
                key,
                overdrive_level: Some(i),
                ..Default::default()
            }],
        );
        assert_eq!(status, ApiStatus::Ok);
        // each observed state reflects the whole update, never part of it
        let info = &api::gpu_get(&sys, &[key]).unwrap()[0];
        assert_eq!(info.spec.overdrive_level, i);
    }
    sys.shutdown();
}

#[test]
fn reset_of_unknown_gpu_is_invalid() {
    let (sys, _smi) = start_system(1);
    let (status, _) = api::gpu_reset(
        &sys,
        GpuResetSpec {
            key: ObjKey::zero(),
            reset_type: ResetType::Asic,
        },
    );
    assert_eq!(status, ApiStatus::InvalidArg);
    sys.shutdown();
}

#[test]
fn backend_rejection_carries_detail_code() {
    let (sys, _smi) = start_system(1);
    let key = api::gpu_get(&sys, &[]).unwrap()[0].key;
    let (status, code) = api::gpu_update(
        &sys,
        vec![GpuUpdateSpec {
            key,
            power_cap: Some(100),
            ..Default::default()
        }],
    );
    assert_eq!(status, ApiStatus::Err);
    assert_eq!(code, ErrorCode::GpuPowerCapOutOfRange);
    sys.shutdown();
}

#[test]
fn event_fan_out_delivers_to_every_subscriber() {
    let (sys, smi) = start_system(2);
    let handle = GpuHandle(0);
    // key of the GPU behind handle 0, not whichever walks first
    let gpu_key = gpu_uuid(0, smi.discover().unwrap()[0].unique_id);

    let received_a: Arc<Mutex<Vec<EventInfo>>> = Arc::new(Mutex::new(Vec::new()));
    let received_b: Arc<Mutex<Vec<EventInfo>>> = Arc::new(Mutex::new(Vec::new()));
    let mut streams = Vec::new();
    for received in [received_a.clone(), received_b.clone()] {
        let sink = received.clone();
        let ctx: Arc<EventClientCtx> = ClientCtx::new(
            "fanout-client",
            Box::new(move |ev: &EventInfo| {
                sink.lock().unwrap().push(ev.clone());
                Ok(())
            }),
        );
        let sys2 = sys.clone();
        let filter = EventFilter {
            events: vec![EventId::ThermalThrottle],
            gpus: vec![gpu_key],
        };
        streams.push(std::thread::spawn(move || {
            api::event_subscribe(&sys2, &filter, ctx)
        }));
    }

    assert!(wait_until(Duration::from_secs(5), || {
        sys.event_db()
            .subscriber_count(handle, EventId::ThermalThrottle)
            == 2
    }));

    smi.inject_event(handle, EventId::ThermalThrottle, "thermal limit");
    smi.inject_event(handle, EventId::ThermalThrottle, "thermal limit");

    assert!(wait_until(Duration::from_secs(5), || {
        received_a.lock().unwrap().len() == 2 && received_b.lock().unwrap().len() == 2
    }));
    for received in [&received_a, &received_b] {
        for event in received.lock().unwrap().iter() {
            assert_eq!(event.gpu, gpu_key);
            assert_eq!(event.severity, EventSeverity::Info);
            assert_eq!(event.id, EventId::ThermalThrottle);
        }
    }

    sys.shutdown();
    for stream in streams {
        assert!(stream.join().unwrap().is_ok());
    }
}

#[test]
fn dead_event_subscriber_is_harvested_within_a_tick() {
    let (sys, smi) = start_system(2);
    let handle = GpuHandle(0);

    // a client whose stream write always fails
    let ctx: Arc<EventClientCtx> =
        ClientCtx::new("dying-client", Box::new(|_: &EventInfo| Err(())));
    let sys2 = sys.clone();
    let stream = std::thread::spawn(move || {
        api::event_subscribe(&sys2, &EventFilter::default(), ctx)
    });

    assert!(wait_until(Duration::from_secs(5), || {
        sys.event_db()
            .subscriber_count(handle, EventId::ThermalThrottle)
            == 1
    }));

    smi.inject_event(handle, EventId::ThermalThrottle, "thermal limit");

    // the server-side call returns OK once the monitor signals the context
    assert!(stream.join().unwrap().is_ok());
    // and the context is gone from every event record
    for gpu in 0..2 {
        for event in EventId::ALL {
            assert_eq!(sys.event_db().subscriber_count(GpuHandle(gpu), event), 0);
        }
    }
    sys.shutdown();
}

#[test]
fn generated_events_are_observable_through_event_get() {
    let (sys, _smi) = start_system(2);
    let keys: Vec<ObjKey> = api::gpu_get(&sys, &[]).unwrap().iter().map(|i| i.key).collect();

    let (status, _) = api::event_gen(
        &sys,
        &EventGenSpec {
            events: vec![EventId::RingHang],
            gpus: vec![keys[1]],
        },
    );
    assert_eq!(status, ApiStatus::Ok);

    assert!(wait_until(Duration::from_secs(5), || {
        !api::event_get(&sys, &EventFilter::default()).unwrap().is_empty()
    }));
    let events = api::event_get(
        &sys,
        &EventFilter {
            events: vec![EventId::RingHang],
            gpus: vec![keys[1]],
        },
    )
    .unwrap();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].severity, EventSeverity::Critical);
    assert_eq!(events[0].message, "test event");

    // generation against an unknown GPU is a validation failure
    let (status, _) = api::event_gen(
        &sys,
        &EventGenSpec {
            events: vec![EventId::RingHang],
            gpus: vec![gpu_uuid(0x99, 0x9999)],
        },
    );
    assert_eq!(status, ApiStatus::InvalidArg);
    sys.shutdown();
}

#[test]
fn watch_create_round_trips_spec() {
    let (sys, _smi) = start_system(2);
    let gpu_key = api::gpu_get(&sys, &[]).unwrap()[0].key;
    let wkey = watch_key(1);
    let spec = WatchSpec {
        key: wkey,
        gpus: vec![gpu_key],
        attrs: vec![WatchAttrId::GpuClock, WatchAttrId::GpuTemp],
    };

    let (status, _) = api::watch_create(&sys, vec![spec.clone()]);
    assert_eq!(status, ApiStatus::Ok);

    let infos = api::watch_get(&sys, &[wkey]).unwrap();
    assert_eq!(infos.len(), 1);
    assert_eq!(infos[0].spec.key, spec.key);
    assert_eq!(infos[0].spec.gpus, spec.gpus);
    assert_eq!(infos[0].spec.attrs, spec.attrs);
    assert_eq!(infos[0].status.num_subscribers, 0);

    // duplicate create reports exists
    let (status, _) = api::watch_create(&sys, vec![spec]);
    assert_eq!(status, ApiStatus::Exists);
    sys.shutdown();
}

#[test]
fn watch_delete_while_subscribed_is_refused() {
    let (sys, _smi) = start_system(1);
    let gpu_key = api::gpu_get(&sys, &[]).unwrap()[0].key;
    let wkey = watch_key(2);
    let (status, _) = api::watch_create(
        &sys,
        vec![WatchSpec {
            key: wkey,
            gpus: vec![gpu_key],
            attrs: vec![WatchAttrId::GpuClock],
        }],
    );
    assert_eq!(status, ApiStatus::Ok);

    // subscriber that accepts samples until the test pulls the plug
    let delivered = Arc::new(AtomicUsize::new(0));
    let unplugged = Arc::new(std::sync::atomic::AtomicBool::new(false));
    let counter = delivered.clone();
    let plug = unplugged.clone();
    let ctx: Arc<WatchClientCtx> = ClientCtx::new(
        "short-lived-watcher",
        Box::new(move |_: &WatchInfo| {
            if plug.load(Ordering::SeqCst) {
                return Err(());
            }
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }),
    );
    let sys2 = sys.clone();
    let stream = std::thread::spawn(move || api::watch_subscribe(&sys2, &[wkey], ctx));

    // while subscribed, delete is refused and the entry stays put
    assert!(wait_until(Duration::from_secs(5), || {
        api::watch_get(&sys, &[wkey])
            .map(|infos| infos[0].status.num_subscribers == 1)
            .unwrap_or(false)
    }));
    let (status, _) = api::watch_delete(&sys, &[wkey]);
    assert_eq!(status, ApiStatus::InUse);
    assert_eq!(api::watch_get(&sys, &[wkey]).unwrap().len(), 1);

    // samples flowed to the subscriber
    assert!(wait_until(Duration::from_secs(5), || {
        delivered.load(Ordering::SeqCst) >= 1
    }));

    // pull the plug: the next write fails, the monitor harvests the client
    unplugged.store(true, Ordering::SeqCst);
    assert!(stream.join().unwrap().is_ok());
    assert!(wait_until(Duration::from_secs(5), || {
        api::watch_delete(&sys, &[wkey]).0 == ApiStatus::Ok
    }));
    assert_eq!(
        api::watch_get(&sys, &[wkey]).unwrap_err().status,
        ApiStatus::NotFound
    );
    sys.shutdown();
}

#[test]
fn watch_samples_carry_units_and_populate_cache() {
    let (sys, _smi) = start_system(1);
    let gpu_key = api::gpu_get(&sys, &[]).unwrap()[0].key;
    let wkey = watch_key(3);
    api::watch_create(
        &sys,
        vec![WatchSpec {
            key: wkey,
            gpus: vec![gpu_key],
            attrs: vec![WatchAttrId::GpuClock, WatchAttrId::PowerUsage],
        }],
    );

    let samples: Arc<Mutex<Vec<WatchInfo>>> = Arc::new(Mutex::new(Vec::new()));
    let sink = samples.clone();
    let ctx: Arc<WatchClientCtx> = ClientCtx::new(
        "unit-watcher",
        Box::new(move |info: &WatchInfo| {
            sink.lock().unwrap().push(info.clone());
            Ok(())
        }),
    );
    let sys2 = sys.clone();
    let stream = std::thread::spawn(move || api::watch_subscribe(&sys2, &[wkey], ctx));

    assert!(wait_until(Duration::from_secs(5), || {
        !samples.lock().unwrap().is_empty()
    }));
    {
        let samples = samples.lock().unwrap();
        let info = &samples[0];
        assert_eq!(info.stats.gpus.len(), 1);
        let attrs = &info.stats.gpus[0].attrs;
        assert_eq!(attrs.len(), 2);
        assert!(attrs.iter().any(|a| a.units == "MHz"));
        assert!(attrs.iter().any(|a| a.units == "W"));
    }

    // the unary read path serves the same samples from the cache
    assert!(wait_until(Duration::from_secs(5), || {
        api::watch_get(&sys, &[wkey])
            .map(|infos| !infos[0].stats.gpus.is_empty())
            .unwrap_or(false)
    }));

    sys.shutdown();
    assert!(stream.join().unwrap().is_ok());
}

#[test]
fn subscribe_to_unknown_watch_is_invalid() {
    let (sys, _smi) = start_system(1);
    let ctx: Arc<WatchClientCtx> = ClientCtx::new("nobody", Box::new(|_: &WatchInfo| Ok(())));
    let err = api::watch_subscribe(&sys, &[watch_key(9)], ctx).unwrap_err();
    assert_eq!(err.status, ApiStatus::InvalidArg);
    sys.shutdown();
}

#[test]
fn topology_and_partitions_cover_all_gpus() {
    let (sys, _smi) = start_system(4);
    let topo = api::topology_get(&sys).unwrap();
    assert_eq!(topo.len(), 4);
    for info in &topo {
        assert_eq!(info.topology.peers.len(), 3);
    }

    let partitions = api::compute_partition_get(&sys, &[]).unwrap();
    assert_eq!(partitions.len(), 4);

    let pages = api::bad_page_get(&sys, &[]).unwrap();
    assert_eq!(pages.len(), 4);
    assert!(pages.iter().all(|p| !p.records.is_empty()));
    sys.shutdown();
}

//! End-to-end lifecycle scenarios: registry, planner, dispatcher and expiry
//! over a real store, driven by a manual clock.

use std::sync::Arc;
use std::time::Duration as StdDuration;

use chrono::{DateTime, Duration, TimeZone, Utc};
use dripcast_core::config::ExpiryConfig;
use dripcast_core::traits::{Clock, ManualClock};
use dripcast_core::types::Track;
use dripcast_scheduler::testing::{Failure, RecordingTransport};
use dripcast_scheduler::{Dispatcher, ExpiryController, LifecycleRegistry, PaymentEvent};
use dripcast_store::{BroadcastInput, PaymentStatus, SettingKey, Store, TemplateInput};

struct World {
    _dir: tempfile::TempDir,
    store: Arc<Store>,
    transport: Arc<RecordingTransport>,
    clock: Arc<ManualClock>,
    registry: LifecycleRegistry,
    dispatcher: Dispatcher,
    expiry: ExpiryController,
}

impl World {
    fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }
}

fn t0() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 3, 1, 9, 0, 0).unwrap()
}

/// Free track: #1 at 0.05 h, #2 at 4 h. Paid track: #1 at 0 h, #2 at 48 h.
fn world() -> World {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(dripcast_store::open_in_dir(dir.path()).unwrap());
    let transport = Arc::new(RecordingTransport::new());
    let clock = Arc::new(ManualClock::new(t0()));
    store
        .write(|db| {
            for (track, body, hours) in [
                (Track::Free, "free 1", 0.05),
                (Track::Free, "free 2", 4.0),
                (Track::Paid, "paid 1", 0.0),
                (Track::Paid, "paid 2", 48.0),
            ] {
                db.add_template(
                    track,
                    &TemplateInput {
                        body: body.into(),
                        delay_hours: hours,
                        ..Default::default()
                    },
                )?;
            }
            db.set_setting(SettingKey::RenewalBody, "Renew now", t0())?;
            Ok(())
        })
        .unwrap();

    let registry = LifecycleRegistry::new(store.clone(), transport.clone(), clock.clone());
    let dispatcher = Dispatcher::new(
        store.clone(),
        transport.clone(),
        clock.clone(),
        StdDuration::from_secs(30),
    );
    let expiry = ExpiryController::new(
        store.clone(),
        transport.clone(),
        clock.clone(),
        &ExpiryConfig::default(),
    )
    .unwrap();
    World {
        _dir: dir,
        store,
        transport,
        clock,
        registry,
        dispatcher,
        expiry,
    }
}

fn pending(w: &World, user: i64, track: Track) -> usize {
    w.store.read(|db| db.pending_for(user, track)).unwrap().len()
}

fn payment(user_id: i64, paid_through: Option<chrono::NaiveDate>) -> PaymentEvent {
    PaymentEvent {
        user_id,
        amount: "9.99".into(),
        status: PaymentStatus::Success,
        utm_source: Some("ads".into()),
        utm_id: None,
        paid_through,
    }
}

async fn engage(w: &World, user: i64) {
    w.registry.joined(user, Some("ann"), Some("Ann")).await.unwrap();
    w.registry.first_contact(user, None, None).await.unwrap();
}

#[tokio::test]
async fn engaged_user_gets_free_drip_on_time() {
    let w = world();
    engage(&w, 7).await;

    let rows = w.store.read(|db| db.pending_for(7, Track::Free)).unwrap();
    assert_eq!(rows.len(), 2);
    assert_eq!(rows[0].fire_at, t0() + Duration::minutes(3));
    assert_eq!(rows[1].fire_at, t0() + Duration::hours(4));

    w.clock.set(t0() + Duration::minutes(4));
    let due = w.store.read(|db| db.drain_due(Track::Free, w.now())).unwrap();
    assert_eq!(due.len(), 1);
    assert_eq!(due[0].seq_no, 1);
}

#[tokio::test]
async fn payment_moves_user_to_paid_track() {
    let w = world();
    engage(&w, 7).await;
    w.clock.set(t0() + Duration::minutes(4));
    w.dispatcher.tick().await.unwrap();
    w.transport.reset();

    w.clock.set(t0() + Duration::minutes(10));
    let through = (t0() + Duration::days(30)).date_naive();
    w.registry.payment(&payment(7, Some(through))).await.unwrap();

    assert_eq!(pending(&w, 7, Track::Free), 0);
    assert_eq!(pending(&w, 7, Track::Paid), 2);
    assert_eq!(w.transport.sent_to(7).len(), 1);

    // Nothing from the free track is ever returned for a paid user.
    w.clock.set(t0() + Duration::hours(5));
    let free = w.store.read(|db| db.drain_due(Track::Free, w.now())).unwrap();
    assert!(free.iter().all(|d| d.user_id != 7));
}

#[tokio::test]
async fn deleting_a_template_cancels_its_pending_rows() {
    let w = world();
    engage(&w, 7).await;
    w.clock.set(t0() + Duration::minutes(4));
    w.dispatcher.tick().await.unwrap();

    w.clock.set(t0() + Duration::hours(1));
    w.store.write(|db| db.delete_template(Track::Free, 2)).unwrap();

    let rows = w.store.read(|db| db.deliveries_for(7, Track::Free)).unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!((rows[0].seq_no, rows[0].sent), (1, true));
}

#[tokio::test]
async fn leaving_stops_everything_and_rejoin_restarts_free_track() {
    let w = world();
    engage(&w, 7).await;
    w.registry.payment(&payment(7, None)).await.unwrap();
    assert!(pending(&w, 7, Track::Paid) > 0);

    w.clock.set(t0() + Duration::hours(2));
    assert!(w.registry.left(7).await.unwrap());
    w.clock.set(t0() + Duration::days(5));
    for track in Track::ALL {
        let due = w.store.read(|db| db.drain_due(track, w.now())).unwrap();
        assert!(due.iter().all(|d| d.user_id != 7));
    }

    let rejoin = w.now();
    engage(&w, 7).await;
    let rows = w.store.read(|db| db.pending_for(7, Track::Free)).unwrap();
    assert_eq!(rows.len(), 2);
    assert_eq!(rows[0].fire_at, rejoin + Duration::minutes(3));
    assert_eq!(pending(&w, 7, Track::Paid), 0);
}

#[tokio::test]
async fn expiry_demotes_and_prompts_once() {
    let w = world();
    engage(&w, 7).await;
    let today = t0().date_naive();
    w.registry.payment(&payment(7, Some(today))).await.unwrap();
    w.transport.reset();

    let report = w.expiry.sweep().await.unwrap();
    assert_eq!(report.demoted, vec![7]);

    let sub = w.store.read(|db| db.get_subscriber(7)).unwrap().unwrap();
    assert!(!sub.paid);
    assert!(sub.paid_through.is_none());
    assert_eq!(pending(&w, 7, Track::Paid), 0);
    assert_eq!(w.transport.bodies_to(7), vec!["Renew now"]);

    w.expiry.sweep().await.unwrap();
    assert_eq!(w.transport.bodies_to(7).len(), 1);
}

#[tokio::test]
async fn broadcast_reaches_only_its_track_audience() {
    let w = world();
    // a: engaged, unpaid. b: paid. c: left.
    engage(&w, 1).await;
    engage(&w, 2).await;
    w.registry.payment(&payment(2, None)).await.unwrap();
    engage(&w, 3).await;
    w.registry.left(3).await.unwrap();

    w.store
        .write(|db| {
            db.schedule_broadcast(
                &BroadcastInput {
                    track: Track::Free,
                    body: "B".into(),
                    photo_ref: None,
                    fire_at: t0() + Duration::hours(1),
                    buttons: vec![],
                },
                t0(),
            )
        })
        .unwrap();
    w.transport.reset();

    w.clock.set(t0() + Duration::hours(1));
    w.dispatcher.tick().await.unwrap();
    let got_b: Vec<i64> = w
        .transport
        .sent()
        .iter()
        .filter(|s| s.body == "B")
        .map(|s| s.user_id)
        .collect();
    assert_eq!(got_b, vec![1]);
}

#[tokio::test]
async fn at_most_one_pending_row_per_key() {
    let w = world();
    engage(&w, 7).await;
    // Repeat contacts and a revive cycle must not duplicate pending rows.
    w.registry.first_contact(7, None, None).await.unwrap();
    w.registry.joined(7, None, None).await.unwrap();
    let health = w.store.read(|db| db.health()).unwrap();
    assert_eq!(health.duplicates, 0);
    assert_eq!(health.orphans, 0);
    assert_eq!(pending(&w, 7, Track::Free), 2);
}

#[tokio::test]
async fn per_user_rows_fire_in_order_across_ticks() {
    let w = world();
    engage(&w, 7).await;
    w.clock.set(t0() + Duration::hours(5));
    w.transport.fail_next(7, Failure::Transient);
    w.dispatcher.tick().await.unwrap();
    assert!(w.transport.bodies_to(7).iter().all(|b| b != "free 2"));

    w.dispatcher.tick().await.unwrap();
    let bodies = w.transport.bodies_to(7);
    let first = bodies.iter().position(|b| b == "free 1").unwrap();
    let second = bodies.iter().position(|b| b == "free 2").unwrap();
    assert!(first < second);
}

#[tokio::test]
async fn sent_rows_never_return_to_pending() {
    let w = world();
    engage(&w, 7).await;
    w.clock.set(t0() + Duration::hours(5));
    w.dispatcher.tick().await.unwrap();
    let rows = w.store.read(|db| db.deliveries_for(7, Track::Free)).unwrap();
    assert!(rows.iter().all(|d| d.sent));

    // Re-engaging after a leave plans fresh rows; history stays sent.
    w.registry.left(7).await.unwrap();
    engage(&w, 7).await;
    let rows = w.store.read(|db| db.deliveries_for(7, Track::Free)).unwrap();
    assert_eq!(rows.iter().filter(|d| d.sent).count(), 2);
    assert_eq!(rows.iter().filter(|d| !d.sent).count(), 2);
}

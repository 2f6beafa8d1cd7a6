mod common;

use std::time::Duration;

use futures::future::join_all;
use tokio_test::{assert_err, assert_ok};
use ulid::Ulid;

use slotbook::calendar::ReconcileOutcome;
use slotbook::clock::Clock;
use slotbook::engine::EngineError;
use slotbook::model::*;

use common::*;

// ── Walkthrough: one slot from claim to reminder ─────────────

/// Two students race for the 09:00 slot, the professor confirms, the student
/// cancels at 07:00 on the day.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn claim_confirm_cancel_walkthrough() {
    let h = Harness::new();
    let service = h.open();
    let engine = service.engine().clone();
    let owner = Ulid::new();
    let day = midnight(2);
    let slot_id = publish(&service, owner, day + 9 * H, day + 9 * H + 30 * M).await;

    // Students A and B claim simultaneously.
    let (a, b) = (Ulid::new(), Ulid::new());
    let handles = [a, b].map(|student| {
        let engine = engine.clone();
        tokio::spawn(async move { engine.claim(slot_id, student, NOW).await })
    });
    let results: Vec<_> = join_all(handles)
        .await
        .into_iter()
        .map(|r| r.unwrap())
        .collect();
    let winners: Vec<&Booking> = results.iter().filter_map(|r| r.as_ref().ok()).collect();
    assert_eq!(winners.len(), 1);
    assert!(results
        .iter()
        .any(|r| matches!(r, Err(EngineError::Conflict(id)) if *id == slot_id)));
    let booking = winners[0].clone();
    assert_eq!(booking.status, BookingStatus::Pending);
    assert_eq!(engine.slot(&slot_id).await.unwrap().status, SlotStatus::Booked);

    // The professor confirms: reminder for 08:00 the day before, calendar create queued.
    let confirmed = assert_ok!(
        engine
            .transition(booking.id, Action::Confirm, Actor::Professor(owner), NOW)
            .await
    );
    assert_eq!(confirmed.status, BookingStatus::Confirmed);
    let queued: Vec<WorkKind> = service
        .queue()
        .pending_for(&booking.id)
        .into_iter()
        .map(|i| i.kind)
        .collect();
    assert!(queued.contains(&WorkKind::Calendar(SyncAction::Create)));

    drain_work(&service).await;
    let reminders = service.reminders().tasks_for(&booking.id);
    assert_eq!(reminders.len(), 1);
    assert_eq!(reminders[0].status, ReminderStatus::Scheduled);
    assert_eq!(reminders[0].fire_at, midnight(1) + 8 * H);
    assert_eq!(h.calendar.creates(), 1);
    let state = service.calendar().state(&booking.id).unwrap();
    assert_eq!(state.external_event_id, Some(format!("cal-{}", booking.id)));

    // The student cancels at 07:00, before the one-hour cutoff.
    h.clock.set(day + 7 * H);
    let cancelled = assert_ok!(
        engine
            .transition(
                booking.id,
                Action::Cancel { reason: None },
                Actor::Student(booking.student_id),
                day + 7 * H,
            )
            .await
    );
    assert_eq!(cancelled.status, BookingStatus::Cancelled);
    assert_eq!(engine.slot(&slot_id).await.unwrap().status, SlotStatus::Available);
    let queued: Vec<WorkKind> = service
        .queue()
        .pending_for(&booking.id)
        .into_iter()
        .map(|i| i.kind)
        .collect();
    assert_eq!(
        queued,
        vec![
            WorkKind::CancelReminders,
            WorkKind::Calendar(SyncAction::Cancel),
            WorkKind::Notice(NoticeKind::Cancelled),
        ]
    );

    drain_work(&service).await;
    assert_eq!(
        service.reminders().tasks_for(&booking.id)[0].status,
        ReminderStatus::Cancelled
    );
    assert_eq!(h.calendar.deletes(), 1);
    assert_eq!(service.calendar().state(&booking.id).unwrap().external_event_id, None);
    assert_eq!(
        h.notifier.notices(booking.id),
        vec![NoticeKind::Requested, NoticeKind::Confirmed, NoticeKind::Cancelled]
    );
    assert!(engine.audit().await.is_empty());
}

#[tokio::test]
async fn reminder_handed_off_once_across_crash() {
    let h = Harness::new();
    let owner = Ulid::new();
    let day = midnight(2);
    let booking_id = {
        let service = h.open();
        let slot_id = publish(&service, owner, day + 9 * H, day + 9 * H + 30 * M).await;
        let b = service.engine().claim(slot_id, Ulid::new(), NOW).await.unwrap();
        service
            .engine()
            .transition(b.id, Action::Confirm, Actor::Professor(owner), NOW)
            .await
            .unwrap();
        drain_work(&service).await;

        let fire_at = midnight(1) + 8 * H;
        h.clock.set(fire_at);
        assert_eq!(service.worker().dispatch_due_reminders(fire_at).await.unwrap(), 1);
        // A retried drain right after the fire-marking finds nothing.
        assert!(service.reminders().drain(fire_at).await.unwrap().is_empty());
        b.id
    };

    // Restart and drain again.
    let service = h.open();
    let now = h.clock.now();
    assert_eq!(service.worker().dispatch_due_reminders(now).await.unwrap(), 0);
    assert_eq!(
        service.reminders().tasks_for(&booking_id)[0].status,
        ReminderStatus::Fired
    );
    let sent = h.notifier.reminders();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].booking_id, booking_id);
    assert_eq!(
        sent[0].idempotency_key,
        reminder_key(booking_id, ReminderKind::Upcoming)
    );
}

// ── Properties ───────────────────────────────────────────────

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn n_concurrent_claims_one_winner() {
    let h = Harness::new();
    let service = h.open();
    let slot_id = publish(&service, Ulid::new(), NOW + DAY, NOW + DAY + H).await;

    let n = 64;
    let handles: Vec<_> = (0..n)
        .map(|_| {
            let engine = service.engine().clone();
            tokio::spawn(async move { engine.claim(slot_id, Ulid::new(), NOW).await })
        })
        .collect();
    let results: Vec<_> = join_all(handles)
        .await
        .into_iter()
        .map(|r| r.unwrap())
        .collect();

    assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 1);
    assert_eq!(
        results
            .iter()
            .filter(|r| matches!(r, Err(EngineError::Conflict(_))))
            .count(),
        n - 1
    );
    let slot = service.engine().slot(&slot_id).await.unwrap();
    assert_eq!(slot.status, SlotStatus::Booked);
    let bookings = service.engine().bookings_for_slot(&slot_id);
    assert_eq!(bookings.len(), 1);
    assert_eq!(bookings[0].status, BookingStatus::Pending);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn mixed_concurrent_operations_leave_no_partial_state() {
    let h = Harness::new();
    let service = h.open();
    let owner = Ulid::new();
    let mut slots = Vec::new();
    for i in 0..6 {
        let start = NOW + DAY + i * H;
        slots.push(publish(&service, owner, start, start + 30 * M).await);
    }

    let handles: Vec<_> = (0..48)
        .map(|i| {
            let engine = service.engine().clone();
            let slot_id = slots[i % slots.len()];
            tokio::spawn(async move {
                let student = Ulid::new();
                let Ok(b) = engine.claim(slot_id, student, NOW).await else {
                    return;
                };
                match i % 3 {
                    0 => {
                        let _ = engine
                            .transition(b.id, Action::Confirm, Actor::Professor(owner), NOW)
                            .await;
                        let _ = engine
                            .transition(b.id, Action::Cancel { reason: None }, Actor::Student(student), NOW)
                            .await;
                    }
                    1 => {
                        let _ = engine
                            .transition(b.id, Action::Cancel { reason: None }, Actor::Professor(owner), NOW)
                            .await;
                    }
                    _ => {
                        let _ = engine
                            .transition(b.id, Action::Confirm, Actor::Professor(owner), NOW)
                            .await;
                    }
                }
            })
        })
        .collect();
    for r in join_all(handles).await {
        r.unwrap();
    }

    let engine = service.engine();
    assert!(engine.audit().await.is_empty());
    for slot_id in &slots {
        let slot = engine.slot(slot_id).await.unwrap();
        let active = engine
            .bookings_for_slot(slot_id)
            .into_iter()
            .filter(|b| b.status.is_active())
            .count();
        match slot.status {
            SlotStatus::Booked => assert_eq!(active, 1),
            SlotStatus::Available => assert_eq!(active, 0),
            other => panic!("unexpected slot status {other:?}"),
        }
    }
}

#[tokio::test]
async fn failed_reschedule_keeps_student_booked() {
    let h = Harness::new();
    let service = h.open();
    let engine = service.engine();
    let owner = Ulid::new();
    let from = publish(&service, owner, NOW + DAY, NOW + DAY + H).await;
    let to = publish(&service, owner, NOW + 2 * DAY, NOW + 2 * DAY + H).await;

    let b = engine.claim(from, Ulid::new(), NOW).await.unwrap();
    let b = engine
        .transition(b.id, Action::Confirm, Actor::Professor(owner), NOW)
        .await
        .unwrap();
    engine.claim(to, Ulid::new(), NOW).await.unwrap();

    let err = assert_err!(
        engine
            .transition(
                b.id,
                Action::Reschedule { new_slot_id: to },
                Actor::Student(b.student_id),
                NOW,
            )
            .await
    );
    assert!(matches!(err, EngineError::Conflict(_)));
    assert_eq!(engine.booking(&b.id).unwrap(), b);
    let active: Vec<Booking> = engine
        .bookings_for_student(&b.student_id)
        .into_iter()
        .filter(|x| x.status.is_active())
        .collect();
    assert_eq!(active, vec![b]);
}

#[tokio::test]
async fn scheduling_a_reminder_twice_keeps_one() {
    let h = Harness::new();
    let service = h.open();
    let reminders = service.reminders();
    let booking_id = Ulid::new();

    assert_ok!(reminders.schedule(booking_id, NOW + H, NOW).await);
    assert_ok!(reminders.schedule(booking_id, NOW + 2 * H, NOW).await);
    let tasks = reminders.tasks_for(&booking_id);
    assert_eq!(tasks.len(), 1);
    assert_eq!(tasks[0].status, ReminderStatus::Scheduled);
    assert_eq!(tasks[0].fire_at, NOW + 2 * H);

    let first = reminders.drain(NOW + 2 * H).await.unwrap();
    let second = reminders.drain(NOW + 2 * H).await.unwrap();
    assert_eq!(first.len(), 1);
    assert!(second.is_empty());
}

#[tokio::test]
async fn reconcile_create_twice_creates_once() {
    let h = Harness::new();
    let service = h.open();
    let owner = Ulid::new();
    let slot_id = publish(&service, owner, NOW + DAY, NOW + DAY + H).await;
    let b = service.engine().claim(slot_id, Ulid::new(), NOW).await.unwrap();
    service
        .engine()
        .transition(b.id, Action::Confirm, Actor::Professor(owner), NOW)
        .await
        .unwrap();

    let calendar = service.calendar();
    assert_eq!(
        calendar.reconcile(b.id, SyncAction::Create).await.unwrap(),
        ReconcileOutcome::Applied
    );
    assert_eq!(
        calendar.reconcile(b.id, SyncAction::Create).await.unwrap(),
        ReconcileOutcome::NoOp
    );
    assert_eq!(h.calendar.creates(), 1);
    assert_eq!(
        calendar.state(&b.id).unwrap().external_event_id,
        Some(format!("cal-{}", b.id))
    );

    // The queued create is a no-op as well.
    drain_work(&service).await;
    assert_eq!(h.calendar.creates(), 1);
}

#[tokio::test]
async fn calendar_outage_never_touches_the_booking() {
    let h = Harness::new();
    h.calendar.down.store(true, std::sync::atomic::Ordering::SeqCst);
    let service = h.open();
    let owner = Ulid::new();
    let slot_id = publish(&service, owner, NOW + DAY, NOW + DAY + H).await;
    let b = service.engine().claim(slot_id, Ulid::new(), NOW).await.unwrap();
    service
        .engine()
        .transition(b.id, Action::Confirm, Actor::Professor(owner), NOW)
        .await
        .unwrap();

    for _ in 0..10 {
        drain_work(&service).await;
        h.clock.advance(10 * M);
    }

    let max_attempts = h.config.sync.max_attempts as usize;
    assert_eq!(h.calendar.creates(), max_attempts);
    let failed = service.calendar().failed_syncs();
    assert_eq!(failed.len(), 1);
    assert_eq!(failed[0].booking_id, b.id);
    assert!(failed[0].permanently_failed);
    assert_eq!(failed[0].external_event_id, None);

    assert_eq!(
        service.engine().booking(&b.id).unwrap().status,
        BookingStatus::Confirmed
    );
    assert!(service.queue().is_empty());
    assert_eq!(
        h.notifier.notices(b.id),
        vec![NoticeKind::Requested, NoticeKind::Confirmed]
    );
}

// ── Restart ──────────────────────────────────────────────────

#[tokio::test]
async fn queued_work_survives_restart() {
    let h = Harness::new();
    let owner = Ulid::new();
    let booking_id = {
        let service = h.open();
        let slot_id = publish(&service, owner, NOW + 2 * DAY, NOW + 2 * DAY + H).await;
        let b = service.engine().claim(slot_id, Ulid::new(), NOW).await.unwrap();
        service
            .engine()
            .transition(b.id, Action::Confirm, Actor::Professor(owner), NOW)
            .await
            .unwrap();
        assert_eq!(service.queue().len(), 4);
        b.id
    };
    assert_eq!(h.calendar.creates(), 0);

    let service = h.open();
    assert_eq!(service.queue().len(), 4);
    drain_work(&service).await;

    let record = service.booking_record(&booking_id).await.unwrap();
    assert_eq!(record.view.booking.status, BookingStatus::Confirmed);
    assert_eq!(record.reminders.len(), 1);
    assert!(record.calendar.unwrap().external_event_id.is_some());
    assert!(record.pending_work.is_empty());
    assert_eq!(h.calendar.creates(), 1);
    assert_eq!(
        h.notifier.notices(booking_id),
        vec![NoticeKind::Requested, NoticeKind::Confirmed]
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn background_pool_processes_work() {
    let mut h = Harness::new();
    h.config.workers = 3;
    h.config.worker_poll_interval = Duration::from_millis(10);
    h.config.drain_interval = Duration::from_millis(10);
    let service = h.open();
    service.start();

    let owner = Ulid::new();
    let slot_id = publish(&service, owner, NOW + DAY, NOW + DAY + H).await;
    let b = service.engine().claim(slot_id, Ulid::new(), NOW).await.unwrap();
    service
        .engine()
        .transition(b.id, Action::Confirm, Actor::Professor(owner), NOW)
        .await
        .unwrap();

    let settled = tokio::time::timeout(Duration::from_secs(5), async {
        while !service.queue().is_empty() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await;
    assert_ok!(settled);
    assert_eq!(h.calendar.creates(), 1);
    assert_eq!(service.reminders().tasks_for(&b.id).len(), 1);

    service.shutdown().await;
}

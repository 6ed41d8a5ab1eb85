//! End-to-end scheduling scenarios over a silent sink.

#![allow(clippy::unwrap_used, clippy::expect_used)]

mod common;

use common::{Harness, Stubborn, ToneSynth, Work, sleep_ms, test_config};
use murmur::config::{PreemptAction, PreemptionRule};
use murmur::speech::{ChannelReplies, Synthesizer};
use murmur::task::Task;
use murmur::tasks::{ClipTask, ConversationTask, PlaylistTask};
use murmur::{SchedulerEvent, TaskKind, TaskState};
use std::sync::Arc;
use std::time::Duration;

const LONG_TRACK: Duration = Duration::from_secs(30);

fn playlist() -> Task {
    Task::new("playlist", 1, PlaylistTask::new())
}

#[tokio::test(flavor = "multi_thread")]
async fn chime_pauses_playlist_and_resumes_at_same_offset() {
    let h = Harness::start(&[LONG_TRACK]);
    let music = h.handle.enqueue(playlist()).unwrap();
    music.wait_for(|s| s == TaskState::Running).await;
    sleep_ms(300).await;

    let chime_path = h.clip("chime.wav", Duration::from_millis(120));
    let was_active = h.handle.sink_snapshot().active_before_transient;
    assert!(was_active);
    let chime = h
        .handle
        .enqueue(Task::new("chime", 5, ClipTask::new(&chime_path, was_active)))
        .unwrap();

    music.wait_for(|s| s == TaskState::Paused).await;
    assert_eq!(chime.finished().await, TaskState::Completed);
    music.wait_for(|s| s == TaskState::Running).await;
    sleep_ms(100).await;

    let starts = h.starts_of(&h.tracks[0]);
    assert_eq!(starts[0], Duration::ZERO);
    let resumed_at = *starts.last().unwrap();
    assert!(starts.len() >= 2, "playlist restarted after the chime: {starts:?}");
    assert!(
        resumed_at >= Duration::from_millis(250) && resumed_at < Duration::from_millis(800),
        "resumed at {resumed_at:?}"
    );
    assert!(h.handle.sink_snapshot().is_playing);

    let events = h.events();
    assert!(events.iter().any(|e| matches!(
        e,
        SchedulerEvent::Preempted { action: PreemptAction::Suspend, victim, .. } if victim.id == music.id()
    )));
    assert!(events.iter().any(|e| matches!(e, SchedulerEvent::Resumed { task } if task.id == music.id())));
    h.handle.shutdown().unwrap();
}

fn conversation(h: &Harness, synth: Arc<ToneSynth>, text: &str) -> Task {
    let (tx, replies) = ChannelReplies::new(4);
    tx.try_send(Ok(text.to_owned())).unwrap();
    drop(tx);
    let was_active = h.handle.sink_snapshot().active_before_transient;
    let body = ConversationTask::new(replies, synth as Arc<dyn Synthesizer>, was_active);
    Task::new("conversation", 3, body)
}

#[tokio::test(flavor = "multi_thread")]
async fn conversation_cancels_playlist_by_default() {
    let h = Harness::start(&[LONG_TRACK]);
    let synth = ToneSynth::new(h.dir.path(), Duration::from_millis(80));
    let music = h.handle.enqueue(playlist()).unwrap();
    music.wait_for(|s| s == TaskState::Running).await;
    sleep_ms(50).await;

    let chat = h.handle.enqueue(conversation(&h, synth, "Hello there.")).unwrap();
    assert_eq!(music.finished().await, TaskState::Cancelled);
    assert_eq!(chat.finished().await, TaskState::Completed);
    sleep_ms(100).await;

    let snap = h.handle.snapshot().await.unwrap();
    assert!(snap.running.is_none());
    assert!(snap.paused.is_empty());
    assert!(!snap.sink.is_playing, "conversation does not restart music by default");
    h.handle.shutdown().unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn conversation_suspends_playlist_when_configured() {
    let mut config = test_config();
    config.preemption.rules = vec![PreemptionRule {
        preemptor: TaskKind::Conversation,
        victim: TaskKind::Playlist,
        action: PreemptAction::Suspend,
    }];
    let h = Harness::with_config(&[LONG_TRACK], config);
    let synth = ToneSynth::new(h.dir.path(), Duration::from_millis(80));
    let music = h.handle.enqueue(playlist()).unwrap();
    music.wait_for(|s| s == TaskState::Running).await;
    sleep_ms(200).await;

    let chat = h.handle.enqueue(conversation(&h, synth, "Hello there.")).unwrap();
    music.wait_for(|s| s == TaskState::Paused).await;
    assert_eq!(chat.finished().await, TaskState::Completed);
    music.wait_for(|s| s == TaskState::Running).await;
    sleep_ms(100).await;

    assert!(h.handle.sink_snapshot().is_playing);
    let resumed_at = *h.starts_of(&h.tracks[0]).last().unwrap();
    assert!(resumed_at >= Duration::from_millis(150), "resumed at {resumed_at:?}");
    h.handle.shutdown().unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn cancelling_a_queued_task_leaves_running_alone() {
    let h = Harness::start(&[LONG_TRACK]);
    let busy = h
        .handle
        .enqueue(Task::new("busy", 5, Work { resumable: true, work: Duration::from_secs(30) }))
        .unwrap();
    busy.wait_for(|s| s == TaskState::Running).await;
    let waiting = h
        .handle
        .enqueue(Task::new("waiting", 2, Work { resumable: false, work: Duration::from_secs(1) }))
        .unwrap();
    sleep_ms(50).await;

    h.handle.cancel_task(waiting.id()).unwrap();
    sleep_ms(50).await;

    assert_eq!(waiting.state(), TaskState::Cancelled);
    assert_eq!(busy.state(), TaskState::Running);
    let snap = h.handle.snapshot().await.unwrap();
    assert!(snap.queued.is_empty());
    assert_eq!(snap.running.unwrap().meta.id, busy.id());

    let events = h.events();
    assert!(events.iter().any(|e| matches!(e, SchedulerEvent::Removed { task } if task.id == waiting.id())));
    assert!(!events.iter().any(|e| matches!(e, SchedulerEvent::Started { task } if task.id == waiting.id())));
    assert!(!events.iter().any(|e| matches!(e, SchedulerEvent::Paused { task } if task.id == busy.id())));
    h.handle.shutdown().unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn clip_does_not_start_idle_playlist() {
    let h = Harness::start(&[LONG_TRACK]);
    let chime_path = h.clip("chime.wav", Duration::from_millis(100));
    let was_active = h.handle.sink_snapshot().active_before_transient;
    assert!(!was_active);

    let chime = h
        .handle
        .enqueue(Task::new("chime", 5, ClipTask::new(&chime_path, was_active)))
        .unwrap();
    assert_eq!(chime.finished().await, TaskState::Completed);
    sleep_ms(100).await;

    assert!(h.starts_of(&h.tracks[0]).is_empty());
    let sink = h.handle.sink_snapshot();
    assert!(!sink.is_playing);
    assert!(!sink.playlist_active);
    h.handle.shutdown().unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn equal_priorities_run_in_arrival_order() {
    let h = Harness::start(&[LONG_TRACK]);
    let gate = h
        .handle
        .enqueue(Task::new("gate", 9, Work { resumable: false, work: Duration::from_millis(60) }))
        .unwrap();
    let a = h
        .handle
        .enqueue(Task::new("a", 4, Work { resumable: false, work: Duration::from_millis(30) }))
        .unwrap();
    let b = h
        .handle
        .enqueue(Task::new("b", 4, Work { resumable: false, work: Duration::from_millis(30) }))
        .unwrap();
    gate.finished().await;
    a.finished().await;
    b.finished().await;

    let started: Vec<String> = h
        .events()
        .into_iter()
        .filter_map(|e| match e {
            SchedulerEvent::Started { task } => Some(task.name),
            _ => None,
        })
        .collect();
    assert_eq!(started, vec!["gate", "a", "b"]);
    h.handle.shutdown().unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn paused_stack_resumes_lifo_with_offset_intact() {
    let h = Harness::start(&[LONG_TRACK]);
    let music = h.handle.enqueue(playlist()).unwrap();
    music.wait_for(|s| s == TaskState::Running).await;
    sleep_ms(200).await;

    let middle = h
        .handle
        .enqueue(Task::new("middle", 3, Work { resumable: true, work: Duration::from_millis(150) }))
        .unwrap();
    music.wait_for(|s| s == TaskState::Paused).await;
    middle.wait_for(|s| s == TaskState::Running).await;
    sleep_ms(40).await;

    let top = h
        .handle
        .enqueue(Task::new("top", 6, Work { resumable: false, work: Duration::from_millis(80) }))
        .unwrap();
    middle.wait_for(|s| s == TaskState::Paused).await;
    let snap = h.handle.snapshot().await.unwrap();
    let stack: Vec<_> = snap.paused.iter().map(|v| v.meta.id).collect();
    assert_eq!(stack, vec![music.id(), middle.id()]);

    assert_eq!(top.finished().await, TaskState::Completed);
    middle.wait_for(|s| s == TaskState::Running).await;
    assert_eq!(music.state(), TaskState::Paused);
    assert_eq!(middle.finished().await, TaskState::Completed);
    music.wait_for(|s| s == TaskState::Running).await;
    sleep_ms(80).await;

    let starts = h.starts_of(&h.tracks[0]);
    let resumed_at = *starts.last().unwrap();
    assert!(starts.len() >= 2);
    assert!(
        resumed_at >= Duration::from_millis(150) && resumed_at < Duration::from_millis(600),
        "resumed at {resumed_at:?}"
    );

    let resumed: Vec<_> = h
        .events()
        .into_iter()
        .filter_map(|e| match e {
            SchedulerEvent::Resumed { task } => Some(task.name),
            _ => None,
        })
        .collect();
    assert_eq!(resumed, vec!["middle", "playlist"]);
    h.handle.shutdown().unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn double_cancel_is_idempotent() {
    let h = Harness::start(&[LONG_TRACK]);
    let task = h
        .handle
        .enqueue(Task::new("victim", 2, Work { resumable: true, work: Duration::from_secs(30) }))
        .unwrap();
    task.wait_for(|s| s == TaskState::Running).await;

    h.handle.cancel_task(task.id()).unwrap();
    h.handle.cancel_task(task.id()).unwrap();
    assert_eq!(task.finished().await, TaskState::Cancelled);
    sleep_ms(80).await;

    let finished = h
        .events()
        .into_iter()
        .filter(|e| matches!(e, SchedulerEvent::Finished { task: t, .. } if t.id == task.id()))
        .count();
    assert_eq!(finished, 1);
    let snap = h.handle.snapshot().await.unwrap();
    assert_eq!(snap.history.iter().filter(|r| r.task_id == task.id()).count(), 1);
    assert_eq!(task.state(), TaskState::Cancelled);
    h.handle.shutdown().unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn one_running_task_and_only_resumable_ones_paused() {
    let h = Harness::start(&[LONG_TRACK]);
    let mut handles = vec![h.handle.enqueue(playlist()).unwrap()];
    for (i, priority) in [2, 4, 3, 7, 5, 7, 6].into_iter().enumerate() {
        let work = Work {
            resumable: i % 2 == 0,
            work: Duration::from_millis(40),
        };
        handles.push(h.handle.enqueue(Task::new(format!("t{i}"), priority, work)).unwrap());
        sleep_ms(15).await;
    }
    for handle in &handles[1..] {
        tokio::time::timeout(Duration::from_secs(5), handle.finished())
            .await
            .unwrap();
    }
    sleep_ms(50).await;

    let mut running = 0i32;
    for event in h.events() {
        match event {
            SchedulerEvent::Started { .. } | SchedulerEvent::Resumed { .. } => running += 1,
            SchedulerEvent::Paused { task } => {
                assert!(task.resumable, "{} paused but not resumable", task.name);
                running -= 1;
            }
            SchedulerEvent::Finished { .. } => running -= 1,
            _ => {}
        }
        assert!(running <= 1, "more than one task running");
    }
    for handle in &handles[1..] {
        let state = handle.state();
        assert!(state.is_terminal());
        if !handle.meta().resumable {
            assert_ne!(state, TaskState::Paused);
        }
    }
    h.handle.shutdown().unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn aborting_a_stubborn_task_does_not_silence_the_resumed_playlist() {
    let h = Harness::start(&[LONG_TRACK]);
    let music = h.handle.enqueue(playlist()).unwrap();
    music.wait_for(|s| s == TaskState::Running).await;
    sleep_ms(100).await;

    let stubborn = h.handle.enqueue(Task::new("stubborn", 5, Stubborn)).unwrap();
    music.wait_for(|s| s == TaskState::Paused).await;
    stubborn.wait_for(|s| s == TaskState::Running).await;

    h.handle.cancel_task(stubborn.id()).unwrap();
    music.wait_for(|s| s == TaskState::Running).await;
    sleep_ms(100).await;
    assert!(h.handle.sink_snapshot().is_playing);

    // Past the cancel grace the stubborn body has been aborted.
    sleep_ms(400).await;
    assert_eq!(stubborn.state(), TaskState::Cancelled);
    assert_eq!(music.state(), TaskState::Running);
    let sink = h.handle.sink_snapshot();
    assert!(sink.is_playing, "resumed playlist was silenced: {sink:?}");
    assert!(sink.playlist_active);
    h.handle.shutdown().unwrap();
}

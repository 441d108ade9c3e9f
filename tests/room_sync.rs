//! End-to-end behaviour of rooms through the public API

use std::io;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use parking_lot::Mutex;
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tokio::time;
use tokio_test::{assert_err, assert_ok};
use tracing_subscriber::EnvFilter;

use roomsync::config::RegistryConfig;
use roomsync::storage::MovieBase;
use roomsync::{
    BroadcastOptions, Error, MemoryStorage, MessageSink, OutboundMessage, Permissions, Room,
    RoomSettings, SyncConfig, SyncContext, User,
};

/// Log output for a failing test: `RUST_LOG=roomsync=debug cargo test`
fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn context() -> SyncContext {
    init_tracing();
    SyncContext::new(SyncConfig::default(), Arc::new(MemoryStorage::new()))
}

fn movie(name: &str) -> MovieBase {
    MovieBase {
        name: name.to_string(),
        url: format!("https://cdn.example/{name}.m3u8"),
        media_type: "m3u8".to_string(),
        ..Default::default()
    }
}

async fn next_json(frames: &mut mpsc::Receiver<Bytes>) -> Value {
    let frame = time::timeout(Duration::from_secs(1), frames.recv())
        .await
        .expect("timed out waiting for a frame")
        .expect("connection closed");
    serde_json::from_slice(&frame).unwrap()
}

async fn next_of(frames: &mut mpsc::Receiver<Bytes>, kind: &str) -> Value {
    loop {
        let value = next_json(frames).await;
        if value["type"] == kind {
            return value;
        }
    }
}

struct Member {
    user: Arc<User>,
    client: Arc<roomsync::Client>,
    frames: mpsc::Receiver<Bytes>,
}

async fn connect(ctx: &SyncContext, room: &Room, name: &str, permissions: Permissions) -> Member {
    let user = ctx
        .create_user(room.id(), name, None, permissions)
        .await
        .unwrap();
    let (sink, frames) = mpsc::channel(64);
    let client = room.join(&user, sink).await.unwrap();
    Member {
        user,
        client,
        frames,
    }
}

/// Sink that records every frame it is given
#[derive(Clone, Default)]
struct Recorder {
    frames: Arc<Mutex<Vec<Bytes>>>,
}

impl MessageSink for Recorder {
    async fn send(&mut self, frame: Bytes) -> io::Result<()> {
        self.frames.lock().push(frame);
        Ok(())
    }
}

#[tokio::test]
async fn status_from_one_member_reaches_the_others() {
    let ctx = context();
    let room = ctx
        .create_room("movie night", None, RoomSettings::default())
        .await
        .unwrap();
    let m = room.add_movie("host", movie("feature")).await.unwrap();
    room.set_current_movie(&m.id, false).await.unwrap();

    let mut a = connect(&ctx, &room, "a", Permissions::MEMBER).await;
    let mut b = connect(&ctx, &room, "b", Permissions::MEMBER).await;
    let mut c = connect(&ctx, &room, "c", Permissions::MEMBER).await;

    let frame = br#"{"type":"status","is_playing":true,"current_time":100.0,"rate":1.0,"time_diff":0.5}"#;
    assert_ok!(room.handle_frame(&a.client, &a.user, frame).await);

    for member in [&mut b, &mut c] {
        let status = next_of(&mut member.frames, "status").await;
        assert_eq!(status["status"]["current_time"], json!(100.5));
        assert_eq!(status["status"]["is_playing"], json!(true));
    }

    // The sender only gets its join snapshot and the sync reply
    assert_ok!(
        room.handle_frame(&a.client, &a.user, br#"{"type":"sync"}"#)
            .await
    );
    let mut currents = 0;
    while currents < 2 {
        let value = next_json(&mut a.frames).await;
        assert_ne!(value["type"], "status");
        if value["type"] == "current" {
            currents += 1;
        }
    }
}

#[tokio::test]
async fn broadcasts_arrive_in_order() {
    let ctx = context();
    let room = ctx
        .create_room("ordered", None, RoomSettings::default())
        .await
        .unwrap();
    let user = ctx
        .create_user(room.id(), "viewer", None, Permissions::MEMBER)
        .await
        .unwrap();

    let recorder = Recorder::default();
    let client = room.join(&user, recorder.clone()).await.unwrap();

    for i in 0..50 {
        room.hub()
            .broadcast(OutboundMessage::Movies { count: i }, BroadcastOptions::new())
            .await
            .unwrap();
    }

    let counts = time::timeout(Duration::from_secs(1), async {
        loop {
            let counts: Vec<u64> = recorder
                .frames
                .lock()
                .iter()
                .filter_map(|f| serde_json::from_slice::<Value>(f).ok())
                .filter(|v| v["type"] == "movies")
                .filter_map(|v| v["count"].as_u64())
                .collect();
            if counts.len() == 50 {
                return counts;
            }
            time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap();

    assert_eq!(counts, (0..50).collect::<Vec<u64>>());
    assert!(!client.is_closed());
}

#[tokio::test]
async fn password_change_expires_credentials_and_connections() {
    let ctx = context();
    let room = ctx
        .create_room("private", Some("door"), RoomSettings::default())
        .await
        .unwrap();
    let mut member = connect(&ctx, &room, "bob", Permissions::MEMBER).await;
    let creds = ctx
        .issue_credentials(member.user.id(), "", Some("door"))
        .await
        .unwrap();

    let (authed_room, _) = ctx.authorize(&creds).await.unwrap();
    assert!(Arc::ptr_eq(&authed_room, &room));

    ctx.set_room_password(room.id(), Some("new door"))
        .await
        .unwrap();

    next_of(&mut member.frames, "expired").await;
    assert!(member.client.is_closed());
    assert!(matches!(
        ctx.authorize(&creds).await,
        Err(Error::StaleVersion)
    ));
    assert_err!(room.check_version(creds.room_version));
}

#[tokio::test]
async fn live_movie_ignores_seek_and_pause() {
    let ctx = context();
    let room = ctx
        .create_room("stream", None, RoomSettings::default())
        .await
        .unwrap();
    let live = MovieBase {
        name: "camera".into(),
        is_live: true,
        rtmp_source: true,
        ..Default::default()
    };
    let m = room.add_movie("host", live).await.unwrap();
    room.set_current_movie(&m.id, false).await.unwrap();

    for status in [
        room.set_status(false, 500.0, 2.0, 1.0).await.unwrap(),
        room.set_seek(90.0, 0.3).await.unwrap(),
        room.set_seek_rate(12.0, 0.5, 0.0).await.unwrap(),
    ] {
        assert!(status.is_playing);
        assert_eq!(status.rate, 1.0);
        assert_eq!(status.current_time, 0.0);
    }
}

#[tokio::test]
async fn paging_and_reordering() {
    let ctx = context();
    let room = ctx
        .create_room("playlist", None, RoomSettings::default())
        .await
        .unwrap();
    let added = room
        .add_movies("host", (1..=5).map(|i| movie(&format!("ep{i}"))).collect())
        .await
        .unwrap();

    room.swap_movies(&added[0].id, &added[4].id).await.unwrap();
    let (total, page) = room.movies_page(1, 2).await.unwrap();
    assert_eq!(total, 5);
    let names: Vec<_> = page.iter().map(|m| m.base.name.as_str()).collect();
    assert_eq!(names, ["ep5", "ep2"]);

    room.clear_movies().await.unwrap();
    assert_eq!(room.movie_count().await.unwrap(), 0);
}

#[tokio::test]
async fn close_is_idempotent_and_ends_connections() {
    let ctx = context();
    let room = ctx
        .create_room("short lived", None, RoomSettings::default())
        .await
        .unwrap();
    let mut member = connect(&ctx, &room, "bob", Permissions::MEMBER).await;

    assert_ok!(room.close().await);
    assert!(room.close().await.unwrap_err().is_closed());
    assert!(room.hub().close().unwrap_err().is_closed());
    assert!(member.client.close().is_err());

    // Writer drains what was queued, then drops the connection
    while time::timeout(Duration::from_secs(1), member.frames.recv())
        .await
        .unwrap()
        .is_some()
    {}
}

#[tokio::test(start_paused = true)]
async fn idle_rooms_are_evicted_but_busy_ones_stay() {
    let config = SyncConfig::default().rooms(
        RegistryConfig::default()
            .ttl(Duration::from_secs(30))
            .sweep_interval(Duration::from_secs(5)),
    );
    init_tracing();
    let ctx = SyncContext::new(config, Arc::new(MemoryStorage::new()));
    ctx.start();

    let idle = ctx
        .create_room("idle", None, RoomSettings::default())
        .await
        .unwrap();
    let busy = ctx
        .create_room("busy", None, RoomSettings::default())
        .await
        .unwrap();

    for _ in 0..10 {
        time::sleep(Duration::from_secs(5)).await;
        ctx.load_or_init_room(busy.id()).await.unwrap();
    }

    assert!(idle.is_closed());
    assert!(ctx.room(idle.id()).is_none());
    assert!(!busy.is_closed());
    assert!(Arc::ptr_eq(&ctx.room(busy.id()).unwrap(), &busy));

    ctx.shutdown().await;
    assert!(busy.is_closed());
}

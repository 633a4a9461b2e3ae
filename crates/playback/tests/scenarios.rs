//! End-to-end scenarios against the public API.
//!
//! Tests touching a real GStreamer installation (and media files) are
//! `#[ignore]`d so the suite stays green on machines without the plugins;
//! run them with `cargo test -- --ignored` and a `PLAYBACK_TEST_FILE`
//! pointing at a 10 s 1920x1080 30 fps progressive clip.

use std::sync::Arc;
use std::time::{Duration, Instant};

use playback::{MediaPlayer, PlayerRegistry, DISCOVER_TIMEOUT};

fn init_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "playback=debug".into()),
        )
        .try_init();
}

fn tick_until(player: &mut MediaPlayer, deadline: Duration, done: impl Fn(&MediaPlayer) -> bool) {
    let start = Instant::now();
    while start.elapsed() < deadline && !done(player) {
        player.update(None);
        std::thread::sleep(Duration::from_millis(10));
    }
}

#[test]
fn invalid_locator_fails_before_discovery() {
    let registry = PlayerRegistry::new();
    let mut player = MediaPlayer::new(Arc::clone(&registry));
    player.open("");
    assert!(player.failed());
    assert!(!player.log().is_empty());
    // Nothing was registered for a locator that never reached discovery.
    assert_eq!(registry.live_players(), 0);
}

#[test]
fn close_before_open_does_nothing() {
    let registry = PlayerRegistry::new();
    let mut player = MediaPlayer::new(registry);
    player.close();
    player.close();
    assert!(!player.is_open());
    assert!(!player.failed());
}

#[test]
fn fresh_player_has_neutral_defaults() {
    let registry = PlayerRegistry::new();
    let player = MediaPlayer::new(registry);
    assert!(!player.is_playing());
    assert!(!player.valid());
    assert_eq!(player.play_speed(), 1.0);
    assert!(player.texture().is_none());
    assert!(player.media_info().is_none());
}

#[test]
#[ignore = "needs GStreamer and PLAYBACK_TEST_FILE (10s 1920x1080 30fps progressive)"]
fn probe_progressive_source_reports_metadata() {
    init_logging();
    let path = std::env::var("PLAYBACK_TEST_FILE").expect("PLAYBACK_TEST_FILE not set");
    let registry = PlayerRegistry::new();
    let mut player = MediaPlayer::new(registry);
    player.open(&path);
    tick_until(&mut player, DISCOVER_TIMEOUT + Duration::from_secs(2), |p| {
        p.valid() || p.failed()
    });
    assert!(player.valid(), "log: {}", player.log());
    assert_eq!(player.width(), 1920);
    assert_eq!(player.height(), 1080);
    assert_eq!(player.frame_rate(), 30.0);
    let info = player.media_info().unwrap();
    assert!(info.seekable);
    assert!(!info.is_image);
    player.close();
}

#[test]
#[ignore = "needs GStreamer"]
fn missing_file_fails_within_one_discovery_timeout() {
    init_logging();
    let registry = PlayerRegistry::new();
    let mut player = MediaPlayer::new(registry);
    player.open("/definitely/not/here.mp4");
    let start = Instant::now();
    tick_until(&mut player, DISCOVER_TIMEOUT + Duration::from_secs(2), |p| {
        p.failed()
    });
    assert!(player.failed());
    assert!(start.elapsed() <= DISCOVER_TIMEOUT + Duration::from_secs(2));
    assert!(!player.log().is_empty());
    player.close();
}

#[test]
#[ignore = "needs GStreamer"]
fn burst_of_opens_never_exceeds_two_concurrent_probes() {
    // Discovery of a missing file still takes a moment; opening many players
    // at once must funnel through the two probe lanes without deadlocking.
    let registry = PlayerRegistry::new();
    let mut players: Vec<MediaPlayer> = (0..6)
        .map(|i| {
            let mut p = MediaPlayer::new(Arc::clone(&registry));
            p.open(&format!("/nope/clip-{i}.mp4"));
            p
        })
        .collect();
    let deadline = Instant::now() + 4 * DISCOVER_TIMEOUT;
    while Instant::now() < deadline && !players.iter().all(|p| p.failed()) {
        for p in &mut players {
            p.update(None);
        }
        std::thread::sleep(Duration::from_millis(20));
    }
    assert!(players.iter().all(|p| p.failed()));
    for p in &mut players {
        p.close();
    }
}

//! End-to-end tests: bootstrap, live sync and recovery through the client.

use std::sync::Arc;
use std::time::Duration;

use streamsync::core::notify::recording::Notification;
use streamsync::state::decrypt::memory::PassthroughDecryptor;
use streamsync::store::{Persistence, SqliteStore};
use streamsync::sync::transport::memory::{ScriptedTransport, TransportCall};
use streamsync::sync::{StreamUpdate, SyncError, SyncOp};
use streamsync::{ClientConfig, StreamListener, SyncClient, SyncCookie, SyncState};
use streamsync_testkit::fixtures::{self, TestFixture};

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_max_level(tracing::Level::DEBUG)
        .try_init();
}

fn client(fixture: &TestFixture) -> SyncClient<ScriptedTransport> {
    SyncClient::builder(
        Arc::clone(&fixture.transport),
        Arc::clone(&fixture.store) as Arc<dyn Persistence>,
    )
    .listener(Arc::clone(&fixture.listener) as Arc<dyn StreamListener>)
    .decryptor(Arc::new(PassthroughDecryptor::new()))
    .user(fixtures::user(1))
    .build()
}

async fn wait_for_state(
    client: &SyncClient<ScriptedTransport>,
    target: SyncState,
) -> anyhow::Result<()> {
    let mut rx = client.registry().subscribe_state();
    tokio::time::timeout(Duration::from_secs(600), rx.wait_for(|s| *s == target)).await??;
    Ok(())
}

/// Let spawned tasks drain without reaching any real timer.
async fn settle() {
    tokio::time::sleep(Duration::from_millis(10)).await;
}

#[tokio::test(start_paused = true)]
async fn bootstrap_then_live_sync() -> anyhow::Result<()> {
    init_tracing();
    let f = TestFixture::new();
    let me = fixtures::user(1);
    let own = fixtures::user_stream(&me);
    let space = fixtures::space(2);
    let channel = fixtures::channel(&space, "general");

    f.seed_stream(fixtures::snapshot(own, 3, &[me])).await;
    f.seed_stream(fixtures::snapshot(channel, 1, &[me])).await;
    f.serve_stream(fixtures::snapshot(space, 2, &[me, fixtures::user(2)]));

    let client = client(&f);
    client.init_streams(vec![space, channel, own], vec![channel])?;
    client.request_sync();
    client.start_bootstrap()?;
    client.wait_bootstrapped().await;
    wait_for_state(&client, SyncState::Syncing).await?;

    // Flagged channel first, then the rest by priority.
    assert_eq!(f.store.loads(), vec![channel, own, space]);
    assert_eq!(
        f.transport.count(|c| matches!(c, TransportCall::GetStream(_))),
        1
    );
    let counters = client.load_counters();
    assert_eq!(counters.loaded_from_cache, 2);
    assert_eq!(counters.loaded_from_network, 1);
    assert_eq!(client.init_status().progress, 1.0);

    let cookies = &f.transport.start_calls()[0];
    assert_eq!(cookies.len(), 3);
    assert!(cookies.contains(&SyncCookie::new(own, 3)));
    assert!(cookies.contains(&SyncCookie::new(channel, 1)));
    assert!(cookies.contains(&SyncCookie::new(space, 2)));

    let carol = fixtures::user(3);
    f.transport
        .push(SyncOp::Update(StreamUpdate {
            next_cookie: SyncCookie::new(space, 3),
            reset: None,
            events: Vec::new(),
            miniblock: Some(fixtures::miniblock(
                3,
                vec![fixtures::join(carol), fixtures::display_name(carol, "carol")],
            )),
        }))
        .await;
    settle().await;

    let members = client.members(&space).await?;
    assert_eq!(members.len(), 3);
    let carol_member = members.iter().find(|m| m.user_id == carol).unwrap();
    assert_eq!(carol_member.display_name.as_deref(), Some("carol"));
    assert_eq!(
        f.listener
            .count(|n| matches!(n, Notification::NewUserJoined(s, u) if *s == space && *u == carol)),
        1
    );
    let saved = f.store.inner().load_stream(&space).await?.unwrap();
    assert_eq!(saved.sync_cookie(), &SyncCookie::new(space, 3));

    client.stop().await;
    assert_eq!(client.sync_state(), SyncState::NotSyncing);
    assert_eq!(client.registry().size().await, 0);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn connection_loss_resumes_from_latest_cookies() -> anyhow::Result<()> {
    init_tracing();
    let f = TestFixture::new();
    let space = fixtures::space(2);
    let other = fixtures::space(3);
    f.seed_stream(fixtures::snapshot(space, 5, &[])).await;
    f.seed_stream(fixtures::snapshot(other, 1, &[])).await;

    let client = client(&f);
    client.init_streams(vec![space, other], vec![])?;
    client.request_sync();
    client.start_bootstrap()?;
    wait_for_state(&client, SyncState::Syncing).await?;

    f.transport
        .push(SyncOp::Update(StreamUpdate::heartbeat(
            SyncCookie::new(space, 6).with_minipool_gen(1),
        )))
        .await;
    settle().await;

    f.transport
        .fail_connection(SyncError::Transport("connection reset".into()))
        .await;
    wait_for_state(&client, SyncState::Retrying).await?;
    assert_eq!(client.registry().retry_count(), 1);
    wait_for_state(&client, SyncState::Syncing).await?;

    let starts = f.transport.start_calls();
    assert_eq!(starts.len(), 2);
    assert!(starts[1].contains(&SyncCookie::new(space, 6).with_minipool_gen(1)));
    assert!(starts[1].contains(&SyncCookie::new(other, 1)));

    client.stop().await;
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn fetched_stream_joins_live_subscription() -> anyhow::Result<()> {
    init_tracing();
    let f = TestFixture::new();
    let client = client(&f);
    client.init_streams(vec![], vec![])?;
    client.request_sync();
    client.start_bootstrap()?;
    wait_for_state(&client, SyncState::Syncing).await?;
    let sync_id = client.registry().sync_id().unwrap();

    let space = fixtures::space(9);
    f.serve_stream(fixtures::snapshot(space, 4, &[fixtures::user(5)]));
    let view = client.fetch_stream(space).await?;
    assert_eq!(view.lock().await.miniblock_num(), 4);

    assert!(f.transport.calls().contains(&TransportCall::AddToSubscription(
        sync_id,
        SyncCookie::new(space, 4)
    )));
    assert_eq!(f.store.saves(), vec![space]);

    // A second fetch is served from the registry.
    client.fetch_stream(space).await?;
    assert_eq!(
        f.transport.count(|c| matches!(c, TransportCall::GetStream(_))),
        1
    );

    client.remove_stream(&space).await?;
    assert!(client.stream(&space).await.is_none());
    assert!(matches!(
        client.members(&space).await,
        Err(streamsync::ClientError::StreamNotFound(_))
    ));

    client.stop().await;
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn persistence_failures_fall_back_to_network() -> anyhow::Result<()> {
    init_tracing();
    let f = TestFixture::new();
    let space = fixtures::space(2);
    let missing = fixtures::space(4);
    f.seed_stream(fixtures::snapshot(space, 1, &[])).await;
    f.store.fail_loads_for(space);
    f.serve_stream(fixtures::snapshot(space, 7, &[]));
    f.transport.set_missing(missing);

    let client = client(&f);
    client.init_streams(vec![space, missing], vec![])?;
    client.start_bootstrap()?;
    client.wait_bootstrapped().await;

    let counters = client.load_counters();
    assert_eq!(counters.requires_network, 2);
    assert_eq!(counters.loaded_from_network, 1);
    assert_eq!(counters.failed, 1);

    let status = client.init_status();
    assert_eq!(status.progress, 1.0);
    assert!(status.is_remote_data_loaded);

    let view = client.stream(&space).await.unwrap();
    assert_eq!(view.lock().await.miniblock_num(), 7);
    assert!(client.stream(&missing).await.is_none());
    // Nobody asked for sync.
    assert_eq!(client.sync_state(), SyncState::NotSyncing);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn unauthorized_start_leaves_client_idle() -> anyhow::Result<()> {
    init_tracing();
    let f = TestFixture::new();
    f.transport
        .fail_next_start(SyncError::Unauthorized("account banned".into()));

    let client = client(&f);
    client.init_streams(vec![], vec![])?;
    client.request_sync();
    client.start_bootstrap()?;
    client.wait_bootstrapped().await;

    for _ in 0..100 {
        if f.listener.sync_states().len() == 3 {
            break;
        }
        settle().await;
    }
    assert_eq!(
        f.listener.sync_states(),
        vec![
            SyncState::Starting,
            SyncState::Canceling,
            SyncState::NotSyncing
        ]
    );
    assert_eq!(client.sync_state(), SyncState::NotSyncing);
    Ok(())
}

#[tokio::test]
async fn sqlite_store_survives_restart() -> anyhow::Result<()> {
    init_tracing();
    let dir = tempfile::tempdir()?;
    let path = dir.path().join("streams.db");
    let space = fixtures::space(2);

    {
        let f = TestFixture::new();
        f.serve_stream(fixtures::snapshot(space, 3, &[fixtures::user(1)]));
        let store = Arc::new(SqliteStore::open(&path)?);
        let client = SyncClient::new(Arc::clone(&f.transport), store, ClientConfig::default());
        client.fetch_stream(space).await?;
        client.stop().await;
    }

    let f = TestFixture::new();
    let store = Arc::new(SqliteStore::open(&path)?);
    let client = SyncClient::new(Arc::clone(&f.transport), store, ClientConfig::default());
    client.init_streams(vec![space], vec![])?;
    client.start_bootstrap()?;
    client.wait_bootstrapped().await;

    assert_eq!(client.load_counters().loaded_from_cache, 1);
    assert!(f.transport.calls().is_empty());
    let members = client.members(&space).await?;
    assert_eq!(members.len(), 1);
    assert_eq!(members[0].user_id, fixtures::user(1));
    Ok(())
}

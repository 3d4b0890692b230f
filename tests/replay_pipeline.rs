//! End-to-end: recording on disk -> backend selection -> entries -> saved run

use deepcapture_rs::capture::Capture;
use deepcapture_rs::config::{BackendPreference, Config};
use deepcapture_rs::entry::BodyEncoding;
use deepcapture_rs::recorder::{Recorder, RunStore};
use deepcapture_rs::replay::Replay;
use deepcapture_rs::sink::{CapturedEntry, ChannelSink};
use std::sync::Arc;
use tempfile::TempDir;

const MIXED_RECORDING: &str = r#"
{"kind":"attach","tabId":4}
{"kind":"cdp","tabId":4,"method":"Network.requestWillBeSentExtraInfo","params":{"requestId":"A","headers":{"cookie":"sid=1"}}}
{"kind":"cdp","tabId":4,"method":"Network.requestWillBeSent","params":{"requestId":"A","request":{"url":"https://shop.test/api/cart","method":"POST","postData":"{\"q\":1}"},"documentURL":"https://shop.test/"}}
{"kind":"cdp","tabId":4,"method":"Network.responseReceived","params":{"requestId":"A","response":{"status":200,"statusText":"OK","headers":{"content-type":"application/json"}}}}
{"kind":"responseBody","requestId":"A","body":"{\"ok\":true}","base64Encoded":false}
{"kind":"cdp","tabId":4,"method":"Network.loadingFinished","params":{"requestId":"A"}}
{"kind":"cdp","tabId":4,"method":"Network.requestWillBeSent","params":{"requestId":"B","request":{"url":"wss://shop.test/live"}}}
{"kind":"cdp","tabId":4,"method":"Network.loadingFinished","params":{"requestId":"B"}}
{"kind":"webRequest","listener":"onBeforeRequest","details":{"requestId":"9","url":"https://shop.test/","tabId":4}}
"#;

async fn replay_to_entries(replay: &Replay, config: &Config) -> anyhow::Result<Vec<CapturedEntry>> {
    let (sink, mut rx) = ChannelSink::new();
    let mut capture = Capture::select(&replay.capabilities(), Arc::new(sink), config)?
        .ok_or_else(|| anyhow::anyhow!("no backend"))?;
    replay.run(&mut capture).await?;
    capture.detach_all().await;
    drop(capture);

    let mut entries = Vec::new();
    while let Some(captured) = rx.recv().await {
        entries.push(captured);
    }
    Ok(entries)
}

#[tokio::test]
async fn test_protocol_recording_end_to_end() -> anyhow::Result<()> {
    let dir = TempDir::new()?;
    let recording = dir.path().join("session.jsonl");
    std::fs::write(&recording, MIXED_RECORDING)?;

    let replay = Replay::from_file(&recording)?;
    let config = Config::default();
    let entries = replay_to_entries(&replay, &config).await?;

    assert_eq!(entries.len(), 1);
    let captured = &entries[0];
    assert_eq!(captured.context_id, Some(4));
    assert_eq!(captured.page_url.as_deref(), Some("https://shop.test/"));

    let entry = &captured.entry;
    assert_eq!(entry.request.method, "POST");
    assert_eq!(entry.request.headers["cookie"], "sid=1");
    assert_eq!(entry.request.body.as_deref(), Some("{\"q\":1}"));
    let response = entry.success().ok_or_else(|| anyhow::anyhow!("expected success"))?;
    assert_eq!(response.body.as_deref(), Some("{\"ok\":true}"));
    assert_eq!(response.body_encoding, BodyEncoding::Text);
    assert_eq!(response.body_size, 11);

    let json = entry.to_json();
    assert_eq!(json["response"]["bodyEncoding"], "text");
    assert_eq!(json["meta"]["browsingContextId"], 4);
    Ok(())
}

#[tokio::test]
async fn test_forced_web_request_backend() -> anyhow::Result<()> {
    let replay = Replay::parse(MIXED_RECORDING.as_bytes())?;
    let config = Config {
        backend: BackendPreference::WebRequest,
        ..Config::default()
    };

    // the protocol traffic is ignored and the lone webRequest never finishes
    let entries = replay_to_entries(&replay, &config).await?;
    assert!(entries.is_empty());
    Ok(())
}

#[tokio::test]
async fn test_run_saved_and_reloaded() -> anyhow::Result<()> {
    let dir = TempDir::new()?;
    let config = Config {
        confdir: dir.path().to_string_lossy().into_owned(),
        ..Config::default()
    };
    let replay = Replay::parse(MIXED_RECORDING.as_bytes())?;

    let mut recorder = Recorder::new(&config);
    recorder.start();
    for captured in replay_to_entries(&replay, &config).await? {
        recorder.ingest_captured(captured);
    }
    let run = recorder.stop()?;

    let store = RunStore::from_config(&config);
    store.save(&run)?;
    let loaded = store.latest()?.ok_or_else(|| anyhow::anyhow!("run missing"))?;
    assert_eq!(loaded.key, run.key);
    assert_eq!(loaded.summary.total_events, 1);
    assert_eq!(loaded.summary.pages_count, 1);
    assert_eq!(loaded.summary.total_bytes, 18);
    assert_eq!(loaded.dataset["https://shop.test/"].len(), 1);
    Ok(())
}
